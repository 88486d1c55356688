//! Modules and hooks.
//!
//! Modules are registered with the kernel at construction. During the
//! variables phase only bootstrap modules (those implementing one of
//! [`BOOTSTRAP_HOOKS`]) are loaded; the full phase loads the rest.

use crate::error::KernelResult;
use crate::kernel::Kernel;
use crate::watchdog::LogEntry;
use futures_util::future::BoxFuture;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Hook {
    /// Every page request, including cached pages.
    Boot,
    /// End of every page request, including cached pages.
    Exit,
    /// Uncached page requests, after the full bootstrap.
    Init,
    Watchdog,
    /// After the request languages are negotiated.
    LanguageInit,
}

impl Hook {
    pub fn name(self) -> &'static str {
        match self {
            Hook::Boot => "boot",
            Hook::Exit => "exit",
            Hook::Init => "init",
            Hook::Watchdog => "watchdog",
            Hook::LanguageInit => "language_init",
        }
    }
}

/// Hooks that make a module a bootstrap module.
pub const BOOTSTRAP_HOOKS: &[Hook] = &[Hook::Boot, Hook::Exit, Hook::Watchdog, Hook::LanguageInit];

pub trait Module: Send + Sync {
    fn name(&self) -> &str;

    fn implements(&self, hook: Hook) -> bool;

    /// Run a kernel hook (`boot`, `exit`, `init`, `language_init`).
    fn invoke<'a>(&'a self, hook: Hook, kernel: &'a mut Kernel) -> BoxFuture<'a, KernelResult<()>> {
        let _ = (hook, kernel);
        Box::pin(async { Ok(()) })
    }

    /// Receive a watchdog entry.
    fn watchdog(&self, entry: &LogEntry) {
        let _ = entry;
    }
}

impl std::fmt::Debug for dyn Module {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Module({})", self.name())
    }
}

#[derive(Default)]
pub struct ModuleList {
    registered: Vec<Arc<dyn Module>>,
    loaded: Vec<Arc<dyn Module>>,
    bootstrap_loaded: bool,
    all_loaded: bool,
}

impl ModuleList {
    pub fn new(registered: Vec<Arc<dyn Module>>) -> Self {
        Self {
            registered,
            ..Self::default()
        }
    }

    pub fn is_bootstrap_module(module: &dyn Module) -> bool {
        BOOTSTRAP_HOOKS.iter().any(|hook| module.implements(*hook))
    }

    /// Load the bootstrap modules. No-op once anything is loaded.
    pub fn load_bootstrap(&mut self) {
        if self.bootstrap_loaded || self.all_loaded {
            return;
        }
        self.loaded = self
            .registered
            .iter()
            .filter(|m| Self::is_bootstrap_module(m.as_ref()))
            .cloned()
            .collect();
        self.bootstrap_loaded = true;
    }

    pub fn load_all(&mut self) {
        self.loaded = self.registered.clone();
        self.bootstrap_loaded = true;
        self.all_loaded = true;
    }

    pub fn is_loaded(&self, name: &str) -> bool {
        self.loaded.iter().any(|m| m.name() == name)
    }

    pub fn loaded_names(&self) -> Vec<String> {
        self.loaded.iter().map(|m| m.name().to_string()).collect()
    }

    /// Loaded modules implementing a hook, in registration order.
    pub fn implementing(&self, hook: Hook) -> Vec<Arc<dyn Module>> {
        self.loaded
            .iter()
            .filter(|m| m.implements(hook))
            .cloned()
            .collect()
    }
}
