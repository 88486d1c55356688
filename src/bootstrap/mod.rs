//! The phased bootstrap.
//!
//! A request is brought up through eight strictly ordered phases. Each phase
//! runs at most once per kernel. The stored phase advances before a phase body
//! runs, so a phase that re-enters the bootstrap (the page cache phase asks
//! for the variables phase) never runs itself again, and a re-entrant call
//! never goes past the phase requested by the outermost caller.

mod phases;

use crate::error::KernelResult;
use crate::kernel::Kernel;
use futures_util::future::BoxFuture;
use serde::Serialize;
use tracing::{debug, info};

pub use phases::{CachedPage, is_valid_http_host};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, clap::ValueEnum,
)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Environment checks, settings and request sanitizing.
    Configuration = 0,
    /// Serve cached pages to anonymous visitors.
    PageCache = 1,
    Database = 2,
    /// Persistent variables and bootstrap modules.
    Variables = 3,
    Session = 4,
    /// `boot` hooks and default headers.
    PageHeader = 5,
    Language = 6,
    /// All modules and `init` hooks.
    Full = 7,
}

impl Phase {
    pub const ALL: [Phase; 8] = [
        Phase::Configuration,
        Phase::PageCache,
        Phase::Database,
        Phase::Variables,
        Phase::Session,
        Phase::PageHeader,
        Phase::Language,
        Phase::Full,
    ];

    pub fn index(self) -> u8 {
        self as u8
    }

    pub fn from_index(index: u8) -> Option<Self> {
        Self::ALL.get(index as usize).copied()
    }

    /// The phase after this one.
    pub fn next(self) -> Option<Self> {
        Self::from_index(self.index() + 1)
    }

    pub fn name(self) -> &'static str {
        match self {
            Phase::Configuration => "configuration",
            Phase::PageCache => "page_cache",
            Phase::Database => "database",
            Phase::Variables => "variables",
            Phase::Session => "session",
            Phase::PageHeader => "page_header",
            Phase::Language => "language",
            Phase::Full => "full",
        }
    }

    fn first_after(stored: Option<Phase>) -> Option<Phase> {
        match stored {
            None => Some(Phase::Configuration),
            Some(phase) => phase.next(),
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Phase bookkeeping of one kernel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BootstrapState {
    /// Highest phase started; `None` before the first phase.
    stored: Option<Phase>,
    /// Phase requested by the outermost call.
    final_phase: Option<Phase>,
}

impl BootstrapState {
    pub fn stored(&self) -> Option<Phase> {
        self.stored
    }

    pub fn final_phase(&self) -> Option<Phase> {
        self.final_phase
    }

    /// Whether `phase` has been started.
    pub fn has_reached(&self, phase: Phase) -> bool {
        self.stored.is_some_and(|stored| stored >= phase)
    }

    /// Claim the next phase to run for a request of `phase`, advancing the
    /// stored phase. `None` when nothing is left to do.
    fn advance(&mut self, phase: Phase) -> Option<Phase> {
        let stored = self.stored;
        let below = |p: Option<Phase>| stored.is_none_or(|s| p.is_some_and(|p| p > s));
        if !below(Some(phase)) || !below(self.final_phase) {
            return None;
        }
        let next = Phase::first_after(stored)?;
        self.stored = Some(next);
        Some(next)
    }
}

/// Outcome of a bootstrap call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BootstrapStatus {
    /// The highest phase started so far.
    Reached(Option<Phase>),
    /// A phase ended the request (cached page served, access denied, bad
    /// host, fatal error); the response is complete.
    Halted,
}

impl Kernel {
    /// Bring the request up to `phase`.
    pub fn bootstrap(&mut self, phase: Phase) -> BoxFuture<'_, KernelResult<BootstrapStatus>> {
        self.bootstrap_inner(phase, true)
    }

    /// The highest phase started so far.
    pub fn bootstrap_phase(&self) -> Option<Phase> {
        self.bootstrap.stored()
    }

    /// Run phases up to `phase`. A re-entrant call (`new_phase == false`)
    /// keeps the outer caller's final phase, and so does a call for a phase
    /// already passed.
    pub(crate) fn bootstrap_inner(
        &mut self,
        phase: Phase,
        new_phase: bool,
    ) -> BoxFuture<'_, KernelResult<BootstrapStatus>> {
        Box::pin(async move {
            if new_phase && self.bootstrap.stored.is_none_or(|stored| phase >= stored) {
                self.bootstrap.final_phase = Some(phase);
            }
            while !self.halted {
                let Some(current) = self.bootstrap.advance(phase) else {
                    break;
                };
                debug!(phase = %current, requested = %phase, new_phase, "Running bootstrap phase");
                self.run_phase(current).await?;
            }

            if self.halted {
                info!(phase = ?self.bootstrap.stored(), "Request halted during bootstrap");
                return Ok(BootstrapStatus::Halted);
            }
            Ok(BootstrapStatus::Reached(self.bootstrap.stored()))
        })
    }

    async fn run_phase(&mut self, phase: Phase) -> KernelResult<()> {
        match phase {
            Phase::Configuration => self.configuration_phase().await,
            Phase::PageCache => self.page_cache_phase().await,
            Phase::Database => self.database_phase().await,
            Phase::Variables => self.variables_phase().await,
            Phase::Session => self.session_phase().await,
            Phase::PageHeader => self.page_header_phase().await,
            Phase::Language => self.language_phase().await,
            Phase::Full => self.full_phase().await,
        }
    }
}
