//! The per-request kernel.
//!
//! A [`Kernel`] owns everything one request touches: the database registry,
//! the static store, caches, locks, modules and the response being built.
//! Nothing is process-global, so tests run any number of kernels side by side.

use crate::bootstrap::{BootstrapState, BootstrapStatus, Phase};
use crate::cache::{Cache, CacheBins};
use crate::config::{DatabaseArg, Settings};
use crate::db::Database;
use crate::db::info::DEFAULT_TARGET;
use crate::error::{KernelError, KernelResult};
use crate::error_handler::{ErrorState, HtmlRenderer, MaintenanceMode, Message, PageRenderer};
use crate::language::{Language, LanguageType, Languages};
use crate::lock::LockService;
use crate::module::{Hook, Module, ModuleList};
use crate::request::{Request, Response};
use crate::session::{CookieParams, Session};
use crate::statics::StaticStore;
use crate::timer::Timers;
use crate::variable::Variables;
use crate::watchdog::{LogEntry, Severity, trace_entry};
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, warn};

/// How a kernel is set up before the first phase runs.
#[derive(Clone)]
pub struct KernelOptions {
    /// Site root containing `sites/`.
    pub root: PathBuf,
    /// Explicit settings file; skips site directory discovery.
    pub settings_path: Option<PathBuf>,
    /// In-memory settings; win over `settings_path`.
    pub settings: Option<Settings>,
    /// Connections added on top of the settings file.
    pub databases: Vec<DatabaseArg>,
    pub modules: Vec<Arc<dyn Module>>,
    pub renderer: Arc<dyn PageRenderer>,
    /// Seed for session ids and replica selection.
    pub rng_seed: Option<u64>,
    /// Fixed request time, Unix seconds.
    pub request_time: Option<i64>,
    /// Database updates are running.
    pub updating: bool,
}

impl Default for KernelOptions {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            settings_path: None,
            settings: None,
            databases: Vec::new(),
            modules: Vec::new(),
            renderer: Arc::new(HtmlRenderer),
            rng_seed: None,
            request_time: None,
            updating: false,
        }
    }
}

impl KernelOptions {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }

    pub fn with_settings(mut self, settings: Settings) -> Self {
        self.settings = Some(settings);
        self
    }

    pub fn with_settings_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.settings_path = Some(path.into());
        self
    }

    pub fn with_database(mut self, arg: DatabaseArg) -> Self {
        self.databases.push(arg);
        self
    }

    pub fn with_module(mut self, module: Arc<dyn Module>) -> Self {
        self.modules.push(module);
        self
    }

    pub fn with_renderer(mut self, renderer: Arc<dyn PageRenderer>) -> Self {
        self.renderer = renderer;
        self
    }

    pub fn with_rng_seed(mut self, seed: u64) -> Self {
        self.rng_seed = Some(seed);
        self
    }

    pub fn with_request_time(mut self, request_time: i64) -> Self {
        self.request_time = Some(request_time);
        self
    }

    pub fn updating(mut self, updating: bool) -> Self {
        self.updating = updating;
        self
    }
}

impl std::fmt::Debug for KernelOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelOptions")
            .field("root", &self.root)
            .field("settings_path", &self.settings_path)
            .field("databases", &self.databases.len())
            .field("modules", &self.modules.len())
            .field("updating", &self.updating)
            .finish()
    }
}

/// Site paths and URLs derived during the configuration phase.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SiteInfo {
    /// Site directory, e.g. `sites/default`.
    pub dir: PathBuf,
    pub settings_path: Option<PathBuf>,
    /// Scheme and host, e.g. `http://example.com`.
    pub base_root: String,
    /// `base_root` plus the base path, no trailing slash.
    pub base_url: String,
    /// Path prefix with trailing slash, e.g. `/` or `/sub/`.
    pub base_path: String,
    pub cookie_domain: String,
    pub session_name: String,
}

pub struct Kernel {
    pub(crate) options: KernelOptions,
    pub(crate) request: Request,
    pub(crate) response: Response,
    pub(crate) settings: Settings,
    pub(crate) site: SiteInfo,
    pub(crate) database: Database,
    pub(crate) statics: StaticStore,
    pub(crate) bootstrap: BootstrapState,
    pub(crate) variables: Variables,
    pub(crate) caches: CacheBins,
    pub(crate) locks: LockService,
    pub(crate) modules: ModuleList,
    pub(crate) timers: Timers,
    pub(crate) session: Option<Session>,
    pub(crate) languages: Languages,
    pub(crate) errors: ErrorState,
    pub(crate) messages: Vec<Message>,
    pub(crate) renderer: Arc<dyn PageRenderer>,
    pub(crate) rng: StdRng,
    pub(crate) test_prefix: Option<String>,
    /// Internal path being served.
    pub(crate) current_path: String,
    pub(crate) request_time: i64,
    /// The response is complete; no further phase runs.
    pub(crate) halted: bool,
}

impl std::fmt::Debug for Kernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kernel")
            .field("uri", &self.request.uri)
            .field("phase", &self.bootstrap.stored())
            .field("current_path", &self.current_path)
            .field("halted", &self.halted)
            .finish_non_exhaustive()
    }
}

impl Kernel {
    pub fn new(mut options: KernelOptions, request: Request) -> Self {
        let (rng, db_rng) = match options.rng_seed {
            Some(seed) => (
                StdRng::seed_from_u64(seed),
                StdRng::seed_from_u64(seed.wrapping_add(1)),
            ),
            None => (StdRng::from_entropy(), StdRng::from_entropy()),
        };
        let request_time = options
            .request_time
            .unwrap_or_else(|| chrono::Utc::now().timestamp());
        let errors = ErrorState {
            maintenance: options.updating.then_some(MaintenanceMode::Update),
            ..ErrorState::default()
        };
        let modules = ModuleList::new(std::mem::take(&mut options.modules));
        let renderer = options.renderer.clone();

        Self {
            options,
            request,
            response: Response::new(),
            settings: Settings::default(),
            site: SiteInfo::default(),
            database: Database::with_rng(Default::default(), db_rng),
            statics: StaticStore::new(),
            bootstrap: BootstrapState::default(),
            variables: Variables::default(),
            caches: CacheBins::new(),
            locks: LockService::new(),
            modules,
            timers: Timers::new(),
            session: None,
            languages: Languages::default(),
            errors,
            messages: Vec::new(),
            renderer,
            rng,
            test_prefix: None,
            current_path: String::new(),
            request_time,
            halted: false,
        }
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn response(&self) -> &Response {
        &self.response
    }

    pub fn response_mut(&mut self) -> &mut Response {
        &mut self.response
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn site(&self) -> &SiteInfo {
        &self.site
    }

    pub fn database_mut(&mut self) -> &mut Database {
        &mut self.database
    }

    pub fn statics_mut(&mut self) -> &mut StaticStore {
        &mut self.statics
    }

    pub fn variables(&self) -> &Variables {
        &self.variables
    }

    pub fn timers(&self) -> &Timers {
        &self.timers
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn session_mut(&mut self) -> Option<&mut Session> {
        self.session.as_mut()
    }

    /// Negotiated language of a type.
    pub fn language(&self, language_type: LanguageType) -> &Language {
        self.languages.get(language_type)
    }

    /// Prefix of the test run this request belongs to.
    pub fn test_prefix(&self) -> Option<&str> {
        self.test_prefix.as_deref()
    }

    pub fn current_path(&self) -> &str {
        &self.current_path
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    pub fn request_time(&self) -> i64 {
        self.request_time
    }

    pub fn is_module_loaded(&self, name: &str) -> bool {
        self.modules.is_loaded(name)
    }

    /// Persist a variable and refresh the variable cache.
    pub async fn variable_set(&mut self, name: &str, value: Value) -> KernelResult<()> {
        let conn = self.database.get_connection(DEFAULT_TARGET, None).await?;
        let cache = self.cache("cache_bootstrap").await?;
        self.variables.set(&conn, &cache, name, value).await
    }

    pub async fn variable_del(&mut self, name: &str) -> KernelResult<()> {
        let conn = self.database.get_connection(DEFAULT_TARGET, None).await?;
        let cache = self.cache("cache_bootstrap").await?;
        self.variables.del(&conn, &cache, name).await
    }

    pub fn variable_get(&self, name: &str) -> Option<&Value> {
        self.variables.get(name)
    }

    /// The cache for a bin.
    pub async fn cache(&mut self, bin: &str) -> KernelResult<Cache> {
        self.caches
            .get(bin, &self.variables, &mut self.database, self.request_time)
            .await
    }

    /// Clear cache entries.
    ///
    /// Without a bin, expired and temporary entries are dropped from
    /// `cache_block` and `cache_page`.
    pub async fn cache_clear_all(
        &mut self,
        cid: Option<&str>,
        bin: Option<&str>,
        wildcard: bool,
    ) -> KernelResult<()> {
        match bin {
            None if cid.is_some() => Err(KernelError::invalid_input(
                "A cache bin is required when clearing a specific cache id",
            )),
            None => {
                for bin in ["cache_block", "cache_page"] {
                    self.cache(bin).await?.clear(None, false).await?;
                }
                Ok(())
            }
            Some(bin) => self.cache(bin).await?.clear(cid, wildcard).await,
        }
    }

    /// Whether the current page may be served from or stored in the page
    /// cache. `Some(false)` marks the page uncacheable for the rest of the
    /// request.
    pub fn page_is_cacheable(&mut self, allow_caching: Option<bool>) -> bool {
        let allowed = self.statics.get("drupal_page_is_cacheable", true);
        if let Some(allow) = allow_caching {
            *allowed = allow;
        }
        *allowed && self.request.is_get_or_head() && !self.request.cli
    }

    pub async fn lock_acquire(&mut self, name: &str, timeout: f64) -> KernelResult<bool> {
        let conn = self.database.get_connection(DEFAULT_TARGET, None).await?;
        self.locks.acquire(&conn, name, timeout).await
    }

    /// Wait for a lock held elsewhere. `true` when the wait timed out.
    pub async fn lock_wait(&mut self, name: &str, delay: f64) -> KernelResult<bool> {
        let conn = self.database.get_connection(DEFAULT_TARGET, None).await?;
        self.locks.wait(&conn, name, delay).await
    }

    pub async fn lock_release(&mut self, name: &str) -> KernelResult<()> {
        let conn = self.database.get_connection(DEFAULT_TARGET, None).await?;
        self.locks.release(&conn, name).await
    }

    pub async fn lock_release_all(&mut self) -> KernelResult<()> {
        let conn = self.database.get_connection(DEFAULT_TARGET, None).await?;
        self.locks.release_all(&conn).await
    }

    /// Run a hook on every loaded module implementing it, stopping at the
    /// first error.
    pub async fn invoke_hook(&mut self, hook: Hook) -> KernelResult<()> {
        for module in self.modules.implementing(hook) {
            debug!(module = module.name(), hook = hook.name(), "Invoking hook");
            module.invoke(hook, self).await?;
        }
        Ok(())
    }

    /// Record a system event.
    pub fn watchdog(
        &mut self,
        kind: &str,
        message: &str,
        variables: BTreeMap<String, String>,
        severity: Severity,
        link: Option<&str>,
    ) {
        let entry = LogEntry {
            kind: kind.to_string(),
            message: message.to_string(),
            variables,
            severity,
            link: link.map(str::to_string),
            uid: self.session.as_ref().map(Session::uid).unwrap_or_default(),
            request_uri: format!("{}{}", self.site.base_root, self.request.uri),
            referer: self.request.header("referer").unwrap_or_default().to_string(),
            ip: self.request.remote_addr.clone(),
            timestamp: self.request_time,
        };
        trace_entry(&entry);

        // Modules get the entry only once they are loaded.
        for module in self.modules.implementing(Hook::Watchdog) {
            module.watchdog(&entry);
        }
    }

    /// Bootstrap to `phase`, turning an error into an error page.
    pub async fn run(&mut self, phase: Phase) -> BootstrapStatus {
        match self.bootstrap(phase).await {
            Ok(status) => status,
            Err(err) => {
                warn!(error = %err, kind = err.kind(), phase = ?self.bootstrap_phase(), "Bootstrap failed");
                self.handle_exception(&err);
                self.halted = true;
                BootstrapStatus::Halted
            }
        }
    }

    /// End the request: `exit` hooks, session write, lock release, and close
    /// every connection. Connections are closed even when an earlier step
    /// fails; the first error is returned.
    pub async fn shutdown(&mut self) -> KernelResult<()> {
        let result = self.finish_request().await;
        if let Err(err) = &result {
            warn!(error = %err, "Request shutdown failed");
        }

        if let Some(timer) = self.timers.stop("page") {
            debug!(elapsed_ms = timer.time_ms, "Request finished");
        }
        self.database.close_all().await;
        result
    }

    async fn finish_request(&mut self) -> KernelResult<()> {
        if !self.halted && self.bootstrap.has_reached(Phase::Full) {
            self.invoke_hook(Hook::Exit).await?;
        }

        if self.bootstrap.has_reached(Phase::Variables) {
            let conn = self.database.get_connection(DEFAULT_TARGET, None).await?;
            let committed = match self.session.as_mut() {
                Some(session) => {
                    let cookie = CookieParams {
                        path: &self.site.base_path,
                        domain: &self.site.cookie_domain,
                        secure: self.request.https,
                    };
                    session
                        .commit(&conn, &mut self.rng, self.request_time, &cookie, &mut self.response)
                        .await
                }
                None => Ok(()),
            };
            let released = self.locks.release_all(&conn).await;
            committed?;
            released?;
        }
        Ok(())
    }
}
