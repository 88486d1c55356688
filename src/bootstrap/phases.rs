//! Phase bodies.

use crate::cache::Expire;
use crate::config::{SETTINGS_FILE, Settings, find_site_directory, load_site_aliases};
use crate::db::info::DEFAULT_TARGET;
use crate::error::{KernelError, KernelResult};
use crate::error_handler::{MaintenanceMode, escape_html};
use crate::kernel::{Kernel, SiteInfo};
use crate::language::Languages;
use crate::lock::LockService;
use crate::module::Hook;
use crate::request::{
    DEFAULT_ALLOWED_PROTOCOLS, parse_query, strip_dangerous_keys, strip_nul_bytes, url_is_external,
};
use crate::session::{Session, SessionBackend, derive_cookie_domain, session_name};
use crate::test_prefix::{signing_key, valid_test_ua};
use crate::variable::Variables;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{LazyLock, Once};
use tracing::{debug, error, info, warn};
use url::Url;

use super::Phase;

static VALID_HOST: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\[?(?:[a-zA-Z0-9\-:\]_]+\.?)+$").expect("valid regex")
});

static PANIC_HOOK: Once = Once::new();

/// Expires header value meaning "already expired".
pub(crate) const EXPIRED: &str = "Sun, 19 Nov 1978 05:00:00 GMT";

const HTTP_DATE: &str = "%a, %d %b %Y %H:%M:%S GMT";

/// Cached pages never replay these headers.
const UNCACHED_HEADERS: &[&str] = &["set-cookie", "x-drupal-cache", "etag"];

/// Whether a Host header is safe to use.
pub fn is_valid_http_host(host: &str) -> bool {
    host.len() <= 1000
        && host.matches('.').count() <= 100
        && host.matches(':').count() <= 100
        && VALID_HOST.is_match(host)
}

/// A rendered page stored in `cache_page`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedPage {
    /// Internal path the page was rendered for.
    pub path: String,
    pub body: String,
    pub title: String,
    pub headers: Vec<(String, String)>,
}

fn install_panic_hook() {
    PANIC_HOOK.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |panic| {
            let location = panic
                .location()
                .map(|l| format!("{}:{}", l.file(), l.line()))
                .unwrap_or_default();
            error!(location = %location, "Uncaught panic: {}", panic);
            previous(panic);
        }));
    });
}

fn http_date(timestamp: i64) -> String {
    DateTime::<Utc>::from_timestamp(timestamp, 0)
        .map(|t| t.format(HTTP_DATE).to_string())
        .unwrap_or_else(|| EXPIRED.to_string())
}

fn parse_http_date(value: &str) -> Option<i64> {
    DateTime::parse_from_rfc2822(value.trim())
        .ok()
        .map(|t| t.timestamp())
}

impl Kernel {
    pub(crate) async fn configuration_phase(&mut self) -> KernelResult<()> {
        install_panic_hook();
        if !self.initialize_environment() {
            return Ok(());
        }
        self.timers.start("page");
        self.initialize_settings()?;
        self.sanitize_request();
        Ok(())
    }

    /// Normalize the server environment. Returns `false` when the request was
    /// rejected.
    fn initialize_environment(&mut self) -> bool {
        let request = &mut self.request;
        request.headers.entry("referer".to_string()).or_default();
        if request.protocol != "HTTP/1.0" && request.protocol != "HTTP/1.1" {
            request.protocol = "HTTP/1.0".to_string();
        }

        match request.headers.get_mut("host") {
            Some(host) => {
                *host = host.to_lowercase();
                if !is_valid_http_host(host) {
                    warn!(host = %host, "Rejecting request with invalid Host header");
                    self.response.set_status(400, "Bad Request");
                    self.halted = true;
                    return false;
                }
            }
            None => {
                request.headers.insert("host".to_string(), String::new());
            }
        }
        self.current_path = self.request.path();
        true
    }

    /// Locate and load settings, then derive the site URLs and cookie names.
    fn initialize_settings(&mut self) -> KernelResult<()> {
        let root = self.options.root.clone();
        let (dir, settings_path, mut settings) = match (
            self.options.settings.take(),
            self.options.settings_path.clone(),
        ) {
            (Some(settings), path) => {
                let dir = path
                    .as_deref()
                    .and_then(Path::parent)
                    .map(Path::to_path_buf)
                    .unwrap_or_else(|| root.join("sites").join("default"));
                (dir, path, settings)
            }
            (None, Some(path)) => {
                let settings = Settings::load(&path)?;
                let dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
                (dir, Some(path), settings)
            }
            (None, None) => {
                let aliases = load_site_aliases(&root)?;
                let dir = find_site_directory(
                    &root,
                    self.request.host(),
                    &self.request.script_name,
                    &aliases,
                );
                let path = dir.join(SETTINGS_FILE);
                if path.exists() {
                    (dir, Some(path.clone()), Settings::load(&path)?)
                } else {
                    (dir, None, Settings::default())
                }
            }
        };
        for arg in std::mem::take(&mut self.options.databases) {
            settings.add_database(arg);
        }

        let mut site = SiteInfo {
            dir,
            settings_path,
            ..SiteInfo::default()
        };
        match settings.base_url.as_deref().map(|u| u.trim_end_matches('/')) {
            Some(base_url) => {
                let parsed = Url::parse(base_url)
                    .map_err(|e| KernelError::settings(format!("Invalid base_url '{base_url}': {e}")))?;
                let path = parsed.path().trim_end_matches('/');
                site.base_path = format!("{path}/");
                site.base_root = base_url
                    .strip_suffix(path)
                    .unwrap_or(base_url)
                    .to_string();
                site.base_url = base_url.to_string();
            }
            None => {
                let scheme = if self.request.https { "https" } else { "http" };
                site.base_root = format!("{scheme}://{}", self.request.host());
                let dir = Path::new(&self.request.script_name)
                    .parent()
                    .map(|p| p.to_string_lossy().trim_end_matches(['/', '\\']).to_string())
                    .unwrap_or_default();
                site.base_url = format!("{}{dir}", site.base_root);
                site.base_path = format!("{dir}/");
            }
        }

        let session_key = match settings.cookie_domain.as_deref().filter(|d| !d.is_empty()) {
            Some(domain) => {
                site.cookie_domain = domain.to_string();
                domain.to_string()
            }
            None => {
                if !self.request.host().is_empty() {
                    site.cookie_domain = derive_cookie_domain(self.request.host());
                }
                site.base_url
                    .split_once("://")
                    .map(|(_, rest)| rest.to_string())
                    .unwrap_or_else(|| site.base_url.clone())
            }
        };
        site.session_name = session_name(&session_key, self.request.https);

        info!(
            site_dir = %site.dir.display(),
            base_url = %site.base_url,
            databases = settings.databases.len(),
            "Settings loaded"
        );
        self.database.set_connection_source(settings.databases.clone());
        self.variables = Variables::new(settings.conf.clone());
        self.settings = settings;
        self.site = site;
        Ok(())
    }

    fn sanitize_request(&mut self) {
        let whitelist: Vec<String> = self.variables.get_or("sanitize_input_whitelist", Vec::new());
        let mut removed = Vec::new();
        strip_dangerous_keys(&mut self.request.query, &whitelist, &mut removed);
        strip_dangerous_keys(&mut self.request.post, &whitelist, &mut removed);
        self.request.cookies.retain(|key, _| {
            let dangerous = key.starts_with('#') && !whitelist.contains(key);
            if dangerous {
                removed.push(key.clone());
            }
            !dangerous
        });

        if !removed.is_empty() && self.variables.get_bool("sanitize_input_logging", false) {
            warn!(keys = ?removed, "Potentially unsafe keys removed from request parameters");
        }
    }

    pub(crate) async fn page_cache_phase(&mut self) -> KernelResult<()> {
        let cache_enabled = if self.variables.get_bool("page_cache_without_database", false) {
            true
        } else {
            self.bootstrap_inner(Phase::Variables, false).await?;
            self.variables.get_bool("cache", false)
        };

        let ip = self.request.remote_addr.clone();
        if self.is_ip_denied(&ip).await? {
            info!(ip = %ip, "Blocked IP address denied");
            self.response.set_status(403, "Forbidden");
            self.response.body = format!("Sorry, {} has been banned.", escape_html(&ip));
            self.halted = true;
            return Ok(());
        }

        if self.request.cookie(&self.site.session_name).is_some() || !cache_enabled {
            return Ok(());
        }

        match self.page_get_cache().await? {
            Some(page) => {
                self.response.set_header("X-Drupal-Cache", "HIT");
                self.current_path = page.page.path.clone();
                debug!(path = %page.page.path, "Serving page from cache");

                let invoke_hooks = self.variables.get_bool("page_cache_invoke_hooks", true);
                if invoke_hooks {
                    self.modules.load_bootstrap();
                    self.invoke_hook(Hook::Boot).await?;
                }
                self.serve_page_from_cache(page.page, page.created);
                if invoke_hooks {
                    self.invoke_hook(Hook::Exit).await?;
                }
                self.halted = true;
            }
            None => self.response.set_header("X-Drupal-Cache", "MISS"),
        }
        Ok(())
    }

    /// Whether an IP is blocked, from the `blocked_ips` variable or table.
    async fn is_ip_denied(&mut self, ip: &str) -> KernelResult<bool> {
        if let Some(serde_json::Value::Array(blocked)) = self.variables.get("blocked_ips") {
            return Ok(blocked.iter().any(|b| b.as_str() == Some(ip)));
        }
        if !self.bootstrap.has_reached(Phase::Database) || !self.database.has_connection_source() {
            return Ok(false);
        }
        let conn = self.database.get_connection(DEFAULT_TARGET, None).await?;
        let found = conn
            .query_value("SELECT 1 FROM {blocked_ips} WHERE ip = ?", &[ip.into()])
            .await?;
        Ok(found.is_some())
    }

    /// Cached copy of the current page, if the request may use one.
    async fn page_get_cache(&mut self) -> KernelResult<Option<CachedEntry>> {
        if !self.page_is_cacheable(None) {
            return Ok(None);
        }
        let cid = self.page_cache_id();
        let cache = self.cache("cache_page").await?;
        let Some(item) = cache.get(&cid).await? else {
            return Ok(None);
        };
        match serde_json::from_value::<CachedPage>(item.data) {
            Ok(page) => Ok(Some(CachedEntry {
                page,
                created: item.created,
            })),
            Err(e) => {
                warn!(cid = %cid, error = %e, "Ignoring unreadable cached page");
                Ok(None)
            }
        }
    }

    pub(crate) fn page_cache_id(&self) -> String {
        format!("{}{}", self.site.base_root, self.request.uri)
    }

    /// Write a cached page to the response, honoring conditional requests.
    fn serve_page_from_cache(&mut self, mut page: CachedPage, created: i64) {
        // Headers set by boot hooks win over cached ones.
        let boot_headers: Vec<String> = self
            .response
            .headers()
            .iter()
            .map(|(name, _)| name.to_ascii_lowercase())
            .collect();
        let mut defaults: Vec<(String, String)> = Vec::new();

        page.headers.retain(|(name, value)| {
            let lower = name.to_ascii_lowercase();
            let early = ["content-location", "expires", "cache-control", "vary"].contains(&lower.as_str());
            if early && !boot_headers.contains(&lower) {
                self.response.set_header(name, value.clone());
                return false;
            }
            true
        });

        let has_cookie = self.request.cookie(&self.site.session_name).is_some();
        let boot_vary = boot_headers.iter().any(|h| h == "vary");
        let max_age = if !has_cookie || boot_vary {
            self.variables.get_i64("page_cache_maximum_age", 0)
        } else {
            0
        };
        defaults.push(("Cache-Control".to_string(), format!("public, max-age={max_age}")));

        let etag = format!("\"{created}-0\"");
        self.response.set_header("ETag", etag.clone());

        let if_modified_since = self
            .request
            .header("if-modified-since")
            .and_then(parse_http_date);
        let if_none_match = self.request.header("if-none-match").map(|v| v.replace('\\', ""));
        if let (Some(since), Some(none_match)) = (if_modified_since, if_none_match) {
            if none_match == etag && since == created {
                self.response.set_status(304, "Not Modified");
                for (name, value) in defaults {
                    self.response.set_default_header(&name, value);
                }
                return;
            }
        }

        for (name, value) in page.headers {
            self.response.set_header(&name, value);
        }
        defaults.push(("Last-Modified".to_string(), http_date(created)));
        defaults.push(("Expires".to_string(), EXPIRED.to_string()));
        if !boot_vary && !self.variables.get_bool("omit_vary_cookie", false) {
            self.response.set_header("Vary", "Cookie");
        }
        for (name, value) in defaults {
            self.response.set_default_header(&name, value);
        }
        self.response.body = page.body;
    }

    /// Store the rendered page in `cache_page` for anonymous visitors.
    pub async fn page_set_cache(&mut self, body: &str, title: &str) -> KernelResult<bool> {
        if !self.page_is_cacheable(None) || body.is_empty() {
            return Ok(false);
        }

        let mut expire = Expire::Temporary;
        let mut headers = Vec::new();
        for (name, value) in self.response.explicit_headers() {
            let lower = name.to_ascii_lowercase();
            if UNCACHED_HEADERS.contains(&lower.as_str()) {
                continue;
            }
            if lower == "expires" {
                if let Some(ts) = parse_http_date(value) {
                    expire = Expire::At(ts);
                }
            }
            headers.push((name.clone(), value.clone()));
        }

        let page = CachedPage {
            path: self.current_path.clone(),
            body: body.to_string(),
            title: title.to_string(),
            headers,
        };
        let cid = self.page_cache_id();
        let cache = self.cache("cache_page").await?;
        cache.set(&cid, serde_json::to_value(&page)?, expire).await?;
        debug!(cid = %cid, "Page cached");
        Ok(true)
    }

    pub(crate) async fn database_phase(&mut self) -> KernelResult<()> {
        if !self.database.has_connection_source() {
            let path = self
                .site
                .settings_path
                .clone()
                .unwrap_or_else(|| self.site.dir.join(SETTINGS_FILE));
            return Err(KernelError::not_installed(path.display().to_string()));
        }

        if let Some(user_agent) = self.request.header("user-agent") {
            let key = signing_key(&self.settings.hash_salt(), self.site.settings_path.as_deref());
            if let Some(prefix) = valid_test_ua(user_agent, &key, self.request_time) {
                info!(test_prefix = %prefix, "Running as test child site");
                self.database.apply_test_prefix("default", &prefix);
                self.test_prefix = Some(prefix);
            }
        }
        Ok(())
    }

    pub(crate) async fn variables_phase(&mut self) -> KernelResult<()> {
        self.locks = LockService::new();
        let conn = self.database.get_connection(DEFAULT_TARGET, None).await?;
        let cache = self.cache("cache_bootstrap").await?;
        self.variables =
            Variables::initialize(&self.settings.conf, &cache, &conn, &mut self.locks).await?;

        self.modules.load_bootstrap();
        self.sanitize_destination();
        Ok(())
    }

    /// Drop a `destination` query parameter pointing off-site or carrying
    /// unsafe query keys.
    fn sanitize_destination(&mut self) {
        let Some(destination) = self.request.query.get("destination") else {
            return;
        };
        let allowed: Vec<String> = self.variables.get_or(
            "filter_allowed_protocols",
            DEFAULT_ALLOWED_PROTOCOLS.iter().map(|p| p.to_string()).collect(),
        );

        let unsafe_destination = match destination.as_str() {
            None => true,
            Some(dest) if url_is_external(dest, &allowed) => true,
            Some(dest) => {
                let whitelist: Vec<String> =
                    self.variables.get_or("sanitize_input_whitelist", Vec::new());
                let mut query = parse_query(dest);
                let mut removed = Vec::new();
                strip_dangerous_keys(&mut query, &whitelist, &mut removed);
                !removed.is_empty()
            }
        };
        if unsafe_destination {
            warn!(destination = %destination, "Removing unsafe destination parameter");
            self.request.query.remove("destination");
        }
    }

    pub(crate) async fn session_phase(&mut self) -> KernelResult<()> {
        let backend =
            SessionBackend::from_name(self.variables.get_str("session_inc").unwrap_or("database"))?;
        let conn = match backend {
            SessionBackend::Database => {
                Some(self.database.get_connection(DEFAULT_TARGET, None).await?)
            }
            SessionBackend::Null => None,
        };

        let mut session =
            Session::initialize(backend, &self.site.session_name, &self.request, conn.as_deref())
                .await?;
        if self.request.cookie(&self.site.session_name).is_some() {
            if !session.is_empty() {
                self.page_is_cacheable(Some(false));
            }
        } else {
            session.ensure_id(&mut self.rng);
        }
        self.session = Some(session);
        Ok(())
    }

    pub(crate) async fn page_header_phase(&mut self) -> KernelResult<()> {
        self.invoke_hook(Hook::Boot).await?;
        if !self.request.cli {
            self.page_header();
        }
        Ok(())
    }

    /// Default response headers. Sent once per request.
    pub fn page_header(&mut self) {
        let sent = self.statics.get("drupal_page_header", false);
        if *sent {
            return;
        }
        *sent = true;

        let frame_options = self
            .variables
            .get_str("x_frame_options")
            .unwrap_or("SAMEORIGIN")
            .to_string();
        let response = &mut self.response;
        response.set_default_header("Expires", EXPIRED);
        response.set_default_header("Cache-Control", "no-cache, must-revalidate");
        response.set_default_header("X-Content-Type-Options", "nosniff");
        if !frame_options.is_empty() {
            response.set_default_header("X-Frame-Options", frame_options);
        }
    }

    pub(crate) async fn language_phase(&mut self) -> KernelResult<()> {
        let accept_language = self.request.header("accept-language").map(str::to_string);
        self.languages =
            Languages::initialize(&self.variables, &mut self.current_path, accept_language.as_deref());
        if self.languages.is_multilingual() {
            self.invoke_hook(Hook::LanguageInit).await?;
        }
        Ok(())
    }

    pub(crate) async fn full_phase(&mut self) -> KernelResult<()> {
        self.modules.load_all();
        strip_nul_bytes(&mut self.request.query);
        strip_nul_bytes(&mut self.request.post);

        if self.current_path.is_empty() {
            self.current_path = self
                .variables
                .get_str("site_frontpage")
                .unwrap_or("node")
                .to_string();
        }

        if self.errors.maintenance != Some(MaintenanceMode::Update) {
            self.invoke_hook(Hook::Init).await?;
        }
        info!(path = %self.current_path, modules = self.modules.loaded_names().len(), "Full bootstrap complete");
        Ok(())
    }
}

/// A cached page with its write time.
#[derive(Debug)]
struct CachedEntry {
    page: CachedPage,
    created: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_http_host() {
        assert!(is_valid_http_host("example.com"));
        assert!(is_valid_http_host("example.com:8080"));
        assert!(is_valid_http_host("[::1]:80"));
        assert!(is_valid_http_host("sub_domain.example.com."));
        assert!(!is_valid_http_host("example.com/evil"));
        assert!(!is_valid_http_host("exa mple.com"));
        assert!(!is_valid_http_host(""));
        assert!(!is_valid_http_host(&"a.".repeat(101)));
    }

    #[test]
    fn test_http_dates() {
        assert_eq!(http_date(280299600), EXPIRED);
        assert_eq!(parse_http_date(EXPIRED), Some(280299600));
        assert_eq!(parse_http_date("yesterday"), None);
    }
}
