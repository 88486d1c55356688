//! Request sessions.
//!
//! The backend is chosen by the `session_inc` variable. Anonymous visitors
//! without a cookie get no session row until something is stored in their
//! session; the id is generated lazily at that point.

use crate::config::hex_digest;
use crate::db::connection::Connection;
use crate::error::{KernelError, KernelResult};
use crate::request::{Request, Response};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngCore;
use serde_json::{Map, Value};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionBackend {
    /// Rows in the `sessions` table.
    Database,
    /// Sessions are never read or written.
    Null,
}

impl SessionBackend {
    pub fn from_name(name: &str) -> KernelResult<Self> {
        match name {
            "" | "database" | "includes/session.inc" => Ok(Self::Database),
            "null" | "none" => Ok(Self::Null),
            other => Err(KernelError::settings(format!(
                "Unknown session backend '{other}'"
            ))),
        }
    }
}

/// Cookie name for a site: `SESS` (or `SSESS` over HTTPS) followed by 32 hex
/// characters derived from `session_key`.
pub fn session_name(session_key: &str, https: bool) -> String {
    let digest = hex_digest(session_key.as_bytes());
    let prefix = if https { "SSESS" } else { "SESS" };
    format!("{prefix}{}", &digest[..32])
}

/// Cookie domain derived from a Host header: leading dots and `www.` removed,
/// port dropped, prefixed with a dot.
pub fn derive_cookie_domain(host: &str) -> String {
    let domain = host.trim_start_matches('.');
    let domain = domain.strip_prefix("www.").unwrap_or(domain);
    let domain = domain.split(':').next().unwrap_or_default();
    format!(".{domain}")
}

/// The `domain` cookie attribute for a cookie domain, if it may be sent.
///
/// Cookie domains need a dot besides the leading one, and IP addresses are
/// never used as cookie domains.
pub fn cookie_domain_attribute(cookie_domain: &str) -> Option<&str> {
    let dots = cookie_domain.matches('.').count();
    let numeric = cookie_domain.chars().all(|c| c == '.' || c.is_ascii_digit());
    (dots >= 2 && !numeric).then_some(cookie_domain)
}

/// A fresh session id: 32 random bytes, URL-safe base64.
pub fn generate_sid<R: RngCore + ?Sized>(rng: &mut R) -> String {
    let mut bytes = [0u8; 32];
    rng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

#[derive(Debug, Clone)]
pub struct Session {
    backend: SessionBackend,
    name: String,
    sid: Option<String>,
    /// Whether the request carried the session cookie.
    from_cookie: bool,
    uid: i64,
    data: Map<String, Value>,
    hostname: String,
}

impl Session {
    /// An empty anonymous session.
    pub fn anonymous(backend: SessionBackend, name: impl Into<String>) -> Self {
        Self {
            backend,
            name: name.into(),
            sid: None,
            from_cookie: false,
            uid: 0,
            data: Map::new(),
            hostname: String::new(),
        }
    }

    /// Read the session named by the request cookie, if any.
    pub async fn initialize(
        backend: SessionBackend,
        name: &str,
        request: &Request,
        conn: Option<&Connection>,
    ) -> KernelResult<Self> {
        let mut session = Self::anonymous(backend, name);
        session.hostname = request.remote_addr.clone();

        let Some(sid) = request.cookie(name).filter(|sid| !sid.is_empty()) else {
            return Ok(session);
        };
        session.sid = Some(sid.to_string());
        session.from_cookie = true;

        if let (SessionBackend::Database, Some(conn)) = (backend, conn) {
            let row = conn
                .query_row(
                    "SELECT uid, session FROM {sessions} WHERE sid = ?",
                    &[sid.into()],
                )
                .await?;
            if let Some(row) = row {
                session.uid = row.get("uid").and_then(Value::as_i64).unwrap_or_default();
                if let Some(Value::String(raw)) = row.get("session") {
                    if let Ok(Value::Object(data)) = serde_json::from_str(raw) {
                        session.data = data;
                    }
                }
            }
        }
        debug!(uid = session.uid, "Session read");
        Ok(session)
    }

    pub fn backend(&self) -> SessionBackend {
        self.backend
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> Option<&str> {
        self.sid.as_deref()
    }

    pub fn uid(&self) -> i64 {
        self.uid
    }

    pub fn set_uid(&mut self, uid: i64) {
        self.uid = uid;
    }

    pub fn is_anonymous(&self) -> bool {
        self.uid == 0
    }

    /// True for an anonymous session with nothing stored.
    pub fn is_empty(&self) -> bool {
        self.is_anonymous() && self.data.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    pub fn insert(&mut self, key: &str, value: Value) {
        self.data.insert(key.to_string(), value);
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.data.remove(key)
    }

    /// Make sure the session has an id, generating one for a new session.
    pub fn ensure_id<R: RngCore + ?Sized>(&mut self, rng: &mut R) -> &str {
        self.sid.get_or_insert_with(|| generate_sid(rng))
    }

    /// Persist the session at the end of the request.
    ///
    /// An empty anonymous session is not stored; if it arrived with a cookie
    /// its row is deleted. A session created during this request gets a
    /// `Set-Cookie` header.
    pub async fn commit<R: RngCore + ?Sized>(
        &mut self,
        conn: &Connection,
        rng: &mut R,
        request_time: i64,
        cookie: &CookieParams<'_>,
        response: &mut Response,
    ) -> KernelResult<()> {
        if self.backend == SessionBackend::Null {
            return Ok(());
        }
        if self.is_empty() {
            if let (true, Some(sid)) = (self.from_cookie, self.sid.as_deref()) {
                conn.execute("DELETE FROM {sessions} WHERE sid = ?", &[sid.into()])
                    .await?;
            }
            return Ok(());
        }

        let sid = self.ensure_id(rng).to_string();
        let payload = serde_json::to_string(&self.data)?;
        let mut tx = conn.transaction().await?;
        tx.execute("DELETE FROM {sessions} WHERE sid = ?", &[sid.as_str().into()])
            .await?;
        tx.execute(
            "INSERT INTO {sessions} (sid, uid, hostname, timestamp, session) VALUES (?, ?, ?, ?, ?)",
            &[
                sid.as_str().into(),
                self.uid.into(),
                self.hostname.as_str().into(),
                request_time.into(),
                payload.into(),
            ],
        )
        .await?;
        tx.commit().await?;

        if !self.from_cookie {
            response.append_header("Set-Cookie", cookie.header_value(&self.name, &sid));
            self.from_cookie = true;
        }
        debug!(uid = self.uid, "Session written");
        Ok(())
    }
}

/// Attributes of the session cookie.
#[derive(Debug, Clone, Copy)]
pub struct CookieParams<'a> {
    pub path: &'a str,
    pub domain: &'a str,
    pub secure: bool,
}

impl CookieParams<'_> {
    pub fn header_value(&self, name: &str, value: &str) -> String {
        let mut cookie = format!("{name}={value}; path={}", self.path);
        if let Some(domain) = cookie_domain_attribute(self.domain) {
            cookie.push_str("; domain=");
            cookie.push_str(domain);
        }
        if self.secure {
            cookie.push_str("; secure");
        }
        cookie.push_str("; HttpOnly");
        cookie
    }
}
