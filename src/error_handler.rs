//! Runtime error reporting.
//!
//! Errors raised while serving a request are logged through the watchdog and,
//! depending on the `error_level` variable, shown to the visitor. A fatal
//! error ends the request with a maintenance page; command line and
//! XMLHttpRequest callers get bare text instead. If rendering the error page
//! fails in turn, a minimal fallback page is written directly.

use crate::bootstrap::Phase;
use crate::error::{KernelError, KernelResult};
use crate::kernel::Kernel;
use crate::watchdog::Severity;
use regex::Regex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::panic::Location;
use std::sync::LazyLock;
use tracing::warn;

/// Log and display template for errors.
pub const ERROR_MESSAGE: &str = "%type: !message in %function (line %line of %file).";

const FATAL_CONTENT: &str = "The website encountered an unexpected error. Please try again later.";

static TAGS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<[^>]*>").expect("valid regex"));

/// Kinds of runtime error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    Error,
    Warning,
    Notice,
    UserError,
    UserWarning,
    /// Debug output; displayed as a status message.
    UserNotice,
    Strict,
    /// Treated as fatal.
    Recoverable,
    Deprecated,
    UserDeprecated,
}

impl ErrorClass {
    pub fn label(self) -> &'static str {
        match self {
            Self::Error => "Error",
            Self::Warning => "Warning",
            Self::Notice => "Notice",
            Self::UserError => "User error",
            Self::UserWarning => "User warning",
            Self::UserNotice => "User notice",
            Self::Strict => "Strict warning",
            Self::Recoverable => "Recoverable fatal error",
            Self::Deprecated => "Deprecated function",
            Self::UserDeprecated => "User deprecated function",
        }
    }

    pub fn severity(self) -> Severity {
        match self {
            Self::Error | Self::UserError | Self::Recoverable => Severity::Error,
            Self::Warning | Self::UserWarning => Severity::Warning,
            Self::Notice | Self::UserNotice => Severity::Notice,
            Self::Strict | Self::Deprecated | Self::UserDeprecated => Severity::Debug,
        }
    }

    pub fn is_fatal(self) -> bool {
        self == Self::Recoverable
    }
}

/// The `error_level` variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorLevel {
    Hide = 0,
    /// Everything except notices and strict warnings.
    Some = 1,
    All = 2,
}

impl ErrorLevel {
    pub fn from_i64(value: i64) -> Self {
        match value {
            0 => Self::Hide,
            1 => Self::Some,
            _ => Self::All,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaintenanceMode {
    /// Running database updates; every error is displayed.
    Update,
    /// A fatal error happened before the full bootstrap.
    Error,
}

/// A decoded error, ready for logging.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorReport {
    /// Error type label, e.g. `Warning` or an error kind.
    pub kind: String,
    /// Message, already safe for HTML output.
    pub message: String,
    pub function: String,
    pub file: String,
    pub line: u32,
    pub severity: Severity,
}

impl ErrorReport {
    /// A report located at the caller.
    #[track_caller]
    pub fn new(class: ErrorClass, message: impl Into<String>) -> Self {
        let location = Location::caller();
        Self {
            kind: class.label().to_string(),
            message: message.into(),
            function: "main()".to_string(),
            file: location.file().to_string(),
            line: location.line(),
            severity: class.severity(),
        }
    }

    /// A report for an error value; its text is escaped.
    #[track_caller]
    pub fn from_error(err: &KernelError) -> Self {
        let location = Location::caller();
        Self {
            kind: err.kind().to_string(),
            message: escape_html(&err.to_string()),
            function: "main()".to_string(),
            file: location.file().to_string(),
            line: location.line(),
            severity: Severity::Error,
        }
    }

    pub fn in_function(mut self, function: impl Into<String>) -> Self {
        self.function = function.into();
        self
    }

    /// Placeholder values for [`ERROR_MESSAGE`].
    pub fn variables(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("%type".to_string(), self.kind.clone()),
            ("!message".to_string(), self.message.clone()),
            ("%function".to_string(), self.function.clone()),
            ("%file".to_string(), self.file.clone()),
            ("%line".to_string(), self.line.to_string()),
        ])
    }

    /// The message with `%` placeholders emphasized.
    pub fn html(&self) -> String {
        let em = |value: &str| format!("<em class=\"placeholder\">{}</em>", escape_html(value));
        ERROR_MESSAGE
            .replace("%type", &em(&self.kind))
            .replace("%function", &em(&self.function))
            .replace("%line", &em(&self.line.to_string()))
            .replace("%file", &em(&self.file))
            .replace("!message", &self.message)
    }

    /// The message without markup.
    pub fn text(&self) -> String {
        plain_text(&self.html())
    }
}

pub fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#039;")
}

/// Strip tags and decode the entities [`escape_html`] produces.
pub fn plain_text(html: &str) -> String {
    TAGS.replace_all(html, "")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#039;", "'")
        .replace("&amp;", "&")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Status,
    Warning,
    Error,
}

impl MessageKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::Status => "status",
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }
}

/// A message queued for display to the visitor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Message {
    pub kind: MessageKind,
    /// HTML.
    pub text: String,
}

/// Content of a maintenance page.
#[derive(Debug, Clone)]
pub struct MaintenancePage<'a> {
    pub title: &'a str,
    pub content: &'a str,
    pub site_name: &'a str,
    pub language: &'a str,
    pub messages: &'a [Message],
}

/// Renders the pages the kernel produces on its own.
pub trait PageRenderer: Send + Sync + fmt::Debug {
    fn maintenance_page(&self, page: &MaintenancePage<'_>) -> KernelResult<String>;
}

/// Minimal HTML pages.
#[derive(Debug, Default, Clone, Copy)]
pub struct HtmlRenderer;

impl PageRenderer for HtmlRenderer {
    fn maintenance_page(&self, page: &MaintenancePage<'_>) -> KernelResult<String> {
        let mut messages = String::new();
        for kind in [MessageKind::Error, MessageKind::Warning, MessageKind::Status] {
            let texts: Vec<&str> = page
                .messages
                .iter()
                .filter(|m| m.kind == kind)
                .map(|m| m.text.as_str())
                .collect();
            match texts.as_slice() {
                [] => {}
                [single] => messages.push_str(&format!(
                    "<div class=\"messages {}\">{single}</div>\n",
                    kind.name()
                )),
                many => {
                    messages.push_str(&format!("<div class=\"messages {}\"><ul>", kind.name()));
                    for text in many {
                        messages.push_str(&format!("<li>{text}</li>"));
                    }
                    messages.push_str("</ul></div>\n");
                }
            }
        }

        let title = escape_html(page.title);
        Ok(format!(
            "<!DOCTYPE html>\n<html lang=\"{lang}\">\n<head><title>{title} | {site}</title></head>\n\
             <body class=\"maintenance-page\">\n<h1 class=\"title\">{title}</h1>\n{messages}\
             <div id=\"content\">{content}</div>\n</body>\n</html>\n",
            lang = escape_html(page.language),
            site = escape_html(page.site_name),
            content = page.content,
        ))
    }
}

/// Error handling state of one kernel.
#[derive(Debug, Default)]
pub(crate) struct ErrorState {
    /// Next `X-Drupal-Assertion-N` header number.
    pub(crate) assertion_number: u32,
    pub(crate) maintenance: Option<MaintenanceMode>,
}

impl Kernel {
    pub fn error_level(&self) -> ErrorLevel {
        ErrorLevel::from_i64(self.variables.get_i64("error_level", ErrorLevel::All as i64))
    }

    pub fn maintenance_mode(&self) -> Option<MaintenanceMode> {
        self.errors.maintenance
    }

    /// Whether an error (or errors in general, for `None`) may be shown.
    pub fn is_error_displayable(&self, report: Option<&ErrorReport>) -> bool {
        let updating = self.errors.maintenance == Some(MaintenanceMode::Update);
        let level = self.error_level();
        let needs_display = level == ErrorLevel::Some
            && report.is_some_and(|r| r.kind != "Notice" && r.kind != "Strict warning");
        updating || level == ErrorLevel::All || needs_display
    }

    /// Report an error raised at the caller's location.
    #[track_caller]
    pub fn report_error(&mut self, class: ErrorClass, message: &str) -> KernelResult<()> {
        let report = ErrorReport::new(class, escape_html(message));
        self.log_error(report, class.is_fatal())
    }

    /// Log an error and, for fatal ones, end the request with an error page.
    pub fn log_error(&mut self, report: ErrorReport, fatal: bool) -> KernelResult<()> {
        if fatal && self.bootstrap_phase() != Some(Phase::Full) {
            self.errors.maintenance.get_or_insert(MaintenanceMode::Error);
        }

        if self.test_prefix.is_some() {
            let assertion = serde_json::json!([
                report.message,
                report.kind,
                {"function": report.function, "file": report.file, "line": report.line},
            ]);
            let encoded: String =
                url::form_urlencoded::byte_serialize(assertion.to_string().as_bytes())
                    .collect::<String>()
                    .replace('+', "%20");
            let name = format!("X-Drupal-Assertion-{}", self.errors.assertion_number);
            self.response.set_header(&name, encoded);
            self.errors.assertion_number += 1;
        }

        self.watchdog("php", ERROR_MESSAGE, report.variables(), report.severity, None);

        if fatal {
            self.response
                .set_status(500, "Service unavailable (with message)");
        }

        if self.request.cli {
            if fatal {
                self.response.body = format!("{}\n", report.text());
                self.halted = true;
            }
            return Ok(());
        }

        if self.request.is_xml_http_request() {
            if fatal {
                if self.is_error_displayable(Some(&report)) {
                    self.response.body = report.html();
                }
                self.halted = true;
            }
            return Ok(());
        }

        if self.is_error_displayable(Some(&report)) {
            let mut shown = report.clone();
            let mut kind = MessageKind::Error;
            if shown.kind == ErrorClass::UserNotice.label() {
                shown.kind = "Debug".to_string();
                kind = MessageKind::Status;
            }
            self.set_message(shown.html(), kind);
        }

        if fatal {
            let messages = std::mem::take(&mut self.messages);
            let site_name = self.variables.get_str("site_name").unwrap_or("Site").to_string();
            let language = self.languages.default_language().language.clone();
            let page = MaintenancePage {
                title: "Error",
                content: FATAL_CONTENT,
                site_name: &site_name,
                language: &language,
                messages: &messages,
            };
            let html = self.renderer.maintenance_page(&page)?;
            self.response
                .set_header("Content-Type", "text/html; charset=utf-8");
            self.response.body = html;
            self.halted = true;
        }
        Ok(())
    }

    /// Handle an error that aborted request processing.
    #[track_caller]
    pub fn handle_exception(&mut self, err: &KernelError) {
        let report = ErrorReport::from_error(err);
        if let Err(additional) = self.log_error(report.clone(), true) {
            warn!(error = %additional, "Error while handling an error");
            if self.is_error_displayable(None) {
                let additional = ErrorReport::from_error(&additional);
                self.response
                    .set_header("Content-Type", "text/html; charset=utf-8");
                self.response.body = format!(
                    "<h1>Additional uncaught exception thrown while handling exception.</h1>\
                     <h2>Original</h2><p>{}</p><h2>Additional</h2><p>{}</p><hr />",
                    escape_html(&report.text()),
                    escape_html(&additional.text()),
                );
            }
            self.halted = true;
        }
    }

    /// Queue a message for the visitor. A page showing messages is not cached.
    pub fn set_message(&mut self, text: impl Into<String>, kind: MessageKind) {
        let message = Message {
            kind,
            text: text.into(),
        };
        if !self.messages.contains(&message) {
            self.messages.push(message);
        }
        self.page_is_cacheable(Some(false));
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn take_messages(&mut self) -> Vec<Message> {
        std::mem::take(&mut self.messages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_class_mapping() {
        assert_eq!(ErrorClass::Warning.label(), "Warning");
        assert_eq!(ErrorClass::Strict.severity(), Severity::Debug);
        assert_eq!(ErrorClass::UserNotice.severity(), Severity::Notice);
        assert!(ErrorClass::Recoverable.is_fatal());
        assert!(!ErrorClass::UserError.is_fatal());
    }

    #[test]
    fn test_error_level_from_variable() {
        assert_eq!(ErrorLevel::from_i64(0), ErrorLevel::Hide);
        assert_eq!(ErrorLevel::from_i64(1), ErrorLevel::Some);
        assert_eq!(ErrorLevel::from_i64(7), ErrorLevel::All);
    }

    #[test]
    fn test_report_records_caller() {
        let report = ErrorReport::new(ErrorClass::Notice, "Undefined index");
        assert!(report.file.ends_with("error_handler.rs"));
        assert!(report.line > 0);
        assert_eq!(report.severity, Severity::Notice);
    }

    #[test]
    fn test_report_formats() {
        let report = ErrorReport {
            kind: "Warning".to_string(),
            message: "bad &amp; worse".to_string(),
            function: "f()".to_string(),
            file: "a.rs".to_string(),
            line: 3,
            severity: Severity::Warning,
        };
        assert_eq!(
            report.html(),
            "<em class=\"placeholder\">Warning</em>: bad &amp; worse in \
             <em class=\"placeholder\">f()</em> (line <em class=\"placeholder\">3</em> of \
             <em class=\"placeholder\">a.rs</em>)."
        );
        assert_eq!(report.text(), "Warning: bad & worse in f() (line 3 of a.rs).");
    }

    #[test]
    fn test_from_error_escapes() {
        let report = ErrorReport::from_error(&KernelError::internal("<b>x</b>"));
        assert_eq!(report.kind, "InternalError");
        assert!(report.message.contains("&lt;b&gt;"));
    }

    #[test]
    fn test_renderer_lists_messages() {
        let messages = vec![
            Message {
                kind: MessageKind::Error,
                text: "one".to_string(),
            },
            Message {
                kind: MessageKind::Error,
                text: "two".to_string(),
            },
        ];
        let html = HtmlRenderer
            .maintenance_page(&MaintenancePage {
                title: "Error",
                content: FATAL_CONTENT,
                site_name: "Example",
                language: "en",
                messages: &messages,
            })
            .unwrap();
        assert!(html.contains("<title>Error | Example</title>"));
        assert!(html.contains("<li>one</li><li>two</li>"));
        assert!(html.contains(FATAL_CONTENT));
    }
}
