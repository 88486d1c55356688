//! Site Kernel Library
//!
//! A request kernel for database-backed sites: a registry of lazily opened
//! database connections keyed by `(key, target)`, an eight-phase bootstrap,
//! bin-keyed caches, persistent variables, locks, sessions, language
//! negotiation and error handling with watchdog logging.

pub mod bootstrap;
pub mod cache;
pub mod config;
pub mod db;
pub mod error;
pub mod error_handler;
pub mod kernel;
pub mod language;
pub mod lock;
pub mod module;
pub mod request;
pub mod session;
pub mod statics;
pub mod test_prefix;
pub mod timer;
pub mod variable;
pub mod watchdog;

pub use bootstrap::{BootstrapStatus, Phase};
pub use config::{Config, Settings};
pub use error::{KernelError, KernelResult};
pub use kernel::{Kernel, KernelOptions};
pub use module::{Hook, Module};
pub use request::{Request, Response};
