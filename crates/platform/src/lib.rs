//! # Kestrel Platform
//!
//! Shared types for the kestrel SSH crates.
//!
//! This crate provides:
//! - A unified error type (`KestrelError`, `KestrelResult`)
//! - The injected logging collaborator (`Logger` and its implementations)
//!
//! # Examples
//!
//! ```
//! use kestrel_platform::{KestrelError, KestrelResult};
//!
//! fn negotiate() -> KestrelResult<&'static str> {
//!     Err(KestrelError::Negotiation("no matching algorithm".to_string()))
//! }
//!
//! let err = negotiate().unwrap_err();
//! assert!(err.is_fatal());
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod error;
pub mod logging;

pub use error::{KestrelError, KestrelResult};
pub use logging::{default_logger, Level, Logger, MemoryLogger, NullLogger, TracingLogger};

/// Platform version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
