//! Lazy, thread-safe, single-instance construction.
//!
//! This crate provides:
//!
//! - [`Singleton<T>`]: owns at most one `T`, built on the first
//!   [`get_instance`](Singleton::get_instance) call no matter how many threads race on it.
//! - [`InstanceCell<T, E>`]: the initialize-once cell underneath, usable on its own.
//! - [`Release`]: the hook run when an instance is disposed or its owner is dropped.
//! - [`driver`]: concurrent workers that share one [`Printer`] and print timestamped lines.
//!
//! Reads of a constructed instance are a single atomic load. Callers that lose the
//! construction race park on the state word through `parking_lot_core` and wake once
//! the winner publishes the instance. A failed construction is never cached: the
//! error reaches every caller that waited on that attempt, and the next call retries.
//!
//! # Examples
//!
//! ## Process-wide instance
//!
//! ```rust
//! use lazy_singleton::{Release, Result, Singleton};
//!
//! pub struct Settings {
//!    pub mode: &'static str,
//! }
//!
//! impl Settings {
//!    fn load() -> Result<Self> {
//!       Ok(Self { mode: "production" })
//!    }
//! }
//!
//! impl Release for Settings {}
//!
//! static SETTINGS: Singleton<Settings> = Singleton::new(Settings::load);
//!
//! assert_eq!(SETTINGS.get_instance().unwrap().mode, "production");
//! assert_eq!(SETTINGS.constructions(), 1);
//! ```
//!
//! ## Owned instance with retry after failure
//!
//! ```rust
//! use lazy_singleton::{Error, Release, Singleton};
//! use std::sync::atomic::{AtomicBool, Ordering};
//!
//! static READY: AtomicBool = AtomicBool::new(false);
//!
//! struct Connection;
//! impl Release for Connection {}
//!
//! let connection = Singleton::new(|| {
//!    if READY.load(Ordering::SeqCst) {
//!       Ok(Connection)
//!    } else {
//!       Err(Error::construct::<Connection>("backend not ready"))
//!    }
//! });
//!
//! assert!(connection.get_instance().is_err());
//! assert!(!connection.is_constructed());
//!
//! READY.store(true, Ordering::SeqCst);
//! assert!(connection.get_instance().is_ok());
//! assert_eq!(connection.attempts(), 2);
//! assert_eq!(connection.constructions(), 1);
//! ```

/// Initialize-once cell.
mod cell;

/// Worker loop exercising a shared printer.
pub mod driver;

/// Error type and `Result` alias.
mod error;

/// The demo shared instance.
mod printer;

/// Dispose and finalizer hooks.
mod release;

/// Lazily constructed single instances.
mod singleton;

/// Internal synchronization state.
mod state;

pub use cell::InstanceCell;
pub use error::{Error, Result};
pub use printer::Printer;
pub use release::{Release, ReleaseKind};
pub use singleton::{InstanceId, Singleton};
