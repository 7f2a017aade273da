//! The shared instance used by the worker driver.

use core::sync::atomic::{AtomicUsize, Ordering};

use chrono::{DateTime, Local, SecondsFormat};
use tracing::debug;

use crate::error::Result;
use crate::release::{Release, ReleaseKind};
use crate::singleton::Singleton;

static GLOBAL: Singleton<Printer> = Singleton::new(Printer::construct);

/// Formats the `<label>: <timestamp>` lines written by workers.
///
/// `Printer` cannot be constructed directly. Use [`Printer::global`] for the
/// process-wide instance or [`Printer::singleton`] for an owned one.
#[derive(Debug)]
pub struct Printer {
   created_at: DateTime<Local>,
   releases: AtomicUsize,
}

impl Printer {
   fn construct() -> Result<Self> {
      Ok(Self {
         created_at: Local::now(),
         releases: AtomicUsize::new(0),
      })
   }

   /// The process-wide printer, constructed on first use.
   pub fn global() -> Result<&'static Printer> {
      GLOBAL.get_instance()
   }

   /// The process-wide singleton itself, for callers that need its counters or `dispose`.
   pub fn global_singleton() -> &'static Singleton<Printer> {
      &GLOBAL
   }

   /// A fresh, empty singleton owned by the caller.
   pub fn singleton() -> Singleton<Printer> {
      Singleton::new(Self::construct)
   }

   pub fn created_at(&self) -> DateTime<Local> {
      self.created_at
   }

   /// `"<label>: <RFC 3339 timestamp>"`, seconds precision.
   pub fn line(&self, label: &str, now: DateTime<Local>) -> String {
      format!("{label}: {}", now.to_rfc3339_opts(SecondsFormat::Secs, false))
   }

   /// How many times this printer has been released.
   pub fn releases(&self) -> usize {
      self.releases.load(Ordering::Acquire)
   }
}

impl Release for Printer {
   fn release(&self, kind: ReleaseKind) {
      let count = self.releases.fetch_add(1, Ordering::AcqRel) + 1;
      debug!(?kind, count, "printer released");
   }
}
