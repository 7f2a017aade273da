use std::fmt;
use std::io;
use std::sync::Arc;

use thiserror::Error;

/// Errors produced by singleton construction and by the worker driver.
///
/// `Clone` so that one failed construction can be reported to every caller that
/// raced on it.
#[derive(Debug, Clone, Error)]
pub enum Error {
   #[error("failed to construct `{type_name}`: {reason}")]
   Construct {
      type_name: &'static str,
      reason: Arc<str>,
   },

   #[error("worker output failed: {0}")]
   Io(#[source] Arc<io::Error>),

   #[error("worker task failed: {0}")]
   Join(String),
}

impl Error {
   /// Construction failure of `T`.
   pub fn construct<T>(reason: impl fmt::Display) -> Self {
      Self::Construct {
         type_name: std::any::type_name::<T>(),
         reason: reason.to_string().into(),
      }
   }
}

impl From<io::Error> for Error {
   fn from(err: io::Error) -> Self {
      Self::Io(Arc::new(err))
   }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
   use super::*;

   struct Database;

   #[test]
   fn test_construct_names_type() {
      let err = Error::construct::<Database>("connection refused");
      let msg = err.to_string();
      assert!(msg.contains("Database"), "{msg}");
      assert!(msg.ends_with("connection refused"), "{msg}");
   }

   #[test]
   fn test_io_keeps_source() {
      let err = Error::from(io::Error::new(io::ErrorKind::BrokenPipe, "closed"));
      let source = std::error::Error::source(&err).expect("io error has a source");
      assert_eq!(source.to_string(), "closed");
   }
}
