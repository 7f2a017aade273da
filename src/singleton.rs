//! Lazily constructed, single-instance values.
//!
//! A [`Singleton<T>`] owns at most one `T`. The first call to
//! [`get_instance`](Singleton::get_instance), from whichever thread wins the race,
//! runs the constructor; every call after that returns the same reference without
//! taking a lock.
//!
//! The constructor is a plain `fn` pointer handed over by the type being managed, so
//! that type can keep its constructor private and expose only the singleton. Because
//! [`Singleton::new`] is `const`, the same type works both as a process-wide `static`
//! and as a value owned by the application and passed around by reference.

use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use tracing::{debug, info, warn};

use crate::cell::InstanceCell;
use crate::error::{Error, Result};
use crate::release::{Release, ReleaseKind};

/// Address-based identity of an instance.
///
/// Two ids are equal exactly when they were taken from the same live object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstanceId(usize);

impl InstanceId {
   /// Identity of `instance`, taken from its address.
   ///
   /// Only meaningful while `instance` is alive; a later object may reuse the address.
   pub fn of<T>(instance: &T) -> Self {
      Self(instance as *const T as usize)
   }
}

impl fmt::Display for InstanceId {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      write!(f, "{:#x}", self.0)
   }
}

/// A lazily constructed single instance of `T`.
///
/// # Examples
///
/// ```rust
/// use lazy_singleton::{Release, Result, Singleton};
///
/// pub struct Registry {
///    entries: Vec<&'static str>,
/// }
///
/// impl Registry {
///    fn construct() -> Result<Self> {
///       Ok(Self { entries: vec!["default"] })
///    }
/// }
///
/// impl Release for Registry {}
///
/// static REGISTRY: Singleton<Registry> = Singleton::new(Registry::construct);
///
/// let first = REGISTRY.get_instance().unwrap();
/// let second = REGISTRY.get_instance().unwrap();
/// assert!(std::ptr::eq(first, second));
/// assert_eq!(first.entries, ["default"]);
/// assert_eq!(REGISTRY.constructions(), 1);
/// ```
pub struct Singleton<T: Release> {
   cell: InstanceCell<T, Error>,
   ctor: fn() -> Result<T>,
   attempts: AtomicUsize,
   constructions: AtomicUsize,
   disposed: AtomicBool,
}

impl<T: Release> Singleton<T> {
   /// Creates an empty singleton that will build its instance with `ctor`.
   #[must_use]
   pub const fn new(ctor: fn() -> Result<T>) -> Self {
      Self {
         cell: InstanceCell::new(),
         ctor,
         attempts: AtomicUsize::new(0),
         constructions: AtomicUsize::new(0),
         disposed: AtomicBool::new(false),
      }
   }

   /// Returns the instance, constructing it on the first call.
   ///
   /// Once constructed this is a single atomic load. If construction fails the error
   /// is returned to the constructing caller and to all callers blocked on that
   /// attempt, and the singleton stays empty so a later call can retry.
   pub fn get_instance(&self) -> Result<&T> {
      if let Some(instance) = self.cell.get() {
         return Ok(instance);
      }
      self.cell.get_or_try_init(|| self.construct())
   }

   /// Async version of [`get_instance`](Self::get_instance).
   pub async fn get_instance_async(&self) -> Result<&T> {
      if let Some(instance) = self.cell.get() {
         return Ok(instance);
      }
      self
         .cell
         .get_or_try_init_async(|| async { self.construct() })
         .await
   }

   /// Runs the constructor. Only ever called while holding the init lock.
   fn construct(&self) -> Result<T> {
      let type_name = std::any::type_name::<T>();
      let attempt = self.attempts.fetch_add(1, Ordering::Relaxed) + 1;
      debug!(type_name, attempt, "constructing singleton instance");

      match (self.ctor)() {
         Ok(instance) => {
            self.constructions.fetch_add(1, Ordering::Relaxed);
            info!(type_name, attempt, "singleton instance constructed");
            Ok(instance)
         }
         Err(err) => {
            warn!(type_name, attempt, error = %err, "singleton construction failed");
            Err(err)
         }
      }
   }

   /// Returns the instance if it has been constructed. Never blocks or constructs.
   #[inline]
   pub fn try_get(&self) -> Option<&T> {
      self.cell.get()
   }

   /// Returns `true` once the instance has been constructed and published.
   #[inline]
   pub fn is_constructed(&self) -> bool {
      self.cell.is_initialized()
   }

   /// Identity of the constructed instance, if any.
   pub fn instance_id(&self) -> Option<InstanceId> {
      self.try_get().map(InstanceId::of)
   }

   /// Number of successful constructions. Never exceeds 1.
   pub fn constructions(&self) -> usize {
      self.constructions.load(Ordering::Relaxed)
   }

   /// Number of times the constructor ran, including failed runs.
   pub fn attempts(&self) -> usize {
      self.attempts.load(Ordering::Relaxed)
   }

   /// Releases the instance's resources ahead of drop.
   ///
   /// Returns `true` for the one call that performed the release. Later calls, and
   /// calls made before the instance exists, return `false` and do nothing. A disposed
   /// singleton still hands out its instance; only its `Release` hook is spent, and
   /// dropping the singleton will not release it a second time.
   pub fn dispose(&self) -> bool {
      let Some(instance) = self.cell.get() else {
         debug!(type_name = std::any::type_name::<T>(), "dispose before construction ignored");
         return false;
      };
      if self.disposed.swap(true, Ordering::AcqRel) {
         return false;
      }
      debug!(type_name = std::any::type_name::<T>(), "disposing singleton instance");
      instance.release(ReleaseKind::Explicit);
      true
   }

   /// Returns `true` after [`dispose`](Self::dispose) released the instance.
   #[inline]
   pub fn is_disposed(&self) -> bool {
      self.disposed.load(Ordering::Acquire)
   }
}

impl<T: Release> Drop for Singleton<T> {
   fn drop(&mut self) {
      let disposed = *self.disposed.get_mut();
      if let Some(instance) = self.cell.get_mut() {
         if !disposed {
            debug!(
               type_name = std::any::type_name::<T>(),
               "releasing undisposed singleton on drop"
            );
            instance.release(ReleaseKind::Finalizer);
         }
      }
   }
}

impl<T: Release + fmt::Debug> fmt::Debug for Singleton<T> {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.debug_struct("Singleton")
         .field("instance", &self.cell)
         .field("constructions", &self.constructions())
         .field("disposed", &self.is_disposed())
         .finish()
   }
}
