//! Initialize-once cell backing [`Singleton`](crate::Singleton).
//!
//! [`InstanceCell<T, E>`] is written at most once. Reads after initialization are a
//! single `Acquire` load. Construction runs under the init lock from the `state`
//! module, so concurrent first callers see exactly one construction.
//!
//! Failed construction is not cached: the cell stays empty and the next caller
//! starts a fresh attempt. Callers that were already parked on the failed attempt
//! get a clone of the same error rather than a new attempt of their own.

use core::cell::UnsafeCell;
use core::convert::Infallible;
use core::future::Future;
use core::sync::atomic::Ordering;
use core::{fmt, mem};

use parking_lot::{const_mutex, Mutex};

use crate::state::{InitGuard, InitLock, Settled};

/// Outcomes of the attempts that callers are parked on.
///
/// The first caller to park on a running attempt opens a record for it, and the last
/// waiter to leave removes it. Waiters look their record up by id rather than by epoch,
/// so a slow waiter never reads the outcome of a later attempt that reused the epoch.
struct Attempts<E> {
   next_id: u64,
   records: Vec<Record<E>>,
}

struct Record<E> {
   id: u64,
   epoch: u8,
   settled: bool,
   waiters: usize,
   error: Option<E>,
}

impl<E> Attempts<E> {
   const fn new() -> Self {
      Self {
         next_id: 0,
         records: Vec::new(),
      }
   }

   fn running(&mut self, epoch: u8) -> Option<&mut Record<E>> {
      self.records.iter_mut().find(|r| r.epoch == epoch && !r.settled)
   }

   /// Adds a waiter to the running attempt `epoch` and returns the id of its record.
   fn join(&mut self, epoch: u8) -> u64 {
      if let Some(record) = self.running(epoch) {
         record.waiters += 1;
         return record.id;
      }
      let id = self.next_id;
      self.next_id += 1;
      self.records.push(Record {
         id,
         epoch,
         settled: false,
         waiters: 1,
         error: None,
      });
      id
   }

   /// Closes the record of attempt `epoch`. No-op when nobody waits on it.
   fn settle(&mut self, epoch: u8, error: impl FnOnce() -> Option<E>) {
      if let Some(record) = self.running(epoch) {
         record.settled = true;
         record.error = error();
      }
   }

   fn error(&self, id: u64) -> Option<E>
   where
      E: Clone,
   {
      self
         .records
         .iter()
         .find(|r| r.id == id)
         .and_then(|r| r.error.clone())
   }

   fn leave(&mut self, id: u64) {
      let Some(pos) = self.records.iter().position(|r| r.id == id) else {
         return;
      };
      let record = &mut self.records[pos];
      record.waiters -= 1;
      if record.waiters == 0 {
         self.records.swap_remove(pos);
      }
   }
}

/// A caller's registration on a running attempt. Dropping it unregisters.
struct Ticket<'a, E> {
   attempts: &'a Mutex<Attempts<E>>,
   id: u64,
}

impl<E: Clone> Ticket<'_, E> {
   /// Error the attempt failed with. `None` if it has not failed or was abandoned by a panic.
   fn error(&self) -> Option<E> {
      self.attempts.lock().error(self.id)
   }
}

impl<E> Drop for Ticket<'_, E> {
   fn drop(&mut self) {
      self.attempts.lock().leave(self.id);
   }
}

/// The construction a caller is running while it holds the init lock.
///
/// Its record is settled before the lock is released, under the same mutex waiters
/// register with, so a waiter that wakes up always finds the outcome. Dropping an
/// unfinished attempt (a panic, or a cancelled future) abandons it without an error.
struct Attempt<'a, T, E> {
   cell: &'a InstanceCell<T, E>,
   guard: Option<InitGuard<'a>>,
}

impl<T, E> Attempt<'_, T, E> {
   fn commit(mut self, value: T) {
      let Some(guard) = self.guard.take() else {
         return;
      };
      // SAFETY: we hold the init lock.
      unsafe { (*self.cell.value.get()).write(value) };
      let mut attempts = self.cell.attempts.lock();
      attempts.settle(guard.epoch(), || None);
      guard.commit();
   }

   /// Publishes `Ok` values. On `Err` the error is recorded for the waiters and the
   /// attempt is abandoned.
   fn finish(mut self, result: Result<T, E>) -> Result<(), E>
   where
      E: Clone,
   {
      match result {
         Ok(value) => {
            self.commit(value);
            Ok(())
         }
         Err(error) => {
            if let Some(guard) = self.guard.take() {
               let mut attempts = self.cell.attempts.lock();
               attempts.settle(guard.epoch(), || Some(error.clone()));
               drop(guard);
            }
            Err(error)
         }
      }
   }
}

impl<T, E> Drop for Attempt<'_, T, E> {
   fn drop(&mut self) {
      if let Some(guard) = self.guard.take() {
         let mut attempts = self.cell.attempts.lock();
         attempts.settle(guard.epoch(), || None);
         drop(guard);
      }
   }
}

/// First step of a slow-path call.
enum Begin<'a, T, E> {
   Done,
   Construct(Attempt<'a, T, E>),
   Wait { epoch: u8, ticket: Ticket<'a, E> },
}

/// A thread-safe cell which is initialized at most once.
///
/// `E` is the error type of fallible initialization; it only shows up in the type
/// when [`get_or_try_init`](Self::get_or_try_init) is used.
pub struct InstanceCell<T, E = Infallible> {
   value: UnsafeCell<mem::MaybeUninit<T>>,
   lock: InitLock,
   attempts: Mutex<Attempts<E>>,
}

impl<T, E> InstanceCell<T, E> {
   /// Creates an empty cell.
   #[inline]
   #[must_use]
   pub const fn new() -> Self {
      Self {
         value: UnsafeCell::new(mem::MaybeUninit::uninit()),
         lock: InitLock::new(),
         attempts: const_mutex(Attempts::new()),
      }
   }

   /// Creates a cell that already holds `value`.
   #[inline]
   #[must_use]
   pub const fn with_value(value: T) -> Self {
      Self {
         value: UnsafeCell::new(mem::MaybeUninit::new(value)),
         lock: InitLock::done(),
         attempts: const_mutex(Attempts::new()),
      }
   }

   /// Returns `true` once a value has been published. Never blocks.
   #[inline]
   pub fn is_initialized(&self) -> bool {
      self.lock.is_done(Ordering::Acquire)
   }

   /// Returns the value if it has been published. Never blocks.
   #[inline]
   pub fn get(&self) -> Option<&T> {
      if self.is_initialized() {
         // SAFETY: DONE was observed with Acquire ordering, so the value is written and visible.
         Some(unsafe { self.get_unchecked() })
      } else {
         None
      }
   }

   /// Returns the value mutably if it has been published.
   #[inline]
   pub fn get_mut(&mut self) -> Option<&mut T> {
      if self.is_initialized() {
         // SAFETY: initialized, and `&mut self` rules out other readers.
         Some(unsafe { (*self.value.get()).assume_init_mut() })
      } else {
         None
      }
   }

   /// # Safety
   ///
   /// The cell must be initialized.
   #[inline]
   unsafe fn get_unchecked(&self) -> &T {
      debug_assert!(self.is_initialized(), "get_unchecked called on an empty InstanceCell");
      (*self.value.get()).assume_init_ref()
   }

   /// Stores `value` if the cell is empty and nobody is constructing right now.
   ///
   /// Returns the value back in `Err` otherwise.
   pub fn try_set(&self, value: T) -> Result<&T, T> {
      let Some(guard) = self.lock.try_lock() else {
         return Err(value);
      };
      self.attempt(guard).commit(value);
      // SAFETY: committed above.
      Ok(unsafe { self.get_unchecked() })
   }

   /// Takes the value out, leaving the cell empty and ready for a new initialization.
   pub fn take(&mut self) -> Option<T> {
      if self.lock.set_uninit() {
         // SAFETY: the state was DONE, and it is no longer, so nothing reads the old value.
         Some(unsafe { (*self.value.get()).assume_init_read() })
      } else {
         None
      }
   }

   /// Returns the value, running `f` to produce it if the cell is empty.
   ///
   /// Concurrent callers block until the single running `f` returns. If `f` panics the
   /// cell stays empty and a waiting caller takes over the construction.
   #[inline]
   pub fn get_or_init<F>(&self, f: F) -> &T
   where
      F: FnOnce() -> T,
   {
      if let Some(value) = self.get() {
         return value;
      }
      self.initialize(f);
      // SAFETY: `initialize` only returns once the cell is DONE.
      unsafe { self.get_unchecked() }
   }

   fn attempt<'a>(&'a self, guard: InitGuard<'a>) -> Attempt<'a, T, E> {
      Attempt {
         cell: self,
         guard: Some(guard),
      }
   }

   /// Takes the init lock, or registers on the attempt that holds it.
   fn begin(&self) -> Begin<'_, T, E> {
      loop {
         let epoch = match self.lock.lock_step(false) {
            Ok(None) => return Begin::Done,
            Ok(Some(guard)) => return Begin::Construct(self.attempt(guard)),
            Err(state) => InitLock::epoch_of(state),
         };
         let mut attempts = self.attempts.lock();
         // Attempts settle under this mutex, so the check cannot race with the outcome.
         if self.lock.is_held_at(epoch) {
            let id = attempts.join(epoch);
            return Begin::Wait {
               epoch,
               ticket: Ticket {
                  attempts: &self.attempts,
                  id,
               },
            };
         }
         // That attempt ended before we could register. Start over as a new caller.
      }
   }

   #[cold]
   fn initialize<F>(&self, f: F)
   where
      F: FnOnce() -> T,
   {
      loop {
         match self.begin() {
            Begin::Done => return,
            Begin::Construct(attempt) => {
               attempt.commit(f());
               return;
            }
            Begin::Wait { epoch, ticket: _ticket } => {
               // An infallible caller retries whatever the abandoned attempt failed with.
               if self.lock.park_on(epoch) == Settled::Done {
                  return;
               }
            }
         }
      }
   }

   /// Returns the value, running the fallible `f` to produce it if the cell is empty.
   ///
   /// - On `Ok`, the value is published and returned to every caller.
   /// - On `Err`, the cell stays empty. The error goes to the caller that ran `f` and to
   ///   every caller that was blocked on that attempt. Later callers try again.
   pub fn get_or_try_init<F>(&self, f: F) -> Result<&T, E>
   where
      F: FnOnce() -> Result<T, E>,
      E: Clone,
   {
      if let Some(value) = self.get() {
         return Ok(value);
      }
      self.try_initialize(f)?;
      debug_assert!(self.is_initialized());
      // SAFETY: `try_initialize` returned Ok, so the cell is DONE.
      Ok(unsafe { self.get_unchecked() })
   }

   #[cold]
   fn try_initialize<F>(&self, f: F) -> Result<(), E>
   where
      F: FnOnce() -> Result<T, E>,
      E: Clone,
   {
      loop {
         match self.begin() {
            Begin::Done => return Ok(()),
            Begin::Construct(attempt) => return attempt.finish(f()),
            Begin::Wait { epoch, ticket } => match self.lock.park_on(epoch) {
               Settled::Done => return Ok(()),
               Settled::Abandoned => {
                  if let Some(error) = ticket.error() {
                     return Err(error);
                  }
               }
            },
         }
      }
   }

   /// Async version of [`get_or_try_init`](Self::get_or_try_init).
   ///
   /// Waiting callers yield to the tokio scheduler instead of blocking a worker thread
   /// right away.
   pub async fn get_or_try_init_async<F, Fut>(&self, f: F) -> Result<&T, E>
   where
      F: FnOnce() -> Fut,
      Fut: Future<Output = Result<T, E>>,
      E: Clone,
   {
      if let Some(value) = self.get() {
         return Ok(value);
      }
      self.try_initialize_async(f).await?;
      debug_assert!(self.is_initialized());
      // SAFETY: `try_initialize_async` returned Ok, so the cell is DONE.
      Ok(unsafe { self.get_unchecked() })
   }

   #[cold]
   async fn try_initialize_async<F, Fut>(&self, f: F) -> Result<(), E>
   where
      F: FnOnce() -> Fut,
      Fut: Future<Output = Result<T, E>>,
      E: Clone,
   {
      loop {
         match self.begin() {
            Begin::Done => return Ok(()),
            Begin::Construct(attempt) => {
               let result = f().await;
               return attempt.finish(result);
            }
            Begin::Wait { epoch, ticket } => match self.lock.park_on_async(epoch).await {
               Settled::Done => return Ok(()),
               Settled::Abandoned => {
                  if let Some(error) = ticket.error() {
                     return Err(error);
                  }
               }
            },
         }
      }
   }
}

// SAFETY: shared access hands out `&T` to many threads (`T: Sync`) and the value may be
// written by one thread and dropped by another (`T: Send`). Recorded errors are cloned
// out from behind a mutex by other threads (`E: Send`).
unsafe impl<T: Send + Sync, E: Send> Sync for InstanceCell<T, E> {}
// SAFETY: moving the cell moves the value and any recorded error.
unsafe impl<T: Send, E: Send> Send for InstanceCell<T, E> {}

impl<T, E> Default for InstanceCell<T, E> {
   #[inline]
   fn default() -> Self {
      Self::new()
   }
}

impl<T: fmt::Debug, E> fmt::Debug for InstanceCell<T, E> {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      let mut d = f.debug_tuple("InstanceCell");
      match self.get() {
         Some(v) => d.field(v),
         None => d.field(&format_args!("<uninit>")),
      };
      d.finish()
   }
}

impl<T, E> Drop for InstanceCell<T, E> {
   fn drop(&mut self) {
      if self.is_initialized() {
         // SAFETY: initialized, exclusively borrowed, and never read again.
         unsafe { self.value.get_mut().assume_init_drop() };
      }
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_waiters_share_a_record() {
      let mut attempts: Attempts<&str> = Attempts::new();
      let first = attempts.join(0);
      assert_eq!(attempts.join(0), first);
      assert_ne!(attempts.join(8), first);

      attempts.settle(0, || Some("failed"));
      assert_eq!(attempts.error(first), Some("failed"));

      attempts.leave(first);
      assert_eq!(attempts.error(first), Some("failed"));
      attempts.leave(first);
      assert_eq!(attempts.error(first), None);
      assert_eq!(attempts.records.len(), 1);
   }

   #[test]
   fn test_reused_epoch_opens_new_record() {
      let mut attempts: Attempts<&str> = Attempts::new();
      let old = attempts.join(0);
      attempts.settle(0, || Some("old"));

      // A later attempt with the same epoch, while the old waiter has not read yet.
      let new = attempts.join(0);
      assert_ne!(old, new);
      attempts.settle(0, || Some("new"));

      assert_eq!(attempts.error(old), Some("old"));
      assert_eq!(attempts.error(new), Some("new"));
   }

   #[test]
   fn test_settle_without_waiters() {
      let mut attempts: Attempts<&str> = Attempts::new();
      attempts.settle(0, || panic!("no record, nothing to clone"));
      assert!(attempts.records.is_empty());
   }
}
