//! Atomic init state shared by [`InstanceCell`](crate::InstanceCell) and everything built on it.
//!
//! The whole state fits in one `AtomicU8`:
//! - Bit 0: DONE - the instance is constructed and published
//! - Bit 1: LOCKED - a caller holds the construction lock
//! - Bit 2: WAITING - at least one caller is parked on the state word
//! - Bits 3-7: EPOCH - attempt counter, bumped whenever an attempt commits or is abandoned
//!
//! Readers take the lock-free path by checking DONE with `Acquire` ordering. Callers
//! that lose the construction race park on the state word through `parking_lot_core`
//! and are woken when the attempt commits or is abandoned. The epoch lets a woken
//! caller tell "the attempt I waited on failed" apart from a spurious wakeup.

use core::mem;
use core::sync::atomic::{AtomicU8, Ordering};

use parking_lot_core::{DEFAULT_PARK_TOKEN, DEFAULT_UNPARK_TOKEN};
use tokio::runtime::{Handle, RuntimeFlavor};

/// Number of scheduler yields an async caller spends before parking a worker thread.
const YIELD_ROUNDS: usize = 64;

/// How the attempt a caller was parked on ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Settled {
   /// The instance was published.
   Done,
   /// The attempt was abandoned and the cell is empty again.
   Abandoned,
}

/// Atomic state word guarding one construction.
#[repr(transparent)]
pub(crate) struct InitLock(AtomicU8);

impl InitLock {
   const DONE: u8 = 1;
   const LOCKED: u8 = 2;
   const WAITING: u8 = 4;
   const EPOCH_1: u8 = 8;
   const EPOCH_MASK: u8 = !(Self::DONE | Self::LOCKED | Self::WAITING);

   #[inline(always)]
   const fn next_epoch(state: u8) -> u8 {
      (state & Self::EPOCH_MASK).wrapping_add(Self::EPOCH_1) & Self::EPOCH_MASK
   }

   #[inline(always)]
   pub(crate) const fn epoch_of(state: u8) -> u8 {
      state & Self::EPOCH_MASK
   }

   /// Uninitialized, unlocked, epoch 0.
   #[inline]
   pub(crate) const fn new() -> Self {
      Self(AtomicU8::new(0))
   }

   /// Already initialized.
   #[inline]
   pub(crate) const fn done() -> Self {
      Self(AtomicU8::new(Self::DONE))
   }

   fn notify_all(&self) {
      // SAFETY: the key is the address of the state word, the same key `wait` parks on.
      unsafe {
         parking_lot_core::unpark_all(self.0.as_ptr() as usize, DEFAULT_UNPARK_TOKEN);
      }
   }

   /// Parks the caller while the state word still equals `expected`.
   fn wait(&self, expected: u8) {
      // SAFETY: see `notify_all`. The validate closure runs under the parking lot's
      // bucket lock, so a wakeup between our load and the park cannot be lost.
      unsafe {
         let _ = parking_lot_core::park(
            self.0.as_ptr() as usize,
            || self.0.load(Ordering::Acquire) == expected,
            || {},
            |_, _| {},
            DEFAULT_PARK_TOKEN,
            None,
         );
      }
   }

   /// Publishes the instance: sets DONE, clears LOCKED and WAITING, bumps the epoch.
   ///
   /// Returns `true` if the state was not DONE before.
   pub(crate) fn set_done(&self) -> bool {
      let current = self.0.load(Ordering::Relaxed);
      let next = Self::DONE | Self::next_epoch(current);
      // Release pairs with the Acquire loads in `is_done` and `park_on`, making the
      // written instance visible to every caller that observes DONE.
      let prev = self.0.swap(next, Ordering::Release);
      if prev & Self::WAITING != 0 {
         self.notify_all();
      }
      prev & Self::DONE == 0
   }

   /// Returns the cell to uninitialized and bumps the epoch.
   ///
   /// Returns `true` if the state was DONE before.
   pub(crate) fn set_uninit(&self) -> bool {
      let current = self.0.load(Ordering::Relaxed);
      let prev = self.0.swap(Self::next_epoch(current), Ordering::Release);
      if prev & Self::WAITING != 0 {
         self.notify_all();
      }
      prev & Self::DONE != 0
   }

   #[inline]
   pub(crate) fn is_done(&self, ordering: Ordering) -> bool {
      self.0.load(ordering) & Self::DONE != 0
   }

   /// One step of lock acquisition.
   ///
   /// - `Ok(None)`: already DONE.
   /// - `Ok(Some(guard))`: LOCKED was free and is now ours.
   /// - `Err(state)`: someone else holds LOCKED. Unless `nowait` is set, WAITING is
   ///   set in the returned state.
   pub(crate) fn lock_step(&self, nowait: bool) -> Result<Option<InitGuard<'_>>, u8> {
      loop {
         let current = self.0.load(Ordering::Acquire);
         if current & Self::DONE != 0 {
            return Ok(None);
         }

         if current & Self::LOCKED == 0 {
            match self.0.compare_exchange_weak(
               current,
               current | Self::LOCKED,
               Ordering::Acquire,
               Ordering::Relaxed,
            ) {
               Ok(_) => return Ok(Some(InitGuard::new(self, Self::epoch_of(current)))),
               Err(_) => {
                  std::hint::spin_loop();
                  continue;
               }
            }
         }

         if !nowait && current & Self::WAITING == 0 {
            let flagged = current | Self::WAITING;
            match self
               .0
               .compare_exchange_weak(current, flagged, Ordering::Relaxed, Ordering::Relaxed)
            {
               Ok(_) => return Err(flagged),
               Err(_) => {
                  std::hint::spin_loop();
                  continue;
               }
            }
         }

         return Err(current);
      }
   }

   /// Returns `true` while the attempt with `epoch` still holds the lock.
   pub(crate) fn is_held_at(&self, epoch: u8) -> bool {
      Self::settled(self.0.load(Ordering::Acquire), epoch).is_none()
   }

   /// Classifies the state as seen by a caller waiting on attempt `epoch`.
   ///
   /// `None` means that attempt is still running.
   fn settled(state: u8, epoch: u8) -> Option<Settled> {
      if state & Self::DONE != 0 {
         Some(Settled::Done)
      } else if state & Self::LOCKED == 0 || Self::epoch_of(state) != epoch {
         // Every unlock bumps the epoch, so either check alone is enough. Both are
         // kept so that an epoch wrap-around while parked cannot park us forever.
         Some(Settled::Abandoned)
      } else {
         None
      }
   }

   /// Blocks until the attempt with `epoch` commits or is abandoned.
   pub(crate) fn park_on(&self, epoch: u8) -> Settled {
      loop {
         let current = self.0.load(Ordering::Acquire);
         if let Some(outcome) = Self::settled(current, epoch) {
            return outcome;
         }
         let flagged = current | Self::WAITING;
         if current & Self::WAITING == 0
            && self
               .0
               .compare_exchange_weak(current, flagged, Ordering::Relaxed, Ordering::Relaxed)
               .is_err()
         {
            std::hint::spin_loop();
            continue;
         }
         self.wait(flagged);
      }
   }

   /// Waits for the attempt with `epoch` from async code.
   ///
   /// Yields to the scheduler first so a constructor running on the same runtime can
   /// make progress. On a multi-threaded runtime it then parks inside `block_in_place`;
   /// on a current-thread runtime it keeps yielding.
   pub(crate) async fn park_on_async(&self, epoch: u8) -> Settled {
      let multi_thread = Handle::try_current()
         .map(|handle| handle.runtime_flavor() == RuntimeFlavor::MultiThread)
         .unwrap_or(false);

      let mut rounds = 0;
      loop {
         if let Some(outcome) = Self::settled(self.0.load(Ordering::Acquire), epoch) {
            return outcome;
         }
         tokio::task::yield_now().await;
         rounds += 1;
         if multi_thread && rounds >= YIELD_ROUNDS {
            return tokio::task::block_in_place(|| self.park_on(epoch));
         }
      }
   }

   /// Takes the construction lock only if nobody holds it and the cell is not DONE.
   pub(crate) fn try_lock(&self) -> Option<InitGuard<'_>> {
      self.lock_step(true).ok().flatten()
   }
}

/// RAII guard over the LOCKED bit.
///
/// `commit` publishes the instance. Dropping the guard instead abandons the attempt:
/// the cell goes back to uninitialized with a new epoch and all waiters are woken.
pub(crate) struct InitGuard<'a> {
   state: &'a InitLock,
   epoch: u8,
}

impl<'a> InitGuard<'a> {
   #[inline(always)]
   const fn new(state: &'a InitLock, epoch: u8) -> Self {
      Self { state, epoch }
   }

   /// Epoch of the attempt this guard protects.
   #[inline]
   pub(crate) fn epoch(&self) -> u8 {
      self.epoch
   }

   /// Marks the cell DONE and wakes waiters.
   pub(crate) fn commit(self) -> bool {
      let first = self.state.set_done();
      mem::forget(self);
      first
   }
}

impl Drop for InitGuard<'_> {
   fn drop(&mut self) {
      self.state.set_uninit();
   }
}
