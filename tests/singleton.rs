use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use lazy_singleton::{Error, InstanceId, Printer, Release, ReleaseKind, Result, Singleton};

struct Plain {
   value: u32,
}

impl Release for Plain {}

fn make_plain() -> Result<Plain> {
   Ok(Plain { value: 42 })
}

fn make_slow_plain() -> Result<Plain> {
   thread::sleep(Duration::from_millis(20));
   Ok(Plain { value: 7 })
}

#[test]
fn test_not_constructed_before_first_access() {
   let singleton = Singleton::new(make_plain);
   assert_eq!(singleton.constructions(), 0);
   assert!(!singleton.is_constructed());
   assert!(singleton.try_get().is_none());

   assert_eq!(singleton.get_instance().unwrap().value, 42);
   assert_eq!(singleton.constructions(), 1);
   assert!(singleton.is_constructed());
}

#[test]
fn test_sequential_calls_construct_once() {
   let singleton = Singleton::new(make_plain);
   let first = singleton.get_instance().unwrap();
   for _ in 0..1000 {
      assert!(std::ptr::eq(first, singleton.get_instance().unwrap()));
   }
   assert_eq!(singleton.constructions(), 1);
   assert_eq!(singleton.attempts(), 1);
}

#[test]
fn test_racing_first_callers_construct_once() {
   const CALLERS: usize = 100;
   let singleton = Arc::new(Singleton::new(make_slow_plain));
   let barrier = Arc::new(Barrier::new(CALLERS));

   let threads: Vec<_> = (0..CALLERS)
      .map(|_| {
         let singleton = Arc::clone(&singleton);
         let barrier = Arc::clone(&barrier);
         thread::spawn(move || {
            barrier.wait();
            InstanceId::of(singleton.get_instance().unwrap())
         })
      })
      .collect();

   let ids: Vec<InstanceId> = threads.into_iter().map(|t| t.join().unwrap()).collect();
   assert!(ids.iter().all(|id| *id == ids[0]));
   assert_eq!(Some(ids[0]), singleton.instance_id());
   assert_eq!(singleton.constructions(), 1);
   assert_eq!(singleton.attempts(), 1);
}

#[test]
fn test_identity_across_threads_at_any_time() {
   let singleton = Arc::new(Singleton::new(make_plain));
   let early = InstanceId::of(singleton.get_instance().unwrap());

   let late: Vec<_> = (0..8)
      .map(|i| {
         let singleton = Arc::clone(&singleton);
         thread::spawn(move || {
            thread::sleep(Duration::from_millis(i * 5));
            InstanceId::of(singleton.get_instance().unwrap())
         })
      })
      .collect();

   for handle in late {
      assert_eq!(handle.join().unwrap(), early);
   }
}

static FLAKY_READY: AtomicBool = AtomicBool::new(false);

struct Flaky;

impl Release for Flaky {}

fn make_flaky() -> Result<Flaky> {
   if FLAKY_READY.load(Ordering::SeqCst) {
      Ok(Flaky)
   } else {
      Err(Error::construct::<Flaky>("not ready"))
   }
}

#[test]
fn test_failed_construction_is_retried() {
   let singleton = Singleton::new(make_flaky);

   let err = singleton.get_instance().err().expect("first attempt must fail");
   assert!(matches!(err, Error::Construct { .. }));
   assert!(err.to_string().contains("not ready"));
   assert!(!singleton.is_constructed());
   assert_eq!(singleton.constructions(), 0);

   assert!(singleton.get_instance().is_err());
   assert_eq!(singleton.attempts(), 2);

   FLAKY_READY.store(true, Ordering::SeqCst);
   assert!(singleton.get_instance().is_ok());
   assert_eq!(singleton.attempts(), 3);
   assert_eq!(singleton.constructions(), 1);
}

static SLOW_FAILURES: AtomicUsize = AtomicUsize::new(0);

struct NeverReady;

impl Release for NeverReady {}

fn make_never_ready() -> Result<NeverReady> {
   SLOW_FAILURES.fetch_add(1, Ordering::SeqCst);
   thread::sleep(Duration::from_millis(500));
   Err(Error::construct::<NeverReady>("backend unavailable"))
}

#[test]
fn test_racing_callers_observe_same_failure() {
   let singleton = Arc::new(Singleton::new(make_never_ready));

   let first = {
      let singleton = Arc::clone(&singleton);
      thread::spawn(move || singleton.get_instance().err().map(|e| e.to_string()))
   };
   while SLOW_FAILURES.load(Ordering::SeqCst) == 0 {
      thread::yield_now();
   }

   let waiters: Vec<_> = (0..4)
      .map(|_| {
         let singleton = Arc::clone(&singleton);
         thread::spawn(move || singleton.get_instance().err().map(|e| e.to_string()))
      })
      .collect();

   let expected = first.join().unwrap().expect("constructor fails");
   for waiter in waiters {
      assert_eq!(waiter.join().unwrap().as_deref(), Some(expected.as_str()));
   }
   assert_eq!(singleton.attempts(), 1);
   assert!(!singleton.is_constructed());
}

static RELEASES: AtomicUsize = AtomicUsize::new(0);
static FINALIZED: AtomicUsize = AtomicUsize::new(0);

struct Handle;

impl Release for Handle {
   fn release(&self, kind: ReleaseKind) {
      RELEASES.fetch_add(1, Ordering::SeqCst);
      if kind == ReleaseKind::Finalizer {
         FINALIZED.fetch_add(1, Ordering::SeqCst);
      }
   }
}

fn make_handle() -> Result<Handle> {
   Ok(Handle)
}

// Both release scenarios share the counters above, so they run in one test.
#[test]
fn test_release_runs_once() {
   // Explicit dispose, twice, then drop.
   let singleton = Singleton::new(make_handle);
   assert!(!singleton.dispose(), "nothing to dispose before construction");
   singleton.get_instance().unwrap();
   assert!(singleton.dispose());
   assert!(!singleton.dispose());
   assert!(singleton.is_disposed());
   assert!(singleton.get_instance().is_ok());
   drop(singleton);
   assert_eq!(RELEASES.load(Ordering::SeqCst), 1);
   assert_eq!(FINALIZED.load(Ordering::SeqCst), 0);

   // No dispose: dropping the owner finalizes.
   let singleton = Singleton::new(make_handle);
   singleton.get_instance().unwrap();
   drop(singleton);
   assert_eq!(RELEASES.load(Ordering::SeqCst), 2);
   assert_eq!(FINALIZED.load(Ordering::SeqCst), 1);

   // Never constructed: nothing to release.
   drop(Singleton::new(make_handle));
   assert_eq!(RELEASES.load(Ordering::SeqCst), 2);
}

#[test]
fn test_printer_dispose_is_idempotent() {
   let singleton = Printer::singleton();
   let printer = singleton.get_instance().unwrap();
   singleton.dispose();
   singleton.dispose();
   assert_eq!(printer.releases(), 1);
}

static GLOBAL_PLAIN: Singleton<Plain> = Singleton::new(make_plain);

#[test]
fn test_static_singleton() {
   let a = thread::spawn(|| InstanceId::of(GLOBAL_PLAIN.get_instance().unwrap()));
   let b = thread::spawn(|| InstanceId::of(GLOBAL_PLAIN.get_instance().unwrap()));
   assert_eq!(a.join().unwrap(), b.join().unwrap());
   assert_eq!(GLOBAL_PLAIN.constructions(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_async_callers_share_instance() {
   let singleton = Arc::new(Singleton::new(make_slow_plain));
   let tasks: Vec<_> = (0..32)
      .map(|_| {
         let singleton = Arc::clone(&singleton);
         tokio::spawn(async move { InstanceId::of(singleton.get_instance_async().await.unwrap()) })
      })
      .collect();

   let mut ids = Vec::new();
   for task in tasks {
      ids.push(task.await.unwrap());
   }
   assert!(ids.iter().all(|id| *id == ids[0]));
   assert_eq!(singleton.constructions(), 1);
}
