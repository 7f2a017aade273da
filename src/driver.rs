//! Concurrent workers that share one [`Printer`].
//!
//! Each worker fetches the printer from the singleton once, then writes one
//! `<label>: <timestamp>` line per interval until it is cancelled or has written its
//! configured number of lines. Lines from different workers interleave in no
//! particular order.
//!
//! [`run`] drives a whole session: it starts the workers, stops them when they finish,
//! when the configured duration runs out or when the caller asks, and then disposes
//! the printer.

use std::future::{self, Future};
use std::io::{self, Write};
use std::ops::Deref;
use std::time::Duration;

use chrono::Local;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::printer::Printer;
use crate::singleton::{InstanceId, Singleton};

/// Default pause between two lines of the same worker.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(5);

/// Which workers to run and how.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverConfig {
   /// One worker per label.
   pub labels: Vec<String>,
   pub interval: Duration,
   /// Lines per worker; `None` runs until cancelled.
   pub iterations: Option<u64>,
   /// How long [`run`] lets the workers go before stopping them.
   pub duration: Option<Duration>,
}

impl Default for DriverConfig {
   fn default() -> Self {
      Self {
         labels: vec!["1".to_string(), "2".to_string()],
         interval: DEFAULT_INTERVAL,
         iterations: None,
         duration: None,
      }
   }
}

impl DriverConfig {
   fn worker(&self, label: &str) -> Worker {
      Worker {
         label: label.to_string(),
         interval: self.interval,
         iterations: self.iterations,
      }
   }
}

/// What a worker did before it stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerReport {
   pub label: String,
   pub lines: u64,
   /// Identity of the printer the worker got from the singleton.
   pub instance: InstanceId,
}

/// A single labelled print loop.
#[derive(Debug, Clone)]
pub struct Worker {
   pub label: String,
   pub interval: Duration,
   pub iterations: Option<u64>,
}

impl Worker {
   fn done(&self, lines: u64) -> bool {
      self.iterations.is_some_and(|max| lines >= max)
   }

   /// Runs the print loop against `singleton`, writing lines to `out`.
   ///
   /// Returns once `cancel` fires or `iterations` lines were written. A cancelled
   /// worker stops during its sleep; it never cuts a line short.
   pub async fn run<S, W>(
      self,
      singleton: S,
      mut out: W,
      cancel: CancellationToken,
   ) -> Result<WorkerReport>
   where
      S: Deref<Target = Singleton<Printer>>,
      W: Write,
   {
      let printer = singleton.get_instance_async().await?;
      let instance = InstanceId::of(printer);
      info!(label = %self.label, %instance, "worker started");

      let mut lines = 0;
      while !self.done(lines) && !cancel.is_cancelled() {
         writeln!(out, "{}", printer.line(&self.label, Local::now()))?;
         out.flush()?;
         lines += 1;

         if self.done(lines) {
            break;
         }
         tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(self.interval) => {}
         }
      }

      info!(label = %self.label, lines, "worker stopped");
      Ok(WorkerReport {
         label: self.label,
         lines,
         instance,
      })
   }
}

/// Spawns one worker task per configured label.
///
/// `make_writer` is called once per worker with its label and returns the sink that
/// worker writes to.
pub fn spawn_workers<S, W, M>(
   config: &DriverConfig,
   singleton: S,
   mut make_writer: M,
   cancel: &CancellationToken,
) -> Vec<JoinHandle<Result<WorkerReport>>>
where
   S: Deref<Target = Singleton<Printer>> + Clone + Send + Sync + 'static,
   W: Write + Send + 'static,
   M: FnMut(&str) -> W,
{
   config
      .labels
      .iter()
      .map(|label| {
         debug!(%label, "spawning worker");
         let worker = config.worker(label);
         let out = make_writer(label);
         tokio::spawn(worker.run(singleton.clone(), out, cancel.clone()))
      })
      .collect()
}

/// Waits for every worker and collects their reports in spawn order.
///
/// Fails with the first worker error or panic encountered.
pub async fn join_workers(
   handles: Vec<JoinHandle<Result<WorkerReport>>>,
) -> Result<Vec<WorkerReport>> {
   let mut reports = Vec::with_capacity(handles.len());
   for handle in handles {
      let report = handle.await.map_err(|err| Error::Join(err.to_string()))??;
      reports.push(report);
   }
   Ok(reports)
}

/// The instance shared by all `reports`, or `None` if they disagree or are empty.
pub fn shared_instance(reports: &[WorkerReport]) -> Option<InstanceId> {
   let first = reports.first()?.instance;
   reports.iter().all(|r| r.instance == first).then_some(first)
}

/// Why [`run`] stopped the workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stop {
   /// Every worker wrote its configured number of lines.
   Finished,
   /// The configured duration ran out.
   Elapsed,
   /// The caller's stop future resolved.
   Requested,
}

/// Outcome of a [`run`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
   pub stop: Stop,
   pub workers: Vec<WorkerReport>,
}

/// Runs one worker per label until they finish, `config.duration` elapses, or
/// `stop` resolves, whichever comes first.
///
/// Workers are cancelled and joined before returning, then the printer is disposed.
/// An error from `stop` cancels the workers and is returned as is.
pub async fn run<S, W, M, F>(
   config: &DriverConfig,
   singleton: S,
   make_writer: M,
   stop: F,
) -> Result<RunReport>
where
   S: Deref<Target = Singleton<Printer>> + Clone + Send + Sync + 'static,
   W: Write + Send + 'static,
   M: FnMut(&str) -> W,
   F: Future<Output = io::Result<()>>,
{
   let cancel = CancellationToken::new();
   let handles = spawn_workers(config, singleton.clone(), make_writer, &cancel);
   let mut workers = tokio::spawn(join_workers(handles));

   let elapsed = async {
      match config.duration {
         Some(duration) => tokio::time::sleep(duration).await,
         None => future::pending().await,
      }
   };

   let outcome = tokio::select! {
      joined = &mut workers => Ok((Stop::Finished, Some(joined))),
      _ = elapsed => Ok((Stop::Elapsed, None)),
      res = stop => res.map(|()| (Stop::Requested, None)),
   };
   cancel.cancel();
   let (reason, finished) = outcome?;
   info!(?reason, "stopping workers");

   let joined = match finished {
      Some(joined) => joined,
      None => workers.await,
   };
   let reports = joined.map_err(|err| Error::Join(err.to_string()))??;

   singleton.dispose();
   Ok(RunReport {
      stop: reason,
      workers: reports,
   })
}
