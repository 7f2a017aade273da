use std::io;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use lazy_singleton::driver::{self, DriverConfig};
use lazy_singleton::Printer;
use tokio::signal;
use tokio::sync::oneshot;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(
   name = "lazy-singleton",
   about = "Run workers that share one lazily constructed printer"
)]
struct Cli {
   /// Seconds between two lines of the same worker.
   #[arg(
      long,
      env = "LAZY_SINGLETON_INTERVAL",
      default_value_t = 5,
      value_name = "SECONDS",
      value_parser = clap::value_parser!(u64).range(1..)
   )]
   interval: u64,

   /// Worker labels (repeatable or comma separated).
   #[arg(long = "label", value_delimiter = ',', default_values = ["1", "2"], value_name = "LABEL")]
   labels: Vec<String>,

   /// Stop after this many seconds instead of waiting for input.
   #[arg(long, env = "LAZY_SINGLETON_DURATION", value_name = "SECONDS")]
   duration: Option<u64>,

   /// Lines each worker writes before it stops on its own.
   #[arg(long, value_name = "N")]
   iterations: Option<u64>,
}

impl Cli {
   fn driver_config(&self) -> DriverConfig {
      DriverConfig {
         labels: self.labels.clone(),
         interval: Duration::from_secs(self.interval),
         iterations: self.iterations,
         duration: self.duration.map(Duration::from_secs),
      }
   }
}

fn init_tracing() {
   let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
   let _ = fmt().with_env_filter(env_filter).with_writer(io::stderr).try_init();
}

/// Resolves when a line is read from stdin. Never resolves once stdin is closed.
///
/// The read runs on a detached thread so an idle stdin never holds up shutdown.
async fn stdin_line() {
   let (tx, rx) = oneshot::channel();
   thread::spawn(move || {
      let mut line = String::new();
      if matches!(io::stdin().read_line(&mut line), Ok(n) if n > 0) {
         let _ = tx.send(());
      }
   });
   if rx.await.is_err() {
      std::future::pending::<()>().await;
   }
}

#[tokio::main]
async fn main() -> Result<()> {
   init_tracing();

   let cli = Cli::parse();
   let config = cli.driver_config();
   if config.labels.is_empty() {
      bail!("at least one worker label is required");
   }

   let singleton = Printer::global_singleton();
   info!(workers = config.labels.len(), interval = ?config.interval, "starting workers");

   let requested = async {
      tokio::select! {
         _ = stdin_line() => {
            info!("input received");
            Ok(())
         }
         res = signal::ctrl_c() => {
            if res.is_ok() {
               info!("interrupted");
            }
            res
         }
      }
   };
   let report = driver::run(&config, singleton, |_| io::stdout(), requested)
      .await
      .context("driver failed")?;

   for worker in &report.workers {
      info!(
         label = %worker.label,
         lines = worker.lines,
         instance = %worker.instance,
         "worker report"
      );
   }
   match driver::shared_instance(&report.workers) {
      Some(instance) => info!(
         %instance,
         constructions = singleton.constructions(),
         "all workers shared one printer"
      ),
      None => warn!("workers observed different printers"),
   }
   Ok(())
}
