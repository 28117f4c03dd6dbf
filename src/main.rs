//! GATT bridge daemon.
//!
//! Runs a [`Central`] session against a simulated peripheral fixture and
//! pumps its messages into the process log until interrupted.

use std::sync::Arc;

use gattbridge::{
   Central, HostSinks, Result,
   bluetooth::sim::SimAdapter,
   config::Config,
};
use log::{error, info, warn};
use tokio::{
   signal,
   time::{self, MissedTickBehavior},
};

#[tokio::main]
async fn main() -> Result<()> {
   env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

   info!("Starting gattbridge daemon...");

   let config = Config::load()?;
   info!(
      "Loaded configuration: pump every {} ms, {} autoconnect devices",
      config.pump_interval_ms,
      config.autoconnect.len()
   );

   let adapter = match &config.fixture {
      Some(path) => {
         info!("Loading peripherals from {}", path.display());
         SimAdapter::from_fixture(path)?
      },
      None => {
         warn!("No fixture configured, no peripherals will be found");
         SimAdapter::new()
      },
   };

   let central = Central::new(Arc::new(adapter), config.message_target());
   central.set_sinks(log_sinks());
   central.initialize();
   central.scan_for_peripherals(None);
   for address in &config.autoconnect {
      central.connect_to_peripheral(address);
   }

   let mut ticker = time::interval(config.pump_interval());
   ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
   let shutdown = signal::ctrl_c();
   tokio::pin!(shutdown);

   loop {
      tokio::select! {
         _ = ticker.tick() => {
            central.pump();
         }
         res = &mut shutdown => {
            res?;
            break;
         }
      }
   }

   info!("Shutting down gattbridge daemon...");
   central.deinitialize();

   Ok(())
}

/// Host sinks that forward every message to the process log.
fn log_sinks() -> HostSinks {
   HostSinks {
      message: Some(Box::new(|object: &str, method: &str, text: &str| {
         info!(target: "host", "{object}.{method}({text})");
      })),
      log: Some(Box::new(|text: &str| info!(target: "host", "{text}"))),
      warning: Some(Box::new(|text: &str| warn!(target: "host", "{text}"))),
      error: Some(Box::new(|text: &str| error!(target: "host", "{text}"))),
   }
}
