//! Service lifecycle controller for a supervised worker runtime.
//!
//! This crate bridges external client processes to a managed worker runtime
//! over a local IPC channel.  It owns the full lifecycle of that worker and
//! of the channel accepting client connections: sequenced startup, the
//! accept/dispatch loop with channel recovery, and the coordinated shutdown
//! path, surviving worker failures, channel failures and concurrent stop
//! requests.
//!
//! # Shape
//!
//! The worker and the channel are external collaborators behind the
//! [`Worker`]/[`Channel`] traits; the [`ServiceController`] only sequences
//! them.  Lifecycle transitions are published through a [`StateReporter`]
//! (log-only by default, or with a [`ControlPlane`] attached for platforms
//! with a native service manager).
//!
//! ```rust,ignore
//! use warden_service::{RunReason, ServiceConfig, ServiceController, LogReporter};
//!
//! let config = ServiceConfig::from_toml_file("warden.toml")?;
//! let reporter = LogReporter::new(config.wait_hint());
//! let controller = Arc::new(ServiceController::new(config, workers, channels, reporter));
//!
//! // Service thread.
//! let ctl = controller.clone();
//! std::thread::spawn(move || ctl.run(RunReason::Inline));
//!
//! // Any other thread may stop it.
//! controller.stop(false);
//! ```
//!
//! # Concurrency discipline
//!
//! One dedicated thread runs [`ServiceController::run`] end to end.  The
//! single mutable channel slot sits behind one mutex; the dispatch loop's
//! blocking receive deliberately happens outside it so a concurrent forced
//! stop can interrupt the wait.  There is no cancellation token anywhere:
//! cancellation is closing the channel and/or stopping the worker, and
//! bounded busy-polls are the only waits.

// Dev-dependency used by the integration tests only.
#[cfg(test)]
use tracing_subscriber as _;

mod config;
pub use config::ServiceConfig;

mod controller;
pub use controller::ServiceController;

mod errors;
pub use errors::ServiceError;

mod reporter;
pub use reporter::{
    ControlPlane, ERRORED_EXIT_CODE, LogReporter, ServiceState, StateNotification, StateReporter,
};

pub mod test_utils;

mod types;
pub use types::{
    Channel, ChannelFactory, ClientConnection, RunReason, Worker, WorkerFactory,
};
