//! Lifecycle state reporting.
//!
//! Every controller transition goes through a [`StateReporter`].  The
//! default [`LogReporter`] writes to the logs and keeps the externally
//! observable running flag; platforms with a native service manager plug in
//! a [`ControlPlane`] to also receive each notification.

use std::{
    sync::atomic::{AtomicBool, AtomicU32, Ordering},
    time::Duration,
};

use serde::Serialize;
use tracing::{debug, info};

/// Failure exit code communicated with an errored report.
pub const ERRORED_EXIT_CODE: i32 = 10;

/// Externally observable lifecycle state of the service.
///
/// Reporting the same state repeatedly is permitted and is used for progress
/// pings during long busy-polls.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
pub enum ServiceState {
    /// Startup in progress.  May be reported any number of times before the
    /// service enters its running state.
    Starting,

    /// Accepting client connections.
    Running,

    /// Shutdown in progress.  May be reported any number of times before
    /// the service enters its stopped state.
    Stopping,

    /// Shut down cleanly.
    Stopped,

    /// Stopped because a startup precondition failed.
    Errored,
}

impl ServiceState {
    /// Returns the string representation for log fields.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Errored => "errored",
        }
    }
}

/// One state transition notification as forwarded to a [`ControlPlane`].
#[derive(Copy, Clone, Debug, Serialize)]
pub struct StateNotification {
    /// The reported state.
    pub state: ServiceState,

    /// Progress checkpoint, incremented on each starting/stopping report so
    /// an external watchdog can see the service is not hung.
    pub checkpoint: u32,

    /// Process exit code to communicate, nonzero only for
    /// [`ServiceState::Errored`].
    pub exit_code: i32,

    /// Hint for how long the control plane should wait before treating the
    /// service as unresponsive.
    pub wait_hint: Duration,
}

/// Destination for state notifications beyond the logs, e.g. a platform
/// service control manager.
///
/// Object-safe so heterogeneous integrations can sit behind one reporter.
pub trait ControlPlane: Send + Sync {
    /// Receives one notification per reported transition.
    fn notify(&self, n: StateNotification);
}

/// Reports controller lifecycle transitions.
///
/// Calls are idempotent per state and strictly ordered per transition
/// direction: starting is never reported after running within one startup
/// phase, stopping never after stopped within one shutdown phase.
pub trait StateReporter: Send + Sync {
    /// Reports that startup is in progress.
    fn report_starting(&self);

    /// Reports that the service is running and accepting connections.
    fn report_running(&self);

    /// Reports that shutdown is in progress.
    fn report_stopping(&self);

    /// Reports that the service has stopped cleanly.
    fn report_stopped(&self);

    /// Reports that the service stopped because startup preconditions were
    /// missing.  Clears the running flag and communicates a failure exit
    /// code out of band.
    fn report_errored(&self);

    /// Returns whether the service is currently running.
    fn is_running(&self) -> bool;
}

/// Default [`StateReporter`]: logs each transition and optionally forwards
/// it to a [`ControlPlane`].
///
/// Running/stopped/errored log at INFO, the in-progress states at DEBUG so
/// repeated progress pings don't flood the logs.
pub struct LogReporter {
    running: AtomicBool,
    checkpoint: AtomicU32,
    wait_hint: Duration,
    control: Option<Box<dyn ControlPlane>>,
}

impl LogReporter {
    /// Constructs a log-only reporter.
    ///
    /// `wait_hint` should comfortably cover one busy-poll interval; callers
    /// conventionally pass twice the busy timeout.
    pub fn new(wait_hint: Duration) -> Self {
        Self {
            running: AtomicBool::new(false),
            checkpoint: AtomicU32::new(0),
            wait_hint,
            control: None,
        }
    }

    /// Attaches a control plane to forward every notification to.
    pub fn with_control_plane(mut self, control: Box<dyn ControlPlane>) -> Self {
        self.control = Some(control);
        self
    }

    fn report(&self, state: ServiceState, exit_code: i32) {
        let checkpoint = match state {
            ServiceState::Starting | ServiceState::Stopping => {
                self.checkpoint.fetch_add(1, Ordering::Relaxed) + 1
            }
            _ => self.checkpoint.load(Ordering::Relaxed),
        };

        self.running
            .store(state == ServiceState::Running, Ordering::Release);

        if let Some(control) = &self.control {
            control.notify(StateNotification {
                state,
                checkpoint,
                exit_code,
                wait_hint: self.wait_hint,
            });
        }
    }
}

impl StateReporter for LogReporter {
    fn report_starting(&self) {
        debug!("service starting");
        self.report(ServiceState::Starting, 0);
    }

    fn report_running(&self) {
        info!("service started");
        self.report(ServiceState::Running, 0);
    }

    fn report_stopping(&self) {
        debug!("service stopping");
        self.report(ServiceState::Stopping, 0);
    }

    fn report_stopped(&self) {
        info!("service stopped");
        self.report(ServiceState::Stopped, 0);
    }

    fn report_errored(&self) {
        info!(exit_code = ERRORED_EXIT_CODE, "service stopped");
        self.report(ServiceState::Errored, ERRORED_EXIT_CODE);
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for LogReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogReporter")
            .field("running", &self.running)
            .field("checkpoint", &self.checkpoint)
            .field("wait_hint", &self.wait_hint)
            .field("control", &self.control.as_ref().map(|_| "<control plane>"))
            .finish()
    }
}
