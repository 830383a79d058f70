//! Core collaborator contracts the controller drives.
//!
//! The worker runtime and the IPC channel are external collaborators with
//! fixed contracts.  The controller only sequences them through their
//! lifecycles; it never looks inside either one.

use std::time::Duration;

/// How the service run was initiated.
///
/// Different platform plumbing may apply depending on whether we were run
/// straight from `main` or dispatched by a service manager, but the
/// controller itself only records it.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RunReason {
    /// Run directly from the process entry point.
    Inline,

    /// Run under a platform service manager.
    ServiceManager,
}

impl RunReason {
    /// Returns the string representation for log fields.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inline => "inline",
            Self::ServiceManager => "service-manager",
        }
    }
}

/// A single inbound client connection handed over by the channel.
///
/// This is a one-shot value.  Ownership moves to the worker when it is
/// forwarded; it is never retained across dispatch iterations.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ClientConnection {
    /// Name of the connecting user.
    pub user_name: String,

    /// Transport endpoint carrying messages from the client to the worker.
    pub client_to_worker: String,

    /// Transport endpoint carrying messages from the worker to the client.
    pub worker_to_client: String,

    /// Language/protocol identifier the client speaks.
    pub language: String,
}

/// The managed execution engine the controller starts, monitors and stops.
///
/// Exactly one worker handle is live during a run.  All calls are made from
/// the controller's run thread.
pub trait Worker: Send {
    /// Begins asynchronous startup.  Does not block for full readiness;
    /// callers observe progress through [`Worker::is_busy`].
    fn start(&self);

    /// Requests the worker stop.  Asynchronous, like [`Worker::start`].
    fn stop(&self);

    /// Runs the worker's configure-only mode instead of normal service.
    fn configure(&self);

    /// Returns whether the worker has reached (and remains in) its running
    /// state.
    fn is_running(&self) -> bool;

    /// Returns whether the worker has stopped or is in the process of
    /// stopping.
    fn is_stopped(&self) -> bool;

    /// Blocks up to `timeout` and returns whether the worker is still
    /// finishing asynchronous work.  Callers re-invoke this in a loop,
    /// emitting progress between calls.
    fn is_busy(&self, timeout: Duration) -> bool;

    /// Hands a freshly accepted client connection to the worker, consuming
    /// it.
    fn user_connection(&self, conn: ClientConnection);
}

/// Constructor for [`Worker`] handles.
pub trait WorkerFactory: Send + Sync {
    /// The worker type produced.
    type Worker: Worker;

    /// Creates a worker.  Failure here is fatal to a run; the error is
    /// logged and reported, never retried.
    fn create(&self) -> anyhow::Result<Self::Worker>;
}

/// The local IPC endpoint accepting client connections.
///
/// All methods take `&self`: `close` must be callable from another thread
/// while a [`Channel::read_message`] is blocked, so implementations use
/// interior mutability.
pub trait Channel: Send + Sync {
    /// Blocks until the next client connection arrives.  Returns `None` if
    /// the read failed or the channel was closed out from under it.
    fn read_message(&self) -> Option<ClientConnection>;

    /// Closes the channel immediately, interrupting any blocked read.
    fn close(&self);

    /// Requests a deferred close: any connection currently in flight is
    /// serviced, then the channel closes itself.
    fn lazy_close(&self);

    /// Cancels a pending lazy close.  Only effective while the channel has
    /// not yet actually closed.
    fn cancel_lazy_close(&self);

    /// Returns whether the channel has closed.
    fn is_closed(&self) -> bool;
}

/// Constructor for [`Channel`] handles.
///
/// Invoked once at startup and again whenever the in-loop recovery path
/// replaces a closed channel.
pub trait ChannelFactory: Send + Sync {
    /// The channel type produced.
    type Channel: Channel + 'static;

    /// Creates a channel.  Failure at startup degrades the run (the loop is
    /// never entered); failure during recovery escalates to stopping the
    /// worker.
    fn create(&self) -> anyhow::Result<Self::Channel>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_reason_as_str() {
        assert_eq!(RunReason::Inline.as_str(), "inline");
        assert_eq!(RunReason::ServiceManager.as_str(), "service-manager");
    }
}
