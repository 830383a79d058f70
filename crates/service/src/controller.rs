//! Service lifecycle controller.
//!
//! One dedicated thread drives [`ServiceController::run`] end to end:
//! startup sequencing, the connection dispatch loop with channel recovery,
//! and the coordinated shutdown path.  Any number of other threads may call
//! [`ServiceController::stop`] or [`ServiceController::suspend`]
//! concurrently; the single mutable channel slot is the only shared state
//! and is guarded by one mutex.

use std::{mem, sync::Arc, time::Duration};

use parking_lot::Mutex;
use tracing::{debug, error, info, info_span, warn};

use crate::{
    config::ServiceConfig,
    reporter::StateReporter,
    types::{Channel, ChannelFactory, RunReason, Worker, WorkerFactory},
};

/// Orchestrates the worker runtime and the IPC channel through one service
/// lifetime.
///
/// The channel slot is locked for every read or replacement by any thread
/// other than the dispatch loop's own receive.  The blocking receive itself
/// deliberately happens outside the lock so a concurrent forced stop can
/// close the channel under it and interrupt the wait.
pub struct ServiceController<WF, CF, R>
where
    WF: WorkerFactory,
    CF: ChannelFactory,
    R: StateReporter,
{
    config: ServiceConfig,
    workers: WF,
    channels: CF,
    reporter: R,

    /// The single mutable channel slot.  `None` before startup, after
    /// cleanup, and transiently while a closed channel is being replaced.
    channel: Mutex<Option<Arc<CF::Channel>>>,
}

impl<WF, CF, R> ServiceController<WF, CF, R>
where
    WF: WorkerFactory,
    CF: ChannelFactory,
    R: StateReporter,
{
    /// Constructs a controller around its collaborators.
    pub fn new(config: ServiceConfig, workers: WF, channels: CF, reporter: R) -> Self {
        Self {
            config,
            workers,
            channels,
            reporter,
            channel: Mutex::new(None),
        }
    }

    /// The reporter this controller publishes transitions through.
    pub fn reporter(&self) -> &R {
        &self.reporter
    }

    /// Returns whether the service is currently running and able to accept
    /// client connections.
    pub fn is_running(&self) -> bool {
        self.reporter.is_running()
    }

    /// Runs the service, returning once it has stopped.
    ///
    /// All outcomes are communicated through the reporter; nothing escapes
    /// to the caller.  The worker and channel handles are destroyed on every
    /// exit path.
    pub fn run(&self, reason: RunReason) {
        let span = info_span!(
            "service",
            name = %self.config.service_name,
            reason = reason.as_str()
        );
        let _guard = span.enter();

        let busy_timeout = self.config.busy_timeout();
        self.reporter.report_starting();

        // Worker creation failure is fatal: report and bail, no retry.
        let worker = match self.workers.create() {
            Ok(worker) => worker,
            Err(e) => {
                error!(%e, "could not create worker");
                self.reporter.report_errored();
                return;
            }
        };
        worker.start();

        // Channel creation failure is only degrading at this point; the
        // startup check below turns it into an errored report.
        match self.channels.create() {
            Ok(channel) => *self.channel.lock() = Some(Arc::new(channel)),
            Err(e) => error!(%e, "could not create channel"),
        }

        // The worker initializes asynchronously.  Block in timeout-sized
        // increments, repeating the starting report so an external watchdog
        // doesn't consider us hung.
        while worker.is_busy(busy_timeout) {
            self.reporter.report_starting();
        }

        if self.channel.lock().is_some() && worker.is_running() {
            self.reporter.report_running();
            self.dispatch(&worker, busy_timeout);
            self.reporter.report_stopping();
            while worker.is_busy(busy_timeout) {
                self.reporter.report_stopping();
            }
            self.reporter.report_stopped();
        } else {
            self.reporter.report_errored();
        }

        // Cleanup: drop the channel handle, then the worker.  After a
        // suspend the slot lock is wedged on purpose; the handle is
        // abandoned along with it.
        if let Some(mut slot) = self.channel.try_lock_for(busy_timeout) {
            *slot = None;
        } else {
            warn!("channel slot lock wedged, abandoning channel handle");
        }
        drop(worker);
    }

    /// The steady-state accept/dispatch cycle.
    ///
    /// Exits once the worker reports busy or no longer running, which both
    /// the read-failure path and a stop request bring about.
    fn dispatch(&self, worker: &WF::Worker, busy_timeout: Duration) {
        loop {
            debug!("waiting for client connection");
            let conn = self.current_channel().and_then(|ch| ch.read_message());

            if let Some(conn) = conn {
                info!(user = %conn.user_name, "connection received");
                debug!(
                    client_to_worker = %conn.client_to_worker,
                    worker_to_client = %conn.worker_to_client,
                    language = %conn.language,
                    "connection endpoints"
                );
                worker.user_connection(conn);

                if !worker.is_stopped() {
                    // A new client arrived, so a deferred close should not
                    // proceed.
                    if let Some(ch) = self.current_channel() {
                        ch.cancel_lazy_close();
                    }
                    // A stop may have landed between the check and the
                    // cancel; restore the lazy close.  A third stop landing
                    // right after this re-check is not handled.
                    if worker.is_stopped() {
                        self.stop(false);
                    }
                }

                let mut slot = self.channel.lock();
                if slot.as_ref().is_none_or(|ch| ch.is_closed()) {
                    info!("channel closed with pending connection, reopening");
                    *slot = None;
                    match self.channels.create() {
                        Ok(channel) => {
                            *slot = Some(Arc::new(channel));
                            self.reporter.report_running();
                        }
                        Err(e) => {
                            error!(%e, "could not recreate channel, stopping worker");
                            worker.stop();
                        }
                    }
                }
            } else {
                error!("stopping worker after failed channel read");
                worker.stop();
            }

            if worker.is_busy(busy_timeout) || !worker.is_running() {
                break;
            }
        }
    }

    /// Clones the channel handle out of the slot, holding the lock only for
    /// the clone.
    ///
    /// A wedged slot lock (a suspend leaked it) counts as an absent
    /// channel, which callers treat as a failed read.
    fn current_channel(&self) -> Option<Arc<CF::Channel>> {
        self.channel
            .try_lock_for(self.config.busy_timeout())
            .and_then(|slot| (*slot).clone())
    }

    /// Requests the service stop.
    ///
    /// With `force` the channel is closed immediately, interrupting a
    /// blocked receive in the dispatch loop.  Without it the channel closes
    /// lazily once idle and the loop discovers that asynchronously.
    ///
    /// Callable from any thread.
    pub fn stop(&self, force: bool) {
        let slot = self.channel.lock();
        if force {
            self.reporter.report_stopping();
            if let Some(ch) = slot.as_ref() {
                ch.close();
            }
        } else if let Some(ch) = slot.as_ref() {
            ch.lazy_close();
        }
    }

    /// Breaks the service for hang-detection testing.
    ///
    /// Closes the channel and then never releases the slot lock, so every
    /// later [`ServiceController::stop`] blocks forever.  This must be a
    /// real lock leak, not a simulation: it exists to exercise external
    /// deadlock-recovery tooling against a genuinely hung controller.  Do
    /// not call it outside a test harness.
    pub fn suspend(&self) {
        self.reporter.report_stopping();
        let slot = self.channel.lock();
        if let Some(ch) = slot.as_ref() {
            ch.close();
        }
        mem::forget(slot);
    }

    /// Runs the worker's configure-only mode and tears it down again.
    ///
    /// No channel is created and no state is reported; this is the
    /// out-of-service maintenance path.
    pub fn configure(&self) {
        match self.workers.create() {
            Ok(worker) => worker.configure(),
            Err(e) => error!(%e, "could not create worker"),
        }
    }
}

impl<WF, CF, R> std::fmt::Debug for ServiceController<WF, CF, R>
where
    WF: WorkerFactory,
    CF: ChannelFactory,
    R: StateReporter,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceController")
            .field("config", &self.config)
            .field("running", &self.is_running())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        reporter::ServiceState,
        test_utils::{FakeChannel, FakeChannelFactory, FakeWorker, FakeWorkerFactory, RecordingReporter},
        types::ClientConnection,
    };

    fn test_config() -> ServiceConfig {
        ServiceConfig {
            service_name: "test".to_owned(),
            busy_timeout_ms: 10,
        }
    }

    fn conn(user: &str) -> ClientConnection {
        ClientConnection {
            user_name: user.to_owned(),
            client_to_worker: format!("\\\\.\\pipe\\{user}-in"),
            worker_to_client: format!("\\\\.\\pipe\\{user}-out"),
            language: "rlang".to_owned(),
        }
    }

    #[test]
    fn test_worker_create_failure_is_fatal() {
        let channels = FakeChannelFactory::new();
        let reporter = RecordingReporter::default();
        let ctl = ServiceController::new(
            test_config(),
            FakeWorkerFactory::failing(),
            channels,
            reporter.clone(),
        );

        ctl.run(RunReason::Inline);

        assert_eq!(
            reporter.reports(),
            vec![ServiceState::Starting, ServiceState::Errored],
        );
        assert_eq!(ctl.channels.created(), 0, "test: no channel created");
        assert!(!ctl.is_running());
    }

    #[test]
    fn test_channel_create_failure_degrades_startup() {
        let worker = FakeWorker::new();
        let reporter = RecordingReporter::default();
        let ctl = ServiceController::new(
            test_config(),
            FakeWorkerFactory::with_workers([worker.clone()]),
            FakeChannelFactory::new(),
            reporter.clone(),
        );

        ctl.run(RunReason::Inline);

        let reports = reporter.reports();
        assert_eq!(reports.last(), Some(&ServiceState::Errored));
        assert!(!reports.contains(&ServiceState::Running));
        assert!(worker.connections().is_empty(), "test: loop never entered");
    }

    #[test]
    fn test_worker_not_running_after_busy_wait_errors() {
        let worker = FakeWorker::new().with_start_failing();
        worker.script_busy([true, true, true]);

        let channel = FakeChannel::new().failing_when_drained();
        let reporter = RecordingReporter::default();
        let ctl = ServiceController::new(
            test_config(),
            FakeWorkerFactory::with_workers([worker.clone()]),
            FakeChannelFactory::with_channels([channel]),
            reporter.clone(),
        );

        ctl.run(RunReason::Inline);

        let reports = reporter.reports();
        // One report up front plus one per busy poll.
        let starting = reports
            .iter()
            .filter(|s| **s == ServiceState::Starting)
            .count();
        assert_eq!(starting, 4, "test: progress reported per poll");
        assert_eq!(reports.last(), Some(&ServiceState::Errored));
        assert!(!reports.contains(&ServiceState::Running));
    }

    #[test]
    fn test_read_failure_stops_worker_and_drains() {
        let worker = FakeWorker::new();
        let channel = FakeChannel::new().failing_when_drained();
        channel.push(conn("alice"));

        let reporter = RecordingReporter::default();
        let ctl = ServiceController::new(
            test_config(),
            FakeWorkerFactory::with_workers([worker.clone()]),
            FakeChannelFactory::with_channels([channel]),
            reporter.clone(),
        );

        ctl.run(RunReason::Inline);

        assert_eq!(worker.connections(), vec![conn("alice")]);
        assert!(worker.is_stopped(), "test: worker stopped after bad read");
        assert_eq!(
            reporter.reports(),
            vec![
                ServiceState::Starting,
                ServiceState::Running,
                ServiceState::Stopping,
                ServiceState::Stopped,
            ],
        );
    }

    #[test]
    fn test_lazy_close_completion_recreates_channel() {
        let worker = FakeWorker::new();

        // First channel will drain its one connection and then complete the
        // deferred close, so the loop's closed-check sees it closed.
        let first = FakeChannel::new();
        first.push(conn("bob"));
        first.lazy_close();

        let second = FakeChannel::new().failing_when_drained();

        let reporter = RecordingReporter::default();
        let ctl = ServiceController::new(
            test_config(),
            FakeWorkerFactory::with_workers([worker.clone()]),
            FakeChannelFactory::with_channels([first.clone(), second]),
            reporter.clone(),
        );

        ctl.run(RunReason::Inline);

        assert!(first.is_closed());
        assert_eq!(ctl.channels.created(), 2, "test: replacement created");
        assert_eq!(worker.connections(), vec![conn("bob")]);

        // Recovery is made visible with a second running report.
        let running = reporter
            .reports()
            .iter()
            .filter(|s| **s == ServiceState::Running)
            .count();
        assert_eq!(running, 2);
        assert_eq!(reporter.reports().last(), Some(&ServiceState::Stopped));
    }

    #[test]
    fn test_recreate_failure_stops_worker() {
        let worker = FakeWorker::new();

        let only = FakeChannel::new();
        only.push(conn("carol"));
        only.lazy_close();

        let reporter = RecordingReporter::default();
        let ctl = ServiceController::new(
            test_config(),
            FakeWorkerFactory::with_workers([worker.clone()]),
            FakeChannelFactory::with_channels([only]),
            reporter.clone(),
        );

        ctl.run(RunReason::Inline);

        assert_eq!(ctl.channels.created(), 2, "test: replacement attempted");
        assert!(worker.is_stopped(), "test: escalated to worker stop");
        // Shutdown still proceeds normally, no second running report.
        assert_eq!(
            reporter.reports(),
            vec![
                ServiceState::Starting,
                ServiceState::Running,
                ServiceState::Stopping,
                ServiceState::Stopped,
            ],
        );
    }

    #[test]
    fn test_stop_racing_new_connection_reissues_lazy_close() {
        let worker = FakeWorker::new();
        // Not stopped at the first check, stopped at the re-check after the
        // cancel: the window the race protocol exists for.
        worker.script_stopped([false, true]);

        let channel = FakeChannel::new();
        channel.push(conn("dave"));

        let reporter = RecordingReporter::default();
        let ctl = ServiceController::new(
            test_config(),
            FakeWorkerFactory::with_workers([worker.clone()]),
            FakeChannelFactory::with_channels([channel.clone()]),
            reporter.clone(),
        );

        ctl.run(RunReason::Inline);

        assert_eq!(channel.cancel_calls(), 1, "test: cancel attempted");
        assert_eq!(channel.lazy_close_calls(), 1, "test: lazy close restored");
        assert_eq!(worker.connections(), vec![conn("dave")]);
    }

    #[test]
    fn test_stop_without_channel_is_harmless() {
        let reporter = RecordingReporter::default();
        let ctl = ServiceController::new(
            test_config(),
            FakeWorkerFactory::failing(),
            FakeChannelFactory::new(),
            reporter.clone(),
        );

        ctl.stop(true);
        ctl.stop(false);

        assert_eq!(reporter.reports(), vec![ServiceState::Stopping]);
    }

    #[test]
    fn test_configure_runs_worker_configure_only() {
        let worker = FakeWorker::new();
        let reporter = RecordingReporter::default();
        let ctl = ServiceController::new(
            test_config(),
            FakeWorkerFactory::with_workers([worker.clone()]),
            FakeChannelFactory::new(),
            reporter.clone(),
        );

        ctl.configure();

        assert!(worker.was_configured());
        assert!(!worker.was_started(), "test: configure does not start");
        assert_eq!(ctl.channels.created(), 0);
        assert!(reporter.reports().is_empty());
    }
}
