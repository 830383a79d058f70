//! Fake collaborators for exercising the controller in isolation.
//!
//! These model the blocking contracts of the worker and channel closely
//! enough to drive every lifecycle path deterministically: scripted busy
//! polls, scripted stop races, deferred closes that complete on drain, and
//! a gate for freezing a forward mid-flight.

use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU32, Ordering},
    },
    time::Duration,
};

use anyhow::anyhow;
use parking_lot::{Condvar, Mutex};

use crate::{
    reporter::{ServiceState, StateReporter},
    types::{Channel, ChannelFactory, ClientConnection, Worker, WorkerFactory},
};

/// A rendezvous for freezing a [`FakeWorker`] forward mid-flight.
///
/// The worker parks inside `user_connection` once it reaches the gate; the
/// test observes the arrival, does its interleaving, then releases.
#[derive(Clone, Default)]
pub struct Gate {
    inner: Arc<GateInner>,
}

#[derive(Default)]
struct GateInner {
    state: Mutex<GateState>,
    cond: Condvar,
}

#[derive(Default)]
struct GateState {
    arrived: bool,
    released: bool,
}

impl Gate {
    /// Constructs a closed gate.
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks until a worker is parked at the gate, up to `timeout`.
    /// Returns whether it arrived.
    pub fn wait_arrived(&self, timeout: Duration) -> bool {
        let mut st = self.inner.state.lock();
        while !st.arrived {
            if self.inner.cond.wait_for(&mut st, timeout).timed_out() {
                break;
            }
        }
        st.arrived
    }

    /// Opens the gate, letting the parked worker finish the forward.
    pub fn release(&self) {
        let mut st = self.inner.state.lock();
        st.released = true;
        self.inner.cond.notify_all();
    }

    fn pass(&self) {
        let mut st = self.inner.state.lock();
        st.arrived = true;
        self.inner.cond.notify_all();
        while !st.released {
            self.inner.cond.wait(&mut st);
        }
    }
}

impl std::fmt::Debug for Gate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<gate>")
    }
}

/// Scripted in-memory [`Worker`].
///
/// `start` marks it running (unless constructed start-failing), `stop`
/// marks it stopped.  Busy polls and stopped queries consume scripted
/// answers first and fall back to the real flags.
#[derive(Clone, Default)]
pub struct FakeWorker {
    inner: Arc<WorkerInner>,
}

#[derive(Default)]
struct WorkerInner {
    start_failing: AtomicBool,
    started: AtomicBool,
    running: AtomicBool,
    stopped: AtomicBool,
    configured: AtomicBool,
    busy_script: Mutex<VecDeque<bool>>,
    stopped_script: Mutex<VecDeque<bool>>,
    connections: Mutex<Vec<ClientConnection>>,
    forward_gate: Mutex<Option<Gate>>,
}

impl FakeWorker {
    /// Constructs a worker that starts cleanly and is never busy.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `start` fail to reach the running state, modeling a worker
    /// whose asynchronous initialization went wrong.
    pub fn with_start_failing(self) -> Self {
        self.inner.start_failing.store(true, Ordering::Relaxed);
        self
    }

    /// Queues answers for upcoming `is_busy` calls; afterwards the worker
    /// reports not busy.
    pub fn script_busy(&self, answers: impl IntoIterator<Item = bool>) {
        self.inner.busy_script.lock().extend(answers);
    }

    /// Queues answers for upcoming `is_stopped` calls; afterwards queries
    /// reflect the real stopped flag.
    pub fn script_stopped(&self, answers: impl IntoIterator<Item = bool>) {
        self.inner.stopped_script.lock().extend(answers);
    }

    /// Parks the next forward at `gate` until the test releases it.
    pub fn set_forward_gate(&self, gate: Gate) {
        *self.inner.forward_gate.lock() = Some(gate);
    }

    /// The connections forwarded so far, in order.
    pub fn connections(&self) -> Vec<ClientConnection> {
        self.inner.connections.lock().clone()
    }

    /// Whether `start` was called.
    pub fn was_started(&self) -> bool {
        self.inner.started.load(Ordering::Relaxed)
    }

    /// Whether the configure-only mode was invoked.
    pub fn was_configured(&self) -> bool {
        self.inner.configured.load(Ordering::Relaxed)
    }
}

impl Worker for FakeWorker {
    fn start(&self) {
        self.inner.started.store(true, Ordering::Relaxed);
        if !self.inner.start_failing.load(Ordering::Relaxed) {
            self.inner.running.store(true, Ordering::Relaxed);
        }
    }

    fn stop(&self) {
        self.inner.running.store(false, Ordering::Relaxed);
        self.inner.stopped.store(true, Ordering::Relaxed);
    }

    fn configure(&self) {
        self.inner.configured.store(true, Ordering::Relaxed);
    }

    fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Relaxed)
    }

    fn is_stopped(&self) -> bool {
        if let Some(answer) = self.inner.stopped_script.lock().pop_front() {
            return answer;
        }
        self.inner.stopped.load(Ordering::Relaxed)
    }

    fn is_busy(&self, _timeout: Duration) -> bool {
        self.inner.busy_script.lock().pop_front().unwrap_or(false)
    }

    fn user_connection(&self, conn: ClientConnection) {
        let gate = self.inner.forward_gate.lock().take();
        if let Some(gate) = gate {
            gate.pass();
        }
        self.inner.connections.lock().push(conn);
    }
}

impl std::fmt::Debug for FakeWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FakeWorker")
            .field("running", &self.is_running())
            .field("stopped", &self.inner.stopped.load(Ordering::Relaxed))
            .finish()
    }
}

/// Factory handing out prepared [`FakeWorker`]s, failing once exhausted.
#[derive(Default, Debug)]
pub struct FakeWorkerFactory {
    workers: Mutex<VecDeque<FakeWorker>>,
    created: AtomicU32,
}

impl FakeWorkerFactory {
    /// A factory whose every `create` fails.
    pub fn failing() -> Self {
        Self::default()
    }

    /// A factory handing out `workers` in order.
    pub fn with_workers(workers: impl IntoIterator<Item = FakeWorker>) -> Self {
        Self {
            workers: Mutex::new(workers.into_iter().collect()),
            created: AtomicU32::new(0),
        }
    }

    /// Number of `create` calls so far.
    pub fn created(&self) -> u32 {
        self.created.load(Ordering::Relaxed)
    }
}

impl WorkerFactory for FakeWorkerFactory {
    type Worker = FakeWorker;

    fn create(&self) -> anyhow::Result<FakeWorker> {
        self.created.fetch_add(1, Ordering::Relaxed);
        self.workers
            .lock()
            .pop_front()
            .ok_or_else(|| anyhow!("no worker prepared"))
    }
}

/// In-memory [`Channel`] with real blocking-read semantics.
///
/// `close` wakes any blocked reader, which then observes an absent result.
/// A lazy close completes as soon as the queue drains (immediately, if it
/// already is drained).  With [`FakeChannel::failing_when_drained`] an empty
/// queue produces an absent read instead of blocking, modeling a broken
/// transport.
#[derive(Clone, Default)]
pub struct FakeChannel {
    inner: Arc<ChannelInner>,
}

#[derive(Default)]
struct ChannelInner {
    state: Mutex<ChannelState>,
    readable: Condvar,
    fail_when_drained: AtomicBool,
    lazy_close_calls: AtomicU32,
    cancel_calls: AtomicU32,
}

#[derive(Default)]
struct ChannelState {
    queue: VecDeque<ClientConnection>,
    closed: bool,
    lazy_close_pending: bool,
}

impl FakeChannel {
    /// Constructs an open channel with blocking reads.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes reads on a drained queue fail instead of blocking.
    pub fn failing_when_drained(self) -> Self {
        self.inner.fail_when_drained.store(true, Ordering::Relaxed);
        self
    }

    /// Queues a connection, waking a blocked reader.
    pub fn push(&self, conn: ClientConnection) {
        let mut st = self.inner.state.lock();
        st.queue.push_back(conn);
        self.inner.readable.notify_all();
    }

    /// Number of `lazy_close` calls so far.
    pub fn lazy_close_calls(&self) -> u32 {
        self.inner.lazy_close_calls.load(Ordering::Relaxed)
    }

    /// Number of `cancel_lazy_close` calls so far.
    pub fn cancel_calls(&self) -> u32 {
        self.inner.cancel_calls.load(Ordering::Relaxed)
    }
}

impl Channel for FakeChannel {
    fn read_message(&self) -> Option<ClientConnection> {
        let mut st = self.inner.state.lock();
        loop {
            if st.closed {
                return None;
            }
            if let Some(conn) = st.queue.pop_front() {
                if st.lazy_close_pending && st.queue.is_empty() {
                    st.closed = true;
                }
                return Some(conn);
            }
            if self.inner.fail_when_drained.load(Ordering::Relaxed) {
                return None;
            }
            self.inner.readable.wait(&mut st);
        }
    }

    fn close(&self) {
        let mut st = self.inner.state.lock();
        st.closed = true;
        self.inner.readable.notify_all();
    }

    fn lazy_close(&self) {
        self.inner.lazy_close_calls.fetch_add(1, Ordering::Relaxed);
        let mut st = self.inner.state.lock();
        st.lazy_close_pending = true;
        if st.queue.is_empty() {
            st.closed = true;
            self.inner.readable.notify_all();
        }
    }

    fn cancel_lazy_close(&self) {
        self.inner.cancel_calls.fetch_add(1, Ordering::Relaxed);
        let mut st = self.inner.state.lock();
        if !st.closed {
            st.lazy_close_pending = false;
        }
    }

    fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }
}

impl std::fmt::Debug for FakeChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.inner.state.lock();
        f.debug_struct("FakeChannel")
            .field("queued", &st.queue.len())
            .field("closed", &st.closed)
            .field("lazy_close_pending", &st.lazy_close_pending)
            .finish()
    }
}

/// Factory handing out prepared [`FakeChannel`]s, failing once exhausted.
#[derive(Default, Debug)]
pub struct FakeChannelFactory {
    channels: Mutex<VecDeque<FakeChannel>>,
    created: AtomicU32,
}

impl FakeChannelFactory {
    /// A factory whose every `create` fails.
    pub fn new() -> Self {
        Self::default()
    }

    /// A factory handing out `channels` in order.
    pub fn with_channels(channels: impl IntoIterator<Item = FakeChannel>) -> Self {
        Self {
            channels: Mutex::new(channels.into_iter().collect()),
            created: AtomicU32::new(0),
        }
    }

    /// Number of `create` calls so far.
    pub fn created(&self) -> u32 {
        self.created.load(Ordering::Relaxed)
    }
}

impl ChannelFactory for FakeChannelFactory {
    type Channel = FakeChannel;

    fn create(&self) -> anyhow::Result<FakeChannel> {
        self.created.fetch_add(1, Ordering::Relaxed);
        self.channels
            .lock()
            .pop_front()
            .ok_or_else(|| anyhow!("no channel prepared"))
    }
}

/// [`StateReporter`] that records every report for later assertion.
#[derive(Clone, Default, Debug)]
pub struct RecordingReporter {
    inner: Arc<RecordingInner>,
}

#[derive(Default, Debug)]
struct RecordingInner {
    reports: Mutex<Vec<ServiceState>>,
    running: AtomicBool,
}

impl RecordingReporter {
    fn record(&self, state: ServiceState) {
        self.inner
            .running
            .store(state == ServiceState::Running, Ordering::Release);
        self.inner.reports.lock().push(state);
    }

    /// Every report so far, in order.
    pub fn reports(&self) -> Vec<ServiceState> {
        self.inner.reports.lock().clone()
    }
}

impl StateReporter for RecordingReporter {
    fn report_starting(&self) {
        self.record(ServiceState::Starting);
    }

    fn report_running(&self) {
        self.record(ServiceState::Running);
    }

    fn report_stopping(&self) {
        self.record(ServiceState::Stopping);
    }

    fn report_stopped(&self) {
        self.record(ServiceState::Stopped);
    }

    fn report_errored(&self) {
        self.record(ServiceState::Errored);
    }

    fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }
}
