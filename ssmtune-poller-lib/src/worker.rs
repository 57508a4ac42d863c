//! Background polling worker.
//!
//! Architecture:
//! - The worker thread owns the [`Protocol`] (and through it the transport)
//!   for as long as it runs, and hands it back on join
//! - The owner talks to it through two channels: [`WorkerCommand`]s in,
//!   [`WorkerEvent`]s out. Nothing else is shared
//! - Worker state is an [`EnumSet`] of [`WorkerFlag`]s; every change goes
//!   through one of the pure transition functions below

use enumset::{EnumSet, EnumSetType};
use log::{debug, error, info, warn};
use ssmtune_protocol_lib::{Endpoint, Protocol, ProtocolError, Transport, PROTOCOL_ID};
use std::any::Any;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::coalescer::Query;
use crate::config::PollerConfig;

pub const THREAD_NAME: &str = "ssm_poller";

/// Streamed frames read per cycle; only the newest is reported
const STREAM_DRAIN_LIMIT: usize = 32;

#[derive(EnumSetType, Debug)]
pub enum WorkerFlag {
    /// Device answered identify on the current endpoint
    Initialized,
    HasQuery,
    /// The current query asks the device to stream
    Continuous,
    /// A query was sent and its reply is outstanding (or streaming)
    WaitingForResponse,
}

pub type WorkerState = EnumSet<WorkerFlag>;

#[must_use]
pub fn identified(state: WorkerState) -> WorkerState {
    state | WorkerFlag::Initialized
}

/// A new endpoint must be identified again before any query goes out.
#[must_use]
pub fn endpoint_changed(state: WorkerState) -> WorkerState {
    state - (WorkerFlag::Initialized | WorkerFlag::WaitingForResponse)
}

#[must_use]
pub fn query_updated(state: WorkerState, query: Option<&Query>) -> WorkerState {
    let mut next =
        state - (WorkerFlag::HasQuery | WorkerFlag::Continuous | WorkerFlag::WaitingForResponse);
    if let Some(query) = query {
        next.insert(WorkerFlag::HasQuery);
        if query.is_continuous() {
            next.insert(WorkerFlag::Continuous);
        }
    }
    next
}

#[must_use]
pub fn query_sent(state: WorkerState) -> WorkerState {
    state | WorkerFlag::WaitingForResponse
}

/// After a poll, with or without a reply: a single-shot query is reissued,
/// a stream keeps flowing.
#[must_use]
pub fn poll_finished(state: WorkerState) -> WorkerState {
    if state.contains(WorkerFlag::Continuous) {
        state
    } else {
        state - WorkerFlag::WaitingForResponse
    }
}

/// A failed cycle re-arms the query, streaming or not.
#[must_use]
pub fn cycle_failed(state: WorkerState) -> WorkerState {
    state - WorkerFlag::WaitingForResponse
}

#[must_use]
pub fn should_send_query(state: WorkerState) -> bool {
    state.is_superset(WorkerFlag::Initialized | WorkerFlag::HasQuery)
        && !state.contains(WorkerFlag::WaitingForResponse)
}

/// Whether the device is (as far as we know) streaming replies
#[must_use]
pub fn is_streaming(state: WorkerState) -> bool {
    state.is_superset(WorkerFlag::Continuous | WorkerFlag::WaitingForResponse)
}

#[must_use]
pub fn interrupt_on_stop(state: WorkerState) -> bool {
    state.contains(WorkerFlag::Continuous) || state.contains(WorkerFlag::WaitingForResponse)
}

/// Commands from the owner
#[derive(Debug, Clone)]
pub enum WorkerCommand {
    SetEndpoint(Endpoint),
    /// Replace the running query; `None` stops polling
    UpdateQuery(Option<Query>),
    Stop,
}

/// Events to the owner
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    Init {
        protocol: &'static str,
        endpoint: Endpoint,
        identifier: String,
        raw: Vec<u8>,
    },
    QueryResponse {
        /// Time since the previous response, zero for the first
        elapsed: Duration,
        /// Responses per second averaged over the rate window
        rate_hz: f64,
        raw: Vec<u8>,
    },
    Exception {
        error: String,
    },
}

/// Rolling average of response intervals.
#[derive(Debug)]
struct RateTracker {
    window: usize,
    last: Option<Instant>,
    samples: VecDeque<Duration>,
}

impl RateTracker {
    fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            last: None,
            samples: VecDeque::with_capacity(window),
        }
    }

    fn reset(&mut self) {
        self.last = None;
        self.samples.clear();
    }

    /// Record a response at `now`, returning the interval and current rate.
    fn record(&mut self, now: Instant) -> (Duration, f64) {
        let elapsed = match self.last {
            Some(last) => {
                let elapsed = now.saturating_duration_since(last);
                self.samples.push_back(elapsed);
                while self.samples.len() > self.window {
                    self.samples.pop_front();
                }
                elapsed
            }
            None => Duration::ZERO,
        };
        self.last = Some(now);

        let total: Duration = self.samples.iter().sum();
        #[allow(clippy::cast_precision_loss)] // window is small
        let rate = if total.is_zero() {
            0.0
        } else {
            self.samples.len() as f64 / total.as_secs_f64()
        };
        (elapsed, rate)
    }
}

/// Owner side of a running worker.
pub struct WorkerHandle<T> {
    commands: Sender<WorkerCommand>,
    events: Receiver<WorkerEvent>,
    thread: JoinHandle<Protocol<T>>,
}

impl<T> WorkerHandle<T> {
    /// Queue a command. Returns `false` if the worker has exited.
    pub fn send(&self, command: WorkerCommand) -> bool {
        self.commands.send(command).is_ok()
    }

    pub fn set_endpoint(&self, endpoint: Endpoint) -> bool {
        self.send(WorkerCommand::SetEndpoint(endpoint))
    }

    pub fn update_query(&self, query: Option<Query>) -> bool {
        self.send(WorkerCommand::UpdateQuery(query))
    }

    pub const fn events(&self) -> &Receiver<WorkerEvent> {
        &self.events
    }

    /// Wait up to `timeout` for the next event.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<WorkerEvent> {
        match self.events.recv_timeout(timeout) {
            Ok(event) => Some(event),
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Stop the worker and take back its protocol handle.
    ///
    /// Returns `None` only if the worker thread itself died.
    pub fn stop(self) -> Option<Protocol<T>> {
        // Already gone if this fails; join tells us how it ended
        let _ = self.commands.send(WorkerCommand::Stop);
        match self.thread.join() {
            Ok(protocol) => Some(protocol),
            Err(panic) => {
                error!("Polling worker thread died: {}", panic_message(&*panic));
                None
            }
        }
    }
}

/// Poll loop state, owned by the worker thread.
pub struct PollingWorker<T> {
    protocol: Protocol<T>,
    config: PollerConfig,
    state: WorkerState,
    query: Option<Query>,
    last_identify: Option<Instant>,
    rate: RateTracker,
    commands: Receiver<WorkerCommand>,
    events: Sender<WorkerEvent>,
}

impl<T: Transport + 'static> PollingWorker<T> {
    /// Start polling on a dedicated thread.
    ///
    /// The protocol keeps its endpoint; its request timeout is taken from
    /// `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if the thread cannot be spawned.
    pub fn spawn(mut protocol: Protocol<T>, mut config: PollerConfig) -> std::io::Result<WorkerHandle<T>> {
        config.validate();
        protocol.set_timeout(config.request_timeout());

        let (command_tx, command_rx) = mpsc::channel();
        let (event_tx, event_rx) = mpsc::channel();
        let worker = Self {
            protocol,
            rate: RateTracker::new(config.rate_window),
            config,
            state: WorkerState::empty(),
            query: None,
            last_identify: None,
            commands: command_rx,
            events: event_tx,
        };

        let thread = thread::Builder::new()
            .name(THREAD_NAME.to_string())
            .spawn(move || worker.run())?;
        Ok(WorkerHandle {
            commands: command_tx,
            events: event_rx,
            thread,
        })
    }

    fn run(mut self) -> Protocol<T> {
        info!("Polling worker started on {}", self.protocol.endpoint());

        loop {
            let command = match self.commands.try_recv() {
                Ok(WorkerCommand::Stop) => break,
                Ok(command) => Some(command),
                Err(TryRecvError::Empty) => None,
                Err(TryRecvError::Disconnected) => {
                    info!("Worker command channel closed, shutting down");
                    break;
                }
            };

            let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.cycle(command)));
            let failure = match outcome {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e.to_string()),
                Err(panic) => Some(format!("worker cycle panicked: {}", panic_message(&*panic))),
            };
            if let Some(error) = failure {
                error!("Polling cycle failed: {error}");
                self.state = cycle_failed(self.state);
                self.emit(WorkerEvent::Exception { error });
            }

            thread::sleep(self.config.cycle_sleep());
        }

        self.shutdown();
        self.protocol
    }

    fn cycle(&mut self, command: Option<WorkerCommand>) -> Result<(), ProtocolError> {
        if let Some(command) = command {
            self.handle_command(command)?;
        }

        if !self.state.contains(WorkerFlag::Initialized) && self.identify_due() {
            self.identify()?;
        }

        if should_send_query(self.state) {
            self.send_query()?;
        }

        if self.state.contains(WorkerFlag::WaitingForResponse) {
            self.collect_response()?;
        }
        Ok(())
    }

    fn handle_command(&mut self, command: WorkerCommand) -> Result<(), ProtocolError> {
        match command {
            WorkerCommand::SetEndpoint(endpoint) => {
                if is_streaming(self.state) {
                    self.protocol.interrupt()?;
                }
                self.protocol.set_endpoint(endpoint);
                self.state = endpoint_changed(self.state);
                // Identify the new endpoint right away
                self.last_identify = None;
            }
            WorkerCommand::UpdateQuery(query) => {
                if is_streaming(self.state) {
                    self.protocol.interrupt()?;
                }
                match &query {
                    Some(query) => info!("Polling with {}", query.command().label()),
                    None => info!("Polling stopped"),
                }
                self.state = query_updated(self.state, query.as_ref());
                self.query = query;
                self.rate.reset();
            }
            WorkerCommand::Stop => {}
        }
        Ok(())
    }

    fn identify_due(&self) -> bool {
        self.last_identify
            .map_or(true, |last| last.elapsed() >= self.config.identify_interval())
    }

    fn identify(&mut self) -> Result<(), ProtocolError> {
        self.last_identify = Some(Instant::now());
        let endpoint = self.protocol.endpoint();
        debug!("Identifying {endpoint}");

        match self.protocol.identify()? {
            Some(identity) => {
                info!("{endpoint} identified as {}", identity.identifier);
                self.state = identified(self.state);
                self.emit(WorkerEvent::Init {
                    protocol: PROTOCOL_ID,
                    endpoint,
                    identifier: identity.identifier,
                    raw: identity.raw,
                });
            }
            None => warn!(
                "No identify response from {endpoint}, retrying in {}ms",
                self.config.identify_interval_ms
            ),
        }
        Ok(())
    }

    fn send_query(&mut self) -> Result<(), ProtocolError> {
        let Some(query) = &self.query else {
            return Ok(());
        };
        self.protocol.clear_buffers()?;
        self.protocol.send(query.request())?;
        self.state = query_sent(self.state);
        Ok(())
    }

    fn collect_response(&mut self) -> Result<(), ProtocolError> {
        let Some(query) = &self.query else {
            self.state = poll_finished(self.state);
            return Ok(());
        };
        let command = query.command().as_u8();
        let response = if query.is_continuous() {
            self.protocol
                .poll_latest(command, self.config.stream_poll(), STREAM_DRAIN_LIMIT)?
        } else {
            self.protocol.poll(command, self.config.request_timeout())?
        };

        match response {
            Some(raw) => {
                let (elapsed, rate_hz) = self.rate.record(Instant::now());
                self.emit(WorkerEvent::QueryResponse {
                    elapsed,
                    rate_hz,
                    raw,
                });
            }
            None if !query.is_continuous() => debug!("No query response, reissuing"),
            None => {}
        }
        self.state = poll_finished(self.state);
        Ok(())
    }

    fn shutdown(&mut self) {
        if interrupt_on_stop(self.state) {
            if let Err(e) = self.protocol.interrupt() {
                warn!("Failed to interrupt device stream on stop: {e}");
            }
        }
        info!("Polling worker stopped");
    }

    fn emit(&self, event: WorkerEvent) {
        // Owner may have stopped listening; keep polling until told to stop
        let _ = self.events.send(event);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coalescer::QueryCoalescer;
    use crate::parameter::{DataType, ParameterDescriptor};
    use ssmtune_protocol_lib::{
        build_reply, frame_command, Command, LoopbackTransport, SimulatedEcu, TransportError,
    };

    fn config() -> PollerConfig {
        PollerConfig {
            request_timeout_ms: 50,
            identify_interval_ms: 20,
            cycle_sleep_ms: 1,
            stream_poll_ms: 5,
            ..PollerConfig::default()
        }
    }

    fn loopback() -> LoopbackTransport {
        let mut ecu = SimulatedEcu::new(Endpoint::Ecu, SimulatedEcu::default_identity());
        ecu.load(0x0E, &[0x1F, 0x40]);
        ecu.load(0x08, &[0x5A]);
        LoopbackTransport::new(ecu)
    }

    fn spawn<T: Transport + 'static>(transport: T, endpoint: Endpoint) -> WorkerHandle<T> {
        let protocol = Protocol::new(transport, endpoint, Duration::from_millis(50));
        PollingWorker::spawn(protocol, config()).unwrap()
    }

    fn query(continuous: bool) -> Query {
        let mut coalescer = QueryCoalescer::new();
        coalescer
            .rebuild(&[
                ParameterDescriptor::new("P8", "Engine Speed", DataType::U16, vec![0x0E]),
                ParameterDescriptor::new("P2", "Coolant", DataType::U8, vec![0x08]),
            ])
            .unwrap();
        coalescer.query(continuous).unwrap().unwrap()
    }

    fn wait_for<T>(handle: &WorkerHandle<T>, matches: impl Fn(&WorkerEvent) -> bool) -> WorkerEvent {
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let event = handle
                .recv_timeout(remaining)
                .expect("timed out waiting for worker event");
            if matches(&event) {
                return event;
            }
        }
    }

    fn is_init(event: &WorkerEvent) -> bool {
        matches!(event, WorkerEvent::Init { .. })
    }

    fn is_response(event: &WorkerEvent) -> bool {
        matches!(event, WorkerEvent::QueryResponse { .. })
    }

    #[test]
    fn test_transitions() {
        let state = WorkerState::empty();
        assert!(!should_send_query(state));

        let state = query_updated(state, Some(&query(false)));
        assert!(state.contains(WorkerFlag::HasQuery));
        assert!(!should_send_query(state), "queries wait for identify");

        let state = identified(state);
        assert!(should_send_query(state));

        let state = query_sent(state);
        assert!(!should_send_query(state));
        assert!(!is_streaming(state));
        assert!(interrupt_on_stop(state));

        let state = poll_finished(state);
        assert!(should_send_query(state));

        let state = endpoint_changed(query_sent(state));
        assert!(!state.contains(WorkerFlag::Initialized));
        assert!(!state.contains(WorkerFlag::WaitingForResponse));
        assert!(state.contains(WorkerFlag::HasQuery));
    }

    #[test]
    fn test_continuous_transitions() {
        let state = identified(query_updated(WorkerState::empty(), Some(&query(true))));
        let state = query_sent(state);
        assert!(is_streaming(state));
        assert_eq!(poll_finished(state), state, "stream keeps waiting");
        assert!(!cycle_failed(state).contains(WorkerFlag::WaitingForResponse));

        let cleared = query_updated(state, None);
        assert!(!cleared.contains(WorkerFlag::HasQuery));
        assert!(!cleared.contains(WorkerFlag::Continuous));
        assert!(!interrupt_on_stop(cleared));
    }

    #[test]
    fn test_rate_tracker() {
        let mut rate = RateTracker::new(10);
        let start = Instant::now();
        assert_eq!(rate.record(start), (Duration::ZERO, 0.0));
        let (elapsed, _) = rate.record(start + Duration::from_millis(100));
        assert_eq!(elapsed, Duration::from_millis(100));
        let (_, hz) = rate.record(start + Duration::from_millis(200));
        assert!((hz - 10.0).abs() < 1e-9);

        rate.reset();
        assert_eq!(rate.record(start + Duration::from_secs(1)).0, Duration::ZERO);
    }

    #[test]
    fn test_rate_window_drops_old_samples() {
        let mut rate = RateTracker::new(2);
        let start = Instant::now();
        rate.record(start);
        rate.record(start + Duration::from_millis(500));
        rate.record(start + Duration::from_millis(600));
        let (_, hz) = rate.record(start + Duration::from_millis(700));
        assert!((hz - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_identify_then_poll() {
        let handle = spawn(loopback(), Endpoint::Ecu);
        let init = wait_for(&handle, is_init);
        assert_eq!(
            init,
            WorkerEvent::Init {
                protocol: "SSM",
                endpoint: Endpoint::Ecu,
                identifier: "4A12345678".to_string(),
                raw: SimulatedEcu::default_identity(),
            }
        );

        assert!(handle.update_query(Some(query(false))));
        for _ in 0..3 {
            let WorkerEvent::QueryResponse { raw, .. } = wait_for(&handle, is_response) else {
                unreachable!();
            };
            assert_eq!(raw, vec![0x1F, 0x40, 0x5A]);
        }

        let protocol = handle.stop().unwrap();
        assert!(protocol.transport().frames_received() >= 4);
    }

    #[test]
    fn test_continuous_stream_interrupted_on_stop() {
        let handle = spawn(loopback(), Endpoint::Ecu);
        handle.update_query(Some(query(true)));
        wait_for(&handle, is_response);
        wait_for(&handle, is_response);
        let WorkerEvent::QueryResponse { rate_hz, raw, .. } = wait_for(&handle, is_response) else {
            unreachable!();
        };
        assert_eq!(raw, vec![0x1F, 0x40, 0x5A]);
        assert!(rate_hz > 0.0);

        let protocol = handle.stop().unwrap();
        assert!(!protocol.transport().ecu().is_streaming());
    }

    #[test]
    fn test_clearing_continuous_query_interrupts() {
        let handle = spawn(loopback(), Endpoint::Ecu);
        handle.update_query(Some(query(true)));
        wait_for(&handle, is_response);
        handle.update_query(None);

        let protocol = handle.stop().unwrap();
        assert!(!protocol.transport().ecu().is_streaming());
    }

    #[test]
    fn test_wrong_endpoint_until_switched() {
        let handle = spawn(loopback(), Endpoint::Tcu);
        assert!(handle.recv_timeout(Duration::from_millis(100)).is_none());

        handle.set_endpoint(Endpoint::Ecu);
        let WorkerEvent::Init { endpoint, .. } = wait_for(&handle, is_init) else {
            unreachable!();
        };
        assert_eq!(endpoint, Endpoint::Ecu);
        assert_eq!(handle.stop().unwrap().endpoint(), Endpoint::Ecu);
    }

    /// Fails the first writes, then behaves
    struct FlakyTransport {
        inner: LoopbackTransport,
        errors: usize,
        panics: usize,
    }

    impl Transport for FlakyTransport {
        fn write(&mut self, data: &[u8], timeout: Duration) -> Result<(), TransportError> {
            if self.panics > 0 {
                self.panics -= 1;
                panic!("boom");
            }
            if self.errors > 0 {
                self.errors -= 1;
                return Err(TransportError::Disconnected);
            }
            self.inner.write(data, timeout)
        }

        fn read(
            &mut self,
            max_messages: usize,
            timeout: Duration,
        ) -> Result<Option<Vec<u8>>, TransportError> {
            self.inner.read(max_messages, timeout)
        }
    }

    #[test]
    fn test_errors_are_reported_and_loop_continues() {
        let transport = FlakyTransport {
            inner: loopback(),
            errors: 1,
            panics: 1,
        };
        let handle = spawn(transport, Endpoint::Ecu);

        let WorkerEvent::Exception { error } = handle.recv_timeout(Duration::from_secs(2)).unwrap() else {
            panic!("expected exception first");
        };
        assert!(error.contains("boom"), "{error}");

        let WorkerEvent::Exception { error } = handle.recv_timeout(Duration::from_secs(2)).unwrap() else {
            panic!("expected second exception");
        };
        assert!(error.contains("disconnected"), "{error}");

        wait_for(&handle, is_init);
        assert!(handle.stop().is_some());
    }

    /// Identifies through the simulated ECU; answers each query write with
    /// the next batch of scripted frames
    struct ScriptedTransport {
        inner: LoopbackTransport,
        script: VecDeque<Vec<Vec<u8>>>,
        inbox: VecDeque<Vec<u8>>,
        query_writes: usize,
    }

    impl ScriptedTransport {
        fn new(script: Vec<Vec<Vec<u8>>>) -> Self {
            Self {
                inner: loopback(),
                script: script.into(),
                inbox: VecDeque::new(),
                query_writes: 0,
            }
        }
    }

    impl Transport for ScriptedTransport {
        fn write(&mut self, data: &[u8], timeout: Duration) -> Result<(), TransportError> {
            if frame_command(data) != Some(Command::ReadAddresses.as_u8()) {
                return self.inner.write(data, timeout);
            }
            self.query_writes += 1;
            self.inbox.extend(self.script.pop_front().unwrap_or_default());
            Ok(())
        }

        fn read(
            &mut self,
            max_messages: usize,
            timeout: Duration,
        ) -> Result<Option<Vec<u8>>, TransportError> {
            match self.inbox.pop_front() {
                Some(frame) => Ok(Some(frame)),
                None => self.inner.read(max_messages, timeout),
            }
        }

        fn clear_buffers(&mut self) -> Result<(), TransportError> {
            self.inbox.clear();
            self.inner.clear_buffers()
        }
    }

    fn reply(command: u8, payload: &[u8]) -> Vec<u8> {
        build_reply(Endpoint::Ecu, command, payload).unwrap().to_vec()
    }

    fn responses_until_quiet<T>(handle: &WorkerHandle<T>, quiet: Duration) -> Vec<Vec<u8>> {
        let mut raws = Vec::new();
        while let Some(event) = handle.recv_timeout(quiet) {
            if let WorkerEvent::QueryResponse { raw, .. } = event {
                raws.push(raw);
            }
        }
        raws
    }

    #[test]
    fn test_single_shot_query_reissued_until_acknowledged() {
        let transport = ScriptedTransport::new(vec![
            vec![],
            vec![reply(0xE0, &[0xEE, 0xEE, 0xEE])],
            vec![reply(0xE8, &[0x1F, 0x40, 0x5A])],
        ]);
        let handle = spawn(transport, Endpoint::Ecu);
        wait_for(&handle, is_init);
        handle.update_query(Some(query(false)));

        let WorkerEvent::QueryResponse { raw, .. } = wait_for(&handle, is_response) else {
            unreachable!();
        };
        assert_eq!(raw, vec![0x1F, 0x40, 0x5A]);
        // Script exhausted: later writes time out and are reissued silently
        assert!(responses_until_quiet(&handle, Duration::from_millis(200)).is_empty());

        let protocol = handle.stop().unwrap();
        let writes = protocol.transport().query_writes;
        assert!(writes >= 3, "query written {writes} times");
    }

    #[test]
    fn test_stream_reports_newest_of_queued_frames() {
        let transport = ScriptedTransport::new(vec![vec![
            reply(0xE8, &[1, 1, 1]),
            reply(0xE8, &[2, 2, 2]),
            reply(0xE8, &[3, 3, 3]),
        ]]);
        let handle = spawn(transport, Endpoint::Ecu);
        wait_for(&handle, is_init);
        handle.update_query(Some(query(true)));

        let WorkerEvent::QueryResponse { raw, .. } = wait_for(&handle, is_response) else {
            unreachable!();
        };
        assert_eq!(raw, vec![3, 3, 3]);
        assert!(responses_until_quiet(&handle, Duration::from_millis(100)).is_empty());

        let protocol = handle.stop().unwrap();
        assert_eq!(protocol.transport().query_writes, 1);
    }
}
