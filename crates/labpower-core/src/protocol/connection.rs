//! Connection management
//!
//! Runs the communication worker: a single thread that owns the [`Link`],
//! sends queued commands one at a time, paces the supply, matches replies
//! and reports results as [`WorkerEvent`]s.
//!
//! Lifecycle: `Idle -> Connecting -> Running -> Disconnecting -> Idle`.
//! A failed open goes straight from `Connecting` back to `Idle`.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs;
use std::path::Path;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{
    serial::{list_ports, PortInfo},
    Command, CommandKind, DecodeFailure, Link, PollSource, ProtocolError, SerialSettings,
    DEFAULT_ERROR_THRESHOLD, DEFAULT_PACING_MS, DEFAULT_POLL_DELAY_MS, DEFAULT_POLL_PERIOD_MS,
    DEFAULT_READ_ATTEMPTS,
};

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// No link open
    Idle,
    /// Opening the link
    Connecting,
    /// Serving the queue and polling
    Running,
    /// Tearing down the link and the poll timer
    Disconnecting,
}

/// Connection configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Minimum spacing after every transmission, in milliseconds
    pub pacing_ms: u64,
    /// Delay before the first poll tick, in milliseconds
    pub poll_delay_ms: u64,
    /// Poll period, in milliseconds
    pub poll_period_ms: u64,
    /// Poll live readings while connected
    pub poll_enabled: bool,
    /// Failed replies (net of successes) that force a disconnect
    pub error_threshold: u32,
    /// Reads per command before the reply is declared missing or malformed
    pub read_attempts: u32,
    /// Serial line parameters
    pub serial: SerialSettings,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            pacing_ms: DEFAULT_PACING_MS,
            poll_delay_ms: DEFAULT_POLL_DELAY_MS,
            poll_period_ms: DEFAULT_POLL_PERIOD_MS,
            poll_enabled: true,
            error_threshold: DEFAULT_ERROR_THRESHOLD,
            read_attempts: DEFAULT_READ_ATTEMPTS,
            serial: SerialSettings::default(),
        }
    }
}

impl ConnectionConfig {
    /// Pause after every write
    pub fn pacing(&self) -> Duration {
        Duration::from_millis(self.pacing_ms)
    }

    /// Wait before the first poll tick
    pub fn poll_delay(&self) -> Duration {
        Duration::from_millis(self.poll_delay_ms)
    }

    /// Interval between poll ticks
    pub fn poll_period(&self) -> Duration {
        Duration::from_millis(self.poll_period_ms)
    }

    /// Reject settings the supply or the worker can't run with
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.pacing_ms == 0 {
            return Err(ProtocolError::Config(
                "pacing_ms must be at least 1".to_string(),
            ));
        }
        if self.poll_period_ms == 0 {
            return Err(ProtocolError::Config(
                "poll_period_ms must be at least 1".to_string(),
            ));
        }
        if self.error_threshold == 0 {
            return Err(ProtocolError::Config(
                "error_threshold must be at least 1".to_string(),
            ));
        }
        if self.read_attempts == 0 {
            return Err(ProtocolError::Config(
                "read_attempts must be at least 1".to_string(),
            ));
        }
        if self.serial.baud_rate == 0 {
            return Err(ProtocolError::Config("baud_rate must not be 0".to_string()));
        }
        Ok(())
    }

    /// Load a JSON configuration file; missing fields take their defaults
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ProtocolError> {
        let content = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Write the configuration as pretty-printed JSON
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ProtocolError> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }
}

/// Why a connection ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DisconnectReason {
    /// [`ConnectionHandle::cancel`] or the handle was dropped
    Requested,
    /// Too many replies failed to decode
    ErrorThreshold,
    /// The port could not be opened
    OpenFailed(String),
}

/// Messages posted by the worker for the front end
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    /// The connection changed state
    State(ConnectionState),
    /// A command with an expected answer was decoded
    Resolved(Command),
    /// The link is fully torn down; sent once per connection
    Disconnected(DisconnectReason),
}

/// Counts failed replies; successes pay one failure back
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorCounter {
    count: u32,
    threshold: u32,
}

impl ErrorCounter {
    /// Start at zero failures
    pub fn new(threshold: u32) -> Self {
        Self {
            count: 0,
            threshold,
        }
    }

    /// Pay back one failure, never below zero
    pub fn record_success(&mut self) {
        self.count = self.count.saturating_sub(1);
    }

    /// Count a failure; returns `true` once the threshold is reached
    pub fn record_failure(&mut self) -> bool {
        self.count = self.count.saturating_add(1);
        self.is_breached()
    }

    /// Whether the count has reached the threshold
    pub fn is_breached(&self) -> bool {
        self.count >= self.threshold
    }

    /// Current failure count
    pub fn count(&self) -> u32 {
        self.count
    }
}

/// State behind the single queue lock
struct Inner {
    pending: VecDeque<Command>,
    state: ConnectionState,
    cancelled: bool,
    /// Bumped on every connect so stale handles can't cancel a newer link
    generation: u64,
}

struct Shared {
    inner: Mutex<Inner>,
    wake: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push(&self, command: Command) {
        let mut inner = self.lock();
        inner.pending.push_back(command);
        self.wake.notify_one();
    }

    fn set_state(&self, state: ConnectionState) {
        self.lock().state = state;
    }
}

/// Cloneable producer handle for enqueueing commands from any thread
#[derive(Clone)]
pub struct CommandSender {
    shared: Arc<Shared>,
}

impl CommandSender {
    /// Append a command to the queue and wake the worker
    pub fn add_command(&self, command: Command) {
        self.shared.push(command);
    }
}

/// Owner of the command queue and the event channel
///
/// Lives across connections. [`Communication::connect`] hands out at most
/// one live [`ConnectionHandle`] at a time.
pub struct Communication {
    shared: Arc<Shared>,
    config: ConnectionConfig,
    events: Sender<WorkerEvent>,
}

impl Communication {
    /// Create the communication core; the receiver gets every [`WorkerEvent`]
    pub fn new(config: ConnectionConfig) -> (Self, Receiver<WorkerEvent>) {
        let (events, rx) = mpsc::channel();
        let shared = Arc::new(Shared {
            inner: Mutex::new(Inner {
                pending: VecDeque::new(),
                state: ConnectionState::Idle,
                cancelled: false,
                generation: 0,
            }),
            wake: Condvar::new(),
        });
        (
            Self {
                shared,
                config,
                events,
            },
            rx,
        )
    }

    /// List available serial ports
    pub fn list_ports() -> Vec<PortInfo> {
        list_ports()
    }

    /// Settings every connection from here uses
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Get current connection state
    pub fn state(&self) -> ConnectionState {
        self.shared.lock().state
    }

    /// Number of commands waiting to be sent
    pub fn pending_len(&self) -> usize {
        self.shared.lock().pending.len()
    }

    /// Cloneable producer for other threads
    pub fn sender(&self) -> CommandSender {
        CommandSender {
            shared: self.shared.clone(),
        }
    }

    /// Queue a command. While idle it waits for the next connection, which
    /// clears the queue when it starts running.
    pub fn add_command(&self, command: Command) {
        self.shared.push(command);
    }

    /// Open `port_name` on `link` and start the worker thread
    ///
    /// Only possible while idle. The open itself happens on the worker; an
    /// open failure is reported as [`DisconnectReason::OpenFailed`].
    pub fn connect<L>(&self, link: L, port_name: &str) -> Result<ConnectionHandle, ProtocolError>
    where
        L: Link + 'static,
    {
        self.config.validate()?;

        let generation = {
            let mut inner = self.shared.lock();
            if inner.state != ConnectionState::Idle {
                return Err(ProtocolError::AlreadyConnected);
            }
            inner.state = ConnectionState::Connecting;
            inner.cancelled = false;
            inner.generation += 1;
            inner.generation
        };
        let _ = self.events.send(WorkerEvent::State(ConnectionState::Connecting));
        debug!("Try connecting to: {}", port_name);

        let worker = Worker {
            shared: self.shared.clone(),
            link,
            port_name: port_name.to_string(),
            config: self.config.clone(),
            events: self.events.clone(),
        };

        let spawned = thread::Builder::new()
            .name("labpower-worker".to_string())
            .spawn(move || worker.run());

        match spawned {
            Ok(thread) => Ok(ConnectionHandle {
                shared: self.shared.clone(),
                generation,
                thread: Some(thread),
            }),
            Err(e) => {
                self.shared.set_state(ConnectionState::Idle);
                let _ = self.events.send(WorkerEvent::State(ConnectionState::Idle));
                Err(ProtocolError::ConnectionFailed(format!(
                    "can't start worker thread: {}",
                    e
                )))
            }
        }
    }
}

/// Ownership handle for one connection
///
/// Dropping the handle disconnects and waits for the worker to finish.
pub struct ConnectionHandle {
    shared: Arc<Shared>,
    generation: u64,
    thread: Option<JoinHandle<()>>,
}

impl ConnectionHandle {
    /// Queue a command behind those already pending
    pub fn add_command(&self, command: Command) {
        self.shared.push(command);
    }

    /// Cloneable producer for other threads
    pub fn sender(&self) -> CommandSender {
        CommandSender {
            shared: self.shared.clone(),
        }
    }

    /// Request disconnection; the worker finishes its in-flight command first
    ///
    /// No effect once this connection has ended.
    pub fn cancel(&self) {
        let mut inner = self.shared.lock();
        if inner.generation == self.generation && inner.state != ConnectionState::Idle {
            inner.cancelled = true;
            self.shared.wake.notify_all();
        }
    }

    /// Has the worker thread exited?
    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map_or(true, |t| t.is_finished())
    }

    /// Wait for the worker thread to exit without cancelling
    pub fn join(mut self) {
        self.join_thread();
    }

    fn join_thread(&mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("Worker thread panicked");
            }
        }
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        self.cancel();
        self.join_thread();
    }
}

/// The worker thread's state; owns the link exclusively
struct Worker<L: Link> {
    shared: Arc<Shared>,
    link: L,
    port_name: String,
    config: ConnectionConfig,
    events: Sender<WorkerEvent>,
}

impl<L: Link> Worker<L> {
    fn emit(&self, event: WorkerEvent) {
        let _ = self.events.send(event);
    }

    fn transition(&self, state: ConnectionState) {
        self.shared.set_state(state);
        self.emit(WorkerEvent::State(state));
    }

    fn run(mut self) {
        info!("Worker started");

        if let Err(e) = self.link.open_port(&self.port_name, &self.config.serial) {
            warn!("Can't open a connection on {}: {}", self.port_name, e);
            self.finish(DisconnectReason::OpenFailed(e.to_string()));
            return;
        }
        info!("Connection established on {}", self.port_name);

        {
            // Read back the current setpoints so the front end shows device state
            let mut inner = self.shared.lock();
            inner.pending.clear();
            inner
                .pending
                .push_back(Command::query(CommandKind::SetVoltage));
            inner
                .pending
                .push_back(Command::query(CommandKind::SetCurrent));
            inner.state = ConnectionState::Running;
        }
        self.emit(WorkerEvent::State(ConnectionState::Running));

        let mut poll = self.config.poll_enabled.then(|| {
            PollSource::start(
                CommandSender {
                    shared: self.shared.clone(),
                },
                self.config.poll_delay(),
                self.config.poll_period(),
            )
        });

        let reason = self.serve();

        self.transition(ConnectionState::Disconnecting);
        if let Some(poll) = poll.as_mut() {
            poll.stop();
        }
        match self.link.close_port() {
            Ok(()) => info!("Connection closed"),
            Err(e) => warn!("Can't close serial port: {}", e),
        }

        self.finish(reason);
    }

    fn finish(&self, reason: DisconnectReason) {
        {
            let mut inner = self.shared.lock();
            inner.state = ConnectionState::Idle;
            inner.cancelled = false;
        }
        self.emit(WorkerEvent::State(ConnectionState::Idle));
        self.emit(WorkerEvent::Disconnected(reason));
    }

    /// Serve the queue until cancelled or the error threshold is reached
    fn serve(&mut self) -> DisconnectReason {
        let mut errors = ErrorCounter::new(self.config.error_threshold);

        loop {
            let Some(command) = self.next_command() else {
                return DisconnectReason::Requested;
            };

            match self.process(command) {
                Ok(Some(resolved)) => {
                    errors.record_success();
                    self.emit(WorkerEvent::Resolved(resolved));
                }
                Ok(None) => {}
                Err(ProtocolError::Encoding(msg)) => {
                    warn!("Command not sent: {}", msg);
                }
                Err(e) => {
                    warn!("Command dropped: {}", e);
                    if errors.record_failure() {
                        warn!(
                            "{} failed commands on {}, disconnecting",
                            errors.count(),
                            self.port_name
                        );
                        return DisconnectReason::ErrorThreshold;
                    }
                }
            }
        }
    }

    /// Take the head of the queue, sleeping while it is empty
    ///
    /// Returns `None` once cancellation is requested.
    fn next_command(&self) -> Option<Command> {
        let mut inner = self.shared.lock();
        loop {
            if inner.cancelled {
                return None;
            }
            if let Some(command) = inner.pending.pop_front() {
                return Some(command);
            }
            inner = self
                .shared
                .wake
                .wait(inner)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Send one command and collect its answer; runs without the queue lock
    fn process(&mut self, mut command: Command) -> Result<Option<Command>, ProtocolError> {
        let request = command
            .encoded_request()
            .map(str::to_owned)
            .ok_or_else(|| {
                ProtocolError::Encoding(format!("{:?} has nothing to send", command.kind()))
            })?;

        let sent = self.link.write_string(&request);

        // The supply can't absorb back-to-back commands, even after a failed write
        thread::sleep(self.config.pacing());
        sent?;
        debug!("Sent: {}", request);

        if !command.answer_expected() {
            return Ok(None);
        }

        for attempt in 0..self.config.read_attempts {
            if attempt > 0 {
                thread::sleep(self.config.pacing());
            }
            let chunk = self.link.read_available_string()?;
            if command.append_reply(&chunk) {
                return Ok(Some(command));
            }
        }

        let reason = if command.reply().is_empty() {
            DecodeFailure::NoReply
        } else {
            DecodeFailure::Malformed(command.reply().to_string())
        };
        Err(ProtocolError::Decode { request, reason })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_connection_config_default() {
        let config = ConnectionConfig::default();
        assert_eq!(config.pacing(), Duration::from_millis(50));
        assert_eq!(config.poll_delay(), Duration::from_millis(500));
        assert_eq!(config.poll_period(), Duration::from_millis(1000));
        assert_eq!(config.error_threshold, 5);
        assert_eq!(config.serial.baud_rate, 9600);
        assert!(config.poll_enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = ConnectionConfig::default();
        config.pacing_ms = 0;
        assert!(matches!(config.validate(), Err(ProtocolError::Config(_))));

        let mut config = ConnectionConfig::default();
        config.error_threshold = 0;
        assert!(matches!(config.validate(), Err(ProtocolError::Config(_))));

        let mut config = ConnectionConfig::default();
        config.read_attempts = 0;
        assert!(matches!(config.validate(), Err(ProtocolError::Config(_))));
    }

    #[test]
    fn test_config_partial_json() {
        let config: ConnectionConfig =
            serde_json::from_str(r#"{ "pacing_ms": 80, "serial": { "baud_rate": 19200 } }"#)
                .unwrap();
        assert_eq!(config.pacing_ms, 80);
        assert_eq!(config.serial.baud_rate, 19200);
        assert_eq!(config.serial.read_timeout_ms, 100);
        assert_eq!(config.poll_period_ms, DEFAULT_POLL_PERIOD_MS);
    }

    #[test]
    fn test_config_file_round_trip() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.json");

        let mut config = ConnectionConfig::default();
        config.poll_enabled = false;
        config.error_threshold = 8;
        config.save(&path).unwrap();

        let loaded = ConnectionConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_config_load_rejects_invalid() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{ "poll_period_ms": 0 }"#).unwrap();
        assert!(matches!(
            ConnectionConfig::load(&path),
            Err(ProtocolError::Config(_))
        ));

        fs::write(&path, "not json").unwrap();
        assert!(matches!(
            ConnectionConfig::load(&path),
            Err(ProtocolError::Config(_))
        ));
    }

    #[test]
    fn test_error_counter_threshold() {
        let mut errors = ErrorCounter::new(5);
        for _ in 0..4 {
            assert!(!errors.record_failure());
        }
        assert!(errors.record_failure());
        assert_eq!(errors.count(), 5);
    }

    #[test]
    fn test_error_counter_success_pays_back() {
        let mut errors = ErrorCounter::new(5);
        for _ in 0..4 {
            errors.record_failure();
        }
        errors.record_success();
        assert_eq!(errors.count(), 3);
        assert!(!errors.record_failure());

        let mut fresh = ErrorCounter::new(5);
        fresh.record_success();
        assert_eq!(fresh.count(), 0);
    }

    #[test]
    fn test_communication_starts_idle() {
        let (comm, _events) = Communication::new(ConnectionConfig::default());
        assert_eq!(comm.state(), ConnectionState::Idle);
        assert_eq!(comm.pending_len(), 0);

        comm.add_command(Command::query(CommandKind::ReadVoltage));
        comm.sender()
            .add_command(Command::query(CommandKind::ReadCurrent));
        assert_eq!(comm.pending_len(), 2);
    }

    #[test]
    fn test_connect_rejects_invalid_config() {
        let mut config = ConnectionConfig::default();
        config.pacing_ms = 0;
        let (comm, _events) = Communication::new(config);
        let result = comm.connect(crate::demo::SimulatedSupply::new(), "demo");
        assert!(matches!(result, Err(ProtocolError::Config(_))));
        assert_eq!(comm.state(), ConnectionState::Idle);
    }
}
