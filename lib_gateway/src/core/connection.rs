//! # Cloud Connection State Machine
//!
//! Owns the single outbound relay session and every decision around it: when
//! to register, when to dial, when to drop, and when to wait. One tokio task
//! drives the machine; the public handle is cheap to clone around the rest
//! of the controller and never blocks on network I/O.
//!
//! ```text
//! Disabled -> Disconnected -> Registering -> Connecting -> Connected
//!                 ^                |             |             |
//!                 +----------------+-------------+-------------+
//! ```
//!
//! Externally `Registering` and `Connecting` both read as "connecting"; the
//! split only matters to the machine itself. Every transition away from
//! `Connected` clears the outbound queue: messages accepted before a drop
//! are lost, never replayed into a session they were not accepted for.
//!
//! Session teardown is classified by how long the session lived. A session
//! dropped within the auth grace window counts as an authentication failure
//! and feeds the key-rotation ladder in [`Backoff`]; anything older is
//! ordinary network weather and only escalates the reconnect delay.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use futures_util::future::BoxFuture;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval, interval_at, sleep, timeout, Instant};

use crate::core::admission::{AdmissionConfig, AdmissionController};
use crate::core::arbitration::ArbitrationPolicy;
use crate::core::backoff::{AuthDecision, Backoff, BackoffConfig};
use crate::core::memory::{MemoryBudget, MemoryProbe};
use crate::core::queue::{OutboundQueue, QueueConfig};
use crate::transport::{Frame, SessionHandle, Transport, TransportEvent};

/// Lifecycle states of the relay connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not running, or explicitly disabled.
    Disabled,
    /// Running but between sessions.
    Disconnected,
    /// Waiting on the registration hook.
    Registering,
    /// Transport dial and handshake in flight.
    Connecting,
    /// Live session.
    Connected,
}

impl ConnectionState {
    /// External status string; the registration and handshake phases are
    /// indistinguishable to observers.
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disabled => "disabled",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Registering | ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        }
    }
}

/// Relay endpoint plus device identity, as handed to `begin()`.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub server_url: String,
    pub device_id: String,
    pub device_key: String,
}

/// Timing knobs for the state machine. Defaults mirror the tuning the
/// firmware shipped with; everything is overridable from the config layer.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Quiet period after startup before the first attempt, so boot-time
    /// allocation churn settles before the TLS handshake asks for buffers.
    pub startup_grace: Duration,
    /// Ceiling on dial plus handshake.
    pub connect_timeout: Duration,
    /// Sessions dropped within this window after connect are treated as
    /// authentication rejections.
    pub auth_grace: Duration,
    /// Application-level ping cadence.
    pub heartbeat_interval: Duration,
    /// How long to wait for the matching pong.
    pub heartbeat_timeout: Duration,
    /// Consecutive missed pongs before the session is declared dead.
    pub heartbeat_failure_limit: u32,
    /// Delay after connect before the proactive full-state push.
    pub state_push_delay: Duration,
    /// Re-arm delay when the push is deferred for low memory.
    pub state_push_deferral: Duration,
    /// Minimum free bytes for the push to go out.
    pub state_push_min_bytes: u64,
    /// Settle time between a successful registration and the dial.
    pub post_register_settle: Duration,
    /// Fixed retry delay after a memory-forced disconnect.
    pub memory_retry_delay: Duration,
    /// Poll cadence of the idle (between-sessions) loop.
    pub idle_tick: Duration,
    /// Queue drain cadence while connected.
    pub drain_interval: Duration,
    /// Cadence of the in-session supervision checks.
    pub watchdog_interval: Duration,
    /// How far each pause request extends the local-activity window.
    pub pause_window: Duration,
    pub admission: AdmissionConfig,
    pub queue: QueueConfig,
    pub backoff: BackoffConfig,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            startup_grace: Duration::from_secs(15),
            connect_timeout: Duration::from_secs(20),
            auth_grace: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(15),
            heartbeat_timeout: Duration::from_secs(8),
            heartbeat_failure_limit: 2,
            state_push_delay: Duration::from_secs(3),
            state_push_deferral: Duration::from_secs(2),
            state_push_min_bytes: 35_000,
            post_register_settle: Duration::from_secs(2),
            memory_retry_delay: Duration::from_secs(30),
            idle_tick: Duration::from_millis(500),
            drain_interval: Duration::from_millis(100),
            watchdog_interval: Duration::from_secs(1),
            pause_window: Duration::from_secs(30),
            admission: AdmissionConfig::default(),
            queue: QueueConfig::default(),
            backoff: BackoffConfig::default(),
        }
    }
}

/// Decoded relay message handler. Invoked from the connection task after all
/// internal bookkeeping for the message is done, so reentrant `send()` calls
/// observe consistent state.
pub type CommandCallback = Arc<dyn Fn(&str, Value) + Send + Sync>;

/// Async hook returning success. Used for registration and key rotation.
pub type AsyncHook = Arc<dyn Fn() -> BoxFuture<'static, bool> + Send + Sync>;

struct Inner {
    config: ConnectionConfig,
    admission: AdmissionController,
    arbitration: ArbitrationPolicy,
    queue: OutboundQueue,
    backoff: Backoff,
    probe: Arc<dyn MemoryProbe>,
    transport: Arc<dyn Transport>,
    state: RwLock<ConnectionState>,
    credentials: RwLock<Credentials>,
    registered: AtomicBool,
    enabled: AtomicBool,
    /// Bumped by `begin()`; a live session restarts when it observes a bump
    /// so fresh credentials take effect without waiting for a natural drop.
    epoch: AtomicU64,
    /// Deadline of the one-shot proactive state push for the live session.
    /// `None` once it fired, was cancelled, or no session is up.
    pending_state_push: Mutex<Option<Instant>>,
    on_command: RwLock<Option<CommandCallback>>,
    on_register: RwLock<Option<AsyncHook>>,
    on_regenerate_key: RwLock<Option<AsyncHook>>,
}

impl Inner {
    fn set_state(&self, next: ConnectionState) {
        let mut state = self.state.write().unwrap();
        if *state != next {
            log::debug!("[cloud] state {} -> {}", state.as_str(), next.as_str());
            *state = next;
        }
    }

    fn state(&self) -> ConnectionState {
        *self.state.read().unwrap()
    }
}

/// Public handle to the connection state machine.
pub struct CloudConnection {
    inner: Arc<Inner>,
    shutdown: broadcast::Sender<()>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl CloudConnection {
    /// Builds the machine in `Disabled`; nothing runs until `begin()`.
    ///
    /// Queued payloads are charged against a dedicated pool sized to the
    /// queue's worst case, distinct from whatever pool `probe` samples, so a
    /// burst of sends cannot itself trip the low-memory disconnect.
    pub fn new(
        transport: Arc<dyn Transport>,
        probe: Arc<dyn MemoryProbe>,
        config: ConnectionConfig,
    ) -> Self {
        let pool = (config.queue.capacity * config.queue.max_message_bytes) as u64;
        let queue = OutboundQueue::new(config.queue.clone())
            .with_budget(Arc::new(MemoryBudget::new(pool)));
        let (shutdown, _) = broadcast::channel(1);
        let inner = Arc::new(Inner {
            admission: AdmissionController::new(config.admission.clone()),
            arbitration: ArbitrationPolicy::new(config.pause_window),
            queue,
            backoff: Backoff::new(config.backoff.clone()),
            probe,
            transport,
            state: RwLock::new(ConnectionState::Disabled),
            credentials: RwLock::new(Credentials::default()),
            registered: AtomicBool::new(false),
            enabled: AtomicBool::new(false),
            epoch: AtomicU64::new(0),
            pending_state_push: Mutex::new(None),
            on_command: RwLock::new(None),
            on_register: RwLock::new(None),
            on_regenerate_key: RwLock::new(None),
            config,
        });
        Self {
            inner,
            shutdown,
            task: Mutex::new(None),
        }
    }

    /// Stores credentials, enables the machine, and starts the connection
    /// task if it is not already running. Must be called on the runtime.
    ///
    /// Calling again with new credentials restarts any live session and
    /// clears the auth-failure cooldown: fresh credentials are an external
    /// reset of the recovery ladder.
    pub fn begin(&self, server_url: &str, device_id: &str, device_key: &str) {
        {
            let mut creds = self.inner.credentials.write().unwrap();
            *creds = Credentials {
                server_url: server_url.to_string(),
                device_id: device_id.to_string(),
                device_key: device_key.to_string(),
            };
        }
        self.inner.registered.store(false, Ordering::Relaxed);
        self.inner.enabled.store(true, Ordering::Relaxed);
        self.inner.backoff.reset_auth_and_delay();
        self.inner.epoch.fetch_add(1, Ordering::Relaxed);
        self.inner.set_state(ConnectionState::Disconnected);

        let mut task = self.task.lock().unwrap();
        if task.is_none() {
            let inner = self.inner.clone();
            let shutdown = self.shutdown.subscribe();
            *task = Some(tokio::spawn(run(inner, shutdown)));
        }
        log::info!(
            "[cloud] initialized: server={}, device={}",
            server_url,
            device_id
        );
    }

    /// Disables the machine and stops the connection task. Queued messages
    /// are discarded. `begin()` starts it again.
    pub fn end(&self) {
        self.inner.enabled.store(false, Ordering::Relaxed);
        let _ = self.shutdown.send(());
        self.inner.queue.clear();
        self.inner.set_state(ConnectionState::Disabled);
        // The task observes the shutdown and exits on its own.
        self.task.lock().unwrap().take();
        log::info!("[cloud] disabled");
    }

    /// Soft enable/disable without touching stored credentials. Disabling
    /// tears everything down like `end()`; re-enabling requires `begin()`
    /// because the task is gone.
    pub fn set_enabled(&self, enabled: bool) {
        if enabled {
            if !self.inner.enabled.swap(true, Ordering::Relaxed) {
                self.inner.backoff.clear_wait();
                log::info!("[cloud] connection enabled");
            }
        } else if self.inner.enabled.load(Ordering::Relaxed) {
            self.end();
        }
    }

    /// Queues a pre-serialized JSON message for the live session. Returns
    /// `false` (dropping the message) when not connected, when the payload
    /// is oversized, or when the queue is full.
    pub fn send(&self, json: &str) -> bool {
        if self.state() != ConnectionState::Connected {
            log::debug!("[cloud] not connected, dropping outbound message");
            return false;
        }
        self.inner.queue.enqueue(json.as_bytes().to_vec(), false)
    }

    /// Queues a binary payload under the same rules as [`send`].
    ///
    /// [`send`]: CloudConnection::send
    pub fn send_binary(&self, data: &[u8]) -> bool {
        if self.state() != ConnectionState::Connected {
            log::debug!("[cloud] not connected, dropping outbound frame");
            return false;
        }
        self.inner.queue.enqueue(data.to_vec(), true)
    }

    /// Signals local client activity, extending the pause window.
    pub fn pause(&self) {
        self.inner.arbitration.pause();
    }

    /// Clears the pause window. If one was active, the next attempt may run
    /// immediately instead of waiting out a stale backoff.
    pub fn resume(&self) {
        if self.inner.arbitration.resume() {
            self.inner.backoff.clear_wait();
        }
    }

    /// Cancels the scheduled proactive state push for the current session.
    /// Called when fresh state already reached the relay through another
    /// path, so the round-trip would be redundant.
    pub fn cancel_state_push(&self) {
        if self.inner.pending_state_push.lock().unwrap().take().is_some() {
            log::debug!("[cloud] pending state push cancelled");
        }
    }

    /// Handler for decoded relay messages the machine does not consume
    /// itself. Receives the message type and the full decoded payload.
    pub fn on_command<F>(&self, callback: F)
    where
        F: Fn(&str, Value) + Send + Sync + 'static,
    {
        *self.inner.on_command.write().unwrap() = Some(Arc::new(callback));
    }

    /// Hook run before the first dial (and after any key rotation) to ensure
    /// the device is registered with the cloud. Absent hook means the caller
    /// guarantees the device is already paired.
    pub fn on_register<F>(&self, hook: F)
    where
        F: Fn() -> BoxFuture<'static, bool> + Send + Sync + 'static,
    {
        *self.inner.on_register.write().unwrap() = Some(Arc::new(hook));
    }

    /// Hook invoked by auth-failure recovery to rotate the device key.
    pub fn on_regenerate_key<F>(&self, hook: F)
    where
        F: Fn() -> BoxFuture<'static, bool> + Send + Sync + 'static,
    {
        *self.inner.on_regenerate_key.write().unwrap() = Some(Arc::new(hook));
    }

    /// Swaps in a rotated device key for the next attempt. The rotation hook
    /// calls this after persisting the new key.
    pub fn set_device_key(&self, device_key: &str) {
        self.inner.credentials.write().unwrap().device_key = device_key.to_string();
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// External status string for the local UI.
    pub fn status(&self) -> &'static str {
        self.state().as_str()
    }

    /// Accepted-then-dropped connections since the last proven session.
    pub fn auth_failure_count(&self) -> u32 {
        self.inner.backoff.auth_failures()
    }

    pub fn queued(&self) -> usize {
        self.inner.queue.len()
    }
}

/// Why a live session ended, as seen by the outer loop.
enum SessionEnd {
    Shutdown,
    /// `begin()` bumped the epoch; reconnect immediately with fresh
    /// credentials.
    Restart,
    Closed(Option<String>),
    Error(String),
    HeartbeatLost,
    MemoryCritical,
    PausedUnderPressure,
}

fn received_shutdown(shutdown: &mut broadcast::Receiver<()>) -> bool {
    use broadcast::error::TryRecvError;
    !matches!(shutdown.try_recv(), Err(TryRecvError::Empty))
}

async fn run(inner: Arc<Inner>, mut shutdown: broadcast::Receiver<()>) {
    log::info!(
        "[cloud] connection task started ({}s startup grace)",
        inner.config.startup_grace.as_secs()
    );
    tokio::select! {
        _ = shutdown.recv() => {
            inner.set_state(ConnectionState::Disabled);
            return;
        }
        _ = sleep(inner.config.startup_grace) => {}
    }

    'outer: loop {
        // Idle phase: poll the gates until an attempt is admitted.
        loop {
            if received_shutdown(&mut shutdown) {
                break 'outer;
            }
            if !inner.enabled.load(Ordering::Relaxed) {
                inner.set_state(ConnectionState::Disabled);
                sleep(inner.config.idle_tick).await;
                continue;
            }
            inner.set_state(ConnectionState::Disconnected);
            if inner.arbitration.is_paused() {
                sleep(inner.config.idle_tick).await;
                continue;
            }
            let reading = inner.probe.read();
            if let Some(slow) = inner.admission.poll_delay_escalation(&reading) {
                if inner.backoff.current_delay() < slow {
                    log::warn!(
                        "[cloud] memory low for over {}s, slowing retries to every {}s",
                        inner.config.admission.low_memory_window.as_secs(),
                        slow.as_secs()
                    );
                    inner.backoff.set_delay(slow);
                }
            }
            if !inner.admission.can_attempt_connect(&reading) {
                log::debug!(
                    "[cloud] deferring connection: free={} largest={}",
                    reading.free_bytes,
                    reading.largest_block
                );
                inner.backoff.mark_attempt();
                sleep(inner.config.idle_tick).await;
                continue;
            }
            if !inner.backoff.ready() {
                sleep(inner.config.idle_tick).await;
                continue;
            }
            break;
        }

        let creds = inner.credentials.read().unwrap().clone();
        if creds.server_url.is_empty() || creds.device_id.is_empty() {
            log::warn!("[cloud] cannot connect: missing server url or device id");
            inner.backoff.mark_attempt();
            continue;
        }

        // Registration phase, skipped once proven until a key rotation.
        if !inner.registered.load(Ordering::Relaxed) {
            let hook = inner.on_register.read().unwrap().clone();
            match hook {
                None => {
                    log::debug!("[cloud] no registration hook, assuming already paired");
                    inner.registered.store(true, Ordering::Relaxed);
                }
                Some(hook) => {
                    inner.set_state(ConnectionState::Registering);
                    inner.backoff.mark_attempt();
                    let ok = tokio::select! {
                        _ = shutdown.recv() => break 'outer,
                        ok = hook() => ok,
                    };
                    if !ok {
                        log::warn!(
                            "[cloud] registration failed, retrying in {}s",
                            inner.config.backoff.registration_retry_delay.as_secs()
                        );
                        inner.backoff.record_failure();
                        inner
                            .backoff
                            .set_delay(inner.config.backoff.registration_retry_delay);
                        inner.set_state(ConnectionState::Disconnected);
                        continue;
                    }
                    inner.registered.store(true, Ordering::Relaxed);
                    log::info!("[cloud] registration successful");
                    // Let the network stack settle before the handshake.
                    tokio::select! {
                        _ = shutdown.recv() => break 'outer,
                        _ = sleep(inner.config.post_register_settle) => {}
                    }
                }
            }
        }

        // Dial phase.
        inner.set_state(ConnectionState::Connecting);
        inner.backoff.mark_attempt();
        let url = ws_endpoint(&creds);
        log::info!("[cloud] connecting to {}", creds.server_url);
        let dial = inner.transport.connect(&url);
        let mut session = tokio::select! {
            _ = shutdown.recv() => break 'outer,
            result = timeout(inner.config.connect_timeout, dial) => match result {
                Ok(Ok(session)) => session,
                Ok(Err(e)) => {
                    log::error!("[cloud] connect failed: {}", e);
                    inner.backoff.escalate();
                    inner.set_state(ConnectionState::Disconnected);
                    continue;
                }
                Err(_) => {
                    log::error!(
                        "[cloud] handshake timeout after {}s",
                        inner.config.connect_timeout.as_secs()
                    );
                    inner.backoff.escalate();
                    inner.set_state(ConnectionState::Disconnected);
                    continue;
                }
            }
        };

        // The transport confirms the session with its first event.
        let confirmed = tokio::select! {
            _ = shutdown.recv() => break 'outer,
            ev = timeout(inner.config.connect_timeout, session.events.recv()) => ev,
        };
        match confirmed {
            Ok(Some(TransportEvent::Connected)) => {}
            Ok(Some(TransportEvent::Error(e))) => {
                log::error!("[cloud] session failed before handshake: {}", e);
                inner.backoff.escalate();
                inner.set_state(ConnectionState::Disconnected);
                continue;
            }
            Ok(Some(TransportEvent::Closed(reason))) => {
                log::warn!(
                    "[cloud] session closed before handshake: {}",
                    reason.as_deref().unwrap_or("no reason")
                );
                inner.backoff.escalate();
                inner.set_state(ConnectionState::Disconnected);
                continue;
            }
            Ok(Some(_)) | Ok(None) => {
                log::warn!("[cloud] transport dropped before handshake");
                inner.backoff.escalate();
                inner.set_state(ConnectionState::Disconnected);
                continue;
            }
            Err(_) => {
                log::error!("[cloud] no handshake confirmation in time");
                inner.backoff.escalate();
                inner.set_state(ConnectionState::Disconnected);
                continue;
            }
        }

        let (end, session_age) = run_session(&inner, &mut shutdown, session).await;
        inner.set_state(ConnectionState::Disconnected);
        inner.queue.clear();
        inner.backoff.mark_attempt();

        match end {
            SessionEnd::Shutdown => break 'outer,
            SessionEnd::Restart => {
                log::info!("[cloud] credentials updated, restarting connection");
                inner.backoff.clear_wait();
            }
            SessionEnd::MemoryCritical => {
                inner.backoff.record_failure();
                inner.backoff.set_delay(inner.config.memory_retry_delay);
            }
            SessionEnd::PausedUnderPressure => {
                // resume() clears the wait; until then the pause window and
                // the idle gates pace any retry.
            }
            SessionEnd::HeartbeatLost => {
                log::warn!("[cloud] heartbeat lost, reconnecting");
                inner.backoff.escalate();
            }
            SessionEnd::Closed(reason) => {
                log::info!(
                    "[cloud] disconnected: {}",
                    reason.as_deref().unwrap_or("connection closed")
                );
                classify_drop(&inner, session_age).await;
            }
            SessionEnd::Error(e) => {
                log::error!("[cloud] session error: {}", e);
                classify_drop(&inner, session_age).await;
            }
        }
    }

    inner.queue.clear();
    inner.set_state(ConnectionState::Disabled);
    log::info!("[cloud] connection task stopped");
}

/// A drop within the auth grace window means the relay accepted the socket
/// and then rejected the credentials. Rotate the key (within the cap) and
/// force re-registration; past the cap, only the cooldown applies.
async fn classify_drop(inner: &Arc<Inner>, session_age: Duration) {
    if session_age >= inner.config.auth_grace {
        inner.backoff.escalate();
        return;
    }

    log::warn!(
        "[cloud] dropped {}ms after connect, treating as auth failure",
        session_age.as_millis()
    );
    match inner.backoff.record_auth_failure() {
        AuthDecision::Rotate { attempt } => {
            log::warn!(
                "[cloud] rotating device key (attempt {}/{})",
                attempt,
                inner.config.backoff.auth_failure_cap
            );
            let hook = inner.on_regenerate_key.read().unwrap().clone();
            let rotated = match hook {
                Some(hook) => hook().await,
                None => false,
            };
            if rotated {
                inner.registered.store(false, Ordering::Relaxed);
                log::info!("[cloud] device key rotated, re-registration required");
            } else {
                log::error!("[cloud] key rotation failed, retrying later");
                inner
                    .backoff
                    .set_delay(inner.config.backoff.registration_retry_delay);
            }
        }
        AuthDecision::CoolingDown => {
            log::error!(
                "[cloud] repeated auth failures, cooling down {}s (re-pair to clear)",
                inner.config.backoff.auth_cooldown.as_secs()
            );
        }
    }
}

/// Drives one live session to its end. Returns why it ended and how long it
/// lived, which the caller uses for failure classification.
async fn run_session(
    inner: &Arc<Inner>,
    shutdown: &mut broadcast::Receiver<()>,
    mut session: SessionHandle,
) -> (SessionEnd, Duration) {
    inner.set_state(ConnectionState::Connected);
    inner.backoff.reset();
    let epoch = inner.epoch.load(Ordering::Relaxed);
    let connected_at = Instant::now();
    log::info!("[cloud] connected to relay");

    let cfg = &inner.config;
    *inner.pending_state_push.lock().unwrap() = Some(connected_at + cfg.state_push_delay);
    let mut heartbeat = interval_at(connected_at + cfg.heartbeat_interval, cfg.heartbeat_interval);
    let mut drain = interval(cfg.drain_interval);
    let mut watchdog = interval(cfg.watchdog_interval);
    let mut ping_sent: Option<Instant> = None;
    let mut missed_pongs: u32 = 0;

    let end = 'session: loop {
        tokio::select! {
            _ = shutdown.recv() => break 'session SessionEnd::Shutdown,

            ev = session.events.recv() => match ev {
                Some(TransportEvent::Text(text)) => {
                    handle_text(inner, &text, &mut ping_sent, &mut missed_pongs);
                }
                Some(TransportEvent::Binary(data)) => {
                    log::debug!("[cloud] ignoring {} byte binary frame", data.len());
                }
                Some(TransportEvent::Connected) => {}
                Some(TransportEvent::Error(e)) => break 'session SessionEnd::Error(e),
                Some(TransportEvent::Closed(reason)) => break 'session SessionEnd::Closed(reason),
                None => break 'session SessionEnd::Closed(None),
            },

            _ = drain.tick() => {
                for msg in inner.queue.drain_up_to(cfg.queue.drain_batch) {
                    let frame = if msg.binary {
                        Frame::Binary(msg.payload)
                    } else {
                        Frame::Text(String::from_utf8_lossy(&msg.payload).into_owned())
                    };
                    if session.frames.send(frame).await.is_err() {
                        break 'session SessionEnd::Error("transport closed while sending".to_string());
                    }
                }
                if inner.queue.space_left() <= 1 {
                    log::warn!("[cloud] send queue nearly full ({} queued)", inner.queue.len());
                }
            }

            _ = heartbeat.tick() => {
                // One ping in flight at a time; the watchdog ages it out.
                if ping_sent.is_none() {
                    let ping = Frame::Text(r#"{"type":"ping"}"#.to_string());
                    if session.frames.send(ping).await.is_err() {
                        break 'session SessionEnd::Error("transport closed while pinging".to_string());
                    }
                    ping_sent = Some(Instant::now());
                }
            }

            _ = watchdog.tick() => {
                if inner.epoch.load(Ordering::Relaxed) != epoch {
                    break 'session SessionEnd::Restart;
                }
                if !inner.enabled.load(Ordering::Relaxed) {
                    break 'session SessionEnd::Shutdown;
                }
                if let Some(sent) = ping_sent {
                    if sent.elapsed() >= cfg.heartbeat_timeout {
                        missed_pongs += 1;
                        ping_sent = None;
                        log::warn!(
                            "[cloud] heartbeat timeout ({}/{})",
                            missed_pongs,
                            cfg.heartbeat_failure_limit
                        );
                        if missed_pongs >= cfg.heartbeat_failure_limit {
                            break 'session SessionEnd::HeartbeatLost;
                        }
                    }
                }
                let reading = inner.probe.read();
                if inner.admission.should_force_disconnect(&reading) {
                    log::warn!(
                        "[cloud] critical memory ({} bytes free), disconnecting",
                        reading.free_bytes
                    );
                    break 'session SessionEnd::MemoryCritical;
                }
                if inner.arbitration.is_paused() && inner.admission.should_pause_disconnect(&reading) {
                    log::info!("[cloud] local activity under memory pressure, yielding connection");
                    break 'session SessionEnd::PausedUnderPressure;
                }
                // Fire outside the lock: the command handler may call back
                // into the connection.
                let push_due = {
                    let mut pending = inner.pending_state_push.lock().unwrap();
                    match *pending {
                        Some(due) if Instant::now() >= due => {
                            if reading.free_bytes >= cfg.state_push_min_bytes {
                                *pending = None;
                                true
                            } else {
                                *pending = Some(Instant::now() + cfg.state_push_deferral);
                                log::warn!(
                                    "[cloud] deferring state push (free={} bytes)",
                                    reading.free_bytes
                                );
                                false
                            }
                        }
                        _ => false,
                    }
                };
                if push_due {
                    log::info!("[cloud] requesting proactive state push");
                    dispatch_command(
                        inner,
                        "request_state",
                        serde_json::json!({"type": "request_state", "source": "proactive"}),
                    );
                }
            }
        }
    };

    *inner.pending_state_push.lock().unwrap() = None;

    // Orderly close on proactive teardowns; the session is going away
    // either way, so a full channel is not an error.
    let _ = session.frames.try_send(Frame::Close);

    let age = connected_at.elapsed();
    // A session that outlived the grace window proves the credentials.
    if age >= cfg.auth_grace {
        inner.backoff.reset_auth();
    }
    (end, age)
}

/// Decodes one text frame. Heartbeat pongs and the relay's own envelope
/// messages are consumed here; everything else goes to the command handler
/// after the internal bookkeeping is done.
fn handle_text(
    inner: &Inner,
    text: &str,
    ping_sent: &mut Option<Instant>,
    missed_pongs: &mut u32,
) {
    let value: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            log::warn!("[cloud] discarding malformed message: {}", e);
            return;
        }
    };
    let msg_type = value
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    match msg_type.as_str() {
        "pong" => {
            *ping_sent = None;
            *missed_pongs = 0;
        }
        "connected" => log::info!("[cloud] relay acknowledged connection"),
        "error" => {
            let detail = value
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("unknown error");
            log::error!("[cloud] relay error: {}", detail);
        }
        "" => log::warn!("[cloud] discarding message without a type"),
        other => dispatch_command(inner, other, value),
    }
}

fn dispatch_command(inner: &Inner, msg_type: &str, payload: Value) {
    let callback = inner.on_command.read().unwrap().clone();
    match callback {
        Some(callback) => callback(msg_type, payload),
        None => log::debug!("[cloud] no handler for message type={}", msg_type),
    }
}

/// Builds the relay WebSocket endpoint from the stored credentials. Plain
/// hosts default to `wss://`; `http(s)://` bases are rewritten in kind.
fn ws_endpoint(creds: &Credentials) -> String {
    let base = if let Some(rest) = creds.server_url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = creds.server_url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else if creds.server_url.starts_with("wss://") || creds.server_url.starts_with("ws://") {
        creds.server_url.clone()
    } else {
        format!("wss://{}", creds.server_url)
    };
    let mut url = format!(
        "{}/ws/device?id={}",
        base.trim_end_matches('/'),
        creds.device_id
    );
    if !creds.device_key.is_empty() {
        url.push_str("&key=");
        url.push_str(&creds.device_key);
    }
    url
}
