//! Adapter engine
//!
//! Owns the link to a single ELM327 adapter: discovery, the connection
//! state machine, write/notify handle resolution and serialized command
//! exchange. Transport events are handled by one task in arrival order;
//! public operations may run concurrently with it and coordinate through
//! a short-lived lock that is never held across an await.

use std::collections::HashSet;
use std::sync::{Arc, Weak};
use std::time::Duration;

use obd_protocol::ObdError;
use parking_lot::Mutex;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::correlator::Correlator;
use crate::descriptor::{AdapterDescriptor, ChannelHandles};
use crate::initializer;
use crate::state::{ConnectionState, InitStatus, LinkFault};
use crate::transport::{
    Advertisement, BleTransport, CharacteristicInfo, CharacteristicProperties, PeripheralId,
    RadioState, TransportError, TransportEvent, WriteKind,
};

/// Everything known about the current link
#[derive(Default)]
struct LinkState {
    /// Peripherals auto-connect already tried this scan session
    auto_attempted: HashSet<PeripheralId>,
    /// Adapter being connected or connected
    adapter: Option<AdapterDescriptor>,
    /// Bumped on every teardown so stale timers can tell they are stale
    attempt: u64,
    /// Connect deadline timer for the current attempt
    deadline: Option<AbortHandle>,
    services_requested: bool,
    services_pending: usize,
    handles: ChannelHandles,
    init_started: bool,
    adapter_info: Option<String>,
    correlator: Correlator,
}

impl LinkState {
    /// Forget the adapter and everything resolved for it
    fn reset(&mut self) -> Option<AdapterDescriptor> {
        if let Some(deadline) = self.deadline.take() {
            deadline.abort();
        }
        self.attempt = self.attempt.wrapping_add(1);
        self.services_requested = false;
        self.services_pending = 0;
        self.handles.clear();
        self.init_started = false;
        self.adapter_info = None;
        self.correlator.fail(ObdError::NotConnected);
        self.adapter.take()
    }

    fn is_current(&self, id: &PeripheralId) -> bool {
        self.adapter.as_ref().map(|a| &a.id) == Some(id)
    }
}

pub(crate) struct EngineInner {
    transport: Arc<dyn BleTransport>,
    config: EngineConfig,
    link: Mutex<LinkState>,
    state_tx: watch::Sender<ConnectionState>,
    init_tx: watch::Sender<InitStatus>,
    discovered_tx: watch::Sender<Vec<AdapterDescriptor>>,
    /// Held for the duration of one or more commands
    command_gate: tokio::sync::Mutex<()>,
    event_loop: Mutex<Option<AbortHandle>>,
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        if let Some(task) = self.event_loop.get_mut().take() {
            task.abort();
        }
    }
}

/// Link to one ELM327 adapter over Bluetooth LE
///
/// Cloning yields another handle to the same engine.
#[derive(Clone)]
pub struct AdapterEngine {
    inner: Arc<EngineInner>,
}

/// Exclusive use of the command channel
///
/// Commands sent through one session are never interleaved with commands
/// from other callers. Dropping the session releases the channel. A
/// session belongs to the connection it was opened on; once that link is
/// torn down every send fails with [`ObdError::NotConnected`], even after
/// a reconnect.
pub struct CommandSession<'a> {
    inner: &'a EngineInner,
    attempt: u64,
    _gate: tokio::sync::MutexGuard<'a, ()>,
}

impl CommandSession<'_> {
    /// Send one command and wait for its prompt-terminated reply
    pub async fn send(&mut self, command: &str) -> Result<String, ObdError> {
        self.inner.exchange(command, self.attempt).await
    }
}

impl AdapterEngine {
    /// Create an engine and start processing transport events
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(transport: Arc<dyn BleTransport>, config: EngineConfig) -> Self {
        let events = transport.events();
        let inner = Arc::new(EngineInner {
            transport,
            config,
            link: Mutex::new(LinkState::default()),
            state_tx: watch::channel(ConnectionState::Disconnected).0,
            init_tx: watch::channel(InitStatus::Idle).0,
            discovered_tx: watch::channel(Vec::new()).0,
            command_gate: tokio::sync::Mutex::new(()),
            event_loop: Mutex::new(None),
        });
        let task = tokio::spawn(run_event_loop(Arc::downgrade(&inner), events));
        *inner.event_loop.lock() = Some(task.abort_handle());
        Self { inner }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    /// Watch connection state changes
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Current initialization progress
    pub fn init_status(&self) -> InitStatus {
        self.inner.init_tx.borrow().clone()
    }

    pub fn subscribe_init(&self) -> watch::Receiver<InitStatus> {
        self.inner.init_tx.subscribe()
    }

    /// Adapters discovered in the current scan session, in discovery order
    pub fn discovered_adapters(&self) -> Vec<AdapterDescriptor> {
        self.inner.discovered_tx.borrow().clone()
    }

    pub fn subscribe_discovered(&self) -> watch::Receiver<Vec<AdapterDescriptor>> {
        self.inner.discovered_tx.subscribe()
    }

    /// Adapter being connected or connected
    pub fn adapter(&self) -> Option<AdapterDescriptor> {
        self.inner.link.lock().adapter.clone()
    }

    /// Identification string reported by `ATI` during initialization
    pub fn adapter_info(&self) -> Option<String> {
        self.inner.link.lock().adapter_info.clone()
    }

    /// Begin a discovery session
    pub async fn start_scanning(&self) -> Result<(), ObdError> {
        self.inner.start_scanning().await
    }

    /// End the discovery session
    pub async fn stop_scanning(&self) {
        self.inner.stop_scanning().await
    }

    /// Connect to a discovered adapter
    ///
    /// Returns once the request is issued; progress is reported through
    /// [`AdapterEngine::subscribe_state`]. Initialization starts on its own
    /// once the write and notify handles are resolved.
    pub async fn connect(&self, adapter: AdapterDescriptor) {
        self.inner.connect(adapter).await
    }

    /// Tear down the link; never fails
    pub async fn disconnect(&self) {
        self.inner.disconnect().await
    }

    /// Run the startup sequence if it is not already running or done
    pub async fn initialize(&self) -> Result<(), ObdError> {
        self.inner.initialize().await
    }

    /// Wait for a connected and initialized adapter
    pub async fn wait_until_ready(&self, limit: Duration) -> Result<(), ObdError> {
        self.inner.wait_until_ready(limit).await
    }

    /// Exclusive access to the command channel for a multi-command sequence
    pub async fn session(&self) -> CommandSession<'_> {
        self.inner.session().await
    }

    /// Send one command and return its reply without the prompt
    pub async fn send_command(&self, command: &str) -> Result<String, ObdError> {
        self.session().await.send(command).await
    }
}

async fn run_event_loop(engine: Weak<EngineInner>, mut events: broadcast::Receiver<TransportEvent>) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "Transport events dropped");
                continue;
            }
            Err(RecvError::Closed) => break,
        };
        let Some(inner) = engine.upgrade() else {
            break;
        };
        inner.handle_event(event).await;
    }
    debug!("Transport event loop stopped");
}

fn write_kind(characteristic: &CharacteristicInfo) -> WriteKind {
    if characteristic
        .properties
        .contains(CharacteristicProperties::WRITE_WITHOUT_RESPONSE)
    {
        WriteKind::WithoutResponse
    } else {
        WriteKind::WithResponse
    }
}

fn connect_fault(error: TransportError) -> LinkFault {
    match error {
        TransportError::Unavailable(radio) => LinkFault::from_radio(radio)
            .unwrap_or_else(|| LinkFault::ConnectionFailed(error.to_string())),
        other => LinkFault::ConnectionFailed(other.to_string()),
    }
}

impl EngineInner {
    fn state(&self) -> ConnectionState {
        self.state_tx.borrow().clone()
    }

    fn set_state(&self, next: ConnectionState) {
        let previous = self.state_tx.send_replace(next.clone());
        if previous != next {
            info!(from = %previous, to = %next, "Connection state changed");
        }
    }

    /// Reset the link and publish `next`; returns the adapter to release
    fn teardown(&self, link: &mut LinkState, next: ConnectionState) -> Option<AdapterDescriptor> {
        let adapter = link.reset();
        self.set_state(next);
        self.init_tx.send_replace(InitStatus::Idle);
        adapter
    }

    async fn release(&self, adapter: Option<AdapterDescriptor>) {
        if let Some(adapter) = adapter {
            if let Err(e) = self.transport.disconnect(&adapter.id).await {
                debug!(adapter = %adapter.name, error = %e, "Transport disconnect failed");
            }
        }
    }

    async fn start_scanning(&self) -> Result<(), ObdError> {
        if matches!(
            self.state(),
            ConnectionState::Connecting | ConnectionState::Connected
        ) {
            self.disconnect().await;
        }

        let radio = self.transport.radio_state().await;
        if let Some(fault) = LinkFault::from_radio(radio) {
            warn!(radio = %radio, "Cannot scan");
            self.set_state(ConnectionState::Error(fault.clone()));
            return Err(fault.into());
        }

        self.link.lock().auto_attempted.clear();
        self.discovered_tx.send_replace(Vec::new());
        self.set_state(ConnectionState::Scanning);
        info!("Scanning for OBD adapters");

        if let Err(e) = self.transport.start_scan().await {
            let fault = match e {
                TransportError::Unavailable(radio) => LinkFault::from_radio(radio)
                    .unwrap_or_else(|| LinkFault::Transport(e.to_string())),
                other => LinkFault::Transport(other.to_string()),
            };
            warn!(fault = %fault, "Scan failed to start");
            self.set_state(ConnectionState::Error(fault.clone()));
            return Err(fault.into());
        }
        Ok(())
    }

    async fn stop_scanning(&self) {
        if let Err(e) = self.transport.stop_scan().await {
            debug!(error = %e, "Stop scan failed");
        }
        if self.state() == ConnectionState::Scanning {
            self.set_state(ConnectionState::Disconnected);
        }
    }

    async fn connect(self: &Arc<Self>, adapter: AdapterDescriptor) {
        if self.state() == ConnectionState::Scanning {
            if let Err(e) = self.transport.stop_scan().await {
                debug!(error = %e, "Stop scan failed");
            }
        }

        let (attempt, previous) = {
            let mut link = self.link.lock();
            let previous = self.teardown(&mut link, ConnectionState::Connecting);
            link.adapter = Some(adapter.clone());
            (link.attempt, previous)
        };
        if let Some(previous) = previous.filter(|p| p.id != adapter.id) {
            self.release(Some(previous)).await;
        }
        self.discovered_tx.send_replace(Vec::new());
        info!(adapter = %adapter.name, id = %adapter.id, "Connecting to adapter");

        let engine = Arc::downgrade(self);
        let limit = self.config.connect_timeout();
        let deadline = tokio::spawn(async move {
            tokio::time::sleep(limit).await;
            if let Some(inner) = engine.upgrade() {
                inner.on_connect_deadline(attempt).await;
            }
        });
        {
            let mut link = self.link.lock();
            if link.attempt == attempt {
                link.deadline = Some(deadline.abort_handle());
            } else {
                deadline.abort();
            }
        }

        if let Err(e) = self.transport.connect(&adapter.id).await {
            let still_current = self.link.lock().attempt == attempt;
            if still_current {
                self.fail_connection(connect_fault(e)).await;
            }
        }
    }

    async fn disconnect(&self) {
        if self.state() == ConnectionState::Scanning {
            if let Err(e) = self.transport.stop_scan().await {
                debug!(error = %e, "Stop scan failed");
            }
        }
        let adapter = {
            let mut link = self.link.lock();
            self.teardown(&mut link, ConnectionState::Disconnected)
        };
        if let Some(adapter) = &adapter {
            info!(adapter = %adapter.name, "Disconnecting from adapter");
        }
        self.release(adapter).await;
    }

    async fn fail_connection(&self, fault: LinkFault) {
        warn!(fault = %fault, "Adapter link failed");
        let adapter = {
            let mut link = self.link.lock();
            if self.state() == ConnectionState::Connecting {
                metrics::counter!("obd_connections_total", "outcome" => "failed").increment(1);
            }
            self.teardown(&mut link, ConnectionState::Error(fault))
        };
        self.release(adapter).await;
    }

    async fn on_connect_deadline(&self, attempt: u64) {
        let adapter = {
            let mut link = self.link.lock();
            if link.attempt != attempt || self.state() != ConnectionState::Connecting {
                return;
            }
            // This task is the deadline; aborting it would cut the release short
            link.deadline = None;
            let fault = LinkFault::ConnectionTimeout(self.config.connect_timeout_ms);
            warn!(fault = %fault, "Adapter link failed");
            metrics::counter!("obd_connections_total", "outcome" => "timeout").increment(1);
            self.teardown(&mut link, ConnectionState::Error(fault))
        };
        self.release(adapter).await;
    }

    async fn handle_event(self: &Arc<Self>, event: TransportEvent) {
        match event {
            TransportEvent::Discovered(advertisement) => self.on_discovered(advertisement),
            TransportEvent::Connected(id) => self.on_connected(id).await,
            TransportEvent::ConnectFailed { id, reason } => self.on_connect_failed(id, reason).await,
            TransportEvent::Disconnected(id) => self.on_disconnected(id),
            TransportEvent::ServicesDiscovered { id, services } => {
                self.on_services_discovered(id, services).await
            }
            TransportEvent::CharacteristicsDiscovered {
                id,
                characteristics,
                ..
            } => self.on_characteristics_discovered(id, characteristics).await,
            TransportEvent::ValueChanged {
                id,
                characteristic,
                value,
            } => self.on_value_changed(id, characteristic, &value),
            TransportEvent::RadioStateChanged(radio) => self.on_radio_state(radio).await,
        }
    }

    fn on_discovered(self: &Arc<Self>, advertisement: Advertisement) {
        if self.state() != ConnectionState::Scanning {
            return;
        }
        let descriptor = AdapterDescriptor::from_advertisement(advertisement);
        let added = self.discovered_tx.send_if_modified(|adapters| {
            if adapters.iter().any(|a| a.id == descriptor.id) {
                return false;
            }
            adapters.push(descriptor.clone());
            true
        });
        if !added {
            return;
        }
        debug!(
            name = %descriptor.name,
            id = %descriptor.id,
            rssi = ?descriptor.rssi,
            obd = descriptor.is_obd_adapter,
            "Peripheral discovered"
        );

        if !self.config.auto_connect
            || !descriptor.connectable
            || !descriptor.matches_any(&self.config.known_adapter_names)
        {
            return;
        }
        if !self.link.lock().auto_attempted.insert(descriptor.id.clone()) {
            return;
        }

        info!(adapter = %descriptor.name, "Known adapter found, connecting automatically");
        let engine = Arc::downgrade(self);
        let settle = self.config.auto_connect_settle();
        tokio::spawn(async move {
            tokio::time::sleep(settle).await;
            let Some(inner) = engine.upgrade() else {
                return;
            };
            if inner.state() == ConnectionState::Scanning {
                inner.connect(descriptor).await;
            }
        });
    }

    async fn on_connected(&self, id: PeripheralId) {
        let request = {
            let mut link = self.link.lock();
            let wanted = link.is_current(&id)
                && !link.services_requested
                && self.state() == ConnectionState::Connecting;
            if wanted {
                link.services_requested = true;
            }
            wanted
        };
        if !request {
            debug!(id = %id, "Ignoring connection event");
            return;
        }
        debug!(id = %id, "Link up, discovering services");
        if let Err(e) = self.transport.discover_services(&id).await {
            self.fail_connection(LinkFault::Transport(e.to_string())).await;
        }
    }

    async fn on_connect_failed(&self, id: PeripheralId, reason: String) {
        let current = {
            let link = self.link.lock();
            link.is_current(&id) && self.state() == ConnectionState::Connecting
        };
        if current {
            self.fail_connection(LinkFault::ConnectionFailed(reason)).await;
        }
    }

    fn on_disconnected(&self, id: PeripheralId) {
        let mut link = self.link.lock();
        if !link.is_current(&id) {
            debug!(id = %id, "Ignoring disconnect of inactive peripheral");
            return;
        }
        // Until its own Connected arrives, a Disconnected belongs to the previous link
        if !link.services_requested && !self.state().is_connected() {
            debug!(id = %id, "Ignoring disconnect from an earlier link");
            return;
        }
        warn!(id = %id, "Adapter link lost");
        self.teardown(&mut link, ConnectionState::Disconnected);
    }

    async fn on_services_discovered(&self, id: PeripheralId, services: Vec<Uuid>) {
        {
            let mut link = self.link.lock();
            if !link.is_current(&id) || self.state() != ConnectionState::Connecting {
                return;
            }
            link.services_pending = services.len();
        }
        if services.is_empty() {
            self.fail_connection(LinkFault::NoUsableCharacteristics).await;
            return;
        }
        debug!(id = %id, count = services.len(), "Services discovered");
        for service in services {
            if let Err(e) = self.transport.discover_characteristics(&id, service).await {
                self.fail_connection(LinkFault::Transport(e.to_string())).await;
                return;
            }
        }
    }

    async fn on_characteristics_discovered(
        self: &Arc<Self>,
        id: PeripheralId,
        characteristics: Vec<CharacteristicInfo>,
    ) {
        let notify = {
            let mut link = self.link.lock();
            if !link.is_current(&id) || self.state() != ConnectionState::Connecting {
                return;
            }
            link.handles.offer(&characteristics);
            link.services_pending = link.services_pending.saturating_sub(1);
            match (link.handles.is_complete(), link.services_pending) {
                (true, _) => link.handles.notify.clone(),
                (false, 0) => None,
                (false, _) => return,
            }
        };
        let Some(notify) = notify else {
            self.fail_connection(LinkFault::NoUsableCharacteristics).await;
            return;
        };

        if let Err(e) = self.transport.subscribe(&id, &notify).await {
            self.fail_connection(LinkFault::Transport(e.to_string())).await;
            return;
        }

        let start_init = {
            let mut link = self.link.lock();
            if !link.is_current(&id) || self.state() != ConnectionState::Connecting {
                return;
            }
            if let Some(deadline) = link.deadline.take() {
                deadline.abort();
            }
            self.set_state(ConnectionState::Connected);
            !link.init_started
        };
        metrics::counter!("obd_connections_total", "outcome" => "connected").increment(1);
        info!(id = %id, notify = %notify.uuid, "Adapter channel ready");

        if start_init {
            let inner = Arc::clone(self);
            tokio::spawn(async move {
                if let Err(e) = inner.initialize().await {
                    warn!(error = %e, "Adapter initialization failed");
                }
            });
        }
    }

    fn on_value_changed(&self, id: PeripheralId, characteristic: Uuid, value: &[u8]) {
        let mut link = self.link.lock();
        let subscribed = link.handles.notify.as_ref().map(|c| c.uuid) == Some(characteristic);
        if link.is_current(&id) && subscribed {
            link.correlator.feed(value);
        }
    }

    async fn on_radio_state(&self, radio: RadioState) {
        match LinkFault::from_radio(radio) {
            Some(fault) => self.fail_connection(fault).await,
            None => {
                if matches!(
                    self.state(),
                    ConnectionState::Error(
                        LinkFault::PoweredOff | LinkFault::Unauthorized | LinkFault::Unsupported
                    )
                ) {
                    info!("Bluetooth radio available again");
                    self.set_state(ConnectionState::Disconnected);
                }
            }
        }
    }

    async fn session(&self) -> CommandSession<'_> {
        let gate = self.command_gate.lock().await;
        let attempt = self.link.lock().attempt;
        CommandSession {
            inner: self,
            attempt,
            _gate: gate,
        }
    }

    /// Session bound to `attempt` rather than the link current once the gate opens
    async fn session_for(&self, attempt: u64) -> CommandSession<'_> {
        CommandSession {
            inner: self,
            attempt,
            _gate: self.command_gate.lock().await,
        }
    }

    async fn exchange(&self, command: &str, attempt: u64) -> Result<String, ObdError> {
        let command = command.trim();
        if command.is_empty() {
            return Err(ObdError::InvalidCommand("empty command".to_string()));
        }

        let (id, peripheral, write, response) = {
            let mut link = self.link.lock();
            let ready = link.attempt == attempt
                && self.state().is_connected()
                && link.handles.is_complete();
            let (Some(adapter), Some(write), true) =
                (link.adapter.clone(), link.handles.write.clone(), ready)
            else {
                return Err(ObdError::NotConnected);
            };
            let (id, response) = link.correlator.arm();
            (id, adapter.id, write, response)
        };

        metrics::counter!("obd_commands_total").increment(1);
        debug!(command, request = id, "Sending command");
        let payload = format!("{}\r", command);
        if let Err(e) = self
            .transport
            .write(&peripheral, &write, payload.as_bytes(), write_kind(&write))
            .await
        {
            self.link.lock().correlator.cancel(id);
            return Err(ObdError::Transport(e.to_string()));
        }

        match tokio::time::timeout(self.config.command_timeout(), response).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ObdError::NotConnected),
            Err(_) => {
                self.link.lock().correlator.cancel(id);
                metrics::counter!("obd_command_timeouts_total").increment(1);
                warn!(command, timeout_ms = self.config.command_timeout_ms, "Command timed out");
                Err(ObdError::Timeout(self.config.command_timeout_ms))
            }
        }
    }

    async fn initialize(&self) -> Result<(), ObdError> {
        let attempt = {
            let mut link = self.link.lock();
            if link.init_started {
                return Ok(());
            }
            if !self.state().is_connected() {
                return Err(ObdError::NotConnected);
            }
            link.init_started = true;
            link.attempt
        };
        self.init_tx.send_replace(InitStatus::Running);
        info!(protocol = ?self.config.protocol, "Initializing adapter");

        let outcome = {
            let mut session = self.session_for(attempt).await;
            initializer::run(&mut session, &self.config).await
        };

        // A run that outlived its link must not touch the next one's status
        let mut link = self.link.lock();
        if link.attempt != attempt {
            debug!(attempt, "Discarding initialization result of a closed link");
            return Err(outcome.err().unwrap_or(ObdError::NotConnected));
        }
        match outcome {
            Ok(adapter_info) => {
                link.adapter_info = adapter_info;
                self.init_tx.send_replace(InitStatus::Ready);
                info!("Adapter initialized");
                Ok(())
            }
            Err(e) => {
                link.init_started = false;
                let status = if self.state().is_connected() {
                    InitStatus::Failed(e.to_string())
                } else {
                    InitStatus::Idle
                };
                self.init_tx.send_replace(status);
                Err(e)
            }
        }
    }

    async fn wait_until_ready(&self, limit: Duration) -> Result<(), ObdError> {
        tokio::time::timeout(limit, self.wait_ready())
            .await
            .map_err(|_| ObdError::Timeout(limit.as_millis() as u64))?
    }

    async fn wait_ready(&self) -> Result<(), ObdError> {
        let mut state_rx = self.state_tx.subscribe();
        let mut init_rx = self.init_tx.subscribe();
        loop {
            let state = state_rx.borrow_and_update().clone();
            let init = init_rx.borrow_and_update().clone();
            match (state, init) {
                (ConnectionState::Connected, InitStatus::Ready) => return Ok(()),
                (ConnectionState::Connected, InitStatus::Failed(reason)) => {
                    return Err(ObdError::InitializationFailed(reason))
                }
                (ConnectionState::Error(fault), _) => return Err(fault.into()),
                (ConnectionState::Disconnected, _) => return Err(ObdError::NotConnected),
                _ => {}
            }
            tokio::select! {
                changed = state_rx.changed() => changed.map_err(|_| ObdError::NotConnected)?,
                changed = init_rx.changed() => changed.map_err(|_| ObdError::NotConnected)?,
            }
        }
    }
}
