//! Connection engine and client handle.
//!
//! A single spawned task owns the transport and all mutable session state.
//! [`Trainer`] methods push commands onto a queue; transport callbacks arrive
//! on a second queue; the engine task drains both with `select!`, so every
//! state mutation happens on one task in a defined order. Readers observe
//! state through a shared snapshot behind an `RwLock` that only the engine
//! task writes.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::{RwLock, mpsc};
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::event::{Event, EventDispatcher, Subscription};
use crate::protocol::{
    CharacteristicRole, ControlCommand, ControlOpcode, bike_data, control, heart_rate,
};
use crate::safety::SafetyPolicy;
use crate::transport::{BleTransport, Transport, TransportEvent};
use crate::types::{ConnectionState, PeripheralHandle, TelemetrySample};

const COMMAND_QUEUE_CAPACITY: usize = 32;
const TRANSPORT_QUEUE_CAPACITY: usize = 64;
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Commands accepted by the engine task.
#[derive(Debug)]
enum Command {
    StartScan,
    StopScan,
    Connect(PeripheralHandle),
    Disconnect,
    RequestControl,
    SetTargetPower(i16),
    SetWattageCeiling(u32),
}

/// Session state shared between the engine task and readers.
#[derive(Debug, Default)]
struct Shared {
    state: ConnectionState,
    discovered: Vec<PeripheralHandle>,
    connected: Option<PeripheralHandle>,
    telemetry: TelemetrySample,
    has_control: bool,
    target_power: i16,
    policy: SafetyPolicy,
}

struct Engine<T: Transport> {
    transport: T,
    commands_rx: mpsc::Receiver<Command>,
    transport_rx: mpsc::Receiver<TransportEvent>,
    shared: Arc<RwLock<Shared>>,
    dispatcher: EventDispatcher,
    resolved: HashSet<CharacteristicRole>,
}

impl<T: Transport> Engine<T> {
    async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.commands_rx.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                event = self.transport_rx.recv() => match event {
                    Some(event) => self.handle_transport_event(event).await,
                    None => break,
                },
            }
        }
        tracing::debug!("engine task exiting");
    }

    async fn state(&self) -> ConnectionState {
        self.shared.read().await.state
    }

    async fn set_state(&self, state: ConnectionState) {
        {
            let mut shared = self.shared.write().await;
            if shared.state == state {
                return;
            }
            tracing::debug!("state {} -> {}", shared.state, state);
            shared.state = state;
        }
        self.dispatcher.dispatch(Event::StateChanged(state));
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::StartScan => self.start_scan().await,
            Command::StopScan => self.stop_scan().await,
            Command::Connect(peripheral) => self.connect(peripheral).await,
            Command::Disconnect => self.disconnect().await,
            Command::RequestControl => self.request_control().await,
            Command::SetTargetPower(watts) => self.set_target_power(watts).await,
            Command::SetWattageCeiling(watts) => {
                self.shared.write().await.policy.set_ceiling_watts(watts);
                tracing::info!("wattage ceiling set to {}W", watts);
            }
        }
    }

    async fn start_scan(&mut self) {
        if self.state().await != ConnectionState::Idle {
            tracing::warn!("scan requested while not idle, ignoring");
            return;
        }
        self.shared.write().await.discovered.clear();
        self.set_state(ConnectionState::Scanning).await;
        if let Err(e) = self.transport.start_scan().await {
            tracing::error!("failed to start scan: {}", e);
            self.set_state(ConnectionState::Idle).await;
        }
    }

    async fn stop_scan(&mut self) {
        if self.state().await != ConnectionState::Scanning {
            return;
        }
        if let Err(e) = self.transport.stop_scan().await {
            tracing::warn!("failed to stop scan: {}", e);
        }
        self.set_state(ConnectionState::Idle).await;
    }

    async fn connect(&mut self, peripheral: PeripheralHandle) {
        let state = self.state().await;
        if state == ConnectionState::Disconnecting {
            // Teardown is in flight; accepting a connect here would let the
            // pending disconnect confirmation wipe the new session.
            tracing::warn!("connect to {} requested while disconnecting, ignoring", peripheral);
            return;
        }
        if state.is_connected() || state == ConnectionState::Connecting {
            let same = self
                .shared
                .read()
                .await
                .connected
                .as_ref()
                .is_some_and(|current| current.id == peripheral.id);
            if same {
                tracing::debug!("already connected to {}, ignoring", peripheral);
            } else {
                tracing::warn!(
                    "connect to {} requested while another connection exists, ignoring",
                    peripheral
                );
            }
            return;
        }

        if state == ConnectionState::Scanning {
            if let Err(e) = self.transport.stop_scan().await {
                tracing::warn!("failed to stop scan before connect: {}", e);
            }
        }

        self.shared.write().await.connected = Some(peripheral.clone());
        self.set_state(ConnectionState::Connecting).await;

        if let Err(e) = self.transport.connect(&peripheral).await {
            tracing::warn!("connect to {} failed: {}", peripheral, e);
            self.shared.write().await.connected = None;
            self.dispatcher.dispatch(Event::ConnectionFailed {
                reason: e.to_string(),
            });
            self.set_state(ConnectionState::Idle).await;
        }
    }

    async fn disconnect(&mut self) {
        match self.state().await {
            ConnectionState::Idle | ConnectionState::Disconnecting => {}
            ConnectionState::Scanning => self.stop_scan().await,
            _ => {
                self.set_state(ConnectionState::Disconnecting).await;
                if !self.transport.is_connected() {
                    // Nothing to tear down at the link layer; the connect
                    // attempt never produced a peripheral.
                    self.finish_disconnect(None).await;
                    return;
                }
                if let Err(e) = self.transport.disconnect().await {
                    tracing::warn!("transport disconnect failed: {}", e);
                    self.finish_disconnect(Some(e.to_string())).await;
                }
            }
        }
    }

    /// Resets session state after the link is gone, from any state.
    async fn finish_disconnect(&mut self, reason: Option<String>) {
        self.resolved.clear();
        {
            let mut shared = self.shared.write().await;
            shared.connected = None;
            shared.has_control = false;
            shared.target_power = 0;
            shared.telemetry = TelemetrySample::default();
        }
        self.dispatcher.dispatch(Event::Disconnected { reason });
        self.set_state(ConnectionState::Idle).await;
    }

    async fn request_control(&mut self) {
        if self.state().await != ConnectionState::Ready {
            tracing::warn!("control requested while not ready, ignoring");
            return;
        }
        let frame = ControlCommand::RequestControl.encode();
        if let Err(e) = self.transport.write_control(frame).await {
            tracing::warn!("request control write failed: {}", e);
            self.dispatcher.dispatch(Event::WriteFailed {
                reason: e.to_string(),
            });
        }
    }

    async fn set_target_power(&mut self, requested_watts: i16) {
        if self.state().await != ConnectionState::Ready {
            tracing::warn!("target power requested while not ready, ignoring");
            return;
        }

        let clamped = self.shared.read().await.policy.clamp(requested_watts);
        if clamped != requested_watts {
            tracing::info!(
                "clamping target power from {}W to {}W",
                requested_watts,
                clamped
            );
        }

        let frame = ControlCommand::SetTargetPower(clamped).encode();
        match self.transport.write_control(frame).await {
            Ok(()) => {
                self.shared.write().await.target_power = clamped;
                self.dispatcher
                    .dispatch(Event::TargetPowerChanged { watts: clamped });
            }
            Err(e) => {
                tracing::warn!("target power write failed: {}", e);
                self.dispatcher.dispatch(Event::WriteFailed {
                    reason: e.to_string(),
                });
            }
        }
    }

    async fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::PeripheralDiscovered(handle) => self.peripheral_discovered(handle).await,
            TransportEvent::Connected => self.link_established().await,
            TransportEvent::ConnectFailed { reason } => {
                tracing::warn!("connection failed: {}", reason);
                self.shared.write().await.connected = None;
                self.dispatcher.dispatch(Event::ConnectionFailed { reason });
                self.set_state(ConnectionState::Idle).await;
            }
            TransportEvent::Disconnected { reason } => {
                if let Some(reason) = &reason {
                    tracing::warn!("disconnected: {}", reason);
                }
                self.finish_disconnect(reason).await;
            }
            TransportEvent::CharacteristicResolved { role } => {
                self.characteristic_resolved(role).await;
            }
            TransportEvent::Notification { role, data } => self.notification(role, &data).await,
        }
    }

    async fn peripheral_discovered(&mut self, handle: PeripheralHandle) {
        if self.state().await != ConnectionState::Scanning {
            return;
        }
        {
            let mut shared = self.shared.write().await;
            if shared.discovered.iter().any(|p| p.id == handle.id) {
                return;
            }
            shared.discovered.push(handle.clone());
        }
        tracing::info!("discovered {}", handle);
        self.dispatcher.dispatch(Event::PeripheralDiscovered(handle));
    }

    async fn link_established(&mut self) {
        if self.state().await != ConnectionState::Connecting {
            tracing::warn!("unexpected connected event, ignoring");
            return;
        }
        self.set_state(ConnectionState::Connected).await;
        self.set_state(ConnectionState::Discovering).await;

        if let Err(e) = self.transport.discover().await {
            tracing::error!("service discovery failed: {}", e);
            self.dispatcher.dispatch(Event::ConnectionFailed {
                reason: e.to_string(),
            });
            if let Err(e) = self.transport.disconnect().await {
                tracing::warn!("transport disconnect failed: {}", e);
                self.finish_disconnect(None).await;
            }
        }
    }

    async fn characteristic_resolved(&mut self, role: CharacteristicRole) {
        let state = self.state().await;
        if !matches!(state, ConnectionState::Discovering | ConnectionState::Ready) {
            return;
        }
        if !self.resolved.insert(role) {
            return;
        }

        if let Err(e) = self.transport.subscribe(role).await {
            tracing::warn!("failed to subscribe to {}: {}", role, e);
            self.resolved.remove(&role);
            return;
        }

        // Heart rate is optional; telemetry and the control point are what
        // make the session usable.
        if state == ConnectionState::Discovering
            && self.resolved.contains(&CharacteristicRole::IndoorBikeData)
            && self.resolved.contains(&CharacteristicRole::ControlPoint)
        {
            self.set_state(ConnectionState::Ready).await;
        }
    }

    async fn notification(&mut self, role: CharacteristicRole, data: &[u8]) {
        // Anything arriving outside Ready belongs to a session that is being
        // torn down or was never fully established.
        if self.state().await != ConnectionState::Ready {
            tracing::trace!("dropping {} notification outside ready state", role);
            return;
        }

        match role {
            CharacteristicRole::IndoorBikeData => {
                let update = bike_data::decode(data);
                let sample = {
                    let mut shared = self.shared.write().await;
                    shared.telemetry.apply_bike_data(&update);
                    shared.telemetry
                };
                self.dispatcher.dispatch(Event::Telemetry(sample));
            }
            CharacteristicRole::HeartRateMeasurement => {
                if let Some(bpm) = heart_rate::decode(data) {
                    let sample = {
                        let mut shared = self.shared.write().await;
                        shared.telemetry.apply_heart_rate(bpm);
                        shared.telemetry
                    };
                    self.dispatcher.dispatch(Event::Telemetry(sample));
                }
            }
            CharacteristicRole::ControlPoint => {
                if let Some(response) = control::parse_response(data) {
                    if response.grants(ControlOpcode::RequestControl) {
                        self.shared.write().await.has_control = true;
                        tracing::info!("control granted");
                        self.dispatcher.dispatch(Event::ControlGranted);
                    }
                    self.dispatcher.dispatch(Event::ControlResponse(response));
                }
            }
        }
    }
}

/// Client handle to a trainer connection engine.
///
/// Cheap to construct once and hand around by reference; dropping the handle
/// aborts the engine task and severs the transport.
pub struct Trainer {
    commands_tx: mpsc::Sender<Command>,
    shared: Arc<RwLock<Shared>>,
    dispatcher: EventDispatcher,
    task: JoinHandle<()>,
}

impl Trainer {
    /// Creates a trainer backed by the system Bluetooth adapter.
    pub async fn ble() -> Result<Self> {
        let (events_tx, events_rx) = mpsc::channel(TRANSPORT_QUEUE_CAPACITY);
        let transport = BleTransport::new(events_tx).await?;
        Ok(Self::with_transport(transport, events_rx))
    }

    /// Creates a trainer over an arbitrary transport.
    ///
    /// `transport_rx` is the receiving half of the queue the transport was
    /// given at construction.
    pub fn with_transport<T>(transport: T, transport_rx: mpsc::Receiver<TransportEvent>) -> Self
    where
        T: Transport + 'static,
    {
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
        let shared = Arc::new(RwLock::new(Shared::default()));
        let dispatcher = EventDispatcher::new(EVENT_CHANNEL_CAPACITY);

        let engine = Engine {
            transport,
            commands_rx,
            transport_rx,
            shared: Arc::clone(&shared),
            dispatcher: dispatcher.clone(),
            resolved: HashSet::new(),
        };
        let task = tokio::spawn(engine.run());

        Self {
            commands_tx,
            shared,
            dispatcher,
            task,
        }
    }

    /// Subscribes to engine events.
    #[must_use]
    pub fn subscribe(&self) -> Subscription {
        self.dispatcher.subscribe()
    }

    /// Starts scanning for fitness machines. Ignored unless idle.
    pub async fn start_scan(&self) -> Result<()> {
        self.send(Command::StartScan).await
    }

    /// Stops an in-progress scan.
    pub async fn stop_scan(&self) -> Result<()> {
        self.send(Command::StopScan).await
    }

    /// Connects to a previously discovered peripheral.
    ///
    /// The outcome arrives as events; a repeated connect to the current
    /// peripheral is a no-op, and a connect to a different peripheral while
    /// one is active is ignored.
    pub async fn connect(&self, peripheral: &PeripheralHandle) -> Result<()> {
        self.send(Command::Connect(peripheral.clone())).await
    }

    /// Disconnects from the current peripheral, or stops scanning.
    pub async fn disconnect(&self) -> Result<()> {
        self.send(Command::Disconnect).await
    }

    /// Asks the machine for control authority. The grant arrives as
    /// [`Event::ControlGranted`].
    pub async fn request_control(&self) -> Result<()> {
        self.send(Command::RequestControl).await
    }

    /// Sets the target power in watts. The value is clamped against the
    /// wattage ceiling before it is transmitted.
    pub async fn set_target_power(&self, watts: i16) -> Result<()> {
        self.send(Command::SetTargetPower(watts)).await
    }

    /// Replaces the wattage ceiling used to clamp target power requests.
    pub async fn set_wattage_ceiling(&self, watts: u32) -> Result<()> {
        self.send(Command::SetWattageCeiling(watts)).await
    }

    /// Returns the current connection lifecycle state.
    pub async fn state(&self) -> ConnectionState {
        self.shared.read().await.state
    }

    /// Returns the peripherals discovered during the current scan.
    pub async fn discovered(&self) -> Vec<PeripheralHandle> {
        self.shared.read().await.discovered.clone()
    }

    /// Returns the peripheral a connection exists to or is being made to.
    pub async fn connected_peripheral(&self) -> Option<PeripheralHandle> {
        self.shared.read().await.connected.clone()
    }

    /// Returns the last-known telemetry sample.
    pub async fn telemetry(&self) -> TelemetrySample {
        self.shared.read().await.telemetry
    }

    /// Returns true once the machine has granted control authority.
    pub async fn has_control(&self) -> bool {
        self.shared.read().await.has_control
    }

    /// Returns the last successfully transmitted power target in watts.
    pub async fn target_power(&self) -> i16 {
        self.shared.read().await.target_power
    }

    /// Returns the current wattage ceiling.
    pub async fn wattage_ceiling(&self) -> u32 {
        self.shared.read().await.policy.ceiling_watts()
    }

    async fn send(&self, command: Command) -> Result<()> {
        self.commands_tx
            .send(command)
            .await
            .map_err(|_| Error::EngineClosed)
    }
}

impl Drop for Trainer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    use bytes::Bytes;
    use tokio::time::timeout;

    use super::*;

    #[derive(Clone, Default)]
    struct MockState {
        written: Arc<Mutex<Vec<Vec<u8>>>>,
        subscribed: Arc<Mutex<Vec<CharacteristicRole>>>,
        connected: Arc<AtomicBool>,
        connect_calls: Arc<AtomicUsize>,
    }

    impl MockState {
        fn written(&self) -> Vec<Vec<u8>> {
            self.written.lock().unwrap().clone()
        }

        fn subscribed(&self) -> Vec<CharacteristicRole> {
            self.subscribed.lock().unwrap().clone()
        }
    }

    const ALL_ROLES: &[CharacteristicRole] = &[
        CharacteristicRole::IndoorBikeData,
        CharacteristicRole::HeartRateMeasurement,
        CharacteristicRole::ControlPoint,
    ];

    #[derive(Clone, Copy)]
    struct MockConfig {
        fail_connect: bool,
        /// Establish the link but never report it, holding `Connecting`.
        silent_connect: bool,
        /// Roles discovery resolves; dropping the control point holds
        /// `Discovering`.
        resolve: &'static [CharacteristicRole],
    }

    impl Default for MockConfig {
        fn default() -> Self {
            Self {
                fail_connect: false,
                silent_connect: false,
                resolve: ALL_ROLES,
            }
        }
    }

    struct MockTransport {
        events_tx: mpsc::Sender<TransportEvent>,
        state: MockState,
        config: MockConfig,
    }

    impl Transport for MockTransport {
        fn start_scan(&mut self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
            Box::pin(async { Ok(()) })
        }

        fn stop_scan(&mut self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
            Box::pin(async { Ok(()) })
        }

        fn connect(
            &mut self,
            _peripheral: &PeripheralHandle,
        ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
            Box::pin(async move {
                self.state.connect_calls.fetch_add(1, Ordering::SeqCst);
                if self.config.fail_connect {
                    let _ = self
                        .events_tx
                        .send(TransportEvent::ConnectFailed {
                            reason: "simulated failure".into(),
                        })
                        .await;
                } else {
                    self.state.connected.store(true, Ordering::SeqCst);
                    if !self.config.silent_connect {
                        let _ = self.events_tx.send(TransportEvent::Connected).await;
                    }
                }
                Ok(())
            })
        }

        fn discover(&mut self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
            Box::pin(async move {
                for role in self.config.resolve.iter().copied() {
                    let _ = self
                        .events_tx
                        .send(TransportEvent::CharacteristicResolved { role })
                        .await;
                }
                Ok(())
            })
        }

        fn subscribe(
            &mut self,
            role: CharacteristicRole,
        ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
            Box::pin(async move {
                self.state.subscribed.lock().unwrap().push(role);
                Ok(())
            })
        }

        fn write_control(
            &mut self,
            payload: Bytes,
        ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
            Box::pin(async move {
                self.state.written.lock().unwrap().push(payload.to_vec());
                Ok(())
            })
        }

        fn disconnect(&mut self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
            Box::pin(async move {
                self.state.connected.store(false, Ordering::SeqCst);
                let _ = self
                    .events_tx
                    .send(TransportEvent::Disconnected { reason: None })
                    .await;
                Ok(())
            })
        }

        fn is_connected(&self) -> bool {
            self.state.connected.load(Ordering::SeqCst)
        }
    }

    fn mock_trainer(config: MockConfig) -> (Trainer, MockState, mpsc::Sender<TransportEvent>) {
        let (events_tx, events_rx) = mpsc::channel(64);
        let state = MockState::default();
        let transport = MockTransport {
            events_tx: events_tx.clone(),
            state: state.clone(),
            config,
        };
        (Trainer::with_transport(transport, events_rx), state, events_tx)
    }

    fn trainer_handle() -> PeripheralHandle {
        PeripheralHandle::new("mock-trainer-1", Some("Mock Trainer".into()))
    }

    async fn next_event(sub: &mut Subscription) -> Event {
        timeout(Duration::from_secs(1), sub.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
    }

    async fn wait_for_state(sub: &mut Subscription, target: ConnectionState) {
        loop {
            if matches!(next_event(sub).await, Event::StateChanged(state) if state == target) {
                return;
            }
        }
    }

    async fn ready_trainer() -> (Trainer, MockState, mpsc::Sender<TransportEvent>, Subscription)
    {
        let (trainer, mock, events_tx) = mock_trainer(MockConfig::default());
        let mut sub = trainer.subscribe();
        trainer.connect(&trainer_handle()).await.unwrap();
        wait_for_state(&mut sub, ConnectionState::Ready).await;
        (trainer, mock, events_tx, sub)
    }

    #[tokio::test]
    async fn test_connect_reaches_ready() {
        let (trainer, mock, _events_tx, _sub) = ready_trainer().await;

        assert_eq!(trainer.state().await, ConnectionState::Ready);
        assert_eq!(
            trainer.connected_peripheral().await.map(|p| p.id),
            Some("mock-trainer-1".to_string())
        );

        let subscribed = mock.subscribed();
        assert!(subscribed.contains(&CharacteristicRole::IndoorBikeData));
        assert!(subscribed.contains(&CharacteristicRole::ControlPoint));
        assert!(subscribed.contains(&CharacteristicRole::HeartRateMeasurement));
    }

    #[tokio::test]
    async fn test_connect_failure_returns_to_idle() {
        let (trainer, _mock, _events_tx) = mock_trainer(MockConfig {
            fail_connect: true,
            ..MockConfig::default()
        });
        let mut sub = trainer.subscribe();

        trainer.connect(&trainer_handle()).await.unwrap();

        loop {
            if let Event::ConnectionFailed { reason } = next_event(&mut sub).await {
                assert_eq!(reason, "simulated failure");
                break;
            }
        }
        wait_for_state(&mut sub, ConnectionState::Idle).await;
        assert_eq!(trainer.connected_peripheral().await, None);
    }

    #[tokio::test]
    async fn test_scan_deduplicates_discoveries() {
        let (trainer, _mock, events_tx) = mock_trainer(MockConfig::default());
        let mut sub = trainer.subscribe();

        trainer.start_scan().await.unwrap();
        wait_for_state(&mut sub, ConnectionState::Scanning).await;

        let first = PeripheralHandle::new("dev-a", Some("KICKR".into()));
        let second = PeripheralHandle::new("dev-b", None);
        for handle in [&first, &first, &second, &first] {
            events_tx
                .send(TransportEvent::PeripheralDiscovered(handle.clone()))
                .await
                .unwrap();
        }

        // Two unique peripherals means exactly two discovery events.
        for expected in ["dev-a", "dev-b"] {
            loop {
                if let Event::PeripheralDiscovered(handle) = next_event(&mut sub).await {
                    assert_eq!(handle.id, expected);
                    break;
                }
            }
        }
        assert_eq!(trainer.discovered().await.len(), 2);
    }

    #[tokio::test]
    async fn test_connect_while_connected_is_ignored() {
        let (trainer, mock, _events_tx, _sub) = ready_trainer().await;

        let other = PeripheralHandle::new("mock-trainer-2", None);
        trainer.connect(&other).await.unwrap();
        trainer.connect(&trainer_handle()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(mock.connect_calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            trainer.connected_peripheral().await.map(|p| p.id),
            Some("mock-trainer-1".to_string())
        );
    }

    #[tokio::test]
    async fn test_control_grant_flow() {
        let (trainer, mock, events_tx, mut sub) = ready_trainer().await;

        trainer.request_control().await.unwrap();
        loop {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if mock.written().contains(&vec![0x00]) {
                break;
            }
        }
        assert!(!trainer.has_control().await);

        events_tx
            .send(TransportEvent::Notification {
                role: CharacteristicRole::ControlPoint,
                data: Bytes::from_static(&[0x80, 0x00, 0x01]),
            })
            .await
            .unwrap();

        loop {
            if matches!(next_event(&mut sub).await, Event::ControlGranted) {
                break;
            }
        }
        assert!(trainer.has_control().await);
    }

    #[tokio::test]
    async fn test_control_denied_leaves_control_unset() {
        let (trainer, _mock, events_tx, mut sub) = ready_trainer().await;

        events_tx
            .send(TransportEvent::Notification {
                role: CharacteristicRole::ControlPoint,
                data: Bytes::from_static(&[0x80, 0x00, 0x02]),
            })
            .await
            .unwrap();

        loop {
            if let Event::ControlResponse(response) = next_event(&mut sub).await {
                assert!(!response.is_success());
                break;
            }
        }
        assert!(!trainer.has_control().await);
    }

    #[tokio::test]
    async fn test_target_power_is_clamped_on_the_wire() {
        let (trainer, mock, _events_tx, mut sub) = ready_trainer().await;

        trainer.set_target_power(400).await.unwrap();
        loop {
            if let Event::TargetPowerChanged { watts } = next_event(&mut sub).await {
                assert_eq!(watts, 150);
                break;
            }
        }

        // 150W little-endian after the opcode.
        assert!(mock.written().contains(&vec![0x05, 0x96, 0x00]));
        assert_eq!(trainer.target_power().await, 150);
    }

    #[tokio::test]
    async fn test_raised_ceiling_passes_higher_targets() {
        let (trainer, mock, _events_tx, mut sub) = ready_trainer().await;

        trainer.set_wattage_ceiling(300).await.unwrap();
        trainer.set_target_power(250).await.unwrap();

        loop {
            if let Event::TargetPowerChanged { watts } = next_event(&mut sub).await {
                assert_eq!(watts, 250);
                break;
            }
        }
        assert!(mock.written().contains(&vec![0x05, 0xFA, 0x00]));
        assert_eq!(trainer.wattage_ceiling().await, 300);
    }

    #[tokio::test]
    async fn test_telemetry_flows_and_truncation_keeps_last_values() {
        let (trainer, _mock, events_tx, mut sub) = ready_trainer().await;

        // Flags: cadence + power present. Cadence raw 180 -> 90 rpm.
        events_tx
            .send(TransportEvent::Notification {
                role: CharacteristicRole::IndoorBikeData,
                data: Bytes::from_static(&[0x44, 0x00, 0xB4, 0x00, 0xC8, 0x00]),
            })
            .await
            .unwrap();

        loop {
            if let Event::Telemetry(sample) = next_event(&mut sub).await {
                assert_eq!(sample.power, Some(200));
                assert_eq!(sample.cadence, Some(90));
                break;
            }
        }

        events_tx
            .send(TransportEvent::Notification {
                role: CharacteristicRole::IndoorBikeData,
                data: Bytes::from_static(&[0x44]),
            })
            .await
            .unwrap();

        loop {
            if let Event::Telemetry(sample) = next_event(&mut sub).await {
                assert_eq!(sample.power, Some(200));
                assert_eq!(sample.cadence, Some(90));
                break;
            }
        }
    }

    #[tokio::test]
    async fn test_heart_rate_merges_into_sample() {
        let (trainer, _mock, events_tx, mut sub) = ready_trainer().await;

        events_tx
            .send(TransportEvent::Notification {
                role: CharacteristicRole::HeartRateMeasurement,
                data: Bytes::from_static(&[0x00, 0x4B]),
            })
            .await
            .unwrap();

        loop {
            if let Event::Telemetry(sample) = next_event(&mut sub).await {
                assert_eq!(sample.heart_rate, Some(75));
                break;
            }
        }
        assert_eq!(trainer.telemetry().await.heart_rate, Some(75));
    }

    #[tokio::test]
    async fn test_notifications_are_dropped_outside_ready() {
        let (trainer, _mock, events_tx) = mock_trainer(MockConfig::default());

        events_tx
            .send(TransportEvent::Notification {
                role: CharacteristicRole::IndoorBikeData,
                data: Bytes::from_static(&[0x44, 0x00, 0xB4, 0x00, 0xC8, 0x00]),
            })
            .await
            .unwrap();
        events_tx
            .send(TransportEvent::Notification {
                role: CharacteristicRole::ControlPoint,
                data: Bytes::from_static(&[0x80, 0x00, 0x01]),
            })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(trainer.telemetry().await, TelemetrySample::default());
        assert!(!trainer.has_control().await);
    }

    #[tokio::test]
    async fn test_disconnect_clears_session() {
        let (trainer, _mock, events_tx, mut sub) = ready_trainer().await;

        events_tx
            .send(TransportEvent::Notification {
                role: CharacteristicRole::ControlPoint,
                data: Bytes::from_static(&[0x80, 0x00, 0x01]),
            })
            .await
            .unwrap();
        loop {
            if matches!(next_event(&mut sub).await, Event::ControlGranted) {
                break;
            }
        }
        trainer.set_target_power(120).await.unwrap();
        loop {
            if matches!(next_event(&mut sub).await, Event::TargetPowerChanged { .. }) {
                break;
            }
        }

        trainer.disconnect().await.unwrap();
        wait_for_state(&mut sub, ConnectionState::Idle).await;

        assert_eq!(trainer.connected_peripheral().await, None);
        assert!(!trainer.has_control().await);
        assert_eq!(trainer.target_power().await, 0);
        assert_eq!(trainer.telemetry().await, TelemetrySample::default());
    }

    #[tokio::test]
    async fn test_unsolicited_disconnect_returns_to_idle() {
        let (trainer, _mock, events_tx, mut sub) = ready_trainer().await;

        events_tx
            .send(TransportEvent::Disconnected {
                reason: Some("peripheral connection lost".into()),
            })
            .await
            .unwrap();

        loop {
            if let Event::Disconnected { reason } = next_event(&mut sub).await {
                assert_eq!(reason.as_deref(), Some("peripheral connection lost"));
                break;
            }
        }
        wait_for_state(&mut sub, ConnectionState::Idle).await;
    }

    #[tokio::test]
    async fn test_commands_fail_after_drop() {
        let (trainer, _mock, _events_tx) = mock_trainer(MockConfig::default());
        let commands_tx = trainer.commands_tx.clone();
        drop(trainer);
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(commands_tx.send(Command::StartScan).await.is_err());
    }

    #[tokio::test]
    async fn test_reconnect_after_link_loss_restores_telemetry() {
        let (trainer, mock, events_tx, mut sub) = ready_trainer().await;

        events_tx
            .send(TransportEvent::Disconnected {
                reason: Some("peripheral connection lost".into()),
            })
            .await
            .unwrap();
        wait_for_state(&mut sub, ConnectionState::Idle).await;

        trainer.connect(&trainer_handle()).await.unwrap();
        wait_for_state(&mut sub, ConnectionState::Ready).await;

        // The second session subscribes every role again from scratch.
        assert_eq!(mock.subscribed().len(), 6);

        events_tx
            .send(TransportEvent::Notification {
                role: CharacteristicRole::IndoorBikeData,
                data: Bytes::from_static(&[0x44, 0x00, 0xB4, 0x00, 0xC8, 0x00]),
            })
            .await
            .unwrap();

        loop {
            if let Event::Telemetry(sample) = next_event(&mut sub).await {
                assert_eq!(sample.power, Some(200));
                assert_eq!(sample.cadence, Some(90));
                break;
            }
        }
    }

    #[tokio::test]
    async fn test_connect_while_disconnecting_never_strands_a_link() {
        // Race a connect command into the teardown window repeatedly. The
        // engine must never settle idle with the transport link still up.
        for _ in 0..20 {
            let (trainer, mock, _events_tx, _sub) = ready_trainer().await;

            trainer.disconnect().await.unwrap();
            trainer.connect(&trainer_handle()).await.unwrap();
            tokio::time::sleep(Duration::from_millis(50)).await;

            match trainer.state().await {
                ConnectionState::Idle => {
                    assert!(!mock.connected.load(Ordering::SeqCst));
                    assert_eq!(trainer.connected_peripheral().await, None);
                }
                // The teardown confirmation won the race, so the connect was
                // accepted from idle and a second full session is legitimate.
                ConnectionState::Ready => {
                    assert!(mock.connected.load(Ordering::SeqCst));
                    assert_eq!(mock.connect_calls.load(Ordering::SeqCst), 2);
                }
                other => panic!("engine did not settle: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_disconnect_from_scanning_returns_to_idle() {
        let (trainer, _mock, _events_tx) = mock_trainer(MockConfig::default());
        let mut sub = trainer.subscribe();

        trainer.start_scan().await.unwrap();
        wait_for_state(&mut sub, ConnectionState::Scanning).await;

        trainer.disconnect().await.unwrap();
        wait_for_state(&mut sub, ConnectionState::Idle).await;
        assert_eq!(trainer.state().await, ConnectionState::Idle);
    }

    #[tokio::test]
    async fn test_disconnect_from_connecting_returns_to_idle() {
        let (trainer, _mock, _events_tx) = mock_trainer(MockConfig {
            silent_connect: true,
            ..MockConfig::default()
        });
        let mut sub = trainer.subscribe();

        trainer.connect(&trainer_handle()).await.unwrap();
        wait_for_state(&mut sub, ConnectionState::Connecting).await;

        trainer.disconnect().await.unwrap();
        wait_for_state(&mut sub, ConnectionState::Idle).await;
        assert_eq!(trainer.connected_peripheral().await, None);
        assert!(!trainer.has_control().await);
    }

    #[tokio::test]
    async fn test_disconnect_from_discovering_returns_to_idle() {
        // Without a control point the session never reaches ready.
        let (trainer, mock, _events_tx) = mock_trainer(MockConfig {
            resolve: &[CharacteristicRole::IndoorBikeData],
            ..MockConfig::default()
        });
        let mut sub = trainer.subscribe();

        trainer.connect(&trainer_handle()).await.unwrap();
        wait_for_state(&mut sub, ConnectionState::Discovering).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        trainer.disconnect().await.unwrap();
        wait_for_state(&mut sub, ConnectionState::Idle).await;
        assert_eq!(trainer.connected_peripheral().await, None);
        assert!(!trainer.has_control().await);
        assert_eq!(mock.subscribed(), vec![CharacteristicRole::IndoorBikeData]);
    }
}
