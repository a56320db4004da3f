//! In-process simulated GATT server
//!
//! A [`GattExecutor`] backed by an in-memory attribute database. Requests
//! are answered on the event stream like a real platform would, optionally
//! after a latency, and every call is logged so tests can assert on what
//! the core actually submitted. Used by the integration tests and the
//! `gatt_sim` binary without requiring radio hardware.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::broadcast;

use super::event::{GattEvent, ServiceDescription};
use super::executor::{ExecutorCapabilities, GattExecutor, TransportError};
use super::types::{
    AttributeId, ConnectionParameters, ConnectionPriority, ConnectionState, DisconnectionReason,
    GattStatus, Phy, PhyMask, PhyOption, PhyPair, WriteType, DEFAULT_MTU, MAX_MTU,
};

/// What the simulated device does with the next connect request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    Accept,
    Fail(DisconnectionReason),
    /// Never answer; the attempt can only time out or be cancelled.
    Ignore,
}

/// One executor call as the core issued it.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutorCall {
    Connect { auto_connect: bool, preferred_phy: PhyMask },
    DiscoverServices,
    ReadRssi,
    ReadPhy,
    RequestPhy { tx: PhyMask, rx: PhyMask, option: PhyOption },
    RequestMtu(u16),
    RequestConnectionPriority(ConnectionPriority),
    ReadCharacteristic(AttributeId),
    WriteCharacteristic(AttributeId, Vec<u8>, WriteType),
    ReadDescriptor(AttributeId),
    WriteDescriptor(AttributeId, Vec<u8>),
    BeginReliableWrite,
    ExecuteReliableWrite,
    AbortReliableWrite,
    Disconnect,
    Close,
}

struct SimState {
    services: Vec<ServiceDescription>,
    values: HashMap<AttributeId, Vec<u8>>,
    statuses: HashMap<AttributeId, GattStatus>,
    discovery_status: GattStatus,
    corrupt_echo: HashSet<AttributeId>,
    connect_script: VecDeque<ConnectOutcome>,
    link_requested: bool,
    auto_connect: bool,
    connected: bool,
    /// Bumped whenever the link drops; late responses from an older link
    /// are discarded.
    generation: u64,
    reliable: Option<Vec<(AttributeId, Vec<u8>)>>,
    calls: Vec<ExecutorCall>,
    outstanding: usize,
    max_outstanding: usize,
    hold: bool,
    held: Vec<GattEvent>,
    /// Link-update events the executor emitted on the platform's behalf.
    synthesized: usize,
    reject_requests: bool,
    fault: Option<TransportError>,
    latency: Duration,
    rssi: i16,
    peer_mtu: u16,
    phy: PhyPair,
}

/// A simulated remote device and the platform stack in front of it.
pub struct SimulatedDevice {
    events_tx: broadcast::Sender<GattEvent>,
    state: Arc<Mutex<SimState>>,
    capabilities: ExecutorCapabilities,
}

impl SimulatedDevice {
    pub fn new(services: Vec<ServiceDescription>) -> Self {
        let (events_tx, _) = broadcast::channel(256);
        Self {
            events_tx,
            state: Arc::new(Mutex::new(SimState {
                services,
                values: HashMap::new(),
                statuses: HashMap::new(),
                discovery_status: GattStatus::Success,
                corrupt_echo: HashSet::new(),
                connect_script: VecDeque::new(),
                link_requested: false,
                auto_connect: false,
                connected: false,
                generation: 0,
                reliable: None,
                calls: Vec::new(),
                outstanding: 0,
                max_outstanding: 0,
                hold: false,
                held: Vec::new(),
                synthesized: 0,
                reject_requests: false,
                fault: None,
                latency: Duration::ZERO,
                rssi: -50,
                peer_mtu: 247,
                phy: PhyPair::default(),
            })),
            capabilities: ExecutorCapabilities::default(),
        }
    }

    pub fn with_capabilities(mut self, capabilities: ExecutorCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ------------------------------------------------------------------
    // Scripting
    // ------------------------------------------------------------------

    /// Delay every response by `latency`. Uses tokio time, so paused
    /// clocks advance instantly in tests.
    pub fn set_latency(&self, latency: Duration) {
        self.lock().latency = latency;
    }

    /// Queue the outcome of a future connect request. Unscripted requests
    /// are accepted.
    pub fn script_connect(&self, outcome: ConnectOutcome) {
        self.lock().connect_script.push_back(outcome);
    }

    pub fn set_value(&self, id: AttributeId, value: &[u8]) {
        self.lock().values.insert(id, value.to_vec());
    }

    pub fn value(&self, id: AttributeId) -> Option<Vec<u8>> {
        self.lock().values.get(&id).cloned()
    }

    /// Answer requests on `id` with `status` instead of success.
    pub fn set_status(&self, id: AttributeId, status: GattStatus) {
        self.lock().statuses.insert(id, status);
    }

    pub fn set_discovery_status(&self, status: GattStatus) {
        self.lock().discovery_status = status;
    }

    /// Echo a different value than was written to `id` during reliable writes.
    pub fn corrupt_echo(&self, id: AttributeId) {
        self.lock().corrupt_echo.insert(id);
    }

    pub fn set_rssi(&self, rssi: i16) {
        self.lock().rssi = rssi;
    }

    /// Largest MTU the remote side accepts.
    pub fn set_peer_mtu(&self, mtu: u16) {
        self.lock().peer_mtu = mtu.clamp(DEFAULT_MTU, MAX_MTU);
    }

    /// Answer the next requests with "not accepted".
    pub fn set_reject_requests(&self, reject: bool) {
        self.lock().reject_requests = reject;
    }

    /// Raise `fault` from every request until cleared.
    pub fn set_transport_fault(&self, fault: Option<TransportError>) {
        self.lock().fault = fault;
    }

    /// While held, responses are queued instead of delivered.
    pub fn set_hold(&self, hold: bool) {
        self.lock().hold = hold;
    }

    /// Deliver every held response. Returns how many there were.
    pub fn release_held(&self) -> usize {
        let (held, generation) = {
            let mut state = self.lock();
            state.hold = false;
            (std::mem::take(&mut state.held), state.generation)
        };
        let count = held.len();
        for event in held {
            self.deliver(event, generation, true);
        }
        count
    }

    // ------------------------------------------------------------------
    // Remote-side behaviour
    // ------------------------------------------------------------------

    /// The link drops on the remote side.
    pub fn drop_link(&self, reason: DisconnectionReason) {
        let generation = {
            let mut state = self.lock();
            if !state.connected {
                return;
            }
            state.connected = false;
            Self::reset_link(&mut state);
            state.generation
        };
        log::debug!("Simulated link dropped: {}", reason);
        self.deliver(
            GattEvent::ConnectionStateChanged(ConnectionState::Disconnected(reason)),
            generation,
            false,
        );
    }

    /// An auto-connect link comes back. Returns `false` if nothing was
    /// waiting for the device.
    pub fn reconnect(&self) -> bool {
        let generation = {
            let mut state = self.lock();
            if !state.link_requested || !state.auto_connect || state.connected {
                return false;
            }
            state.connected = true;
            state.generation
        };
        self.deliver(
            GattEvent::ConnectionStateChanged(ConnectionState::Connected),
            generation,
            false,
        );
        true
    }

    /// The peer sends a notification or indication.
    pub fn notify(&self, id: AttributeId, value: &[u8]) {
        let generation = {
            let mut state = self.lock();
            if !state.connected {
                return;
            }
            state.values.insert(id, value.to_vec());
            state.generation
        };
        self.deliver(
            GattEvent::CharacteristicChanged {
                target: id,
                value: value.to_vec(),
            },
            generation,
            false,
        );
    }

    /// Replace the remote database and signal services-changed.
    pub fn change_services(&self, services: Vec<ServiceDescription>) {
        let generation = {
            let mut state = self.lock();
            state.services = services;
            state.generation
        };
        self.deliver(GattEvent::ServicesChanged, generation, false);
    }

    /// Put an arbitrary event on the stream, bypassing hold and latency.
    pub fn inject(&self, event: GattEvent) {
        let _ = self.events_tx.send(event);
    }

    // ------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------

    pub fn calls(&self) -> Vec<ExecutorCall> {
        self.lock().calls.clone()
    }

    pub fn count_calls(&self, matches: impl Fn(&ExecutorCall) -> bool) -> usize {
        self.lock().calls.iter().filter(|call| matches(call)).count()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    /// Correlated requests submitted and not yet answered.
    pub fn outstanding(&self) -> usize {
        self.lock().outstanding
    }

    /// Highest number of correlated requests ever in flight at once.
    pub fn max_outstanding(&self) -> usize {
        self.lock().max_outstanding
    }

    pub fn is_connected(&self) -> bool {
        self.lock().connected
    }

    pub fn held(&self) -> usize {
        self.lock().held.len()
    }

    /// PHY and connection-parameter events emitted without a platform callback.
    pub fn synthesized(&self) -> usize {
        self.lock().synthesized
    }

    // ------------------------------------------------------------------
    // Plumbing
    // ------------------------------------------------------------------

    fn reset_link(state: &mut SimState) {
        state.generation += 1;
        state.outstanding = 0;
        state.held.clear();
        state.reliable = None;
    }

    /// Log the call and apply rejection/fault scripting.
    fn submit(&self, state: &mut SimState, call: ExecutorCall) -> Result<bool, TransportError> {
        log::trace!("Simulated call: {:?}", call);
        state.calls.push(call);
        if let Some(fault) = &state.fault {
            return Err(fault.clone());
        }
        Ok(!state.reject_requests)
    }

    /// Accept a correlated request and queue its response.
    fn respond(&self, call: ExecutorCall, build: impl FnOnce(&mut SimState) -> GattEvent) -> Result<bool, TransportError> {
        let (event, generation) = {
            let mut state = self.lock();
            if !self.submit(&mut state, call)? {
                return Ok(false);
            }
            if !state.connected {
                return Ok(false);
            }
            state.outstanding += 1;
            state.max_outstanding = state.max_outstanding.max(state.outstanding);
            let event = build(&mut state);
            if state.hold {
                state.held.push(event);
                return Ok(true);
            }
            (event, state.generation)
        };
        self.deliver(event, generation, true);
        Ok(true)
    }

    /// Accept a PHY or connection-parameter request.
    ///
    /// Without `synthesize_link_events` the platform's own callback answers
    /// it like any other request. With it the platform has no such
    /// callback: the executor emits the event itself as soon as the request
    /// is accepted, ignoring latency and hold.
    fn respond_link_update(
        &self,
        call: ExecutorCall,
        build: impl FnOnce(&mut SimState) -> GattEvent,
    ) -> Result<bool, TransportError> {
        if !self.capabilities.synthesize_link_events {
            return self.respond(call, build);
        }
        let (event, generation) = {
            let mut state = self.lock();
            if !self.submit(&mut state, call)? || !state.connected {
                return Ok(false);
            }
            state.outstanding += 1;
            state.max_outstanding = state.max_outstanding.max(state.outstanding);
            state.synthesized += 1;
            (build(&mut state), state.generation)
        };
        log::debug!("Synthesizing {} after accepted request", event.kind());
        Self::send(&self.state, &self.events_tx, event, generation, true);
        Ok(true)
    }

    fn deliver(&self, event: GattEvent, generation: u64, answers_request: bool) {
        let latency = self.lock().latency;
        if latency.is_zero() {
            Self::send(&self.state, &self.events_tx, event, generation, answers_request);
            return;
        }
        let state = Arc::clone(&self.state);
        let events_tx = self.events_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(latency).await;
            Self::send(&state, &events_tx, event, generation, answers_request);
        });
    }

    fn send(
        state: &Mutex<SimState>,
        events_tx: &broadcast::Sender<GattEvent>,
        event: GattEvent,
        generation: u64,
        answers_request: bool,
    ) {
        {
            let mut state = state.lock().unwrap_or_else(|e| e.into_inner());
            if state.generation != generation {
                log::trace!("Dropping response from an earlier link: {}", event.kind());
                return;
            }
            if answers_request {
                state.outstanding = state.outstanding.saturating_sub(1);
            }
        }
        let _ = events_tx.send(event);
    }

    fn status_for(state: &SimState, id: AttributeId) -> GattStatus {
        state.statuses.get(&id).copied().unwrap_or(GattStatus::Success)
    }
}

impl GattExecutor for SimulatedDevice {
    fn events(&self) -> broadcast::Receiver<GattEvent> {
        self.events_tx.subscribe()
    }

    fn capabilities(&self) -> ExecutorCapabilities {
        self.capabilities
    }

    fn connect(&self, auto_connect: bool, preferred_phy: PhyMask) -> Result<bool, TransportError> {
        let (outcome, generation) = {
            let mut state = self.lock();
            let call = ExecutorCall::Connect {
                auto_connect,
                preferred_phy,
            };
            if !self.submit(&mut state, call)? {
                return Ok(false);
            }
            state.link_requested = true;
            state.auto_connect = auto_connect;
            let outcome = state
                .connect_script
                .pop_front()
                .unwrap_or(ConnectOutcome::Accept);
            if outcome == ConnectOutcome::Accept {
                state.connected = true;
                if preferred_phy.contains(PhyMask::LE_2M) {
                    state.phy = PhyPair {
                        tx: Phy::Le2M,
                        rx: Phy::Le2M,
                    };
                }
            }
            (outcome, state.generation)
        };
        match outcome {
            ConnectOutcome::Accept => self.deliver(
                GattEvent::ConnectionStateChanged(ConnectionState::Connected),
                generation,
                false,
            ),
            ConnectOutcome::Fail(reason) => self.deliver(
                GattEvent::ConnectionStateChanged(ConnectionState::Disconnected(reason)),
                generation,
                false,
            ),
            ConnectOutcome::Ignore => {}
        }
        Ok(true)
    }

    fn discover_services(&self) -> Result<bool, TransportError> {
        let (event, generation) = {
            let mut state = self.lock();
            if !self.submit(&mut state, ExecutorCall::DiscoverServices)? || !state.connected {
                return Ok(false);
            }
            let status = state.discovery_status;
            let services = if status.is_success() {
                state.services.clone()
            } else {
                Vec::new()
            };
            (
                GattEvent::ServicesDiscovered { services, status },
                state.generation,
            )
        };
        self.deliver(event, generation, false);
        Ok(true)
    }

    fn read_rssi(&self) -> Result<bool, TransportError> {
        self.respond(ExecutorCall::ReadRssi, |state| GattEvent::RssiRead {
            rssi: state.rssi,
            status: GattStatus::Success,
        })
    }

    fn read_phy(&self) -> Result<bool, TransportError> {
        self.respond(ExecutorCall::ReadPhy, |state| GattEvent::PhyRead {
            phy: state.phy,
            status: GattStatus::Success,
        })
    }

    fn request_phy(&self, tx: PhyMask, rx: PhyMask, option: PhyOption) -> Result<bool, TransportError> {
        self.respond_link_update(ExecutorCall::RequestPhy { tx, rx, option }, |state| {
            state.phy = PhyPair {
                tx: preferred(tx),
                rx: preferred(rx),
            };
            GattEvent::PhyChanged {
                phy: state.phy,
                status: GattStatus::Success,
            }
        })
    }

    fn request_mtu(&self, mtu: u16) -> Result<bool, TransportError> {
        self.respond(ExecutorCall::RequestMtu(mtu), |state| GattEvent::MtuChanged {
            mtu: mtu.min(state.peer_mtu),
            status: GattStatus::Success,
        })
    }

    fn request_connection_priority(&self, priority: ConnectionPriority) -> Result<bool, TransportError> {
        let call = ExecutorCall::RequestConnectionPriority(priority);
        self.respond_link_update(call, |_| GattEvent::ConnectionParametersChanged {
            parameters: ConnectionParameters::for_priority(priority),
            status: GattStatus::Success,
        })
    }

    fn read_characteristic(&self, target: AttributeId) -> Result<bool, TransportError> {
        self.respond(ExecutorCall::ReadCharacteristic(target), |state| {
            let status = Self::status_for(state, target);
            GattEvent::CharacteristicRead {
                target,
                value: if status.is_success() {
                    state.values.get(&target).cloned().unwrap_or_default()
                } else {
                    Vec::new()
                },
                status,
            }
        })
    }

    fn write_characteristic(
        &self,
        target: AttributeId,
        value: &[u8],
        write_type: WriteType,
    ) -> Result<bool, TransportError> {
        let call = ExecutorCall::WriteCharacteristic(target, value.to_vec(), write_type);
        self.respond(call, |state| {
            let status = Self::status_for(state, target);
            let mut echo = value.to_vec();
            if status.is_success() {
                match state.reliable.as_mut() {
                    Some(queue) => {
                        queue.push((target, value.to_vec()));
                        if state.corrupt_echo.contains(&target) {
                            match echo.last_mut() {
                                Some(last) => *last ^= 0xff,
                                None => echo.push(0xff),
                            }
                        }
                    }
                    None => {
                        state.values.insert(target, value.to_vec());
                    }
                }
            }
            GattEvent::CharacteristicWrite {
                target,
                value: echo,
                status,
            }
        })
    }

    fn read_descriptor(&self, target: AttributeId) -> Result<bool, TransportError> {
        self.respond(ExecutorCall::ReadDescriptor(target), |state| {
            let status = Self::status_for(state, target);
            GattEvent::DescriptorRead {
                target,
                value: state.values.get(&target).cloned().unwrap_or_default(),
                status,
            }
        })
    }

    fn write_descriptor(&self, target: AttributeId, value: &[u8]) -> Result<bool, TransportError> {
        self.respond(ExecutorCall::WriteDescriptor(target, value.to_vec()), |state| {
            let status = Self::status_for(state, target);
            if status.is_success() {
                state.values.insert(target, value.to_vec());
            }
            GattEvent::DescriptorWrite {
                target,
                value: value.to_vec(),
                status,
            }
        })
    }

    fn begin_reliable_write(&self) -> Result<bool, TransportError> {
        let mut state = self.lock();
        if !self.submit(&mut state, ExecutorCall::BeginReliableWrite)? || !state.connected {
            return Ok(false);
        }
        state.reliable = Some(Vec::new());
        Ok(true)
    }

    fn execute_reliable_write(&self) -> Result<bool, TransportError> {
        {
            let mut state = self.lock();
            if state.reliable.is_none() {
                state.calls.push(ExecutorCall::ExecuteReliableWrite);
                return Ok(false);
            }
        }
        self.respond(ExecutorCall::ExecuteReliableWrite, |state| {
            for (target, value) in state.reliable.take().unwrap_or_default() {
                state.values.insert(target, value);
            }
            GattEvent::ReliableWriteCompleted {
                status: GattStatus::Success,
            }
        })
    }

    fn abort_reliable_write(&self) {
        let mut state = self.lock();
        state.calls.push(ExecutorCall::AbortReliableWrite);
        state.reliable = None;
    }

    fn disconnect(&self) {
        let generation = {
            let mut state = self.lock();
            state.calls.push(ExecutorCall::Disconnect);
            if !state.link_requested {
                return;
            }
            state.connected = false;
            state.auto_connect = false;
            Self::reset_link(&mut state);
            state.generation
        };
        self.deliver(
            GattEvent::ConnectionStateChanged(ConnectionState::Disconnected(
                DisconnectionReason::LocalTerminate,
            )),
            generation,
            false,
        );
    }

    fn close(&self) {
        let mut state = self.lock();
        state.calls.push(ExecutorCall::Close);
        state.link_requested = false;
        state.auto_connect = false;
        state.connected = false;
        Self::reset_link(&mut state);
    }
}

/// The fastest PHY in a preference mask.
fn preferred(mask: PhyMask) -> Phy {
    if mask.contains(PhyMask::LE_2M) {
        Phy::Le2M
    } else if mask.contains(PhyMask::LE_1M) || mask.is_empty() {
        Phy::Le1M
    } else {
        Phy::LeCoded
    }
}
