//! Connection state machine and caller-facing API
//!
//! A `Peripheral` owns one remote device's [`ConnectionState`], drives
//! connect/disconnect through the executor, and, once connected, forwards
//! every executor event: first into its own bookkeeping (state, attribute
//! tree, link attributes), then onto the broadcast channel that pending
//! operations and subscriptions filter for their completion.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::{ConnectMode, ConnectOptions, PeripheralConfig};

use super::correlator::{self, check_status, submitted, EventWaiter};
use super::discovery::{DiscoveryManager, ServicesSnapshot};
use super::event::GattEvent;
use super::executor::{GattExecutor, TransportError};
use super::notification::{
    NotificationKind, NotificationRegistry, SubscriberRegistration, Subscription,
    DISABLE_NOTIFICATION_VALUE,
};
use super::op_lock::{OperationGuard, OperationLock};
use super::reliable_write::ReliableWrite;
use super::tree::{CharacteristicProperties, RemoteCharacteristic, RemoteDescriptor, RemoteService};
use super::types::{
    AttributeId, ConnectionParameters, ConnectionPriority, ConnectionState, DisconnectionReason,
    LinkAttributes, PhyMask, PhyOption, PhyPair, WriteType, DEFAULT_MTU, MAX_MTU,
    PLATFORM_GATT_ERROR,
};
use super::{Capability, GattError, Result};

/// One remote GATT server and the link to it.
pub struct Peripheral {
    executor: Arc<dyn GattExecutor>,
    config: PeripheralConfig,
    state_tx: watch::Sender<ConnectionState>,
    events_tx: broadcast::Sender<GattEvent>,
    link_tx: watch::Sender<LinkAttributes>,
    discovery: DiscoveryManager,
    notifications: NotificationRegistry,
    op_lock: OperationLock,
    /// Serializes `connect` calls.
    connect_lock: tokio::sync::Mutex<()>,
    forwarder: Mutex<Option<JoinHandle<()>>>,
    /// A transport connection has been requested and not yet closed.
    link_open: AtomicBool,
    disconnect_requested: AtomicBool,
}

impl Peripheral {
    /// A closed peripheral driven by `executor`. Nothing is submitted until `connect`.
    pub fn new(executor: Arc<dyn GattExecutor>, config: PeripheralConfig) -> Arc<Self> {
        let (state_tx, _) = watch::channel(ConnectionState::Closed);
        let (events_tx, _) = broadcast::channel(config.event_capacity.max(1));
        let (link_tx, _) = watch::channel(LinkAttributes::default());
        Arc::new(Self {
            executor,
            config,
            state_tx,
            events_tx,
            link_tx,
            discovery: DiscoveryManager::new(),
            notifications: NotificationRegistry::new(),
            op_lock: OperationLock::new(),
            connect_lock: tokio::sync::Mutex::new(()),
            forwarder: Mutex::new(None),
            link_open: AtomicBool::new(false),
            disconnect_requested: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &PeripheralConfig {
        &self.config
    }

    // ------------------------------------------------------------------
    // Observation
    // ------------------------------------------------------------------

    /// Consistent snapshot of the connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Observe connection state transitions.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Observe the cached attribute tree (`None` while there is none).
    ///
    /// Holding an observer makes the peripheral discover services on its
    /// own whenever the link comes up.
    pub fn services_observer(&self) -> watch::Receiver<ServicesSnapshot> {
        self.discovery.observer()
    }

    /// Every event forwarded while connected, after internal bookkeeping.
    pub fn events(&self) -> broadcast::Receiver<GattEvent> {
        self.events_tx.subscribe()
    }

    /// Last reported MTU, PHY and connection parameters.
    pub fn link_attributes(&self) -> LinkAttributes {
        *self.link_tx.borrow()
    }

    pub fn link_changes(&self) -> watch::Receiver<LinkAttributes> {
        self.link_tx.subscribe()
    }

    pub fn mtu(&self) -> u16 {
        self.link_tx.borrow().mtu
    }

    // ------------------------------------------------------------------
    // Connection lifecycle
    // ------------------------------------------------------------------

    /// Bring the link up. Returns at once if already connected.
    ///
    /// Dropping the returned future before it resolves cancels the
    /// attempt: the state becomes `Disconnected(Cancelled)` and the link
    /// is released.
    pub async fn connect(self: &Arc<Self>, options: ConnectOptions) -> Result<()> {
        let _exclusive = self.connect_lock.lock().await;
        if self.state().is_connected() {
            return Ok(());
        }

        // A previous auto-connect link may still be held open.
        self.release_link(true);
        self.disconnect_requested.store(false, Ordering::SeqCst);

        let mut cancel_guard = CancelOnDrop {
            peripheral: self,
            armed: true,
        };
        let outcome = match options.mode {
            ConnectMode::Direct { timeout, retry } => {
                self.connect_direct(timeout, retry, options.preferred_phy).await
            }
            ConnectMode::Auto => self.connect_auto(options.preferred_phy).await,
        };
        cancel_guard.armed = false;
        outcome
    }

    async fn connect_direct(
        self: &Arc<Self>,
        timeout: Duration,
        retry: u32,
        preferred_phy: PhyMask,
    ) -> Result<()> {
        let mut remaining = retry;
        loop {
            match self.attempt(false, preferred_phy, Some(timeout)).await {
                Ok(events) => {
                    self.on_link_up(events, false);
                    return Ok(());
                }
                Err(AttemptFailure::Link(reason))
                    if remaining > 0
                        && reason.is_retryable()
                        && !self.disconnect_requested.load(Ordering::SeqCst) =>
                {
                    remaining -= 1;
                    log::info!(
                        "Connect attempt failed ({}), retrying in {:?} ({} left)",
                        reason,
                        self.config.retry_delay,
                        remaining
                    );
                    self.release_link(true);
                    tokio::time::sleep(self.config.retry_delay).await;
                    if self.state() == ConnectionState::Closed
                        || self.disconnect_requested.load(Ordering::SeqCst)
                    {
                        return Err(self.fail_connect(AttemptFailure::Link(
                            DisconnectionReason::Cancelled,
                        )));
                    }
                }
                Err(failure) => return Err(self.fail_connect(failure)),
            }
        }
    }

    async fn connect_auto(self: &Arc<Self>, preferred_phy: PhyMask) -> Result<()> {
        match self.attempt(true, preferred_phy, None).await {
            Ok(events) => {
                self.on_link_up(events, true);
                Ok(())
            }
            Err(AttemptFailure::Link(DisconnectionReason::Unknown(PLATFORM_GATT_ERROR))) => {
                // The platform reports unreachable address types with its
                // generic error code when auto-connecting.
                Err(self.fail_connect(AttemptFailure::Link(
                    DisconnectionReason::UnsupportedAddress,
                )))
            }
            Err(failure) => Err(self.fail_connect(failure)),
        }
    }

    /// One connect attempt. On success returns the executor subscription
    /// the attempt listened on, so forwarding continues without a gap.
    async fn attempt(
        &self,
        auto_connect: bool,
        preferred_phy: PhyMask,
        timeout: Option<Duration>,
    ) -> std::result::Result<broadcast::Receiver<GattEvent>, AttemptFailure> {
        let mut events = self.executor.events();
        let mut state = self.state_tx.subscribe();
        let previous = self.set_state(ConnectionState::Connecting);

        self.link_open.store(true, Ordering::SeqCst);
        if let Err(e) = submitted(
            "connect",
            self.executor.connect(auto_connect, preferred_phy),
        ) {
            self.link_open.store(false, Ordering::SeqCst);
            self.set_state(previous);
            return Err(AttemptFailure::Submit(e));
        }
        log::debug!(
            "Connecting (auto: {}, timeout: {:?})",
            auto_connect,
            timeout
        );

        state.borrow_and_update();
        let outcome = match timeout {
            Some(limit) => {
                match tokio::time::timeout(limit, wait_for_link(&mut events, &mut state)).await {
                    Ok(outcome) => outcome,
                    Err(_) => return Err(AttemptFailure::TimedOut(limit)),
                }
            }
            None => wait_for_link(&mut events, &mut state).await,
        };

        match outcome {
            Ok(()) => Ok(events),
            Err(reason) => Err(AttemptFailure::Link(reason)),
        }
    }

    /// Record a failed connect: terminal state, released link, typed error.
    fn fail_connect(&self, failure: AttemptFailure) -> GattError {
        let reason = match failure {
            AttemptFailure::Submit(e) => return e,
            AttemptFailure::TimedOut(limit) => DisconnectionReason::Timeout(limit),
            AttemptFailure::Link(reason) => reason,
        };
        log::warn!("Connection failed: {}", reason);
        if self.state() != ConnectionState::Closed {
            self.set_state(ConnectionState::Disconnected(reason));
        }
        self.release_link(true);
        GattError::ConnectionFailed(reason)
    }

    fn on_link_up(self: &Arc<Self>, events: broadcast::Receiver<GattEvent>, auto_connect: bool) {
        self.start_forwarding(events, auto_connect);
        self.set_state(ConnectionState::Connected);
        if self.discovery.on_connected() {
            self.request_discovery();
        }
    }

    /// Drop the link. Idempotent; if a disconnect is already underway this
    /// only waits for it to finish.
    pub async fn disconnect(&self) {
        let mut state = self.state_tx.subscribe();
        let current = *state.borrow_and_update();
        match current {
            ConnectionState::Disconnected(_) | ConnectionState::Closed => return,
            ConnectionState::Disconnecting => {
                wait_until_terminal(&mut state).await;
                return;
            }
            ConnectionState::Connecting | ConnectionState::Connected => {}
        }

        self.disconnect_requested.store(true, Ordering::SeqCst);
        self.set_state(ConnectionState::Disconnecting);
        self.executor.disconnect();

        let limit = self.config.disconnect_timeout;
        if tokio::time::timeout(limit, wait_until_terminal(&mut state))
            .await
            .is_err()
        {
            log::warn!("No disconnection event within {:?}, closing anyway", limit);
            self.set_state(ConnectionState::Disconnected(
                DisconnectionReason::LocalTerminate,
            ));
        }
        self.release_link(true);
    }

    /// Stop forwarding, drop the attribute tree and release the transport.
    /// Safe to call any number of times.
    pub fn close(&self) {
        self.release_link(true);
        self.set_state(ConnectionState::Closed);
    }

    /// Close without waiting for the platform, e.g. because the owning
    /// manager shut down or the radio went off. Observers always see a
    /// disconnection before the peripheral closes.
    pub fn force_close(&self) {
        self.disconnect_requested.store(true, Ordering::SeqCst);
        if !self.state().is_terminal() {
            let reason = DisconnectionReason::LocalTerminate;
            self.set_state(ConnectionState::Disconnected(reason));
            let _ = self
                .events_tx
                .send(GattEvent::ConnectionStateChanged(ConnectionState::Disconnected(reason)));
        }
        self.close();
    }

    fn set_state(&self, next: ConnectionState) -> ConnectionState {
        let previous = self.state_tx.send_replace(next);
        if previous != next {
            log::debug!("Connection state: {} -> {}", previous, next);
        }
        previous
    }

    /// Tear down everything tied to the current link.
    fn release_link(&self, abort_forwarder: bool) {
        let forwarder = self
            .forwarder
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = forwarder {
            if abort_forwarder {
                handle.abort();
            }
        }
        self.invalidate_tree();
        self.link_tx.send_replace(LinkAttributes::default());
        if self.link_open.swap(false, Ordering::SeqCst) {
            log::debug!("Releasing transport");
            self.executor.close();
        }
    }

    fn invalidate_tree(&self) {
        self.discovery.invalidate();
        self.notifications.clear();
    }

    // ------------------------------------------------------------------
    // Event forwarding
    // ------------------------------------------------------------------

    fn start_forwarding(self: &Arc<Self>, events: broadcast::Receiver<GattEvent>, auto_connect: bool) {
        let peripheral: Weak<Self> = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let mut events = events;
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(RecvError::Lagged(skipped)) => {
                        log::warn!("Forwarder lagged, {} events dropped", skipped);
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };
                let Some(peripheral) = peripheral.upgrade() else {
                    break;
                };
                if !peripheral.handle_event(event, auto_connect) {
                    break;
                }
            }
        });
        *self.forwarder.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
    }

    /// Apply one forwarded event, then publish it. Returns `false` once
    /// forwarding should stop.
    fn handle_event(&self, event: GattEvent, auto_connect: bool) -> bool {
        log::trace!("Forwarding {}", event.kind());
        let mut keep_forwarding = true;
        match &event {
            GattEvent::ConnectionStateChanged(ConnectionState::Disconnected(reason)) => {
                self.invalidate_tree();
                self.link_tx.send_replace(LinkAttributes::default());
                self.set_state(ConnectionState::Disconnected(*reason));
                if !auto_connect {
                    keep_forwarding = false;
                }
            }
            GattEvent::ConnectionStateChanged(ConnectionState::Connected) => {
                if !self.state().is_connected() {
                    log::info!("Link re-established");
                    self.set_state(ConnectionState::Connected);
                    if self.discovery.on_connected() {
                        self.request_discovery();
                    }
                }
            }
            GattEvent::ConnectionStateChanged(other) => {
                if auto_connect && *other != ConnectionState::Closed {
                    self.set_state(*other);
                }
            }
            GattEvent::ServicesDiscovered { services, status } => {
                if status.is_success() {
                    self.discovery.on_discovered(services);
                } else {
                    log::warn!("Service discovery failed: {}", status);
                    self.discovery.release();
                }
            }
            GattEvent::ServicesChanged => {
                log::info!("Remote services changed, invalidating attribute tree");
                self.invalidate_tree();
                if self.state().is_connected() && self.discovery.on_connected() {
                    self.request_discovery();
                }
            }
            GattEvent::MtuChanged { mtu, status } if status.is_success() => {
                self.link_tx.send_modify(|link| link.mtu = *mtu);
            }
            GattEvent::PhyRead { phy, status } | GattEvent::PhyChanged { phy, status }
                if status.is_success() =>
            {
                self.link_tx.send_modify(|link| link.phy = *phy);
            }
            GattEvent::ConnectionParametersChanged { parameters, status }
                if status.is_success() =>
            {
                self.link_tx
                    .send_modify(|link| link.connection_parameters = Some(*parameters));
            }
            _ => {}
        }

        let _ = self.events_tx.send(event);

        if !keep_forwarding {
            // Direct links end with their first disconnection.
            self.release_link(false);
        }
        keep_forwarding
    }

    // ------------------------------------------------------------------
    // Service discovery
    // ------------------------------------------------------------------

    fn request_discovery(&self) {
        if let Err(e) = self.submit_discovery() {
            log::warn!("Could not start service discovery: {}", e);
        }
    }

    fn submit_discovery(&self) -> Result<()> {
        log::debug!("Discovering services");
        let result = submitted("discover services", self.executor.discover_services());
        if result.is_err() {
            self.discovery.release();
        }
        result
    }

    /// The cached attribute tree, discovering it first if needed.
    pub async fn services(&self) -> Result<Arc<Vec<RemoteService>>> {
        self.ensure_connected()?;
        // Observe while waiting so a services-changed restarts discovery.
        let _observing = self.discovery.observer();
        let mut waiter = self.waiter();
        loop {
            if let Some(tree) = self.discovery.current() {
                return Ok(tree);
            }
            if self.discovery.begin() {
                self.submit_discovery()?;
            }
            waiter
                .wait_for(|event| match event {
                    GattEvent::ServicesDiscovered { status, .. } => Some(if status.is_success() {
                        Ok(())
                    } else {
                        Err(GattError::ServiceDiscoveryFailed(*status))
                    }),
                    _ => None,
                })
                .await?;
        }
    }

    /// First discovered service with `uuid`, discovering if needed.
    pub async fn find_service(&self, uuid: Uuid) -> Result<Option<RemoteService>> {
        let services = self.services().await?;
        Ok(services.iter().find(|s| s.uuid() == uuid).cloned())
    }

    pub async fn find_characteristic(
        &self,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<Option<RemoteCharacteristic>> {
        Ok(self
            .find_service(service)
            .await?
            .and_then(|s| s.characteristic(characteristic).cloned()))
    }

    // ------------------------------------------------------------------
    // Attribute operations
    // ------------------------------------------------------------------

    /// Read a characteristic value.
    ///
    /// Fails with `MissingCapability` without the read property,
    /// `InvalidAttribute` for a node from an earlier discovery, `NotConnected`
    /// if the link drops first, or the peer's failure status.
    pub async fn read(&self, characteristic: &RemoteCharacteristic) -> Result<Vec<u8>> {
        const OP: &str = "read characteristic";
        require(characteristic, CharacteristicProperties::READ, Capability::Read)?;
        let target = characteristic.id();
        self.correlated(
            OP,
            || ensure_valid(characteristic.is_valid(), target),
            || self.executor.read_characteristic(target),
            move |event| match event {
                GattEvent::CharacteristicRead {
                    target: t,
                    value,
                    status,
                } if *t == target => Some(check_status(OP, *status, value.clone())),
                _ => None,
            },
        )
        .await
    }

    /// Write a characteristic value with the given write type.
    ///
    /// The characteristic must carry the property matching `write_type`;
    /// otherwise fails like [`Peripheral::read`].
    pub async fn write(
        &self,
        characteristic: &RemoteCharacteristic,
        value: &[u8],
        write_type: WriteType,
    ) -> Result<()> {
        const OP: &str = "write characteristic";
        let (property, capability) = match write_type {
            WriteType::WithResponse => (CharacteristicProperties::WRITE, Capability::Write),
            WriteType::WithoutResponse => (
                CharacteristicProperties::WRITE_WITHOUT_RESPONSE,
                Capability::WriteWithoutResponse,
            ),
            WriteType::Signed => (
                CharacteristicProperties::AUTHENTICATED_SIGNED_WRITES,
                Capability::SignedWrite,
            ),
        };
        require(characteristic, property, capability)?;
        let target = characteristic.id();
        self.correlated(
            OP,
            || ensure_valid(characteristic.is_valid(), target),
            || self.executor.write_characteristic(target, value, write_type),
            move |event| match event {
                GattEvent::CharacteristicWrite {
                    target: t, status, ..
                } if *t == target => Some(check_status(OP, *status, ())),
                _ => None,
            },
        )
        .await
    }

    /// Read a descriptor. Fails with `InvalidAttribute`, `NotConnected` or the peer's status.
    pub async fn read_descriptor(&self, descriptor: &RemoteDescriptor) -> Result<Vec<u8>> {
        const OP: &str = "read descriptor";
        let target = descriptor.id();
        self.correlated(
            OP,
            || ensure_valid(descriptor.is_valid(), target),
            || self.executor.read_descriptor(target),
            move |event| match event {
                GattEvent::DescriptorRead {
                    target: t,
                    value,
                    status,
                } if *t == target => Some(check_status(OP, *status, value.clone())),
                _ => None,
            },
        )
        .await
    }

    /// Write a descriptor. Fails with `InvalidAttribute`, `NotConnected` or the peer's status.
    pub async fn write_descriptor(&self, descriptor: &RemoteDescriptor, value: &[u8]) -> Result<()> {
        const OP: &str = "write descriptor";
        let target = descriptor.id();
        self.correlated(
            OP,
            || ensure_valid(descriptor.is_valid(), target),
            || self.executor.write_descriptor(target, value),
            descriptor_write_matcher(OP, target),
        )
        .await
    }

    // ------------------------------------------------------------------
    // Notifications
    // ------------------------------------------------------------------

    /// Subscribe to notifications, falling back to indications when the
    /// characteristic only supports those.
    pub async fn subscribe(self: &Arc<Self>, characteristic: &RemoteCharacteristic) -> Result<Subscription> {
        self.subscribe_with(characteristic, NotificationKind::Notify).await
    }

    /// Subscribe with a preferred notification kind, falling back to the
    /// other kind if only that is supported. Fails with `MissingCapability`
    /// when neither property or the CCCD is present.
    pub async fn subscribe_with(
        self: &Arc<Self>,
        characteristic: &RemoteCharacteristic,
        requested: NotificationKind,
    ) -> Result<Subscription> {
        let kind = NotificationKind::select(characteristic.properties(), requested)?;
        if characteristic.cccd().is_none() {
            return Err(GattError::MissingCapability(
                Capability::ClientCharacteristicConfiguration,
            ));
        }
        ensure_valid(characteristic.is_valid(), characteristic.id())?;
        self.ensure_connected()?;

        // Listen before enabling so the first notification is not missed.
        let waiter = self.waiter();
        let id = characteristic.id();
        let epoch = characteristic.epoch();
        self.notifications.add_subscriber(id, epoch);
        let registration = {
            let peripheral = Arc::downgrade(self);
            let characteristic = characteristic.clone();
            SubscriberRegistration::new(move || {
                if let Some(peripheral) = peripheral.upgrade() {
                    peripheral.release_subscriber(characteristic);
                }
            })
        };

        self.apply_notifications(characteristic, Some(kind), false).await?;
        Ok(Subscription::new(characteristic.clone(), waiter, registration))
    }

    fn release_subscriber(self: Arc<Self>, characteristic: RemoteCharacteristic) {
        let id = characteristic.id();
        if !self.notifications.remove_subscriber(id, characteristic.epoch()) {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(e) = self.apply_notifications(&characteristic, None, false).await {
                        log::debug!("Disabling notifications on {} failed: {}", id, e);
                    }
                });
            }
            Err(_) => log::warn!("No runtime available to disable notifications on {}", id),
        }
    }

    /// Enable or disable notifications directly, without a subscription.
    ///
    /// Disabling here writes the descriptor even while subscriptions are
    /// alive; those subscriptions stay open but receive nothing further.
    pub async fn set_notifications(
        &self,
        characteristic: &RemoteCharacteristic,
        enabled: bool,
    ) -> Result<()> {
        let wanted = if enabled {
            Some(NotificationKind::select(
                characteristic.properties(),
                NotificationKind::Notify,
            )?)
        } else {
            None
        };
        self.apply_notifications(characteristic, wanted, true).await
    }

    /// Bring the CCCD to the wanted state under the operation lock. Writes
    /// nothing if the cached state already matches; a different kind of
    /// enable replaces the current one. An implicit disable is
    /// skipped while subscribers remain.
    async fn apply_notifications(
        &self,
        characteristic: &RemoteCharacteristic,
        wanted: Option<NotificationKind>,
        explicit: bool,
    ) -> Result<()> {
        const OP: &str = "write client characteristic configuration";
        let id = characteristic.id();
        let epoch = characteristic.epoch();
        let cccd = characteristic
            .cccd()
            .ok_or(GattError::MissingCapability(
                Capability::ClientCharacteristicConfiguration,
            ))?
            .id();

        let _guard = self.op_lock.acquire(OP).await;
        ensure_valid(characteristic.is_valid(), id)?;

        let current = self.notifications.enabled(id, epoch);
        let value = match wanted {
            Some(kind) => {
                if current == Some(kind) {
                    return Ok(());
                }
                kind.cccd_value()
            }
            None => {
                if current.is_none()
                    || (!explicit && self.notifications.subscribers(id, epoch) > 0)
                {
                    return Ok(());
                }
                DISABLE_NOTIFICATION_VALUE
            }
        };

        log::debug!("Setting notifications on {} to {:?}", id, wanted);
        self.submit_and_wait(
            OP,
            || self.executor.write_descriptor(cccd, &value),
            descriptor_write_matcher(OP, cccd),
        )
        .await?;
        self.notifications.set_enabled(id, epoch, wanted);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Link operations
    // ------------------------------------------------------------------

    /// Current signal strength in dBm. Fails with `NotConnected` or the platform status.
    pub async fn read_rssi(&self) -> Result<i16> {
        const OP: &str = "read rssi";
        self.correlated(
            OP,
            || Ok(()),
            || self.executor.read_rssi(),
            |event| match event {
                GattEvent::RssiRead { rssi, status } => Some(check_status(OP, *status, *rssi)),
                _ => None,
            },
        )
        .await
    }

    /// PHYs currently in use. Fails with `NotConnected` or the platform status.
    pub async fn read_phy(&self) -> Result<PhyPair> {
        const OP: &str = "read phy";
        self.correlated(
            OP,
            || Ok(()),
            || self.executor.read_phy(),
            |event| match event {
                GattEvent::PhyRead { phy, status } => Some(check_status(OP, *status, *phy)),
                _ => None,
            },
        )
        .await
    }

    /// Ask for new PHYs; returns what the link settled on. Fails with
    /// `NotConnected` or the platform status.
    pub async fn request_phy(&self, tx: PhyMask, rx: PhyMask, option: PhyOption) -> Result<PhyPair> {
        const OP: &str = "request phy";
        self.correlated(
            OP,
            || Ok(()),
            || self.executor.request_phy(tx, rx, option),
            |event| match event {
                GattEvent::PhyChanged { phy, status } => Some(check_status(OP, *status, *phy)),
                _ => None,
            },
        )
        .await
    }

    /// Negotiate a larger MTU. Returns the MTU the peer settled on.
    pub async fn request_mtu(&self, mtu: u16) -> Result<u16> {
        const OP: &str = "request mtu";
        let requested = mtu.clamp(DEFAULT_MTU, MAX_MTU);
        if requested != mtu {
            log::warn!("Requested MTU {} out of range, using {}", mtu, requested);
        }
        self.correlated(
            OP,
            || Ok(()),
            || self.executor.request_mtu(requested),
            |event| match event {
                GattEvent::MtuChanged { mtu, status } => Some(check_status(OP, *status, *mtu)),
                _ => None,
            },
        )
        .await
    }

    /// Ask for a connection interval class; returns the resulting
    /// parameters. Fails with `NotConnected` or the platform status.
    pub async fn request_connection_priority(
        &self,
        priority: ConnectionPriority,
    ) -> Result<ConnectionParameters> {
        const OP: &str = "request connection priority";
        self.correlated(
            OP,
            || Ok(()),
            || self.executor.request_connection_priority(priority),
            |event| match event {
                GattEvent::ConnectionParametersChanged { parameters, status } => {
                    Some(check_status(OP, *status, *parameters))
                }
                _ => None,
            },
        )
        .await
    }

    /// Start a queued, echo-verified multi-attribute write.
    pub fn reliable_write(&self) -> ReliableWrite<'_> {
        ReliableWrite::new(self)
    }

    // ------------------------------------------------------------------
    // Correlation plumbing
    // ------------------------------------------------------------------

    pub(crate) fn executor(&self) -> &dyn GattExecutor {
        self.executor.as_ref()
    }

    pub(crate) async fn lock_operations(&self, op: &'static str) -> OperationGuard<'_> {
        self.op_lock.acquire(op).await
    }

    pub(crate) fn waiter(&self) -> EventWaiter {
        EventWaiter::new(self.events_tx.subscribe(), self.state_tx.subscribe())
    }

    pub(crate) fn ensure_connected(&self) -> Result<()> {
        if self.state().is_connected() {
            Ok(())
        } else {
            Err(GattError::NotConnected)
        }
    }

    /// Submit and wait; the caller already holds the operation lock.
    pub(crate) async fn submit_and_wait<T, I, M>(&self, op: &'static str, issue: I, matcher: M) -> Result<T>
    where
        I: FnOnce() -> std::result::Result<bool, TransportError>,
        M: FnMut(&GattEvent) -> Option<Result<T>>,
    {
        self.ensure_connected()?;
        let waiter = self.waiter();
        log::debug!("Submitting {}", op);
        correlator::request(waiter, op, issue, matcher).await
    }

    /// Acquire the operation lock, re-check preconditions, then submit and wait.
    async fn correlated<T, C, I, M>(&self, op: &'static str, check: C, issue: I, matcher: M) -> Result<T>
    where
        C: FnOnce() -> Result<()>,
        I: FnOnce() -> std::result::Result<bool, TransportError>,
        M: FnMut(&GattEvent) -> Option<Result<T>>,
    {
        let _guard = self.op_lock.acquire(op).await;
        check()?;
        self.submit_and_wait(op, issue, matcher).await
    }
}

impl Drop for Peripheral {
    fn drop(&mut self) {
        self.release_link(true);
    }
}

/// Why a connect attempt did not reach `Connected`.
enum AttemptFailure {
    Submit(GattError),
    /// The attempt's own deadline expired. Never retried.
    TimedOut(Duration),
    /// The platform reported the link down.
    Link(DisconnectionReason),
}

/// Marks the peripheral cancelled if a pending `connect` is dropped.
struct CancelOnDrop<'a> {
    peripheral: &'a Peripheral,
    armed: bool,
}

impl Drop for CancelOnDrop<'_> {
    fn drop(&mut self) {
        if self.armed {
            log::info!("Connect cancelled");
            if self.peripheral.state() != ConnectionState::Closed {
                self.peripheral.set_state(ConnectionState::Disconnected(
                    DisconnectionReason::Cancelled,
                ));
            }
            self.peripheral.release_link(true);
        }
    }
}

/// Wait for the platform to report the link up or down. A `close()` from
/// elsewhere counts as cancellation; a disconnect that gave up waiting on
/// the platform ends the attempt with its reason.
async fn wait_for_link(
    events: &mut broadcast::Receiver<GattEvent>,
    state: &mut watch::Receiver<ConnectionState>,
) -> std::result::Result<(), DisconnectionReason> {
    loop {
        tokio::select! {
            received = events.recv() => match received {
                Ok(GattEvent::ConnectionStateChanged(ConnectionState::Connected)) => return Ok(()),
                Ok(GattEvent::ConnectionStateChanged(ConnectionState::Disconnected(reason))) => {
                    return Err(reason)
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    log::warn!("Connect attempt lagged, {} events dropped", skipped);
                }
                Err(RecvError::Closed) => return Err(DisconnectionReason::LocalTerminate),
            },
            changed = state.changed() => {
                if changed.is_err() {
                    return Err(DisconnectionReason::Cancelled);
                }
                match *state.borrow_and_update() {
                    ConnectionState::Closed => return Err(DisconnectionReason::Cancelled),
                    ConnectionState::Disconnected(reason) => return Err(reason),
                    _ => {}
                }
            }
        }
    }
}

async fn wait_until_terminal(state: &mut watch::Receiver<ConnectionState>) {
    loop {
        if state.borrow_and_update().is_terminal() {
            return;
        }
        if state.changed().await.is_err() {
            return;
        }
    }
}

fn ensure_valid(valid: bool, id: AttributeId) -> Result<()> {
    if valid {
        Ok(())
    } else {
        Err(GattError::InvalidAttribute(id))
    }
}

fn require(
    characteristic: &RemoteCharacteristic,
    property: CharacteristicProperties,
    capability: Capability,
) -> Result<()> {
    if characteristic.properties().contains(property) {
        Ok(())
    } else {
        Err(GattError::MissingCapability(capability))
    }
}

pub(crate) fn descriptor_write_matcher(
    op: &'static str,
    target: AttributeId,
) -> impl FnMut(&GattEvent) -> Option<Result<()>> {
    move |event| match event {
        GattEvent::DescriptorWrite {
            target: t, status, ..
        } if *t == target => Some(check_status(op, *status, ())),
        _ => None,
    }
}
