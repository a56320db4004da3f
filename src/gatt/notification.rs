//! Notification and indication subscriptions
//!
//! Tracks, per characteristic, how many subscribers exist and which CCCD
//! value was last written, so enabling is idempotent and the descriptor is
//! only written back to "disabled" when the last subscriber goes away.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Mutex;
use std::task::{Context, Poll};

use futures_util::stream::{self, Stream};

use super::correlator::EventWaiter;
use super::event::GattEvent;
use super::tree::{CharacteristicProperties, RemoteCharacteristic};
use super::types::AttributeId;
use super::{Capability, GattError, Result};

pub const ENABLE_NOTIFICATION_VALUE: [u8; 2] = [0x01, 0x00];
pub const ENABLE_INDICATION_VALUE: [u8; 2] = [0x02, 0x00];
pub const DISABLE_NOTIFICATION_VALUE: [u8; 2] = [0x00, 0x00];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    Notify,
    Indicate,
}

impl NotificationKind {
    pub fn cccd_value(&self) -> [u8; 2] {
        match self {
            NotificationKind::Notify => ENABLE_NOTIFICATION_VALUE,
            NotificationKind::Indicate => ENABLE_INDICATION_VALUE,
        }
    }

    /// Pick the variant the characteristic supports. Indication wins only
    /// when it was asked for and is advertised.
    pub fn select(
        properties: CharacteristicProperties,
        requested: NotificationKind,
    ) -> Result<NotificationKind> {
        let notify = properties.contains(CharacteristicProperties::NOTIFY);
        let indicate = properties.contains(CharacteristicProperties::INDICATE);
        match (requested, notify, indicate) {
            (NotificationKind::Indicate, _, true) => Ok(NotificationKind::Indicate),
            (_, true, _) => Ok(NotificationKind::Notify),
            (_, false, true) => Ok(NotificationKind::Indicate),
            _ => Err(GattError::MissingCapability(Capability::Notify)),
        }
    }
}

#[derive(Debug, Default)]
struct Entry {
    epoch: u64,
    subscribers: usize,
    enabled: Option<NotificationKind>,
}

/// Per-characteristic subscriber counts and cached CCCD state.
#[derive(Debug, Default)]
pub struct NotificationRegistry {
    entries: Mutex<HashMap<AttributeId, Entry>>,
}

impl NotificationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_entry<T>(&self, id: AttributeId, epoch: u64, f: impl FnOnce(&mut Entry) -> T) -> T {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let entry = entries.entry(id).or_default();
        if entry.epoch != epoch {
            // Left over from an older discovery.
            *entry = Entry {
                epoch,
                ..Entry::default()
            };
        }
        f(entry)
    }

    pub fn add_subscriber(&self, id: AttributeId, epoch: u64) -> usize {
        self.with_entry(id, epoch, |entry| {
            entry.subscribers += 1;
            entry.subscribers
        })
    }

    /// Drop one subscriber. Returns `true` when it was the last one and
    /// notifications are still enabled, i.e. the caller should disable them.
    pub fn remove_subscriber(&self, id: AttributeId, epoch: u64) -> bool {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        match entries.get_mut(&id) {
            Some(entry) if entry.epoch == epoch && entry.subscribers > 0 => {
                entry.subscribers -= 1;
                entry.subscribers == 0 && entry.enabled.is_some()
            }
            _ => false,
        }
    }

    pub fn subscribers(&self, id: AttributeId, epoch: u64) -> usize {
        self.with_entry(id, epoch, |entry| entry.subscribers)
    }

    pub fn enabled(&self, id: AttributeId, epoch: u64) -> Option<NotificationKind> {
        self.with_entry(id, epoch, |entry| entry.enabled)
    }

    pub fn set_enabled(&self, id: AttributeId, epoch: u64, enabled: Option<NotificationKind>) {
        self.with_entry(id, epoch, |entry| entry.enabled = enabled);
    }

    /// Forget all cached state; the remote side resets CCCDs on disconnection.
    pub fn clear(&self) {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}

/// Runs its release hook exactly once when dropped.
pub struct SubscriberRegistration {
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl SubscriberRegistration {
    pub fn new(release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }
}

impl Drop for SubscriberRegistration {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

/// Values notified or indicated by one characteristic.
///
/// Ends when the link goes down. Dropping it unsubscribes; the last
/// subscriber of a characteristic disables notifications on the peer.
pub struct Subscription {
    characteristic: RemoteCharacteristic,
    values: Pin<Box<dyn Stream<Item = Vec<u8>> + Send>>,
    _registration: SubscriberRegistration,
}

impl Subscription {
    pub(crate) fn new(
        characteristic: RemoteCharacteristic,
        waiter: EventWaiter,
        registration: SubscriberRegistration,
    ) -> Self {
        let target = characteristic.id();
        let values = stream::unfold(waiter, move |mut waiter| async move {
            while let Some(event) = waiter.next().await {
                if let GattEvent::CharacteristicChanged { target: t, value } = event {
                    if t == target {
                        return Some((value, waiter));
                    }
                }
            }
            None
        });
        Self {
            characteristic,
            values: Box::pin(values),
            _registration: registration,
        }
    }

    pub fn characteristic(&self) -> &RemoteCharacteristic {
        &self.characteristic
    }
}

impl Stream for Subscription {
    type Item = Vec<u8>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.values.as_mut().poll_next(cx)
    }
}
