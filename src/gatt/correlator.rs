//! Event correlator
//!
//! Turns "submit a request, eventually receive an event" into a single
//! awaitable call. A waiter subscribes to the forwarded event stream
//! *before* the request is submitted, then takes the first event its
//! matcher accepts. Once a disconnection event has been seen (or the link
//! otherwise left `Connected`) no further events are matched and the
//! waiter resolves with [`GattError::NotConnected`].

use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::{broadcast, watch};

use super::event::GattEvent;
use super::executor::TransportError;
use super::types::{ConnectionState, GattStatus};
use super::{GattError, Result};

/// A filtered view of the event stream scoped to one pending operation.
pub struct EventWaiter {
    events: broadcast::Receiver<GattEvent>,
    state: watch::Receiver<ConnectionState>,
    finished: bool,
}

impl EventWaiter {
    pub fn new(
        events: broadcast::Receiver<GattEvent>,
        state: watch::Receiver<ConnectionState>,
    ) -> Self {
        Self {
            events,
            state,
            finished: false,
        }
    }

    /// Next event seen while the link is up, or `None` once it is gone.
    pub async fn next(&mut self) -> Option<GattEvent> {
        if self.finished {
            return None;
        }
        loop {
            // Drain what is already queued first: events published before
            // the link dropped still count.
            match self.events.try_recv() {
                Ok(event) => return self.accept(event),
                Err(TryRecvError::Lagged(skipped)) => {
                    log::warn!("Event waiter lagged, {} events dropped", skipped);
                    continue;
                }
                Err(TryRecvError::Closed) => return self.finish(),
                Err(TryRecvError::Empty) => {}
            }

            if !self.state.borrow_and_update().is_connected() {
                return self.finish();
            }

            tokio::select! {
                biased;
                received = self.events.recv() => match received {
                    Ok(event) => return self.accept(event),
                    Err(RecvError::Lagged(skipped)) => {
                        log::warn!("Event waiter lagged, {} events dropped", skipped);
                    }
                    Err(RecvError::Closed) => return self.finish(),
                },
                changed = self.state.changed() => {
                    if changed.is_err() {
                        return self.finish();
                    }
                }
            }
        }
    }

    /// Wait for the first event `matcher` resolves.
    pub async fn wait_for<T, M>(&mut self, mut matcher: M) -> Result<T>
    where
        M: FnMut(&GattEvent) -> Option<Result<T>>,
    {
        while let Some(event) = self.next().await {
            if let Some(outcome) = matcher(&event) {
                return outcome;
            }
        }
        Err(GattError::NotConnected)
    }

    fn accept(&mut self, event: GattEvent) -> Option<GattEvent> {
        if let Some(reason) = event.disconnection() {
            log::debug!("Waiter saw disconnection ({}), no further matches", reason);
            return self.finish();
        }
        Some(event)
    }

    fn finish(&mut self) -> Option<GattEvent> {
        self.finished = true;
        None
    }
}

/// Map the executor's submission result onto the error taxonomy.
pub fn submitted(op: &'static str, result: std::result::Result<bool, TransportError>) -> Result<()> {
    match result {
        Ok(true) => Ok(()),
        Ok(false) => {
            log::warn!("{} request rejected by transport", op);
            Err(GattError::RequestRejected(op))
        }
        Err(e) => {
            log::warn!("{} request raised a transport fault: {}", op, e);
            Err(GattError::Transport(e))
        }
    }
}

/// Success yields `value`; any other status is an operation failure.
pub fn check_status<T>(op: &'static str, status: GattStatus, value: T) -> Result<T> {
    if status.is_success() {
        Ok(value)
    } else {
        Err(GattError::OperationFailed { op, status })
    }
}

/// Submit a request and wait for its correlated event.
///
/// `waiter` must have been created before this call so that the completion
/// event cannot slip past between submission and subscription.
pub async fn request<T, I, M>(
    mut waiter: EventWaiter,
    op: &'static str,
    issue: I,
    matcher: M,
) -> Result<T>
where
    I: FnOnce() -> std::result::Result<bool, TransportError>,
    M: FnMut(&GattEvent) -> Option<Result<T>>,
{
    submitted(op, issue())?;
    waiter.wait_for(matcher).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gatt::types::{uuid_from_u16, AttributeId, DisconnectionReason};
    use std::time::Duration;

    fn target() -> AttributeId {
        AttributeId::new(uuid_from_u16(0x2a19), 5)
    }

    fn read_matcher(
        target: AttributeId,
    ) -> impl FnMut(&GattEvent) -> Option<Result<Vec<u8>>> {
        move |event| match event {
            GattEvent::CharacteristicRead {
                target: t,
                value,
                status,
            } if *t == target => Some(check_status("read", *status, value.clone())),
            _ => None,
        }
    }

    fn channels() -> (
        broadcast::Sender<GattEvent>,
        watch::Sender<ConnectionState>,
        EventWaiter,
    ) {
        let (events_tx, events_rx) = broadcast::channel(16);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connected);
        (events_tx, state_tx, EventWaiter::new(events_rx, state_rx))
    }

    #[tokio::test]
    async fn test_matches_by_identity_and_kind() {
        let (events, _state, waiter) = channels();
        let other = AttributeId::new(uuid_from_u16(0x2a19), 6);

        events
            .send(GattEvent::CharacteristicWrite {
                target: target(),
                value: vec![0xaa],
                status: GattStatus::Success,
            })
            .unwrap();
        events
            .send(GattEvent::CharacteristicRead {
                target: other,
                value: vec![0xbb],
                status: GattStatus::Success,
            })
            .unwrap();
        events
            .send(GattEvent::CharacteristicRead {
                target: target(),
                value: vec![0x64],
                status: GattStatus::Success,
            })
            .unwrap();

        let value = request(waiter, "read", || Ok(true), read_matcher(target()))
            .await
            .unwrap();
        assert_eq!(value, vec![0x64]);
    }

    #[tokio::test]
    async fn test_failure_status_becomes_typed_error() {
        let (events, _state, waiter) = channels();
        events
            .send(GattEvent::CharacteristicRead {
                target: target(),
                value: vec![],
                status: GattStatus::InsufficientEncryption,
            })
            .unwrap();

        let err = request(waiter, "read", || Ok(true), read_matcher(target()))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            GattError::OperationFailed {
                op: "read",
                status: GattStatus::InsufficientEncryption
            }
        );
    }

    #[tokio::test]
    async fn test_events_after_disconnection_never_match() {
        let (events, _state, waiter) = channels();
        events
            .send(GattEvent::ConnectionStateChanged(
                ConnectionState::Disconnected(DisconnectionReason::LinkLoss),
            ))
            .unwrap();
        events
            .send(GattEvent::CharacteristicRead {
                target: target(),
                value: vec![0x01],
                status: GattStatus::Success,
            })
            .unwrap();

        let err = request(waiter, "read", || Ok(true), read_matcher(target()))
            .await
            .unwrap_err();
        assert_eq!(err, GattError::NotConnected);
    }

    #[tokio::test]
    async fn test_state_leaving_connected_resolves_waiter() {
        let (_events, state, waiter) = channels();
        let pending = tokio::spawn(request(waiter, "read", || Ok(true), read_matcher(target())));

        tokio::time::sleep(Duration::from_millis(1)).await;
        state.send_replace(ConnectionState::Closed);

        assert_eq!(pending.await.unwrap().unwrap_err(), GattError::NotConnected);
    }

    #[tokio::test]
    async fn test_rejected_and_faulted_submissions() {
        let (_events, _state, waiter) = channels();
        let err = request(waiter, "read", || Ok(false), read_matcher(target()))
            .await
            .unwrap_err();
        assert_eq!(err, GattError::RequestRejected("read"));

        let (_events, _state, waiter) = channels();
        let err = request(
            waiter,
            "read",
            || Err(TransportError::PermissionDenied("BLUETOOTH_CONNECT".into())),
            read_matcher(target()),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, GattError::Transport(TransportError::PermissionDenied(_))));
    }

    #[tokio::test]
    async fn test_waiter_fails_fast_when_not_connected() {
        let (_events_tx, events_rx) = broadcast::channel::<GattEvent>(4);
        let (_state_tx, state_rx) = watch::channel(ConnectionState::Disconnected(
            DisconnectionReason::PeerTerminate,
        ));
        let mut waiter = EventWaiter::new(events_rx, state_rx);
        assert!(waiter.next().await.is_none());
        // Stays finished.
        assert!(waiter.next().await.is_none());
    }
}
