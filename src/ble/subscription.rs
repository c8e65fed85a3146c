//! Notification subscriptions.
//!
//! Each active subscription owns an unbounded channel, so routing a
//! notification never waits on the consumer. A slow consumer only grows its
//! own backlog; other characteristics and sessions are unaffected. The
//! backlog is tracked so it can be reported once it gets large.

use bytes::Bytes;
use futures::stream::Stream;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tracing::{trace, warn};
use uuid::Uuid;

use crate::ble::characteristics::CharacteristicDescriptor;

/// Backlog size at which a warning is logged for a subscription.
pub const NOTIFICATION_BACKLOG_WARNING: usize = 1024;

/// (service, characteristic)
pub(crate) type CharacteristicKey = (Uuid, Uuid);

/// A notification value with its source characteristic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationEvent {
    /// Owning service UUID.
    pub service_uuid: Uuid,
    /// UUID of the characteristic that sent the notification.
    pub characteristic_uuid: Uuid,
    /// The notification data.
    pub data: Bytes,
}

pub(crate) struct ActiveSubscription {
    token: u64,
    characteristic: CharacteristicDescriptor,
    sender: mpsc::UnboundedSender<Bytes>,
    backlog: Arc<AtomicUsize>,
}

impl ActiveSubscription {
    pub(crate) fn characteristic(&self) -> &CharacteristicDescriptor {
        &self.characteristic
    }
}

/// The set of active subscriptions of one session.
#[derive(Default)]
pub(crate) struct SubscriptionSet {
    active: HashMap<CharacteristicKey, ActiveSubscription>,
    next_token: u64,
}

impl SubscriptionSet {
    /// Register a subscription, replacing (and ending) any previous one for
    /// the same characteristic.
    pub(crate) fn insert(
        &mut self,
        characteristic: CharacteristicDescriptor,
    ) -> (u64, mpsc::UnboundedReceiver<Bytes>, Arc<AtomicUsize>) {
        self.next_token += 1;
        let token = self.next_token;
        let (sender, receiver) = mpsc::unbounded_channel();
        let backlog = Arc::new(AtomicUsize::new(0));
        let key = (characteristic.service_uuid, characteristic.uuid);

        if self
            .active
            .insert(
                key,
                ActiveSubscription {
                    token,
                    characteristic,
                    sender,
                    backlog: backlog.clone(),
                },
            )
            .is_some()
        {
            trace!("Replaced existing subscription for {}", key.1);
        }

        (token, receiver, backlog)
    }

    pub(crate) fn remove(&mut self, key: &CharacteristicKey) -> Option<ActiveSubscription> {
        self.active.remove(key)
    }

    /// Remove the subscription only if it is still the one identified by `token`.
    pub(crate) fn remove_if_current(
        &mut self,
        key: &CharacteristicKey,
        token: u64,
    ) -> Option<ActiveSubscription> {
        if self.active.get(key).map(|s| s.token) == Some(token) {
            self.active.remove(key)
        } else {
            None
        }
    }

    pub(crate) fn is_active(&self, key: &CharacteristicKey) -> bool {
        self.active.contains_key(key)
    }

    pub(crate) fn len(&self) -> usize {
        self.active.len()
    }

    /// Take every subscription out of the set.
    ///
    /// Dropping the returned values ends the corresponding streams.
    pub(crate) fn take_all(&mut self) -> Vec<ActiveSubscription> {
        self.active.drain().map(|(_, sub)| sub).collect()
    }

    /// Take out every subscription whose key matches `ended`.
    pub(crate) fn take_where(
        &mut self,
        mut ended: impl FnMut(&CharacteristicKey) -> bool,
    ) -> Vec<ActiveSubscription> {
        let keys: Vec<_> = self.active.keys().filter(|k| ended(*k)).copied().collect();
        keys.into_iter()
            .filter_map(|key| self.active.remove(&key))
            .collect()
    }

    /// Hand a value to the subscriber. Returns `false` if there is no active
    /// subscription for the characteristic.
    pub(crate) fn deliver(&self, key: &CharacteristicKey, value: Bytes) -> bool {
        let Some(sub) = self.active.get(key) else {
            return false;
        };

        if sub.sender.send(value).is_err() {
            trace!("Subscriber for {} is gone", key.1);
            return true;
        }

        let backlog = sub.backlog.fetch_add(1, Ordering::Relaxed) + 1;
        if backlog == NOTIFICATION_BACKLOG_WARNING {
            warn!(
                "Subscriber for {} is falling behind ({} undelivered notifications)",
                key.1, backlog
            );
        }
        true
    }
}

/// Stream of notification values for one characteristic.
///
/// The stream ends when the subscription is removed by
/// [`DeviceSession::unsubscribe`](crate::DeviceSession::unsubscribe), by a
/// newer subscription to the same characteristic, or by a disconnect.
/// Dropping an active stream unsubscribes in the background.
pub struct NotificationStream {
    service_uuid: Uuid,
    characteristic_uuid: Uuid,
    receiver: mpsc::UnboundedReceiver<Bytes>,
    backlog: Arc<AtomicUsize>,
    release: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl NotificationStream {
    pub(crate) fn new(
        characteristic: &CharacteristicDescriptor,
        receiver: mpsc::UnboundedReceiver<Bytes>,
        backlog: Arc<AtomicUsize>,
        release: impl FnOnce() + Send + Sync + 'static,
    ) -> Self {
        Self {
            service_uuid: characteristic.service_uuid,
            characteristic_uuid: characteristic.uuid,
            receiver,
            backlog,
            release: Some(Box::new(release)),
        }
    }

    /// UUID of the owning service.
    pub fn service_uuid(&self) -> Uuid {
        self.service_uuid
    }

    /// UUID of the subscribed characteristic.
    pub fn characteristic_uuid(&self) -> Uuid {
        self.characteristic_uuid
    }

    /// Number of values received but not yet consumed.
    pub fn backlog(&self) -> usize {
        self.backlog.load(Ordering::Relaxed)
    }

    /// Receive the next value, or `None` once the subscription ended.
    pub async fn recv(&mut self) -> Option<Bytes> {
        let value = self.receiver.recv().await;
        if value.is_some() {
            self.backlog.fetch_sub(1, Ordering::Relaxed);
        }
        value
    }

    /// Receive the next value tagged with its source characteristic.
    pub async fn recv_event(&mut self) -> Option<NotificationEvent> {
        let data = self.recv().await?;
        Some(NotificationEvent {
            service_uuid: self.service_uuid,
            characteristic_uuid: self.characteristic_uuid,
            data,
        })
    }
}

impl Stream for NotificationStream {
    type Item = Bytes;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let poll = self.receiver.poll_recv(cx);
        if let Poll::Ready(Some(_)) = poll {
            self.backlog.fetch_sub(1, Ordering::Relaxed);
        }
        poll
    }
}

impl Drop for NotificationStream {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl std::fmt::Debug for NotificationStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationStream")
            .field("service_uuid", &self.service_uuid)
            .field("characteristic_uuid", &self.characteristic_uuid)
            .field("backlog", &self.backlog())
            .finish()
    }
}
