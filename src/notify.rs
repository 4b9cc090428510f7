use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Span;

const CHANNEL_CAPACITY: usize = 256;

/// Something a user should hear about. Delivery (email, push) is up to the
/// subscriber.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Notice {
    BookingConfirmed {
        booking_id: Ulid,
        spot_id: Ulid,
        span: Span,
        request_id: Option<Ulid>,
    },
    BookingCancelled {
        booking_id: Ulid,
        spot_id: Ulid,
        span: Span,
    },
    RequestWaitlisted {
        request_id: Ulid,
        span: Span,
    },
}

/// Broadcast hub of notices, one channel per user.
#[derive(Default)]
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Notice>>,
}

impl NotifyHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to a user's notices. Creates the channel if needed.
    pub fn subscribe(&self, user_id: Ulid) -> broadcast::Receiver<Notice> {
        let sender = self
            .channels
            .entry(user_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send a notice. No-op if nobody is listening.
    pub fn send(&self, user_id: Ulid, notice: Notice) {
        if let Some(sender) = self.channels.get(&user_id) {
            let _ = sender.send(notice);
        }
    }

    /// Drop channels whose last subscriber is gone. Returns how many.
    pub fn prune(&self) -> usize {
        let before = self.channels.len();
        self.channels.retain(|_, tx| tx.receiver_count() > 0);
        before.saturating_sub(self.channels.len())
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribe_and_receive() {
        let hub = NotifyHub::new();
        let user = Ulid::new();
        let mut rx = hub.subscribe(user);

        let notice = Notice::RequestWaitlisted {
            request_id: Ulid::new(),
            span: Span::new(1000, 2000),
        };
        hub.send(user, notice.clone());

        assert_eq!(rx.recv().await.unwrap(), notice);
    }

    #[tokio::test]
    async fn other_users_do_not_receive() {
        let hub = NotifyHub::new();
        let alice = Ulid::new();
        let bob = Ulid::new();
        let mut bob_rx = hub.subscribe(bob);
        hub.send(
            alice,
            Notice::RequestWaitlisted {
                request_id: Ulid::new(),
                span: Span::new(0, 1),
            },
        );
        assert!(bob_rx.try_recv().is_err());
    }

    #[test]
    fn send_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        hub.send(
            Ulid::new(),
            Notice::BookingCancelled {
                booking_id: Ulid::new(),
                spot_id: Ulid::new(),
                span: Span::new(0, 1),
            },
        );
        assert_eq!(hub.channel_count(), 0);
    }

    #[test]
    fn prune_drops_abandoned_channels() {
        let hub = NotifyHub::new();
        let rx = hub.subscribe(Ulid::new());
        let _kept = hub.subscribe(Ulid::new());
        assert_eq!(hub.channel_count(), 2);
        drop(rx);
        assert_eq!(hub.prune(), 1);
        assert_eq!(hub.channel_count(), 1);
        assert_eq!(hub.prune(), 0);
    }
}
