use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::model::Notification;

const CHANNEL_CAPACITY: usize = 256;

/// Broadcast hub for live queries, keyed by channel name
/// (`day_<date>`, `user_<id>`, `settings`).
pub struct NotifyHub {
    channels: DashMap<String, broadcast::Sender<Notification>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to a channel, creating it on first use.
    pub fn subscribe(&self, channel: &str) -> broadcast::Receiver<Notification> {
        if let Some(sender) = self.channels.get(channel) {
            return sender.subscribe();
        }
        self.channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Publish to one channel. No-op if nobody is listening.
    pub fn send(&self, channel: &str, notification: &Notification) {
        if let Some(sender) = self.channels.get(channel) {
            let _ = sender.send(notification.clone());
        }
    }

    /// Drop channels whose last listener went away.
    pub fn prune(&self) -> usize {
        let before = self.channels.len();
        self.channels.retain(|_, sender| sender.receiver_count() > 0);
        before - self.channels.len()
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{NotificationKind, SETTINGS_CHANNEL};

    #[tokio::test]
    async fn subscribe_and_receive() {
        let hub = NotifyHub::new();
        let mut rx = hub.subscribe(SETTINGS_CHANNEL);
        hub.send(SETTINGS_CHANNEL, &Notification::settings_changed());
        let received = rx.recv().await.unwrap();
        assert_eq!(received.kind, NotificationKind::SettingsChanged);
    }

    #[tokio::test]
    async fn channels_are_isolated() {
        let hub = NotifyHub::new();
        let mut day = hub.subscribe("day_2026-10-19");
        hub.send("day_2026-10-20", &Notification::settings_changed());
        assert!(day.try_recv().is_err());
    }

    #[test]
    fn send_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        hub.send("user_nobody", &Notification::settings_changed());
        assert_eq!(hub.channel_count(), 0);
    }

    #[test]
    fn prune_drops_abandoned_channels() {
        let hub = NotifyHub::new();
        let kept = hub.subscribe("user_a");
        drop(hub.subscribe("user_b"));
        assert_eq!(hub.prune(), 1);
        assert_eq!(hub.channel_count(), 1);
        drop(kept);
    }
}
