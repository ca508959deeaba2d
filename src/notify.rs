use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::model::{Event, ZoneId};

const CHANNEL_CAPACITY: usize = 256;

/// LISTEN channel name for a zone.
pub fn channel_name(zone_id: ZoneId) -> String {
    format!("zone_{zone_id}")
}

/// Inverse of [`channel_name`]. Accepts `zone_<id>` in any case.
pub fn parse_channel(channel: &str) -> Option<ZoneId> {
    let lower = channel.to_ascii_lowercase();
    lower.strip_prefix("zone_")?.parse().ok()
}

/// Broadcast hub for LISTEN/NOTIFY, one channel per zone.
pub struct NotifyHub {
    channels: DashMap<ZoneId, broadcast::Sender<Event>>,
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

    /// Subscribe to a zone's events. Creates the channel if needed; the zone
    /// does not have to exist in the topology.
    pub fn subscribe(&self, zone_id: ZoneId) -> broadcast::Receiver<Event> {
        let sender = self
            .channels
            .entry(zone_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send a notification. No-op if nobody is listening.
    pub fn send(&self, zone_id: ZoneId, event: &Event) {
        if let Some(sender) = self.channels.get(&zone_id) {
            let _ = sender.send(event.clone());
        }
    }

    /// Zones with a live channel.
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Drop a zone channel once its last listener is gone.
    pub fn remove_if_idle(&self, zone_id: ZoneId) {
        self.channels
            .remove_if(&zone_id, |_, sender| sender.receiver_count() == 0);
    }
}
