use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Process-wide relay counters. Each relay channel reports the bytes it
/// forwards and its own open/close; cheap enough to share across every
/// connection.
#[derive(Debug, Default)]
pub struct TrafficStats {
    bytes: AtomicU64,
    active_channels: AtomicI64,
    total_channels: AtomicU64,
}

impl TrafficStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_bytes(&self, n: u64) {
        self.bytes.fetch_add(n, Ordering::Relaxed);
    }

    pub fn channel_opened(&self) {
        self.active_channels.fetch_add(1, Ordering::Relaxed);
        self.total_channels.fetch_add(1, Ordering::Relaxed);
    }

    pub fn channel_closed(&self) {
        self.active_channels.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    pub fn active_channels(&self) -> i64 {
        self.active_channels.load(Ordering::Relaxed)
    }

    pub fn total_channels(&self) -> u64 {
        self.total_channels.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_track_channel_lifecycle() {
        let stats = TrafficStats::new();
        stats.channel_opened();
        stats.channel_opened();
        stats.add_bytes(100);
        stats.channel_closed();

        assert_eq!(stats.bytes(), 100);
        assert_eq!(stats.active_channels(), 1);
        assert_eq!(stats.total_channels(), 2);
    }
}
