use dashmap::DashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Process-wide record of which peers have presented valid credentials.
///
/// A peer that authenticates once may open further connections within the
/// freshness window without re-presenting credentials; SOCKS4/5, HTTP and
/// the prefix-authenticated protocols all consult this through a per-peer
/// [`AuthTable`] view.
#[derive(Debug)]
pub struct AuthKeeper {
    entries: DashMap<IpAddr, Instant>,
    ttl: Duration,
}

impl AuthKeeper {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    pub fn table(self: &Arc<Self>, peer: IpAddr) -> AuthTable {
        AuthTable {
            keeper: self.clone(),
            peer,
        }
    }
}

/// Sticky per-peer authentication bit, scoped to one connection's handshake.
#[derive(Debug, Clone)]
pub struct AuthTable {
    keeper: Arc<AuthKeeper>,
    peer: IpAddr,
}

impl AuthTable {
    pub fn authed(&self) -> bool {
        // the map guard must drop before the expired entry is removed
        let fresh = match self.keeper.entries.get(&self.peer) {
            Some(stamp) => stamp.elapsed() <= self.keeper.ttl,
            None => return false,
        };
        if !fresh {
            self.keeper.entries.remove(&self.peer);
        }
        fresh
    }

    pub fn set_authed(&self) {
        self.keeper.entries.insert(self.peer, Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sticky_bit_persists_per_peer() {
        let keeper = Arc::new(AuthKeeper::new(Duration::from_secs(60)));
        let peer: IpAddr = "10.0.0.1".parse().unwrap();
        let other: IpAddr = "10.0.0.2".parse().unwrap();

        let table = keeper.table(peer);
        assert!(!table.authed());
        table.set_authed();
        assert!(table.authed());

        // a second connection from the same peer sees the bit
        assert!(keeper.table(peer).authed());
        assert!(!keeper.table(other).authed());
    }

    #[test]
    fn expired_entries_fall_back_to_unauthenticated() {
        let keeper = Arc::new(AuthKeeper::new(Duration::ZERO));
        let peer: IpAddr = "10.0.0.1".parse().unwrap();
        let table = keeper.table(peer);
        table.set_authed();
        std::thread::sleep(Duration::from_millis(5));
        assert!(!table.authed());
    }
}
