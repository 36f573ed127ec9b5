//! Status shared between connection handlers and the role scheduler.
//! Every update is a single atomic operation; maps are behind short-lived locks.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

/// Per-peer "request outstanding" flags.
#[derive(Debug, Default)]
pub struct PeerStatus {
    peers: RwLock<HashMap<IpAddr, Arc<AtomicBool>>>,
}

impl PeerStatus {
    /// Start with every known remote peer idle.
    pub fn new(peers: impl IntoIterator<Item = IpAddr>) -> Self {
        let peers = peers
            .into_iter()
            .map(|ip| (ip, Arc::new(AtomicBool::new(false))))
            .collect();
        Self {
            peers: RwLock::new(peers),
        }
    }

    /// Flag for `peer`, created idle on first contact. Handlers keep the `Arc` so
    /// per-chunk updates never touch the map lock.
    pub fn flag(&self, peer: IpAddr) -> Arc<AtomicBool> {
        if let Some(flag) = self.peers.read().get(&peer) {
            return flag.clone();
        }
        self.peers
            .write()
            .entry(peer)
            .or_insert_with(|| Arc::new(AtomicBool::new(false)))
            .clone()
    }

    pub fn is_outstanding(&self, peer: IpAddr) -> bool {
        self.peers
            .read()
            .get(&peer)
            .map(|f| f.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    pub fn any_outstanding(&self) -> bool {
        self.peers
            .read()
            .values()
            .any(|f| f.load(Ordering::Acquire))
    }
}

/// Progress of the current sync round on the master.
#[derive(Debug, Default)]
pub struct SyncRoundCounters {
    connected: AtomicU32,
    finished: AtomicU32,
    restart_after_sync: AtomicBool,
    clients_to_restart: Mutex<Vec<IpAddr>>,
}

/// Point-in-time copy of [`SyncRoundCounters`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoundSnapshot {
    pub connected: u32,
    pub finished: u32,
    pub restart_after_sync: bool,
    pub clients_to_restart: Vec<IpAddr>,
}

impl RoundSnapshot {
    /// Every push that started this round has finished.
    pub fn is_complete(&self) -> bool {
        self.connected > 0 && self.finished >= self.connected
    }
}

impl SyncRoundCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// A client push started.
    pub fn record_connected(&self) {
        self.connected.fetch_add(1, Ordering::AcqRel);
    }

    /// A client push finished; `restart_required` when it changed master files.
    pub fn record_finished(&self, peer: IpAddr, restart_required: bool) {
        if restart_required {
            let mut clients = self.clients_to_restart.lock();
            if !clients.contains(&peer) {
                clients.push(peer);
            }
            self.restart_after_sync.store(true, Ordering::Release);
        }
        self.finished.fetch_add(1, Ordering::AcqRel);
    }

    /// A started push failed; it no longer counts towards the round.
    pub fn record_abandoned(&self) {
        let _ = self
            .connected
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    pub fn snapshot(&self) -> RoundSnapshot {
        RoundSnapshot {
            connected: self.connected.load(Ordering::Acquire),
            finished: self.finished.load(Ordering::Acquire),
            restart_after_sync: self.restart_after_sync.load(Ordering::Acquire),
            clients_to_restart: self.clients_to_restart.lock().clone(),
        }
    }

    /// Close the round described by `evaluated`, a snapshot taken before deciding
    /// the round was complete. Only what that snapshot saw is removed; pushes that
    /// start or finish afterwards stay counted for the next round.
    pub fn close_round(&self, evaluated: &RoundSnapshot) {
        saturating_sub(&self.connected, evaluated.connected);
        saturating_sub(&self.finished, evaluated.finished);
        let mut clients = self.clients_to_restart.lock();
        clients.retain(|ip| !evaluated.clients_to_restart.contains(ip));
        self.restart_after_sync.store(!clients.is_empty(), Ordering::Release);
    }
}

fn saturating_sub(counter: &AtomicU32, n: u32) {
    let _ = counter.fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
        Some(v.saturating_sub(n))
    });
}

/// Everything handlers and the scheduler share for the life of the daemon.
#[derive(Debug, Default)]
pub struct SharedStatus {
    pub peers: PeerStatus,
    pub rounds: SyncRoundCounters,
}

impl SharedStatus {
    pub fn new(remote_peers: impl IntoIterator<Item = IpAddr>) -> Self {
        Self {
            peers: PeerStatus::new(remote_peers),
            rounds: SyncRoundCounters::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::{Duration, Instant};

    fn ip(last: u8) -> IpAddr {
        IpAddr::from([192, 168, 0, last])
    }

    #[test]
    fn known_peers_start_idle() {
        let status = PeerStatus::new([ip(2), ip(3)]);
        assert!(!status.any_outstanding());
        assert!(!status.is_outstanding(ip(2)));
        assert!(!status.is_outstanding(ip(3)));
    }

    #[test]
    fn unknown_peer_added_on_contact() {
        let status = PeerStatus::new([]);
        assert!(!status.is_outstanding(ip(9)));
        status.flag(ip(9)).store(true, Ordering::Release);
        assert!(status.is_outstanding(ip(9)));
        assert!(status.any_outstanding());
        status.flag(ip(9)).store(false, Ordering::Release);
        assert!(!status.is_outstanding(ip(9)));
    }

    #[test]
    fn flag_visible_across_threads() {
        let status = Arc::new(PeerStatus::new([ip(2)]));
        let flag = status.flag(ip(2));
        let seen = Arc::new(AtomicBool::new(false));

        let reader = {
            let status = status.clone();
            let seen = seen.clone();
            thread::spawn(move || {
                let deadline = Instant::now() + Duration::from_secs(5);
                while !status.is_outstanding(ip(2)) {
                    assert!(Instant::now() < deadline, "flag never became visible");
                    thread::yield_now();
                }
                seen.store(true, Ordering::Release);
                while status.is_outstanding(ip(2)) {
                    assert!(Instant::now() < deadline, "flag never reset");
                    thread::yield_now();
                }
            })
        };

        flag.store(true, Ordering::Release);
        while !seen.load(Ordering::Acquire) {
            thread::yield_now();
        }
        flag.store(false, Ordering::Release);
        reader.join().unwrap();
    }

    #[test]
    fn round_completes_when_all_finish() {
        let rounds = SyncRoundCounters::new();
        rounds.record_connected();
        rounds.record_connected();
        rounds.record_finished(ip(2), false);
        assert!(!rounds.snapshot().is_complete());
        rounds.record_finished(ip(3), true);
        let snap = rounds.snapshot();
        assert!(snap.is_complete());
        assert!(snap.restart_after_sync);
        assert_eq!(snap.clients_to_restart, vec![ip(3)]);
    }

    #[test]
    fn abandoned_push_not_counted() {
        let rounds = SyncRoundCounters::new();
        rounds.record_connected();
        rounds.record_connected();
        rounds.record_abandoned();
        rounds.record_finished(ip(2), false);
        assert!(rounds.snapshot().is_complete());
        rounds.record_abandoned();
        rounds.record_abandoned();
        assert_eq!(rounds.snapshot().connected, 0);
    }

    #[test]
    fn close_round_resets() {
        let rounds = SyncRoundCounters::new();
        rounds.record_connected();
        rounds.record_finished(ip(4), true);
        rounds.record_finished(ip(4), true);
        let snap = rounds.snapshot();
        assert_eq!(snap.clients_to_restart, vec![ip(4)]);
        rounds.close_round(&snap);
        assert_eq!(rounds.snapshot(), RoundSnapshot::default());
        assert!(!RoundSnapshot::default().is_complete());
    }

    #[test]
    fn push_started_after_evaluation_survives_close() {
        let rounds = SyncRoundCounters::new();
        rounds.record_connected();
        rounds.record_finished(ip(2), false);
        let snap = rounds.snapshot();
        assert!(snap.is_complete());

        // ip(3) connects between the evaluation and the close.
        rounds.record_connected();
        rounds.close_round(&snap);
        rounds.record_finished(ip(3), true);
        let next = rounds.snapshot();
        assert_eq!(next.connected, 1);
        assert_eq!(next.finished, 1);
        assert!(next.restart_after_sync);
        assert_eq!(next.clients_to_restart, vec![ip(3)]);

        // Two more pushes start, one finishes: the round must stay open.
        rounds.close_round(&next);
        rounds.record_connected();
        rounds.record_connected();
        rounds.record_finished(ip(4), false);
        assert!(!rounds.snapshot().is_complete());
    }

    #[test]
    fn restart_recorded_after_evaluation_is_kept() {
        let rounds = SyncRoundCounters::new();
        rounds.record_connected();
        rounds.record_finished(ip(2), true);
        let snap = rounds.snapshot();

        rounds.record_connected();
        rounds.record_finished(ip(3), true);
        rounds.close_round(&snap);
        let next = rounds.snapshot();
        assert_eq!(next.connected, 1);
        assert_eq!(next.finished, 1);
        assert!(next.restart_after_sync);
        assert_eq!(next.clients_to_restart, vec![ip(3)]);
    }

    #[test]
    fn concurrent_counting() {
        let rounds = Arc::new(SyncRoundCounters::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let rounds = rounds.clone();
                thread::spawn(move || {
                    for _ in 0..1000 {
                        rounds.record_connected();
                        rounds.record_finished(ip(i), false);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let snap = rounds.snapshot();
        assert_eq!(snap.connected, 8000);
        assert_eq!(snap.finished, 8000);
    }
}
