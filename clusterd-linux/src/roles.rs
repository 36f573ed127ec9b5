//! Role loops: the master waits for sync round events, a client pushes on an interval.

use std::sync::Arc;
use std::time::Duration;

use clusterd_core::scheduler::{evaluate_round, RoundDecision};
use clusterd_core::SharedStatus;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, info_span, Instrument};

use crate::backend::SyncBackend;
use crate::handler::RoundEvent;

/// Reason sent with every scheduled client push.
pub const CLIENT_PUSH_REASON: &str = "Client interval";

/// Wake whenever a connection closes and close the round once nothing is in flight.
/// Returns when every sender is gone.
pub async fn run_master(
    mut events: mpsc::UnboundedReceiver<RoundEvent>,
    status: Arc<SharedStatus>,
    backend: Arc<dyn SyncBackend>,
) {
    async move {
        info!("waiting for client syncs");
        while let Some(event) = events.recv().await {
            let snapshot = status.rounds.snapshot();
            let decision = evaluate_round(&snapshot, status.peers.any_outstanding());
            if decision == RoundDecision::Pending {
                debug!(
                    peer = %event.peer,
                    client_sync = event.client_sync,
                    connected = snapshot.connected,
                    finished = snapshot.finished,
                    "sync round in progress"
                );
                continue;
            }
            status.rounds.close_round(&snapshot);
            info!(clients = snapshot.finished, "sync round complete");
            if let RoundDecision::Restart(clients) = decision {
                if let Err(e) = backend.restart_after_sync(&clients).await {
                    error!(error = %e, "restart after sync failed");
                }
            }
        }
        info!("round event channel closed");
    }
    .instrument(info_span!("master"))
    .await
}

/// Push this node's files now and then every `period`. Never returns.
pub async fn run_client(period: Duration, backend: Arc<dyn SyncBackend>) {
    async move {
        info!(?period, "synchronization interval");
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match backend.push_client_state(CLIENT_PUSH_REASON).await {
                Ok(()) => debug!("push finished"),
                Err(e) => error!(error = %e, "push to master failed"),
            }
        }
    }
    .instrument(info_span!("client"))
    .await
}
