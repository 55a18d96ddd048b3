use crate::state::ServiceState;
use redress_billing::{run_recurring_sweep, BillingDeps};
use redress_reconcile::ReconcileJob;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// How many due profiles one recurring sweep picks up.
const RECURRING_SWEEP_LIMIT: usize = 500;
const RECURRING_SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Spawn the periodic loops: the reconciliation sweep and the recurring
/// billing sweep. Handles run until aborted.
pub fn spawn_schedulers(state: &ServiceState) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::new();

    // Reconciliation: enqueue one identity-locked chunk per interval.
    {
        let state = state.clone();
        let interval = Duration::from_secs(state.config.reconcile.sweep_interval_secs.max(1));
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let job = ReconcileJob {
                    store: state.store.clone(),
                    kv: state.kv.clone(),
                    gateway: state.gateway.clone(),
                    config: state.config.clone(),
                };
                if state.runner.enqueue(Arc::new(job)).await {
                    info!("reconciliation sweep enqueued");
                }
            }
        }));
    }

    // Recurring billing: bill profiles whose cycle lock expired.
    {
        let state = state.clone();
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(RECURRING_SWEEP_INTERVAL);
            loop {
                ticker.tick().await;
                let deps = BillingDeps {
                    store: state.store.clone(),
                    kv: state.kv.clone(),
                    gateway: state.gateway.clone(),
                    config: state.config.clone(),
                };
                match run_recurring_sweep(&deps, RECURRING_SWEEP_LIMIT).await {
                    Ok(billed) if billed > 0 => info!(billed, "recurring sweep billed profiles"),
                    Ok(_) => {}
                    Err(error) => warn!(%error, "recurring sweep failed"),
                }
            }
        }));
    }

    handles
}
