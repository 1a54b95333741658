//! Configuration reconciliation loop
//!
//! Runs one bootstrap iteration, then polls the control plane on a fixed
//! interval. Every outcome is reported on the error channel; nothing that
//! happens inside an iteration stops the loop. Only the stop channel, a
//! dropped observer, or cancellation of the parent token end it.

use crate::config::CheckInterval;
use crate::error::SupervisorError;
use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Outcome of one iteration as seen by the observer
pub type Outcome = Result<(), SupervisorError>;

/// One deployment's fetch, build and rollout steps
#[async_trait]
pub trait Reconciler: Send + Sync {
    /// First iteration: fetch, build and apply unconditionally
    async fn bootstrap(&self) -> Outcome;

    /// Periodic iteration: apply only what the control plane flagged
    async fn tick(&self) -> Outcome;
}

/// Channel pair used by [`listen_for_config_changes`]
///
/// The error channel holds a single outcome so the loop never runs more
/// than one iteration ahead of its observer.
pub fn outcome_channel() -> (mpsc::Sender<Outcome>, mpsc::Receiver<Outcome>) {
    mpsc::channel(1)
}

/// Run the loop until stopped
///
/// Cancellation aborts the in-flight iteration, reports
/// [`SupervisorError::Cancelled`] once and returns.
pub async fn listen_for_config_changes<R>(
    reconciler: &R,
    interval: CheckInterval,
    err_tx: mpsc::Sender<Outcome>,
    mut stop_rx: oneshot::Receiver<()>,
    cancel: CancellationToken,
) where
    R: Reconciler + ?Sized,
{
    let outcome = run_cancellable(&cancel, reconciler.bootstrap()).await;
    log_outcome("bootstrap", &outcome);
    let cancelled = outcome.as_ref().is_err_and(SupervisorError::is_cancelled);
    if !report(&err_tx, outcome, &mut stop_rx).await || cancelled {
        return;
    }

    let Some(period) = interval.period() else {
        info!("Config check interval is 0, periodic checks disabled");
        return;
    };

    let mut ticker = time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(interval = %interval, "Listening for config changes");

    loop {
        tokio::select! {
            _ = &mut stop_rx => {
                info!("Stop requested, config listener exiting");
                return;
            }
            _ = cancel.cancelled() => {
                let _ = report(&err_tx, Err(SupervisorError::Cancelled), &mut stop_rx).await;
                return;
            }
            _ = ticker.tick() => {
                let outcome = run_tick(reconciler, &cancel).await;
                let cancelled = outcome.as_ref().is_err_and(SupervisorError::is_cancelled);
                if !report(&err_tx, outcome, &mut stop_rx).await || cancelled {
                    return;
                }
            }
        }
    }
}

#[instrument(skip_all)]
async fn run_tick<R>(reconciler: &R, cancel: &CancellationToken) -> Outcome
where
    R: Reconciler + ?Sized,
{
    let outcome = run_cancellable(cancel, reconciler.tick()).await;
    log_outcome("tick", &outcome);
    outcome
}

async fn run_cancellable<F>(cancel: &CancellationToken, iteration: F) -> Outcome
where
    F: std::future::Future<Output = Outcome>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(SupervisorError::Cancelled),
        outcome = iteration => outcome,
    }
}

/// Deliver an outcome; false when the loop should exit instead
///
/// An outcome the channel can take is always delivered; stop only wins
/// while the observer is stalled.
async fn report(
    err_tx: &mpsc::Sender<Outcome>,
    outcome: Outcome,
    stop_rx: &mut oneshot::Receiver<()>,
) -> bool {
    tokio::select! {
        biased;
        sent = err_tx.send(outcome) => {
            if sent.is_err() {
                debug!("Outcome observer dropped, config listener exiting");
            }
            sent.is_ok()
        }
        _ = stop_rx => {
            info!("Stop requested while reporting, config listener exiting");
            false
        }
    }
}

fn log_outcome(stage: &str, outcome: &Outcome) {
    match outcome {
        Ok(()) => debug!(stage, "Config reconciliation succeeded"),
        Err(SupervisorError::Cancelled) => info!(stage, "Config reconciliation cancelled"),
        Err(e) if e.is_transient() => warn!(stage, kind = e.kind(), "Config reconciliation failed, retrying next tick: {}", e),
        Err(e) => warn!(stage, kind = e.kind(), "Config reconciliation failed: {}", e),
    }
}
