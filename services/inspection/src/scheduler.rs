//! Periodic driver for [`Pipeline::run_once`].

use crate::pipeline::Pipeline;
use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub struct RunLoop {
    pipeline: Arc<Pipeline>,
    interval: Duration,
}

/// Owns a running loop; dropping it leaves the loop running
pub struct RunLoopHandle {
    cancel_token: CancellationToken,
    handle: JoinHandle<()>,
    passes: Arc<AtomicU64>,
}

impl RunLoop {
    pub fn new(pipeline: Arc<Pipeline>, interval: Duration) -> Self {
        Self { pipeline, interval }
    }

    /// Start ticking. The first pass runs immediately.
    pub fn spawn(self) -> RunLoopHandle {
        let cancel_token = CancellationToken::new();
        let passes = Arc::new(AtomicU64::new(0));
        let handle = tokio::spawn(run_loop(
            self.pipeline,
            self.interval,
            cancel_token.clone(),
            passes.clone(),
        ));

        RunLoopHandle {
            cancel_token,
            handle,
            passes,
        }
    }
}

impl RunLoopHandle {
    /// Passes that ran to completion, successful or not
    pub fn passes(&self) -> u64 {
        self.passes.load(Ordering::Relaxed)
    }

    pub fn token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    /// Cancel and wait for the loop to exit. A pass in flight finishes first.
    pub async fn stop(self) {
        self.cancel_token.cancel();
        if let Err(e) = self.handle.await {
            error!(error = %e, "Run loop task failed to join");
        }
    }
}

async fn run_loop(
    pipeline: Arc<Pipeline>,
    interval: Duration,
    cancel_token: CancellationToken,
    passes: Arc<AtomicU64>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(interval_secs = interval.as_secs_f64(), "Run loop started");

    loop {
        tokio::select! {
            biased;
            _ = cancel_token.cancelled() => {
                info!("Run loop shutting down");
                break;
            }
            _ = ticker.tick() => {
                let pipeline = pipeline.clone();
                let pass = tokio::spawn(async move { pipeline.run_once(Utc::now()).await });

                match pass.await {
                    Ok(Ok(summary)) => debug!(?summary, "Pass finished"),
                    Ok(Err(e)) => {
                        metrics::counter!("inspection.pass.errors").increment(1);
                        warn!(error = %e, "Pass failed");
                    }
                    Err(e) => {
                        metrics::counter!("inspection.pass.errors").increment(1);
                        error!(error = %e, "Pass panicked");
                    }
                }
                passes.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}
