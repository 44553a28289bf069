//! One pass of the event → cycle → inspection pipeline.
//!
//! ```text
//! fetch pages ─► detect ─► discard noise and abandoned cycles
//!                        │
//!                        ▼
//!                  settlement gate ──waiting──► left unprocessed
//!                        │ ready
//!                        ▼
//!        claim ─► correlate photos ─► materialize ─► complete
//!          │ lost                          │ error
//!          ▼                               ▼
//!        skip                           release
//! ```
//!
//! Waiting and open cycles are never persisted: their events stay
//! unprocessed and the cycle is rebuilt on the next pass.

use crate::config::{Config, PhotoConfig, ProcessingConfig};
use crate::cycle_detector::{Cycle, CycleDetector, CycleState, Detection};
use crate::event_store::{EventCursor, EventStore, StoreError};
use crate::inspection_store::{InspectionRepository, RepositoryError};
use crate::materializer::InspectionMaterializer;
use crate::photo_correlator::{PhotoCorrelator, PhotoError};
use crate::settlement::SettlementGate;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("event store: {0}")]
    Store(#[from] StoreError),

    #[error("photos: {0}")]
    Photo(#[from] PhotoError),

    #[error("inspection repository: {0}")]
    Repository(#[from] RepositoryError),
}

/// Counters for one pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PassSummary {
    pub scanned: usize,
    pub discarded: usize,
    pub cycles_closed: usize,
    pub cycles_waiting: usize,
    pub cycles_open: usize,
    pub cycles_abandoned: usize,
    pub cycles_finalized: usize,
    pub inspections_created: usize,
    pub cycles_without_photos: usize,
    pub cycles_failed: usize,
    pub claims_lost: usize,
    pub photos_linked: usize,
    pub photos_recovered: usize,
}

impl PassSummary {
    fn record_metrics(&self) {
        metrics::counter!("inspection.cycles.closed").increment(self.cycles_closed as u64);
        metrics::counter!("inspection.cycles.finalized").increment(self.cycles_finalized as u64);
        metrics::counter!("inspection.cycles.without_photos")
            .increment(self.cycles_without_photos as u64);
        metrics::counter!("inspection.cycles.failed").increment(self.cycles_failed as u64);
        metrics::counter!("inspection.claims.lost").increment(self.claims_lost as u64);
        metrics::counter!("inspection.cycles.abandoned").increment(self.cycles_abandoned as u64);
        metrics::gauge!("inspection.cycles.waiting").set(self.cycles_waiting as f64);
    }
}

/// Tunables a pipeline is built from
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub processing: ProcessingConfig,
    pub photos: PhotoConfig,
    pub machine_id: String,
    /// Claim owner for this process
    pub worker_id: String,
}

impl PipelineOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            processing: config.processing.clone(),
            photos: config.photos.clone(),
            machine_id: config.machine.machine_id.clone(),
            worker_id: config.service.worker_id.clone(),
        }
    }
}

enum CycleOutcome {
    Finalized { created: bool, linked: usize },
    WithoutPhotos,
}

pub struct Pipeline {
    events: Arc<dyn EventStore>,
    inspections: Arc<dyn InspectionRepository>,
    detector: CycleDetector,
    gate: SettlementGate,
    correlator: PhotoCorrelator,
    materializer: InspectionMaterializer,
    worker_id: String,
    lease: Duration,
    max_pages: usize,
    recovery_every: u64,
    passes: AtomicU64,
}

impl Pipeline {
    pub fn new(
        events: Arc<dyn EventStore>,
        inspections: Arc<dyn InspectionRepository>,
        options: PipelineOptions,
    ) -> Self {
        let offset = options.processing.plant_offset();
        Self {
            detector: CycleDetector::new(options.processing.batch_size, offset)
                .with_open_timeout(options.processing.open_cycle_timeout()),
            gate: SettlementGate::new(options.processing.wait_time(), offset),
            correlator: PhotoCorrelator::new(options.photos, offset),
            materializer: InspectionMaterializer::new(
                inspections.clone(),
                options.machine_id,
                offset,
            )
            .with_plc_failure_flag(options.processing.fail_on_plc_flag),
            lease: options.processing.claim_lease(),
            max_pages: options.processing.max_pages_per_pass.max(1),
            recovery_every: options.processing.recovery_every_passes,
            worker_id: options.worker_id,
            events,
            inspections,
            passes: AtomicU64::new(0),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn events(&self) -> &Arc<dyn EventStore> {
        &self.events
    }

    pub fn inspections(&self) -> &Arc<dyn InspectionRepository> {
        &self.inspections
    }

    pub fn detector(&self) -> &CycleDetector {
        &self.detector
    }

    pub fn gate(&self) -> &SettlementGate {
        &self.gate
    }

    pub fn correlator(&self) -> &PhotoCorrelator {
        &self.correlator
    }

    /// Most events a single pass reads
    pub fn scan_window(&self) -> usize {
        self.detector.batch_limit() * self.max_pages
    }

    /// Read the backlog page by page and detect cycles across the pages.
    /// Stops at the end of the backlog or after `max_pages_per_pass` pages.
    pub async fn scan(&self, now: DateTime<Utc>) -> Result<Detection, PipelineError> {
        let limit = self.detector.batch_limit();
        let mut scan = self.detector.scan();
        let mut cursor: Option<EventCursor> = None;
        let mut exhausted = false;

        for _ in 0..self.max_pages {
            let page = self.events.fetch_unprocessed_after(cursor, limit).await?;
            exhausted = page.len() < limit;
            cursor = page.last().map(EventCursor::after);
            scan.feed(page);
            if exhausted {
                break;
            }
        }

        if !exhausted {
            warn!(
                scanned = scan.scanned(),
                window = self.scan_window(),
                "Backlog exceeds the scan window; later events wait for the next pass"
            );
        }

        Ok(scan.finish(exhausted.then_some(now)))
    }

    /// Run one pass as of `now`.
    #[instrument(skip(self), fields(worker = %self.worker_id))]
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<PassSummary, PipelineError> {
        let started = Instant::now();
        let pass = self.passes.fetch_add(1, Ordering::Relaxed) + 1;
        let mut summary = PassSummary::default();

        let detection = self.scan(now).await?;
        if detection.scanned == 0 {
            debug!("No unprocessed events");
        }
        summary.scanned = detection.scanned;
        summary.cycles_closed = detection.closed.len();
        summary.cycles_open = detection.open.len();
        summary.cycles_abandoned = detection.abandoned.len();

        if !detection.discarded.is_empty() {
            for discarded in &detection.discarded {
                metrics::counter!("inspection.events.discarded", "reason" => discarded.reason.as_str())
                    .increment(1);
            }
            let discarded = self.events.discard(&detection.discarded_ids()).await?;
            summary.discarded = discarded as usize;
        }

        let (ready, waiting) = self.gate.partition(detection.closed, now);
        summary.cycles_waiting = waiting.len();
        for cycle in &waiting {
            if let Some(decision) = self.gate.decide(cycle, now) {
                debug!(cycle = %cycle.key, ?decision, "Cycle waiting for photos to settle");
            }
        }

        for mut cycle in ready {
            self.finalize(&mut cycle, &mut summary).await;
        }

        if self.recovery_every > 0 && pass % self.recovery_every == 0 {
            match self.recover_orphans().await {
                Ok(recovered) => summary.photos_recovered = recovered,
                Err(e) => warn!(error = %e, "Orphan photo recovery failed"),
            }
        }

        summary.record_metrics();
        metrics::histogram!("inspection.pass.duration_seconds")
            .record(started.elapsed().as_secs_f64());

        if summary.cycles_finalized > 0 || summary.cycles_failed > 0 {
            info!(
                finalized = summary.cycles_finalized,
                created = summary.inspections_created,
                failed = summary.cycles_failed,
                waiting = summary.cycles_waiting,
                "Pass completed"
            );
        }

        Ok(summary)
    }

    /// Claim, correlate, materialize and complete one settled cycle. Errors
    /// stay inside the cycle: the claim is released and the next pass
    /// rebuilds it.
    async fn finalize(&self, cycle: &mut Cycle, summary: &mut PassSummary) {
        let ids = cycle.event_ids();

        match self.events.claim(&ids, &self.worker_id, self.lease).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(cycle = %cycle.key, "Cycle claimed elsewhere");
                summary.claims_lost += 1;
                return;
            }
            Err(e) => {
                error!(cycle = %cycle.key, error = %e, "Failed to claim cycle");
                summary.cycles_failed += 1;
                return;
            }
        }

        let outcome = match self.settle(cycle).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(cycle = %cycle.key, error = %e, "Failed to finalize cycle");
                metrics::counter!("inspection.pass.errors").increment(1);
                summary.cycles_failed += 1;
                if let Err(e) = self.events.release(&ids, &self.worker_id).await {
                    warn!(cycle = %cycle.key, error = %e, "Failed to release claim; lease will expire");
                }
                return;
            }
        };

        match self.events.complete(&ids, &self.worker_id).await {
            Ok(n) if n as usize == ids.len() => {}
            Ok(n) => warn!(
                cycle = %cycle.key,
                completed = n,
                expected = ids.len(),
                "Claim lease expired before completion"
            ),
            Err(e) => {
                // inspection exists; the rebuilt cycle will find it and only complete
                error!(cycle = %cycle.key, error = %e, "Failed to mark cycle processed");
                summary.cycles_failed += 1;
                return;
            }
        }

        cycle.state = CycleState::Finalized;
        summary.cycles_finalized += 1;
        match outcome {
            CycleOutcome::Finalized { created, linked } => {
                if created {
                    summary.inspections_created += 1;
                }
                summary.photos_linked += linked;
            }
            CycleOutcome::WithoutPhotos => summary.cycles_without_photos += 1,
        }
    }

    async fn settle(&self, cycle: &Cycle) -> Result<CycleOutcome, PipelineError> {
        let photos = self.correlator.correlate(cycle).await?;
        if photos.is_empty() {
            info!(cycle = %cycle.key, "No photos for cycle, skipping inspection");
            return Ok(CycleOutcome::WithoutPhotos);
        }

        let materialized = self.materializer.materialize(cycle, &photos).await?;
        Ok(CycleOutcome::Finalized {
            created: materialized.created,
            linked: materialized.linked,
        })
    }

    /// Link staged photos that arrived after their inspection was created.
    /// A photo qualifies when its key names an existing inspection and its
    /// capture time lies inside that inspection's photo window.
    #[instrument(skip(self))]
    pub async fn recover_orphans(&self) -> Result<usize, PipelineError> {
        let staged = self.correlator.staged_photos().await?;
        let mut recovered = 0;

        for photo in staged {
            let Some(captured_at) = photo.captured_at else {
                continue;
            };
            let product_code = photo.key().product_code();
            let Some(inspection) = self.inspections.find_by_product_code(&product_code).await?
            else {
                continue;
            };
            if !inspection.photo_window.contains(captured_at) {
                continue;
            }

            let moved = match self.correlator.relocate(&photo).await {
                Ok(moved) => moved,
                Err(e) => {
                    warn!(photo = %photo.filename, error = %e, "Failed to move orphan photo");
                    continue;
                }
            };
            let (_, linked) = self.materializer.attach(inspection, &[moved]).await?;
            if linked > 0 {
                info!(photo = %photo.filename, %product_code, "Recovered orphan photo");
                recovered += linked;
            }
        }

        if recovered > 0 {
            metrics::counter!("inspection.photos.recovered").increment(recovered as u64);
        }
        Ok(recovered)
    }
}
