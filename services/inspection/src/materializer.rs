//! Turns a settled cycle plus its correlated photos into exactly one
//! inspection record.

use crate::cycle_detector::Cycle;
use crate::inspection_store::{
    Inspection, InspectionRepository, InspectionStatus, NewInspection, NewPhotoLink,
    PhotoWindow, RepositoryError,
};
use crate::photo_correlator::CorrelatedPhoto;
use chrono::{DateTime, FixedOffset, Utc};
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// Outcome of one materialization
#[derive(Debug, Clone)]
pub struct Materialized {
    pub inspection: Inspection,
    /// False when the inspection already existed
    pub created: bool,
    /// Photo links written by this call
    pub linked: usize,
}

pub struct InspectionMaterializer {
    repository: Arc<dyn InspectionRepository>,
    machine_id: String,
    offset: FixedOffset,
    include_plc_failure: bool,
}

impl InspectionMaterializer {
    pub fn new(
        repository: Arc<dyn InspectionRepository>,
        machine_id: impl Into<String>,
        offset: FixedOffset,
    ) -> Self {
        Self {
            repository,
            machine_id: machine_id.into(),
            offset,
            include_plc_failure: false,
        }
    }

    /// Also fail inspections whose PLC ticks raised the failure flag, not
    /// only those with a failing photo
    pub fn with_plc_failure_flag(mut self, enabled: bool) -> Self {
        self.include_plc_failure = enabled;
        self
    }

    /// When the inspection happened: the first `FechaFoto`/`HoraFoto` pair
    /// in the cycle, read at the plant offset, else the cycle start
    pub fn inspection_date(&self, cycle: &Cycle) -> DateTime<Utc> {
        cycle
            .events
            .iter()
            .find_map(|e| e.fields.capture_request_time)
            .and_then(|naive| naive.and_local_timezone(self.offset).single())
            .map(|local| local.with_timezone(&Utc))
            .unwrap_or_else(|| cycle.started_at())
    }

    fn derive_status(&self, cycle: &Cycle, photos: &[CorrelatedPhoto]) -> InspectionStatus {
        let plc_failure = self.include_plc_failure && cycle.plc_reported_failure();
        if plc_failure || photos.iter().any(|p| p.failed) {
            InspectionStatus::Failed
        } else {
            InspectionStatus::Passed
        }
    }

    /// Create the inspection for `cycle` unless one already exists for its
    /// product code, then link every photo not yet linked. Safe to call
    /// again after a partial failure.
    #[instrument(skip(self, cycle, photos), fields(cycle = %cycle.key, photos = photos.len()))]
    pub async fn materialize(
        &self,
        cycle: &Cycle,
        photos: &[CorrelatedPhoto],
    ) -> Result<Materialized, RepositoryError> {
        let product_code = cycle.product_code();

        let (inspection, created) = match self.repository.find_by_product_code(&product_code).await? {
            Some(existing) => {
                debug!(inspection_id = %existing.id, "Inspection already materialized");
                (existing, false)
            }
            None => {
                let new = NewInspection {
                    product_code,
                    cycle_name: cycle.key.cycle_name.clone(),
                    execution_center_id: cycle.key.execution_center_id.clone(),
                    status: self.derive_status(cycle, photos),
                    inspection_date: self.inspection_date(cycle),
                    photo_window: PhotoWindow::from_times(photos.iter().map(|p| p.captured_at)),
                    source_event_ids: cycle.event_ids(),
                };
                self.repository.create_inspection(new).await?
            }
        };

        if !created {
            let (inspection, linked) = self.attach(inspection, photos).await?;
            return Ok(Materialized {
                inspection,
                created,
                linked,
            });
        }

        let (inspection, linked) = self.link(inspection, photos).await?;
        let now = Utc::now().with_timezone(&self.offset);
        self.repository
            .record_inspection(&self.machine_id, &inspection, now)
            .await?;
        metrics::counter!("inspection.inspections.created").increment(1);
        info!(
            inspection_id = %inspection.id,
            status = %inspection.status,
            linked,
            "Inspection created"
        );

        Ok(Materialized {
            inspection,
            created,
            linked,
        })
    }

    /// Link photos to an existing inspection and fold them into its status
    /// and photo window. Returns the refreshed inspection and the number of
    /// new links. A passed inspection turned failed adds one defect to the
    /// machine counters.
    pub async fn attach(
        &self,
        inspection: Inspection,
        photos: &[CorrelatedPhoto],
    ) -> Result<(Inspection, usize), RepositoryError> {
        let was_passed = inspection.status == InspectionStatus::Passed;
        let (inspection, linked) = self.link(inspection, photos).await?;

        if was_passed && inspection.status == InspectionStatus::Failed {
            self.repository.record_defect(&self.machine_id).await?;
            info!(inspection_id = %inspection.id, "Inspection failed by a late photo");
        }

        Ok((inspection, linked))
    }

    async fn link(
        &self,
        inspection: Inspection,
        photos: &[CorrelatedPhoto],
    ) -> Result<(Inspection, usize), RepositoryError> {
        let mut linked = 0;
        for photo in photos {
            let link = NewPhotoLink {
                filename: photo.filename.clone(),
                relative_path: photo.relative_path.clone(),
                control_point_id: photo.control_point_id.clone(),
                captured_at: photo.captured_at,
                failed: photo.failed,
            };
            if self.repository.link_photo(inspection.id, link).await? {
                linked += 1;
            }
        }
        if linked > 0 {
            metrics::counter!("inspection.photos.linked").increment(linked as u64);
        }

        let links = self.repository.photos_for(inspection.id).await?;
        let status = if links.iter().any(|l| l.failed) {
            InspectionStatus::Failed
        } else {
            inspection.status
        };
        let window = links
            .iter()
            .filter_map(|l| l.captured_at)
            .fold(inspection.photo_window, PhotoWindow::including);

        if status == inspection.status && window == inspection.photo_window {
            return Ok((inspection, linked));
        }

        let updated = self
            .repository
            .update_outcome(inspection.id, status, window)
            .await?;
        Ok((updated, linked))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cycle_detector::CycleDetector;
    use crate::event_store::RawEvent;
    use crate::inspection_store::MemoryInspectionRepository;
    use crate::photo_correlator::PhotoSource;
    use chrono::{NaiveDate, NaiveDateTime};
    use serde_json::json;

    fn utc() -> FixedOffset {
        FixedOffset::east_opt(0).unwrap()
    }

    fn cycle_with(extra: serde_json::Value) -> Cycle {
        let start = DateTime::from_timestamp(1_766_224_800, 0).unwrap();
        let mut first = json!({
            "NombreCiclo": "CNA2",
            "ID_EC": "E3742",
            "CicloActivo": true,
            "datetime": start.to_rfc3339(),
        });
        if let (Some(target), Some(source)) = (first.as_object_mut(), extra.as_object()) {
            target.extend(source.clone());
        }
        let end = start + chrono::Duration::seconds(60);
        let last = json!({
            "NombreCiclo": "CNA2",
            "ID_EC": "E3742",
            "CicloActivo": false,
            "datetime": end.to_rfc3339(),
        });
        let events = vec![
            RawEvent {
                id: 1,
                delivered_at: start,
                payload: first.to_string(),
                processed: false,
            },
            RawEvent {
                id: 2,
                delivered_at: end,
                payload: last.to_string(),
                processed: false,
            },
        ];
        CycleDetector::new(100, utc()).detect(events).closed.remove(0)
    }

    fn at(h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 12, 20)
            .unwrap()
            .and_hms_opt(h, m, s)
            .unwrap()
    }

    fn photo(name: &str, failed: bool, captured_at: Option<NaiveDateTime>) -> CorrelatedPhoto {
        CorrelatedPhoto {
            path: format!("/processed/CNA2-E3742/{name}").into(),
            filename: name.to_string(),
            relative_path: format!("CNA2-E3742/{name}"),
            control_point_id: "1F".to_string(),
            captured_at,
            failed,
            source: PhotoSource::Staging,
        }
    }

    fn materializer(repo: &Arc<MemoryInspectionRepository>) -> InspectionMaterializer {
        let repository: Arc<dyn InspectionRepository> = repo.clone();
        InspectionMaterializer::new(repository, "MAQ-001", utc())
    }

    #[tokio::test]
    async fn test_materialize_twice_yields_one_inspection() {
        let repo = Arc::new(MemoryInspectionRepository::new());
        let materializer = materializer(&repo);
        let cycle = cycle_with(json!({}));
        let photos = vec![
            photo("a.bmp", false, Some(at(10, 0, 10))),
            photo("b.bmp", false, Some(at(10, 0, 40))),
        ];

        let first = materializer.materialize(&cycle, &photos).await.unwrap();
        assert!(first.created);
        assert_eq!(first.linked, 2);
        assert_eq!(first.inspection.status, InspectionStatus::Passed);
        assert_eq!(first.inspection.product_code, "CNA2-E3742");
        assert_eq!(first.inspection.source_event_ids, vec![1, 2]);
        assert_eq!(first.inspection.photo_window.start, Some(at(10, 0, 10)));
        assert_eq!(first.inspection.photo_window.finish, Some(at(10, 0, 40)));

        let second = materializer.materialize(&cycle, &photos).await.unwrap();
        assert!(!second.created);
        assert_eq!(second.linked, 0);
        assert_eq!(second.inspection.id, first.inspection.id);

        assert_eq!(repo.inspections().await.len(), 1);
        assert_eq!(repo.photos_for(first.inspection.id).await.unwrap().len(), 2);

        let stats = repo.machine_stats("MAQ-001").await.unwrap().unwrap();
        assert_eq!(stats.total_inspections, 1);
    }

    #[tokio::test]
    async fn test_any_failed_photo_fails_inspection() {
        let repo = Arc::new(MemoryInspectionRepository::new());
        let materializer = materializer(&repo);
        let photos = vec![photo("a.bmp", false, None), photo("b.bmp", true, None)];

        let result = materializer
            .materialize(&cycle_with(json!({})), &photos)
            .await
            .unwrap();
        assert_eq!(result.inspection.status, InspectionStatus::Failed);

        let stats = repo.machine_stats("MAQ-001").await.unwrap().unwrap();
        assert_eq!(stats.total_defects_found, 1);
    }

    #[tokio::test]
    async fn test_rerun_after_partial_link_completes_links() {
        let repo = Arc::new(MemoryInspectionRepository::new());
        let materializer = materializer(&repo);
        let cycle = cycle_with(json!({}));

        materializer
            .materialize(&cycle, &[photo("a.bmp", false, None)])
            .await
            .unwrap();
        let rerun = materializer
            .materialize(
                &cycle,
                &[photo("a.bmp", false, None), photo("b.bmp", true, Some(at(10, 0, 30)))],
            )
            .await
            .unwrap();

        assert!(!rerun.created);
        assert_eq!(rerun.linked, 1);
        assert_eq!(rerun.inspection.status, InspectionStatus::Failed);
        assert_eq!(rerun.inspection.photo_window.start, Some(at(10, 0, 30)));

        let stats = repo.machine_stats("MAQ-001").await.unwrap().unwrap();
        assert_eq!(stats.total_inspections, 1);
        assert_eq!(stats.total_defects_found, 1);
    }

    #[tokio::test]
    async fn test_attach_counts_defect_only_on_flip() {
        let repo = Arc::new(MemoryInspectionRepository::new());
        let materializer = materializer(&repo);
        let created = materializer
            .materialize(&cycle_with(json!({})), &[photo("a.bmp", false, Some(at(10, 0, 10)))])
            .await
            .unwrap();

        let (flipped, _) = materializer
            .attach(created.inspection, &[photo("b.bmp", true, Some(at(10, 0, 20)))])
            .await
            .unwrap();
        assert_eq!(flipped.status, InspectionStatus::Failed);

        let (_, linked) = materializer
            .attach(flipped, &[photo("c.bmp", true, Some(at(10, 0, 30)))])
            .await
            .unwrap();
        assert_eq!(linked, 1);

        let stats = repo.machine_stats("MAQ-001").await.unwrap().unwrap();
        assert_eq!(stats.total_inspections, 1);
        assert_eq!(stats.total_defects_found, 1);
    }

    #[test]
    fn test_inspection_date_prefers_capture_request() {
        let repo = Arc::new(MemoryInspectionRepository::new());
        let materializer = materializer(&repo);

        let with_request = cycle_with(json!({"FechaFoto": "201225", "HoraFoto": "095959"}));
        assert_eq!(
            materializer.inspection_date(&with_request),
            at(9, 59, 59).and_utc()
        );

        let without = cycle_with(json!({}));
        assert_eq!(materializer.inspection_date(&without), without.started_at());
    }

    #[tokio::test]
    async fn test_plc_failure_flag_is_opt_in() {
        let cycle = cycle_with(json!({"Falla": true}));

        let repo = Arc::new(MemoryInspectionRepository::new());
        let passed = materializer(&repo)
            .materialize(&cycle, &[photo("a.bmp", false, None)])
            .await
            .unwrap();
        assert_eq!(passed.inspection.status, InspectionStatus::Passed);

        let repo = Arc::new(MemoryInspectionRepository::new());
        let failed = materializer(&repo)
            .with_plc_failure_flag(true)
            .materialize(&cycle, &[photo("a.bmp", false, None)])
            .await
            .unwrap();
        assert_eq!(failed.inspection.status, InspectionStatus::Failed);
    }
}
