//! Persistence collaborator for materialized inspections, their photo links
//! and the machine counters.
//!
//! Both uniqueness rules live in the store: one inspection per
//! `product_code`, one link per `(inspection_id, filename)`. Creation and
//! linking report whether a row was actually written so callers can stay
//! idempotent without a separate existence check.

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgPool;
use sqlx::FromRow;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, instrument};
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("inspection {0} not found")]
    NotFound(Uuid),

    #[error("unknown inspection status {0:?}")]
    UnknownStatus(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InspectionStatus {
    Passed,
    Failed,
}

impl InspectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InspectionStatus::Passed => "passed",
            InspectionStatus::Failed => "failed",
        }
    }

    fn from_db(value: &str) -> Result<Self, RepositoryError> {
        match value {
            "passed" => Ok(InspectionStatus::Passed),
            "failed" => Ok(InspectionStatus::Failed),
            other => Err(RepositoryError::UnknownStatus(other.to_string())),
        }
    }
}

impl fmt::Display for InspectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Earliest and latest capture time across an inspection's photos
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhotoWindow {
    pub start: Option<NaiveDateTime>,
    pub finish: Option<NaiveDateTime>,
}

impl PhotoWindow {
    pub fn from_times<I>(times: I) -> Self
    where
        I: IntoIterator<Item = Option<NaiveDateTime>>,
    {
        times
            .into_iter()
            .flatten()
            .fold(Self::default(), |window, ts| window.including(ts))
    }

    pub fn including(self, ts: NaiveDateTime) -> Self {
        Self {
            start: Some(self.start.map_or(ts, |s| s.min(ts))),
            finish: Some(self.finish.map_or(ts, |f| f.max(ts))),
        }
    }

    /// Both bounds must be known
    pub fn contains(&self, ts: NaiveDateTime) -> bool {
        match (self.start, self.finish) {
            (Some(start), Some(finish)) => start <= ts && ts <= finish,
            _ => false,
        }
    }
}

/// A materialized inspection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Inspection {
    pub id: Uuid,
    /// `{cycle_name}-{execution_center_id}`
    pub product_code: String,
    pub cycle_name: String,
    pub execution_center_id: String,
    pub status: InspectionStatus,
    pub inspection_date: DateTime<Utc>,
    pub photo_window: PhotoWindow,
    /// Raw events the cycle was built from
    pub source_event_ids: Vec<i64>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, FromRow)]
struct InspectionRow {
    id: Uuid,
    product_code: String,
    cycle_name: String,
    execution_center_id: String,
    status: String,
    inspection_date: DateTime<Utc>,
    photo_start_at: Option<NaiveDateTime>,
    photo_finish_at: Option<NaiveDateTime>,
    source_event_ids: Vec<i64>,
    created_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<InspectionRow> for Inspection {
    type Error = RepositoryError;

    fn try_from(row: InspectionRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            product_code: row.product_code,
            cycle_name: row.cycle_name,
            execution_center_id: row.execution_center_id,
            status: InspectionStatus::from_db(&row.status)?,
            inspection_date: row.inspection_date,
            photo_window: PhotoWindow {
                start: row.photo_start_at,
                finish: row.photo_finish_at,
            },
            source_event_ids: row.source_event_ids,
            created_at: row.created_at,
            completed_at: row.completed_at,
        })
    }
}

#[derive(Debug, Clone)]
pub struct NewInspection {
    pub product_code: String,
    pub cycle_name: String,
    pub execution_center_id: String,
    pub status: InspectionStatus,
    pub inspection_date: DateTime<Utc>,
    pub photo_window: PhotoWindow,
    pub source_event_ids: Vec<i64>,
}

/// A photo linked to an inspection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct PhotoLink {
    pub id: Uuid,
    pub inspection_id: Uuid,
    pub filename: String,
    pub relative_path: String,
    pub control_point_id: String,
    pub captured_at: Option<NaiveDateTime>,
    pub failed: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewPhotoLink {
    pub filename: String,
    pub relative_path: String,
    pub control_point_id: String,
    pub captured_at: Option<NaiveDateTime>,
    pub failed: bool,
}

/// Aggregate counters for one inspection machine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct MachineStats {
    pub machine_id: String,
    pub total_inspections: i64,
    pub inspections_today: i64,
    pub stats_day: NaiveDate,
    pub total_defects_found: i64,
    pub last_inspection_at: Option<DateTime<Utc>>,
    pub current_inspection_id: Option<Uuid>,
}

#[async_trait]
pub trait InspectionRepository: Send + Sync {
    async fn find_by_product_code(
        &self,
        product_code: &str,
    ) -> Result<Option<Inspection>, RepositoryError>;

    /// Insert unless an inspection with the same product code exists. The
    /// flag is true when this call created the row.
    async fn create_inspection(
        &self,
        new: NewInspection,
    ) -> Result<(Inspection, bool), RepositoryError>;

    /// Link a photo; false when the filename was already linked
    async fn link_photo(
        &self,
        inspection_id: Uuid,
        link: NewPhotoLink,
    ) -> Result<bool, RepositoryError>;

    async fn photos_for(&self, inspection_id: Uuid) -> Result<Vec<PhotoLink>, RepositoryError>;

    async fn update_outcome(
        &self,
        inspection_id: Uuid,
        status: InspectionStatus,
        window: PhotoWindow,
    ) -> Result<Inspection, RepositoryError>;

    /// Bump machine counters for a newly created inspection. The daily
    /// counter resets when `at` falls on a new calendar day.
    async fn record_inspection(
        &self,
        machine_id: &str,
        inspection: &Inspection,
        at: DateTime<FixedOffset>,
    ) -> Result<(), RepositoryError>;

    /// Count one more defect for an inspection that turned failed after its
    /// counters were recorded
    async fn record_defect(&self, machine_id: &str) -> Result<(), RepositoryError>;

    async fn machine_stats(&self, machine_id: &str)
        -> Result<Option<MachineStats>, RepositoryError>;
}

const INSPECTION_COLUMNS: &str = "id, product_code, cycle_name, execution_center_id, status, \
     inspection_date, photo_start_at, photo_finish_at, source_event_ids, created_at, completed_at";

/// Inspection repository in PostgreSQL
pub struct PgInspectionRepository {
    pool: PgPool,
}

impl PgInspectionRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl InspectionRepository for PgInspectionRepository {
    async fn find_by_product_code(
        &self,
        product_code: &str,
    ) -> Result<Option<Inspection>, RepositoryError> {
        let row = sqlx::query_as::<_, InspectionRow>(&format!(
            "SELECT {INSPECTION_COLUMNS} FROM inspections WHERE product_code = $1"
        ))
        .bind(product_code)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Inspection::try_from).transpose()
    }

    #[instrument(skip(self, new), fields(product_code = %new.product_code))]
    async fn create_inspection(
        &self,
        new: NewInspection,
    ) -> Result<(Inspection, bool), RepositoryError> {
        let inserted = sqlx::query_as::<_, InspectionRow>(&format!(
            r#"
            INSERT INTO inspections (
                id, product_code, cycle_name, execution_center_id, status,
                inspection_date, photo_start_at, photo_finish_at,
                source_event_ids, created_at, completed_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, NOW(), NOW())
            ON CONFLICT (product_code) DO NOTHING
            RETURNING {INSPECTION_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(&new.product_code)
        .bind(&new.cycle_name)
        .bind(&new.execution_center_id)
        .bind(new.status.as_str())
        .bind(new.inspection_date)
        .bind(new.photo_window.start)
        .bind(new.photo_window.finish)
        .bind(&new.source_event_ids)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = inserted {
            return Ok((Inspection::try_from(row)?, true));
        }

        debug!("Inspection already exists");
        let existing = sqlx::query_as::<_, InspectionRow>(&format!(
            "SELECT {INSPECTION_COLUMNS} FROM inspections WHERE product_code = $1"
        ))
        .bind(&new.product_code)
        .fetch_one(&self.pool)
        .await?;

        Ok((Inspection::try_from(existing)?, false))
    }

    async fn link_photo(
        &self,
        inspection_id: Uuid,
        link: NewPhotoLink,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            r#"
            INSERT INTO inspection_photos (
                id, inspection_id, filename, relative_path,
                control_point_id, captured_at, failed, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, NOW())
            ON CONFLICT (inspection_id, filename) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(inspection_id)
        .bind(&link.filename)
        .bind(&link.relative_path)
        .bind(&link.control_point_id)
        .bind(link.captured_at)
        .bind(link.failed)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn photos_for(&self, inspection_id: Uuid) -> Result<Vec<PhotoLink>, RepositoryError> {
        let links = sqlx::query_as::<_, PhotoLink>(
            r#"
            SELECT id, inspection_id, filename, relative_path,
                   control_point_id, captured_at, failed, created_at
            FROM inspection_photos
            WHERE inspection_id = $1
            ORDER BY filename
            "#,
        )
        .bind(inspection_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(links)
    }

    async fn update_outcome(
        &self,
        inspection_id: Uuid,
        status: InspectionStatus,
        window: PhotoWindow,
    ) -> Result<Inspection, RepositoryError> {
        let row = sqlx::query_as::<_, InspectionRow>(&format!(
            r#"
            UPDATE inspections
            SET status = $2, photo_start_at = $3, photo_finish_at = $4
            WHERE id = $1
            RETURNING {INSPECTION_COLUMNS}
            "#
        ))
        .bind(inspection_id)
        .bind(status.as_str())
        .bind(window.start)
        .bind(window.finish)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(RepositoryError::NotFound(inspection_id))?;

        Inspection::try_from(row)
    }

    async fn record_inspection(
        &self,
        machine_id: &str,
        inspection: &Inspection,
        at: DateTime<FixedOffset>,
    ) -> Result<(), RepositoryError> {
        let defects = i64::from(inspection.status == InspectionStatus::Failed);

        sqlx::query(
            r#"
            INSERT INTO machine_stats (
                machine_id, total_inspections, inspections_today, stats_day,
                total_defects_found, last_inspection_at, current_inspection_id
            ) VALUES ($1, 1, 1, $2, $3, $4, $5)
            ON CONFLICT (machine_id) DO UPDATE SET
                total_inspections = machine_stats.total_inspections + 1,
                inspections_today = CASE
                    WHEN machine_stats.stats_day = EXCLUDED.stats_day
                        THEN machine_stats.inspections_today + 1
                    ELSE 1
                END,
                stats_day = EXCLUDED.stats_day,
                total_defects_found = machine_stats.total_defects_found + EXCLUDED.total_defects_found,
                last_inspection_at = EXCLUDED.last_inspection_at,
                current_inspection_id = EXCLUDED.current_inspection_id
            "#,
        )
        .bind(machine_id)
        .bind(at.date_naive())
        .bind(defects)
        .bind(at.with_timezone(&Utc))
        .bind(inspection.id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn record_defect(&self, machine_id: &str) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"
            UPDATE machine_stats
            SET total_defects_found = total_defects_found + 1
            WHERE machine_id = $1
            "#,
        )
        .bind(machine_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn machine_stats(
        &self,
        machine_id: &str,
    ) -> Result<Option<MachineStats>, RepositoryError> {
        let stats = sqlx::query_as::<_, MachineStats>(
            r#"
            SELECT machine_id, total_inspections, inspections_today, stats_day,
                   total_defects_found, last_inspection_at, current_inspection_id
            FROM machine_stats
            WHERE machine_id = $1
            "#,
        )
        .bind(machine_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(stats)
    }
}

#[derive(Debug, Default)]
struct MemoryRepo {
    inspections: Vec<Inspection>,
    photos: Vec<PhotoLink>,
    stats: HashMap<String, MachineStats>,
}

/// Process-local repository with the same uniqueness rules as Postgres
#[derive(Debug, Default)]
pub struct MemoryInspectionRepository {
    inner: Mutex<MemoryRepo>,
}

impl MemoryInspectionRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn inspections(&self) -> Vec<Inspection> {
        self.inner.lock().await.inspections.clone()
    }
}

#[async_trait]
impl InspectionRepository for MemoryInspectionRepository {
    async fn find_by_product_code(
        &self,
        product_code: &str,
    ) -> Result<Option<Inspection>, RepositoryError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .inspections
            .iter()
            .find(|i| i.product_code == product_code)
            .cloned())
    }

    async fn create_inspection(
        &self,
        new: NewInspection,
    ) -> Result<(Inspection, bool), RepositoryError> {
        let mut inner = self.inner.lock().await;
        if let Some(existing) = inner
            .inspections
            .iter()
            .find(|i| i.product_code == new.product_code)
        {
            return Ok((existing.clone(), false));
        }

        let now = Utc::now();
        let inspection = Inspection {
            id: Uuid::new_v4(),
            product_code: new.product_code,
            cycle_name: new.cycle_name,
            execution_center_id: new.execution_center_id,
            status: new.status,
            inspection_date: new.inspection_date,
            photo_window: new.photo_window,
            source_event_ids: new.source_event_ids,
            created_at: now,
            completed_at: Some(now),
        };
        inner.inspections.push(inspection.clone());
        Ok((inspection, true))
    }

    async fn link_photo(
        &self,
        inspection_id: Uuid,
        link: NewPhotoLink,
    ) -> Result<bool, RepositoryError> {
        let mut inner = self.inner.lock().await;
        if !inner.inspections.iter().any(|i| i.id == inspection_id) {
            return Err(RepositoryError::NotFound(inspection_id));
        }
        if inner
            .photos
            .iter()
            .any(|p| p.inspection_id == inspection_id && p.filename == link.filename)
        {
            return Ok(false);
        }

        inner.photos.push(PhotoLink {
            id: Uuid::new_v4(),
            inspection_id,
            filename: link.filename,
            relative_path: link.relative_path,
            control_point_id: link.control_point_id,
            captured_at: link.captured_at,
            failed: link.failed,
            created_at: Utc::now(),
        });
        Ok(true)
    }

    async fn photos_for(&self, inspection_id: Uuid) -> Result<Vec<PhotoLink>, RepositoryError> {
        let inner = self.inner.lock().await;
        let mut links: Vec<PhotoLink> = inner
            .photos
            .iter()
            .filter(|p| p.inspection_id == inspection_id)
            .cloned()
            .collect();
        links.sort_by(|a, b| a.filename.cmp(&b.filename));
        Ok(links)
    }

    async fn update_outcome(
        &self,
        inspection_id: Uuid,
        status: InspectionStatus,
        window: PhotoWindow,
    ) -> Result<Inspection, RepositoryError> {
        let mut inner = self.inner.lock().await;
        let inspection = inner
            .inspections
            .iter_mut()
            .find(|i| i.id == inspection_id)
            .ok_or(RepositoryError::NotFound(inspection_id))?;
        inspection.status = status;
        inspection.photo_window = window;
        Ok(inspection.clone())
    }

    async fn record_inspection(
        &self,
        machine_id: &str,
        inspection: &Inspection,
        at: DateTime<FixedOffset>,
    ) -> Result<(), RepositoryError> {
        let mut inner = self.inner.lock().await;
        let day = at.date_naive();
        let stats = inner
            .stats
            .entry(machine_id.to_string())
            .or_insert_with(|| MachineStats {
                machine_id: machine_id.to_string(),
                total_inspections: 0,
                inspections_today: 0,
                stats_day: day,
                total_defects_found: 0,
                last_inspection_at: None,
                current_inspection_id: None,
            });

        if stats.stats_day != day {
            stats.stats_day = day;
            stats.inspections_today = 0;
        }
        stats.total_inspections += 1;
        stats.inspections_today += 1;
        if inspection.status == InspectionStatus::Failed {
            stats.total_defects_found += 1;
        }
        stats.last_inspection_at = Some(at.with_timezone(&Utc));
        stats.current_inspection_id = Some(inspection.id);
        Ok(())
    }

    async fn record_defect(&self, machine_id: &str) -> Result<(), RepositoryError> {
        if let Some(stats) = self.inner.lock().await.stats.get_mut(machine_id) {
            stats.total_defects_found += 1;
        }
        Ok(())
    }

    async fn machine_stats(
        &self,
        machine_id: &str,
    ) -> Result<Option<MachineStats>, RepositoryError> {
        Ok(self.inner.lock().await.stats.get(machine_id).cloned())
    }
}
