//! Matches settled cycles to staged photographs and moves them into the
//! per-cycle processed folder.
//!
//! Staged filenames follow
//! `{cycle}-{ec}-{control_point}-{DDMMYY}_{HHMMSS}-{tag}{seq}.{ext}`; only the
//! first three components are mandatory. Moves are idempotent: a photo whose
//! destination exists and whose source is gone counts as already moved, and
//! photos left in `PROCESSED/{cycle}-{ec}/` by an interrupted pass are picked
//! up again from there.

use crate::config::PhotoConfig;
use crate::cycle_detector::{Cycle, CycleKey};
use crate::fields::{parse_capture_time, parse_ddmmyy};
use chrono::{FixedOffset, NaiveDate, NaiveDateTime};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info, instrument, warn};

#[derive(Error, Debug)]
pub enum PhotoError {
    #[error("failed to read photo directory {path:?}: {source}")]
    ReadDir { path: PathBuf, source: io::Error },

    #[error("failed to move {from:?} to {to:?}: {source}")]
    Move {
        from: PathBuf,
        to: PathBuf,
        source: io::Error,
    },

    #[error("photo {0:?} disappeared from staging before it could be moved")]
    Vanished(PathBuf),
}

/// A photo file whose name follows the staging convention
#[derive(Debug, Clone, PartialEq)]
pub struct StagedPhoto {
    pub path: PathBuf,
    pub filename: String,
    pub cycle_name: String,
    pub execution_center_id: String,
    pub control_point_id: String,
    pub capture_date: Option<NaiveDate>,
    pub captured_at: Option<NaiveDateTime>,
    /// Result tag with the trailing sequence digits stripped, e.g. `NOK`
    pub result_tag: Option<String>,
}

impl StagedPhoto {
    /// Parse a photo path. Returns `None` when the stem has fewer than three
    /// dash-separated components.
    pub fn parse(path: &Path) -> Option<Self> {
        let filename = path.file_name()?.to_str()?.to_string();
        let stem = path.file_stem()?.to_str()?;
        let parts: Vec<&str> = stem.split('-').collect();
        if parts.len() < 3 || parts[..3].iter().any(|p| p.is_empty()) {
            return None;
        }

        let (capture_date, captured_at) = match parts.get(3).copied() {
            Some(stamp) => {
                let (date, time) = stamp.split_once('_').unwrap_or((stamp, ""));
                (parse_ddmmyy(date), parse_capture_time(date, time))
            }
            None => (None, None),
        };

        let result_tag = parts
            .get(4)
            .map(|tag| tag.trim_end_matches(|c: char| c.is_ascii_digit()).to_string())
            .filter(|tag| !tag.is_empty());

        Some(Self {
            path: path.to_path_buf(),
            filename,
            cycle_name: parts[0].to_string(),
            execution_center_id: parts[1].to_string(),
            control_point_id: parts[2].to_string(),
            capture_date,
            captured_at,
            result_tag,
        })
    }

    pub fn key(&self) -> CycleKey {
        CycleKey::new(self.cycle_name.clone(), self.execution_center_id.clone())
    }

    /// A tag other than the pass marker is a failure; a missing tag is not.
    pub fn is_failure(&self, pass_marker: &str) -> bool {
        self.result_tag
            .as_deref()
            .map(|tag| !tag.eq_ignore_ascii_case(pass_marker))
            .unwrap_or(false)
    }
}

/// How a candidate photo relates to one cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhotoVerdict {
    Matched,
    /// Control point or result tag carries the test/calibration marker
    Excluded,
    /// Filename date differs from the cycle start date
    DateMismatch,
    /// Prefix matched but the parsed key did not
    OtherCycle,
}

/// Where a correlated photo was found
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhotoSource {
    Staging,
    /// Already under the processed folder from an earlier attempt
    Processed,
}

/// A photo assigned to a cycle. After [`PhotoCorrelator::correlate`] the
/// `path` points at the processed location.
#[derive(Debug, Clone, PartialEq)]
pub struct CorrelatedPhoto {
    pub path: PathBuf,
    pub filename: String,
    /// Relative to the processed root: `{cycle}-{ec}/{filename}`
    pub relative_path: String,
    pub control_point_id: String,
    pub captured_at: Option<NaiveDateTime>,
    pub failed: bool,
    pub source: PhotoSource,
}

/// Read-only view of what correlation would do for a cycle
#[derive(Debug, Default)]
pub struct PhotoSurvey {
    pub matched: Vec<StagedPhoto>,
    pub excluded: Vec<StagedPhoto>,
    pub date_mismatch: Vec<StagedPhoto>,
    pub already_processed: Vec<StagedPhoto>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MoveOutcome {
    Moved,
    AlreadyMoved,
}

#[derive(Debug, Clone)]
pub struct PhotoCorrelator {
    config: PhotoConfig,
    offset: FixedOffset,
    exclusion_marker: String,
}

impl PhotoCorrelator {
    pub fn new(config: PhotoConfig, offset: FixedOffset) -> Self {
        let exclusion_marker = config.exclusion_marker.to_lowercase();
        Self {
            config,
            offset,
            exclusion_marker,
        }
    }

    pub fn staging_dir(&self) -> &Path {
        &self.config.staging_dir
    }

    pub fn processed_dir_for(&self, key: &CycleKey) -> PathBuf {
        self.config.processed_dir.join(folder_name(key))
    }

    fn has_photo_extension(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| {
                self.config
                    .extensions
                    .iter()
                    .any(|allowed| allowed.eq_ignore_ascii_case(ext))
            })
            .unwrap_or(false)
    }

    /// The marker may sit in the control point (`CNA2-E3742-tes-...`) or in
    /// the result tag (`...-tes001.bmp`).
    fn is_excluded(&self, photo: &StagedPhoto) -> bool {
        if self.exclusion_marker.is_empty() {
            return false;
        }
        std::iter::once(photo.control_point_id.as_str())
            .chain(photo.result_tag.as_deref())
            .any(|part| part.to_lowercase().contains(&self.exclusion_marker))
    }

    /// Classify one parsed photo against a cycle.
    pub fn judge(&self, photo: &StagedPhoto, cycle: &Cycle) -> PhotoVerdict {
        if photo.key() != cycle.key {
            return PhotoVerdict::OtherCycle;
        }
        if self.is_excluded(photo) {
            return PhotoVerdict::Excluded;
        }
        match photo.capture_date {
            Some(date) if date != cycle.start_date(self.offset) => PhotoVerdict::DateMismatch,
            _ => PhotoVerdict::Matched,
        }
    }

    /// Photo files in `dir` whose name starts with `prefix`, sorted by name.
    /// A missing directory yields nothing.
    async fn list(&self, dir: &Path, prefix: &str) -> Result<Vec<StagedPhoto>, PhotoError> {
        let mut entries = match fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(PhotoError::ReadDir {
                    path: dir.to_path_buf(),
                    source,
                })
            }
        };

        let mut photos = Vec::new();
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(source) => {
                    return Err(PhotoError::ReadDir {
                        path: dir.to_path_buf(),
                        source,
                    })
                }
            };
            let path = entry.path();
            let name_matches = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with(prefix))
                .unwrap_or(false);
            if !name_matches || !self.has_photo_extension(&path) {
                continue;
            }
            match StagedPhoto::parse(&path) {
                Some(photo) => photos.push(photo),
                None => debug!(path = %path.display(), "Skipping photo with unparseable name"),
            }
        }

        photos.sort_by(|a, b| a.filename.cmp(&b.filename));
        Ok(photos)
    }

    /// Every parseable, non-excluded photo currently in staging
    pub async fn staged_photos(&self) -> Result<Vec<StagedPhoto>, PhotoError> {
        let photos = self.list(&self.config.staging_dir, "").await?;
        Ok(photos.into_iter().filter(|p| !self.is_excluded(p)).collect())
    }

    /// Classify staged and already-processed photos for a cycle without
    /// touching the filesystem.
    pub async fn survey(&self, cycle: &Cycle) -> Result<PhotoSurvey, PhotoError> {
        let prefix = format!("{}-", cycle.key);
        let mut survey = PhotoSurvey::default();

        for photo in self.list(&self.config.staging_dir, &prefix).await? {
            match self.judge(&photo, cycle) {
                PhotoVerdict::Matched => survey.matched.push(photo),
                PhotoVerdict::Excluded => survey.excluded.push(photo),
                PhotoVerdict::DateMismatch => survey.date_mismatch.push(photo),
                PhotoVerdict::OtherCycle => {}
            }
        }

        let processed = self.processed_dir_for(&cycle.key);
        for photo in self.list(&processed, &prefix).await? {
            if self.judge(&photo, cycle) == PhotoVerdict::Matched {
                survey.already_processed.push(photo);
            }
        }

        Ok(survey)
    }

    /// Match a settled cycle to its photos and move them into
    /// `PROCESSED/{cycle}-{ec}/`. Safe to re-run after a partial pass.
    #[instrument(skip(self, cycle), fields(cycle = %cycle.key))]
    pub async fn correlate(&self, cycle: &Cycle) -> Result<Vec<CorrelatedPhoto>, PhotoError> {
        let survey = self.survey(cycle).await?;
        if !survey.excluded.is_empty() || !survey.date_mismatch.is_empty() {
            debug!(
                excluded = survey.excluded.len(),
                date_mismatch = survey.date_mismatch.len(),
                "Ignoring non-matching staged photos"
            );
        }

        let mut correlated: Vec<CorrelatedPhoto> = Vec::new();

        for photo in &survey.already_processed {
            correlated.push(self.describe(photo, photo.path.clone(), PhotoSource::Processed));
        }

        for photo in &survey.matched {
            if correlated.iter().any(|c| c.filename == photo.filename) {
                // the copy already landed; finish removing the staged source
                self.relocate(photo).await?;
                continue;
            }
            correlated.push(self.relocate(photo).await?);
        }

        correlated.sort_by(|a, b| a.filename.cmp(&b.filename));
        info!(photos = correlated.len(), "Correlated cycle photos");
        Ok(correlated)
    }

    /// Move one staged photo (and its sidecar) into the processed folder of
    /// its own key.
    pub async fn relocate(&self, photo: &StagedPhoto) -> Result<CorrelatedPhoto, PhotoError> {
        let dest_dir = self.processed_dir_for(&photo.key());
        let dest = dest_dir.join(&photo.filename);

        match move_file(&photo.path, &dest).await? {
            MoveOutcome::Moved => debug!(photo = %photo.filename, "Moved photo to processed"),
            MoveOutcome::AlreadyMoved => {
                debug!(photo = %photo.filename, "Photo already in processed")
            }
        }

        if self.config.move_sidecars {
            let sidecar = photo.path.with_extension("svg");
            if fs::try_exists(&sidecar).await.unwrap_or(false) {
                let target = dest.with_extension("svg");
                if let Err(e) = move_file(&sidecar, &target).await {
                    warn!(error = %e, sidecar = %sidecar.display(), "Failed to move sidecar");
                }
            }
        }

        Ok(self.describe(photo, dest, PhotoSource::Staging))
    }

    fn describe(&self, photo: &StagedPhoto, path: PathBuf, source: PhotoSource) -> CorrelatedPhoto {
        CorrelatedPhoto {
            path,
            filename: photo.filename.clone(),
            relative_path: format!("{}/{}", folder_name(&photo.key()), photo.filename),
            control_point_id: photo.control_point_id.clone(),
            captured_at: photo.captured_at,
            failed: photo.is_failure(&self.config.pass_marker),
            source,
        }
    }
}

/// Folder name under the processed root, with path separators flattened
fn folder_name(key: &CycleKey) -> String {
    key.to_string().replace(['/', '\\', ':'], "-")
}

/// Rename when possible, otherwise copy to a temporary name beside the
/// destination, rename that into place and remove the source.
async fn move_file(from: &Path, to: &Path) -> Result<MoveOutcome, PhotoError> {
    let move_err = |source: io::Error| PhotoError::Move {
        from: from.to_path_buf(),
        to: to.to_path_buf(),
        source,
    };

    let source_exists = fs::try_exists(from).await.map_err(move_err)?;
    let dest_exists = fs::try_exists(to).await.map_err(move_err)?;

    match (source_exists, dest_exists) {
        (false, true) => return Ok(MoveOutcome::AlreadyMoved),
        (false, false) => return Err(PhotoError::Vanished(from.to_path_buf())),
        (true, true) => {
            // destination is only ever written by an atomic rename
            fs::remove_file(from).await.map_err(move_err)?;
            return Ok(MoveOutcome::AlreadyMoved);
        }
        (true, false) => {}
    }

    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent).await.map_err(move_err)?;
    }

    match fs::rename(from, to).await {
        Ok(()) => Ok(MoveOutcome::Moved),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            if fs::try_exists(to).await.unwrap_or(false) {
                Ok(MoveOutcome::AlreadyMoved)
            } else {
                Err(PhotoError::Vanished(from.to_path_buf()))
            }
        }
        Err(e) => {
            debug!(error = %e, "Rename failed, falling back to copy");
            let partial = to.with_extension("partial");
            fs::copy(from, &partial).await.map_err(move_err)?;
            fs::rename(&partial, to).await.map_err(move_err)?;
            fs::remove_file(from).await.map_err(move_err)?;
            Ok(MoveOutcome::Moved)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cycle_detector::CycleDetector;
    use crate::event_store::RawEvent;
    use chrono::{DateTime, NaiveDate, Utc};
    use serde_json::json;
    use tempfile::TempDir;

    fn utc() -> FixedOffset {
        FixedOffset::east_opt(0).unwrap()
    }

    /// Cycle CNA2-E3742 running on 2025-12-20
    fn cycle() -> Cycle {
        let start = NaiveDate::from_ymd_opt(2025, 12, 20)
            .unwrap()
            .and_hms_opt(10, 0, 0)
            .unwrap()
            .and_utc();
        cycle_at(start, utc())
    }

    fn cycle_at(start: DateTime<Utc>, offset: FixedOffset) -> Cycle {
        let events = [(1, true, 0), (2, false, 60)]
            .into_iter()
            .map(|(id, active, secs)| {
                let ts = start + chrono::Duration::seconds(secs);
                RawEvent {
                    id,
                    delivered_at: ts,
                    payload: json!({
                        "NombreCiclo": "CNA2",
                        "ID_EC": "E3742",
                        "CicloActivo": active,
                        "datetime": ts.to_rfc3339(),
                    })
                    .to_string(),
                    processed: false,
                }
            })
            .collect();
        CycleDetector::new(100, offset).detect(events).closed.remove(0)
    }

    struct Dirs {
        _root: TempDir,
        config: PhotoConfig,
    }

    fn dirs() -> Dirs {
        let root = TempDir::new().unwrap();
        let config = PhotoConfig {
            staging_dir: root.path().join("STAGING"),
            processed_dir: root.path().join("PROCESSED"),
            ..PhotoConfig::default()
        };
        std::fs::create_dir_all(&config.staging_dir).unwrap();
        Dirs {
            _root: root,
            config,
        }
    }

    fn stage(config: &PhotoConfig, name: &str) {
        std::fs::write(config.staging_dir.join(name), b"img").unwrap();
    }

    #[test]
    fn test_parse_full_filename() {
        let photo =
            StagedPhoto::parse(Path::new("/s/CNA2-E3742-1F-201225_100012-NOK753.bmp")).unwrap();
        assert_eq!(photo.cycle_name, "CNA2");
        assert_eq!(photo.execution_center_id, "E3742");
        assert_eq!(photo.control_point_id, "1F");
        assert_eq!(photo.capture_date, NaiveDate::from_ymd_opt(2025, 12, 20));
        assert_eq!(
            photo.captured_at,
            NaiveDate::from_ymd_opt(2025, 12, 20)
                .unwrap()
                .and_hms_opt(10, 0, 12)
        );
        assert_eq!(photo.result_tag.as_deref(), Some("NOK"));
        assert!(photo.is_failure("OK"));
    }

    #[test]
    fn test_parse_degraded_filenames() {
        let bare = StagedPhoto::parse(Path::new("CNA2-E3742-1F.png")).unwrap();
        assert_eq!(bare.capture_date, None);
        assert_eq!(bare.result_tag, None);
        assert!(!bare.is_failure("OK"));

        let ok = StagedPhoto::parse(Path::new("CNA2-E3742-1F-201225_100012-ok12.jpg")).unwrap();
        assert!(!ok.is_failure("OK"));

        assert!(StagedPhoto::parse(Path::new("CNA2-E3742.bmp")).is_none());
    }

    #[tokio::test]
    async fn test_correlate_filters_and_moves() {
        let d = dirs();
        stage(&d.config, "CNA2-E3742-1F-201225_100010-OK1.bmp");
        stage(&d.config, "CNA2-E3742-2F-201225_100020-NOK2.bmp");
        stage(&d.config, "CNA2-E3742-tes-201225_100030-OK3.bmp");
        stage(&d.config, "CNA2-E3742-3F-191225_100040-OK4.bmp");
        stage(&d.config, "CNA2-E3742-4F.jpg");
        stage(&d.config, "CNA2-E37420-1F-201225_100010-OK5.bmp");
        stage(&d.config, "CNA2-E3742-1F-201225_100010-OK6.txt");

        let correlator = PhotoCorrelator::new(d.config.clone(), utc());
        let photos = correlator.correlate(&cycle()).await.unwrap();

        let names: Vec<_> = photos.iter().map(|p| p.filename.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "CNA2-E3742-1F-201225_100010-OK1.bmp",
                "CNA2-E3742-2F-201225_100020-NOK2.bmp",
                "CNA2-E3742-4F.jpg",
            ]
        );
        assert!(!photos[0].failed);
        assert!(photos[1].failed);

        let processed = d.config.processed_dir.join("CNA2-E3742");
        for photo in &photos {
            assert!(processed.join(&photo.filename).exists());
            assert!(!d.config.staging_dir.join(&photo.filename).exists());
            assert_eq!(photo.relative_path, format!("CNA2-E3742/{}", photo.filename));
        }

        // excluded, mismatched and foreign files stay in staging
        assert!(d.config.staging_dir.join("CNA2-E3742-tes-201225_100030-OK3.bmp").exists());
        assert!(d.config.staging_dir.join("CNA2-E3742-3F-191225_100040-OK4.bmp").exists());
        assert!(d.config.staging_dir.join("CNA2-E37420-1F-201225_100010-OK5.bmp").exists());
    }

    #[tokio::test]
    async fn test_marker_in_result_tag_is_excluded() {
        let d = dirs();
        stage(&d.config, "CNA2-E3742-1F-231225_134953-NOK753.bmp");
        stage(&d.config, "CNA2-E3742-1F-231225_134953-tes001.bmp");
        let start = NaiveDate::from_ymd_opt(2025, 12, 23)
            .unwrap()
            .and_hms_opt(13, 45, 0)
            .unwrap()
            .and_utc();

        let correlator = PhotoCorrelator::new(d.config.clone(), utc());
        let photos = correlator.correlate(&cycle_at(start, utc())).await.unwrap();

        let names: Vec<_> = photos.iter().map(|p| p.filename.as_str()).collect();
        assert_eq!(names, vec!["CNA2-E3742-1F-231225_134953-NOK753.bmp"]);
        assert!(photos[0].failed);
        assert!(d
            .config
            .staging_dir
            .join("CNA2-E3742-1F-231225_134953-tes001.bmp")
            .exists());
    }

    #[tokio::test]
    async fn test_rerun_finds_already_moved_photos() {
        let d = dirs();
        stage(&d.config, "CNA2-E3742-1F-201225_100010-OK1.bmp");
        let correlator = PhotoCorrelator::new(d.config.clone(), utc());

        let first = correlator.correlate(&cycle()).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].source, PhotoSource::Staging);

        let second = correlator.correlate(&cycle()).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].source, PhotoSource::Processed);
        assert_eq!(second[0].path, first[0].path);
    }

    #[tokio::test]
    async fn test_interrupted_copy_is_completed() {
        let d = dirs();
        let name = "CNA2-E3742-1F-201225_100010-OK1.bmp";
        stage(&d.config, name);
        let processed = d.config.processed_dir.join("CNA2-E3742");
        std::fs::create_dir_all(&processed).unwrap();
        std::fs::write(processed.join(name), b"img").unwrap();

        let correlator = PhotoCorrelator::new(d.config.clone(), utc());
        let photos = correlator.correlate(&cycle()).await.unwrap();

        assert_eq!(photos.len(), 1);
        assert!(!d.config.staging_dir.join(name).exists());
        assert!(processed.join(name).exists());
    }

    #[tokio::test]
    async fn test_sidecar_travels_with_photo() {
        let d = dirs();
        stage(&d.config, "CNA2-E3742-1F-201225_100010-OK1.bmp");
        stage(&d.config, "CNA2-E3742-1F-201225_100010-OK1.svg");

        let correlator = PhotoCorrelator::new(d.config.clone(), utc());
        correlator.correlate(&cycle()).await.unwrap();

        let processed = d.config.processed_dir.join("CNA2-E3742");
        assert!(processed.join("CNA2-E3742-1F-201225_100010-OK1.svg").exists());
        assert!(!d
            .config
            .staging_dir
            .join("CNA2-E3742-1F-201225_100010-OK1.svg")
            .exists());
    }

    #[tokio::test]
    async fn test_missing_staging_dir_yields_no_photos() {
        let root = TempDir::new().unwrap();
        let config = PhotoConfig {
            staging_dir: root.path().join("absent"),
            processed_dir: root.path().join("PROCESSED"),
            ..PhotoConfig::default()
        };
        let correlator = PhotoCorrelator::new(config, utc());
        assert!(correlator.correlate(&cycle()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_survey_does_not_move() {
        let d = dirs();
        stage(&d.config, "CNA2-E3742-1F-201225_100010-OK1.bmp");
        stage(&d.config, "CNA2-E3742-TEST-201225_100010-OK2.bmp");

        let correlator = PhotoCorrelator::new(d.config.clone(), utc());
        let survey = correlator.survey(&cycle()).await.unwrap();
        assert_eq!(survey.matched.len(), 1);
        assert_eq!(survey.excluded.len(), 1);
        assert!(d
            .config
            .staging_dir
            .join("CNA2-E3742-1F-201225_100010-OK1.bmp")
            .exists());
    }

    #[tokio::test]
    async fn test_capture_date_compared_at_plant_offset() {
        let d = dirs();
        stage(&d.config, "CNA2-E3742-1F-201225_220010-OK1.bmp");

        // 01:00 UTC on the 21st is still the 20th at UTC-3
        let start = DateTime::from_timestamp(1_766_278_800, 0).unwrap();
        let plant = FixedOffset::west_opt(3 * 3600).unwrap();

        let local = PhotoCorrelator::new(d.config.clone(), plant);
        let survey = local.survey(&cycle_at(start, plant)).await.unwrap();
        assert_eq!(survey.matched.len(), 1);

        let utc_based = PhotoCorrelator::new(d.config.clone(), utc());
        let survey = utc_based.survey(&cycle_at(start, utc())).await.unwrap();
        assert_eq!(survey.date_mismatch.len(), 1);
    }
}
