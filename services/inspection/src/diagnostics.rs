//! Read-only health checks for one `(cycle_name, execution_center_id)` key:
//! why a cycle has or has not become an inspection.

use crate::cycle_detector::{Cycle, CycleKey};
use crate::pipeline::{Pipeline, PipelineError};
use crate::settlement::SettlementDecision;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Check {
    pub name: &'static str,
    pub passed: bool,
    pub detail: String,
}

impl Check {
    fn new(name: &'static str, passed: bool, detail: impl Into<String>) -> Self {
        Self {
            name,
            passed,
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DiagnosticReport {
    pub product_code: String,
    pub checks: Vec<Check>,
}

impl DiagnosticReport {
    pub fn passed(&self) -> bool {
        self.checks.iter().all(|c| c.passed)
    }

    pub fn check(&self, name: &str) -> Option<&Check> {
        self.checks.iter().find(|c| c.name == name)
    }
}

impl fmt::Display for DiagnosticReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Diagnostics for {}", self.product_code)?;
        for check in &self.checks {
            let mark = if check.passed { "ok  " } else { "FAIL" };
            writeln!(f, "  [{mark}] {:<20} {}", check.name, check.detail)?;
        }
        Ok(())
    }
}

/// Run every check for a key as of `now`. Nothing is claimed, moved or
/// written.
pub async fn diagnose(
    pipeline: &Pipeline,
    cycle_name: &str,
    execution_center_id: &str,
    now: DateTime<Utc>,
) -> Result<DiagnosticReport, PipelineError> {
    let key = CycleKey::new(cycle_name, execution_center_id);
    let mut checks = Vec::new();

    let backlog = pipeline.events().count_unprocessed().await?;
    let window = pipeline.scan_window();
    checks.push(Check::new(
        "backlog",
        backlog as usize <= window,
        format!("{backlog} unprocessed events, scan window {window}"),
    ));

    let detection = pipeline.scan(now).await?;
    let mine = |c: &&Cycle| c.key == key;
    let closed: Vec<&Cycle> = detection.closed.iter().filter(mine).collect();
    let open = detection.open.iter().filter(mine).count();
    let abandoned = detection.abandoned.iter().filter(mine).count();

    let inspection = pipeline
        .inspections()
        .find_by_product_code(&key.product_code())
        .await?;

    checks.push(Check::new(
        "detection",
        !closed.is_empty() || inspection.is_some(),
        format!("{} closed, {open} open, {abandoned} abandoned", closed.len()),
    ));

    let latest = closed.last().copied();
    checks.push(match latest.and_then(|c| pipeline.gate().decide(c, now)) {
        Some(SettlementDecision::Settled) => Check::new("settlement", true, "settled"),
        Some(SettlementDecision::Wait { remaining }) => Check::new(
            "settlement",
            false,
            format!("{}s remaining", remaining.num_seconds()),
        ),
        None => Check::new("settlement", inspection.is_some(), "no closed cycle"),
    });

    if let Some(cycle) = latest {
        let survey = pipeline.correlator().survey(cycle).await?;
        checks.push(Check::new(
            "photos",
            !survey.matched.is_empty() || !survey.already_processed.is_empty(),
            format!(
                "{} matched, {} already moved, {} excluded by marker, {} date mismatch",
                survey.matched.len(),
                survey.already_processed.len(),
                survey.excluded.len(),
                survey.date_mismatch.len()
            ),
        ));
    }

    checks.push(match inspection {
        Some(inspection) => {
            let links = pipeline.inspections().photos_for(inspection.id).await?;
            Check::new(
                "inspection",
                true,
                format!(
                    "{} ({}), {} photos linked",
                    inspection.id,
                    inspection.status,
                    links.len()
                ),
            )
        }
        None => Check::new("inspection", false, "not materialized"),
    });

    Ok(DiagnosticReport {
        product_code: key.product_code(),
        checks,
    })
}
