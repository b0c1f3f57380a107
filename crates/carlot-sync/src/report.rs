use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::fs;

use crate::{CycleReport, CycleStatus};

/// Write `reports/<cycle_id>/cycle.json` and `summary.md`, returning the directory.
pub async fn write_cycle_report(reports_root: &Path, report: &CycleReport) -> Result<PathBuf> {
    let dir = reports_root.join(report.cycle_id.to_string());
    fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))?;

    let json = serde_json::to_vec_pretty(report).context("serializing cycle report")?;
    fs::write(dir.join("cycle.json"), json)
        .await
        .context("writing cycle.json")?;
    fs::write(dir.join("summary.md"), render_summary(report))
        .await
        .context("writing summary.md")?;
    Ok(dir)
}

pub fn render_summary(report: &CycleReport) -> String {
    let status = match report.status {
        CycleStatus::Running => "running",
        CycleStatus::Completed => "completed",
        CycleStatus::Skipped => "skipped (validation gate)",
        CycleStatus::Failed => "failed",
    };
    let mut out = format!(
        "# Catalog Cycle\n\n- Cycle ID: `{}`\n- Backend: {}\n- Started: {}\n- Status: {}\n",
        report.cycle_id, report.backend, report.started_at, status
    );
    if let Some(finished) = report.finished_at {
        let _ = writeln!(out, "- Finished: {finished}");
    }
    if let Some(error) = &report.error {
        let _ = writeln!(out, "- Error: {error}");
    }

    out.push_str("\n## Sources\n");
    for source in &report.sources {
        let mark = if source.passes_gate() { "ok" } else { "REJECTED" };
        let _ = writeln!(out, "- {source} [{mark}]");
    }
    if !report.collisions.is_empty() {
        let _ = writeln!(out, "\n{} url collisions (first occurrence kept)", report.collisions.len());
    }

    if let Some(stats) = &report.reconcile {
        let _ = write!(
            out,
            "\n## Catalog\n- Snapshot: {}\n- New: {}\n- Updated: {}\n- Closed: {}\n",
            stats.snapshot_size, stats.new, stats.updated, stats.closed
        );
        if !stats.retired_urls.is_empty() {
            let _ = writeln!(out, "- Reappeared after archiving: {}", stats.retired_urls.len());
        }
    }
    if let Some(drain) = &report.drain {
        let _ = write!(
            out,
            "\n## Keywords\n- Attempted: {}\n- Enriched: {}\n- Failed: {}\n",
            drain.attempted, drain.enriched, drain.failed
        );
    }
    if let Some(error) = &report.drain_error {
        let _ = writeln!(out, "\nKeyword drain error: {error}");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ReconcileStats, SourceOutcome, SourceReport};
    use carlot_core::Source;
    use chrono::Utc;
    use tempfile::tempdir;
    use uuid::Uuid;

    fn report(status: CycleStatus) -> CycleReport {
        CycleReport {
            cycle_id: Uuid::new_v4(),
            backend: "memory".into(),
            started_at: Utc::now(),
            finished_at: Some(Utc::now()),
            status,
            error: None,
            sources: vec![SourceReport {
                source: Source::BringATrailer,
                min_listings: 500,
                elapsed_ms: 12,
                outcome: SourceOutcome::Fetched { count: 3 },
            }],
            collisions: Vec::new(),
            reconcile: None,
            drain: None,
            drain_error: None,
        }
    }

    #[test]
    fn skipped_summary_marks_rejected_sources() {
        let summary = render_summary(&report(CycleStatus::Skipped));
        assert!(summary.contains("skipped (validation gate)"));
        assert!(summary.contains("bat: 3 listings (min 500) [REJECTED]"));
        assert!(!summary.contains("## Catalog"));
    }

    #[tokio::test]
    async fn writes_json_and_markdown_under_cycle_id() {
        let dir = tempdir().unwrap();
        let mut completed = report(CycleStatus::Completed);
        completed.reconcile = Some(ReconcileStats {
            snapshot_size: 3,
            new: 3,
            ..Default::default()
        });

        let out = write_cycle_report(dir.path(), &completed).await.unwrap();
        assert_eq!(out, dir.path().join(completed.cycle_id.to_string()));

        let json: serde_json::Value =
            serde_json::from_slice(&std::fs::read(out.join("cycle.json")).unwrap()).unwrap();
        assert_eq!(json["status"], "completed");
        assert_eq!(json["sources"][0]["status"], "fetched");
        assert_eq!(json["sources"][0]["count"], 3);
        assert_eq!(json["reconcile"]["new"], 3);
        let md = std::fs::read_to_string(out.join("summary.md")).unwrap();
        assert!(md.contains("- New: 3"));
    }
}
