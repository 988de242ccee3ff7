//! Run output on disk.
//!
//! Each run leaves, in the output directory:
//! ```text
//! <output_dir>/
//! ├── report_<YYYYmmdd_HHMMSS>.<ext>   (when a report was produced)
//! ├── index.<ext>                      (copy of the latest report)
//! └── state_<YYYYmmdd_HHMMSS>.json     (state snapshot, always)
//! ```

use std::path::{Path, PathBuf};

use tracing::{debug, info, instrument};

use trendradar_shared::{Result, TrendRadarError};

use crate::state::SharedState;

/// Paths written for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunArtifacts {
    pub report: Option<PathBuf>,
    pub index: Option<PathBuf>,
    pub snapshot: PathBuf,
}

/// Write the report (if any) and the state snapshot for `state`.
///
/// File names use the run's start time so a report and its snapshot pair
/// up. Every file is written to a hidden temp file and renamed into place.
#[instrument(skip_all, fields(dir = %output_dir.display()))]
pub fn write_run_artifacts(output_dir: &Path, state: &SharedState) -> Result<RunArtifacts> {
    std::fs::create_dir_all(output_dir).map_err(|e| TrendRadarError::io(output_dir, e))?;
    let stamp = state.started_at().format("%Y%m%d_%H%M%S").to_string();

    let (report, index) = match state.report() {
        Some(report) => {
            let bytes = report.markup.as_bytes();
            let report_path = output_dir.join(format!("report_{stamp}.{}", report.extension));
            let index_path = output_dir.join(format!("index.{}", report.extension));
            write_atomic(&report_path, bytes)?;
            write_atomic(&index_path, bytes)?;
            info!(path = %report_path.display(), degraded = report.degraded, "report written");
            (Some(report_path), Some(index_path))
        }
        None => (None, None),
    };

    let snapshot = output_dir.join(format!("state_{stamp}.json"));
    write_atomic(&snapshot, state.to_snapshot_json()?.as_bytes())?;
    debug!(path = %snapshot.display(), "state snapshot written");

    Ok(RunArtifacts {
        report,
        index,
        snapshot,
    })
}

/// Read a state snapshot written by [`write_run_artifacts`].
pub fn load_snapshot(path: &Path) -> Result<SharedState> {
    let json = std::fs::read_to_string(path).map_err(|e| TrendRadarError::io(path, e))?;
    SharedState::from_snapshot_json(&json)
}

fn write_atomic(target: &Path, bytes: &[u8]) -> Result<()> {
    let file_name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| TrendRadarError::validation(format!("not a file path: {}", target.display())))?;
    let temp = target.with_file_name(format!(".{file_name}.tmp"));
    std::fs::write(&temp, bytes).map_err(|e| TrendRadarError::io(&temp, e))?;
    std::fs::rename(&temp, target).map_err(|e| TrendRadarError::io(target, e))?;
    Ok(())
}
