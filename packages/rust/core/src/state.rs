//! The per-run shared state and its write discipline.
//!
//! [`SharedState`] is owned by the orchestrator. Stages never mutate it
//! directly: each run gets a [`StageScope`] that exposes the current state
//! read-only and stages writes to the fields the stage declared. The
//! orchestrator commits those writes only when the stage succeeds.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use trendradar_shared::{Analysis, Discussion, RawItem, Report, Result, RunId, TrendRadarError};

// ---------------------------------------------------------------------------
// Fields
// ---------------------------------------------------------------------------

/// A writable field of [`SharedState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateField {
    RawItems,
    Analysis,
    Discussion,
    Report,
}

impl StateField {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RawItems => "raw_items",
            Self::Analysis => "analysis",
            Self::Discussion => "discussion",
            Self::Report => "report",
        }
    }
}

impl fmt::Display for StateField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failures recorded for one stage: an optional stage-level detail plus
/// per-unit entries (platform, batch, persona, ...).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageErrorEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub units: BTreeMap<String, String>,
}

impl StageErrorEntry {
    pub fn is_empty(&self) -> bool {
        self.detail.is_none() && self.units.is_empty()
    }

    fn absorb(&mut self, other: StageErrorEntry) {
        if other.detail.is_some() {
            self.detail = other.detail;
        }
        self.units.extend(other.units);
    }
}

// ---------------------------------------------------------------------------
// SharedState
// ---------------------------------------------------------------------------

/// Everything one pipeline run produces. Fields are set at most once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedState {
    run_id: RunId,
    started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    raw_items: Option<Vec<RawItem>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    analysis: Option<Analysis>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    discussion: Option<Discussion>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    report: Option<Report>,
    #[serde(default)]
    stage_errors: BTreeMap<String, StageErrorEntry>,
    /// Stages whose writes were committed, in commit order.
    #[serde(default)]
    completed: Vec<String>,
    /// Run this state was resumed from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    resumed_from: Option<RunId>,
}

impl Default for SharedState {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedState {
    pub fn new() -> Self {
        Self {
            run_id: RunId::new(),
            started_at: Utc::now(),
            raw_items: None,
            analysis: None,
            discussion: None,
            report: None,
            stage_errors: BTreeMap::new(),
            completed: Vec::new(),
            resumed_from: None,
        }
    }

    /// Continue this state as a new run: fresh id and start time, with the
    /// committed fields, errors and completed stages carried over.
    pub fn resume(self) -> Self {
        Self {
            run_id: RunId::new(),
            started_at: Utc::now(),
            resumed_from: Some(self.run_id),
            ..self
        }
    }

    pub fn resumed_from(&self) -> Option<&RunId> {
        self.resumed_from.as_ref()
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn raw_items(&self) -> Option<&[RawItem]> {
        self.raw_items.as_deref()
    }

    pub fn analysis(&self) -> Option<&Analysis> {
        self.analysis.as_ref()
    }

    pub fn discussion(&self) -> Option<&Discussion> {
        self.discussion.as_ref()
    }

    pub fn report(&self) -> Option<&Report> {
        self.report.as_ref()
    }

    pub fn stage_errors(&self) -> &BTreeMap<String, StageErrorEntry> {
        &self.stage_errors
    }

    /// Errors recorded for `stage`, if any.
    pub fn errors_for(&self, stage: &str) -> Option<&StageErrorEntry> {
        self.stage_errors.get(stage)
    }

    pub fn completed_stages(&self) -> &[String] {
        &self.completed
    }

    pub fn is_completed(&self, stage: &str) -> bool {
        self.completed.iter().any(|s| s == stage)
    }

    pub fn is_set(&self, field: StateField) -> bool {
        match field {
            StateField::RawItems => self.raw_items.is_some(),
            StateField::Analysis => self.analysis.is_some(),
            StateField::Discussion => self.discussion.is_some(),
            StateField::Report => self.report.is_some(),
        }
    }

    /// Present and holding usable content.
    pub fn is_non_empty(&self, field: StateField) -> bool {
        match field {
            StateField::RawItems => self.raw_items.as_ref().is_some_and(|v| !v.is_empty()),
            StateField::Analysis => self.analysis.as_ref().is_some_and(|a| !a.is_empty()),
            StateField::Discussion => self.discussion.as_ref().is_some_and(|d| !d.is_empty()),
            StateField::Report => self.report.is_some(),
        }
    }

    // -----------------------------------------------------------------------
    // Snapshot
    // -----------------------------------------------------------------------

    pub fn to_snapshot_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| TrendRadarError::parse(format!("failed to serialize state: {e}")))
    }

    pub fn from_snapshot_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| TrendRadarError::parse(format!("invalid state snapshot: {e}")))
    }

    // -----------------------------------------------------------------------
    // Orchestrator-only mutation
    // -----------------------------------------------------------------------

    /// Apply a successful stage's staged writes.
    ///
    /// Every field in `outputs` must have been written. Fails with a state
    /// violation (leaving `self` unchanged) otherwise.
    pub(crate) fn commit(
        &mut self,
        stage: &str,
        outputs: &[StateField],
        writes: StagedWrites,
    ) -> Result<()> {
        for field in outputs {
            if !writes.has(*field) {
                return Err(TrendRadarError::state_violation(
                    stage,
                    format!("finished without writing declared output '{field}'"),
                ));
            }
            if self.is_set(*field) {
                return Err(TrendRadarError::state_violation(
                    stage,
                    format!("field '{field}' is already set"),
                ));
            }
        }

        let StagedWrites {
            raw_items,
            analysis,
            discussion,
            report,
            errors,
        } = writes;
        if raw_items.is_some() {
            self.raw_items = raw_items;
        }
        if analysis.is_some() {
            self.analysis = analysis;
        }
        if discussion.is_some() {
            self.discussion = discussion;
        }
        if report.is_some() {
            self.report = report;
        }
        self.merge_errors(stage, errors);
        self.completed.push(stage.to_string());
        Ok(())
    }

    /// Merge unit errors gathered by a stage, whether or not it succeeded.
    pub(crate) fn merge_errors(&mut self, stage: &str, errors: StageErrorEntry) {
        if errors.is_empty() {
            return;
        }
        self.stage_errors
            .entry(stage.to_string())
            .or_default()
            .absorb(errors);
    }

    /// Record a stage-level failure detail.
    pub(crate) fn record_stage_failure(&mut self, stage: &str, detail: impl Into<String>) {
        self.stage_errors.entry(stage.to_string()).or_default().detail = Some(detail.into());
    }
}

// ---------------------------------------------------------------------------
// Staged writes
// ---------------------------------------------------------------------------

/// Writes collected during one stage execution.
#[derive(Debug, Default)]
pub struct StagedWrites {
    raw_items: Option<Vec<RawItem>>,
    analysis: Option<Analysis>,
    discussion: Option<Discussion>,
    report: Option<Report>,
    errors: StageErrorEntry,
}

impl StagedWrites {
    fn has(&self, field: StateField) -> bool {
        match field {
            StateField::RawItems => self.raw_items.is_some(),
            StateField::Analysis => self.analysis.is_some(),
            StateField::Discussion => self.discussion.is_some(),
            StateField::Report => self.report.is_some(),
        }
    }

    pub(crate) fn into_errors(self) -> StageErrorEntry {
        self.errors
    }
}

/// A stage's window onto the shared state.
///
/// Reads see the state as committed before the stage started. Writes are
/// checked against the stage's declared outputs and the set-once rule.
pub struct StageScope<'a> {
    state: &'a SharedState,
    stage: &'a str,
    outputs: &'a [StateField],
    staged: StagedWrites,
}

impl<'a> StageScope<'a> {
    pub fn new(state: &'a SharedState, stage: &'a str, outputs: &'a [StateField]) -> Self {
        Self {
            state,
            stage,
            outputs,
            staged: StagedWrites::default(),
        }
    }

    /// Read-only view of the committed state.
    pub fn state(&self) -> &'a SharedState {
        self.state
    }

    pub fn stage(&self) -> &str {
        self.stage
    }

    fn claim(&self, field: StateField) -> Result<()> {
        if !self.outputs.contains(&field) {
            return Err(TrendRadarError::state_violation(
                self.stage,
                format!("attempted to write undeclared field '{field}'"),
            ));
        }
        if self.state.is_set(field) {
            return Err(TrendRadarError::state_violation(
                self.stage,
                format!("field '{field}' is already set"),
            ));
        }
        if self.staged.has(field) {
            return Err(TrendRadarError::state_violation(
                self.stage,
                format!("field '{field}' written twice"),
            ));
        }
        Ok(())
    }

    pub fn set_raw_items(&mut self, items: Vec<RawItem>) -> Result<()> {
        self.claim(StateField::RawItems)?;
        self.staged.raw_items = Some(items);
        Ok(())
    }

    pub fn set_analysis(&mut self, analysis: Analysis) -> Result<()> {
        self.claim(StateField::Analysis)?;
        self.staged.analysis = Some(analysis);
        Ok(())
    }

    pub fn set_discussion(&mut self, discussion: Discussion) -> Result<()> {
        self.claim(StateField::Discussion)?;
        self.staged.discussion = Some(discussion);
        Ok(())
    }

    pub fn set_report(&mut self, report: Report) -> Result<()> {
        self.claim(StateField::Report)?;
        self.staged.report = Some(report);
        Ok(())
    }

    /// Record a recoverable failure of one unit of work.
    pub fn record_unit_error(&mut self, unit: impl Into<String>, error: impl fmt::Display) {
        self.staged.errors.units.insert(unit.into(), error.to_string());
    }

    /// Record a stage-level note (e.g., a degraded result).
    pub fn record_detail(&mut self, detail: impl Into<String>) {
        self.staged.errors.detail = Some(detail.into());
    }

    pub fn unit_errors(&self) -> &BTreeMap<String, String> {
        &self.staged.errors.units
    }

    pub(crate) fn into_staged(self) -> StagedWrites {
        self.staged
    }
}
