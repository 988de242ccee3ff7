//! Graph walk over stages.
//!
//! Stages are nodes and edges say which stage may follow which. After a
//! stage commits, an [`EdgeSelector`] decides which successors activate.
//! Activated stages at the same depth run concurrently against the same
//! read-only state; their writes are committed one by one in declaration
//! order. A fatal failure stops the walk and the partial state is returned.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use trendradar_shared::{Result, TrendRadarError};

use crate::pipeline::ProgressReporter;
use crate::stage::{Requirement, RunContext, Stage, StageFailure};
use crate::state::{StageScope, StagedWrites, SharedState, StateField};

// ---------------------------------------------------------------------------
// Edges
// ---------------------------------------------------------------------------

/// Predicate evaluated against the committed state after `from` finishes.
pub type EdgeGuard = Arc<dyn Fn(&SharedState) -> bool + Send + Sync>;

/// A directed edge between two stages, optionally guarded.
#[derive(Clone)]
pub struct Edge {
    pub from: String,
    pub to: String,
    guard: Option<EdgeGuard>,
}

impl Edge {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            guard: None,
        }
    }

    pub fn when(mut self, guard: impl Fn(&SharedState) -> bool + Send + Sync + 'static) -> Self {
        self.guard = Some(Arc::new(guard));
        self
    }

    /// Whether this edge lets its target activate given `state`.
    pub fn allows(&self, state: &SharedState) -> bool {
        self.guard.as_ref().is_none_or(|g| g(state))
    }
}

impl fmt::Debug for Edge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Edge")
            .field("from", &self.from)
            .field("to", &self.to)
            .field("guarded", &self.guard.is_some())
            .finish()
    }
}

/// Chooses which successors of a finished stage activate.
pub trait EdgeSelector: Send + Sync {
    fn select(&self, from: &str, outgoing: &[&Edge], state: &SharedState) -> Vec<String>;
}

/// Activates every outgoing edge whose guard passes.
#[derive(Debug, Clone, Copy, Default)]
pub struct GuardedEdges;

impl EdgeSelector for GuardedEdges {
    fn select(&self, _from: &str, outgoing: &[&Edge], state: &SharedState) -> Vec<String> {
        outgoing
            .iter()
            .filter(|e| e.allows(state))
            .map(|e| e.to.clone())
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// How a run ended.
#[derive(Debug)]
pub enum RunStatus {
    /// Every activated stage succeeded without recorded errors.
    Completed,
    /// Every activated stage succeeded but some units failed or degraded.
    Degraded,
    /// A stage failed fatally; later stages did not run.
    Aborted { stage: String, error: TrendRadarError },
    /// The operator cancelled the run.
    Cancelled { stage: Option<String> },
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Degraded => "degraded",
            Self::Aborted { .. } => "aborted",
            Self::Cancelled { .. } => "cancelled",
        }
    }

    /// Completed, possibly degraded.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed | Self::Degraded)
    }
}

/// Final state of a run plus how it ended.
#[derive(Debug)]
pub struct RunOutcome {
    pub state: SharedState,
    pub status: RunStatus,
    pub elapsed: Duration,
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Assembles and validates a stage graph.
pub struct OrchestratorBuilder {
    stages: Vec<Box<dyn Stage>>,
    edges: Vec<Edge>,
    selector: Box<dyn EdgeSelector>,
    stage_retries: u32,
}

impl Default for OrchestratorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl OrchestratorBuilder {
    pub fn new() -> Self {
        Self {
            stages: Vec::new(),
            edges: Vec::new(),
            selector: Box::new(GuardedEdges),
            stage_retries: 0,
        }
    }

    /// Add a stage. Declaration order decides commit order within a level.
    pub fn stage(mut self, stage: impl Stage + 'static) -> Self {
        self.stages.push(Box::new(stage));
        self
    }

    pub fn edge(mut self, from: &str, to: &str) -> Self {
        self.edges.push(Edge::new(from, to));
        self
    }

    pub fn guarded_edge(
        mut self,
        from: &str,
        to: &str,
        guard: impl Fn(&SharedState) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.edges.push(Edge::new(from, to).when(guard));
        self
    }

    /// Connect `names` one after another.
    pub fn chain(mut self, names: &[&str]) -> Self {
        for pair in names.windows(2) {
            self.edges.push(Edge::new(pair[0], pair[1]));
        }
        self
    }

    pub fn selector(mut self, selector: impl EdgeSelector + 'static) -> Self {
        self.selector = Box::new(selector);
        self
    }

    /// Extra whole-stage attempts after a recoverable stage failure.
    pub fn stage_retries(mut self, retries: u32) -> Self {
        self.stage_retries = retries;
        self
    }

    pub fn build(self) -> Result<Orchestrator> {
        if self.stages.is_empty() {
            return Err(TrendRadarError::config("pipeline has no stages"));
        }

        let mut index: HashMap<String, usize> = HashMap::new();
        for (i, stage) in self.stages.iter().enumerate() {
            let name = stage.name();
            if name.trim().is_empty() {
                return Err(TrendRadarError::config("stage name must not be empty"));
            }
            if index.insert(name.to_string(), i).is_some() {
                return Err(TrendRadarError::config(format!(
                    "stage '{name}' is registered twice"
                )));
            }
        }

        let n = self.stages.len();
        let mut succs: Vec<Vec<usize>> = vec![Vec::new(); n];
        let mut preds: Vec<Vec<usize>> = vec![Vec::new(); n];
        let mut outgoing: Vec<Vec<usize>> = vec![Vec::new(); n];
        for (e, edge) in self.edges.iter().enumerate() {
            let from = *index.get(&edge.from).ok_or_else(|| {
                TrendRadarError::config(format!("edge refers to unknown stage '{}'", edge.from))
            })?;
            let to = *index.get(&edge.to).ok_or_else(|| {
                TrendRadarError::config(format!("edge refers to unknown stage '{}'", edge.to))
            })?;
            if from == to {
                return Err(TrendRadarError::config(format!(
                    "stage '{}' has an edge to itself",
                    edge.from
                )));
            }
            outgoing[from].push(e);
            if !succs[from].contains(&to) {
                succs[from].push(to);
                preds[to].push(from);
            }
        }

        // Kahn's algorithm: topological order plus longest-path depth.
        let mut in_degree: Vec<usize> = preds.iter().map(Vec::len).collect();
        let mut queue: VecDeque<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
        let mut depth = vec![0usize; n];
        let mut visited = 0;
        while let Some(i) = queue.pop_front() {
            visited += 1;
            for &s in &succs[i] {
                depth[s] = depth[s].max(depth[i] + 1);
                in_degree[s] -= 1;
                if in_degree[s] == 0 {
                    queue.push_back(s);
                }
            }
        }
        if visited != n {
            let stuck: Vec<&str> = (0..n)
                .filter(|&i| in_degree[i] > 0)
                .map(|i| self.stages[i].name())
                .collect();
            return Err(TrendRadarError::config(format!(
                "stage graph has a cycle through: {}",
                stuck.join(", ")
            )));
        }

        let mut producers: HashMap<StateField, usize> = HashMap::new();
        for (i, stage) in self.stages.iter().enumerate() {
            for field in stage.outputs() {
                if let Some(&other) = producers.get(field) {
                    return Err(TrendRadarError::state_violation(
                        stage.name(),
                        format!(
                            "output '{field}' is already declared by stage '{}'",
                            self.stages[other].name()
                        ),
                    ));
                }
                producers.insert(*field, i);
            }
        }

        for (i, stage) in self.stages.iter().enumerate() {
            let ancestors = ancestors_of(i, &preds);
            for dep in stage.dependencies() {
                let Some(&producer) = producers.get(&dep.field) else {
                    return Err(TrendRadarError::config(format!(
                        "stage '{}' depends on '{}', which no stage produces",
                        stage.name(),
                        dep.field
                    )));
                };
                if !ancestors.contains(&producer) {
                    return Err(TrendRadarError::config(format!(
                        "stage '{}' depends on '{}' but its producer '{}' is not upstream",
                        stage.name(),
                        dep.field,
                        self.stages[producer].name()
                    )));
                }
            }
        }

        let max_depth = depth.iter().copied().max().unwrap_or(0);
        let mut levels: Vec<Vec<usize>> = vec![Vec::new(); max_depth + 1];
        for (i, d) in depth.iter().enumerate() {
            levels[*d].push(i);
        }

        Ok(Orchestrator {
            stages: self.stages,
            edges: self.edges,
            outgoing,
            preds,
            index,
            levels,
            selector: self.selector,
            stage_retries: self.stage_retries,
        })
    }
}

fn ancestors_of(node: usize, preds: &[Vec<usize>]) -> HashSet<usize> {
    let mut seen = HashSet::new();
    let mut stack: Vec<usize> = preds[node].clone();
    while let Some(p) = stack.pop() {
        if seen.insert(p) {
            stack.extend(preds[p].iter().copied());
        }
    }
    seen
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// A validated stage graph, ready to run.
pub struct Orchestrator {
    stages: Vec<Box<dyn Stage>>,
    edges: Vec<Edge>,
    outgoing: Vec<Vec<usize>>,
    preds: Vec<Vec<usize>>,
    index: HashMap<String, usize>,
    /// Stage indices grouped by depth, each in declaration order.
    levels: Vec<Vec<usize>>,
    selector: Box<dyn EdgeSelector>,
    stage_retries: u32,
}

impl Orchestrator {
    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder::new()
    }

    /// Stage names in declaration order.
    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Walk the graph starting from its entry stages.
    ///
    /// Stages already marked completed in `state` (a resumed snapshot) are
    /// skipped but still activate their successors.
    #[instrument(skip_all, fields(run_id = %state.run_id()))]
    pub async fn run(
        &self,
        mut state: SharedState,
        cancel: &CancellationToken,
        progress: &dyn ProgressReporter,
    ) -> RunOutcome {
        let start = Instant::now();
        let ctx = RunContext { cancel, progress };

        let mut active: BTreeSet<usize> = (0..self.stages.len())
            .filter(|&i| self.preds[i].is_empty())
            .collect();

        for level in &self.levels {
            let nodes: Vec<usize> = level.iter().copied().filter(|i| active.contains(i)).collect();
            if nodes.is_empty() {
                continue;
            }
            if cancel.is_cancelled() {
                let stage = nodes.first().map(|&i| self.stages[i].name().to_string());
                warn!(?stage, "run cancelled before stage");
                return finish(state, RunStatus::Cancelled { stage }, start);
            }

            let mut ready = Vec::with_capacity(nodes.len());
            for i in nodes {
                let stage = &self.stages[i];
                if state.is_completed(stage.name()) {
                    debug!(stage = stage.name(), "already completed, skipping");
                    self.activate_successors(i, &state, &mut active);
                    continue;
                }
                if let Err(err) = check_dependencies(stage.as_ref(), &state) {
                    error!(stage = stage.name(), error = %err, "dependency check failed");
                    state.record_stage_failure(stage.name(), err.to_string());
                    progress.stage_finished(stage.name(), false);
                    let stage = stage.name().to_string();
                    return finish(state, RunStatus::Aborted { stage, error: err }, start);
                }
                ready.push(i);
            }
            if ready.is_empty() {
                continue;
            }

            let results = join_all(ready.iter().map(|&i| self.execute(i, &state, &ctx))).await;

            let mut failure: Option<(String, TrendRadarError)> = None;
            for (&i, (result, staged)) in ready.iter().zip(results) {
                let stage = &self.stages[i];
                let name = stage.name();
                let err = match result {
                    Ok(()) => match state.commit(name, stage.outputs(), staged) {
                        Ok(()) => {
                            progress.stage_finished(name, true);
                            self.activate_successors(i, &state, &mut active);
                            continue;
                        }
                        Err(err) => err,
                    },
                    Err(f) => {
                        state.merge_errors(name, staged.into_errors());
                        f.into_error()
                    }
                };
                error!(stage = name, error = %err, "stage failed");
                state.record_stage_failure(name, err.to_string());
                progress.stage_finished(name, false);
                if failure.is_none() {
                    failure = Some((name.to_string(), err));
                }
            }

            if let Some((stage, error)) = failure {
                let status = if matches!(error, TrendRadarError::Cancelled(_)) {
                    RunStatus::Cancelled { stage: Some(stage) }
                } else {
                    RunStatus::Aborted { stage, error }
                };
                return finish(state, status, start);
            }
        }

        let degraded = !state.stage_errors().is_empty()
            || state.report().is_some_and(|r| r.degraded)
            || state.discussion().is_some_and(|d| d.degraded);
        let status = if degraded {
            RunStatus::Degraded
        } else {
            RunStatus::Completed
        };
        finish(state, status, start)
    }

    /// Run one stage, retrying whole-stage recoverable failures.
    async fn execute(
        &self,
        i: usize,
        state: &SharedState,
        ctx: &RunContext<'_>,
    ) -> (std::result::Result<(), StageFailure>, StagedWrites) {
        let stage = &self.stages[i];
        let name = stage.name();
        let mut attempt = 0;
        loop {
            ctx.progress.stage_started(name);
            let started = Instant::now();
            info!(stage = name, "stage started");

            let mut scope = StageScope::new(state, name, stage.outputs());
            let result = stage.run(&mut scope, ctx).await;
            let elapsed_ms = started.elapsed().as_millis() as u64;

            match result {
                Err(f)
                    if f.is_recoverable()
                        && attempt < self.stage_retries
                        && !ctx.cancel.is_cancelled() =>
                {
                    attempt += 1;
                    warn!(stage = name, attempt, error = %f.error(), "stage failed, re-running");
                }
                Ok(()) => {
                    info!(
                        stage = name,
                        elapsed_ms,
                        unit_errors = scope.unit_errors().len(),
                        "stage finished"
                    );
                    return (Ok(()), scope.into_staged());
                }
                Err(f) => return (Err(f), scope.into_staged()),
            }
        }
    }

    fn activate_successors(&self, i: usize, state: &SharedState, active: &mut BTreeSet<usize>) {
        let outgoing: Vec<&Edge> = self.outgoing[i].iter().map(|&e| &self.edges[e]).collect();
        if outgoing.is_empty() {
            return;
        }
        let from = self.stages[i].name();
        for name in self.selector.select(from, &outgoing, state) {
            match self.index.get(&name) {
                Some(&to) if outgoing.iter().any(|e| e.to == name) => {
                    active.insert(to);
                }
                _ => warn!(from, to = %name, "selector chose a stage that is not a successor"),
            }
        }
    }
}

fn check_dependencies(stage: &dyn Stage, state: &SharedState) -> Result<()> {
    for dep in stage.dependencies() {
        let reason = if !state.is_set(dep.field) {
            Some("absent")
        } else if dep.requirement == Requirement::NonEmpty && !state.is_non_empty(dep.field) {
            Some("empty")
        } else {
            None
        };
        if let Some(reason) = reason {
            return Err(TrendRadarError::dependency_missing(
                stage.name(),
                dep.field.as_str(),
                reason,
            ));
        }
    }
    Ok(())
}

fn finish(state: SharedState, status: RunStatus, start: Instant) -> RunOutcome {
    let elapsed = start.elapsed();
    info!(
        status = status.as_str(),
        elapsed_ms = elapsed.as_millis() as u64,
        completed = state.completed_stages().len(),
        "run finished"
    );
    RunOutcome {
        state,
        status,
        elapsed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::SilentProgress;
    use crate::stage::Dependency;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use trendradar_shared::{Analysis, Discussion, RawItem};

    type Action = Arc<dyn Fn(&mut StageScope<'_>, u32) -> std::result::Result<(), StageFailure> + Send + Sync>;

    struct TestStage {
        name: &'static str,
        deps: Vec<Dependency>,
        outputs: Vec<StateField>,
        calls: Arc<AtomicU32>,
        action: Action,
    }

    impl TestStage {
        fn new(
            name: &'static str,
            deps: Vec<Dependency>,
            outputs: Vec<StateField>,
            action: impl Fn(&mut StageScope<'_>, u32) -> std::result::Result<(), StageFailure>
            + Send
            + Sync
            + 'static,
        ) -> Self {
            Self {
                name,
                deps,
                outputs,
                calls: Arc::new(AtomicU32::new(0)),
                action: Arc::new(action),
            }
        }
    }

    #[async_trait]
    impl Stage for TestStage {
        fn name(&self) -> &str {
            self.name
        }
        fn dependencies(&self) -> &[Dependency] {
            &self.deps
        }
        fn outputs(&self) -> &[StateField] {
            &self.outputs
        }
        async fn run(
            &self,
            scope: &mut StageScope<'_>,
            _ctx: &RunContext<'_>,
        ) -> std::result::Result<(), StageFailure> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            (self.action)(scope, n)
        }
    }

    fn items() -> Vec<RawItem> {
        vec![RawItem {
            platform: "weibo".into(),
            title: "t".into(),
            rank: 1,
            url: String::new(),
            fetched_at: Utc::now(),
            metadata: None,
        }]
    }

    fn collect() -> TestStage {
        TestStage::new("collect", vec![], vec![StateField::RawItems], |s, _| {
            Ok(s.set_raw_items(items())?)
        })
    }

    fn discuss() -> TestStage {
        TestStage::new(
            "discuss",
            vec![Dependency::non_empty(StateField::RawItems)],
            vec![StateField::Discussion],
            |s, _| Ok(s.set_discussion(Discussion::default())?),
        )
    }

    async fn run(orchestrator: &Orchestrator) -> RunOutcome {
        orchestrator
            .run(SharedState::new(), &CancellationToken::new(), &SilentProgress)
            .await
    }

    #[test]
    fn rejects_cycles() {
        let err = Orchestrator::builder()
            .stage(collect())
            .stage(discuss())
            .edge("collect", "discuss")
            .edge("discuss", "collect")
            .build()
            .err()
            .expect("cycle rejected");
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn rejects_duplicate_outputs() {
        let other = TestStage::new("other", vec![], vec![StateField::RawItems], |_, _| Ok(()));
        let err = Orchestrator::builder()
            .stage(collect())
            .stage(other)
            .build()
            .err()
            .expect("duplicate rejected");
        assert!(matches!(err, TrendRadarError::StateViolation { .. }));
    }

    #[test]
    fn rejects_unknown_edges_and_missing_producers() {
        let err = Orchestrator::builder()
            .stage(collect())
            .edge("collect", "nowhere")
            .build()
            .err()
            .expect("unknown stage rejected");
        assert!(err.to_string().contains("unknown stage 'nowhere'"));

        // discuss depends on raw_items but collect is not upstream of it.
        let err = Orchestrator::builder()
            .stage(collect())
            .stage(discuss())
            .build()
            .err()
            .expect("unreachable producer rejected");
        assert!(err.to_string().contains("not upstream"));
    }

    #[tokio::test]
    async fn linear_run_commits_in_order() {
        let orchestrator = Orchestrator::builder()
            .stage(collect())
            .stage(discuss())
            .chain(&["collect", "discuss"])
            .build()
            .unwrap();
        let outcome = run(&orchestrator).await;
        assert!(matches!(outcome.status, RunStatus::Completed));
        assert_eq!(outcome.state.completed_stages(), ["collect", "discuss"]);
    }

    #[tokio::test]
    async fn fan_out_joins_before_next_level() {
        let analyze = TestStage::new(
            "analyze",
            vec![Dependency::non_empty(StateField::RawItems)],
            vec![StateField::Analysis],
            |s, _| Ok(s.set_analysis(Analysis::default())?),
        );
        let join = TestStage::new(
            "join",
            vec![
                Dependency::present(StateField::Analysis),
                Dependency::present(StateField::Discussion),
            ],
            vec![],
            |_, _| Ok(()),
        );
        let orchestrator = Orchestrator::builder()
            .stage(collect())
            .stage(analyze)
            .stage(discuss())
            .stage(join)
            .edge("collect", "analyze")
            .edge("collect", "discuss")
            .edge("analyze", "join")
            .edge("discuss", "join")
            .build()
            .unwrap();

        let outcome = run(&orchestrator).await;
        assert!(outcome.status.is_success(), "{:?}", outcome.status);
        assert_eq!(
            outcome.state.completed_stages(),
            ["collect", "analyze", "discuss", "join"]
        );
    }

    #[tokio::test]
    async fn guard_blocks_successor() {
        let orchestrator = Orchestrator::builder()
            .stage(collect())
            .stage(discuss())
            .guarded_edge("collect", "discuss", |s| {
                s.raw_items().is_some_and(|items| items.len() > 5)
            })
            .build()
            .unwrap();
        let outcome = run(&orchestrator).await;
        assert!(matches!(outcome.status, RunStatus::Completed));
        assert!(!outcome.state.is_completed("discuss"));
    }

    #[tokio::test]
    async fn undeclared_write_aborts_with_state_violation() {
        let rogue = TestStage::new(
            "rogue",
            vec![],
            vec![StateField::Discussion],
            |s, _| Ok(s.set_raw_items(items())?),
        );
        let orchestrator = Orchestrator::builder().stage(rogue).build().unwrap();
        let outcome = run(&orchestrator).await;
        match outcome.status {
            RunStatus::Aborted { stage, error } => {
                assert_eq!(stage, "rogue");
                assert!(matches!(error, TrendRadarError::StateViolation { .. }));
            }
            other => panic!("expected abort, got {other:?}"),
        }
        assert!(outcome.state.raw_items().is_none());
    }

    #[tokio::test]
    async fn missing_output_aborts_with_state_violation() {
        let lazy = TestStage::new("lazy", vec![], vec![StateField::RawItems], |_, _| Ok(()));
        let orchestrator = Orchestrator::builder().stage(lazy).build().unwrap();
        let outcome = run(&orchestrator).await;
        assert!(matches!(
            outcome.status,
            RunStatus::Aborted { error: TrendRadarError::StateViolation { .. }, .. }
        ));
    }

    #[tokio::test]
    async fn missing_dependency_stops_the_walk() {
        let empty = TestStage::new("collect", vec![], vec![StateField::RawItems], |s, _| {
            Ok(s.set_raw_items(Vec::new())?)
        });
        let after = discuss();
        let after_calls = after.calls.clone();
        let orchestrator = Orchestrator::builder()
            .stage(empty)
            .stage(after)
            .chain(&["collect", "discuss"])
            .build()
            .unwrap();

        let outcome = run(&orchestrator).await;
        match &outcome.status {
            RunStatus::Aborted { stage, error } => {
                assert_eq!(stage, "discuss");
                assert!(matches!(error, TrendRadarError::DependencyMissing { .. }));
            }
            other => panic!("expected abort, got {other:?}"),
        }
        assert_eq!(after_calls.load(Ordering::SeqCst), 0);
        // Earlier writes are kept.
        assert_eq!(outcome.state.raw_items().map(<[RawItem]>::len), Some(0));
        assert!(
            outcome
                .state
                .errors_for("discuss")
                .and_then(|e| e.detail.as_deref())
                .is_some_and(|d| d.contains("'raw_items' is empty"))
        );
    }

    #[tokio::test]
    async fn recoverable_stage_failure_is_retried() {
        let flaky = TestStage::new("collect", vec![], vec![StateField::RawItems], |s, n| {
            if n == 1 {
                return Err(TrendRadarError::Network("reset".into()).into());
            }
            Ok(s.set_raw_items(items())?)
        });
        let calls = flaky.calls.clone();
        let orchestrator = Orchestrator::builder()
            .stage(flaky)
            .stage_retries(1)
            .build()
            .unwrap();
        let outcome = run(&orchestrator).await;
        assert!(outcome.status.is_success());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn resumed_run_skips_completed_stages() {
        let first = collect();
        let first_calls = first.calls.clone();
        let orchestrator = Orchestrator::builder()
            .stage(first)
            .stage(discuss())
            .chain(&["collect", "discuss"])
            .build()
            .unwrap();

        let partial = Orchestrator::builder().stage(collect()).build().unwrap();
        let seeded = run(&partial).await.state;

        let outcome = orchestrator
            .run(seeded, &CancellationToken::new(), &SilentProgress)
            .await;
        assert!(outcome.status.is_success());
        assert_eq!(first_calls.load(Ordering::SeqCst), 0);
        assert!(outcome.state.is_completed("discuss"));
    }

    #[tokio::test]
    async fn cancelled_before_start() {
        let orchestrator = Orchestrator::builder().stage(collect()).build().unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = orchestrator
            .run(SharedState::new(), &cancel, &SilentProgress)
            .await;
        assert!(matches!(outcome.status, RunStatus::Cancelled { .. }));
        assert!(outcome.state.raw_items().is_none());
    }
}
