//! Pipeline executor — runs a plan wave by wave against the adapter registry.
//!
//! A run builds the [`StepGraph`], then repeatedly dispatches every pending
//! step whose dependencies have all succeeded. Steps in a wave are awaited
//! together, and the next wave is only chosen once the current one settles.
//! A failed step leaves its dependents pending; siblings in other branches
//! keep running.
//!
//! Step failures are data: [`Executor::execute_plan`] always returns an
//! [`ExecutionResult`].

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::sync::{Mutex, OnceCell, RwLock};
use tracing::{debug, info, instrument, warn};

use crate::adapter::AdapterRegistry;
use crate::error::{AdapterError, GraphError};
use crate::graph::StepGraph;
use crate::hashing::fingerprint;
use crate::recipe::{Plan, StepSpec};
use crate::reference::{resolve, resolve_value, ResolutionContext};

/// Lifecycle of a step within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Result of a single step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepResult {
    pub step_id: String,
    pub status: StepStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,

    /// Failure message, surfaced verbatim from the adapter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,

    /// Whether the output came from the executor cache.
    #[serde(default)]
    pub cached: bool,
}

impl StepResult {
    fn pending(step_id: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            status: StepStatus::Pending,
            output: None,
            error: None,
            started_at: None,
            finished_at: None,
            cached: false,
        }
    }
}

/// Outcome of a plan execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub run_id: String,
    pub success: bool,
    /// Resolved declared outputs. Outputs that could not be resolved are absent.
    pub outputs: BTreeMap<String, Value>,
    pub errors: Vec<String>,
    pub steps: Vec<StepResult>,
    pub cancelled: bool,
    pub duration_ms: u64,
}

/// Point-in-time view of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSnapshot {
    pub run_id: String,
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: bool,
    pub finished: bool,
    pub started_at: DateTime<Utc>,
    pub steps: Vec<StepResult>,
}

/// Runtime state of one run: resolved inputs, completed outputs, cancellation.
#[derive(Debug)]
pub struct ExecutionContext {
    inputs: Value,
    outputs: HashMap<String, Value>,
    completed: Vec<String>,
    cancel: Arc<AtomicBool>,
}

impl ExecutionContext {
    fn new(inputs: Value, cancel: Arc<AtomicBool>) -> Self {
        Self {
            inputs,
            outputs: HashMap::new(),
            completed: Vec::new(),
            cancel,
        }
    }

    /// Inputs after defaults were applied.
    pub fn inputs(&self) -> &Value {
        &self.inputs
    }

    /// Output of a completed step.
    pub fn output(&self, step_id: &str) -> Option<&Value> {
        self.outputs.get(step_id)
    }

    /// Completed step ids, in completion order.
    pub fn completed_steps(&self) -> &[String] {
        &self.completed
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    fn record(&mut self, step_id: &str, output: Value) {
        self.outputs.insert(step_id.to_string(), output);
        self.completed.push(step_id.to_string());
    }

    fn resolution<'a>(&'a self, previous_step: Option<&'a str>) -> ResolutionContext<'a> {
        ResolutionContext {
            inputs: &self.inputs,
            step_outputs: &self.outputs,
            previous_step,
        }
    }
}

/// Bookkeeping shared between a running plan and progress queries.
#[derive(Debug)]
struct RunState {
    cancel: Arc<AtomicBool>,
    finished: AtomicBool,
    started_at: DateTime<Utc>,
    steps: Mutex<Vec<StepResult>>,
}

impl RunState {
    fn new(plan: &Plan) -> Self {
        Self {
            cancel: Arc::new(AtomicBool::new(false)),
            finished: AtomicBool::new(false),
            started_at: Utc::now(),
            steps: Mutex::new(plan.steps.iter().map(|s| StepResult::pending(&s.id)).collect()),
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    async fn update(&self, index: usize, apply: impl FnOnce(&mut StepResult)) {
        if let Some(result) = self.steps.lock().await.get_mut(index) {
            apply(result);
        }
    }
}

enum StepOutcome {
    Succeeded { output: Value, cached: bool },
    Failed(String),
    /// Not started because the run was cancelled.
    Skipped,
}

type CacheCell = Arc<OnceCell<Value>>;

/// Finished runs kept for progress queries before the oldest are dropped.
const RETAINED_RUNS: usize = 64;

/// Executes plans against an [`AdapterRegistry`].
///
/// The executor is cheap to clone; clones share the run table and the step
/// cache. Runs started with [`Executor::execute_plan_with_id`] stay queryable
/// after they finish, until [`Executor::forget_run`] or until more than
/// `RETAINED_RUNS` finished runs have piled up.
#[derive(Debug, Clone)]
pub struct Executor {
    adapters: Arc<AdapterRegistry>,
    runs: Arc<RwLock<HashMap<String, Arc<RunState>>>>,
    cache: Arc<Mutex<HashMap<String, CacheCell>>>,
}

impl Executor {
    pub fn new(adapters: Arc<AdapterRegistry>) -> Self {
        Self {
            adapters,
            runs: Arc::new(RwLock::new(HashMap::new())),
            cache: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// The registry steps are dispatched to.
    pub fn adapters(&self) -> &AdapterRegistry {
        &self.adapters
    }

    /// Execute a plan under a fresh run id. The run leaves no trace in the
    /// run table once it returns.
    pub async fn execute_plan(&self, plan: &Plan, inputs: Value) -> ExecutionResult {
        let run_id = uuid::Uuid::new_v4().to_string();
        let result = self.execute_plan_with_id(&run_id, plan, inputs).await;
        self.forget_run(&run_id).await;
        result
    }

    /// Execute a plan under a caller-chosen run id, so the run can be
    /// cancelled or polled while it is in flight.
    #[instrument(skip(self, plan, inputs), fields(run_id = %run_id, recipe_id = %plan.id))]
    pub async fn execute_plan_with_id(&self, run_id: &str, plan: &Plan, inputs: Value) -> ExecutionResult {
        let start = Instant::now();
        let state = Arc::new(RunState::new(plan));
        {
            let mut runs = self.runs.write().await;
            prune_finished(&mut runs);
            runs.insert(run_id.to_string(), Arc::clone(&state));
        }

        info!(steps = plan.steps.len(), "Starting run");

        let (outputs, mut errors) = match self.run(plan, inputs, &state).await {
            Ok(settled) => settled,
            Err(message) => (BTreeMap::new(), vec![message]),
        };

        let cancelled = state.is_cancelled();
        if cancelled {
            errors.push(format!("run '{run_id}' was cancelled"));
        }
        state.finished.store(true, Ordering::SeqCst);
        let steps = state.steps.lock().await.clone();

        let result = ExecutionResult {
            run_id: run_id.to_string(),
            success: !cancelled && errors.is_empty(),
            outputs,
            errors,
            steps,
            cancelled,
            duration_ms: start.elapsed().as_millis() as u64,
        };

        info!(
            success = result.success,
            cancelled = result.cancelled,
            errors = result.errors.len(),
            duration_ms = result.duration_ms,
            "Run completed"
        );
        result
    }

    async fn run(
        &self,
        plan: &Plan,
        inputs: Value,
        state: &RunState,
    ) -> Result<(BTreeMap<String, Value>, Vec<String>), String> {
        let inputs = prepare_inputs(plan, inputs)?;
        let graph = StepGraph::build(plan).map_err(|e| e.to_string())?;
        if let Some(cycle) = graph.find_cycle() {
            return Err(GraphError::Cycle(cycle).to_string());
        }

        let mut ctx = ExecutionContext::new(inputs, Arc::clone(&state.cancel));
        let mut status = vec![StepStatus::Pending; plan.steps.len()];
        let mut errors = Vec::new();

        for dangling in graph.dangling().iter().filter(|d| d.explicit) {
            let Some(index) = plan.step_index(&dangling.step_id) else {
                continue;
            };
            if status[index] == StepStatus::Failed {
                continue;
            }
            let message = format!("depends on missing step '{}'", dangling.missing);
            status[index] = StepStatus::Failed;
            errors.push(format!("step '{}' failed: {message}", dangling.step_id));
            state
                .update(index, |r| {
                    r.status = StepStatus::Failed;
                    r.error = Some(message);
                    r.finished_at = Some(Utc::now());
                })
                .await;
        }

        let mut wave_number = 0;
        loop {
            if ctx.is_cancelled() {
                warn!(wave = wave_number, "Run cancelled, no further steps dispatched");
                break;
            }

            let ready: Vec<usize> = (0..plan.steps.len())
                .filter(|&i| status[i] == StepStatus::Pending)
                .filter(|&i| {
                    graph.dependencies_of(&plan.steps[i].id).iter().all(|dep| {
                        plan.step_index(dep)
                            .is_some_and(|j| status[j] == StepStatus::Succeeded)
                    })
                })
                .collect();
            if ready.is_empty() {
                break;
            }

            wave_number += 1;
            debug!(wave = wave_number, steps = ready.len(), "Dispatching wave");

            let dispatched = ready.iter().map(|&i| {
                let previous = i.checked_sub(1).map(|p| plan.steps[p].id.as_str());
                self.run_step(&plan.steps[i], i, previous, &ctx, state)
            });
            let outcomes = join_all(dispatched).await;

            for (i, outcome) in ready.into_iter().zip(outcomes) {
                let step = &plan.steps[i];
                match outcome {
                    StepOutcome::Succeeded { output, .. } => {
                        status[i] = StepStatus::Succeeded;
                        ctx.record(&step.id, output);
                    }
                    StepOutcome::Failed(message) => {
                        status[i] = StepStatus::Failed;
                        errors.push(format!("step '{}' failed: {message}", step.id));
                    }
                    StepOutcome::Skipped => {}
                }
            }
        }

        let cancelled = ctx.is_cancelled();
        let last_step = plan.steps.last().map(|s| s.id.as_str());
        let resolution = ctx.resolution(last_step);
        let mut outputs = BTreeMap::new();
        for (name, token) in &plan.outputs {
            match resolve(token, &resolution) {
                Ok(value) => {
                    outputs.insert(name.clone(), value);
                }
                Err(e) if !cancelled => {
                    errors.push(format!("output '{name}' could not be resolved: {e}"));
                }
                Err(_) => {}
            }
        }

        Ok((outputs, errors))
    }

    #[instrument(skip_all, fields(step_id = %step.id, provider = %step.provider))]
    async fn run_step(
        &self,
        step: &StepSpec,
        index: usize,
        previous: Option<&str>,
        ctx: &ExecutionContext,
        state: &RunState,
    ) -> StepOutcome {
        if ctx.is_cancelled() {
            return StepOutcome::Skipped;
        }

        state
            .update(index, |r| {
                r.status = StepStatus::Running;
                r.started_at = Some(Utc::now());
            })
            .await;

        let outcome = match self.invoke_step(step, previous, ctx).await {
            Ok((output, cached)) => {
                debug!(cached, "Step succeeded");
                StepOutcome::Succeeded { output, cached }
            }
            Err(message) => {
                warn!(error = %message, "Step failed");
                StepOutcome::Failed(message)
            }
        };

        state
            .update(index, |r| {
                r.finished_at = Some(Utc::now());
                match &outcome {
                    StepOutcome::Succeeded { output, cached } => {
                        r.status = StepStatus::Succeeded;
                        r.output = Some(output.clone());
                        r.cached = *cached;
                    }
                    StepOutcome::Failed(message) => {
                        r.status = StepStatus::Failed;
                        r.error = Some(message.clone());
                    }
                    StepOutcome::Skipped => {}
                }
            })
            .await;

        outcome
    }

    async fn invoke_step(
        &self,
        step: &StepSpec,
        previous: Option<&str>,
        ctx: &ExecutionContext,
    ) -> Result<(Value, bool), String> {
        let raw = Value::Object(step.inputs.clone().into_iter().collect());
        let inputs = resolve_value(&raw, &ctx.resolution(previous)).map_err(|e| e.to_string())?;

        let adapter = self
            .adapters
            .get(&step.provider)
            .ok_or_else(|| AdapterError::UnknownProvider(step.provider.clone()).to_string())?;
        let operation = step.effective_operation();

        if !step.cache {
            let output = adapter
                .invoke(&operation, inputs)
                .await
                .map_err(|e| e.to_string())?;
            return Ok((output, false));
        }

        let key = fingerprint(&json!({
            "provider": step.provider,
            "operation": operation.as_str(),
            "inputs": inputs,
        }));
        let cell = Arc::clone(self.cache.lock().await.entry(key).or_default());

        let invoked = AtomicBool::new(false);
        let output = cell
            .get_or_try_init(|| {
                invoked.store(true, Ordering::SeqCst);
                adapter.invoke(&operation, inputs)
            })
            .await
            .map_err(|e| e.to_string())?;

        Ok((output.clone(), !invoked.load(Ordering::SeqCst)))
    }

    /// Request cancellation. Steps already in flight finish; no new step
    /// starts. Returns `false` for unknown or already finished runs.
    pub async fn cancel_execution(&self, run_id: &str) -> bool {
        let runs = self.runs.read().await;
        match runs.get(run_id) {
            Some(state) if !state.finished.load(Ordering::SeqCst) => {
                state.cancel.store(true, Ordering::SeqCst);
                info!(run_id = %run_id, "Cancellation requested");
                true
            }
            _ => false,
        }
    }

    /// Snapshot of a run's progress.
    pub async fn execution_progress(&self, run_id: &str) -> Option<ProgressSnapshot> {
        let state = self.runs.read().await.get(run_id).cloned()?;
        let steps = state.steps.lock().await.clone();
        let count = |status: StepStatus| steps.iter().filter(|s| s.status == status).count();

        Some(ProgressSnapshot {
            run_id: run_id.to_string(),
            total: steps.len(),
            pending: count(StepStatus::Pending),
            running: count(StepStatus::Running),
            succeeded: count(StepStatus::Succeeded),
            failed: count(StepStatus::Failed),
            cancelled: state.is_cancelled(),
            finished: state.finished.load(Ordering::SeqCst),
            started_at: state.started_at,
            steps,
        })
    }

    /// Drop a run from the run table.
    pub async fn forget_run(&self, run_id: &str) -> bool {
        self.runs.write().await.remove(run_id).is_some()
    }

    /// Drop every cached step output.
    pub async fn clear_cache(&self) {
        self.cache.lock().await.clear();
    }
}

/// Drop the oldest finished runs so at most `RETAINED_RUNS - 1` remain.
fn prune_finished(runs: &mut HashMap<String, Arc<RunState>>) {
    let mut finished: Vec<(DateTime<Utc>, String)> = runs
        .iter()
        .filter(|(_, state)| state.finished.load(Ordering::SeqCst))
        .map(|(id, state)| (state.started_at, id.clone()))
        .collect();
    if finished.len() < RETAINED_RUNS {
        return;
    }
    finished.sort();
    let excess = finished.len() + 1 - RETAINED_RUNS;
    for (_, id) in finished.into_iter().take(excess) {
        runs.remove(&id);
    }
    debug!(dropped = excess, "Pruned finished runs");
}

/// Apply input defaults and check required inputs.
fn prepare_inputs(plan: &Plan, inputs: Value) -> Result<Value, String> {
    let mut map = match inputs {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        other => return Err(format!("inputs must be a JSON object, got {other}")),
    };

    let mut missing = Vec::new();
    for spec in &plan.inputs {
        if map.get(&spec.id).is_some_and(|v| !v.is_null()) {
            continue;
        }
        match &spec.default {
            Some(default) => {
                map.insert(spec.id.clone(), default.clone());
            }
            None if spec.required => missing.push(spec.id.as_str()),
            None => {}
        }
    }

    if !missing.is_empty() {
        return Err(format!("missing required input: {}", missing.join(", ")));
    }
    Ok(Value::Object(map))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{Adapter, AdapterResult};
    use crate::recipe::{InputKind, InputSpec, Operation, Recipe};
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct Stub {
        id: String,
        url: String,
        calls: AtomicUsize,
        delay: Duration,
        fail_with: Option<String>,
    }

    impl Stub {
        fn new(id: &str) -> Self {
            Self {
                id: id.into(),
                url: format!("https://{id}/out.png"),
                calls: AtomicUsize::new(0),
                delay: Duration::ZERO,
                fail_with: None,
            }
        }

        fn returning(mut self, url: &str) -> Self {
            self.url = url.into();
            self
        }

        fn slow(mut self, ms: u64) -> Self {
            self.delay = Duration::from_millis(ms);
            self
        }

        fn failing(mut self, message: &str) -> Self {
            self.fail_with = Some(message.into());
            self
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Adapter for Stub {
        fn id(&self) -> &str {
            &self.id
        }

        async fn invoke(&self, _operation: &Operation, inputs: Value) -> AdapterResult<Value> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if let Some(ref message) = self.fail_with {
                return Err(AdapterError::Provider(message.clone()));
            }
            Ok(json!({"url": self.url, "inputs": inputs}))
        }
    }

    fn executor(stubs: &[Arc<Stub>]) -> Executor {
        let mut registry = AdapterRegistry::new();
        for stub in stubs {
            registry.register_arc(stub.clone());
        }
        Executor::new(Arc::new(registry))
    }

    fn prompt_recipe() -> Recipe {
        Recipe::new("r1", "Test").with_input(InputSpec::required("prompt", InputKind::Text))
    }

    #[tokio::test]
    async fn test_single_step_scenario() {
        let flux = Arc::new(Stub::new("flux-pro").returning("https://x/y.png"));
        let plan = prompt_recipe()
            .with_step(StepSpec::new("gen", "flux-pro").with_input("prompt", "$input.prompt"))
            .with_output("image", "$step.gen.url");

        let result = executor(&[flux.clone()])
            .execute_plan(&plan, json!({"prompt": "sunset"}))
            .await;

        assert!(result.success);
        assert_eq!(result.outputs["image"], json!("https://x/y.png"));
        assert!(result.errors.is_empty());
        assert_eq!(result.steps[0].output.as_ref().unwrap()["inputs"]["prompt"], "sunset");
        assert_eq!(flux.calls(), 1);
    }

    #[tokio::test]
    async fn test_step_reference_sees_upstream_output() {
        let flux = Arc::new(Stub::new("flux-pro"));
        let esrgan = Arc::new(Stub::new("real-esrgan"));
        let plan = prompt_recipe()
            .with_step(StepSpec::new("gen", "flux-pro").with_input("prompt", "$input.prompt"))
            .with_step(
                StepSpec::new("up", "real-esrgan")
                    .with_operation(Operation::Upscale)
                    .with_input("image", "$step.gen.url"),
            )
            .with_output("image", "$step.up.url");

        let result = executor(&[flux, esrgan])
            .execute_plan(&plan, json!({"prompt": "sunset"}))
            .await;

        assert!(result.success, "{:?}", result.errors);
        let up = &result.steps[1];
        assert_eq!(
            up.output.as_ref().unwrap()["inputs"]["image"],
            "https://flux-pro/out.png"
        );
        assert!(up.started_at.unwrap() >= result.steps[0].finished_at.unwrap());
        assert_eq!(result.outputs["image"], "https://real-esrgan/out.png");
    }

    #[tokio::test]
    async fn test_prev_reads_preceding_step() {
        let flux = Arc::new(Stub::new("flux-pro"));
        let rembg = Arc::new(Stub::new("rembg"));
        let plan = prompt_recipe()
            .with_step(StepSpec::new("gen", "flux-pro").with_input("prompt", "$input.prompt"))
            .with_step(
                StepSpec::new("cut", "rembg")
                    .with_operation(Operation::RemoveBackground)
                    .with_input("image", "$prev.url"),
            )
            .with_output("image", "$prev.url");

        let result = executor(&[flux, rembg])
            .execute_plan(&plan, json!({"prompt": "cat"}))
            .await;

        assert!(result.success, "{:?}", result.errors);
        assert_eq!(
            result.steps[1].output.as_ref().unwrap()["inputs"]["image"],
            "https://flux-pro/out.png"
        );
        assert_eq!(result.outputs["image"], "https://rembg/out.png");
    }

    #[tokio::test(start_paused = true)]
    async fn test_independent_steps_run_concurrently() {
        let a = Arc::new(Stub::new("model-a").slow(100));
        let b = Arc::new(Stub::new("model-b").slow(100));
        let plan = prompt_recipe()
            .with_step(StepSpec::new("a", "model-a").with_input("prompt", "$input.prompt"))
            .with_step(StepSpec::new("b", "model-b").with_input("prompt", "$input.prompt"))
            .with_output("a", "$step.a.url")
            .with_output("b", "$step.b.url");

        let started = tokio::time::Instant::now();
        let result = executor(&[a, b])
            .execute_plan(&plan, json!({"prompt": "x"}))
            .await;

        assert!(result.success);
        assert!(started.elapsed() < Duration::from_millis(150));
    }

    #[tokio::test]
    async fn test_cached_steps_invoke_once() {
        let flux = Arc::new(Stub::new("flux-pro"));
        let step = |id: &str| {
            StepSpec::new(id, "flux-pro")
                .with_input("prompt", "$input.prompt")
                .cached()
        };
        let plan = prompt_recipe()
            .with_step(step("a"))
            .with_step(step("b"))
            .with_output("a", "$step.a.url")
            .with_output("b", "$step.b.url");

        let executor = executor(&[flux.clone()]);
        let first = executor.execute_plan(&plan, json!({"prompt": "same"})).await;
        assert!(first.success);
        assert_eq!(flux.calls(), 1);
        assert_eq!(first.steps.iter().filter(|s| s.cached).count(), 1);
        assert_eq!(first.outputs["a"], first.outputs["b"]);

        let second = executor.execute_plan(&plan, json!({"prompt": "same"})).await;
        assert!(second.success);
        assert_eq!(flux.calls(), 1);
        assert!(second.steps.iter().all(|s| s.cached));

        executor.execute_plan(&plan, json!({"prompt": "different"})).await;
        assert_eq!(flux.calls(), 2);

        executor.clear_cache().await;
        executor.execute_plan(&plan, json!({"prompt": "same"})).await;
        assert_eq!(flux.calls(), 3);
    }

    #[tokio::test]
    async fn test_uncached_steps_always_invoke() {
        let flux = Arc::new(Stub::new("flux-pro"));
        let plan = prompt_recipe()
            .with_step(StepSpec::new("a", "flux-pro").with_input("prompt", "$input.prompt"))
            .with_step(StepSpec::new("b", "flux-pro").with_input("prompt", "$input.prompt"))
            .with_output("a", "$step.a.url")
            .with_output("b", "$step.b.url");

        executor(&[flux.clone()])
            .execute_plan(&plan, json!({"prompt": "same"}))
            .await;
        assert_eq!(flux.calls(), 2);
    }

    #[tokio::test]
    async fn test_failure_stops_only_dependents() {
        let broken = Arc::new(Stub::new("broken").failing("NSFW content detected"));
        let flux = Arc::new(Stub::new("flux-pro"));
        let esrgan = Arc::new(Stub::new("real-esrgan"));
        let plan = prompt_recipe()
            .with_step(StepSpec::new("bad", "broken").with_input("prompt", "$input.prompt"))
            .with_step(
                StepSpec::new("up", "real-esrgan")
                    .with_operation(Operation::Upscale)
                    .with_input("image", "$step.bad.url"),
            )
            .with_step(StepSpec::new("good", "flux-pro").with_input("prompt", "$input.prompt"))
            .with_output("upscaled", "$step.up.url")
            .with_output("image", "$step.good.url");

        let result = executor(&[broken, flux, esrgan.clone()])
            .execute_plan(&plan, json!({"prompt": "x"}))
            .await;

        assert!(!result.success);
        assert!(result.errors.iter().any(|e| e.contains("NSFW content detected")));
        assert_eq!(result.steps[0].status, StepStatus::Failed);
        assert_eq!(result.steps[0].error.as_deref(), Some("NSFW content detected"));
        assert_eq!(result.steps[1].status, StepStatus::Pending);
        assert_eq!(result.steps[2].status, StepStatus::Succeeded);
        assert_eq!(esrgan.calls(), 0);
        assert!(!result.outputs.contains_key("upscaled"));
        assert_eq!(result.outputs["image"], "https://flux-pro/out.png");
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_lets_in_flight_steps_finish() {
        let flux = Arc::new(Stub::new("flux-pro").slow(100));
        let esrgan = Arc::new(Stub::new("real-esrgan"));
        let plan = prompt_recipe()
            .with_step(StepSpec::new("gen", "flux-pro").with_input("prompt", "$input.prompt"))
            .with_step(
                StepSpec::new("up", "real-esrgan")
                    .with_operation(Operation::Upscale)
                    .with_input("image", "$step.gen.url"),
            )
            .with_output("image", "$step.up.url");

        let executor = executor(&[flux.clone(), esrgan.clone()]);
        let handle = {
            let executor = executor.clone();
            tokio::spawn(async move {
                executor
                    .execute_plan_with_id("run-1", &plan, json!({"prompt": "x"}))
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        let progress = executor.execution_progress("run-1").await.unwrap();
        assert_eq!(progress.running, 1);
        assert_eq!(progress.pending, 1);
        assert!(!progress.finished);

        assert!(executor.cancel_execution("run-1").await);
        let result = handle.await.unwrap();

        assert!(result.cancelled);
        assert!(!result.success);
        assert_eq!(result.steps[0].status, StepStatus::Succeeded);
        assert_eq!(result.steps[1].status, StepStatus::Pending);
        assert_eq!(flux.calls(), 1);
        assert_eq!(esrgan.calls(), 0);
        assert!(!executor.cancel_execution("run-1").await);
    }

    #[tokio::test]
    async fn test_progress_after_completion() {
        let flux = Arc::new(Stub::new("flux-pro"));
        let plan = prompt_recipe()
            .with_step(StepSpec::new("gen", "flux-pro").with_input("prompt", "$input.prompt"))
            .with_output("image", "$step.gen.url");

        let executor = executor(&[flux]);
        let result = executor
            .execute_plan_with_id("run-1", &plan, json!({"prompt": "x"}))
            .await;
        assert_eq!(result.run_id, "run-1");

        let progress = executor.execution_progress(&result.run_id).await.unwrap();
        assert_eq!(progress.total, 1);
        assert_eq!(progress.succeeded, 1);
        assert!(progress.finished);
        assert!(!progress.cancelled);

        assert!(executor.forget_run(&result.run_id).await);
        assert!(executor.execution_progress(&result.run_id).await.is_none());
        assert!(!executor.cancel_execution("no-such-run").await);
    }

    #[tokio::test]
    async fn test_anonymous_runs_are_not_retained() {
        let flux = Arc::new(Stub::new("flux-pro"));
        let plan = prompt_recipe()
            .with_step(StepSpec::new("gen", "flux-pro").with_input("prompt", "$input.prompt"))
            .with_output("image", "$step.gen.url");

        let executor = executor(&[flux]);
        for _ in 0..100 {
            let result = executor.execute_plan(&plan, json!({"prompt": "x"})).await;
            assert!(result.success);
            assert!(executor.execution_progress(&result.run_id).await.is_none());
        }
        assert!(executor.runs.read().await.is_empty());
    }

    #[tokio::test]
    async fn test_finished_named_runs_are_bounded() {
        let flux = Arc::new(Stub::new("flux-pro"));
        let plan = prompt_recipe()
            .with_step(StepSpec::new("gen", "flux-pro").with_input("prompt", "$input.prompt"))
            .with_output("image", "$step.gen.url");

        let executor = executor(&[flux]);
        let total = RETAINED_RUNS * 2;
        for n in 0..total {
            executor
                .execute_plan_with_id(&format!("run-{n}"), &plan, json!({"prompt": "x"}))
                .await;
        }

        assert!(executor.runs.read().await.len() <= RETAINED_RUNS);
        let latest = format!("run-{}", total - 1);
        assert!(executor.execution_progress(&latest).await.unwrap().finished);
    }

    #[tokio::test]
    async fn test_missing_required_input_fails_before_any_step() {
        let flux = Arc::new(Stub::new("flux-pro"));
        let plan = prompt_recipe()
            .with_input(InputSpec::optional("style", InputKind::Text).with_default(json!("photo")))
            .with_step(StepSpec::new("gen", "flux-pro").with_input("prompt", "$input.prompt"))
            .with_output("image", "$step.gen.url");

        let result = executor(&[flux.clone()]).execute_plan(&plan, json!({})).await;

        assert!(!result.success);
        assert_eq!(result.errors, vec!["missing required input: prompt"]);
        assert_eq!(flux.calls(), 0);
    }

    #[tokio::test]
    async fn test_input_defaults_are_applied() {
        let flux = Arc::new(Stub::new("flux-pro"));
        let plan = prompt_recipe()
            .with_input(InputSpec::optional("style", InputKind::Text).with_default(json!("photo")))
            .with_step(
                StepSpec::new("gen", "flux-pro")
                    .with_input("prompt", "$input.prompt")
                    .with_input("style", "$input.style"),
            )
            .with_output("image", "$step.gen.url");

        let result = executor(&[flux])
            .execute_plan(&plan, json!({"prompt": "x"}))
            .await;
        assert!(result.success, "{:?}", result.errors);
        assert_eq!(result.steps[0].output.as_ref().unwrap()["inputs"]["style"], "photo");
    }

    #[tokio::test]
    async fn test_cycle_fails_the_run() {
        let flux = Arc::new(Stub::new("flux-pro"));
        let plan = prompt_recipe()
            .with_step(StepSpec::new("a", "flux-pro").with_input("image", "$step.b.url"))
            .with_step(StepSpec::new("b", "flux-pro").with_input("image", "$step.a.url"))
            .with_output("image", "$step.b.url");

        let result = executor(&[flux.clone()])
            .execute_plan(&plan, json!({"prompt": "x"}))
            .await;
        assert!(!result.success);
        assert!(result.errors[0].contains("circular"));
        assert_eq!(flux.calls(), 0);
    }

    #[tokio::test]
    async fn test_unknown_provider_and_missing_dependency_fail_steps() {
        let flux = Arc::new(Stub::new("flux-pro"));
        let plan = prompt_recipe()
            .with_step(StepSpec::new("a", "flux-prov").with_input("prompt", "$input.prompt"))
            .with_step(
                StepSpec::new("b", "flux-pro")
                    .with_input("prompt", "$input.prompt")
                    .with_dependencies(["ghost"]),
            )
            .with_step(StepSpec::new("c", "flux-pro").with_input("prompt", "$input.prompt"))
            .with_output("image", "$step.c.url");

        let result = executor(&[flux.clone()])
            .execute_plan(&plan, json!({"prompt": "x"}))
            .await;

        assert!(!result.success);
        assert!(result
            .errors
            .contains(&"step 'a' failed: unknown provider 'flux-prov'".to_string()));
        assert!(result
            .errors
            .contains(&"step 'b' failed: depends on missing step 'ghost'".to_string()));
        assert_eq!(result.outputs["image"], "https://flux-pro/out.png");
        assert_eq!(flux.calls(), 1);
    }

    #[tokio::test]
    async fn test_result_serializes_camel_case() {
        let flux = Arc::new(Stub::new("flux-pro"));
        let plan = prompt_recipe()
            .with_step(StepSpec::new("gen", "flux-pro").with_input("prompt", "$input.prompt"))
            .with_output("image", "$step.gen.url");

        let result = executor(&[flux])
            .execute_plan_with_id("run-42", &plan, json!({"prompt": "x"}))
            .await;
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["runId"], "run-42");
        assert_eq!(json["success"], true);
        assert_eq!(json["steps"][0]["stepId"], "gen");
        assert_eq!(json["steps"][0]["status"], "succeeded");
        assert!(json["durationMs"].is_u64());
    }
}
