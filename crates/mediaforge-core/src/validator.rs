//! Recipe validation — static checks run before a recipe becomes a plan.
//!
//! Checks run in a fixed order because later ones assume the structure the
//! earlier ones establish:
//!
//! 1. schema completeness
//! 2. provider existence (with near-miss suggestions)
//! 3. reference resolvability
//! 4. dependency graph well-formedness
//! 5. reachability
//! 6. model compatibility against the [`PolicyTable`]
//!
//! Validation never fails: every problem is reported as data in a
//! [`ValidationResult`], and nothing here touches the network.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use crate::adapter::ProviderCatalog;
use crate::graph::StepGraph;
use crate::policy::PolicyTable;
use crate::recipe::{Operation, Recipe, StepSpec};
use crate::reference::{invalid_tokens_in, references_in, Reference};

/// Machine-readable issue codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IssueCode {
    MissingField,
    DuplicateStepId,
    InvalidStepId,
    UnknownProvider,
    UnresolvedReference,
    InvalidReference,
    MissingDependency,
    CircularDependency,
    UnreachableStep,
    IncompatibleOperation,
    DimensionExceedsMax,
    LoraNotSupported,
}

/// A validation error or warning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Issue {
    /// Human-readable description.
    pub message: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<IssueCode>,

    /// JSON pointer to the offending location.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
}

impl Issue {
    pub fn new(code: IssueCode, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: Some(code),
            path: None,
            step_id: None,
        }
    }

    pub fn at(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn for_step(mut self, step_id: impl Into<String>) -> Self {
        self.step_id = Some(step_id.into());
        self
    }
}

/// What a fix does at its path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum FixAction {
    Add,
    Remove,
    Modify,
}

/// A mechanically applicable correction, applied with
/// [`crate::fixes::apply_fixes`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Fix {
    /// JSON pointer into the recipe document.
    pub path: String,
    pub description: String,
    pub action: FixAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

/// Outcome of validating a recipe.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<Issue>,
    pub warnings: Vec<Issue>,
    pub fixes: Vec<Fix>,
}

impl ValidationResult {
    /// Whether any error or warning carries `code`.
    pub fn has_code(&self, code: IssueCode) -> bool {
        self.errors
            .iter()
            .chain(&self.warnings)
            .any(|issue| issue.code == Some(code))
    }

    fn error(&mut self, issue: Issue) {
        self.errors.push(issue);
    }

    fn warning(&mut self, issue: Issue) {
        self.warnings.push(issue);
    }

    fn fix(&mut self, fix: Fix) {
        self.fixes.push(fix);
    }

    fn finish(mut self) -> Self {
        self.valid = self.errors.is_empty();
        self
    }
}

/// Static recipe validator.
#[derive(Clone)]
pub struct Validator {
    providers: Arc<dyn ProviderCatalog>,
    policy: Arc<PolicyTable>,
}

impl Validator {
    /// Create a validator over a provider catalog and a policy table.
    pub fn new(providers: Arc<dyn ProviderCatalog>, policy: Arc<PolicyTable>) -> Self {
        Self { providers, policy }
    }

    /// Validate a raw recipe document, starting with its JSON shape.
    pub fn validate_document(&self, document: &Value) -> ValidationResult {
        let mut report = ValidationResult::default();
        check_document_shape(document, &mut report);
        if !report.errors.is_empty() {
            return report.finish();
        }

        match serde_json::from_value::<Recipe>(document.clone()) {
            Ok(recipe) => self.validate(&recipe),
            Err(e) => {
                report.error(Issue::new(
                    IssueCode::MissingField,
                    format!("recipe document is malformed: {e}"),
                ));
                report.finish()
            }
        }
    }

    /// Validate a recipe.
    pub fn validate(&self, recipe: &Recipe) -> ValidationResult {
        let mut report = ValidationResult::default();

        check_schema(recipe, &mut report);
        if !report.errors.is_empty() {
            return report.finish();
        }

        self.check_providers(recipe, &mut report);

        let graph = match StepGraph::build(recipe) {
            Ok(graph) => graph,
            Err(e) => {
                report.error(Issue::new(IssueCode::DuplicateStepId, e.to_string()));
                return report.finish();
            }
        };

        check_references(recipe, &graph, &mut report);
        if check_graph(recipe, &graph, &mut report) {
            check_reachability(recipe, &graph, &mut report);
        }
        self.check_compatibility(recipe, &mut report);

        debug!(
            recipe_id = %recipe.id,
            errors = report.errors.len(),
            warnings = report.warnings.len(),
            fixes = report.fixes.len(),
            policy_version = %self.policy.version,
            "Recipe validated"
        );
        report.finish()
    }

    fn check_providers(&self, recipe: &Recipe, report: &mut ValidationResult) {
        for (i, step) in recipe.steps.iter().enumerate() {
            if self.providers.has_provider(&step.provider) {
                continue;
            }
            let path = format!("/steps/{i}/provider");
            match self.closest_provider(&step.provider) {
                Some(suggestion) => {
                    report.error(
                        Issue::new(
                            IssueCode::UnknownProvider,
                            format!(
                                "step '{}' uses unknown provider '{}' (did you mean '{}'?)",
                                step.id, step.provider, suggestion
                            ),
                        )
                        .at(&path)
                        .for_step(&step.id),
                    );
                    report.fix(Fix {
                        description: format!(
                            "Replace provider '{}' with '{}' in step '{}'",
                            step.provider, suggestion, step.id
                        ),
                        path,
                        action: FixAction::Modify,
                        value: Some(json!(suggestion)),
                    });
                }
                None => report.error(
                    Issue::new(
                        IssueCode::UnknownProvider,
                        format!("step '{}' uses unknown provider '{}'", step.id, step.provider),
                    )
                    .at(path)
                    .for_step(&step.id),
                ),
            }
        }
    }

    fn closest_provider(&self, target: &str) -> Option<String> {
        let len = target.chars().count();
        self.providers
            .provider_ids()
            .into_iter()
            .map(|id| (levenshtein(target, &id), id))
            .filter(|(distance, _)| *distance > 0 && (*distance <= 2 || distance * 3 <= len))
            .min_by_key(|(distance, _)| *distance)
            .map(|(_, id)| id)
    }

    fn check_compatibility(&self, recipe: &Recipe, report: &mut ValidationResult) {
        for (i, step) in recipe.steps.iter().enumerate() {
            let Some(model) = self.policy.model(&step.provider) else {
                continue;
            };
            let operation = step.effective_operation();

            if !model.supports(&operation) {
                report.error(
                    Issue::new(
                        IssueCode::IncompatibleOperation,
                        format!(
                            "model '{}' does not support operation '{}' (step '{}')",
                            step.provider, operation, step.id
                        ),
                    )
                    .at(format!("/steps/{i}/operation"))
                    .for_step(&step.id),
                );
            }

            for key in ["width", "height"] {
                let (Some(max), Some(requested)) = (
                    model.max_dimension(key),
                    step.inputs.get(key).and_then(Value::as_f64),
                ) else {
                    continue;
                };
                if requested <= max as f64 {
                    continue;
                }
                let path = format!("/steps/{i}/inputs/{key}");
                report.warning(
                    Issue::new(
                        IssueCode::DimensionExceedsMax,
                        format!(
                            "step '{}' requests {key} {requested} but '{}' supports at most {max}",
                            step.id, step.provider
                        ),
                    )
                    .at(&path)
                    .for_step(&step.id),
                );
                report.fix(Fix {
                    path,
                    description: format!(
                        "Clamp {key} of step '{}' from {requested} to {max}",
                        step.id
                    ),
                    action: FixAction::Modify,
                    value: Some(json!(max)),
                });
            }

            if step.inputs.contains_key("lora") && !model.supports_lora {
                let path = format!("/steps/{i}/inputs/lora");
                report.warning(
                    Issue::new(
                        IssueCode::LoraNotSupported,
                        format!(
                            "model '{}' does not support LoRA weights (step '{}')",
                            step.provider, step.id
                        ),
                    )
                    .at(&path)
                    .for_step(&step.id),
                );
                report.fix(Fix {
                    path,
                    description: format!(
                        "Remove unsupported 'lora' parameter from step '{}'",
                        step.id
                    ),
                    action: FixAction::Remove,
                    value: None,
                });
            }

            if operation == Operation::GenerateImage
                && !model.alpha_output
                && !declines_transparency(step)
                && !followed_by_background_removal(recipe, i)
            {
                if let Some(fix) = self.background_removal_fix(recipe, i, step) {
                    report.fix(fix);
                }
            }
        }
    }

    fn background_removal_fix(&self, recipe: &Recipe, index: usize, step: &StepSpec) -> Option<Fix> {
        let base = format!("{}-remove-bg", step.id);
        let mut id = base.clone();
        let mut n = 2;
        while recipe.step(&id).is_some() {
            id = format!("{base}-{n}");
            n += 1;
        }

        let inserted = StepSpec::new(id, &self.policy.background_removal_provider)
            .named("Remove background")
            .with_operation(Operation::RemoveBackground)
            .with_input("image", format!("$step.{}.url", step.id));

        Some(Fix {
            path: format!("/steps/{}", index + 1),
            description: format!(
                "Insert a background-removal step after '{}' ('{}' cannot output transparency)",
                step.id, step.provider
            ),
            action: FixAction::Add,
            value: Some(serde_json::to_value(inserted).ok()?),
        })
    }
}

impl std::fmt::Debug for Validator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Validator")
            .field("providers", &self.providers.provider_ids())
            .field("policy_version", &self.policy.version)
            .finish()
    }
}

fn check_document_shape(document: &Value, report: &mut ValidationResult) {
    let Some(root) = document.as_object() else {
        report.error(Issue::new(IssueCode::MissingField, "recipe must be a JSON object"));
        return;
    };

    for (field, kind) in [("id", "string"), ("name", "string"), ("steps", "array"), ("outputs", "object")] {
        match root.get(field) {
            None | Some(Value::Null) => report.error(
                Issue::new(
                    IssueCode::MissingField,
                    format!("missing required field '{field}'"),
                )
                .at(format!("/{field}")),
            ),
            Some(value) if !has_kind(value, kind) => report.error(
                Issue::new(IssueCode::MissingField, format!("field '{field}' must be a {kind}"))
                    .at(format!("/{field}")),
            ),
            Some(_) => {}
        }
    }

    let Some(steps) = root.get("steps").and_then(Value::as_array) else {
        return;
    };
    for (i, step) in steps.iter().enumerate() {
        let Some(step) = step.as_object() else {
            report.error(
                Issue::new(IssueCode::MissingField, format!("step {i} must be an object"))
                    .at(format!("/steps/{i}")),
            );
            continue;
        };
        for (field, kind) in [("id", "string"), ("provider", "string"), ("inputs", "object")] {
            match step.get(field) {
                None | Some(Value::Null) => report.error(
                    Issue::new(
                        IssueCode::MissingField,
                        format!("step {i} is missing required field '{field}'"),
                    )
                    .at(format!("/steps/{i}/{field}")),
                ),
                Some(value) if !has_kind(value, kind) => report.error(
                    Issue::new(
                        IssueCode::MissingField,
                        format!("field '{field}' of step {i} must be a {kind}"),
                    )
                    .at(format!("/steps/{i}/{field}")),
                ),
                Some(_) => {}
            }
        }
    }
}

fn has_kind(value: &Value, kind: &str) -> bool {
    match kind {
        "string" => value.is_string(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        _ => true,
    }
}

fn check_schema(recipe: &Recipe, report: &mut ValidationResult) {
    if recipe.id.trim().is_empty() {
        report.error(Issue::new(IssueCode::MissingField, "missing required field 'id'").at("/id"));
    }
    if recipe.name.trim().is_empty() {
        report.error(
            Issue::new(IssueCode::MissingField, "missing required field 'name'").at("/name"),
        );
    }

    let mut seen = HashSet::new();
    let mut reported = HashSet::new();
    for (i, step) in recipe.steps.iter().enumerate() {
        if step.id.trim().is_empty() {
            report.error(
                Issue::new(
                    IssueCode::MissingField,
                    format!("step {i} is missing required field 'id'"),
                )
                .at(format!("/steps/{i}/id")),
            );
        } else if step.id.contains('.') || step.id.starts_with('$') {
            report.error(
                Issue::new(
                    IssueCode::InvalidStepId,
                    format!("step id '{}' must not contain '.' or start with '$'", step.id),
                )
                .at(format!("/steps/{i}/id"))
                .for_step(&step.id),
            );
        } else if !seen.insert(step.id.as_str()) && reported.insert(step.id.as_str()) {
            report.error(
                Issue::new(
                    IssueCode::DuplicateStepId,
                    format!("duplicate step id '{}'", step.id),
                )
                .at(format!("/steps/{i}/id"))
                .for_step(&step.id),
            );
        }

        if step.provider.trim().is_empty() {
            report.error(
                Issue::new(
                    IssueCode::MissingField,
                    format!("step '{}' is missing required field 'provider'", step.id),
                )
                .at(format!("/steps/{i}/provider"))
                .for_step(&step.id),
            );
        }
    }
}

fn check_references(recipe: &Recipe, graph: &StepGraph, report: &mut ValidationResult) {
    let declared: HashSet<&str> = recipe.inputs.iter().map(|input| input.id.as_str()).collect();

    for (i, step) in recipe.steps.iter().enumerate() {
        let inputs = Value::Object(step.inputs.clone().into_iter().collect());
        let here = format!("/steps/{i}/inputs");

        for (token, _) in invalid_tokens_in(&inputs) {
            report.error(
                Issue::new(
                    IssueCode::InvalidReference,
                    format!("step '{}' has malformed reference '{token}'", step.id),
                )
                .at(&here)
                .for_step(&step.id),
            );
        }

        let mut unknown_steps = BTreeSet::new();
        for reference in references_in(&inputs) {
            match &reference {
                Reference::Input { path } if !declared.contains(path[0].as_str()) => {
                    report.error(
                        Issue::new(
                            IssueCode::UnresolvedReference,
                            format!(
                                "step '{}' references undeclared input '{}'",
                                step.id, path[0]
                            ),
                        )
                        .at(&here)
                        .for_step(&step.id),
                    );
                }
                Reference::Step { step_id, .. } if !graph.contains(step_id) => {
                    unknown_steps.insert(step_id.clone());
                }
                Reference::Prev { .. } if i == 0 => {
                    report.error(
                        Issue::new(
                            IssueCode::UnresolvedReference,
                            format!("step '{}' uses '{reference}' but has no preceding step", step.id),
                        )
                        .at(&here)
                        .for_step(&step.id),
                    );
                }
                _ => {}
            }
        }
        for target in unknown_steps {
            report.error(
                Issue::new(
                    IssueCode::UnresolvedReference,
                    format!("step '{}' references unknown step '{target}'", step.id),
                )
                .at(&here)
                .for_step(&step.id),
            );
        }
    }

    for (name, token) in &recipe.outputs {
        let path = format!("/outputs/{}", escape_pointer(name));
        let problem = match Reference::parse(token) {
            Err(_) => Some(format!("output '{name}' has malformed reference '{token}'")),
            Ok(Reference::Literal(_)) => {
                report.warning(
                    Issue::new(
                        IssueCode::InvalidReference,
                        format!("output '{name}' is a literal value, not a reference token"),
                    )
                    .at(&path),
                );
                None
            }
            Ok(Reference::Input { path: input_path })
                if !declared.contains(input_path[0].as_str()) =>
            {
                Some(format!("output '{name}' references undeclared input '{}'", input_path[0]))
            }
            Ok(Reference::Step { step_id, .. }) if !graph.contains(&step_id) => {
                Some(format!("output '{name}' references unknown step '{step_id}'"))
            }
            Ok(Reference::Prev { .. }) if recipe.steps.is_empty() => {
                Some(format!("output '{name}' uses '{token}' but the recipe has no steps"))
            }
            Ok(_) => None,
        };
        if let Some(message) = problem {
            let code = if Reference::parse(token).is_err() {
                IssueCode::InvalidReference
            } else {
                IssueCode::UnresolvedReference
            };
            report.error(Issue::new(code, message).at(path));
        }
    }
}

/// Reports dangling dependencies and cycles. Returns `true` when acyclic.
fn check_graph(recipe: &Recipe, graph: &StepGraph, report: &mut ValidationResult) -> bool {
    for dangling in graph.dangling().iter().filter(|d| d.explicit) {
        let index = recipe.step_index(&dangling.step_id).unwrap_or_default();
        report.error(
            Issue::new(
                IssueCode::MissingDependency,
                format!(
                    "step '{}' depends on missing step '{}'",
                    dangling.step_id, dangling.missing
                ),
            )
            .at(format!("/steps/{index}/dependencies"))
            .for_step(&dangling.step_id),
        );
    }

    match graph.find_cycle() {
        Some(cycle) => {
            report.error(
                Issue::new(
                    IssueCode::CircularDependency,
                    format!("circular dependency detected: {}", cycle.join(" -> ")),
                )
                .for_step(&cycle[0]),
            );
            false
        }
        None => true,
    }
}

fn check_reachability(recipe: &Recipe, graph: &StepGraph, report: &mut ValidationResult) {
    let mut contributing: HashSet<String> = HashSet::new();
    for token in recipe.outputs.values() {
        let target = match Reference::parse(token) {
            Ok(Reference::Step { step_id, .. }) => Some(step_id),
            Ok(Reference::Prev { .. }) => recipe.steps.last().map(|s| s.id.clone()),
            _ => None,
        };
        if let Some(target) = target.filter(|t| graph.contains(t)) {
            contributing.extend(graph.ancestors(&target).into_iter().map(str::to_string));
            contributing.insert(target);
        }
    }

    for (i, step) in recipe.steps.iter().enumerate() {
        if contributing.contains(&step.id) || !graph.dependents_of(&step.id).is_empty() {
            continue;
        }
        report.warning(
            Issue::new(
                IssueCode::UnreachableStep,
                format!("step '{}' does not contribute to any declared output", step.id),
            )
            .at(format!("/steps/{i}"))
            .for_step(&step.id),
        );
    }
}

/// `transparent: false` marks a step whose opaque output is intended.
fn declines_transparency(step: &StepSpec) -> bool {
    step.inputs.get("transparent") == Some(&Value::Bool(false))
}

fn followed_by_background_removal(recipe: &Recipe, index: usize) -> bool {
    recipe
        .steps
        .get(index + 1)
        .is_some_and(|next| next.effective_operation() == Operation::RemoveBackground)
}

fn escape_pointer(token: &str) -> String {
    token.replace('~', "~0").replace('/', "~1")
}

/// Edit distance between two strings.
fn levenshtein(a: &str, b: &str) -> usize {
    let b: Vec<char> = b.chars().collect();
    let mut previous: Vec<usize> = (0..=b.len()).collect();
    let mut current = vec![0; b.len() + 1];

    for (i, ca) in a.chars().enumerate() {
        current[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != *cb);
            current[j + 1] = (previous[j] + cost)
                .min(previous[j + 1] + 1)
                .min(current[j] + 1);
        }
        std::mem::swap(&mut previous, &mut current);
    }
    previous[b.len()]
}
