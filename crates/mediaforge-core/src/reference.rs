//! Reference tokens — lazy reads from recipe inputs and step outputs.
//!
//! Grammar:
//!
//! ```text
//! $input.<path>            read from the caller-supplied inputs
//! $step.<step-id>.<path>   read a field off a completed step's output
//! $prev.<path>             read off the preceding step in declared order
//! ```
//!
//! Paths are dot-separated; numeric segments index into arrays. Any other
//! string is a literal and passes through resolution unchanged.

use std::collections::HashMap;

use serde_json::Value;

use crate::error::ReferenceError;

const INPUT_PREFIX: &str = "$input";
const STEP_PREFIX: &str = "$step";
const PREV_PREFIX: &str = "$prev";

/// A parsed reference token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reference {
    /// `$input.<path>`
    Input { path: Vec<String> },
    /// `$step.<step_id>.<field>`
    Step { step_id: String, field: Vec<String> },
    /// `$prev.<field>`
    Prev { field: Vec<String> },
    /// Any non-token string.
    Literal(String),
}

impl Reference {
    /// Parse a string into a reference.
    pub fn parse(token: &str) -> Result<Self, ReferenceError> {
        let Some((head, rest)) = split_head(token) else {
            return Ok(Reference::Literal(token.to_string()));
        };
        let segments = split_path(rest, token)?;
        match head {
            INPUT_PREFIX => Ok(Reference::Input { path: segments }),
            PREV_PREFIX => Ok(Reference::Prev { field: segments }),
            _ => {
                let mut segments = segments.into_iter();
                let step_id = segments.next().unwrap_or_default();
                let field: Vec<String> = segments.collect();
                if field.is_empty() {
                    return Err(ReferenceError::Invalid(token.to_string()));
                }
                Ok(Reference::Step { step_id, field })
            }
        }
    }

    /// Whether this is a literal rather than a token.
    pub fn is_literal(&self) -> bool {
        matches!(self, Reference::Literal(_))
    }

    /// The step this reference reads from, if it names one explicitly.
    pub fn step_id(&self) -> Option<&str> {
        match self {
            Reference::Step { step_id, .. } => Some(step_id),
            _ => None,
        }
    }
}

impl std::fmt::Display for Reference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Reference::Input { path } => write!(f, "{INPUT_PREFIX}.{}", path.join(".")),
            Reference::Step { step_id, field } => {
                write!(f, "{STEP_PREFIX}.{step_id}.{}", field.join("."))
            }
            Reference::Prev { field } => write!(f, "{PREV_PREFIX}.{}", field.join(".")),
            Reference::Literal(value) => f.write_str(value),
        }
    }
}

/// Returns `(prefix, remainder)` for strings that look like tokens.
fn split_head(token: &str) -> Option<(&'static str, &str)> {
    for head in [INPUT_PREFIX, STEP_PREFIX, PREV_PREFIX] {
        if let Some(rest) = token.strip_prefix(head) {
            if rest.is_empty() {
                return Some((head, rest));
            }
            if let Some(rest) = rest.strip_prefix('.') {
                return Some((head, rest));
            }
        }
    }
    None
}

fn split_path(rest: &str, token: &str) -> Result<Vec<String>, ReferenceError> {
    let segments: Vec<String> = rest.split('.').map(str::to_string).collect();
    if segments.iter().any(|s| s.is_empty()) {
        return Err(ReferenceError::Invalid(token.to_string()));
    }
    Ok(segments)
}

/// A read-only view of the state references resolve against.
#[derive(Debug, Clone, Copy)]
pub struct ResolutionContext<'a> {
    /// Caller-supplied inputs (an object).
    pub inputs: &'a Value,
    /// Outputs of completed steps, by step id.
    pub step_outputs: &'a HashMap<String, Value>,
    /// The step `$prev` points at, if any.
    pub previous_step: Option<&'a str>,
}

/// Parse and resolve a single string.
pub fn resolve(token: &str, ctx: &ResolutionContext<'_>) -> Result<Value, ReferenceError> {
    resolve_reference(&Reference::parse(token)?, ctx)
}

/// Resolve a parsed reference.
pub fn resolve_reference(
    reference: &Reference,
    ctx: &ResolutionContext<'_>,
) -> Result<Value, ReferenceError> {
    match reference {
        Reference::Literal(value) => Ok(Value::String(value.clone())),
        Reference::Input { path } => lookup(ctx.inputs, path)
            .cloned()
            .map_err(|depth| ReferenceError::MissingInput(path[..=depth].join("."))),
        Reference::Step { step_id, field } => read_step(ctx, step_id, field),
        Reference::Prev { field } => {
            let step_id = ctx
                .previous_step
                .ok_or_else(|| ReferenceError::NoPreviousStep(reference.to_string()))?;
            read_step(ctx, step_id, field)
        }
    }
}

fn read_step(
    ctx: &ResolutionContext<'_>,
    step_id: &str,
    field: &[String],
) -> Result<Value, ReferenceError> {
    let output = ctx
        .step_outputs
        .get(step_id)
        .ok_or_else(|| ReferenceError::MissingStep(step_id.to_string()))?;
    lookup(output, field)
        .cloned()
        .map_err(|depth| ReferenceError::MissingField {
            step_id: step_id.to_string(),
            field: field[..=depth].join("."),
        })
}

/// Walk `path` from `root`. On failure returns the index of the first
/// segment that could not be followed.
fn lookup<'v>(root: &'v Value, path: &[String]) -> Result<&'v Value, usize> {
    let mut current = root;
    for (depth, segment) in path.iter().enumerate() {
        let next = match current {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        };
        current = next.ok_or(depth)?;
    }
    Ok(current)
}

/// Resolve every token inside a JSON value. Objects and arrays are walked
/// recursively; everything that is not a token is returned unchanged.
pub fn resolve_value(value: &Value, ctx: &ResolutionContext<'_>) -> Result<Value, ReferenceError> {
    match value {
        Value::String(s) => resolve(s, ctx),
        Value::Array(items) => items
            .iter()
            .map(|item| resolve_value(item, ctx))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => {
            let mut resolved = serde_json::Map::with_capacity(map.len());
            for (key, item) in map {
                resolved.insert(key.clone(), resolve_value(item, ctx)?);
            }
            Ok(Value::Object(resolved))
        }
        other => Ok(other.clone()),
    }
}

fn walk_strings<'v>(value: &'v Value, visit: &mut impl FnMut(&'v str)) {
    match value {
        Value::String(s) => visit(s),
        Value::Array(items) => items.iter().for_each(|item| walk_strings(item, visit)),
        Value::Object(map) => map.values().for_each(|item| walk_strings(item, visit)),
        _ => {}
    }
}

/// Every well-formed, non-literal reference inside `value`.
pub fn references_in(value: &Value) -> Vec<Reference> {
    let mut found = Vec::new();
    walk_strings(value, &mut |s| {
        if let Ok(reference) = Reference::parse(s) {
            if !reference.is_literal() {
                found.push(reference);
            }
        }
    });
    found
}

/// Every token-looking string inside `value` that fails to parse.
pub fn invalid_tokens_in(value: &Value) -> Vec<(String, ReferenceError)> {
    let mut found = Vec::new();
    walk_strings(value, &mut |s| {
        if let Err(err) = Reference::parse(s) {
            found.push((s.to_string(), err));
        }
    });
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn ctx<'a>(
        inputs: &'a Value,
        outputs: &'a HashMap<String, Value>,
        previous: Option<&'a str>,
    ) -> ResolutionContext<'a> {
        ResolutionContext {
            inputs,
            step_outputs: outputs,
            previous_step: previous,
        }
    }

    #[test]
    fn test_parse_variants() {
        assert_eq!(
            Reference::parse("$input.config.dimensions.width").unwrap(),
            Reference::Input {
                path: vec!["config".into(), "dimensions".into(), "width".into()]
            }
        );
        assert_eq!(
            Reference::parse("$step.gen.url").unwrap(),
            Reference::Step {
                step_id: "gen".into(),
                field: vec!["url".into()]
            }
        );
        assert_eq!(
            Reference::parse("$prev.metadata.seed").unwrap(),
            Reference::Prev {
                field: vec!["metadata".into(), "seed".into()]
            }
        );
        assert_eq!(
            Reference::parse("a sunset over $input").unwrap(),
            Reference::Literal("a sunset over $input".into())
        );
        assert_eq!(
            Reference::parse("$inputs.prompt").unwrap(),
            Reference::Literal("$inputs.prompt".into())
        );
    }

    #[test]
    fn test_parse_malformed() {
        for token in ["$step.gen", "$input.", "$input", "$prev", "$input.a..b"] {
            assert!(
                matches!(Reference::parse(token), Err(ReferenceError::Invalid(_))),
                "{token} should be invalid"
            );
        }
    }

    #[test]
    fn test_display_roundtrip() {
        let token = "$step.gen.metadata.seed";
        assert_eq!(Reference::parse(token).unwrap().to_string(), token);
    }

    #[test]
    fn test_resolve_nested_input() {
        let inputs = json!({"a": {"b": 5}});
        let outputs = HashMap::new();
        assert_eq!(resolve("$input.a.b", &ctx(&inputs, &outputs, None)).unwrap(), json!(5));
    }

    #[test]
    fn test_resolve_array_index() {
        let inputs = json!({"images": ["x.png", "y.png"]});
        let outputs = HashMap::new();
        assert_eq!(
            resolve("$input.images.1", &ctx(&inputs, &outputs, None)).unwrap(),
            json!("y.png")
        );
    }

    #[test]
    fn test_missing_targets_name_the_key() {
        let inputs = json!({"a": {}});
        let mut outputs = HashMap::new();
        outputs.insert("gen".to_string(), json!({"url": "https://x/y.png"}));
        let c = ctx(&inputs, &outputs, None);

        let err = resolve("$input.a.b", &c).unwrap_err();
        assert_eq!(err, ReferenceError::MissingInput("a.b".into()));
        assert!(err.to_string().contains("a.b"));

        let err = resolve("$step.upscale.url", &c).unwrap_err();
        assert!(err.to_string().contains("upscale"));

        let err = resolve("$step.gen.metadata", &c).unwrap_err();
        assert_eq!(
            err,
            ReferenceError::MissingField {
                step_id: "gen".into(),
                field: "metadata".into()
            }
        );

        assert!(matches!(
            resolve("$prev.url", &c),
            Err(ReferenceError::NoPreviousStep(_))
        ));
    }

    #[test]
    fn test_resolve_prev() {
        let inputs = json!({});
        let mut outputs = HashMap::new();
        outputs.insert("gen".to_string(), json!({"url": "https://x/y.png"}));
        assert_eq!(
            resolve("$prev.url", &ctx(&inputs, &outputs, Some("gen"))).unwrap(),
            json!("https://x/y.png")
        );
    }

    #[test]
    fn test_literals_pass_through() {
        let inputs = json!({});
        let outputs = HashMap::new();
        let c = ctx(&inputs, &outputs, None);
        for value in [json!("plain text"), json!(42), json!({"k": [1, true, null]}), json!(null)] {
            assert_eq!(resolve_value(&value, &c).unwrap(), value);
        }
    }

    #[test]
    fn test_resolve_value_walks_structures() {
        let inputs = json!({"prompt": "sunset", "size": 1024});
        let outputs = HashMap::new();
        let value = json!({
            "prompt": "$input.prompt",
            "dims": {"width": "$input.size", "height": 768},
            "tags": ["$input.prompt", "static"]
        });
        assert_eq!(
            resolve_value(&value, &ctx(&inputs, &outputs, None)).unwrap(),
            json!({
                "prompt": "sunset",
                "dims": {"width": 1024, "height": 768},
                "tags": ["sunset", "static"]
            })
        );
    }

    #[test]
    fn test_scanning() {
        let value = json!({
            "image": "$step.gen.url",
            "mask": ["$prev.url", "$step.bad"],
            "prompt": "hello"
        });
        let refs = references_in(&value);
        assert_eq!(refs.len(), 2);
        assert!(refs.iter().any(|r| r.step_id() == Some("gen")));

        let invalid = invalid_tokens_in(&value);
        assert_eq!(invalid.len(), 1);
        assert_eq!(invalid[0].0, "$step.bad");
    }
}
