//! Fix application — apply validator-proposed fixes to a recipe.
//!
//! Fixes address the recipe's JSON form with JSON pointers. Application is
//! pure: the input recipe is untouched and a patched copy is returned.
//!
//! Array insertions and removals shift the indices that later fixes refer
//! to, so they are applied after every other fix, deepest arrays first and
//! highest index first within an array. Every path is therefore interpreted
//! against the recipe as it was validated.

use std::cmp::Reverse;

use serde_json::Value;
use tracing::debug;

use crate::error::FixError;
use crate::recipe::Recipe;
use crate::validator::{Fix, FixAction};

/// Apply `fixes` to a copy of `recipe`.
pub fn apply_fixes(recipe: &Recipe, fixes: &[Fix]) -> Result<Recipe, FixError> {
    let mut document = serde_json::to_value(recipe)?;

    let mut array_edits = Vec::new();
    for fix in fixes {
        let (parent, last) = split_pointer(&fix.path)?;
        let targets_array = fix.action != FixAction::Modify
            && document.pointer(parent).is_some_and(Value::is_array);
        if targets_array {
            array_edits.push((parent, last, fix));
        } else {
            apply_one(&mut document, parent, &last, fix)?;
        }
    }

    array_edits.sort_by_key(|(parent, last, _)| {
        let position = if last == "-" {
            usize::MAX
        } else {
            last.parse::<usize>().unwrap_or(usize::MAX)
        };
        (Reverse(parent.matches('/').count()), Reverse(position))
    });
    for (parent, last, fix) in array_edits {
        apply_one(&mut document, parent, &last, fix)?;
    }

    let patched: Recipe = serde_json::from_value(document)?;
    debug!(recipe_id = %patched.id, applied = fixes.len(), "Fixes applied");
    Ok(patched)
}

/// Split a pointer into its (escaped) parent pointer and unescaped last token.
fn split_pointer(path: &str) -> Result<(&str, String), FixError> {
    if !path.starts_with('/') {
        return Err(FixError::InvalidPath(path.to_string()));
    }
    let (parent, last) = path
        .rsplit_once('/')
        .ok_or_else(|| FixError::InvalidPath(path.to_string()))?;
    Ok((parent, last.replace("~1", "/").replace("~0", "~")))
}

fn apply_one(document: &mut Value, parent: &str, last: &str, fix: &Fix) -> Result<(), FixError> {
    let not_found = || FixError::PathNotFound(fix.path.clone());
    let value = || {
        fix.value
            .clone()
            .ok_or_else(|| FixError::MissingValue(fix.path.clone()))
    };

    match document.pointer_mut(parent).ok_or_else(not_found)? {
        Value::Object(map) => match fix.action {
            FixAction::Add => {
                map.insert(last.to_string(), value()?);
            }
            FixAction::Modify => {
                let slot = map.get_mut(last).ok_or_else(not_found)?;
                *slot = value()?;
            }
            FixAction::Remove => {
                map.remove(last).ok_or_else(not_found)?;
            }
        },
        Value::Array(items) => {
            let index = if last == "-" && fix.action == FixAction::Add {
                items.len()
            } else {
                last.parse::<usize>()
                    .map_err(|_| FixError::InvalidPath(fix.path.clone()))?
            };
            match fix.action {
                FixAction::Add if index <= items.len() => items.insert(index, value()?),
                FixAction::Modify if index < items.len() => items[index] = value()?,
                FixAction::Remove if index < items.len() => {
                    items.remove(index);
                }
                _ => return Err(not_found()),
            }
        }
        _ => return Err(not_found()),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{AdapterRegistry, DryRunAdapter};
    use crate::policy::PolicyTable;
    use crate::recipe::{InputKind, InputSpec, Operation, StepSpec};
    use crate::validator::Validator;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::Arc;

    fn validator() -> Validator {
        let policy = PolicyTable::builtin();
        let mut registry = AdapterRegistry::new();
        for id in policy.models.keys() {
            registry.register(DryRunAdapter::new(id));
        }
        Validator::new(Arc::new(registry), Arc::new(policy))
    }

    fn recipe() -> Recipe {
        Recipe::new("r1", "Sticker")
            .with_input(InputSpec::required("prompt", InputKind::Text))
            .with_step(
                StepSpec::new("sticker", "flux-prov")
                    .with_input("prompt", "$input.prompt")
                    .with_input("width", 2048)
                    .with_input("lora", "https://x/style.safetensors")
                    .with_input("transparent", true),
            )
            .with_output("image", "$step.sticker.url")
    }

    fn fix(path: &str, action: FixAction, value: Option<Value>) -> Fix {
        Fix {
            path: path.into(),
            description: String::new(),
            action,
            value,
        }
    }

    #[test]
    fn test_validator_fixes_round_trip() {
        let validator = validator();
        let original = recipe();

        // First pass only suggests the provider; compatibility checks need a known model.
        let first = validator.validate(&original);
        assert!(!first.valid);
        let renamed = apply_fixes(&original, &first.fixes).unwrap();
        assert_eq!(renamed.steps[0].provider, "flux-pro");

        let second = validator.validate(&renamed);
        assert!(second.valid);
        assert_eq!(second.fixes.len(), 3);
        let fixed = apply_fixes(&renamed, &second.fixes).unwrap();

        assert_eq!(fixed.steps.len(), 2);
        assert_eq!(fixed.steps[0].inputs["width"], json!(1440));
        assert!(!fixed.steps[0].inputs.contains_key("lora"));
        assert_eq!(fixed.steps[1].id, "sticker-remove-bg");
        assert_eq!(fixed.steps[1].operation, Some(Operation::RemoveBackground));

        let third = validator.validate(&fixed);
        assert!(third.valid);
        assert!(third.fixes.is_empty());

        // The input recipe is untouched.
        assert_eq!(original, recipe());
    }

    #[test]
    fn test_array_edits_use_original_indices() {
        let recipe = Recipe::new("r1", "Three")
            .with_step(StepSpec::new("a", "flux-pro"))
            .with_step(StepSpec::new("b", "flux-pro"))
            .with_step(StepSpec::new("c", "flux-pro"));

        let fixes = vec![
            fix("/steps/0", FixAction::Remove, None),
            fix("/steps/2", FixAction::Remove, None),
            fix(
                "/steps/1",
                FixAction::Add,
                Some(serde_json::to_value(StepSpec::new("x", "sdxl")).unwrap()),
            ),
        ];
        let patched = apply_fixes(&recipe, &fixes).unwrap();
        let ids: Vec<&str> = patched.steps.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["x", "b"]);
    }

    #[test]
    fn test_append_to_array() {
        let recipe = Recipe::new("r1", "One")
            .with_step(StepSpec::new("a", "flux-pro").with_dependencies(["y"]));
        let patched = apply_fixes(
            &recipe,
            &[fix("/steps/0/dependencies/-", FixAction::Add, Some(json!("z")))],
        )
        .unwrap();
        assert_eq!(patched.steps[0].dependencies, vec!["y", "z"]);
    }

    #[test]
    fn test_bad_paths() {
        let recipe = recipe();
        assert!(matches!(
            apply_fixes(&recipe, &[fix("steps/0", FixAction::Remove, None)]),
            Err(FixError::InvalidPath(_))
        ));
        assert!(matches!(
            apply_fixes(&recipe, &[fix("/steps/0/inputs/seed", FixAction::Modify, Some(json!(1)))]),
            Err(FixError::PathNotFound(_))
        ));
        assert!(matches!(
            apply_fixes(&recipe, &[fix("/steps/7", FixAction::Remove, None)]),
            Err(FixError::PathNotFound(_))
        ));
        assert!(matches!(
            apply_fixes(&recipe, &[fix("/steps/0/provider", FixAction::Modify, None)]),
            Err(FixError::MissingValue(_))
        ));
    }

    #[test]
    fn test_patch_that_breaks_the_recipe_is_rejected() {
        let err = apply_fixes(&recipe(), &[fix("/steps", FixAction::Modify, Some(json!(3)))])
            .unwrap_err();
        assert!(matches!(err, FixError::Serialization(_)));
    }

    #[test]
    fn test_escaped_output_names() {
        let recipe = recipe().with_output("a/b", "$step.sticker.url");
        let patched =
            apply_fixes(&recipe, &[fix("/outputs/a~1b", FixAction::Remove, None)]).unwrap();
        assert!(!patched.outputs.contains_key("a/b"));
        assert!(patched.outputs.contains_key("image"));
    }
}
