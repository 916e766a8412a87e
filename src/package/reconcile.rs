use crate::store::models::{dependencies_equal, Action, CurrentState, TargetState};

/// Classify one deployment key by comparing its target state against the
/// persisted current state.
///
/// Only in target: Create. Only in current: Destroy (handled by the
/// caller). In both: structural equality over variables, module hash,
/// dependencies (as sets) and output-reference specifications decides
/// between NoChange, ConditionalUpdate (equal, but output references may
/// drift at run time) and Update. `--force-update` promotes every in-both
/// key to Update.
pub fn classify(
    target: &TargetState,
    current: Option<&CurrentState>,
    force_update: bool,
) -> Action {
    let Some(current) = current else {
        return Action::Create;
    };
    if force_update {
        return Action::Update;
    }
    let matches = target.variables == current.variables
        && target.module_hash == current.module_hash
        && dependencies_equal(&target.dependencies, &current.dependencies)
        && target.variables_from_outputs == current.variables_from_outputs;
    if !matches {
        Action::Update
    } else if !target.variables_from_outputs.is_empty() {
        Action::ConditionalUpdate
    } else {
        Action::NoChange
    }
}

/// At dispatch time a ConditionalUpdate re-runs this comparison with the
/// freshest output values folded into the target variables; equality means
/// the step finalizes as NoChange without invoking the engine.
pub fn update_needed(target: &TargetState, current: &CurrentState) -> bool {
    target.variables != current.variables || target.module_hash != current.module_hash
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::models::OutputRef;
    use std::collections::BTreeMap;

    fn target() -> TargetState {
        TargetState {
            variables: serde_json::json!({"Size": "small"})
                .as_object()
                .unwrap()
                .clone(),
            variables_from_outputs: BTreeMap::new(),
            dependencies: Vec::new(),
            module_hash: "abc".to_string(),
        }
    }

    fn current_from(target: &TargetState) -> CurrentState {
        CurrentState {
            variables: target.variables.clone(),
            variables_from_outputs: target.variables_from_outputs.clone(),
            dependencies: target.dependencies.clone(),
            module_hash: target.module_hash.clone(),
            outputs: Default::default(),
            last_changed_time: "2024-01-01T00:00:00Z".to_string(),
        }
    }

    #[test]
    fn absent_current_state_creates() {
        assert_eq!(classify(&target(), None, false), Action::Create);
    }

    #[test]
    fn identical_states_need_no_change() {
        let target = target();
        let current = current_from(&target);
        assert_eq!(classify(&target, Some(&current), false), Action::NoChange);
    }

    #[test]
    fn variable_drift_updates() {
        let mut target = target();
        let current = current_from(&target);
        target
            .variables
            .insert("Size".to_string(), serde_json::json!("large"));
        assert_eq!(classify(&target, Some(&current), false), Action::Update);
    }

    #[test]
    fn hash_drift_updates() {
        let mut target = target();
        let current = current_from(&target);
        target.module_hash = "def".to_string();
        assert_eq!(classify(&target, Some(&current), false), Action::Update);
    }

    #[test]
    fn output_references_make_it_conditional() {
        let mut target = target();
        target.variables_from_outputs.insert(
            "VpcId".to_string(),
            OutputRef {
                module: "vpc".to_string(),
                account_id: "111111111111".to_string(),
                region: "eu-west-1".to_string(),
                output_name: "vpc_id".to_string(),
                ignore_if_not_exists: false,
            },
        );
        let current = current_from(&target);
        assert_eq!(
            classify(&target, Some(&current), false),
            Action::ConditionalUpdate
        );
    }

    #[test]
    fn force_update_promotes_everything() {
        let target = target();
        let current = current_from(&target);
        assert_eq!(classify(&target, Some(&current), true), Action::Update);
    }
}
