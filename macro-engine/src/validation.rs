//! Authoring-time checks. The engine assumes every snapshot it receives has
//! passed [`validate`]; nothing here runs during execution.

use crate::action::Action;
use crate::config::MAX_SECONDS;
use crate::definition::MacroDefinition;
use crate::errors::ValidationError;
use crate::expression::{self, StaticType};
use crate::hotkey::{Hotkey, HotkeyDispatcher};
use crate::variables::{check_template, is_valid_name, split_scope, BUILTIN_NAMES};

/// Structural checks plus hotkey syntax. Does not consult any binding table.
pub fn validate_structure(definition: &MacroDefinition) -> Result<(), ValidationError> {
    if definition.name.trim().is_empty() {
        return Err(invalid("name", "macro name is empty"));
    }
    if definition.actions.is_empty() {
        return Err(ValidationError::EmptyActions);
    }
    if definition.repeat.count == 0 {
        return Err(invalid("repeat.count", "repeat count must be at least 1"));
    }
    check_seconds("repeat.delay", definition.repeat.delay)?;
    if let Some(spec) = definition.hotkey_spec() {
        spec.parse::<Hotkey>()?;
    }
    validate_sequence(&definition.actions, "actions")
}

/// Full validation, including reserved and duplicate hotkeys.
pub fn validate(definition: &MacroDefinition, hotkeys: &HotkeyDispatcher) -> Result<(), ValidationError> {
    validate_structure(definition)?;
    if let Some(spec) = definition.hotkey_spec() {
        hotkeys.check(spec, &definition.id)?;
    }
    Ok(())
}

fn invalid(location: &str, detail: impl Into<String>) -> ValidationError {
    ValidationError::InvalidParameter {
        location: location.to_string(),
        detail: detail.into(),
    }
}

fn check_seconds(location: &str, seconds: f64) -> Result<(), ValidationError> {
    if !seconds.is_finite() || seconds < 0.0 {
        return Err(invalid(location, format!("duration must be a non-negative number, got {seconds}")));
    }
    if seconds > MAX_SECONDS {
        return Err(invalid(location, format!("duration {seconds} is too large")));
    }
    Ok(())
}

fn check_key(location: &str, key: &str) -> Result<(), ValidationError> {
    if key.trim().is_empty() {
        return Err(invalid(location, "key is empty"));
    }
    Ok(())
}

fn check_template_at(location: &str, text: &str) -> Result<(), ValidationError> {
    check_template(text).map_err(|detail| ValidationError::MalformedInterpolation {
        location: location.to_string(),
        detail,
    })
}

/// Validates one sequence: its own loop markers must balance, and every
/// condition branch is validated as a sequence of its own.
fn validate_sequence(actions: &[Action], prefix: &str) -> Result<(), ValidationError> {
    let mut open_loops: Vec<usize> = Vec::new();

    for (index, action) in actions.iter().enumerate() {
        let location = format!("{prefix}[{index}]");
        match action {
            Action::KeyPress { key } | Action::KeyRelease { key } => check_key(&location, key)?,
            Action::KeyHold { key, duration } => {
                check_key(&location, key)?;
                check_seconds(&location, *duration)?;
            }
            Action::TypeText { text } => check_template_at(&location, text)?,
            Action::KeyCombo { keys } => {
                if keys.is_empty() {
                    return Err(invalid(&location, "key combo has no keys"));
                }
                for (i, key) in keys.iter().enumerate() {
                    check_key(&location, key)?;
                    if keys[..i].iter().any(|k| k.eq_ignore_ascii_case(key)) {
                        return Err(invalid(&location, format!("key '{key}' repeated in combo")));
                    }
                }
            }
            Action::MouseClick { clicks, .. } => {
                if *clicks == 0 {
                    return Err(invalid(&location, "click count must be at least 1"));
                }
            }
            Action::MouseMove { duration, .. } | Action::MouseDrag { duration, .. } => {
                check_seconds(&location, *duration)?;
            }
            Action::MouseScroll { .. } => {}
            Action::Delay { seconds, jitter } => {
                check_seconds(&location, *seconds)?;
                if let Some(jitter) = jitter {
                    check_seconds(&location, *jitter)?;
                }
            }
            Action::LoopStart { .. } => open_loops.push(index),
            Action::LoopEnd => {
                if open_loops.pop().is_none() {
                    return Err(ValidationError::UnbalancedLoop {
                        location,
                        detail: "loop_end without a matching loop_start".to_string(),
                    });
                }
            }
            Action::Condition {
                expr,
                then_branch,
                else_branch,
            } => {
                let parsed = expression::parse(expr).map_err(|e| ValidationError::MalformedExpression {
                    location: location.clone(),
                    detail: e.to_string(),
                })?;
                if !matches!(parsed.static_type(), StaticType::Bool | StaticType::Unknown) {
                    return Err(ValidationError::NonBooleanCondition { location });
                }
                validate_sequence(then_branch, &format!("{location}.then"))?;
                validate_sequence(else_branch, &format!("{location}.else"))?;
            }
            Action::VariableSet { name, expr } => {
                let (_, bare) = split_scope(name);
                if !is_valid_name(bare) || bare.contains('.') {
                    return Err(invalid(&location, format!("invalid variable name '{name}'")));
                }
                if BUILTIN_NAMES.contains(&bare) {
                    return Err(invalid(&location, format!("'{bare}' is a read-only built-in")));
                }
                match expr.strip_prefix('=') {
                    Some(source) => {
                        expression::parse(source).map_err(|e| ValidationError::MalformedExpression {
                            location: location.clone(),
                            detail: e.to_string(),
                        })?;
                    }
                    None => check_template_at(&location, expr)?,
                }
            }
            Action::HotkeyTrigger { macro_id } => {
                if macro_id.trim().is_empty() {
                    return Err(invalid(&location, "trigger target is empty"));
                }
            }
        }
    }

    if let Some(start) = open_loops.pop() {
        return Err(ValidationError::UnbalancedLoop {
            location: format!("{prefix}[{start}]"),
            detail: "loop_start is never closed".to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn macro_with(actions: Vec<Action>) -> MacroDefinition {
        MacroDefinition::new("test", actions)
    }

    #[test]
    fn test_balanced_nested_loops_pass() {
        let m = macro_with(vec![
            Action::loop_start(2),
            Action::loop_start(3),
            Action::key_press("a"),
            Action::LoopEnd,
            Action::LoopEnd,
        ]);
        assert!(validate_structure(&m).is_ok());
    }

    #[test]
    fn test_unbalanced_loops_rejected() {
        let m = macro_with(vec![Action::loop_start(2), Action::key_press("a")]);
        assert!(matches!(
            validate_structure(&m),
            Err(ValidationError::UnbalancedLoop { location, .. }) if location == "actions[0]"
        ));

        let m = macro_with(vec![Action::key_press("a"), Action::LoopEnd]);
        assert!(matches!(
            validate_structure(&m),
            Err(ValidationError::UnbalancedLoop { location, .. }) if location == "actions[1]"
        ));
    }

    #[test]
    fn test_loops_cannot_span_condition_branches() {
        let m = macro_with(vec![
            Action::loop_start(2),
            Action::Condition {
                expr: "true".into(),
                then_branch: vec![Action::LoopEnd],
                else_branch: vec![],
            },
        ]);
        assert!(matches!(
            validate_structure(&m),
            Err(ValidationError::UnbalancedLoop { location, .. }) if location == "actions[1].then[0]"
        ));
    }

    #[test]
    fn test_huge_durations_rejected() {
        for action in [
            Action::delay(1e30),
            Action::Delay {
                seconds: 1.0,
                jitter: Some(f64::MAX),
            },
            Action::KeyHold {
                key: "a".into(),
                duration: 1e30,
            },
        ] {
            assert!(matches!(
                validate_structure(&macro_with(vec![action])),
                Err(ValidationError::InvalidParameter { .. })
            ));
        }

        let mut repeated = macro_with(vec![Action::key_press("a")]);
        repeated.repeat.delay = 1e30;
        assert!(matches!(
            validate_structure(&repeated),
            Err(ValidationError::InvalidParameter { location, .. }) if location == "repeat.delay"
        ));
    }

    #[test]
    fn test_empty_macro_rejected() {
        assert_eq!(validate_structure(&macro_with(vec![])), Err(ValidationError::EmptyActions));
    }

    #[test]
    fn test_malformed_interpolation_rejected() {
        let m = macro_with(vec![Action::TypeText { text: "hi {{name".into() }]);
        assert!(matches!(
            validate_structure(&m),
            Err(ValidationError::MalformedInterpolation { .. })
        ));

        let m = macro_with(vec![Action::set("x", "{{bad name}}")]);
        assert!(matches!(
            validate_structure(&m),
            Err(ValidationError::MalformedInterpolation { .. })
        ));
    }

    #[test]
    fn test_condition_must_be_boolean() {
        let m = macro_with(vec![Action::Condition {
            expr: "1 + 2".into(),
            then_branch: vec![],
            else_branch: vec![],
        }]);
        assert!(matches!(
            validate_structure(&m),
            Err(ValidationError::NonBooleanCondition { .. })
        ));

        let m = macro_with(vec![Action::Condition {
            expr: "hp <".into(),
            then_branch: vec![],
            else_branch: vec![],
        }]);
        assert!(matches!(
            validate_structure(&m),
            Err(ValidationError::MalformedExpression { .. })
        ));
    }

    #[test]
    fn test_variable_set_rules() {
        assert!(validate_structure(&macro_with(vec![Action::set("global.count", "=global.count + 1")])).is_ok());
        assert!(validate_structure(&macro_with(vec![Action::set("loop_counter", "1")])).is_err());
        assert!(validate_structure(&macro_with(vec![Action::set("x", "=1 +")])).is_err());
        assert!(validate_structure(&macro_with(vec![Action::set("bad name", "1")])).is_err());
    }

    #[test]
    fn test_parameter_checks() {
        assert!(validate_structure(&macro_with(vec![Action::delay(-1.0)])).is_err());
        assert!(validate_structure(&macro_with(vec![Action::key_press("")])).is_err());
        assert!(validate_structure(&macro_with(vec![Action::KeyCombo {
            keys: vec!["ctrl".into(), "CTRL".into()]
        }]))
        .is_err());
        assert!(validate_structure(&macro_with(vec![Action::key_press("a")]).with_repeat(0, 0.0)).is_err());
        assert!(validate_structure(&macro_with(vec![Action::key_press("a")]).with_hotkey("ctrl+")).is_err());
    }
}
