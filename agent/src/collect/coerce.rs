//! Typed coercion of raw answers

use regex::Regex;

use crate::errors::AgentError;
use crate::models::parameter::{ParamType, ParamValue, ParameterDefinition};

/// Coerce a non-empty answer into the definition's type.
/// Errors are always `ValidationError`; the session stays on the item.
pub fn coerce_answer(definition: &ParameterDefinition, raw: &str) -> Result<ParamValue, AgentError> {
    let raw = raw.trim();
    let value = match definition.param_type {
        ParamType::Boolean => ParamValue::Bool(parse_bool(raw).ok_or_else(|| {
            invalid(definition, raw, "expected yes/no, true/false or 1/0")
        })?),
        ParamType::Number => {
            let n: f64 = raw
                .parse()
                .map_err(|_| invalid(definition, raw, "expected a number"))?;
            if !n.is_finite() {
                return Err(invalid(definition, raw, "expected a finite number"));
            }
            ParamValue::Number(n)
        }
        ParamType::Choice => ParamValue::Text(canonical_choice(definition, raw)?),
        ParamType::String => ParamValue::Text(raw.to_string()),
        ParamType::Secret => ParamValue::secret(raw),
    };

    if definition.param_type != ParamType::Choice {
        if let Some(allowed) = &definition.allowed_values {
            if !allowed.iter().any(|a| a.eq_ignore_ascii_case(raw)) {
                return Err(invalid(
                    definition,
                    raw,
                    &format!("expected one of {}", allowed.join(", ")),
                ));
            }
        }
    }
    if let Some(pattern) = &definition.validation_pattern {
        let re = Regex::new(pattern).map_err(|e| {
            AgentError::ConfigError(format!(
                "invalid validation pattern for {}: {}",
                definition.name, e
            ))
        })?;
        if !re.is_match(raw) {
            return Err(invalid(definition, raw, &format!("must match {}", pattern)));
        }
    }
    Ok(value)
}

pub fn parse_bool(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "true" | "yes" | "y" | "1" => Some(true),
        "false" | "no" | "n" | "0" => Some(false),
        _ => None,
    }
}

/// Allowed value matching `raw` case-insensitively, in its declared spelling
fn canonical_choice(definition: &ParameterDefinition, raw: &str) -> Result<String, AgentError> {
    let allowed = definition.allowed_values.as_deref().unwrap_or_default();
    allowed
        .iter()
        .find(|a| a.eq_ignore_ascii_case(raw))
        .cloned()
        .ok_or_else(|| invalid(definition, raw, &format!("expected one of {}", allowed.join(", "))))
}

fn invalid(definition: &ParameterDefinition, raw: &str, expected: &str) -> AgentError {
    let shown = if definition.is_secret() { "(hidden)" } else { raw };
    AgentError::ValidationError(format!(
        "'{}' is not valid for {}: {}",
        shown, definition.name, expected
    ))
}
