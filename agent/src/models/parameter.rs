//! Template parameter models

use std::fmt;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::utils::sha256_hash;

/// Declared type of a template parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    String,
    Number,
    Boolean,
    Choice,
    Secret,
}

impl ParamType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParamType::String => "string",
            ParamType::Number => "number",
            ParamType::Boolean => "boolean",
            ParamType::Choice => "choice",
            ParamType::Secret => "secret",
        }
    }
}

/// A parameter a template declares. Immutable once parsed.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterDefinition {
    pub name: String,
    pub param_type: ParamType,
    pub required: bool,
    pub default_value: Option<ParamValue>,
    pub allowed_values: Option<Vec<String>>,
    pub validation_pattern: Option<String>,
    pub description: Option<String>,
    pub order: u32,
}

impl ParameterDefinition {
    /// A required parameter without default
    pub fn new(name: impl Into<String>, param_type: ParamType, order: u32) -> Self {
        Self {
            name: name.into(),
            param_type,
            required: true,
            default_value: None,
            allowed_values: None,
            validation_pattern: None,
            description: None,
            order,
        }
    }

    pub fn with_default(mut self, value: ParamValue) -> Self {
        self.default_value = Some(value);
        self
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    pub fn with_allowed_values<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_values = Some(values.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.validation_pattern = Some(pattern.into());
        self
    }

    pub fn is_secret(&self) -> bool {
        self.param_type == ParamType::Secret
    }

    /// Question shown to the user for this parameter
    pub fn question(&self) -> String {
        let subject = self.description.as_deref().unwrap_or(&self.name);
        let mut question = format!("Please provide {} ({})", subject, self.name);
        if let Some(allowed) = &self.allowed_values {
            question.push_str(&format!(", one of: {}", allowed.join(", ")));
        }
        match &self.default_value {
            Some(default) => question.push_str(&format!(". Leave empty for default [{}]", default)),
            None if !self.required => question.push_str(". Leave empty to skip"),
            None => {}
        }
        question
    }
}

/// A collected or default parameter value
#[derive(Debug)]
pub enum ParamValue {
    Text(String),
    Number(f64),
    Bool(bool),
    Secret(SecretString),
}

impl ParamValue {
    pub fn text(value: impl Into<String>) -> Self {
        ParamValue::Text(value.into())
    }

    pub fn secret(value: impl Into<String>) -> Self {
        ParamValue::Secret(SecretString::from(value.into()))
    }

    pub fn is_secret(&self) -> bool {
        matches!(self, ParamValue::Secret(_))
    }

    /// Plain text content, secrets excluded
    pub fn as_text(&self) -> Option<&str> {
        match self {
            ParamValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Value as the provisioning tool expects it. Exposes secrets.
    pub fn to_json(&self) -> Value {
        match self {
            ParamValue::Text(s) => Value::String(s.clone()),
            ParamValue::Number(n) => number_to_json(*n),
            ParamValue::Bool(b) => Value::Bool(*b),
            ParamValue::Secret(s) => Value::String(s.expose_secret().to_string()),
        }
    }

    /// Value safe to persist or log
    pub fn to_redacted_json(&self) -> Value {
        match self {
            ParamValue::Secret(_) => Value::String(REDACTED.to_string()),
            other => other.to_json(),
        }
    }

    /// Rebuild a value from JSON, typed by the declared parameter type when known
    pub fn from_json(param_type: Option<ParamType>, value: &Value) -> Option<Self> {
        match (param_type, value) {
            (Some(ParamType::Secret), Value::String(s)) => Some(ParamValue::secret(s.clone())),
            (Some(ParamType::Number), Value::String(s)) => s.trim().parse().ok().map(ParamValue::Number),
            (_, Value::String(s)) => Some(ParamValue::Text(s.clone())),
            (_, Value::Number(n)) => n.as_f64().map(ParamValue::Number),
            (_, Value::Bool(b)) => Some(ParamValue::Bool(*b)),
            _ => None,
        }
    }
}

pub const REDACTED: &str = "********";

fn number_to_json(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        Value::from(n as i64)
    } else {
        serde_json::Number::from_f64(n)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}

impl Clone for ParamValue {
    fn clone(&self) -> Self {
        match self {
            ParamValue::Text(s) => ParamValue::Text(s.clone()),
            ParamValue::Number(n) => ParamValue::Number(*n),
            ParamValue::Bool(b) => ParamValue::Bool(*b),
            ParamValue::Secret(s) => ParamValue::secret(s.expose_secret().to_string()),
        }
    }
}

impl PartialEq for ParamValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (ParamValue::Text(a), ParamValue::Text(b)) => a == b,
            (ParamValue::Number(a), ParamValue::Number(b)) => a == b,
            (ParamValue::Bool(a), ParamValue::Bool(b)) => a == b,
            (ParamValue::Secret(a), ParamValue::Secret(b)) => a.expose_secret() == b.expose_secret(),
            _ => false,
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Text(s) => write!(f, "{}", s),
            ParamValue::Number(_) => write!(f, "{}", self.to_json()),
            ParamValue::Bool(b) => write!(f, "{}", b),
            ParamValue::Secret(_) => write!(f, "{}", REDACTED),
        }
    }
}

/// Parameter snapshot as stored in records and failure history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedParameter {
    pub name: String,
    pub value: Value,
    #[serde(default)]
    pub secret: bool,
}

/// Ordered name -> value map. Insertion order is preserved.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParameterSet {
    entries: Vec<(String, ParamValue)>,
}

impl ParameterSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace, keeping the original position on replace
    pub fn insert(&mut self, name: impl Into<String>, value: ParamValue) {
        let name = name.into();
        match self.entries.iter_mut().find(|(n, _)| *n == name) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((name, value)),
        }
    }

    pub fn with(mut self, name: impl Into<String>, value: ParamValue) -> Self {
        self.insert(name, value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        self.entries.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn remove(&mut self, name: &str) -> Option<ParamValue> {
        let index = self.entries.iter().position(|(n, _)| n == name)?;
        Some(self.entries.remove(index).1)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ParamValue)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v))
    }

    pub fn names(&self) -> Vec<String> {
        self.entries.iter().map(|(n, _)| n.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Variables file content for the provisioning tool. Exposes secrets.
    pub fn to_tfvars_json(&self) -> Value {
        let map = self
            .entries
            .iter()
            .map(|(n, v)| (n.clone(), v.to_json()))
            .collect::<serde_json::Map<_, _>>();
        Value::Object(map)
    }

    /// Snapshot with secrets redacted
    pub fn redacted(&self) -> Vec<RecordedParameter> {
        self.entries
            .iter()
            .map(|(n, v)| RecordedParameter {
                name: n.clone(),
                value: v.to_redacted_json(),
                secret: v.is_secret(),
            })
            .collect()
    }

    /// Stable digest of template id and values, independent of insertion order
    pub fn fingerprint(&self, template_id: &str) -> String {
        let mut pairs: Vec<(String, String)> = self
            .entries
            .iter()
            .map(|(n, v)| (n.clone(), v.to_json().to_string()))
            .collect();
        pairs.sort();

        let mut material = template_id.to_string();
        for (name, value) in pairs {
            material.push('\n');
            material.push_str(&name);
            material.push('=');
            material.push_str(&value);
        }
        sha256_hash(material.as_bytes())
    }

    /// Rebuild from a variables file, typing values by their definitions
    pub fn from_tfvars_json(value: &Value, definitions: &[ParameterDefinition]) -> Self {
        let mut set = ParameterSet::new();
        if let Value::Object(map) = value {
            for (name, raw) in map {
                let param_type = definitions
                    .iter()
                    .find(|d| &d.name == name)
                    .map(|d| d.param_type);
                if let Some(v) = ParamValue::from_json(param_type, raw) {
                    set.insert(name.clone(), v);
                }
            }
        }
        set
    }
}
