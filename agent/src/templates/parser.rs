//! Extraction of variables and declared resources from template source

use std::sync::LazyLock;

use regex::Regex;

use crate::errors::AgentError;
use crate::models::parameter::{ParamType, ParamValue, ParameterDefinition};
use crate::templates::Template;

static VARIABLE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?m)^[ \t]*variable[ \t]+"([A-Za-z_][A-Za-z0-9_-]*)"[ \t]*\{"#)
        .expect("variable regex")
});
static RESOURCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?m)^[ \t]*resource[ \t]+"([A-Za-z0-9_-]+)"[ \t]+"([A-Za-z0-9_-]+)"[ \t]*\{"#)
        .expect("resource regex")
});
static MODULE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?m)^[ \t]*module[ \t]+"([A-Za-z0-9_-]+)"[ \t]*\{"#).expect("module regex")
});
static TYPE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^[ \t]*type[ \t]*=[ \t]*([a-z]+)").expect("type regex"));
static DEFAULT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^[ \t]*default[ \t]*=[ \t]*(.+?)[ \t]*$").expect("default regex")
});
static DESCRIPTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?m)^[ \t]*description[ \t]*=[ \t]*"((?:[^"\\]|\\.)*)""#)
        .expect("description regex")
});
static SENSITIVE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^[ \t]*sensitive[ \t]*=[ \t]*true\b").expect("sensitive regex")
});
static NOT_NULLABLE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^[ \t]*nullable[ \t]*=[ \t]*false\b").expect("nullable regex")
});

/// Parse a template's variables and declared resource addresses
pub fn parse_template(id: &str, content: &str) -> Result<Template, AgentError> {
    check_balanced(content)?;

    let mut parameters = Vec::new();
    for (index, caps) in VARIABLE_RE.captures_iter(content).enumerate() {
        let name = &caps[1];
        let open = caps.get(0).map(|m| m.end() - 1).unwrap_or(0);
        let body = block_body(content, open).ok_or_else(|| {
            AgentError::ConfigError(format!("template {}: unterminated variable \"{}\"", id, name))
        })?;
        if let Some(definition) = parse_variable(id, name, body, index as u32)? {
            parameters.push(definition);
        }
    }

    let mut resources: Vec<String> = RESOURCE_RE
        .captures_iter(content)
        .map(|caps| format!("{}.{}", &caps[1], &caps[2]))
        .collect();
    resources.extend(
        MODULE_RE
            .captures_iter(content)
            .map(|caps| format!("module.{}", &caps[1])),
    );

    Ok(Template {
        id: id.to_string(),
        content: content.to_string(),
        parameters,
        resources,
    })
}

enum DefaultLiteral {
    Text(String),
    Number(f64),
    Bool(bool),
    Complex,
}

fn parse_variable(
    template_id: &str,
    name: &str,
    body: &str,
    order: u32,
) -> Result<Option<ParameterDefinition>, AgentError> {
    let config_err =
        |msg: String| AgentError::ConfigError(format!("template {}: variable \"{}\": {}", template_id, name, msg));

    let declared_type = TYPE_RE.captures(body).map(|c| c[1].to_string());
    let default = match DEFAULT_RE.captures(body) {
        Some(caps) => parse_default(&caps[1]),
        None => None,
    };
    let description = DESCRIPTION_RE.captures(body).map(|c| unescape(&c[1]));
    let sensitive = SENSITIVE_RE.is_match(body);
    let not_nullable = NOT_NULLABLE_RE.is_match(body);
    let allowed_values = allowed_values(body, name);
    let validation_pattern = validation_pattern(body, name);

    let param_type = match declared_type.as_deref() {
        Some("string") | None => match &default {
            Some(DefaultLiteral::Number(_)) if declared_type.is_none() => ParamType::Number,
            Some(DefaultLiteral::Bool(_)) if declared_type.is_none() => ParamType::Boolean,
            _ if sensitive => ParamType::Secret,
            _ if allowed_values.is_some() => ParamType::Choice,
            _ => ParamType::String,
        },
        Some("number") => ParamType::Number,
        Some("bool") => ParamType::Boolean,
        Some(other) => {
            // Structured types are left to the tool when defaulted
            if default.is_some() {
                return Ok(None);
            }
            return Err(config_err(format!("unsupported type '{}' without default", other)));
        }
    };

    if matches!(default, Some(DefaultLiteral::Complex)) {
        return Err(config_err("structured default on a scalar variable".to_string()));
    }

    let default_value = match default {
        None => None,
        Some(literal) => Some(coerce_default(param_type, literal).map_err(config_err)?),
    };

    if let (Some(allowed), Some(ParamValue::Text(value))) = (&allowed_values, &default_value) {
        if !allowed.iter().any(|a| a.eq_ignore_ascii_case(value)) {
            return Err(config_err(format!("default '{}' is not an allowed value", value)));
        }
    }
    if let Some(pattern) = &validation_pattern {
        Regex::new(pattern).map_err(|e| config_err(format!("invalid validation regex: {}", e)))?;
    }

    Ok(Some(ParameterDefinition {
        name: name.to_string(),
        param_type,
        required: default_value.is_none() || not_nullable,
        default_value,
        allowed_values,
        validation_pattern,
        description,
        order,
    }))
}

fn parse_default(raw: &str) -> Option<DefaultLiteral> {
    let raw = strip_line_comment(raw).trim();
    if raw == "null" {
        return None;
    }
    if raw.starts_with('"') {
        let inner = raw.trim_start_matches('"');
        let end = find_closing_quote(inner).unwrap_or(inner.len());
        return Some(DefaultLiteral::Text(unescape(&inner[..end])));
    }
    if raw.starts_with('[') || raw.starts_with('{') {
        return Some(DefaultLiteral::Complex);
    }
    match raw {
        "true" => Some(DefaultLiteral::Bool(true)),
        "false" => Some(DefaultLiteral::Bool(false)),
        _ => Some(
            raw.parse::<f64>()
                .map(DefaultLiteral::Number)
                .unwrap_or_else(|_| DefaultLiteral::Text(raw.to_string())),
        ),
    }
}

fn coerce_default(param_type: ParamType, literal: DefaultLiteral) -> Result<ParamValue, String> {
    match (param_type, literal) {
        (ParamType::Number, DefaultLiteral::Number(n)) => Ok(ParamValue::Number(n)),
        (ParamType::Number, DefaultLiteral::Text(s)) => s
            .trim()
            .parse()
            .map(ParamValue::Number)
            .map_err(|_| format!("default '{}' is not a number", s)),
        (ParamType::Boolean, DefaultLiteral::Bool(b)) => Ok(ParamValue::Bool(b)),
        (ParamType::Boolean, DefaultLiteral::Text(s)) => match s.as_str() {
            "true" => Ok(ParamValue::Bool(true)),
            "false" => Ok(ParamValue::Bool(false)),
            _ => Err(format!("default '{}' is not a boolean", s)),
        },
        (ParamType::Secret, DefaultLiteral::Text(s)) => Ok(ParamValue::secret(s)),
        (_, DefaultLiteral::Text(s)) => Ok(ParamValue::Text(s)),
        (_, DefaultLiteral::Number(n)) => Ok(ParamValue::Text(ParamValue::Number(n).to_string())),
        (_, DefaultLiteral::Bool(b)) => Ok(ParamValue::Text(b.to_string())),
        (_, DefaultLiteral::Complex) => Err("structured default".to_string()),
    }
}

fn allowed_values(body: &str, name: &str) -> Option<Vec<String>> {
    let pattern = format!(
        r"contains\(\s*\[([^\]]*)\]\s*,\s*var\.{}\s*\)",
        regex::escape(name)
    );
    let re = Regex::new(&pattern).ok()?;
    let caps = re.captures(body)?;
    let values: Vec<String> = caps[1]
        .split(',')
        .map(|v| v.trim().trim_matches('"').to_string())
        .filter(|v| !v.is_empty())
        .collect();
    if values.is_empty() {
        None
    } else {
        Some(values)
    }
}

fn validation_pattern(body: &str, name: &str) -> Option<String> {
    let pattern = format!(
        r#"can\(\s*regex\(\s*"((?:[^"\\]|\\.)*)"\s*,\s*var\.{}\s*\)\s*\)"#,
        regex::escape(name)
    );
    let re = Regex::new(&pattern).ok()?;
    re.captures(body).map(|caps| unescape(&caps[1]))
}

fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some('n') => out.push('\n'),
                Some('t') => out.push('\t'),
                Some(other) => out.push(other),
                None => out.push('\\'),
            }
        } else {
            out.push(c);
        }
    }
    out
}

fn find_closing_quote(s: &str) -> Option<usize> {
    let mut escaped = false;
    for (i, c) in s.char_indices() {
        match c {
            '\\' if !escaped => escaped = true,
            '"' if !escaped => return Some(i),
            _ => escaped = false,
        }
    }
    None
}

fn strip_line_comment(s: &str) -> &str {
    let mut in_string = false;
    let mut escaped = false;
    let bytes = s.as_bytes();
    for (i, &b) in bytes.iter().enumerate() {
        match b {
            b'\\' if in_string && !escaped => {
                escaped = true;
                continue;
            }
            b'"' if !escaped => in_string = !in_string,
            b'#' if !in_string => return &s[..i],
            b'/' if !in_string && bytes.get(i + 1) == Some(&b'/') => return &s[..i],
            _ => {}
        }
        escaped = false;
    }
    s
}

/// Walk the source outside strings and comments, calling `on_brace` with
/// (byte offset, depth after the brace).
fn walk_braces(content: &str, mut on_brace: impl FnMut(usize, i64) -> bool) -> i64 {
    let bytes = content.as_bytes();
    let mut depth: i64 = 0;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'"' => {
                i += 1;
                while i < bytes.len() && bytes[i] != b'"' {
                    if bytes[i] == b'\\' {
                        i += 1;
                    }
                    i += 1;
                }
            }
            b'#' => {
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
            }
            b'/' if bytes.get(i + 1) == Some(&b'/') => {
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                i += 2;
                while i + 1 < bytes.len() && !(bytes[i] == b'*' && bytes[i + 1] == b'/') {
                    i += 1;
                }
                i += 1;
            }
            b'{' => {
                depth += 1;
                if !on_brace(i, depth) {
                    return depth;
                }
            }
            b'}' => {
                depth -= 1;
                if !on_brace(i, depth) {
                    return depth;
                }
            }
            _ => {}
        }
        i += 1;
    }
    depth
}

fn check_balanced(content: &str) -> Result<(), AgentError> {
    let mut negative = false;
    let depth = walk_braces(content, |_, depth| {
        negative = depth < 0;
        !negative
    });
    if negative || depth != 0 {
        return Err(AgentError::ConfigError(
            "template has unbalanced braces".to_string(),
        ));
    }
    Ok(())
}

/// Body between the brace at `open` and its matching close
fn block_body(content: &str, open: usize) -> Option<&str> {
    let rest = &content[open..];
    let mut close = None;
    walk_braces(rest, |offset, depth| {
        if depth == 0 {
            close = Some(offset);
            false
        } else {
            true
        }
    });
    close.map(|end| &rest[1..end])
}
