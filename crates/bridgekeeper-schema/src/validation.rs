//! Declarative configuration validation. Only `required` and `not_empty`
//! reject an absent or empty value.

use crate::{FieldSpec, SchemaError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

/// Field name → error code.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ValidationErrors(pub BTreeMap<String, String>);

impl ValidationErrors {
    pub fn single(field: &str, code: &str) -> Self {
        let mut map = BTreeMap::new();
        map.insert(field.to_owned(), code.to_owned());
        Self(map)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, field: &str) -> Option<&str> {
        self.0.get(field).map(String::as_str)
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (field, code) in &self.0 {
            if !first {
                f.write_str(", ")?;
            }
            write!(f, "{field}: {code}")?;
            first = false;
        }
        Ok(())
    }
}

/// Checks an instance configuration against a type's field schema.
pub trait ConfigValidator: Send + Sync {
    /// `Err(SchemaError::Validation)` carries per-field codes; any other error
    /// means the schema itself could not be applied.
    fn validate(
        &self,
        fields: &[FieldSpec],
        configuration: &Map<String, Value>,
    ) -> Result<(), SchemaError>;
}

/// Built-in validator for the common rule set.
#[derive(Debug, Clone, Copy, Default)]
pub struct RuleValidator;

impl ConfigValidator for RuleValidator {
    fn validate(
        &self,
        fields: &[FieldSpec],
        configuration: &Map<String, Value>,
    ) -> Result<(), SchemaError> {
        let mut errors = BTreeMap::new();
        for field in fields {
            let value = configuration.get(&field.name).unwrap_or(&Value::Null);
            for rule in &field.validation {
                let (name, arg) = split_rule(rule)?;
                if let Some(code) = apply_rule(name, arg, value)? {
                    errors.insert(field.name.clone(), code.to_owned());
                    break;
                }
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(SchemaError::Validation(ValidationErrors(errors)))
        }
    }
}

fn split_rule(rule: &Value) -> Result<(&str, &Value), SchemaError> {
    match rule {
        Value::String(name) => Ok((name.as_str(), &Value::Null)),
        Value::Object(obj) if obj.len() == 1 => {
            let (name, arg) = obj.iter().next().ok_or_else(|| unknown(rule))?;
            Ok((name.as_str(), arg))
        }
        _ => Err(unknown(rule)),
    }
}

fn unknown(rule: &Value) -> SchemaError {
    SchemaError::UnknownRule(rule.to_string())
}

fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}

/// String form of a primitive; `None` for arrays and objects.
fn primitive_repr(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn is_integer_repr(s: &str) -> bool {
    let digits = s.strip_prefix('-').unwrap_or(s);
    !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit())
}

fn is_decimal_repr(s: &str) -> bool {
    let unsigned = s.strip_prefix('-').unwrap_or(s);
    match unsigned.split_once('.') {
        Some((int, frac)) => is_integer_repr(int) && is_integer_repr(frac) && !frac.starts_with('-'),
        None => is_integer_repr(unsigned),
    }
}

fn arg_usize(name: &str, arg: &Value) -> Result<usize, SchemaError> {
    let n = match arg {
        Value::Array(a) if a.len() == 1 => a[0].as_u64(),
        other => other.as_u64(),
    };
    n.map(|n| n as usize)
        .ok_or_else(|| SchemaError::UnknownRule(format!("{name}: {arg}")))
}

fn apply_rule(name: &str, arg: &Value, value: &Value) -> Result<Option<&'static str>, SchemaError> {
    match name {
        "required" => return Ok(is_empty_value(value).then_some("REQUIRED")),
        "not_empty" => {
            return Ok(matches!(value, Value::String(s) if s.is_empty()).then_some("CANNOT_BE_EMPTY"))
        }
        _ => {}
    }
    if is_empty_value(value) {
        // Validate the argument anyway so schema typos surface.
        return match name {
            "string" | "integer" | "positive_integer" | "decimal" | "one_of"
            | "number_between" => Ok(None),
            "min_length" | "max_length" => arg_usize(name, arg).map(|_| None),
            _ => Err(SchemaError::UnknownRule(name.to_owned())),
        };
    }
    let code = match name {
        "string" => primitive_repr(value).is_none().then_some("FORMAT_ERROR"),
        "integer" => match primitive_repr(value) {
            Some(s) if !matches!(value, Value::Bool(_)) && is_integer_repr(&s) => None,
            _ => Some("NOT_INTEGER"),
        },
        "positive_integer" => match primitive_repr(value) {
            Some(s)
                if !matches!(value, Value::Bool(_))
                    && is_integer_repr(&s)
                    && !s.starts_with('-')
                    && s.chars().any(|c| c != '0') =>
            {
                None
            }
            _ => Some("NOT_POSITIVE_INTEGER"),
        },
        "decimal" => match primitive_repr(value) {
            Some(s) if !matches!(value, Value::Bool(_)) && is_decimal_repr(&s) => None,
            _ => Some("NOT_DECIMAL"),
        },
        "min_length" => {
            let min = arg_usize(name, arg)?;
            match primitive_repr(value) {
                Some(s) if s.chars().count() < min => Some("TOO_SHORT"),
                Some(_) => None,
                None => Some("FORMAT_ERROR"),
            }
        }
        "max_length" => {
            let max = arg_usize(name, arg)?;
            match primitive_repr(value) {
                Some(s) if s.chars().count() > max => Some("TOO_LONG"),
                Some(_) => None,
                None => Some("FORMAT_ERROR"),
            }
        }
        "one_of" => {
            let allowed = match arg {
                Value::Array(a) if a.len() == 1 && a[0].is_array() => a[0].as_array(),
                Value::Array(a) => Some(a),
                _ => None,
            }
            .ok_or_else(|| SchemaError::UnknownRule(format!("one_of: {arg}")))?;
            let repr = primitive_repr(value);
            let hit = repr.is_some() && allowed.iter().any(|a| primitive_repr(a) == repr);
            (!hit).then_some("NOT_ALLOWED_VALUE")
        }
        "number_between" => {
            let bounds = arg
                .as_array()
                .filter(|a| a.len() == 2)
                .and_then(|a| Some((a[0].as_f64()?, a[1].as_f64()?)))
                .ok_or_else(|| SchemaError::UnknownRule(format!("number_between: {arg}")))?;
            match as_number(value) {
                None => Some("NOT_NUMBER"),
                Some(n) if n < bounds.0 => Some("TOO_LOW"),
                Some(n) if n > bounds.1 => Some("TOO_HIGH"),
                Some(_) => None,
            }
        }
        other => return Err(SchemaError::UnknownRule(other.to_owned())),
    };
    Ok(code)
}
