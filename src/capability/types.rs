//! Parameter kinds, client-visible type descriptors and argument coercion
//!
//! Each capability parameter has one of a small closed set of semantic kinds.
//! [`coerce`] turns a JSON argument supplied by the client into an
//! [`ArgValue`] of the declared kind, or explains why it cannot.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Semantic kind of a parameter or return value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamKind {
    Integer,
    Float,
    Bool,
    String,
    /// Named enumeration; arguments are matched by option name
    Enum { name: String, options: Vec<String> },
    /// Passed through verbatim
    Any,
    /// A host type the client cannot represent. Carries the host type name.
    Unsupported(String),
}

impl ParamKind {
    /// Convenience constructor for enum kinds
    pub fn enumeration<I, S>(name: impl Into<String>, options: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ParamKind::Enum {
            name: name.into(),
            options: options.into_iter().map(Into::into).collect(),
        }
    }

    /// Type name in the client's vocabulary, or None when unrepresentable
    pub fn type_name(&self) -> Option<&str> {
        match self {
            ParamKind::Integer => Some("Int32"),
            ParamKind::Float => Some("Single"),
            ParamKind::Bool => Some("Boolean"),
            ParamKind::String => Some("String"),
            ParamKind::Any => Some("Object"),
            ParamKind::Enum { name, .. } => Some(name.as_str()),
            ParamKind::Unsupported(_) => None,
        }
    }

    pub fn is_supported(&self) -> bool {
        !matches!(self, ParamKind::Unsupported(_))
    }

    /// Human-readable name for log messages
    pub fn display_name(&self) -> &str {
        match self {
            ParamKind::Unsupported(host_name) => host_name.as_str(),
            other => other.type_name().unwrap_or("unknown"),
        }
    }

    pub fn descriptor(&self) -> TypeDescriptor {
        match self {
            ParamKind::Enum { name, options } => TypeDescriptor {
                type_name: Some(name.clone()),
                is_enum: true,
                options: Some(options.clone()),
            },
            other => TypeDescriptor {
                type_name: other.type_name().map(str::to_string),
                is_enum: false,
                options: None,
            },
        }
    }
}

/// Client-visible type descriptor: `{type, isEnum, options}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeDescriptor {
    #[serde(rename = "type")]
    pub type_name: Option<String>,
    #[serde(rename = "isEnum")]
    pub is_enum: bool,
    pub options: Option<Vec<String>>,
}

/// An argument converted to its declared kind
#[derive(Debug, Clone, PartialEq)]
pub enum ArgValue {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
    Enum { index: usize, name: String },
    Any(JsonValue),
}

impl ArgValue {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            ArgValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Floats, and integers widened to float
    pub fn as_float(&self) -> Option<f64> {
        match self {
            ArgValue::Float(v) => Some(*v),
            ArgValue::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ArgValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ArgValue::Str(v) => Some(v),
            ArgValue::Enum { name, .. } => Some(name),
            _ => None,
        }
    }

    pub fn enum_index(&self) -> Option<usize> {
        match self {
            ArgValue::Enum { index, .. } => Some(*index),
            _ => None,
        }
    }

    pub fn as_json(&self) -> JsonValue {
        match self {
            ArgValue::Int(v) => JsonValue::from(*v),
            ArgValue::Float(v) => JsonValue::from(*v),
            ArgValue::Bool(v) => JsonValue::from(*v),
            ArgValue::Str(v) => JsonValue::from(v.as_str()),
            ArgValue::Enum { name, .. } => JsonValue::from(name.as_str()),
            ArgValue::Any(v) => v.clone(),
        }
    }
}

/// Errors that can occur while converting an argument
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum CoercionError {
    #[error("null cannot be converted to {expected}")]
    Null { expected: String },

    #[error("cannot convert {found} to {expected}")]
    TypeMismatch { expected: String, found: String },

    #[error("'{value}' is not an option of enum {enum_name}")]
    UnknownEnumOption { enum_name: String, value: String },

    #[error("{value} is out of range for {expected}")]
    OutOfRange { expected: String, value: String },

    #[error("parameter type {0} is not supported")]
    UnsupportedType(String),
}

fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "bool",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

fn mismatch(kind: &ParamKind, value: &JsonValue) -> CoercionError {
    CoercionError::TypeMismatch {
        expected: kind.display_name().to_string(),
        found: json_kind(value).to_string(),
    }
}

fn float_to_int(kind: &ParamKind, f: f64) -> Result<i64, CoercionError> {
    let rounded = f.round();
    if rounded.is_finite() && rounded >= i64::MIN as f64 && rounded <= i64::MAX as f64 {
        Ok(rounded as i64)
    } else {
        Err(CoercionError::OutOfRange {
            expected: kind.display_name().to_string(),
            value: f.to_string(),
        })
    }
}

fn coerce_wide_int(kind: &ParamKind, value: &JsonValue) -> Result<i64, CoercionError> {
    match value {
        JsonValue::Null => Ok(0),
        JsonValue::Bool(b) => Ok(i64::from(*b)),
        JsonValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(i)
            } else if let Some(u) = n.as_u64() {
                Err(CoercionError::OutOfRange {
                    expected: kind.display_name().to_string(),
                    value: u.to_string(),
                })
            } else {
                float_to_int(kind, n.as_f64().unwrap_or(f64::NAN))
            }
        }
        JsonValue::String(s) => s.trim().parse::<i64>().map_err(|_| mismatch(kind, value)),
        _ => Err(mismatch(kind, value)),
    }
}

/// Integers travel as `Int32`; anything wider is out of range
fn coerce_int(kind: &ParamKind, value: &JsonValue) -> Result<i64, CoercionError> {
    let wide = coerce_wide_int(kind, value)?;
    match i32::try_from(wide) {
        Ok(narrow) => Ok(i64::from(narrow)),
        Err(_) => Err(CoercionError::OutOfRange {
            expected: kind.display_name().to_string(),
            value: wide.to_string(),
        }),
    }
}

fn coerce_float(kind: &ParamKind, value: &JsonValue) -> Result<f64, CoercionError> {
    match value {
        JsonValue::Null => Ok(0.0),
        JsonValue::Bool(b) => Ok(if *b { 1.0 } else { 0.0 }),
        JsonValue::Number(n) => n.as_f64().ok_or_else(|| mismatch(kind, value)),
        JsonValue::String(s) => s
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|f| f.is_finite())
            .ok_or_else(|| mismatch(kind, value)),
        _ => Err(mismatch(kind, value)),
    }
}

fn coerce_bool(kind: &ParamKind, value: &JsonValue) -> Result<bool, CoercionError> {
    match value {
        JsonValue::Null => Ok(false),
        JsonValue::Bool(b) => Ok(*b),
        JsonValue::Number(n) => Ok(n.as_f64().map(|f| f != 0.0).unwrap_or(false)),
        JsonValue::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" => Ok(true),
            "false" => Ok(false),
            _ => Err(mismatch(kind, value)),
        },
        _ => Err(mismatch(kind, value)),
    }
}

/// `null` arrives as the empty string
fn coerce_string(kind: &ParamKind, value: &JsonValue) -> Result<String, CoercionError> {
    match value {
        JsonValue::String(s) => Ok(s.clone()),
        JsonValue::Number(n) => Ok(n.to_string()),
        JsonValue::Bool(b) => Ok(b.to_string()),
        JsonValue::Null => Ok(String::new()),
        _ => Err(mismatch(kind, value)),
    }
}

fn coerce_enum(name: &str, options: &[String], value: &JsonValue) -> Result<ArgValue, CoercionError> {
    let by_index = |index: i64| -> Result<ArgValue, CoercionError> {
        usize::try_from(index)
            .ok()
            .and_then(|i| options.get(i).map(|option| (i, option)))
            .map(|(index, option)| ArgValue::Enum {
                index,
                name: option.clone(),
            })
            .ok_or_else(|| CoercionError::OutOfRange {
                expected: name.to_string(),
                value: index.to_string(),
            })
    };

    match value {
        JsonValue::String(s) => {
            if let Some(index) = options.iter().position(|o| o == s) {
                return Ok(ArgValue::Enum {
                    index,
                    name: s.clone(),
                });
            }
            match s.trim().parse::<i64>() {
                Ok(index) => by_index(index),
                Err(_) => Err(CoercionError::UnknownEnumOption {
                    enum_name: name.to_string(),
                    value: s.clone(),
                }),
            }
        }
        JsonValue::Number(n) => match n.as_i64() {
            Some(index) => by_index(index),
            None => Err(CoercionError::OutOfRange {
                expected: name.to_string(),
                value: n.to_string(),
            }),
        },
        JsonValue::Null => Err(CoercionError::Null {
            expected: name.to_string(),
        }),
        other => Err(CoercionError::TypeMismatch {
            expected: name.to_string(),
            found: json_kind(other).to_string(),
        }),
    }
}

/// Convert a client-supplied JSON argument to the declared parameter kind.
///
/// Pure: no capability lookup or invocation is involved.
pub fn coerce(kind: &ParamKind, value: &JsonValue) -> Result<ArgValue, CoercionError> {
    match kind {
        ParamKind::Integer => coerce_int(kind, value).map(ArgValue::Int),
        ParamKind::Float => coerce_float(kind, value).map(ArgValue::Float),
        ParamKind::Bool => coerce_bool(kind, value).map(ArgValue::Bool),
        ParamKind::String => coerce_string(kind, value).map(ArgValue::Str),
        ParamKind::Enum { name, options } => coerce_enum(name, options, value),
        ParamKind::Any => Ok(ArgValue::Any(value.clone())),
        ParamKind::Unsupported(host_name) => Err(CoercionError::UnsupportedType(host_name.clone())),
    }
}
