//! Casting of string-typed caller input into declared types.
//!
//! Everything arrives from the command line as a string; each declared
//! [`DataType`] has exactly one cast, chosen by an exhaustive match.

use serde_json::{Map, Value};
use std::collections::HashMap;

use crate::error::{ExecError, Result};
use crate::models::{Argument, DataType};

/// Casts one raw value to `ty`.
pub fn coerce(name: &str, ty: DataType, raw: &str) -> Result<Value> {
    let fail = || ExecError::Coercion {
        name: name.to_string(),
        value: raw.to_string(),
        ty: ty.to_string(),
    };
    let trimmed = raw.trim();
    match ty {
        DataType::String => Ok(Value::String(raw.to_string())),
        DataType::Int => trimmed.parse::<i64>().map(Value::from).map_err(|_| fail()),
        DataType::Float => trimmed
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .ok_or_else(fail),
        DataType::Boolean => match trimmed.to_ascii_lowercase().as_str() {
            "true" => Ok(Value::Bool(true)),
            "false" => Ok(Value::Bool(false)),
            _ => Err(fail()),
        },
        DataType::Map => match serde_json::from_str(trimmed) {
            Ok(v @ Value::Object(_)) => Ok(v),
            _ => Err(fail()),
        },
        DataType::List => match serde_json::from_str(trimmed) {
            Ok(v @ Value::Array(_)) => Ok(v),
            _ => Err(fail()),
        },
        DataType::Any => Ok(serde_json::from_str(trimmed).unwrap_or_else(|_| Value::String(raw.to_string()))),
    }
}

/// Casts every supplied argument to the type its declaration names.
///
/// Keys the action does not declare are rejected.
pub fn coerce_arguments(declared: &[Argument], raw: &HashMap<String, String>) -> Result<Map<String, Value>> {
    let mut typed = Map::new();
    // declaration order first, so flag expansion stays stable
    for arg in declared {
        if let Some(value) = raw.get(&arg.name) {
            typed.insert(arg.name.clone(), coerce(&arg.name, arg.ty, value)?);
        }
    }
    let mut unknown: Vec<&String> = raw.keys().filter(|k| !typed.contains_key(*k)).collect();
    unknown.sort();
    if let Some(name) = unknown.first() {
        return Err(ExecError::UnknownArgument((*name).clone()));
    }
    Ok(typed)
}

/// String form of a value as it is substituted into commands and URLs.
pub fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
