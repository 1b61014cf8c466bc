//! Input validation: defaults, required checks and value constraints for
//! arguments and environment variables.

use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};

use crate::coerce::{coerce, coerce_arguments, stringify};
use crate::error::{ExecError, Result};
use crate::models::{Argument, Constraint, DataType, EnvironmentVariable};

/// Caller input after defaults, validation and coercion.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Prepared {
    pub arguments: Map<String, Value>,
    pub environment: BTreeMap<String, String>,
}

/// Runs every check that must pass before anything is provisioned.
pub fn prepare(
    declared_args: &[Argument],
    declared_env: &[EnvironmentVariable],
    raw_args: &HashMap<String, String>,
    raw_env: &HashMap<String, String>,
    os_env: impl Fn(&str) -> Option<String>,
) -> Result<Prepared> {
    let mut args = raw_args.clone();
    apply_argument_defaults(declared_args, &mut args);
    let environment = resolve_environment(declared_env, raw_env, os_env);

    check_required_arguments(declared_args, &args)?;
    check_required_environment(declared_env, &environment)?;

    let arguments = coerce_arguments(declared_args, &args)?;
    check_constraints(declared_args, &arguments)?;
    check_environment(declared_env, &environment)?;

    Ok(Prepared {
        arguments,
        environment,
    })
}

/// Fills in declared defaults for arguments the caller left out.
///
/// Defaults are stored in their string form so they go through the same
/// coercion as caller input.
pub fn apply_argument_defaults(declared: &[Argument], args: &mut HashMap<String, String>) {
    for arg in declared {
        if args.contains_key(&arg.name) {
            continue;
        }
        if let Some(default) = &arg.default {
            if !default.is_null() {
                args.insert(arg.name.clone(), stringify(default));
            }
        }
    }
}

/// Resolves environment variables: caller value, then a same-named variable
/// of the process environment, then the declared default.
pub fn resolve_environment(
    declared: &[EnvironmentVariable],
    supplied: &HashMap<String, String>,
    os_env: impl Fn(&str) -> Option<String>,
) -> BTreeMap<String, String> {
    let mut env: BTreeMap<String, String> = supplied.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    for var in declared {
        if env.contains_key(&var.name) {
            continue;
        }
        let value = os_env(&var.name).or_else(|| {
            var.default
                .as_ref()
                .filter(|d| !d.is_null())
                .map(stringify)
        });
        if let Some(value) = value {
            env.insert(var.name.clone(), value);
        }
    }
    env
}

/// An empty value only counts as supplied for string arguments.
pub fn check_required_arguments(declared: &[Argument], args: &HashMap<String, String>) -> Result<()> {
    let missing: Vec<String> = declared
        .iter()
        .filter(|a| a.required)
        .filter(|a| match args.get(&a.name) {
            None => true,
            Some(value) => value.is_empty() && a.ty != DataType::String,
        })
        .map(|a| a.name.clone())
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(ExecError::MissingArguments(missing))
    }
}

pub fn check_required_environment(
    declared: &[EnvironmentVariable],
    env: &BTreeMap<String, String>,
) -> Result<()> {
    let missing: Vec<String> = declared
        .iter()
        .filter(|v| v.required && !env.contains_key(&v.name))
        .map(|v| v.name.clone())
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(ExecError::MissingEnvironmentVariables(missing))
    }
}

/// Checks pattern, enum and range constraints of every present argument.
pub fn check_constraints(declared: &[Argument], args: &Map<String, Value>) -> Result<()> {
    for arg in declared {
        let (Some(value), Some(constraint)) = (args.get(&arg.name), arg.constraint()) else {
            continue;
        };
        let violated = |rule: String| ExecError::ConstraintViolation {
            name: arg.name.clone(),
            rule,
        };
        match constraint {
            Constraint::Pattern(pattern) => {
                if !matches_pattern(&arg.name, pattern, &stringify(value))? {
                    return Err(violated(format!("must match pattern `{}`", pattern)));
                }
            }
            Constraint::Enum(values) => {
                let rendered = stringify(value);
                if !values.iter().any(|v| v == value || stringify(v) == rendered) {
                    let allowed: Vec<String> = values.iter().map(stringify).collect();
                    return Err(violated(format!("must be one of: {}", allowed.join(", "))));
                }
            }
            Constraint::Range(range) => {
                if !value.as_f64().is_some_and(|v| range.contains(v)) {
                    return Err(violated(format!("must be within range {}", range)));
                }
            }
        }
    }
    Ok(())
}

/// Checks declared types and patterns of resolved environment variables.
pub fn check_environment(declared: &[EnvironmentVariable], env: &BTreeMap<String, String>) -> Result<()> {
    for var in declared {
        let Some(value) = env.get(&var.name) else {
            continue;
        };
        coerce(&var.name, var.ty, value)?;
        if let Some(pattern) = &var.pattern {
            if !matches_pattern(&var.name, pattern, value)? {
                return Err(ExecError::ConstraintViolation {
                    name: var.name.clone(),
                    rule: format!("must match pattern `{}`", pattern),
                });
            }
        }
    }
    Ok(())
}

fn matches_pattern(name: &str, pattern: &str, value: &str) -> Result<bool> {
    let re = regex::Regex::new(pattern).map_err(|e| ExecError::InvalidPattern {
        name: name.to_string(),
        detail: e.to_string(),
    })?;
    Ok(re.is_match(value))
}
