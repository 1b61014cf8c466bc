use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;

use crate::error::{ExecError, Result};

// ---- Microservice descriptor ----
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Microservice {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub actions: Vec<Action>,
    #[serde(default, alias = "environmentVariables")]
    pub environment: Vec<EnvironmentVariable>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lifecycle: Option<Lifecycle>,
}

impl Microservice {
    pub fn action(&self, name: &str) -> Result<&Action> {
        self.actions
            .iter()
            .find(|a| a.name == name)
            .ok_or_else(|| ExecError::Descriptor(format!("Action `{}` does not exist", name)))
    }

    pub fn event(&self, action: &str, event: &str) -> Result<&Event> {
        let owner = self.action(action)?;
        match &owner.interface {
            Interface::Events(events) => events.iter().find(|e| e.name == event).ok_or_else(|| {
                ExecError::Descriptor(format!(
                    "Event `{}` does not exist in action `{}`",
                    event, action
                ))
            }),
            _ => Err(ExecError::Descriptor(format!(
                "Action `{}` does not declare events",
                action
            ))),
        }
    }

    /// Distinct container ports that any event in the descriptor listens on.
    pub fn event_ports(&self) -> Vec<u16> {
        let ports: BTreeSet<u16> = self
            .actions
            .iter()
            .filter_map(|a| match &a.interface {
                Interface::Events(events) => Some(events),
                _ => None,
            })
            .flatten()
            .flat_map(|e| [e.subscribe.port, e.unsubscribe.port])
            .collect();
        ports.into_iter().collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub help: Option<String>,
    #[serde(default)]
    pub arguments: Vec<Argument>,
    #[serde(flatten)]
    pub interface: Interface,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Output>,
}

impl Action {
    pub fn argument(&self, name: &str) -> Option<&Argument> {
        self.arguments.iter().find(|a| a.name == name)
    }
}

/// How an action is invoked. Exactly one is declared per action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Interface {
    Format(Format),
    Http(Http),
    Events(Vec<Event>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Output {
    #[serde(rename = "type")]
    pub ty: DataType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    String,
    #[serde(alias = "integer")]
    Int,
    #[serde(alias = "number")]
    Float,
    #[serde(alias = "bool")]
    Boolean,
    #[serde(alias = "object")]
    Map,
    #[serde(alias = "array")]
    List,
    Any,
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataType::String => "string",
            DataType::Int => "int",
            DataType::Float => "float",
            DataType::Boolean => "boolean",
            DataType::Map => "map",
            DataType::List => "list",
            DataType::Any => "any",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Location {
    Query,
    Path,
    #[serde(alias = "requestBody")]
    Body,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Range {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
}

impl Range {
    pub fn contains(&self, v: f64) -> bool {
        self.min.map_or(true, |min| v >= min) && self.max.map_or(true, |max| v <= max)
    }
}

impl fmt::Display for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bound = |b: Option<f64>| b.map(|v| v.to_string()).unwrap_or_else(|| "*".into());
        write!(f, "[{}, {}]", bound(self.min), bound(self.max))
    }
}

/// The single value constraint an argument may carry.
#[derive(Debug, Clone, PartialEq)]
pub enum Constraint {
    Pattern(String),
    Enum(Vec<Value>),
    Range(Range),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawArgument", into = "RawArgument")]
pub struct Argument {
    pub name: String,
    pub ty: DataType,
    pub location: Option<Location>,
    pub required: bool,
    pub default: Option<Value>,
    pub help: Option<String>,
    constraint: Option<Constraint>,
}

impl Argument {
    pub fn new(name: impl Into<String>, ty: DataType) -> Self {
        Self {
            name: name.into(),
            ty,
            location: None,
            required: false,
            default: None,
            help: None,
            constraint: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn located(mut self, location: Location) -> Self {
        self.location = Some(location);
        self
    }

    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }

    pub fn with_pattern(self, pattern: impl Into<String>) -> Result<Self> {
        let pattern = pattern.into();
        regex::Regex::new(&pattern).map_err(|e| ExecError::InvalidPattern {
            name: self.name.clone(),
            detail: e.to_string(),
        })?;
        self.constrained(Constraint::Pattern(pattern))
    }

    pub fn with_enum(self, values: Vec<Value>) -> Result<Self> {
        self.constrained(Constraint::Enum(values))
    }

    pub fn with_range(self, range: Range) -> Result<Self> {
        self.constrained(Constraint::Range(range))
    }

    fn constrained(mut self, constraint: Constraint) -> Result<Self> {
        if self.constraint.is_some() {
            return Err(ExecError::ConflictingConstraints(self.name));
        }
        self.constraint = Some(constraint);
        Ok(self)
    }

    pub fn constraint(&self) -> Option<&Constraint> {
        self.constraint.as_ref()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawArgument {
    name: String,
    #[serde(rename = "type")]
    ty: DataType,
    #[serde(default, alias = "in", skip_serializing_if = "Option::is_none")]
    location: Option<Location>,
    #[serde(default)]
    required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    default: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    help: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pattern: Option<String>,
    #[serde(default, rename = "enum", skip_serializing_if = "Option::is_none")]
    enum_: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    range: Option<Range>,
}

impl TryFrom<RawArgument> for Argument {
    type Error = ExecError;

    fn try_from(raw: RawArgument) -> Result<Self> {
        let mut arg = Argument::new(raw.name, raw.ty);
        arg.location = raw.location;
        arg.required = raw.required;
        arg.default = raw.default;
        arg.help = raw.help;
        if let Some(p) = raw.pattern {
            arg = arg.with_pattern(p)?;
        }
        if let Some(values) = raw.enum_ {
            arg = arg.with_enum(values)?;
        }
        if let Some(range) = raw.range {
            arg = arg.with_range(range)?;
        }
        Ok(arg)
    }
}

impl From<Argument> for RawArgument {
    fn from(arg: Argument) -> Self {
        let (pattern, enum_, range) = match arg.constraint {
            Some(Constraint::Pattern(p)) => (Some(p), None, None),
            Some(Constraint::Enum(v)) => (None, Some(v), None),
            Some(Constraint::Range(r)) => (None, None, Some(r)),
            None => (None, None, None),
        };
        RawArgument {
            name: arg.name,
            ty: arg.ty,
            location: arg.location,
            required: arg.required,
            default: arg.default,
            help: arg.help,
            pattern,
            enum_,
            range,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentVariable {
    pub name: String,
    #[serde(rename = "type", default = "default_env_type")]
    pub ty: DataType,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub help: Option<String>,
}

fn default_env_type() -> DataType {
    DataType::String
}

impl EnvironmentVariable {
    pub fn new(name: impl Into<String>, ty: DataType) -> Self {
        Self {
            name: name.into(),
            ty,
            required: false,
            default: None,
            pattern: None,
            help: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Http {
    pub method: Method,
    /// Endpoint template; `{{name}}` marks a path argument.
    #[serde(alias = "endpoint")]
    pub path: String,
    /// Port the container listens on.
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub name: String,
    #[serde(default)]
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub help: Option<String>,
    #[serde(default)]
    pub arguments: Vec<Argument>,
    pub subscribe: Http,
    pub unsubscribe: Http,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Expansion {
    /// `{{name}}` placeholders in the command tokens.
    #[default]
    Template,
    /// `--name value` appended per argument.
    Flags,
    /// All arguments appended as one JSON object.
    Json,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Format {
    #[serde(deserialize_with = "tokens")]
    pub command: Vec<String>,
    #[serde(default)]
    pub expansion: Expansion,
}

impl Format {
    pub fn new(command: &str, expansion: Expansion) -> Self {
        Self {
            command: command.split_whitespace().map(str::to_string).collect(),
            expansion,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lifecycle {
    pub startup: Startup,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Startup {
    pub command: String,
    #[serde(default, deserialize_with = "tokens")]
    pub args: Vec<String>,
}

/// Accepts either a whitespace separated line or a token list.
fn tokens<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Tokens {
        Line(String),
        List(Vec<String>),
    }

    Ok(match Tokens::deserialize(deserializer)? {
        Tokens::Line(line) => line.split_whitespace().map(str::to_string).collect(),
        Tokens::List(list) => list,
    })
}
