use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::{Captures, Regex};
use serde_json::{Map, Value};
use tracing::debug;

use super::{check_output, Engine, ExecRequest, Execution, Phase, Phases};
use crate::coerce::stringify;
use crate::docker::RunSpec;
use crate::error::Result;
use crate::models::{Action, Argument, Expansion, Format, Microservice};

lazy_static! {
    static ref PLACEHOLDER: Regex = Regex::new(r"\{\{\s*([A-Za-z0-9_-]+)\s*\}\}").unwrap();
}

// Keeps a container without a lifecycle command alive for `docker exec`.
const KEEP_ALIVE: [&str; 3] = ["tail", "-f", "/dev/null"];

/// Runs an action's command line inside a fresh container, then kills it.
pub struct FormatExec<'a> {
    microservice: &'a Microservice,
    action: &'a Action,
    format: &'a Format,
}

impl<'a> FormatExec<'a> {
    pub fn new(microservice: &'a Microservice, action: &'a Action, format: &'a Format) -> Self {
        Self {
            microservice,
            action,
            format,
        }
    }
}

#[async_trait]
impl<'a> Execution for FormatExec<'a> {
    fn start_text(&self) -> String {
        format!("Running action: `{}`", self.action.name)
    }

    fn success_text(&self, output: &Value) -> String {
        format!("Ran action: `{}` with output: {}", self.action.name, stringify(output))
    }

    async fn exec(&self, engine: &Engine, request: &ExecRequest, phases: &Phases) -> Result<Value> {
        phases.enter(Phase::Validating);
        let prepared = engine.validate(self.microservice, &self.action.arguments, request)?;

        phases.enter(Phase::Provisioning);
        let spec = match self.microservice.lifecycle {
            Some(_) => engine.lifecycle_spec(self.microservice, request, &prepared)?,
            None => RunSpec {
                image: request.image.clone(),
                env: prepared.environment.clone(),
                entrypoint: Some(KEEP_ALIVE[0].to_string()),
                args: KEEP_ALIVE[1..].iter().map(|s| s.to_string()).collect(),
                tty: true,
                ..Default::default()
            },
        };
        let (container, _) = engine.provision(spec, &[]).await?;

        phases.enter(Phase::Invoking);
        let argv = render_command(self.format, &self.action.arguments, &prepared.arguments);
        debug!(action = %self.action.name, ?argv, "running command in container");
        let result = match engine.runtime.exec(&container, &argv).await {
            Ok(stdout) => check_output(self.action.output.as_ref(), &stdout),
            Err(e) => Err(e),
        };
        engine.teardown(&container, true).await;
        result
    }
}

/// Expands the command tokens with the coerced argument values.
pub fn render_command(format: &Format, declared: &[Argument], args: &Map<String, Value>) -> Vec<String> {
    match format.expansion {
        Expansion::Template => format
            .command
            .iter()
            .filter_map(|token| {
                let rendered = PLACEHOLDER.replace_all(token, |caps: &Captures| {
                    args.get(&caps[1]).map(stringify).unwrap_or_default()
                });
                // a token that was only an unset placeholder disappears
                (!rendered.is_empty()).then(|| rendered.into_owned())
            })
            .collect(),
        Expansion::Flags => {
            let mut argv = format.command.clone();
            for arg in declared {
                if let Some(value) = args.get(&arg.name) {
                    argv.push(format!("--{}", arg.name));
                    argv.push(stringify(value));
                }
            }
            argv
        }
        Expansion::Json => {
            let mut argv = format.command.clone();
            if !args.is_empty() {
                argv.push(Value::Object(args.clone()).to_string());
            }
            argv
        }
    }
}
