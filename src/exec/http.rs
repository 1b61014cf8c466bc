use async_trait::async_trait;
use serde_json::Value;

use super::{check_output, Engine, ExecRequest, Execution, Phase, Phases};
use crate::coerce::stringify;
use crate::error::{ExecError, Result};
use crate::http::build_request;
use crate::models::{Action, Http, Microservice};

/// Starts the lifecycle container, sends one request to it and stops it again.
pub struct HttpExec<'a> {
    microservice: &'a Microservice,
    action: &'a Action,
    http: &'a Http,
}

impl<'a> HttpExec<'a> {
    pub fn new(microservice: &'a Microservice, action: &'a Action, http: &'a Http) -> Self {
        Self {
            microservice,
            action,
            http,
        }
    }

    async fn call(&self, engine: &Engine, host_port: u16, prepared: &crate::validate::Prepared) -> Result<Value> {
        let request = build_request(self.http, host_port, &self.action.arguments, &prepared.arguments)?;
        let response = engine.retrier.send(&request).await?;
        check_output(self.action.output.as_ref(), &response.body)
    }
}

#[async_trait]
impl<'a> Execution for HttpExec<'a> {
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
        let spec = engine.lifecycle_spec(self.microservice, request, &prepared)?;
        let (container, ports) = engine.provision(spec, &[self.http.port]).await?;

        phases.enter(Phase::Invoking);
        let result = match ports.get(&self.http.port) {
            Some(&host_port) => self.call(engine, host_port, &prepared).await,
            None => Err(ExecError::Invocation(format!(
                "container port {} was not published",
                self.http.port
            ))),
        };
        engine.teardown(&container, false).await;
        result
    }
}
