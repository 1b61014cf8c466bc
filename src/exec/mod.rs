//! Execution strategies: turning a validated action into a running container
//! and a concrete invocation.
//!
//! Every strategy walks `Idle -> Validating -> Provisioning -> Invoking` and
//! ends in `Completed` or `Failed`. The validation, provisioning and output
//! helpers below are shared by the three variants.

pub mod event;
pub mod format;
pub mod http;

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::coerce::coerce;
use crate::config::EngineConfig;
use crate::docker::{short_id, ContainerRuntime, DockerCli, PortMapping, RunSpec};
use crate::error::{ExecError, Failure, Result};
use crate::http::{ReqwestTransport, RequestRetrier, RetryPolicy, Transport};
use crate::models::{Argument, DataType, Interface, Microservice, Output};
use crate::ports::PortAllocator;
use crate::reporter::{ConsoleReporter, Reporter};
use crate::state::{ContainerRecord, StateStore};
use crate::validate::{prepare, Prepared};

pub use event::{Direction, EventExec};
pub use format::FormatExec;
pub use http::HttpExec;

/// What the caller asked to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invocation {
    Action(String),
    Subscribe { action: String, event: String },
    Unsubscribe { action: String, event: String },
}

impl Invocation {
    fn subject(&self) -> String {
        match self {
            Invocation::Action(name) => format!("action: `{}`", name),
            Invocation::Subscribe { event, .. } => format!("subscribing to event: `{}`", event),
            Invocation::Unsubscribe { event, .. } => format!("unsubscribing from event: `{}`", event),
        }
    }
}

/// Caller input for one invocation, as it arrives from the command line.
#[derive(Debug, Clone, Default)]
pub struct ExecRequest {
    pub image: String,
    pub arguments: HashMap<String, String>,
    pub environment: HashMap<String, String>,
    /// Absolute working directory; keys the persisted subscription record.
    pub cwd: String,
    /// Where the container should deliver events, for subscriptions.
    pub callback: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Validating,
    Provisioning,
    Invoking,
    Completed,
    Failed,
}

/// Records the phases one invocation went through.
#[derive(Debug)]
pub struct Phases {
    subject: String,
    seen: Mutex<Vec<Phase>>,
}

impl Phases {
    pub fn new(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            seen: Mutex::new(vec![Phase::Idle]),
        }
    }

    pub fn enter(&self, phase: Phase) {
        debug!(subject = %self.subject, ?phase, "entering phase");
        if let Ok(mut seen) = self.seen.lock() {
            seen.push(phase);
        }
    }

    pub fn history(&self) -> Vec<Phase> {
        self.seen.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

#[async_trait]
pub trait Execution: Send + Sync {
    /// Progress line shown when the invocation starts.
    fn start_text(&self) -> String;
    fn success_text(&self, output: &Value) -> String;
    async fn exec(&self, engine: &Engine, request: &ExecRequest, phases: &Phases) -> Result<Value>;
}

/// Picks the strategy matching the interface the invoked command declares.
pub fn strategy<'a>(ms: &'a Microservice, invocation: &Invocation) -> Result<Box<dyn Execution + 'a>> {
    match invocation {
        Invocation::Action(name) => {
            let action = ms.action(name)?;
            match &action.interface {
                Interface::Format(format) => Ok(Box::new(FormatExec::new(ms, action, format))),
                Interface::Http(http) => Ok(Box::new(HttpExec::new(ms, action, http))),
                Interface::Events(_) => Err(ExecError::Descriptor(format!(
                    "Action `{}` only declares events; subscribe to one of them instead",
                    name
                ))),
            }
        }
        Invocation::Subscribe { action, event } => Ok(Box::new(EventExec::new(
            ms,
            ms.event(action, event)?,
            Direction::Subscribe,
        ))),
        Invocation::Unsubscribe { action, event } => Ok(Box::new(EventExec::new(
            ms,
            ms.event(action, event)?,
            Direction::Unsubscribe,
        ))),
    }
}

/// The collaborators every strategy runs against.
pub struct Engine {
    runtime: Arc<dyn ContainerRuntime>,
    retrier: RequestRetrier,
    ports: PortAllocator,
    state: StateStore,
    reporter: Arc<dyn Reporter>,
    config: EngineConfig,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        runtime: Arc<dyn ContainerRuntime>,
        transport: Arc<dyn Transport>,
        reporter: Arc<dyn Reporter>,
    ) -> Self {
        Self {
            runtime,
            retrier: RequestRetrier::new(transport, RetryPolicy::from_config(&config)),
            ports: PortAllocator::default(),
            state: StateStore::new(config.state_file.clone()),
            reporter,
            config,
        }
    }

    /// Docker CLI, reqwest and console output.
    pub fn from_config(config: EngineConfig) -> Self {
        let runtime = Arc::new(DockerCli::new(config.docker_binary.clone()));
        Self::new(
            config,
            runtime,
            Arc::new(ReqwestTransport::default()),
            Arc::new(ConsoleReporter::default()),
        )
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn Reporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn with_ports(mut self, ports: PortAllocator) -> Self {
        self.ports = ports;
        self
    }

    pub fn state(&self) -> &StateStore {
        &self.state
    }

    /// Runs one invocation and returns its typed output.
    pub async fn run(
        &self,
        ms: &Microservice,
        invocation: &Invocation,
        request: ExecRequest,
    ) -> std::result::Result<Value, Failure> {
        let phases = Phases::new(invocation.subject());
        self.run_tracked(ms, invocation, &request, &phases).await
    }

    pub(crate) async fn run_tracked(
        &self,
        ms: &Microservice,
        invocation: &Invocation,
        request: &ExecRequest,
        phases: &Phases,
    ) -> std::result::Result<Value, Failure> {
        let strategy = strategy(ms, invocation).map_err(|e| Failure::new(invocation.subject(), e))?;
        self.reporter.start(&strategy.start_text());
        match strategy.exec(self, request, phases).await {
            Ok(output) => {
                phases.enter(Phase::Completed);
                self.reporter.succeed(&strategy.success_text(&output));
                Ok(output)
            }
            Err(e) => {
                phases.enter(Phase::Failed);
                let failure = Failure::new(invocation.subject(), e);
                self.reporter.fail(&failure.to_string());
                Err(failure)
            }
        }
    }

    /// Stops the lifecycle container recorded for `cwd` and forgets it.
    ///
    /// The record is only dropped once the container is stopped, so a failed
    /// stop can be retried.
    pub async fn shutdown(&self, cwd: &str) -> std::result::Result<Option<ContainerRecord>, Failure> {
        let subject = format!("stopping container for `{}`", cwd);
        let key = cwd.to_string();
        let recorded = self
            .state
            .blocking(move |s| Ok(s.get(&key)))
            .await
            .map_err(|e| Failure::new(&subject, e))?;
        let Some(record) = recorded else {
            return Ok(None);
        };
        let id = short_id(&record.container_id).to_string();
        self.reporter.start(&format!("Stopping Docker container: {}", id));
        let stopped = match self.runtime.stop(&record.container_id).await {
            Ok(()) => {
                let key = cwd.to_string();
                self.state.blocking(move |s| s.remove(&key)).await.map(|_| ())
            }
            Err(e) => Err(e),
        };
        match stopped {
            Ok(()) => {
                self.reporter.succeed(&format!("Stopped Docker container: {}", id));
                Ok(Some(record))
            }
            Err(e) => {
                let failure = Failure::new(subject, e);
                self.reporter.fail(&failure.to_string());
                Err(failure)
            }
        }
    }

    /// Validates and coerces caller input for a command.
    pub(crate) fn validate(
        &self,
        ms: &Microservice,
        declared: &[Argument],
        request: &ExecRequest,
    ) -> Result<Prepared> {
        prepare(
            declared,
            &ms.environment,
            &request.arguments,
            &request.environment,
            |name| std::env::var(name).ok(),
        )
    }

    /// Starts a container with every port in `container_ports` mapped to a
    /// fresh host port. A failed start is retried with new ports, bounded by
    /// the configured attempts and the provisioning deadline. A start cut off
    /// by the deadline is force-removed by name.
    pub(crate) async fn provision(
        &self,
        base: RunSpec,
        container_ports: &[u16],
    ) -> Result<(String, BTreeMap<u16, u16>)> {
        let deadline = self.config.provision_timeout;
        let pending = Mutex::new(None);
        match tokio::time::timeout(deadline, self.start_with_retry(base, container_ports, &pending)).await {
            Ok(started) => started,
            Err(_) => {
                let name: Option<String> = pending.lock().ok().and_then(|mut n| n.take());
                if let Some(name) = name {
                    warn!(container = %name, "start timed out, removing container");
                    if let Err(e) = self.runtime.remove(&name).await {
                        warn!(container = %name, "failed to remove timed out container: {}", e);
                    }
                }
                Err(ExecError::Timeout {
                    during: "starting container".into(),
                    secs: deadline.as_secs(),
                })
            }
        }
    }

    async fn start_with_retry(
        &self,
        base: RunSpec,
        container_ports: &[u16],
        pending: &Mutex<Option<String>>,
    ) -> Result<(String, BTreeMap<u16, u16>)> {
        let attempts = self.config.start_attempts;
        let mut last = String::new();
        for attempt in 1..=attempts {
            let host_ports = self.ports.allocate(container_ports.len()).await?;
            let mapping: BTreeMap<u16, u16> = container_ports.iter().copied().zip(host_ports).collect();
            let name = format!("omg-{}", Uuid::new_v4().simple());
            let mut spec = base.clone();
            spec.name = Some(name.clone());
            spec.ports = mapping
                .iter()
                .map(|(&internal, &external)| PortMapping { external, internal })
                .collect();
            if let Ok(mut slot) = pending.lock() {
                *slot = Some(name);
            }
            match self.runtime.start(&spec).await {
                Ok(id) => {
                    self.reporter
                        .succeed(&format!("Started Docker container with id: {}", short_id(&id)));
                    return Ok((id, mapping));
                }
                Err(ExecError::ContainerStart(msg)) => {
                    warn!(attempt, "container start failed: {}", msg);
                    last = msg;
                }
                Err(e) => return Err(e),
            }
        }
        Err(ExecError::StartAttemptsExhausted { attempts, last })
    }

    /// Run spec for the descriptor's lifecycle startup command.
    pub(crate) fn lifecycle_spec(&self, ms: &Microservice, request: &ExecRequest, prepared: &Prepared) -> Result<RunSpec> {
        let lifecycle = ms.lifecycle.as_ref().ok_or_else(|| {
            ExecError::Descriptor("A lifecycle startup command is required to run this command".into())
        })?;
        Ok(RunSpec {
            image: request.image.clone(),
            env: prepared.environment.clone(),
            entrypoint: Some(lifecycle.startup.command.clone()),
            args: lifecycle.startup.args.clone(),
            ..Default::default()
        })
    }

    /// Best-effort teardown of a container this invocation started.
    pub(crate) async fn teardown(&self, container: &str, kill: bool) {
        let outcome = if kill {
            self.runtime.kill(container).await
        } else {
            self.runtime.stop(container).await
        };
        if let Err(e) = outcome {
            warn!(container = short_id(container), "teardown failed: {}", e);
        }
    }
}

/// Checks raw output against the declared output type and returns it typed.
pub fn check_output(output: Option<&Output>, raw: &str) -> Result<Value> {
    let trimmed = raw.trim();
    let Some(Output { ty }) = output else {
        return Ok(Value::String(trimmed.to_string()));
    };
    match ty {
        DataType::String => Ok(Value::String(trimmed.to_string())),
        ty => coerce("output", *ty, trimmed).map_err(|_| ExecError::OutputTypeMismatch {
            expected: ty.to_string(),
            output: trimmed.to_string(),
        }),
    }
}
