//! Event subscriptions against a long-lived lifecycle container.
//!
//! The first subscription from a working directory starts the container and
//! records it in the state file; later subscriptions and unsubscriptions
//! from the same directory reuse it. Unsubscribing leaves it running.

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};
use url::Url;

use super::{Engine, ExecRequest, Execution, Phase, Phases};
use crate::docker::short_id;
use crate::error::{ExecError, Result};
use crate::http::build_request;
use crate::models::{Event, Http, Microservice};
use crate::state::ContainerRecord;

// Hosts that mean "this machine" to the caller but not to a container.
const LOOPBACK_HOSTS: [&str; 4] = ["localhost", "127.0.0.1", "0.0.0.0", "[::1]"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Subscribe,
    Unsubscribe,
}

pub struct EventExec<'a> {
    microservice: &'a Microservice,
    event: &'a Event,
    direction: Direction,
}

impl<'a> EventExec<'a> {
    pub fn new(microservice: &'a Microservice, event: &'a Event, direction: Direction) -> Self {
        Self {
            microservice,
            event,
            direction,
        }
    }

    fn endpoint(&self) -> &Http {
        match self.direction {
            Direction::Subscribe => &self.event.subscribe,
            Direction::Unsubscribe => &self.event.unsubscribe,
        }
    }

    /// The recorded container for `cwd` if it is still up, otherwise a new
    /// one with every event port published.
    async fn ensure_container(
        &self,
        engine: &Engine,
        request: &ExecRequest,
        prepared: &crate::validate::Prepared,
    ) -> Result<ContainerRecord> {
        if let Some(record) = Self::lookup(engine, &request.cwd).await? {
            match engine.runtime.is_running(&record.container_id).await {
                Ok(true) => {
                    debug!(container = short_id(&record.container_id), "reusing running container");
                    return Ok(record);
                }
                Ok(false) => info!(
                    container = short_id(&record.container_id),
                    "recorded container is gone, starting a new one"
                ),
                Err(e) => {
                    warn!("could not inspect recorded container, reusing it: {}", e);
                    return Ok(record);
                }
            }
        }

        let spec = engine.lifecycle_spec(self.microservice, request, prepared)?;
        let (container, ports) = engine.provision(spec, &self.microservice.event_ports()).await?;
        let record = ContainerRecord::new(container, ports);
        let (cwd, entry) = (request.cwd.clone(), record.clone());
        if let Err(e) = engine.state.blocking(move |s| s.write(&cwd, entry)).await {
            // an unrecorded container could never be stopped
            warn!(
                container = %record.container_id,
                path = %engine.state.path().display(),
                "container started but not recorded, stopping it: {}",
                e
            );
            engine.teardown(&record.container_id, false).await;
            return Err(ExecError::StateStore(format!(
                "container {} was stopped because it could not be recorded: {}",
                short_id(&record.container_id),
                e
            )));
        }
        Ok(record)
    }

    async fn recorded(&self, engine: &Engine, request: &ExecRequest) -> Result<ContainerRecord> {
        Self::lookup(engine, &request.cwd).await?.ok_or_else(|| {
            ExecError::Invocation(format!(
                "No container is running for `{}`; subscribe to an event first",
                request.cwd
            ))
        })
    }

    async fn lookup(engine: &Engine, cwd: &str) -> Result<Option<ContainerRecord>> {
        let cwd = cwd.to_string();
        engine.state.blocking(move |s| Ok(s.get(&cwd))).await
    }
}

#[async_trait]
impl<'a> Execution for EventExec<'a> {
    fn start_text(&self) -> String {
        match self.direction {
            Direction::Subscribe => format!("Subscribing to event: `{}`", self.event.name),
            Direction::Unsubscribe => format!("Unsubscribing from event: `{}`", self.event.name),
        }
    }

    fn success_text(&self, _output: &Value) -> String {
        match self.direction {
            Direction::Subscribe => format!("Subscribed to event: `{}`", self.event.name),
            Direction::Unsubscribe => format!("Unsubscribed from event: `{}`", self.event.name),
        }
    }

    async fn exec(&self, engine: &Engine, request: &ExecRequest, phases: &Phases) -> Result<Value> {
        phases.enter(Phase::Validating);
        let prepared = engine.validate(self.microservice, &self.event.arguments, request)?;
        let callback = match (&self.direction, &request.callback) {
            (Direction::Subscribe, Some(raw)) => Some(callback_endpoint(raw, &engine.config.callback_host)?),
            _ => None,
        };

        phases.enter(Phase::Provisioning);
        let record = match self.direction {
            Direction::Subscribe => self.ensure_container(engine, request, &prepared).await?,
            Direction::Unsubscribe => self.recorded(engine, request).await?,
        };

        phases.enter(Phase::Invoking);
        let http = self.endpoint();
        let host_port = *record.ports.get(&http.port).ok_or_else(|| {
            ExecError::Invocation(format!(
                "Container port {} is not published by container {}",
                http.port,
                short_id(&record.container_id)
            ))
        })?;
        let mut call = build_request(http, host_port, &self.event.arguments, &prepared.arguments)?;
        if let Some(endpoint) = callback {
            let mut body = match call.body.take() {
                Some(Value::Object(map)) => map,
                _ => Map::new(),
            };
            body.insert("endpoint".into(), Value::String(endpoint));
            call.body = Some(Value::Object(body));
        }
        let response = engine.retrier.send(&call).await?;
        Ok(serde_json::from_str(&response.body).unwrap_or(Value::String(response.body.trim().to_string())))
    }
}

/// Rewrites a loopback callback address so the container can reach the host.
pub fn callback_endpoint(raw: &str, container_host: &str) -> Result<String> {
    let invalid = |detail: String| ExecError::ConstraintViolation {
        name: "callback".into(),
        rule: format!("must be an absolute URL ({})", detail),
    };
    let mut url = Url::parse(raw).map_err(|e| invalid(e.to_string()))?;
    let loopback = url.host_str().is_some_and(|h| LOOPBACK_HOSTS.contains(&h));
    if !loopback {
        return Ok(raw.to_string());
    }
    url.set_host(Some(container_host)).map_err(|e| invalid(e.to_string()))?;
    let rewritten = url.to_string();
    if url.path() == "/" && !raw.ends_with('/') && url.query().is_none() {
        return Ok(rewritten.trim_end_matches('/').to_string());
    }
    Ok(rewritten)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::tests::{lifecycle, test_config};
    use crate::exec::Invocation;
    use crate::http::HttpResponse;
    use crate::models::{Action, Argument, DataType, Interface, Location, Method};
    use crate::ports::PortAllocator;
    use crate::testing::{FakeRuntime, RecordingReporter, Report, RuntimeCall, ScriptedTransport};
    use serde_json::json;
    use std::sync::Arc;

    const RUNNING: &str = "4f2a9c81d3e7b6a5c4d3e2f1a0b9c8d7e6f5a4b3c2d1e0f9a8b7c6d5e4f3a2b1";

    fn service() -> Microservice {
        Microservice {
            name: "omg".into(),
            lifecycle: lifecycle(),
            actions: vec![Action {
                name: "foo".into(),
                help: None,
                arguments: vec![],
                interface: Interface::Events(vec![Event {
                    name: "bar".into(),
                    action: "foo".into(),
                    help: None,
                    arguments: vec![Argument::new("x", DataType::Int).required().located(Location::Body)],
                    subscribe: Http { method: Method::Post, path: "/sub".into(), port: 5000 },
                    unsubscribe: Http { method: Method::Post, path: "/unsub".into(), port: 5000 },
                }]),
                output: None,
            }],
            ..Default::default()
        }
    }

    fn subscribe() -> Invocation {
        Invocation::Subscribe { action: "foo".into(), event: "bar".into() }
    }

    fn unsubscribe() -> Invocation {
        Invocation::Unsubscribe { action: "foo".into(), event: "bar".into() }
    }

    fn request(args: &[(&str, &str)], callback: Option<&str>) -> ExecRequest {
        ExecRequest {
            image: "omg/events".into(),
            arguments: args.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
            cwd: "path/to/omg/directory".into(),
            callback: callback.map(str::to_string),
            ..Default::default()
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        engine: Engine,
        runtime: Arc<FakeRuntime>,
        transport: Arc<ScriptedTransport>,
        reporter: Arc<RecordingReporter>,
    }

    fn fixture(runtime: FakeRuntime, record: Option<ContainerRecord>) -> Fixture {
        let dir = tempfile::TempDir::new().unwrap();
        let runtime = Arc::new(runtime);
        let transport = Arc::new(ScriptedTransport::new(vec![Ok(HttpResponse {
            status: 200,
            body: "subscribed".into(),
        })]));
        let reporter = Arc::new(RecordingReporter::default());
        let engine = Engine::new(test_config(&dir), runtime.clone(), transport.clone(), reporter.clone())
            .with_ports(PortAllocator::new("127.0.0.1"));
        if let Some(record) = record {
            engine.state().write("path/to/omg/directory", record).unwrap();
        }
        Fixture { _dir: dir, engine, runtime, transport, reporter }
    }

    fn recorded() -> Option<ContainerRecord> {
        Some(ContainerRecord::new(RUNNING, [(5000, 4444)].into()))
    }

    #[tokio::test]
    async fn test_subscribe_posts_body_arguments_to_recorded_port() {
        let f = fixture(FakeRuntime::new().with_running(RUNNING), recorded());

        let output = f.engine.run(&service(), &subscribe(), request(&[("x", "1")], None)).await.unwrap();
        assert_eq!(output, json!("subscribed"));

        let sent = f.transport.requests();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].method, Method::Post);
        assert_eq!(sent[0].url, "http://localhost:4444/sub");
        assert_eq!(sent[0].body, Some(json!({"x": 1})));
        assert!(f.runtime.calls().is_empty());
        assert_eq!(
            f.reporter.reports(),
            vec![
                Report::Start("Subscribing to event: `bar`".into()),
                Report::Succeed("Subscribed to event: `bar`".into()),
            ]
        );
    }

    #[tokio::test]
    async fn test_missing_argument_fails_before_any_request() {
        let f = fixture(FakeRuntime::new().with_running(RUNNING), recorded());

        let err = f.engine.run(&service(), &subscribe(), request(&[], None)).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "Failed subscribing to event: `bar`. Need to supply required arguments: `x`"
        );
        assert!(f.transport.requests().is_empty());
        assert!(f.runtime.calls().is_empty());
    }

    #[tokio::test]
    async fn test_first_subscription_starts_and_records_container() {
        let f = fixture(FakeRuntime::new(), None);

        f.engine.run(&service(), &subscribe(), request(&[("x", "1")], None)).await.unwrap();

        let starts = f.runtime.starts();
        assert_eq!(starts.len(), 1);
        assert_eq!(starts[0].ports[0].internal, 5000);
        let record = f.engine.state().get("path/to/omg/directory").unwrap();
        assert_eq!(record.ports[&5000], starts[0].ports[0].external);
        assert!(record.started_at.is_some());
        assert_eq!(
            f.transport.requests()[0].url,
            format!("http://localhost:{}/sub", record.ports[&5000])
        );

        // a second subscription reuses the same container
        f.engine.run(&service(), &subscribe(), request(&[("x", "2")], None)).await.unwrap();
        assert_eq!(f.runtime.starts().len(), 1);
    }

    #[tokio::test]
    async fn test_stale_record_is_replaced() {
        let f = fixture(FakeRuntime::new(), recorded());

        f.engine.run(&service(), &subscribe(), request(&[("x", "1")], None)).await.unwrap();

        assert_eq!(f.runtime.starts().len(), 1);
        let record = f.engine.state().get("path/to/omg/directory").unwrap();
        assert_ne!(record.container_id, RUNNING);
    }

    #[tokio::test]
    async fn test_callback_is_sent_as_endpoint_reachable_from_container() {
        let f = fixture(FakeRuntime::new().with_running(RUNNING), recorded());

        f.engine
            .run(&service(), &subscribe(), request(&[("x", "1")], Some("http://localhost:4444")))
            .await
            .unwrap();
        assert_eq!(
            f.transport.requests()[0].body,
            Some(json!({"x": 1, "endpoint": "http://host.docker.internal:4444"}))
        );
    }

    #[tokio::test]
    async fn test_unsubscribe_uses_recorded_container_and_leaves_it_running() {
        let f = fixture(FakeRuntime::new().with_running(RUNNING), recorded());

        f.engine
            .run(&service(), &unsubscribe(), request(&[("x", "1")], Some("http://localhost:9")))
            .await
            .unwrap();
        let sent = f.transport.requests();
        assert_eq!(sent[0].url, "http://localhost:4444/unsub");
        assert_eq!(sent[0].body, Some(json!({"x": 1})));
        assert!(!f.runtime.calls().iter().any(|c| matches!(c, RuntimeCall::Stop(_))));
        assert!(f.engine.state().get("path/to/omg/directory").is_some());
    }

    #[tokio::test]
    async fn test_unsubscribe_without_record_fails() {
        let f = fixture(FakeRuntime::new(), None);
        let err = f
            .engine
            .run(&service(), &unsubscribe(), request(&[("x", "1")], None))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Invocation);
        assert!(err.to_string().starts_with("Failed unsubscribing from event: `bar`. No container"));
        assert!(f.transport.requests().is_empty());
    }

    #[tokio::test]
    async fn test_container_that_cannot_be_recorded_is_stopped() {
        let dir = tempfile::TempDir::new().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, "").unwrap();
        let mut config = test_config(&dir);
        config.state_file = blocker.join("state.json");
        let runtime = Arc::new(FakeRuntime::new());
        let transport = Arc::new(ScriptedTransport::new(vec![]));
        let engine = Engine::new(config, runtime.clone(), transport.clone(), Arc::new(RecordingReporter::default()))
            .with_ports(PortAllocator::new("127.0.0.1"));

        let err = engine.run(&service(), &subscribe(), request(&[("x", "1")], None)).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::StateStore);
        assert!(err.to_string().contains("could not be recorded"));

        let calls = runtime.calls();
        assert_eq!(calls.len(), 2);
        assert!(matches!(calls[0], RuntimeCall::Start(_)));
        assert!(matches!(&calls[1], RuntimeCall::Stop(id) if id.starts_with("c1")));
        assert!(transport.requests().is_empty());
    }

    #[test]
    fn test_callback_endpoint_rewrite() {
        let host = "host.docker.internal";
        assert_eq!(callback_endpoint("http://localhost:4444", host).unwrap(), "http://host.docker.internal:4444");
        assert_eq!(
            callback_endpoint("http://127.0.0.1:8080/hook?id=1", host).unwrap(),
            "http://host.docker.internal:8080/hook?id=1"
        );
        assert_eq!(callback_endpoint("https://events.example.com/in", host).unwrap(), "https://events.example.com/in");
        assert!(callback_endpoint("not a url", host).is_err());
    }
}
