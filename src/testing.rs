//! In-memory fakes of the engine's collaborators for unit tests.

use async_trait::async_trait;
use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;

use crate::docker::{ContainerRuntime, RunSpec};
use crate::error::{ExecError, Result};
use crate::http::{HttpRequest, HttpResponse, Transport, TransportError};
use crate::reporter::Reporter;

/// Replies with scripted outcomes in order, then with empty 200s.
pub struct ScriptedTransport {
    replies: Mutex<VecDeque<std::result::Result<HttpResponse, TransportError>>>,
    requests: Mutex<Vec<HttpRequest>>,
}

impl ScriptedTransport {
    pub fn new(replies: Vec<std::result::Result<HttpResponse, TransportError>>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, request: &HttpRequest) -> std::result::Result<HttpResponse, TransportError> {
        self.requests.lock().unwrap().push(request.clone());
        self.replies.lock().unwrap().pop_front().unwrap_or(Ok(HttpResponse {
            status: 200,
            body: String::new(),
        }))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RuntimeCall {
    Start(RunSpec),
    Exec(String, Vec<String>),
    Stop(String),
    Kill(String),
    Remove(String),
}

/// Container runtime that records calls instead of running anything.
#[derive(Default)]
pub struct FakeRuntime {
    calls: Mutex<Vec<RuntimeCall>>,
    start_failures: Mutex<u32>,
    exec_result: Mutex<Option<std::result::Result<String, String>>>,
    running: Mutex<HashSet<String>>,
    started: Mutex<u32>,
    stop_error: Mutex<Option<String>>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `n` starts fail as if the port was already taken.
    pub fn failing_starts(self, n: u32) -> Self {
        *self.start_failures.lock().unwrap() = n;
        self
    }

    pub fn exec_output(self, out: std::result::Result<&str, &str>) -> Self {
        *self.exec_result.lock().unwrap() = Some(out.map(str::to_string).map_err(str::to_string));
        self
    }

    /// Every stop fails with `msg` and leaves the container running.
    pub fn failing_stops(self, msg: &str) -> Self {
        *self.stop_error.lock().unwrap() = Some(msg.to_string());
        self
    }

    pub fn is_up(&self, id: &str) -> bool {
        self.running.lock().unwrap().contains(id)
    }

    pub fn with_running(self, id: &str) -> Self {
        self.running.lock().unwrap().insert(id.to_string());
        self
    }

    pub fn calls(&self) -> Vec<RuntimeCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn starts(&self) -> Vec<RunSpec> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                RuntimeCall::Start(spec) => Some(spec),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn start(&self, spec: &RunSpec) -> Result<String> {
        self.calls.lock().unwrap().push(RuntimeCall::Start(spec.clone()));
        let mut failures = self.start_failures.lock().unwrap();
        if *failures > 0 {
            *failures -= 1;
            return Err(ExecError::ContainerStart("port is already allocated".into()));
        }
        let mut started = self.started.lock().unwrap();
        *started += 1;
        let id = format!("{:x<64}", format!("c{}", started));
        self.running.lock().unwrap().insert(id.clone());
        Ok(id)
    }

    async fn exec(&self, container: &str, command: &[String]) -> Result<String> {
        self.calls
            .lock()
            .unwrap()
            .push(RuntimeCall::Exec(container.to_string(), command.to_vec()));
        match self.exec_result.lock().unwrap().clone() {
            Some(Ok(out)) => Ok(out),
            Some(Err(err)) => Err(ExecError::Invocation(err)),
            None => Ok(command.join(" ")),
        }
    }

    async fn stop(&self, container: &str) -> Result<()> {
        self.calls.lock().unwrap().push(RuntimeCall::Stop(container.to_string()));
        if let Some(msg) = self.stop_error.lock().unwrap().clone() {
            return Err(ExecError::Invocation(msg));
        }
        self.running.lock().unwrap().retain(|id| !id.starts_with(container));
        Ok(())
    }

    async fn kill(&self, container: &str) -> Result<()> {
        self.calls.lock().unwrap().push(RuntimeCall::Kill(container.to_string()));
        self.running.lock().unwrap().retain(|id| !id.starts_with(container));
        Ok(())
    }

    async fn remove(&self, container: &str) -> Result<()> {
        self.calls.lock().unwrap().push(RuntimeCall::Remove(container.to_string()));
        self.running.lock().unwrap().remove(container);
        Ok(())
    }

    async fn is_running(&self, container: &str) -> Result<bool> {
        Ok(self.running.lock().unwrap().contains(container))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Report {
    Start(String),
    Succeed(String),
    Fail(String),
}

#[derive(Default)]
pub struct RecordingReporter {
    reports: Mutex<Vec<Report>>,
}

impl RecordingReporter {
    pub fn reports(&self) -> Vec<Report> {
        self.reports.lock().unwrap().clone()
    }
}

impl Reporter for RecordingReporter {
    fn start(&self, text: &str) {
        self.reports.lock().unwrap().push(Report::Start(text.to_string()));
    }

    fn succeed(&self, text: &str) {
        self.reports.lock().unwrap().push(Report::Succeed(text.to_string()));
    }

    fn fail(&self, text: &str) {
        self.reports.lock().unwrap().push(Report::Fail(text.to_string()));
    }
}

/// Writes an executable shell script standing in for the docker binary.
#[cfg(unix)]
pub fn stub_binary(dir: &tempfile::TempDir, body: &str) -> std::path::PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.path().join("docker");
    std::fs::write(&path, format!("#!/bin/sh\n{}", body)).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}
