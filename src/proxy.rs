// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! proxy.rs
//!
//! A ProxyAction performs an operation on components hosted by other servers. It runs this same
//! program on each of those servers, through the configured remote shell, in remote mode, and
//! reads back the events it prints to update the local view of the components.
//!
//! Servers are contacted concurrently, up to the configured fan-out. Events from one server are
//! handled in the order they were emitted; events from different servers interleave freely.

use std::{collections::HashMap, fmt, process::Stdio, sync::Arc, time::Duration};

use {
    futures::{stream, StreamExt},
    tokio::{io::AsyncReadExt, process::Command},
    tokio_util::codec::{FramedRead, LinesCodec},
};

use crate::{
    action::{ActionError, ActionOptions, ActionResult, Completion, Verb},
    component::{Component, ComponentState, StateRecord},
    event::{self, DoneStatus, Event, EventSink, Line},
    rc::RcFlags,
    server::Server,
};

/// Longest event line accepted from a remote server.
const MAX_LINE_LENGTH: usize = 1 << 20;

/// How remote servers are reached.
#[derive(Debug, Clone)]
pub struct ProxySettings {
    /// Remote shell command; the hostname and the remote command line are appended.
    pub shell: Vec<String>,
    /// Program run on the remote server.
    pub program: String,
    /// Config file the remote program is told to read, if not its default.
    pub config_path: Option<String>,
    pub timeout: Duration,
    pub fanout: usize,
}

/// How one server's part of a ProxyAction ended.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerOutcome {
    Ok,
    /// The remote side ran and sent back a non-zero return code. `rc` is its own aggregate, so a
    /// timeout over there stays a timeout here.
    Reported { rc: RcFlags, hint: Option<String> },
    /// The remote shell exited non-zero without reporting anything, typically because the server
    /// could not be reached. `hint` is the first line of output.
    Failed { code: i32, hint: Option<String> },
    /// The server did not finish before the timeout.
    Timeout,
    /// The server sent something that is not a valid event, or no terminal result.
    Protocol(String),
}

impl ServerOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, ServerOutcome::Ok)
    }

    pub fn rc_flags(&self) -> RcFlags {
        match self {
            ServerOutcome::Ok => RcFlags::OK,
            ServerOutcome::Reported { rc, .. } => *rc,
            ServerOutcome::Failed { .. } => RcFlags::ERROR,
            ServerOutcome::Timeout => RcFlags::UNHEALTHY,
            ServerOutcome::Protocol(_) => RcFlags::RUNTIME_ERROR,
        }
    }

    /// The error to attribute to a component the server never reported on.
    fn component_error(&self) -> ActionError {
        match self {
            ServerOutcome::Ok => {
                ActionError::Protocol("server did not report on this component".to_string())
            }
            ServerOutcome::Reported { rc, hint } => {
                let output = hint.clone().unwrap_or_default();
                if rc.contains(RcFlags::USER_ERROR) {
                    ActionError::User(output)
                } else if rc.contains(RcFlags::ERROR) {
                    ActionError::Execution {
                        code: rc.exit_code(),
                        output,
                    }
                } else if rc.contains(RcFlags::UNHEALTHY) {
                    ActionError::Timeout(output)
                } else {
                    ActionError::Protocol(output)
                }
            }
            ServerOutcome::Failed { code, hint } => ActionError::Execution {
                code: *code,
                output: hint.clone().unwrap_or_default(),
            },
            ServerOutcome::Timeout => ActionError::Timeout("waiting for remote server".to_string()),
            ServerOutcome::Protocol(msg) => ActionError::Protocol(msg.clone()),
        }
    }
}

impl fmt::Display for ServerOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerOutcome::Ok => write!(f, "ok"),
            ServerOutcome::Reported { rc, hint: None } => write!(f, "reported {rc}"),
            ServerOutcome::Reported {
                rc,
                hint: Some(hint),
            } => write!(f, "reported {rc} ({hint})"),
            ServerOutcome::Failed { code, hint: None } => write!(f, "failed with status {code}"),
            ServerOutcome::Failed {
                code,
                hint: Some(hint),
            } => write!(f, "failed with status {code} ({hint})"),
            ServerOutcome::Timeout => write!(f, "timed out"),
            ServerOutcome::Protocol(msg) => write!(f, "protocol error: {msg}"),
        }
    }
}

/// The servers on which a ProxyAction did not succeed.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub struct ProxyActionError {
    pub verb: Verb,
    pub failures: Vec<(String, ServerOutcome)>,
}

impl ProxyActionError {
    /// Hostnames of the servers that timed out.
    pub fn timed_out(&self) -> Vec<&str> {
        self.failures
            .iter()
            .filter(|(_, o)| *o == ServerOutcome::Timeout)
            .map(|(host, _)| host.as_str())
            .collect()
    }
}

impl fmt::Display for ProxyActionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "remote {} failed on", self.verb)?;
        for (i, (host, outcome)) in self.failures.iter().enumerate() {
            let sep = if i == 0 { " " } else { ", " };
            write!(f, "{sep}{host}: {outcome}")?;
        }
        Ok(())
    }
}

/// What happened on one server.
#[derive(Debug)]
pub struct ServerReport {
    pub server: Arc<Server>,
    pub outcome: ServerOutcome,
    /// One result per component sent to the server, in the order they were sent.
    pub results: Vec<(String, ActionResult)>,
}

#[derive(Debug, Default)]
pub struct ProxyReport {
    pub servers: Vec<ServerReport>,
}

impl ProxyReport {
    /// Success only if every server succeeded.
    pub fn result(&self, verb: Verb) -> Result<(), ProxyActionError> {
        let failures: Vec<(String, ServerOutcome)> = self
            .servers
            .iter()
            .filter(|s| !s.outcome.is_ok())
            .map(|s| (s.server.hostname().to_string(), s.outcome.clone()))
            .collect();

        if failures.is_empty() {
            Ok(())
        } else {
            Err(ProxyActionError { verb, failures })
        }
    }

    pub fn rc_flags(&self) -> RcFlags {
        self.servers.iter().map(|s| s.outcome.rc_flags()).collect()
    }
}

/// Re-runs one operation on the servers currently hosting a set of components.
pub struct ProxyAction<'a> {
    verb: Verb,
    fs_name: &'a str,
    targets: Vec<(Arc<Server>, Vec<&'a Component>)>,
    settings: &'a ProxySettings,
    options: &'a ActionOptions,
    fanout: usize,
}

impl<'a> ProxyAction<'a> {
    /// Build a proxy action for `components`, grouped by the server each is bound to.
    pub fn new(
        verb: Verb,
        fs_name: &'a str,
        components: &[&'a Component],
        settings: &'a ProxySettings,
        options: &'a ActionOptions,
    ) -> Self {
        let mut targets: Vec<(Arc<Server>, Vec<&'a Component>)> = Vec::new();
        for &comp in components {
            let server = comp.server();
            match targets.iter_mut().find(|(s, _)| *s == server) {
                Some((_, comps)) => comps.push(comp),
                None => targets.push((server, vec![comp])),
            }
        }

        ProxyAction {
            verb,
            fs_name,
            targets,
            settings,
            options,
            fanout: settings.fanout.max(1),
        }
    }

    /// Build a proxy action that runs on `server` whatever the components are bound to. Used to
    /// look for components on their failover servers.
    pub fn to_server(
        verb: Verb,
        fs_name: &'a str,
        server: &Arc<Server>,
        components: &[&'a Component],
        settings: &'a ProxySettings,
        options: &'a ActionOptions,
    ) -> Self {
        ProxyAction {
            verb,
            fs_name,
            targets: vec![(Arc::clone(server), components.to_vec())],
            settings,
            options,
            fanout: 1,
        }
    }

    /// Limit how many servers are contacted at once. Stopping loop-device backed targets uses a
    /// fan-out of 1 so that only one server tears down loop devices at a time.
    pub fn with_fanout(mut self, fanout: usize) -> Self {
        self.fanout = fanout.max(1);
        self
    }

    pub fn servers(&self) -> impl Iterator<Item = &Arc<Server>> {
        self.targets.iter().map(|(s, _)| s)
    }

    /// Dispatch to every server and wait until each has finished or timed out.
    pub async fn run(self, sink: &dyn EventSink) -> ProxyReport {
        let this = &self;
        let servers = stream::iter(self.targets.iter())
            .map(|(server, comps)| this.run_server(server, comps, sink))
            .buffer_unordered(self.fanout)
            .collect::<Vec<_>>()
            .await;

        for report in &servers {
            if !report.outcome.is_ok() {
                log::warn!(
                    "{} on {}: {}",
                    self.verb,
                    report.server.hostname(),
                    report.outcome
                );
            }
        }

        ProxyReport { servers }
    }

    /// The command line run on `server`, as a single shell-quoted string.
    pub fn remote_command(&self, server: &Server, components: &[&Component]) -> String {
        let mut args: Vec<String> = vec![self.settings.program.clone(), "-R".to_string()];
        if let Some(path) = &self.settings.config_path {
            args.extend(["--config".to_string(), path.clone()]);
        }
        args.push(self.verb.to_string());
        args.extend(["-f".to_string(), self.fs_name.to_string()]);

        let labels: Vec<&str> = components.iter().map(|c| c.label()).collect();
        args.extend(["-l".to_string(), labels.join(",")]);

        if components.iter().any(|c| **c.default_server() != *server) {
            args.extend(["-F".to_string(), server.hostname().to_string()]);
        }
        if let Some(options) = &self.options.options {
            args.extend(["-o".to_string(), options.clone()]);
        }
        if self.options.nocheck {
            args.push("--nocheck".to_string());
        }

        args.iter()
            .map(|a| shell_quote(a))
            .collect::<Vec<_>>()
            .join(" ")
    }

    async fn run_server(
        &self,
        server: &Arc<Server>,
        components: &[&'a Component],
        sink: &dyn EventSink,
    ) -> ServerReport {
        let mut stream = ServerStream::new(self.verb, components);

        let outcome = match tokio::time::timeout(
            self.settings.timeout,
            self.dispatch(server, components, &mut stream, sink),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => ServerOutcome::Timeout,
        };

        let results = stream.finish(&outcome);

        ServerReport {
            server: Arc::clone(server),
            outcome,
            results,
        }
    }

    /// Launch the remote command and read its events until it exits.
    async fn dispatch(
        &self,
        server: &Server,
        components: &[&Component],
        stream: &mut ServerStream<'_>,
        sink: &dyn EventSink,
    ) -> ServerOutcome {
        let Some((shell, shell_args)) = self.settings.shell.split_first() else {
            return ServerOutcome::Protocol("no remote shell configured".to_string());
        };
        let remote_command = self.remote_command(server, components);
        log::debug!("{}: running {remote_command}", server.hostname());

        let child = Command::new(shell)
            .args(shell_args)
            .arg(server.hostname())
            .arg(&remote_command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        let mut child = match child {
            Ok(child) => child,
            Err(e) => {
                return ServerOutcome::Failed {
                    code: -1,
                    hint: Some(format!("could not run remote shell '{shell}': {e}")),
                }
            }
        };

        let (Some(stdout), Some(mut stderr)) = (child.stdout.take(), child.stderr.take()) else {
            return ServerOutcome::Protocol("remote shell output was not captured".to_string());
        };

        let read_stdout = async {
            let mut lines =
                FramedRead::new(stdout, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));
            while let Some(line) = lines.next().await {
                match line {
                    Ok(line) => stream.handle_line(&line, sink),
                    Err(e) => stream.protocol_error(format!("unreadable output: {e}")),
                }
            }
        };
        let read_stderr = async {
            let mut buf = String::new();
            let _ = stderr.read_to_string(&mut buf).await;
            buf
        };

        let ((), stderr_text) = tokio::join!(read_stdout, read_stderr);

        let exit_code = match child.wait().await {
            Ok(status) => status.code().unwrap_or(-1),
            Err(e) => {
                return ServerOutcome::Failed {
                    code: -1,
                    hint: Some(e.to_string()),
                }
            }
        };

        stream.classify(exit_code, &stderr_text)
    }
}

/// The state of the event stream read from one server.
struct ServerStream<'c> {
    verb: Verb,
    components: HashMap<&'c str, &'c Component>,
    order: Vec<&'c str>,
    /// What was known before anything was heard from the server, restored on timeout.
    before: Vec<StateRecord>,
    done: HashMap<String, ActionResult>,
    result: Option<(i32, Option<String>)>,
    first_text: Option<String>,
    protocol: Option<String>,
}

impl<'c> ServerStream<'c> {
    fn new(verb: Verb, components: &[&'c Component]) -> Self {
        ServerStream {
            verb,
            components: components.iter().map(|c| (c.label(), *c)).collect(),
            order: components.iter().map(|c| c.label()).collect(),
            before: components.iter().map(|c| c.record()).collect(),
            done: HashMap::new(),
            result: None,
            first_text: None,
            protocol: None,
        }
    }

    fn protocol_error(&mut self, msg: String) {
        log::warn!("{msg}");
        self.protocol.get_or_insert(msg);
    }

    /// Look up a component that was sent to this server. A label that wasn't is rejected, so a
    /// server can never change the state of a component it does not host.
    fn component(&mut self, label: &str) -> Option<&'c Component> {
        let found = self.components.get(label).copied();
        if found.is_none() {
            self.protocol_error(format!("event for unexpected component '{label}'"));
        }
        found
    }

    fn handle_line(&mut self, line: &str, sink: &dyn EventSink) {
        let event = match event::parse_line(line) {
            Ok(Line::Event(event)) => event,
            Ok(Line::Text(text)) => {
                if self.first_text.is_none() && !text.trim().is_empty() {
                    self.first_text = Some(text.trim().to_string());
                }
                return;
            }
            Err(e) => {
                self.protocol_error(e.to_string());
                return;
            }
        };

        if self.result.is_some() {
            self.protocol_error("event received after the result".to_string());
            return;
        }

        match &event {
            Event::Start { verb, .. } | Event::CompStart { verb, .. } | Event::CompDone { verb, .. }
                if *verb != self.verb =>
            {
                self.protocol_error(format!("event for {verb} while running {}", self.verb));
                return;
            }
            Event::Start { .. } => {}
            Event::CompStart { label, verb } => {
                if let Some(comp) = self.component(label) {
                    match verb {
                        Verb::Start => comp.set_state(ComponentState::Starting),
                        Verb::Stop => comp.set_state(ComponentState::Stopping),
                        _ => {}
                    }
                }
            }
            Event::CompDone {
                label,
                state,
                status,
                rc,
                output,
                ..
            } => {
                let Some(comp) = self.component(label) else {
                    return;
                };
                let error = ActionError::from_wire(*status, *rc, output.clone());
                match (state, &error) {
                    (Some(state), Some(e)) if state.is_error() => {
                        comp.set_error(*state, e.to_string())
                    }
                    (Some(state), _) => comp.set_state(*state),
                    (None, _) => {}
                }
                let result = match error {
                    Some(e) => Err(e),
                    None => Ok(Completion {
                        skipped: *status == DoneStatus::Skipped,
                        state: *state,
                    }),
                };
                self.done.insert(label.clone(), result);
            }
            Event::Result { rc, output } => self.result = Some((*rc, output.clone())),
            Event::Unknown => {
                log::debug!("ignoring unknown event: {line}");
                return;
            }
        }

        sink.emit(&event);
    }

    fn classify(&self, exit_code: i32, stderr: &str) -> ServerOutcome {
        if let Some(msg) = &self.protocol {
            return ServerOutcome::Protocol(msg.clone());
        }

        let hint = self.first_text.clone().or_else(|| {
            stderr
                .lines()
                .map(str::trim)
                .find(|l| !l.is_empty())
                .map(str::to_string)
        });

        match &self.result {
            Some((0, _)) => ServerOutcome::Ok,
            Some((rc, output)) => ServerOutcome::Reported {
                rc: RcFlags::from_bits(*rc as u32),
                hint: output
                    .as_deref()
                    .and_then(|o| o.lines().next())
                    .map(str::to_string)
                    .or(hint),
            },
            None if exit_code != 0 => ServerOutcome::Failed {
                code: exit_code,
                hint,
            },
            None => ServerOutcome::Protocol("remote exited without a result".to_string()),
        }
    }

    /// Produce one result per component, attributing the server's failure to every component it
    /// did not report on.
    fn finish(mut self, outcome: &ServerOutcome) -> Vec<(String, ActionResult)> {
        let order = std::mem::take(&mut self.order);
        let before = std::mem::take(&mut self.before);
        order
            .into_iter()
            .zip(before)
            .map(|(label, before)| {
                let result = match self.done.remove(label) {
                    Some(result) => result,
                    None => {
                        let error = outcome.component_error();
                        let comp = self.components[label];
                        match &error {
                            ActionError::Timeout(_) => comp.restore(before),
                            ActionError::User(_) => {}
                            _ => comp.set_error(comp.error_state(), error.to_string()),
                        }
                        Err(error)
                    }
                };
                (label.to_string(), result)
            })
            .collect()
    }
}

/// Quote `arg` for a POSIX shell, leaving it alone if it needs no quoting.
pub fn shell_quote(arg: &str) -> String {
    let safe = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "@%_+=:,./-".contains(c));
    if safe {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', "'\\''"))
    }
}
