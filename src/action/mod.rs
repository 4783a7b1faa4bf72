// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! Actions turn "perform verb V on component C" into a checked, idempotent unit of work that
//! runs on the local host.
//!
//! An action goes through the following steps, in order:
//!
//! 1. the device check, if the verb requires one: the device exists and is of the right type;
//! 2. the already-done check: if the component is already in the state the verb would put it in,
//!    the action succeeds without running anything;
//! 3. the mount data check, if the verb requires one;
//! 4. building the command line from the configured template;
//! 5. running it, bounded by a timeout;
//! 6. classifying the result and updating the component's state.
//!
//! Actions on remote components are never built here; the filesystem hands those to a
//! `proxy::ProxyAction` instead.

pub mod command;
pub mod probe;

use std::{collections::HashMap, fmt, io, sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    component::{Component, ComponentKind, ComponentState},
    config::{Commands, ProbeConfig},
    event::{DoneStatus, Event, EventSink},
    rc::RcFlags,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Verb {
    Start,
    Stop,
    Format,
    Status,
    Execute,
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Verb::Start => "start",
                Verb::Stop => "stop",
                Verb::Format => "format",
                Verb::Status => "status",
                Verb::Execute => "execute",
            }
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ActionError {
    /// Invalid input from the caller, e.g. a bad template or a missing command.
    #[error("{0}")]
    User(String),

    /// The target's device is missing or not of the expected type.
    #[error("{0}")]
    NoDevice(String),

    #[error("{0}")]
    Precondition(String),

    #[error("command exited with status {code}: {output}")]
    Execution { code: i32, output: String },

    /// Distinct from `Execution`: nothing is known about whether the command did its work.
    #[error("timed out {0}")]
    Timeout(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl ActionError {
    /// The contribution of this error to the aggregate return code.
    pub fn rc_flags(&self, kind: ComponentKind) -> RcFlags {
        let client = if kind.is_target() {
            RcFlags::OK
        } else {
            RcFlags::CLIENT
        };
        match self {
            ActionError::User(_) => RcFlags::USER_ERROR,
            ActionError::NoDevice(_)
            | ActionError::Precondition(_)
            | ActionError::Execution { .. } => RcFlags::ERROR | client,
            ActionError::Timeout(_) => RcFlags::UNHEALTHY,
            ActionError::Protocol(_) | ActionError::Io(_) => RcFlags::RUNTIME_ERROR,
        }
    }

    /// How this error is reported over the wire: status, return code and output.
    pub fn to_wire(&self) -> (DoneStatus, i32, Option<String>) {
        match self {
            ActionError::User(msg) => (DoneStatus::UserError, 0, Some(msg.clone())),
            ActionError::NoDevice(msg) | ActionError::Precondition(msg) => {
                (DoneStatus::Precondition, 0, Some(msg.clone()))
            }
            ActionError::Execution { code, output } => {
                (DoneStatus::Failed, *code, Some(output.clone()))
            }
            ActionError::Timeout(msg) => (DoneStatus::Timeout, 0, Some(msg.clone())),
            ActionError::Protocol(msg) => (DoneStatus::RuntimeError, 0, Some(msg.clone())),
            ActionError::Io(e) => (DoneStatus::RuntimeError, 0, Some(e.to_string())),
        }
    }

    /// Rebuild an error from its wire representation. Returns None for successful statuses.
    pub fn from_wire(status: DoneStatus, rc: i32, output: Option<String>) -> Option<Self> {
        let output = output.unwrap_or_default();
        Some(match status {
            DoneStatus::Done | DoneStatus::Skipped => return None,
            DoneStatus::Precondition => ActionError::Precondition(output),
            DoneStatus::Failed => ActionError::Execution { code: rc, output },
            DoneStatus::Timeout => ActionError::Timeout(output),
            DoneStatus::UserError => ActionError::User(output),
            DoneStatus::RuntimeError => ActionError::Protocol(output),
        })
    }
}

/// A successful action.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    /// True when the already-done check held and no command ran.
    pub skipped: bool,
    pub state: Option<ComponentState>,
}

pub type ActionResult = Result<Completion, ActionError>;

/// The state in which a verb's work is already done.
#[derive(Debug, Clone, Copy, PartialEq)]
enum AlreadyDone {
    Never,
    WhenRunning,
    WhenStopped,
}

/// The checks and idempotence rule of a verb applied to a kind of component.
#[derive(Debug, Clone, Copy, PartialEq)]
struct VerbRule {
    check_device: bool,
    check_mountdata: bool,
    already_done: AlreadyDone,
}

impl VerbRule {
    const fn new(check_device: bool, check_mountdata: bool, already_done: AlreadyDone) -> Self {
        VerbRule {
            check_device,
            check_mountdata,
            already_done,
        }
    }

    /// The rule for `verb` on `kind`, or None if the verb does not apply to that kind.
    fn lookup(verb: Verb, kind: ComponentKind) -> Option<Self> {
        use AlreadyDone::*;
        Some(match (verb, kind.is_target()) {
            (Verb::Start, true) => VerbRule::new(true, true, WhenRunning),
            (Verb::Stop, true) => VerbRule::new(false, false, WhenStopped),
            (Verb::Format, true) => VerbRule::new(true, false, Never),
            (Verb::Format, false) => return None,
            (Verb::Start, false) => VerbRule::new(false, false, WhenRunning),
            (Verb::Stop, false) => VerbRule::new(false, false, WhenStopped),
            (Verb::Status, _) | (Verb::Execute, _) => VerbRule::new(false, false, Never),
        })
    }

    fn holds(&self, current: ComponentState) -> bool {
        match self.already_done {
            AlreadyDone::Never => false,
            AlreadyDone::WhenRunning => current.is_running(),
            AlreadyDone::WhenStopped => current == ComponentState::Offline,
        }
    }
}

/// Per-invocation options given by the operator.
#[derive(Debug, Clone, Default)]
pub struct ActionOptions {
    /// Additional options appended to the command (for `execute`, the command itself).
    pub options: Option<String>,
    /// Skip device and mount data checks.
    pub nocheck: bool,
}

/// Everything an action needs from the filesystem it belongs to.
#[derive(Debug)]
pub struct ActionContext {
    pub commands: Commands,
    pub probe: ProbeConfig,
    pub timeout: Duration,
    /// NIDs of the management server, in Lustre `--mgsnode` syntax.
    pub mgs_nids: String,
    /// Serializes loop device teardown on this host.
    pub loop_lock: Arc<tokio::sync::Mutex<()>>,
}

/// A single-use operation on one component, executed on the local host.
pub struct Action<'a> {
    component: &'a Component,
    verb: Verb,
    rule: VerbRule,
    ctx: &'a ActionContext,
    options: &'a ActionOptions,
}

impl<'a> Action<'a> {
    /// Bind `verb` to `component`. Returns None when the verb does not apply to that kind of
    /// component (formatting a client, for example).
    pub fn new(
        component: &'a Component,
        verb: Verb,
        ctx: &'a ActionContext,
        options: &'a ActionOptions,
    ) -> Option<Self> {
        let rule = VerbRule::lookup(verb, component.kind())?;
        Some(Action {
            component,
            verb,
            rule,
            ctx,
            options,
        })
    }

    pub fn verb(&self) -> Verb {
        self.verb
    }

    /// Run the action to completion, report it to `sink` and update the component's state.
    pub async fn run(self, sink: &dyn EventSink) -> ActionResult {
        let _busy = self.component.lock().await;

        sink.emit(&Event::CompStart {
            label: self.component.label().to_string(),
            verb: self.verb,
        });

        let result = self.execute().await;
        self.settle(&result);

        let (status, rc, output) = match &result {
            Ok(c) if c.skipped => (DoneStatus::Skipped, 0, None),
            Ok(_) => (DoneStatus::Done, 0, None),
            Err(e) => e.to_wire(),
        };
        sink.emit(&Event::CompDone {
            label: self.component.label().to_string(),
            verb: self.verb,
            state: self.component.state(),
            status,
            rc,
            output,
        });

        result
    }

    async fn execute(&self) -> ActionResult {
        if self.component.is_external() && self.verb != Verb::Status && self.verb != Verb::Execute
        {
            return Ok(Completion {
                skipped: true,
                state: Some(ComponentState::External),
            });
        }

        if !self.options.nocheck {
            self.check_device()?;
        }

        let current = probe::probe(self.component, &self.ctx.probe).await?;
        self.component.set_state(current);

        if self.verb == Verb::Status {
            return Ok(Completion {
                skipped: false,
                state: Some(current),
            });
        }

        if self.rule.holds(current) {
            log::debug!(
                "{}: {} already done ({current})",
                self.component.label(),
                self.verb
            );
            return Ok(Completion {
                skipped: true,
                state: Some(current),
            });
        }

        if self.verb == Verb::Format && current.is_running() {
            return Err(ActionError::Precondition(format!(
                "{} is mounted, refusing to format it",
                self.component.label()
            )));
        }

        // Reading the mount data runs a command, so it comes after the already-done check: a
        // repeated start must not run anything.
        if !self.options.nocheck {
            self.check_mountdata().await?;
        }

        let command = self.command()?;

        if self.verb == Verb::Start && self.component.kind() == ComponentKind::Client {
            if let Some(path) = self.component.mount_path() {
                tokio::fs::create_dir_all(path).await?;
            }
        }

        match self.verb {
            Verb::Start => self.component.set_state(ComponentState::Starting),
            Verb::Stop => self.component.set_state(ComponentState::Stopping),
            _ => {}
        }

        let ran = if self.verb == Verb::Stop && self.component.uses_loop_device() {
            let _loop = self.ctx.loop_lock.lock().await;
            command::run_shell(&command, self.ctx.timeout).await
        } else {
            command::run_shell(&command, self.ctx.timeout).await
        };
        if let Err(ActionError::Timeout(_)) = &ran {
            // Nothing is known about the outcome; the probed state is the last known one.
            self.component.set_state(current);
        }
        ran?;

        let state = match self.verb {
            Verb::Start => self.component.running_state(),
            Verb::Stop | Verb::Format => ComponentState::Offline,
            Verb::Execute | Verb::Status => probe::probe(self.component, &self.ctx.probe).await?,
        };

        Ok(Completion {
            skipped: false,
            state: Some(state),
        })
    }

    /// Update the component's state from the outcome of the action.
    fn settle(&self, result: &ActionResult) {
        match result {
            Ok(Completion {
                state: Some(state), ..
            }) => self.component.set_state(*state),
            Ok(Completion { state: None, .. }) => {}
            // Already back at the probed state.
            Err(ActionError::Timeout(_)) => {}
            // The component was never touched.
            Err(ActionError::User(_)) => {}
            Err(e @ ActionError::NoDevice(_)) => {
                self.component
                    .set_error(ComponentState::NoDevice, e.to_string())
            }
            Err(e) => self
                .component
                .set_error(self.component.error_state(), e.to_string()),
        }
    }

    fn check_device(&self) -> Result<(), ActionError> {
        match self.component.device() {
            Some(device) if self.rule.check_device => {
                probe::check_device(&device.path, device.is_block).map_err(ActionError::NoDevice)
            }
            _ => Ok(()),
        }
    }

    async fn check_mountdata(&self) -> Result<(), ActionError> {
        let Some(device) = self.component.device() else {
            return Ok(());
        };
        if !self.rule.check_mountdata || self.ctx.commands.mountdata.is_empty() {
            return Ok(());
        }

        let command = command::substitute(&self.ctx.commands.mountdata, &self.variables())?;
        let output = command::run_shell(&command, self.ctx.timeout)
            .await
            .map_err(|e| ActionError::Precondition(format!("cannot read mount data: {e}")))?;
        if !output.contains(self.component.label()) {
            return Err(ActionError::Precondition(format!(
                "mount data of {} does not match {}",
                device.path,
                self.component.label()
            )));
        }

        Ok(())
    }

    /// Build the command line this action runs.
    fn command(&self) -> Result<String, ActionError> {
        let commands = &self.ctx.commands;
        let kind = self.component.kind();
        let template = match (self.verb, kind) {
            // The command is exactly what the operator supplied.
            (Verb::Execute, _) => {
                return self
                    .options
                    .options
                    .clone()
                    .filter(|o| !o.trim().is_empty())
                    .ok_or_else(|| ActionError::User("execute requires a command".to_string()));
            }
            (Verb::Status, _) => {
                return Err(ActionError::User("status runs no command".to_string()));
            }
            (Verb::Format, ComponentKind::Mgt) => &commands.mgt_format,
            (Verb::Format, ComponentKind::Mdt) => &commands.mdt_format,
            (Verb::Format, ComponentKind::Ost) => &commands.ost_format,
            (Verb::Start, ComponentKind::Router) => &commands.router_start,
            (Verb::Stop, ComponentKind::Router) => &commands.router_stop,
            (Verb::Start, ComponentKind::Client) => &commands.client_start,
            (Verb::Stop, ComponentKind::Client) => &commands.client_stop,
            (Verb::Start, _) => &commands.target_start,
            (Verb::Stop, _) => &commands.target_stop,
            (Verb::Format, _) => {
                return Err(ActionError::User(format!("cannot format a {kind}")));
            }
        };

        command::substitute(template, &self.variables())
    }

    /// The values available to command templates.
    fn variables(&self) -> HashMap<&'static str, String> {
        let c = self.component;
        let device = c.device();
        let jdev = device.and_then(|d| d.jdev.clone());

        HashMap::from([
            ("fs_name", c.fs_name().to_string()),
            ("label", c.label().to_string()),
            ("kind", c.kind().name().to_string()),
            (
                "index",
                device.map(|d| d.index.to_string()).unwrap_or_default(),
            ),
            (
                "device",
                device.map(|d| d.path.clone()).unwrap_or_default(),
            ),
            (
                "journal",
                jdev.as_ref()
                    .map(|j| format!("--mkfsoptions=\"-J device={j}\""))
                    .unwrap_or_default(),
            ),
            ("jdev", jdev.unwrap_or_default()),
            (
                "mount_path",
                c.mount_path().unwrap_or_default().to_string(),
            ),
            ("mgsnids", self.ctx.mgs_nids.clone()),
            (
                "options",
                self.options.options.clone().unwrap_or_default(),
            ),
            (
                "umount_flags",
                if c.uses_loop_device() { "-d" } else { "" }.to_string(),
            ),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        component::TargetDevice,
        server::{Server, ServerGroup},
    };

    #[test]
    fn verb_rules() {
        let start = VerbRule::lookup(Verb::Start, ComponentKind::Ost).unwrap();
        assert!(start.check_device && start.check_mountdata);
        assert!(start.holds(ComponentState::Mounted));
        assert!(start.holds(ComponentState::Migrated));
        assert!(!start.holds(ComponentState::Offline));

        let stop = VerbRule::lookup(Verb::Stop, ComponentKind::Client).unwrap();
        assert!(stop.holds(ComponentState::Offline));
        assert!(!stop.holds(ComponentState::TargetError));

        assert!(VerbRule::lookup(Verb::Format, ComponentKind::Router).is_none());
        let format = VerbRule::lookup(Verb::Format, ComponentKind::Mgt).unwrap();
        assert!(format.check_device && !format.check_mountdata);
        assert!(!format.holds(ComponentState::Offline));
    }

    #[test]
    fn errors_map_to_flags() {
        let failed = ActionError::Execution {
            code: 7,
            output: "boom".to_string(),
        };
        assert_eq!(failed.rc_flags(ComponentKind::Mdt), RcFlags::ERROR);
        assert_eq!(
            failed.rc_flags(ComponentKind::Router),
            RcFlags::ERROR | RcFlags::CLIENT
        );
        assert_eq!(
            ActionError::Timeout("x".to_string()).rc_flags(ComponentKind::Ost),
            RcFlags::UNHEALTHY
        );

        let (status, rc, output) = failed.to_wire();
        assert_eq!((status, rc), (DoneStatus::Failed, 7));
        assert!(matches!(
            ActionError::from_wire(status, rc, output),
            Some(ActionError::Execution { code: 7, .. })
        ));
        assert!(ActionError::from_wire(DoneStatus::Skipped, 0, None).is_none());
    }

    fn context() -> ActionContext {
        ActionContext {
            commands: Commands::default(),
            probe: ProbeConfig::default(),
            timeout: Duration::from_secs(10),
            mgs_nids: "10.0.0.1@tcp".to_string(),
            loop_lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    fn ost(is_block: bool) -> Component {
        Component::new(
            ComponentKind::Ost,
            "testfs-OST0000".to_string(),
            "testfs",
            Arc::new(Server::new("oss1", vec![])),
            ServerGroup::new(),
        )
        .with_device(TargetDevice {
            path: "/srv/ost0.img".to_string(),
            jdev: None,
            index: 0,
            is_block,
        })
        .with_mount_path("/mnt/testfs/ost/0".to_string())
    }

    #[test]
    fn file_backed_targets_release_their_loop_device() {
        let ctx = context();
        let options = ActionOptions::default();

        let loop_backed = ost(false);
        let stop = Action::new(&loop_backed, Verb::Stop, &ctx, &options).unwrap();
        assert_eq!(stop.command().unwrap(), "umount -d /mnt/testfs/ost/0");

        let block = ost(true);
        let stop = Action::new(&block, Verb::Stop, &ctx, &options).unwrap();
        assert_eq!(stop.command().unwrap(), "umount  /mnt/testfs/ost/0");
    }

    #[test]
    fn router_stop_unloads_modules() {
        let ctx = context();
        let options = ActionOptions::default();
        let router = Component::new(
            ComponentKind::Router,
            "router@rtr1".to_string(),
            "testfs",
            Arc::new(Server::new("rtr1", vec![])),
            ServerGroup::new(),
        );

        let stop = Action::new(&router, Verb::Stop, &ctx, &options).unwrap();
        assert_eq!(stop.command().unwrap(), "lustre_rmmod");
        let start = Action::new(&router, Verb::Start, &ctx, &options).unwrap();
        assert!(start.command().unwrap().starts_with("modprobe lnet"));

        let rule = VerbRule::lookup(Verb::Start, ComponentKind::Router).unwrap();
        assert!(rule.holds(ComponentState::Mounted));
        let rule = VerbRule::lookup(Verb::Stop, ComponentKind::Router).unwrap();
        assert!(rule.holds(ComponentState::Offline));
    }
}
