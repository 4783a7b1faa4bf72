// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use std::{
    fmt,
    sync::{Arc, Mutex},
};

use serde::{Deserialize, Serialize};

use crate::{
    rc::RcFlags,
    server::{FailoverError, Server, ServerGroup},
};

/// The kinds of component that make up a filesystem.
///
/// The declaration order is the order in which components are started; they are stopped in the
/// reverse order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ComponentKind {
    Mgt,
    Mdt,
    Ost,
    Router,
    Client,
}

impl ComponentKind {
    pub const ALL: [ComponentKind; 5] = [
        ComponentKind::Mgt,
        ComponentKind::Mdt,
        ComponentKind::Ost,
        ComponentKind::Router,
        ComponentKind::Client,
    ];

    /// Storage targets are the kinds backed by a device.
    pub fn is_target(self) -> bool {
        matches!(
            self,
            ComponentKind::Mgt | ComponentKind::Mdt | ComponentKind::Ost
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            ComponentKind::Mgt => "mgt",
            ComponentKind::Mdt => "mdt",
            ComponentKind::Ost => "ost",
            ComponentKind::Router => "router",
            ComponentKind::Client => "client",
        }
    }

    /// The Lustre obd type under which the kernel reports this kind of target.
    pub fn obd_type(self) -> &'static str {
        match self {
            ComponentKind::Mgt => "mgs",
            ComponentKind::Mdt => "mdt",
            ComponentKind::Ost => "obdfilter",
            ComponentKind::Router | ComponentKind::Client => "",
        }
    }
}

impl fmt::Display for ComponentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name().to_uppercase())
    }
}

/// The state of a component. A component that has not been probed yet has no state at all, which
/// is represented as `None` wherever an `Option<ComponentState>` is used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentState {
    Offline,
    Starting,
    /// Mounted for targets and clients, online for routers.
    Mounted,
    Stopping,
    Recovering,
    /// Mounted, on a failover server.
    Migrated,
    /// Managed outside of this filesystem's administration.
    External,
    ClientError,
    TargetError,
    NoDevice,
}

impl ComponentState {
    /// Whether the component is up, wherever it is running.
    pub fn is_running(self) -> bool {
        matches!(
            self,
            ComponentState::Mounted | ComponentState::Migrated | ComponentState::Recovering
        )
    }

    pub fn is_error(self) -> bool {
        matches!(
            self,
            ComponentState::ClientError | ComponentState::TargetError | ComponentState::NoDevice
        )
    }
}

impl fmt::Display for ComponentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                ComponentState::Offline => "offline",
                ComponentState::Starting => "starting",
                ComponentState::Mounted => "online",
                ComponentState::Stopping => "stopping",
                ComponentState::Recovering => "recovering",
                ComponentState::Migrated => "migrated",
                ComponentState::External => "external",
                ComponentState::ClientError => "client error",
                ComponentState::TargetError => "target error",
                ComponentState::NoDevice => "no device",
            }
        )
    }
}

/// The backing storage of a target.
#[derive(Debug, Clone, PartialEq)]
pub struct TargetDevice {
    pub path: String,
    pub jdev: Option<String>,
    pub index: u32,
    /// False for file-backed targets, which the kernel mounts through a loop device.
    pub is_block: bool,
}

/// What is known about a component's state, including what was known before the latest change so
/// that an error never erases the last good information.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StateRecord {
    pub state: Option<ComponentState>,
    pub previous: Option<ComponentState>,
    pub message: Option<String>,
}

/// A single administrable unit of a filesystem: a target, a router or a client mount.
#[derive(Debug)]
pub struct Component {
    label: String,
    kind: ComponentKind,
    fs_name: String,
    device: Option<TargetDevice>,
    mount_path: Option<String>,
    external: bool,

    default_server: Arc<Server>,
    /// The server currently believed to host the component. This is always either
    /// `default_server` or a member of `failservers`.
    server: Mutex<Arc<Server>>,
    failservers: ServerGroup,

    record: Mutex<StateRecord>,

    /// Held for the full lifetime of an action so that actions on the same component never
    /// overlap.
    busy: tokio::sync::Mutex<()>,
}

impl Component {
    pub fn new(
        kind: ComponentKind,
        label: String,
        fs_name: &str,
        server: Arc<Server>,
        failservers: ServerGroup,
    ) -> Self {
        Component {
            label,
            kind,
            fs_name: fs_name.to_string(),
            device: None,
            mount_path: None,
            external: false,
            default_server: Arc::clone(&server),
            server: Mutex::new(server),
            failservers,
            record: Mutex::new(StateRecord::default()),
            busy: tokio::sync::Mutex::new(()),
        }
    }

    pub fn with_device(mut self, device: TargetDevice) -> Self {
        self.device = Some(device);
        self
    }

    pub fn with_mount_path(mut self, mount_path: String) -> Self {
        self.mount_path = Some(mount_path);
        self
    }

    pub fn with_external(mut self, external: bool) -> Self {
        self.external = external;
        self
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn kind(&self) -> ComponentKind {
        self.kind
    }

    pub fn fs_name(&self) -> &str {
        &self.fs_name
    }

    pub fn device(&self) -> Option<&TargetDevice> {
        self.device.as_ref()
    }

    pub fn mount_path(&self) -> Option<&str> {
        self.mount_path.as_deref()
    }

    pub fn is_external(&self) -> bool {
        self.external
    }

    pub fn default_server(&self) -> &Arc<Server> {
        &self.default_server
    }

    pub fn server(&self) -> Arc<Server> {
        Arc::clone(&self.server.lock().unwrap())
    }

    pub fn failservers(&self) -> &ServerGroup {
        &self.failservers
    }

    /// Whether the component is bound to a server other than its configured default.
    pub fn is_failed_over(&self) -> bool {
        *self.server() != *self.default_server
    }

    /// Whether stopping this component releases a loop device.
    pub fn uses_loop_device(&self) -> bool {
        matches!(&self.device, Some(dev) if !dev.is_block)
    }

    /// Move the component onto the failover server named in `candidates`.
    ///
    /// Returns `Ok(true)` if the component was rebound, `Ok(false)` if none of its failover
    /// servers is a candidate. If more than one of them is a candidate, the choice is ambiguous
    /// and an error is returned; the binding is not changed in either of the last two cases.
    pub fn failover<S: AsRef<str>>(&self, candidates: &[S]) -> Result<bool, FailoverError> {
        match self.failservers.select(candidates) {
            Ok(server) => {
                log::info!(
                    "{}: failing over from {} to {}",
                    self.label,
                    self.server(),
                    server
                );
                *self.server.lock().unwrap() = server;
                Ok(true)
            }
            Err(FailoverError::NoMatch(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub fn state(&self) -> Option<ComponentState> {
        self.record.lock().unwrap().state
    }

    pub fn record(&self) -> StateRecord {
        self.record.lock().unwrap().clone()
    }

    /// Record a new state. Only actions and incoming events change a component's state.
    pub(crate) fn set_state(&self, state: ComponentState) {
        self.update(state, None);
    }

    /// Record an error state along with the reason for it.
    pub(crate) fn set_error(&self, state: ComponentState, message: String) {
        self.update(state, Some(message));
    }

    /// Put back a record taken earlier with `record()`.
    pub(crate) fn restore(&self, saved: StateRecord) {
        let mut record = self.record.lock().unwrap();
        if record.state != saved.state {
            log::info!(
                "Restoring state of {} to {}",
                self.label,
                saved.state.map_or("unknown".to_string(), |s| s.to_string())
            );
        }
        *record = saved;
    }

    fn update(&self, state: ComponentState, message: Option<String>) {
        let mut record = self.record.lock().unwrap();
        let old = record.state;
        if old != Some(state) {
            record.previous = old;
        }
        record.state = Some(state);
        record.message = message;
        std::mem::drop(record);

        if old != Some(state) {
            log::info!(
                "Updating state of {} from {} to {}",
                self.label,
                old.map_or("unknown".to_string(), |s| s.to_string()),
                state
            );
        }
    }

    /// The error state appropriate to this kind of component.
    pub fn error_state(&self) -> ComponentState {
        if self.kind.is_target() {
            ComponentState::TargetError
        } else {
            ComponentState::ClientError
        }
    }

    /// The state a successful start leaves the component in.
    pub fn running_state(&self) -> ComponentState {
        if self.is_failed_over() {
            ComponentState::Migrated
        } else {
            ComponentState::Mounted
        }
    }

    pub(crate) async fn lock(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.busy.lock().await
    }

    /// The contribution of this component's current state to the aggregate return code.
    pub fn rc_flags(&self) -> RcFlags {
        let client = if self.kind.is_target() {
            RcFlags::OK
        } else {
            RcFlags::CLIENT
        };
        match self.state() {
            None => RcFlags::UNHEALTHY,
            Some(ComponentState::Mounted) => RcFlags::OK,
            Some(ComponentState::Migrated) => RcFlags::MIGRATED,
            Some(ComponentState::Recovering) => RcFlags::RECOVERING,
            Some(ComponentState::Offline) => RcFlags::OFFLINE,
            Some(ComponentState::External) => RcFlags::EXTERNAL,
            Some(ComponentState::Starting) | Some(ComponentState::Stopping) => RcFlags::UNHEALTHY,
            Some(ComponentState::ClientError)
            | Some(ComponentState::TargetError)
            | Some(ComponentState::NoDevice) => RcFlags::ERROR | client,
        }
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} on {})", self.label, self.kind, self.server())
    }
}

/// Format the label of a component. Targets are named the way Lustre names them; routers and
/// clients are named after the server they run on.
pub fn component_label(fs_name: &str, kind: ComponentKind, index: u32, host: &str) -> String {
    match kind {
        ComponentKind::Mgt => "MGS".to_string(),
        ComponentKind::Mdt => format!("{fs_name}-MDT{index:04x}"),
        ComponentKind::Ost => format!("{fs_name}-OST{index:04x}"),
        ComponentKind::Router => format!("router@{host}"),
        ComponentKind::Client => format!("{fs_name}-client@{host}"),
    }
}
