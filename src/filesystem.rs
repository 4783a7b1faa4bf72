// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! filesystem.rs
//!
//! A FileSystem is the set of components that make up one named Lustre filesystem. It runs an
//! operation over them in dependency order, doing the work on this host itself and handing the
//! rest to the servers that host it, and folds the outcomes into one report.

use std::{collections::HashSet, sync::Arc, time::Duration};

use futures::future::join_all;

use crate::{
    action::{probe, Action, ActionContext, ActionOptions, ActionResult, Completion, Verb},
    component::{Component, ComponentKind, ComponentState, StateRecord},
    config::{Config, ConfigError},
    event::EventSink,
    proxy::{ProxyAction, ProxyActionError, ProxyReport, ProxySettings},
    rc::RcFlags,
    registry,
    server::{FailoverError, Server},
};

#[derive(Debug, thiserror::Error)]
pub enum FsError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("no component labelled '{0}' in this filesystem")]
    UnknownLabel(String),

    #[error("cannot fail over {0}: {1}")]
    Failover(String, FailoverError),
}

impl FsError {
    pub fn rc_flags(&self) -> RcFlags {
        RcFlags::USER_ERROR
    }
}

/// Restricts an operation to part of a filesystem. Empty lists select everything.
#[derive(Debug, Clone, Default)]
pub struct Selection {
    pub labels: Vec<String>,
    /// Hostnames of the servers whose components are selected.
    pub nodes: Vec<String>,
    pub kinds: Vec<ComponentKind>,
}

impl Selection {
    pub fn labels<S: AsRef<str>>(labels: &[S]) -> Self {
        Selection {
            labels: labels.iter().map(|l| l.as_ref().to_string()).collect(),
            ..Default::default()
        }
    }

    fn matches(&self, component: &Component) -> bool {
        (self.labels.is_empty() || self.labels.iter().any(|l| l == component.label()))
            && (self.nodes.is_empty()
                || self
                    .nodes
                    .iter()
                    .any(|n| n == component.server().hostname()))
            && (self.kinds.is_empty() || self.kinds.contains(&component.kind()))
    }
}

/// The outcome of an operation on one component.
#[derive(Debug)]
pub struct ComponentReport {
    pub label: String,
    pub kind: ComponentKind,
    pub server: String,
    pub state: Option<ComponentState>,
    pub result: ActionResult,
    pub rc: RcFlags,
}

/// The outcome of an operation on a filesystem.
#[derive(Debug)]
pub struct Report {
    pub verb: Verb,
    pub components: Vec<ComponentReport>,
    /// Servers that did not complete their part of the operation.
    pub proxy_errors: Vec<ProxyActionError>,
    pub rc: RcFlags,
}

impl Report {
    pub fn component(&self, label: &str) -> Option<&ComponentReport> {
        self.components.iter().find(|c| c.label == label)
    }
}

/// Results of one phase, before they are turned into a report.
#[derive(Default)]
struct PhaseOutcome {
    results: Vec<(String, ActionResult)>,
    proxies: Vec<ProxyReport>,
}

pub struct FileSystem {
    name: String,
    /// In start order.
    components: Vec<Component>,
    ctx: ActionContext,
    proxy: ProxySettings,
}

impl FileSystem {
    /// Assemble the filesystem named `name` (or the only one configured) from `config`.
    ///
    /// `config_path` is handed to remote servers so that they read the same configuration.
    pub fn new(
        config: &Config,
        name: Option<&str>,
        config_path: Option<&str>,
    ) -> Result<Self, ConfigError> {
        let fs = config.filesystem(name)?;
        let inventory = registry::inventory(&fs.backend)?;

        let mut components: Vec<Component> = inventory
            .components(fs)?
            .into_iter()
            .map(|spec| registry::construct(&fs.name, spec))
            .collect();

        let mut seen = HashSet::new();
        for c in &components {
            if !seen.insert(c.label().to_string()) {
                return Err(ConfigError::DuplicateLabel(c.label().to_string()));
            }
        }

        components.sort_by_key(|c| c.kind());

        let mgs_nids = mgs_nids(&components).ok_or_else(|| ConfigError::NoMgt(fs.name.clone()))?;

        let ctx = ActionContext {
            commands: fs.commands.clone(),
            probe: config.probe.clone(),
            timeout: Duration::from_secs(config.local_timeout_secs),
            mgs_nids,
            loop_lock: Arc::new(tokio::sync::Mutex::new(())),
        };

        let proxy = ProxySettings {
            shell: config.remote.shell.clone(),
            program: config
                .remote
                .program
                .clone()
                .unwrap_or_else(crate::default_remote_program),
            config_path: config_path.map(str::to_string),
            timeout: Duration::from_secs(config.remote.timeout_secs),
            fanout: config.remote.fanout,
        };

        Ok(FileSystem {
            name: fs.name.clone(),
            components,
            ctx,
            proxy,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn components(&self) -> &[Component] {
        &self.components
    }

    pub fn component(&self, label: &str) -> Option<&Component> {
        self.components.iter().find(|c| c.label() == label)
    }

    /// The management server NIDs, as given to `--mgsnode` and client mounts.
    pub fn mgs_nids(&self) -> &str {
        &self.ctx.mgs_nids
    }

    /// The components matched by `selection`, in start order. Every label named by the selection
    /// must exist.
    pub fn select(&self, selection: &Selection) -> Result<Vec<&Component>, FsError> {
        if let Some(missing) = selection
            .labels
            .iter()
            .find(|l| self.component(l).is_none())
        {
            return Err(FsError::UnknownLabel(missing.clone()));
        }

        Ok(self
            .components
            .iter()
            .filter(|c| selection.matches(c))
            .collect())
    }

    /// Move every selected component that can run on one of `names` onto that server.
    ///
    /// Returns the labels of the components that moved. Stops at the first component for which
    /// the choice is ambiguous.
    pub fn failover<S: AsRef<str>>(
        &self,
        names: &[S],
        selection: &Selection,
    ) -> Result<Vec<String>, FsError> {
        let mut moved = Vec::new();
        for c in self.select(selection)? {
            match c.failover(names) {
                Ok(true) => moved.push(c.label().to_string()),
                Ok(false) => {}
                Err(e) => return Err(FsError::Failover(c.label().to_string(), e)),
            }
        }
        Ok(moved)
    }

    pub async fn start(
        &self,
        selection: &Selection,
        options: &ActionOptions,
        sink: &dyn EventSink,
    ) -> Result<Report, FsError> {
        self.run(Verb::Start, selection, options, sink).await
    }

    pub async fn stop(
        &self,
        selection: &Selection,
        options: &ActionOptions,
        sink: &dyn EventSink,
    ) -> Result<Report, FsError> {
        self.run(Verb::Stop, selection, options, sink).await
    }

    pub async fn format(
        &self,
        selection: &Selection,
        options: &ActionOptions,
        sink: &dyn EventSink,
    ) -> Result<Report, FsError> {
        self.run(Verb::Format, selection, options, sink).await
    }

    pub async fn status(
        &self,
        selection: &Selection,
        sink: &dyn EventSink,
    ) -> Result<Report, FsError> {
        self.run(Verb::Status, selection, &ActionOptions::default(), sink)
            .await
    }

    pub async fn execute(
        &self,
        selection: &Selection,
        options: &ActionOptions,
        sink: &dyn EventSink,
    ) -> Result<Report, FsError> {
        self.run(Verb::Execute, selection, options, sink).await
    }

    /// Run `verb` over the selected components. Components bound to this host are handled here,
    /// the others by the servers they are bound to.
    pub async fn run(
        &self,
        verb: Verb,
        selection: &Selection,
        options: &ActionOptions,
        sink: &dyn EventSink,
    ) -> Result<Report, FsError> {
        let selected = self.select(selection)?;
        Ok(self.run_phases(verb, &selected, options, sink, false).await)
    }

    /// Run `verb` over the selected components entirely on this host, whatever server they are
    /// bound to. This is what a server does when an operation is proxied to it.
    pub async fn run_here(
        &self,
        verb: Verb,
        selection: &Selection,
        options: &ActionOptions,
        sink: &dyn EventSink,
    ) -> Result<Report, FsError> {
        let selected = self.select(selection)?;
        Ok(self.run_phases(verb, &selected, options, sink, true).await)
    }

    async fn run_phases(
        &self,
        verb: Verb,
        selected: &[&Component],
        options: &ActionOptions,
        sink: &dyn EventSink,
        here: bool,
    ) -> Report {
        let mut outcome = PhaseOutcome::default();

        // A failed phase does not stop the later ones; every outcome is reported.
        for kinds in phases(verb) {
            let members: Vec<&Component> = selected
                .iter()
                .copied()
                .filter(|c| kinds.contains(&c.kind()))
                .filter(|c| verb != Verb::Format || c.kind().is_target())
                .collect();
            if members.is_empty() {
                continue;
            }

            log::debug!("{verb} phase {kinds:?}: {} components", members.len());
            let phase = self.run_phase(verb, &members, options, sink, here).await;
            outcome.results.extend(phase.results);
            outcome.proxies.extend(phase.proxies);
        }

        self.report(verb, outcome)
    }

    async fn run_phase(
        &self,
        verb: Verb,
        members: &[&Component],
        options: &ActionOptions,
        sink: &dyn EventSink,
        here: bool,
    ) -> PhaseOutcome {
        let (local, remote): (Vec<&Component>, Vec<&Component>) = members
            .iter()
            .partition(|c| here || c.server().is_local());

        // Loop device teardown on remote servers goes one server at a time.
        let (loop_stops, remote): (Vec<&Component>, Vec<&Component>) = remote
            .into_iter()
            .partition(|c| verb == Verb::Stop && c.uses_loop_device());

        let local_actions = local.iter().filter_map(|c| {
            let action = Action::new(c, verb, &self.ctx, options)?;
            let label = c.label().to_string();
            Some(async move { (label, action.run(sink).await) })
        });

        let proxy = ProxyAction::new(verb, &self.name, &remote, &self.proxy, options);
        let loop_proxy =
            ProxyAction::new(verb, &self.name, &loop_stops, &self.proxy, options).with_fanout(1);

        let (results, proxy_report, loop_report) = tokio::join!(
            join_all(local_actions),
            run_proxy(proxy, sink),
            run_proxy(loop_proxy, sink),
        );

        let mut outcome = PhaseOutcome {
            results,
            proxies: Vec::new(),
        };
        for mut report in [proxy_report, loop_report].into_iter().flatten() {
            for server in &mut report.servers {
                outcome.results.append(&mut server.results);
            }
            outcome.proxies.push(report);
        }

        if verb == Verb::Status && !here {
            self.find_migrated(members, &mut outcome.results, sink).await;
        }
        outcome
    }

    /// Look for the components a status phase found offline on their failover servers. A
    /// component found running on one is rebound to it and reported as migrated; the others keep
    /// what the first probe found. A failover server that cannot be reached is only logged.
    async fn find_migrated(
        &self,
        members: &[&Component],
        results: &mut [(String, ActionResult)],
        sink: &dyn EventSink,
    ) {
        let stopped: Vec<&Component> = members
            .iter()
            .copied()
            .filter(|c| {
                !c.is_external()
                    && !c.is_failed_over()
                    && c.state() == Some(ComponentState::Offline)
            })
            .collect();

        let mut candidates: Vec<(Arc<Server>, Vec<&Component>)> = Vec::new();
        for &c in &stopped {
            for server in c.failservers().iter() {
                match candidates.iter_mut().find(|(s, _)| s == server) {
                    Some((_, comps)) => comps.push(c),
                    None => candidates.push((Arc::clone(server), vec![c])),
                }
            }
        }
        if candidates.is_empty() {
            return;
        }

        let saved: Vec<StateRecord> = stopped.iter().map(|c| c.record()).collect();
        let options = ActionOptions::default();
        let searches = candidates.iter().map(|(server, comps)| {
            let options = &options;
            async move {
                let found: Vec<(String, ActionResult)> = if server.is_local() {
                    let mut found = Vec::new();
                    for c in comps {
                        let state = probe::probe(c, &self.ctx.probe).await.map(|s| Completion {
                            skipped: false,
                            state: Some(s),
                        });
                        found.push((c.label().to_string(), state));
                    }
                    found
                } else {
                    let proxy = ProxyAction::to_server(
                        Verb::Status,
                        &self.name,
                        server,
                        comps,
                        &self.proxy,
                        options,
                    );
                    proxy
                        .run(sink)
                        .await
                        .servers
                        .into_iter()
                        .flat_map(|s| s.results)
                        .collect()
                };
                (server, found)
            }
        });
        let searched: Vec<(&Arc<Server>, Vec<(String, ActionResult)>)> =
            join_all(searches).await;

        for (c, saved) in stopped.into_iter().zip(saved) {
            let running = searched.iter().find_map(|(server, found)| {
                found.iter().find_map(|(label, result)| match result {
                    Ok(Completion {
                        state: Some(state), ..
                    }) if label == c.label() && state.is_running() => Some((*server, *state)),
                    _ => None,
                })
            });

            let Some((server, state)) = running else {
                c.restore(saved);
                continue;
            };
            if let Err(e) = c.failover(&[server.hostname()]) {
                log::warn!("{}: cannot rebind to {server}: {e}", c.label());
                c.restore(saved);
                continue;
            }
            let state = match state {
                ComponentState::Mounted => ComponentState::Migrated,
                other => other,
            };
            c.set_state(state);
            if let Some((_, result)) = results.iter_mut().find(|(l, _)| l == c.label()) {
                *result = Ok(Completion {
                    skipped: false,
                    state: Some(state),
                });
            }
        }
    }

    /// Fold the results of an operation into a report, in start order.
    fn report(&self, verb: Verb, mut outcome: PhaseOutcome) -> Report {
        let mut rc = RcFlags::OK;
        let mut components = Vec::new();

        for c in &self.components {
            let Some(pos) = outcome.results.iter().position(|(l, _)| l == c.label()) else {
                continue;
            };
            let (label, result) = outcome.results.swap_remove(pos);

            let mut flags = c.rc_flags();
            if let Err(e) = &result {
                flags |= e.rc_flags(c.kind());
            }
            rc |= flags;

            components.push(ComponentReport {
                label,
                kind: c.kind(),
                server: c.server().hostname().to_string(),
                state: c.state(),
                result,
                rc: flags,
            });
        }

        let mut proxy_errors = Vec::new();
        for proxy in &outcome.proxies {
            rc |= proxy.rc_flags();
            if let Err(e) = proxy.result(verb) {
                proxy_errors.push(e);
            }
        }

        Report {
            verb,
            components,
            proxy_errors,
            rc,
        }
    }
}

async fn run_proxy(proxy: ProxyAction<'_>, sink: &dyn EventSink) -> Option<ProxyReport> {
    if proxy.servers().next().is_none() {
        return None;
    }
    Some(proxy.run(sink).await)
}

/// The order in which kinds of component are handled for `verb`. Kinds in the same phase are
/// handled concurrently.
fn phases(verb: Verb) -> Vec<Vec<ComponentKind>> {
    match verb {
        Verb::Start | Verb::Format => ComponentKind::ALL.iter().map(|k| vec![*k]).collect(),
        Verb::Stop => ComponentKind::ALL.iter().rev().map(|k| vec![*k]).collect(),
        Verb::Status | Verb::Execute => vec![ComponentKind::ALL.to_vec()],
    }
}

/// The NIDs of every server that can run the management target, in `--mgsnode` syntax: a
/// server's NIDs are separated by commas and servers by colons. A server without NIDs is named by
/// its hostname.
fn mgs_nids(components: &[Component]) -> Option<String> {
    let mgt = components.iter().find(|c| c.kind() == ComponentKind::Mgt)?;
    let servers = std::iter::once(mgt.default_server()).chain(mgt.failservers().iter());

    Some(
        servers
            .map(|s| {
                if s.nids().is_empty() {
                    s.hostname().to_string()
                } else {
                    s.nids().join(",")
                }
            })
            .collect::<Vec<_>>()
            .join(":"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"
[[filesystems]]
name = "testfs"

[[filesystems.servers]]
hostname = "mgs1"
nids = ["10.0.0.1@tcp", "192.168.0.1@o2ib"]

[[filesystems.servers]]
hostname = "mgs2"
nids = ["10.0.0.2@tcp"]

[[filesystems.servers]]
hostname = "foo1"

[[filesystems.servers]]
hostname = "foo2"

[[filesystems.servers]]
hostname = "foo3"

[[filesystems.targets]]
type = "mgt"
device = "/dev/sda"
server = "mgs1"
failservers = ["mgs2"]

[[filesystems.targets]]
type = "ost"
index = 0
device = "/dev/sdb"
server = "foo1"
failservers = ["foo2", "foo3"]

[[filesystems.targets]]
type = "mdt"
index = 0
device = "/dev/sdc"
server = "foo1"
failservers = ["foo2"]

[[filesystems.clients]]
server = "foo3"
mount_path = "/mnt/testfs"
"#;

    fn filesystem() -> FileSystem {
        let config: Config = toml::from_str(CONFIG).unwrap();
        FileSystem::new(&config, Some("testfs"), None).unwrap()
    }

    #[test]
    fn assembly() {
        let fs = filesystem();
        let labels: Vec<&str> = fs.components().iter().map(|c| c.label()).collect();
        assert_eq!(
            labels,
            vec!["MGS", "testfs-MDT0000", "testfs-OST0000", "testfs-client@foo3"]
        );
        assert_eq!(fs.mgs_nids(), "10.0.0.1@tcp,192.168.0.1@o2ib:10.0.0.2@tcp");
    }

    #[test]
    fn phase_order() {
        assert_eq!(phases(Verb::Start)[0], vec![ComponentKind::Mgt]);
        assert_eq!(phases(Verb::Stop)[0], vec![ComponentKind::Client]);
        assert_eq!(phases(Verb::Stop).len(), 5);
        assert_eq!(phases(Verb::Status).len(), 1);
    }

    #[test]
    fn selection() {
        let fs = filesystem();

        let sel = Selection {
            nodes: vec!["foo1".to_string()],
            ..Default::default()
        };
        assert_eq!(fs.select(&sel).unwrap().len(), 2);

        let sel = Selection {
            kinds: vec![ComponentKind::Client, ComponentKind::Mgt],
            ..Default::default()
        };
        assert_eq!(fs.select(&sel).unwrap().len(), 2);

        assert!(matches!(
            fs.select(&Selection::labels(&["testfs-OST0007"])),
            Err(FsError::UnknownLabel(_))
        ));
    }

    #[test]
    fn failover_to_unique_server() {
        let fs = filesystem();
        let moved = fs
            .failover(&["foo3"], &Selection::default())
            .unwrap();
        assert_eq!(moved, vec!["testfs-OST0000".to_string()]);
        assert_eq!(
            fs.component("testfs-OST0000").unwrap().server().hostname(),
            "foo3"
        );
        assert_eq!(
            fs.component("testfs-MDT0000").unwrap().server().hostname(),
            "foo1"
        );
    }

    #[test]
    fn ambiguous_failover_fails_fast() {
        let fs = filesystem();
        match fs.failover(&["foo2", "foo3"], &Selection::default()) {
            Err(FsError::Failover(label, FailoverError::Ambiguous(_))) => {
                assert_eq!(label, "testfs-OST0000")
            }
            other => panic!("unexpected result {other:?}"),
        }
        assert_eq!(
            fs.component("testfs-OST0000").unwrap().server().hostname(),
            "foo1"
        );
    }

    #[test]
    fn missing_mgt() {
        let mut config: Config = toml::from_str(CONFIG).unwrap();
        config.filesystems[0].targets.remove(0);
        assert!(matches!(
            FileSystem::new(&config, None, None),
            Err(ConfigError::NoMgt(_))
        ));
    }
}
