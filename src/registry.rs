// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! registry.rs
//!
//! Static lookup tables: which constructor builds each kind of component, and which inventory
//! backend supplies the component list of a filesystem.

use std::{collections::HashMap, sync::Arc};

use crate::{
    action::command::substitute,
    component::{component_label, Component, ComponentKind, TargetDevice},
    config::{ConfigError, FsConfig},
    server::{Server, ServerGroup},
};

/// One component as described by an inventory backend, before it is built.
#[derive(Debug, Clone)]
pub struct ComponentSpec {
    pub kind: ComponentKind,
    pub index: u32,
    pub server: Arc<Server>,
    pub failservers: ServerGroup,
    pub device: Option<TargetDevice>,
    pub mount_path: Option<String>,
    pub external: bool,
}

type Constructor = fn(&str, ComponentSpec) -> Component;

const KINDS: [(&str, ComponentKind, Constructor); 5] = [
    ("mgt", ComponentKind::Mgt, build_target),
    ("mdt", ComponentKind::Mdt, build_target),
    ("ost", ComponentKind::Ost, build_target),
    ("router", ComponentKind::Router, build_router),
    ("client", ComponentKind::Client, build_client),
];

/// Look up a component kind by its configuration name.
pub fn kind(name: &str) -> Result<ComponentKind, ConfigError> {
    KINDS
        .iter()
        .find(|(n, _, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, kind, _)| *kind)
        .ok_or_else(|| ConfigError::UnknownKind(name.to_string()))
}

/// Build the component described by `spec`.
pub fn construct(fs_name: &str, spec: ComponentSpec) -> Component {
    let constructor = KINDS
        .iter()
        .find(|(_, kind, _)| *kind == spec.kind)
        .map(|(_, _, constructor)| *constructor)
        .unwrap_or(build_target);
    constructor(fs_name, spec)
}

fn label(fs_name: &str, spec: &ComponentSpec) -> String {
    component_label(fs_name, spec.kind, spec.index, spec.server.hostname())
}

fn build_target(fs_name: &str, spec: ComponentSpec) -> Component {
    let label = label(fs_name, &spec);
    let mut component = Component::new(spec.kind, label, fs_name, spec.server, spec.failservers)
        .with_external(spec.external);
    if let Some(device) = spec.device {
        component = component.with_device(device);
    }
    if let Some(mount_path) = spec.mount_path {
        component = component.with_mount_path(mount_path);
    }
    component
}

fn build_router(fs_name: &str, spec: ComponentSpec) -> Component {
    let label = label(fs_name, &spec);
    Component::new(
        ComponentKind::Router,
        label,
        fs_name,
        spec.server,
        ServerGroup::new(),
    )
    .with_external(spec.external)
}

fn build_client(fs_name: &str, spec: ComponentSpec) -> Component {
    let label = label(fs_name, &spec);
    let component = Component::new(
        ComponentKind::Client,
        label,
        fs_name,
        spec.server,
        ServerGroup::new(),
    )
    .with_external(spec.external);
    match spec.mount_path {
        Some(mount_path) => component.with_mount_path(mount_path),
        None => component,
    }
}

/// A source of the components that make up a filesystem.
pub trait Inventory {
    fn components(&self, fs: &FsConfig) -> Result<Vec<ComponentSpec>, ConfigError>;
}

const BACKENDS: [(&str, fn() -> Box<dyn Inventory>); 1] = [("config", config_inventory)];

/// Look up an inventory backend by name.
pub fn inventory(name: &str) -> Result<Box<dyn Inventory>, ConfigError> {
    BACKENDS
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, backend)| backend())
        .ok_or_else(|| ConfigError::UnknownBackend(name.to_string()))
}

fn config_inventory() -> Box<dyn Inventory> {
    Box::new(ConfigInventory)
}

/// Reads the component list straight from the configuration file.
struct ConfigInventory;

impl Inventory for ConfigInventory {
    fn components(&self, fs: &FsConfig) -> Result<Vec<ComponentSpec>, ConfigError> {
        let servers: HashMap<&str, Arc<Server>> = fs
            .servers
            .iter()
            .map(|s| (s.hostname.as_str(), Arc::new(Server::from_config(s))))
            .collect();
        let lookup = |owner: &str, name: &str| {
            servers
                .get(name)
                .cloned()
                .ok_or_else(|| ConfigError::UnknownServer(owner.to_string(), name.to_string()))
        };

        let mut specs = Vec::new();

        for target in &fs.targets {
            let kind = kind(&target.kind)?;
            if !kind.is_target() {
                return Err(ConfigError::UnknownKind(target.kind.clone()));
            }
            let owner = component_label(&fs.name, kind, target.index, &target.server);

            let server = lookup(&owner, &target.server)?;
            let failservers = target
                .failservers
                .iter()
                .map(|name| lookup(&owner, name))
                .collect::<Result<ServerGroup, _>>()?;

            let mount_path = match &target.mount_path {
                Some(path) => path.clone(),
                None => {
                    let vars = HashMap::from([
                        ("fs_name", fs.name.clone()),
                        ("kind", kind.name().to_string()),
                        ("index", target.index.to_string()),
                        ("label", owner.clone()),
                    ]);
                    substitute(&fs.commands.target_mount_path, &vars)
                        .map_err(|e| ConfigError::Template(e.to_string()))?
                }
            };

            specs.push(ComponentSpec {
                kind,
                index: target.index,
                server,
                failservers,
                device: Some(TargetDevice {
                    path: target.device.clone(),
                    jdev: target.jdev.clone(),
                    index: target.index,
                    is_block: target.block,
                }),
                mount_path: Some(mount_path),
                external: target.external,
            });
        }

        for router in &fs.routers {
            let owner = component_label(&fs.name, ComponentKind::Router, 0, &router.server);
            specs.push(ComponentSpec {
                kind: ComponentKind::Router,
                index: 0,
                server: lookup(&owner, &router.server)?,
                failservers: ServerGroup::new(),
                device: None,
                mount_path: None,
                external: router.external,
            });
        }

        for client in &fs.clients {
            let owner = component_label(&fs.name, ComponentKind::Client, 0, &client.server);
            specs.push(ComponentSpec {
                kind: ComponentKind::Client,
                index: 0,
                server: lookup(&owner, &client.server)?,
                failservers: ServerGroup::new(),
                device: None,
                mount_path: Some(client.mount_path.clone()),
                external: client.external,
            });
        }

        Ok(specs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    const CONFIG: &str = r#"
[[filesystems]]
name = "testfs"

[[filesystems.servers]]
hostname = "mds1"

[[filesystems.servers]]
hostname = "mds2"

[[filesystems.targets]]
type = "MDT"
index = 1
device = "/dev/sdb"
server = "mds1"
failservers = ["mds2"]

[[filesystems.clients]]
server = "mds2"
mount_path = "/mnt/testfs"
"#;

    #[test]
    fn kinds() {
        assert_eq!(kind("ost").unwrap(), ComponentKind::Ost);
        assert_eq!(kind("Router").unwrap(), ComponentKind::Router);
        assert!(matches!(kind("oss"), Err(ConfigError::UnknownKind(_))));
        assert!(matches!(
            inventory("ldap"),
            Err(ConfigError::UnknownBackend(_))
        ));
    }

    #[test]
    fn config_backend() {
        let config: Config = toml::from_str(CONFIG).unwrap();
        let fs = config.filesystem(None).unwrap();
        let specs = inventory(&fs.backend).unwrap().components(fs).unwrap();

        let components: Vec<Component> = specs
            .into_iter()
            .map(|spec| construct(&fs.name, spec))
            .collect();
        assert_eq!(components.len(), 2);

        let mdt = &components[0];
        assert_eq!(mdt.label(), "testfs-MDT0001");
        assert_eq!(mdt.mount_path(), Some("/mnt/testfs/mdt/1"));
        assert!(mdt.failservers().contains("mds2"));

        let client = &components[1];
        assert_eq!(client.label(), "testfs-client@mds2");
        assert_eq!(client.mount_path(), Some("/mnt/testfs"));
    }

    #[test]
    fn undeclared_server() {
        let mut config: Config = toml::from_str(CONFIG).unwrap();
        config.filesystems[0].targets[0].failservers = vec!["mds9".to_string()];
        let fs = &config.filesystems[0];

        match ConfigInventory.components(fs) {
            Err(ConfigError::UnknownServer(owner, name)) => {
                assert_eq!(owner, "testfs-MDT0001");
                assert_eq!(name, "mds9");
            }
            other => panic!("unexpected result {other:?}"),
        }
    }
}
