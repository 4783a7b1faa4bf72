// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use std::io;

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("could not read config file '{0}': {1}")]
    Io(String, #[source] io::Error),
    #[error("could not parse config file: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("no filesystem named '{0}' in configuration")]
    UnknownFilesystem(String),
    #[error("configuration defines several filesystems, one must be selected")]
    NoFilesystemSelected,
    #[error("unknown component kind '{0}'")]
    UnknownKind(String),
    #[error("unknown inventory backend '{0}'")]
    UnknownBackend(String),
    #[error("component {0} references undeclared server '{1}'")]
    UnknownServer(String, String),
    #[error("duplicate component label '{0}'")]
    DuplicateLabel(String),
    #[error("filesystem '{0}' has no management target")]
    NoMgt(String),
    #[error("invalid template: {0}")]
    Template(String),
}

/// Config, along with its children, is the model for the Lustre filesystems used in the
/// configuration file. The config file is deserialized into a Config object.
///
/// The model used in the config file is intentionally different from the model used to track the
/// state of a filesystem in memory (see `filesystem::FileSystem`), so that either one can change
/// without the other.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    /// Upper bound on the run time of a command executed on the local host.
    #[serde(default = "default_local_timeout")]
    pub local_timeout_secs: u64,

    #[serde(default)]
    pub remote: RemoteConfig,

    #[serde(default)]
    pub probe: ProbeConfig,

    pub filesystems: Vec<FsConfig>,
}

impl Config {
    /// Read and parse the config file at `path`.
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let contents =
            std::fs::read_to_string(path).map_err(|e| ConfigError::Io(path.to_string(), e))?;
        Ok(toml::from_str(&contents)?)
    }

    /// Look up a filesystem by name. When no name is given, the configuration must define exactly
    /// one filesystem.
    pub fn filesystem(&self, name: Option<&str>) -> Result<&FsConfig, ConfigError> {
        match name {
            Some(name) => self
                .filesystems
                .iter()
                .find(|fs| fs.name == name)
                .ok_or_else(|| ConfigError::UnknownFilesystem(name.to_string())),
            None => match self.filesystems.as_slice() {
                [only] => Ok(only),
                _ => Err(ConfigError::NoFilesystemSelected),
            },
        }
    }
}

fn default_local_timeout() -> u64 {
    600
}

/// How operations are proxied to remote servers.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RemoteConfig {
    /// The remote shell command. The target hostname and then the remote command line are
    /// appended to it.
    #[serde(default = "default_shell")]
    pub shell: Vec<String>,

    /// The program run on the remote side. Defaults to this executable.
    pub program: Option<String>,

    #[serde(default = "default_remote_timeout")]
    pub timeout_secs: u64,

    /// Maximum number of remote servers contacted at once.
    #[serde(default = "default_fanout")]
    pub fanout: usize,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        RemoteConfig {
            shell: default_shell(),
            program: None,
            timeout_secs: default_remote_timeout(),
            fanout: default_fanout(),
        }
    }
}

fn default_shell() -> Vec<String> {
    vec![
        "ssh".to_string(),
        "-oBatchMode=yes".to_string(),
        "-oConnectTimeout=10".to_string(),
    ]
}

fn default_remote_timeout() -> u64 {
    300
}

fn default_fanout() -> usize {
    64
}

/// Locations that are read to determine component state. These never run commands.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ProbeConfig {
    #[serde(default = "crate::default_mounts_path")]
    pub mounts: String,

    /// Template for a target's recovery status file. `{kind}` expands to the Lustre obd type
    /// (mgs, mdt, obdfilter).
    #[serde(default = "default_recovery_status")]
    pub recovery_status: String,

    #[serde(default = "default_lnet_routes")]
    pub lnet_routes: String,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        ProbeConfig {
            mounts: crate::default_mounts_path(),
            recovery_status: default_recovery_status(),
            lnet_routes: default_lnet_routes(),
        }
    }
}

fn default_recovery_status() -> String {
    "/proc/fs/lustre/{kind}/{label}/recovery_status".to_string()
}

fn default_lnet_routes() -> String {
    "/proc/sys/lnet/routes".to_string()
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct FsConfig {
    pub name: String,

    /// The inventory backend that supplies device lists for this filesystem.
    #[serde(default = "default_backend")]
    pub backend: String,

    #[serde(default)]
    pub servers: Vec<Server>,

    #[serde(default)]
    pub targets: Vec<Target>,

    #[serde(default)]
    pub routers: Vec<Router>,

    #[serde(default)]
    pub clients: Vec<Client>,

    #[serde(default)]
    pub commands: Commands,
}

fn default_backend() -> String {
    "config".to_string()
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Server {
    pub hostname: String,
    #[serde(default)]
    pub nids: Vec<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Target {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub index: u32,
    pub device: String,
    pub jdev: Option<String>,
    /// Whether the device is a block device. File-backed targets are mounted via a loop device.
    #[serde(default = "default_true")]
    pub block: bool,
    pub server: String,
    #[serde(default)]
    pub failservers: Vec<String>,
    pub mount_path: Option<String>,
    #[serde(default)]
    pub external: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Router {
    pub server: String,
    #[serde(default)]
    pub external: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Client {
    pub server: String,
    pub mount_path: String,
    #[serde(default)]
    pub external: bool,
}

/// Command templates. Placeholders of the form `{name}` are substituted when an action builds
/// its command line.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct Commands {
    pub target_mount_path: String,
    pub mgt_format: String,
    pub mdt_format: String,
    pub ost_format: String,
    /// Prints the on-disk mount data of a target. An empty template disables the check.
    pub mountdata: String,
    pub target_start: String,
    pub target_stop: String,
    pub client_start: String,
    pub client_stop: String,
    pub router_start: String,
    pub router_stop: String,
}

impl Default for Commands {
    fn default() -> Self {
        Commands {
            target_mount_path: "/mnt/{fs_name}/{kind}/{index}".to_string(),
            mgt_format: "mkfs.lustre --mgs --reformat {options} {device}".to_string(),
            mdt_format: "mkfs.lustre --mdt --fsname={fs_name} --index={index} \
                         --mgsnode={mgsnids} {journal} --reformat {options} {device}"
                .to_string(),
            ost_format: "mkfs.lustre --ost --fsname={fs_name} --index={index} \
                         --mgsnode={mgsnids} {journal} --reformat {options} {device}"
                .to_string(),
            mountdata: "tunefs.lustre --dryrun {device}".to_string(),
            target_start: "mkdir -p {mount_path} && mount -t lustre {options} {device} {mount_path}"
                .to_string(),
            target_stop: "umount {umount_flags} {mount_path}".to_string(),
            client_start: "mount -t lustre {options} {mgsnids}:/{fs_name} {mount_path}".to_string(),
            client_stop: "umount {mount_path}".to_string(),
            router_start: "modprobe lnet 'forwarding=\"enabled\"' && lctl network up".to_string(),
            router_stop: "lustre_rmmod".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[remote]
fanout = 8

[[filesystems]]
name = "testfs"

[[filesystems.servers]]
hostname = "mds1"
nids = ["10.0.0.1@tcp"]

[[filesystems.targets]]
type = "mgt"
device = "/dev/sdb"
server = "mds1"

[[filesystems.targets]]
type = "ost"
index = 3
device = "/srv/ost3.img"
block = false
server = "mds1"
failservers = ["oss2"]

[filesystems.commands]
router_stop = "true"
"#;

    #[test]
    fn defaults_fill_missing_sections() {
        let config: Config = toml::from_str(SAMPLE).unwrap();

        assert_eq!(config.local_timeout_secs, 600);
        assert_eq!(config.remote.fanout, 8);
        assert_eq!(config.remote.timeout_secs, 300);
        assert_eq!(config.remote.shell[0], "ssh");

        let fs = config.filesystem(None).unwrap();
        assert_eq!(fs.backend, "config");
        assert!(fs.targets[0].block);
        assert!(!fs.targets[1].block);
        assert_eq!(fs.targets[1].failservers, vec!["oss2".to_string()]);
        assert_eq!(fs.commands.router_stop, "true");
        assert_eq!(fs.commands.client_stop, "umount {mount_path}");
    }

    #[test]
    fn filesystem_lookup() {
        let config: Config = toml::from_str(SAMPLE).unwrap();

        assert!(config.filesystem(Some("testfs")).is_ok());
        assert!(matches!(
            config.filesystem(Some("other")),
            Err(ConfigError::UnknownFilesystem(_))
        ));
    }
}
