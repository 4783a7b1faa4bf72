// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;

use crate::config::Config;
use crate::filesystem::FileSystem;

/// Given a relative `path` in the test directory, prepend the
/// full path to the test directory.
fn test_path(path: &str) -> String {
    std::env::var("CARGO_MANIFEST_DIR").unwrap() + "/tests/" + path
}

trait IgnoreEexist {
    fn ignore_eexist(self) -> Self;
}

impl IgnoreEexist for io::Result<()> {
    fn ignore_eexist(self) -> Self {
        match self {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// The remote shell used by tests. Instead of connecting to the named host it logs the request
/// and runs the command locally, so every "server" of a test is the machine running the test.
/// A host given its own configuration file (see `own_mount_table`) is pointed at it.
const FAKE_SHELL: &str = r#"#!/bin/sh
host="$1"
shift
dir="$(dirname "$0")"
echo "$host $*" >> "$dir/remote_log"
cmd="$*"
if [ -f "$dir/shoal-$host.toml" ]; then
    cmd=$(printf '%s' "$cmd" | sed "s|$dir/shoal.toml|$dir/shoal-$host.toml|")
fi
exec sh -c "$cmd"
"#;

/// A TestEnvironment holds all the information needed to access a test's runtime state. This
/// includes a "private" working directory which stands in for the parts of the system that
/// shoal reads and changes: the mount table, the LNet routes file, devices, and a log of every
/// command that was run.
///
/// All access to the test's state on the filesystem should be done via methods on TestEnvironment
/// rather than coded in the tests themselves.
pub struct TestEnvironment {
    /// The path to this test's private working directory.
    private_dir_path: String,

    /// The shoal binary path has to be passed in as an argument from the tests because the
    /// CARGO_BIN_EXE_* environment variables aren't defined during non-test compilation.
    binary_path: String,

    remote_timeout_secs: u64,

    local_timeout_secs: u64,

    /// Command templates replacing the defaults written by `write_config`.
    commands: Vec<(String, String)>,

    /// Hosts that see a mount table of their own instead of the shared one.
    own_mounts: Vec<String>,
}

impl TestEnvironment {
    /// Set up an environment for a test named `test_id`.
    ///
    /// Creates a specific unique subdirectory for the test, with an empty mount table, an empty
    /// command log, and the fake remote shell.
    pub fn new(test_id: &str, binary_path: &str) -> Self {
        // Each test gets a "private" directory named after its test_id.
        let private_dir_path = test_path(&format!("test_output/{test_id}"));
        // Start by emptying out the test's private directory, so that files from a previous test
        // run don't impact this run:
        match std::fs::remove_dir_all(&private_dir_path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => panic!("Could not clean up test directory: {e}"),
        };

        std::fs::create_dir(test_path("test_output"))
            .ignore_eexist()
            .unwrap();
        std::fs::create_dir(&private_dir_path).unwrap();

        let env = Self {
            private_dir_path,
            binary_path: binary_path.to_string(),
            remote_timeout_secs: 60,
            local_timeout_secs: 30,
            commands: Vec::new(),
            own_mounts: Vec::new(),
        };

        fs::write(env.path("mounts"), "").unwrap();
        fs::write(env.path("command_log"), "").unwrap();
        fs::write(env.path("remote_log"), "").unwrap();
        fs::write(env.path("routes"), "Routing disabled\n").unwrap();
        env.remote_shell(FAKE_SHELL);

        env
    }

    /// The full path of `name` inside the test's private directory.
    pub fn path(&self, name: &str) -> String {
        format!("{}/{}", self.private_dir_path, name)
    }

    /// Replace the remote shell with a script of the test's choosing.
    pub fn remote_shell(&self, script: &str) {
        let path = self.path("remote_shell");
        fs::write(&path, script).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    }

    pub fn set_remote_timeout(&mut self, secs: u64) {
        self.remote_timeout_secs = secs;
    }

    pub fn set_local_timeout(&mut self, secs: u64) {
        self.local_timeout_secs = secs;
    }

    /// Use `template` for the command named `name` in the next `write_config`.
    pub fn set_command(&mut self, name: &str, template: &str) {
        self.commands.retain(|(n, _)| n != name);
        self.commands.push((name.to_string(), template.to_string()));
    }

    /// Give `host` a mount table of its own, so that what is mounted through it is not seen by
    /// the other servers. Takes effect at the next `write_config`.
    pub fn own_mount_table(&mut self, host: &str) {
        fs::write(self.mounts_path(Some(host)), "").unwrap();
        self.own_mounts.push(host.to_string());
    }

    fn mounts_path(&self, host: Option<&str>) -> String {
        match host {
            Some(host) => self.path(&format!("mounts_{host}")),
            None => self.path("mounts"),
        }
    }

    /// Create a file-backed device and return its path.
    pub fn device(&self, name: &str) -> String {
        let path = self.path(name);
        fs::write(&path, "").unwrap();
        path
    }

    /// Write the configuration file for the test and return its path.
    ///
    /// `filesystems` holds the `[[filesystems]]` tables. Command templates that record what they
    /// do in the command log and update the fake mount table are added to the last filesystem.
    pub fn write_config(&self, filesystems: &str) -> String {
        for host in &self.own_mounts {
            let config = self.render_config(filesystems, Some(host));
            fs::write(self.path(&format!("shoal-{host}.toml")), config).unwrap();
        }

        let path = self.path("shoal.toml");
        fs::write(&path, self.render_config(filesystems, None)).unwrap();
        path
    }

    fn render_config(&self, filesystems: &str, host: Option<&str>) -> String {
        let dir = &self.private_dir_path;
        let log = self.path("command_log");
        let mounts = self.mounts_path(host);
        let routes = self.path("routes");

        let unmount = format!(
            "grep -v ' {{mount_path}} ' {mounts} > {mounts}.tmp; mv {mounts}.tmp {mounts}"
        );
        let mut commands: Vec<(String, String)> = [
            ("target_mount_path", format!("{dir}/mnt/{{kind}}{{index}}")),
            ("mgt_format", format!("echo '{{label}} format' >> {log}")),
            ("mdt_format", format!("echo '{{label}} format {{mgsnids}}' >> {log}")),
            ("ost_format", format!("echo '{{label}} format {{mgsnids}}' >> {log}")),
            ("mountdata", "echo {label}".to_string()),
            (
                "target_start",
                format!("echo '{{label}} start' >> {log} && echo '{{device}} {{mount_path}} lustre rw 0 0' >> {mounts}"),
            ),
            (
                "target_stop",
                format!("echo '{{label}} stop' >> {log} && {unmount}"),
            ),
            (
                "client_start",
                format!("echo '{{label}} start' >> {log} && echo '{{mgsnids}}:/{{fs_name}} {{mount_path}} lustre rw 0 0' >> {mounts}"),
            ),
            (
                "client_stop",
                format!("echo '{{label}} stop' >> {log} && {unmount}"),
            ),
            (
                "router_start",
                format!("echo '{{label}} start' >> {log} && echo 'Routing enabled' > {routes}"),
            ),
            (
                "router_stop",
                format!("echo '{{label}} stop' >> {log} && echo 'Routing disabled' > {routes}"),
            ),
        ]
        .into_iter()
        .map(|(name, template)| (name.to_string(), template))
        .collect();

        for (name, template) in &self.commands {
            match commands.iter_mut().find(|(n, _)| n == name) {
                Some((_, t)) => *t = template.clone(),
                None => commands.push((name.clone(), template.clone())),
            }
        }

        let commands: String = commands
            .iter()
            .map(|(name, template)| {
                format!("{name} = {}\n", toml::Value::String(template.clone()))
            })
            .collect();

        format!(
            r#"local_timeout_secs = {local_timeout}

[remote]
shell = ["{shell}"]
program = "{program}"
timeout_secs = {timeout}

[probe]
mounts = "{mounts}"
recovery_status = "{dir}/recovery_{{label}}"
lnet_routes = "{routes}"

{filesystems}

[filesystems.commands]
{commands}"#,
            local_timeout = self.local_timeout_secs,
            shell = self.path("remote_shell"),
            program = self.binary_path,
            timeout = self.remote_timeout_secs,
        )
    }

    /// Make the LNet routes file report routing as enabled.
    pub fn enable_routing(&self) {
        fs::write(self.path("routes"), "Routing enabled\n").unwrap();
    }

    /// Every line written to `name` in the test's private directory.
    pub fn lines(&self, name: &str) -> Vec<String> {
        read_lines(&self.path(name))
    }

    /// Assemble the filesystem described by the test's configuration file.
    pub fn filesystem(&self) -> FileSystem {
        let path = self.path("shoal.toml");
        let config = Config::load(&path).unwrap();
        FileSystem::new(&config, None, Some(&path)).unwrap()
    }

    /// Every command run so far, as "<label> <verb>" lines.
    pub fn command_log(&self) -> Vec<String> {
        read_lines(&self.path("command_log"))
    }

    /// Every remote invocation so far, as "<host> <command line>" lines.
    pub fn remote_log(&self) -> Vec<String> {
        read_lines(&self.path("remote_log"))
    }

    /// The mount paths currently in the fake mount table.
    pub fn mounted(&self) -> Vec<String> {
        read_lines(&self.path("mounts"))
            .iter()
            .filter_map(|line| line.split_whitespace().nth(1).map(str::to_string))
            .collect()
    }

    /// Make a target report that it is recovering.
    pub fn set_recovering(&self, label: &str) {
        fs::write(
            self.path(&format!("recovery_{label}")),
            "status: RECOVERING\n",
        )
        .unwrap();
    }
}

fn read_lines(path: &str) -> Vec<String> {
    fs::read_to_string(path)
        .unwrap()
        .lines()
        .map(str::to_string)
        .collect()
}
