// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! probe.rs
//!
//! Determining the state of a component from what the local kernel reports. Probing only reads
//! files; it never runs a command.

use std::io;

use nix::sys::stat::{stat, SFlag};

use crate::{
    component::{Component, ComponentKind, ComponentState},
    config::ProbeConfig,
};

use super::{command::substitute, ActionError};

/// One line of a mount table such as `/proc/mounts`.
#[derive(Debug, PartialEq)]
pub struct MountEntry {
    pub source: String,
    pub target: String,
    pub fstype: String,
}

/// Parse a mount table in the `/proc/mounts` format.
pub fn parse_mounts(contents: &str) -> Vec<MountEntry> {
    contents
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            Some(MountEntry {
                source: unescape(fields.next()?),
                target: unescape(fields.next()?),
                fstype: fields.next()?.to_string(),
            })
        })
        .collect()
}

/// The kernel escapes whitespace and backslashes in mount table fields as octal sequences.
fn unescape(field: &str) -> String {
    field
        .replace("\\040", " ")
        .replace("\\011", "\t")
        .replace("\\012", "\n")
        .replace("\\134", "\\")
}

fn is_lustre_mounted_at(mounts: &[MountEntry], path: &str) -> bool {
    let path = path.trim_end_matches('/');
    mounts
        .iter()
        .any(|m| m.fstype == "lustre" && m.target.trim_end_matches('/') == path)
}

/// Whether the LNet routes file reports routing as enabled.
pub fn routing_enabled(routes: &str) -> bool {
    routes
        .lines()
        .next()
        .is_some_and(|line| line.contains("Routing enabled"))
}

/// Whether a target's recovery status file reports that recovery is in progress.
pub fn recovering(recovery_status: &str) -> bool {
    recovery_status.lines().any(|line| {
        line.trim_start()
            .strip_prefix("status:")
            .is_some_and(|status| status.trim() == "RECOVERING")
    })
}

/// Read a file, treating a missing file as empty. Files under /proc disappear when the kernel
/// module that provides them is not loaded.
async fn read_optional(path: &str) -> io::Result<String> {
    match tokio::fs::read_to_string(path).await {
        Ok(contents) => Ok(contents),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(String::new()),
        Err(e) => Err(e),
    }
}

/// Determine the current state of `component` on this host.
pub async fn probe(
    component: &Component,
    config: &ProbeConfig,
) -> Result<ComponentState, ActionError> {
    if component.is_external() {
        return Ok(ComponentState::External);
    }

    if component.kind() == ComponentKind::Router {
        let routes = read_optional(&config.lnet_routes).await?;
        return Ok(if routing_enabled(&routes) {
            ComponentState::Mounted
        } else {
            ComponentState::Offline
        });
    }

    let mounts = tokio::fs::read_to_string(&config.mounts)
        .await
        .map_err(|e| {
            io::Error::new(
                e.kind(),
                format!("could not read mount table '{}': {e}", config.mounts),
            )
        })?;
    let mounts = parse_mounts(&mounts);

    let Some(mount_path) = component.mount_path() else {
        return Err(ActionError::User(format!(
            "{} has no mount path",
            component.label()
        )));
    };

    if !is_lustre_mounted_at(&mounts, mount_path) {
        return Ok(ComponentState::Offline);
    }

    if component.kind() == ComponentKind::Client {
        return Ok(ComponentState::Mounted);
    }

    let vars = std::collections::HashMap::from([
        ("kind", component.kind().obd_type().to_string()),
        ("label", component.label().to_string()),
        ("fs_name", component.fs_name().to_string()),
    ]);
    let path = substitute(&config.recovery_status, &vars)?;
    if recovering(&read_optional(&path).await?) {
        return Ok(ComponentState::Recovering);
    }

    Ok(component.running_state())
}

/// Check that `path` exists and is a block device (or a regular file, for file-backed targets).
pub fn check_device(path: &str, is_block: bool) -> Result<(), String> {
    let st = stat(path).map_err(|e| format!("cannot access device {path}: {e}"))?;
    let file_type = SFlag::from_bits_truncate(st.st_mode) & SFlag::S_IFMT;

    if is_block && file_type != SFlag::S_IFBLK {
        Err(format!("{path} is not a block device"))
    } else if !is_block && file_type != SFlag::S_IFREG {
        Err(format!("{path} is not a regular file"))
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mount_table() {
        let table = "\
/dev/sda1 / ext4 rw,relatime 0 0
/dev/sdb /mnt/testfs/mdt/0 lustre ro,svname=testfs-MDT0000 0 0
mgs@tcp:/testfs /mnt/my\\040client lustre rw 0 0
";
        let mounts = parse_mounts(table);
        assert_eq!(mounts.len(), 3);
        assert!(is_lustre_mounted_at(&mounts, "/mnt/testfs/mdt/0"));
        assert!(is_lustre_mounted_at(&mounts, "/mnt/testfs/mdt/0/"));
        assert!(is_lustre_mounted_at(&mounts, "/mnt/my client"));
        assert!(!is_lustre_mounted_at(&mounts, "/"));
    }

    #[test]
    fn lnet_and_recovery() {
        assert!(routing_enabled("Routing enabled\nnet hops priority state router\n"));
        assert!(!routing_enabled("Routing disabled\n"));
        assert!(!routing_enabled(""));

        assert!(recovering("status: RECOVERING\nrecovery_start: 1\n"));
        assert!(!recovering("status: COMPLETE\n"));
        assert!(!recovering(""));
    }

    #[test]
    fn devices() {
        assert!(check_device("/dev/null", true).is_err());
        assert!(check_device("/no/such/device", true).is_err());
        assert!(check_device(env!("CARGO_MANIFEST_DIR"), false).is_err());

        let manifest = format!("{}/Cargo.toml", env!("CARGO_MANIFEST_DIR"));
        assert!(check_device(&manifest, false).is_ok());
        assert!(check_device(&manifest, true).is_err());
    }
}
