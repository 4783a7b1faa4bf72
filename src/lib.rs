// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

pub mod action;
pub mod commands;
pub mod component;
pub mod config;
pub mod event;
pub mod filesystem;
pub mod proxy;
pub mod rc;
pub mod registry;
pub mod server;
pub mod test_env;

pub fn default_config_path() -> String {
    match std::env::var("SHOAL_CONFIG") {
        Ok(conf) => conf,
        Err(_) => "/etc/shoal/shoal.toml".to_string(),
    }
}

/// Gets the program that remote servers should run when an operation is proxied to them.
///
/// Unless overridden, this is the executable of the current process, so that the controller and
/// the remote side always speak the same version of the event protocol.
pub fn default_remote_program() -> String {
    match std::env::var("SHOAL_REMOTE_PROGRAM") {
        Ok(program) => program,
        Err(_) => std::env::current_exe()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "shoal".to_string()),
    }
}

pub fn default_mounts_path() -> String {
    match std::env::var("SHOAL_MOUNTS") {
        Ok(mounts) => mounts,
        Err(_) => "/proc/mounts".to_string(),
    }
}
