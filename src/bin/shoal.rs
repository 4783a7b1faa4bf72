// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use clap::Parser;

use shoal_lib::{
    commands::{self, Cli},
    rc::RcFlags,
};

/// The shoal binary administers a filesystem as a controller, or, with -R, carries out an
/// operation on behalf of one. Its exit status is the aggregate return code.
fn main() {
    let args = Cli::parse();

    let default_level = if args.verbose { "info" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().filter_or("SHOAL_LOG", default_level))
        .init();

    let rc = match commands::main(&args) {
        Ok(rc) => rc,
        Err(_) => RcFlags::USER_ERROR,
    };

    std::process::exit(rc.exit_code());
}
