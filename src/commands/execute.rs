// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use crate::{action::Verb, rc::RcFlags};

use super::{handled_error, report, Cli, HandledResult, OpArgs, Operation};

/// Run an arbitrary command, given with -o, once for each selected component on the server that
/// hosts it.
pub async fn execute(cli: &Cli, args: &OpArgs) -> HandledResult<RcFlags> {
    if args.options.as_deref().map_or(true, |o| o.trim().is_empty()) {
        eprintln!("Error: execute requires a command, given with -o");
        return handled_error();
    }

    let op = Operation::prepare(cli, args)?;
    let report = op.run(Verb::Execute).await?;

    report::print(&report);
    Ok(report.rc.failures())
}
