// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use crate::{action::Verb, rc::RcFlags};

use super::{report, Cli, HandledResult, OpArgs, Operation};

/// Probe every selected component where it runs and print its state. The exit status describes
/// the state of the filesystem: 0 when every component is up on its home server.
pub async fn status(cli: &Cli, args: &OpArgs) -> HandledResult<RcFlags> {
    let op = Operation::prepare(cli, args)?;
    let report = op.run(Verb::Status).await?;

    report::print(&report);
    Ok(report.rc)
}
