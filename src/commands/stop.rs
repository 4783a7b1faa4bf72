// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use crate::{action::Verb, rc::RcFlags};

use super::{report, Cli, HandledResult, OpArgs, Operation};

/// Stop the selected components, clients first and the management target last.
///
/// A stopped filesystem reports OFFLINE, which is what was asked for, so only the failure flags
/// make up the exit status.
pub async fn stop(cli: &Cli, args: &OpArgs) -> HandledResult<RcFlags> {
    let op = Operation::prepare(cli, args)?;
    let report = op.run(Verb::Stop).await?;

    report::print(&report);
    Ok(report.rc.failures())
}
