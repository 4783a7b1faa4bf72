// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use crate::{action::Verb, rc::RcFlags};

use super::{report, Cli, HandledResult, OpArgs, Operation};

/// Start the selected components, management target first and clients last.
pub async fn start(cli: &Cli, args: &OpArgs) -> HandledResult<RcFlags> {
    let op = Operation::prepare(cli, args)?;
    let report = op.run(Verb::Start).await?;

    report::print(&report);
    Ok(report.rc)
}
