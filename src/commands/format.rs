// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use crate::{action::Verb, component::ComponentKind, rc::RcFlags};

use super::{report, Cli, HandledResult, OpArgs, Operation};

/// Format the selected targets. Routers and clients have nothing to format and are left alone.
pub async fn format(cli: &Cli, args: &OpArgs) -> HandledResult<RcFlags> {
    let op = Operation::prepare(cli, args)?;

    let targets = op
        .fs
        .select(&op.selection)
        .map(|comps| comps.iter().filter(|c| c.kind().is_target()).count())
        .unwrap_or(0);
    if targets == 0 {
        eprintln!(
            "Nothing to format: no {}, {} or {} selected",
            ComponentKind::Mgt,
            ComponentKind::Mdt,
            ComponentKind::Ost
        );
        return Ok(RcFlags::USER_ERROR);
    }

    let report = op.run(Verb::Format).await?;

    report::print(&report);
    Ok(report.rc.failures())
}
