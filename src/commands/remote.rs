// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! Remote mode: the side of a proxied operation that runs on the server hosting the components.
//!
//! Only events are written to stdout. The final event is always a `result`, whose code is also the
//! exit status of the process.

use crate::{
    action::Verb,
    event::{Event, EventSink, StdoutSink},
    rc::RcFlags,
};

use super::{load_filesystem, report_error, Cli, Handle, HandledResult, OpArgs};

pub async fn remote(cli: &Cli, verb: Verb, args: &OpArgs) -> HandledResult<RcFlags> {
    let sink = StdoutSink;

    let fs = load_filesystem(cli, args)?;
    let selection = args.selection().handle_err(|e| report_error(cli, &e))?;

    // The controller sends -F when the components it names are bound to a failover server, which
    // is this one.
    if !args.failover.is_empty() {
        fs.failover(&args.failover, &selection)
            .handle_err(|e| report_error(cli, &e))?;
    }

    let count = fs
        .select(&selection)
        .handle_err(|e| report_error(cli, &e))?
        .len();
    sink.emit(&Event::Start {
        verb,
        count: count as u32,
    });

    let report = fs
        .run_here(verb, &selection, &args.action_options(), &sink)
        .await
        .handle_err(|e| report_error(cli, &e))?;

    // State flags such as OFFLINE describe the components, which the controller learns from
    // their events; only failures make the remote invocation itself fail.
    let rc = report.rc.failures();
    sink.emit(&Event::Result {
        rc: rc.exit_code(),
        output: None,
    });

    Ok(rc)
}
