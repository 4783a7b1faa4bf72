// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use std::fmt::Write;

use crate::filesystem::Report;

/// Render the per-component table of a report, followed by the aggregate code.
pub fn render(report: &Report) -> String {
    let rows: Vec<[String; 5]> = report
        .components
        .iter()
        .map(|c| {
            let state = c.state.map_or("unknown".to_string(), |s| s.to_string());
            let result = match &c.result {
                Ok(done) if done.skipped => "already done".to_string(),
                Ok(_) => "ok".to_string(),
                Err(e) => e.to_string(),
            };
            [
                c.label.clone(),
                c.kind.to_string(),
                c.server.clone(),
                state,
                result,
            ]
        })
        .collect();

    let header = ["COMPONENT", "TYPE", "SERVER", "STATE", "RESULT"];
    let mut widths = header.map(str::len);
    for row in &rows {
        for (w, cell) in widths.iter_mut().zip(row) {
            *w = (*w).max(cell.len());
        }
    }

    let mut out = String::new();
    let mut line = |cells: [&str; 5]| {
        let mut text = String::new();
        for (i, cell) in cells.iter().enumerate() {
            if i + 1 == cells.len() {
                text.push_str(cell);
            } else {
                let _ = write!(text, "{:<width$}  ", cell, width = widths[i]);
            }
        }
        out.push_str(text.trim_end());
        out.push('\n');
    };

    line(header);
    for row in &rows {
        line([&row[0], &row[1], &row[2], &row[3], &row[4]]);
    }

    let _ = writeln!(out, "\n{} rc: {}", report.verb, report.rc);
    out
}

/// Print a report on stdout, and the servers that failed on stderr.
pub fn print(report: &Report) {
    print!("{}", render(report));
    for e in &report.proxy_errors {
        eprintln!("{e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        action::{ActionError, Completion, Verb},
        component::{ComponentKind, ComponentState},
        filesystem::ComponentReport,
        rc::RcFlags,
    };

    #[test]
    fn table() {
        let report = Report {
            verb: Verb::Start,
            components: vec![
                ComponentReport {
                    label: "MGS".to_string(),
                    kind: ComponentKind::Mgt,
                    server: "srv1".to_string(),
                    state: Some(ComponentState::Mounted),
                    result: Ok(Completion {
                        skipped: true,
                        state: Some(ComponentState::Mounted),
                    }),
                    rc: RcFlags::OK,
                },
                ComponentReport {
                    label: "testfs-MDT0000".to_string(),
                    kind: ComponentKind::Mdt,
                    server: "srv2".to_string(),
                    state: Some(ComponentState::TargetError),
                    result: Err(ActionError::Execution {
                        code: 5,
                        output: "mount failed".to_string(),
                    }),
                    rc: RcFlags::ERROR,
                },
            ],
            proxy_errors: vec![],
            rc: RcFlags::ERROR,
        };

        let text = render(&report);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(
            lines[0],
            "COMPONENT       TYPE  SERVER  STATE         RESULT"
        );
        assert_eq!(
            lines[1],
            "MGS             MGT   srv1    online        already done"
        );
        assert_eq!(
            lines[2],
            "testfs-MDT0000  MDT   srv2    target error  command exited with status 5: mount failed"
        );
        assert_eq!(lines[4], "start rc: ERROR (0x10)");
    }
}
