// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! event.rs
//!
//! Events are how a process running in remote mode tells the controller what it did. Each event
//! is one JSON object on one line of standard output, tagged by its `event_type`.
//!
//! No event carries the identity of the node that emitted it: the controller knows which server
//! it is talking to from the connection the bytes arrived on, and never trusts a payload to say
//! otherwise.

use std::{io::Write, sync::Mutex};

use serde::{Deserialize, Serialize};

use crate::{action::Verb, component::ComponentState};

#[derive(Debug, thiserror::Error)]
pub enum EventError {
    #[error("malformed event: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// How a single component's action ended, as reported over the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DoneStatus {
    /// The command ran and succeeded.
    Done,
    /// The desired end state already held, so no command ran.
    Skipped,
    Precondition,
    Failed,
    Timeout,
    UserError,
    RuntimeError,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum Event {
    /// Acknowledges the request; work on `count` components is beginning.
    Start { verb: Verb, count: u32 },

    /// An action on one component is beginning.
    CompStart { label: String, verb: Verb },

    /// An action on one component finished.
    CompDone {
        label: String,
        verb: Verb,
        state: Option<ComponentState>,
        status: DoneStatus,
        #[serde(default)]
        rc: i32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output: Option<String>,
    },

    /// Terminal event: the remote invocation is complete.
    Result {
        rc: i32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output: Option<String>,
    },

    /// An event type introduced by a newer version. It is skipped.
    #[serde(other)]
    Unknown,
}

impl Event {
    /// Encode the event as a single line, without the trailing newline.
    pub fn encode(&self) -> Result<String, EventError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// One line of output read from a remote server.
#[derive(Debug, PartialEq)]
pub enum Line {
    Event(Event),
    /// Anything that is not an event, e.g. a banner or error printed by the remote shell.
    Text(String),
}

/// Decode a line read from a remote server. Lines that look like a JSON object must decode as an
/// event; anything else is passed through as text.
pub fn parse_line(line: &str) -> Result<Line, EventError> {
    let trimmed = line.trim();
    if !trimmed.starts_with('{') {
        return Ok(Line::Text(line.to_string()));
    }
    Ok(Line::Event(serde_json::from_str(trimmed)?))
}

/// Where actions report what they are doing. The sink is handed to every action and proxy action
/// explicitly, so there is no process-wide notion of "the current command".
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &Event);
}

/// Writes events to standard output for a controller to read. Used in remote mode.
#[derive(Debug, Default)]
pub struct StdoutSink;

impl EventSink for StdoutSink {
    fn emit(&self, event: &Event) {
        let line = match event.encode() {
            Ok(line) => line,
            Err(e) => {
                log::error!("could not encode event {event:?}: {e}");
                return;
            }
        };
        let mut stdout = std::io::stdout().lock();
        if let Err(e) = writeln!(stdout, "{line}").and_then(|_| stdout.flush()) {
            log::error!("could not write event: {e}");
        }
    }
}

/// Reports events through the logger. Used by the controller in human mode.
#[derive(Debug, Default)]
pub struct LogSink;

impl EventSink for LogSink {
    fn emit(&self, event: &Event) {
        match event {
            Event::Start { verb, count } => log::debug!("{verb} of {count} components begins"),
            Event::CompStart { label, verb } => log::info!("{label}: {verb} begins"),
            Event::CompDone {
                label,
                verb,
                status,
                output,
                ..
            } => match status {
                DoneStatus::Done | DoneStatus::Skipped => {
                    log::info!("{label}: {verb} {status:?}")
                }
                _ => log::warn!(
                    "{label}: {verb} {status:?}: {}",
                    output.as_deref().unwrap_or("")
                ),
            },
            Event::Result { rc, .. } => log::debug!("operation finished with rc {rc}"),
            Event::Unknown => {}
        }
    }
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct Collector {
    events: Mutex<Vec<Event>>,
}

impl Collector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }
}

impl EventSink for Collector {
    fn emit(&self, event: &Event) {
        self.events.lock().unwrap().push(event.clone());
    }
}
