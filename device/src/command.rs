use std::fmt::Write;
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use sysinfo::System;
use tracing::info;

use crate::arbiter::CaptureArbiter;
use crate::reporter::LinkStatus;
use crate::scheduler::{lock, SharedState};

const HELP: &str = "Commands: pause, resume, status, reset, help";

/// One operator input line, trimmed and lower-cased.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Pause,
    Resume,
    Status,
    Reset,
    Help,
    Unknown(String),
}

impl Command {
    pub fn parse(line: &str) -> Self {
        let normalized = line.trim().to_lowercase();
        match normalized.as_str() {
            "pause" => Command::Pause,
            "resume" => Command::Resume,
            "status" => Command::Status,
            "reset" => Command::Reset,
            "help" => Command::Help,
            _ => Command::Unknown(normalized),
        }
    }
}

/// Result of dispatching a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    /// Text for the operator; the loop carries on.
    Reply(String),
    /// The device must restart. Nothing runs after this.
    Restart,
}

pub struct CommandController {
    state: SharedState,
    link: LinkStatus,
    arbiter: Arc<CaptureArbiter>,
    system: System,
}

impl CommandController {
    pub fn new(state: SharedState, link: LinkStatus, arbiter: Arc<CaptureArbiter>) -> Self {
        Self {
            state,
            link,
            arbiter,
            system: System::new(),
        }
    }

    pub fn dispatch(&mut self, command: Command) -> Dispatch {
        match command {
            Command::Pause => {
                lock(&self.state).enabled = false;
                info!("inference paused");
                Dispatch::Reply("Inference paused".into())
            }
            Command::Resume => {
                lock(&self.state).enabled = true;
                info!("inference resumed");
                Dispatch::Reply("Inference resumed".into())
            }
            Command::Status => Dispatch::Reply(self.status_report()),
            Command::Reset => {
                info!("restart requested");
                Dispatch::Restart
            }
            Command::Help => Dispatch::Reply(HELP.into()),
            Command::Unknown(raw) => {
                Dispatch::Reply(format!("Unknown command '{raw}'. {HELP}"))
            }
        }
    }

    fn status_report(&mut self) -> String {
        self.system.refresh_memory();
        let stats = self.arbiter.stats();
        let state = lock(&self.state).clone();

        let mut out = String::from("System Status:\n");
        let _ = writeln!(
            out,
            "Network: {}",
            if self.link.is_connected() {
                "Connected"
            } else {
                "Disconnected"
            }
        );
        let _ = writeln!(
            out,
            "Inference: {} (every {} ms)",
            if state.enabled { "Enabled" } else { "Paused" },
            state.interval.as_millis()
        );
        match state.last_run() {
            Some(at) => {
                let _ = writeln!(out, "Last cycle: {} ms ago", at.elapsed().as_millis());
            }
            None => {
                let _ = writeln!(out, "Last cycle: never");
            }
        }
        match state.last_prediction() {
            Some(last) => {
                let captured = DateTime::<Utc>::from_timestamp_millis(last.captured_at_ms)
                    .map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true))
                    .unwrap_or_else(|| last.captured_at_ms.to_string());
                let _ = writeln!(
                    out,
                    "Last prediction: {} ({:.2}%) at {captured}",
                    last.label,
                    last.score * 100.0
                );
            }
            None => {
                let _ = writeln!(out, "Last prediction: none");
            }
        }
        let _ = writeln!(
            out,
            "Camera: {} inference / {} stream frames, {} contended, {} faults",
            stats.inference_granted,
            stats.stream_granted,
            stats.inference_contended + stats.stream_contended,
            stats.faults
        );
        let _ = write!(out, "Available memory: {} bytes", self.system.available_memory());
        out
    }
}
