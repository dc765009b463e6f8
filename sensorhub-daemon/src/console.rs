//! Operator console: one command per stdin line.

use std::fmt::Write as _;

use sensorhub_core::registry::Role;
use sensorhub_core::{Coordinator, CoordinatorError, OutboundAction};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, warn};

use crate::transport::Hub;

const HELP: &str = "\
commands:
  status                    session and node summary
  nodes                     list known nodes
  create <label>            create a session
  assign <device> <role>    primary | secondary | reference
  arm                       check readiness and arm
  start                     synchronised start
  stop                      stop recording and collect files
  event <label>             record a stimulus marker
  abort [reason]            abort the session
  reset                     abort and forget every node
  help                      this text";

#[derive(Debug, Clone, PartialEq)]
pub enum ConsoleCommand {
    Status,
    Nodes,
    Create(String),
    Assign(String, Role),
    Arm,
    Start,
    Stop,
    Event(String),
    Abort(Option<String>),
    Reset,
    Help,
}

pub fn parse_command(line: &str) -> Result<ConsoleCommand, String> {
    let line = line.trim();
    let (word, rest) = match line.split_once(char::is_whitespace) {
        Some((w, r)) => (w, r.trim()),
        None => (line, ""),
    };
    let need = |what: &str| {
        if rest.is_empty() {
            Err(format!("usage: {word} <{what}>"))
        } else {
            Ok(rest.to_string())
        }
    };
    match word {
        "status" => Ok(ConsoleCommand::Status),
        "nodes" => Ok(ConsoleCommand::Nodes),
        "create" => need("label").map(ConsoleCommand::Create),
        "assign" => {
            let mut parts = rest.split_whitespace();
            match (parts.next(), parts.next(), parts.next()) {
                (Some(device), Some(role), None) => {
                    let role = role.parse::<Role>().map_err(|e| e.to_string())?;
                    Ok(ConsoleCommand::Assign(device.to_string(), role))
                }
                _ => Err("usage: assign <device> <role>".to_string()),
            }
        }
        "arm" => Ok(ConsoleCommand::Arm),
        "start" => Ok(ConsoleCommand::Start),
        "stop" => Ok(ConsoleCommand::Stop),
        "event" => need("label").map(ConsoleCommand::Event),
        "abort" => Ok(ConsoleCommand::Abort(
            (!rest.is_empty()).then(|| rest.to_string()),
        )),
        "reset" => Ok(ConsoleCommand::Reset),
        "help" | "?" => Ok(ConsoleCommand::Help),
        other => Err(format!("unknown command {other:?}, try help")),
    }
}

/// Read commands from stdin until EOF. A daemon without a terminal just returns.
pub async fn run_console(hub: Hub) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(l)) => l,
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "console read failed");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        let reply = match parse_command(&line) {
            Ok(cmd) => execute(&hub, cmd).await,
            Err(msg) => msg,
        };
        println!("{reply}");
    }
    debug!("console closed");
}

/// Run one command and return the text to show the operator.
pub async fn execute(hub: &Hub, cmd: ConsoleCommand) -> String {
    let now = crate::now_ms();
    let result: Result<Vec<OutboundAction>, CoordinatorError> = {
        let mut core = hub.core().lock().await;
        match cmd {
            ConsoleCommand::Status => return status(&core),
            ConsoleCommand::Nodes => return nodes(&core),
            ConsoleCommand::Help => return HELP.to_string(),
            ConsoleCommand::Create(label) => core.create_session(&label, now),
            ConsoleCommand::Assign(device, role) => core.assign_role(&device, role, now),
            ConsoleCommand::Arm => core.arm(now),
            ConsoleCommand::Start => core.start(now),
            ConsoleCommand::Stop => core.stop(now),
            ConsoleCommand::Event(label) => core.add_stimulus(&label, now),
            ConsoleCommand::Abort(reason) => {
                core.abort(reason.as_deref().unwrap_or("operator abort"), now)
            }
            ConsoleCommand::Reset => core.reset(now),
        }
    };
    match result {
        Ok(actions) => {
            hub.dispatch(actions).await;
            let core = hub.core().lock().await;
            format!("ok ({})", core.session_state())
        }
        Err(e) => format!("error: {e}"),
    }
}

fn status(core: &Coordinator) -> String {
    let mut out = String::new();
    match core.session() {
        Some(s) => {
            let _ = writeln!(out, "session {} \"{}\": {}", s.session_id, s.label, s.state);
            if let Some(start) = s.start_time {
                let _ = writeln!(out, "  start {start}");
            }
            let _ = writeln!(
                out,
                "  members {}  excluded {}  files {}  events {}",
                s.members.len(),
                s.excluded.len(),
                s.files.len(),
                s.events.len()
            );
            for m in &s.members {
                let mut flags = Vec::new();
                if m.degraded {
                    flags.push("degraded");
                }
                if m.disconnected {
                    flags.push("disconnected");
                }
                if m.unsynchronised {
                    flags.push("unsynchronised");
                }
                let _ = writeln!(out, "  - {} {}", m.device_id, flags.join(","));
            }
        }
        None => {
            let _ = writeln!(out, "no session");
        }
    }
    let _ = write!(out, "{} node(s) known", core.nodes().len());
    out
}

fn nodes(core: &Coordinator) -> String {
    let mut out = String::new();
    for n in core.nodes() {
        let caps: Vec<&str> = n.capabilities.iter().map(|c| c.as_str()).collect();
        let sync = match core.clock().estimate(&n.device_id) {
            Some(est) => format!(
                "offset {:.1}ms q {:.2}",
                est.offset_ms,
                core.clock().quality(&n.device_id)
            ),
            None => "unsynced".to_string(),
        };
        let battery = n
            .battery_level
            .map_or_else(|| "-".to_string(), |b| format!("{b}%"));
        let _ = writeln!(
            out,
            "{:<16} {:<12} battery {:<4} {} [{}]",
            n.device_id,
            format!("{:?}", n.state),
            battery,
            sync,
            caps.join(",")
        );
    }
    if out.is_empty() {
        out.push_str("no nodes");
    }
    out.trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use sensorhub_core::{CoordinatorConfig, SessionState, SessionStore};
    use std::sync::Arc;
    use tokio::sync::{broadcast, Mutex};

    #[test]
    fn parses_commands() {
        assert_eq!(parse_command("status"), Ok(ConsoleCommand::Status));
        assert_eq!(
            parse_command("  create  pilot P01 "),
            Ok(ConsoleCommand::Create("pilot P01".into()))
        );
        assert_eq!(
            parse_command("assign phone-1 primary"),
            Ok(ConsoleCommand::Assign("phone-1".into(), Role::PrimaryRecorder))
        );
        assert_eq!(parse_command("abort"), Ok(ConsoleCommand::Abort(None)));
        assert_eq!(
            parse_command("abort sensor fell off"),
            Ok(ConsoleCommand::Abort(Some("sensor fell off".into())))
        );
        assert_eq!(
            parse_command("event stimulus A"),
            Ok(ConsoleCommand::Event("stimulus A".into()))
        );
    }

    #[test]
    fn rejects_bad_input() {
        assert!(parse_command("create").is_err());
        assert!(parse_command("assign phone-1").is_err());
        assert!(parse_command("assign phone-1 pilot").is_err());
        assert!(parse_command("launch").is_err());
    }

    #[tokio::test]
    async fn create_then_status() {
        let dir = tempfile::TempDir::new().unwrap();
        let core = Coordinator::new(CoordinatorConfig::default(), SessionStore::new(dir.path()));
        let (events, _) = broadcast::channel(16);
        let hub = Hub::new(Arc::new(Mutex::new(core)), events);

        let reply = execute(&hub, ConsoleCommand::Create("pilot".into())).await;
        assert!(reply.starts_with("ok"), "{reply}");
        assert_eq!(hub.core().lock().await.session_state(), SessionState::Configuring);
        let status = execute(&hub, ConsoleCommand::Status).await;
        assert!(status.contains("\"pilot\""), "{status}");

        let reply = execute(&hub, ConsoleCommand::Start).await;
        assert!(reply.starts_with("error"), "{reply}");
        assert_eq!(execute(&hub, ConsoleCommand::Nodes).await, "no nodes");
    }
}
