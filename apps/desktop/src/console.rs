//! Operator command parsing and one-line rendering for the terminal host.

use anyhow::{anyhow, bail};
use client_core::{BridgeEvent, RouterEvent, TransactionSession};
use shared::{domain::FormTab, protocol::TransactionResult};
use supervisor::{ExitInfo, SupervisorEvent};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperatorCommand {
    Tab(FormTab),
    Amount(String),
    OrderNo(String),
    RefundOrder {
        order_id: String,
        amount: String,
        order_no: String,
    },
    Submit,
    Abort,
    Dismiss,
    Reset,
    Reconnect,
    Restart,
    Status,
    Help,
    Quit,
}

pub const HELP: &str = "commands: tab sale|refund, amount <n>, order <no>, \
refund-order <id> <amount> <no>, submit, abort, dismiss, reset, reconnect, restart, status, quit";

/// Parses one stdin line. Blank lines yield `None`.
pub fn parse_command(line: &str) -> anyhow::Result<Option<OperatorCommand>> {
    let mut words = line.split_whitespace();
    let Some(verb) = words.next() else {
        return Ok(None);
    };
    let args: Vec<&str> = words.collect();

    let command = match (verb.to_ascii_lowercase().as_str(), args.as_slice()) {
        ("tab", [tab]) => OperatorCommand::Tab(parse_tab(tab)?),
        ("amount", [amount]) => OperatorCommand::Amount((*amount).to_string()),
        ("amount", []) => OperatorCommand::Amount(String::new()),
        ("order", [order_no]) => OperatorCommand::OrderNo((*order_no).to_string()),
        ("order", []) => OperatorCommand::OrderNo(String::new()),
        ("refund-order", [order_id, amount, order_no]) => OperatorCommand::RefundOrder {
            order_id: (*order_id).to_string(),
            amount: (*amount).to_string(),
            order_no: (*order_no).to_string(),
        },
        ("submit", []) => OperatorCommand::Submit,
        ("abort", []) => OperatorCommand::Abort,
        ("dismiss", []) => OperatorCommand::Dismiss,
        ("reset", []) => OperatorCommand::Reset,
        ("reconnect", []) => OperatorCommand::Reconnect,
        ("restart", []) => OperatorCommand::Restart,
        ("status", []) => OperatorCommand::Status,
        ("help" | "?", []) => OperatorCommand::Help,
        ("quit" | "exit", []) => OperatorCommand::Quit,
        (verb, _) => bail!("unrecognized command '{verb}' with {} argument(s)", args.len()),
    };
    Ok(Some(command))
}

fn parse_tab(raw: &str) -> anyhow::Result<FormTab> {
    match raw.to_ascii_lowercase().as_str() {
        "sale" => Ok(FormTab::Sale),
        "refund" => Ok(FormTab::Refund),
        other => Err(anyhow!("unknown tab '{other}', expected sale or refund")),
    }
}

fn flag(value: bool) -> &'static str {
    if value {
        "yes"
    } else {
        "no"
    }
}

fn or_dash(value: &str) -> &str {
    if value.is_empty() {
        "-"
    } else {
        value
    }
}

fn tab_name(tab: FormTab) -> &'static str {
    match tab {
        FormTab::Sale => "SALE",
        FormTab::Refund => "REFUND",
    }
}

pub fn render_session(session: &TransactionSession) -> String {
    let timeout = session
        .timeout_ms
        .map_or_else(|| "-".to_string(), |ms| ms.to_string());
    let mut line = format!(
        "[{}] worker={} link={} device={} elapsed={}/{} msg=\"{}\" | {} amount={} order={}",
        session.app_state,
        session.worker_state,
        if session.connected { "up" } else { "down" },
        if session.device_connected { "up" } else { "down" },
        session.elapsed_ms,
        timeout,
        session.message,
        tab_name(session.form.tab),
        or_dash(&session.form.amount),
        or_dash(&session.form.order_no),
    );
    if let Some(order_id) = &session.form.refunding_order_id {
        line.push_str(&format!(" refunding={order_id}"));
    }
    line.push_str(&format!(
        " | submit={} abort={} input={} modal={}",
        flag(session.can_submit()),
        flag(session.can_abort()),
        flag(session.can_input_form()),
        flag(session.show_modal()),
    ));
    if let Some(result) = &session.last_result {
        line.push_str(&format!(" | result {}", render_result(result)));
    }
    if let Some(error) = &session.last_error {
        line.push_str(&format!(" | error \"{error}\""));
    }
    line
}

fn render_result(result: &TransactionResult) -> String {
    let fields = [
        ("type", &result.trans_type),
        ("amount", &result.amount),
        ("approval", &result.approval_no),
        ("order", &result.order_no),
        ("card", &result.card_no),
        ("resp", &result.resp_code),
    ];
    let parts: Vec<String> = fields
        .iter()
        .filter_map(|(name, value)| value.as_ref().map(|value| format!("{name}={value}")))
        .collect();
    if parts.is_empty() {
        "(empty)".to_string()
    } else {
        parts.join(" ")
    }
}

fn render_exit(exit: &ExitInfo) -> String {
    let code = exit
        .code
        .map_or_else(|| "-".to_string(), |code| code.to_string());
    let signal = exit
        .signal
        .map_or_else(|| "-".to_string(), |signal| signal.to_string());
    let mut line = format!("worker {} exited (code {code}, signal {signal})", exit.pid);
    if exit.superseded {
        line.push_str(", replaced");
    }
    line
}

/// Text for forwarded events that the session line does not already show.
pub fn render_event(event: &RouterEvent) -> Option<String> {
    match event {
        RouterEvent::Supervisor(SupervisorEvent::Ready) => Some("worker ready".to_string()),
        RouterEvent::Supervisor(SupervisorEvent::Exit(exit)) => Some(render_exit(exit)),
        RouterEvent::Supervisor(SupervisorEvent::Log(log)) => Some(format!(
            "{} worker[{}] {}",
            log.at.format("%H:%M:%S%.3f"),
            log.level,
            log.message
        )),
        RouterEvent::Supervisor(SupervisorEvent::Error(fault)) => {
            Some(format!("worker error: {fault}"))
        }
        RouterEvent::Bridge(BridgeEvent::Error(fault)) => Some(format!("channel error: {fault}")),
        RouterEvent::Bridge(BridgeEvent::Message(message)) if message.data.is_none() => {
            Some(format!("worker says: {}", message.message))
        }
        RouterEvent::Bridge(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use client_core::SessionEvent;
    use shared::domain::WorkerState;

    use super::*;

    #[test]
    fn parses_form_and_control_commands() {
        assert_eq!(
            parse_command("tab Refund").expect("parse"),
            Some(OperatorCommand::Tab(FormTab::Refund))
        );
        assert_eq!(
            parse_command("  amount 1200 ").expect("parse"),
            Some(OperatorCommand::Amount("1200".into()))
        );
        assert_eq!(
            parse_command("refund-order 42 990 ORD-42").expect("parse"),
            Some(OperatorCommand::RefundOrder {
                order_id: "42".into(),
                amount: "990".into(),
                order_no: "ORD-42".into(),
            })
        );
        assert_eq!(parse_command("QUIT").expect("parse"), Some(OperatorCommand::Quit));
        assert_eq!(parse_command("   ").expect("parse"), None);
    }

    #[test]
    fn rejects_unknown_or_malformed_commands() {
        assert!(parse_command("tab layaway").is_err());
        assert!(parse_command("refund-order 42").is_err());
        assert!(parse_command("submit now").is_err());
        assert!(parse_command("launch").is_err());
    }

    #[test]
    fn session_line_shows_state_form_and_guards() {
        let session = TransactionSession::new()
            .apply(&SessionEvent::Connected)
            .apply(&SessionEvent::StatusUpdate {
                worker_state: WorkerState::Idle,
                message: "ready".into(),
                elapsed_ms: 0,
                timeout_ms: None,
                device_connected: true,
            })
            .apply(&SessionEvent::SetAmount("100".into()));

        let line = render_session(&session);
        assert!(line.starts_with("[IDLE] worker=IDLE link=up device=up"));
        assert!(line.contains("SALE amount=100 order=-"));
        assert!(line.contains("submit=yes abort=no input=yes modal=no"));
    }

    #[test]
    fn exit_lines_mark_replaced_workers() {
        let exit = ExitInfo {
            pid: 7,
            code: None,
            signal: Some(15),
            superseded: true,
        };
        let line = render_event(&RouterEvent::Supervisor(SupervisorEvent::Exit(exit)))
            .expect("exit is rendered");
        assert_eq!(line, "worker 7 exited (code -, signal 15), replaced");
        assert_eq!(render_event(&RouterEvent::Bridge(BridgeEvent::Connected)), None);
    }
}
