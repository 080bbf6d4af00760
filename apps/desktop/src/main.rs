use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::Parser;
use client_core::{
    ConnectionBridge, EventRouter, EventSink, RouterEvent, SendError, SessionEvent, SessionStore,
};
use shared::protocol::OutboundCommand;
use supervisor::ProcessSupervisor;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::mpsc,
};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod console;
mod settings;

use console::{parse_command, render_event, render_session, OperatorCommand, HELP};
use settings::Settings;

#[derive(Parser, Debug)]
#[command(name = "pos-terminal", about = "Terminal front end for the POS worker")]
struct Args {
    /// Settings file (defaults to ./pos-terminal.toml when present).
    #[arg(long)]
    config: Option<PathBuf>,
    /// Worker executable, tried before the default locations.
    #[arg(long)]
    executable: Option<PathBuf>,
    #[arg(long)]
    ws_url: Option<String>,
    /// Connect to an already running worker instead of launching one.
    #[arg(long)]
    no_spawn: bool,
    /// Tracing filter directives; falls back to RUST_LOG, then `info`.
    #[arg(long)]
    log_filter: Option<String>,
}

fn init_tracing(directives: Option<&str>) {
    let filter = match directives {
        Some(directives) => EnvFilter::new(directives),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .init();
}

struct Host {
    supervisor: ProcessSupervisor,
    bridge: ConnectionBridge,
    session: Arc<SessionStore>,
    supervised: bool,
}

impl Host {
    fn send(&self, command: &OutboundCommand) -> bool {
        match self.bridge.send(command) {
            Ok(()) => true,
            Err(SendError::NotConnected) => {
                println!("not connected to the worker");
                false
            }
            Err(err) => {
                println!("send failed: {err}");
                false
            }
        }
    }

    fn edit_form(&self, event: SessionEvent) {
        if self.session.snapshot().can_input_form() {
            self.session.dispatch(&event);
        } else {
            println!("form is locked until the worker is idle");
        }
    }

    async fn execute(&self, command: OperatorCommand) {
        match command {
            OperatorCommand::Tab(tab) => self.edit_form(SessionEvent::SetTab(tab)),
            OperatorCommand::Amount(amount) => self.edit_form(SessionEvent::SetAmount(amount)),
            OperatorCommand::OrderNo(order_no) => {
                self.edit_form(SessionEvent::SetOrderNo(order_no))
            }
            OperatorCommand::RefundOrder {
                order_id,
                amount,
                order_no,
            } => self.edit_form(SessionEvent::SetRefundingOrder {
                order_id,
                amount,
                order_no,
            }),
            OperatorCommand::Reset => self.edit_form(SessionEvent::ResetForm),
            OperatorCommand::Submit => {
                let Some(command) = self.session.snapshot().submit_command() else {
                    println!("cannot submit: check link, device, amount and order number");
                    return;
                };
                if self.send(&command) {
                    self.session.dispatch(&SessionEvent::TransactionStart);
                }
            }
            OperatorCommand::Abort => {
                if self.session.snapshot().can_abort() {
                    self.send(&OutboundCommand::abort());
                } else {
                    println!("nothing to abort");
                }
            }
            OperatorCommand::Dismiss => {
                self.session.dispatch(&SessionEvent::Dismiss);
            }
            OperatorCommand::Reconnect => {
                self.send(&OutboundCommand::reconnect());
            }
            OperatorCommand::Restart if self.supervised => {
                if let Err(err) = self.supervisor.restart().await {
                    error!(%err, "worker restart failed");
                }
            }
            OperatorCommand::Restart => {
                self.send(&OutboundCommand::restart());
            }
            OperatorCommand::Status => {
                if self.bridge.is_connected() {
                    self.send(&OutboundCommand::status());
                }
                let status = self.supervisor.status();
                println!(
                    "process running={} pid={} uptime_ms={} restarts={} | channel {:?} reconnect_pending={}",
                    status.running,
                    status.pid.map_or_else(|| "-".into(), |pid| pid.to_string()),
                    status.uptime_ms.map_or_else(|| "-".into(), |ms| ms.to_string()),
                    self.supervisor.restart_count(),
                    self.bridge.phase(),
                    self.bridge.reconnect_pending(),
                );
            }
            OperatorCommand::Help => println!("{HELP}"),
            OperatorCommand::Quit => {}
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.log_filter.as_deref());

    let mut settings = Settings::load(args.config.as_deref())?;
    if let Some(executable) = args.executable {
        settings.executable = Some(executable);
    }
    if let Some(url) = args.ws_url {
        settings.channel.url = url;
    }
    if args.no_spawn {
        settings.spawn = false;
    }
    settings
        .channel
        .validate()
        .context("invalid channel settings")?;

    let host_dir = std::env::current_exe()
        .context("cannot locate the host executable")?
        .parent()
        .map(PathBuf::from)
        .unwrap_or_default();

    let host = Host {
        supervisor: ProcessSupervisor::new(settings.supervisor_config(&host_dir)),
        bridge: ConnectionBridge::new(settings.channel.clone()),
        session: Arc::new(SessionStore::new()),
        supervised: settings.spawn,
    };

    let (forwarded_tx, mut forwarded) = mpsc::unbounded_channel();
    let sink: Arc<dyn EventSink> = Arc::new(move |event: RouterEvent| {
        let _ = forwarded_tx.send(event);
    });
    let router = if host.supervised {
        EventRouter::wire(
            &host.supervisor,
            &host.bridge,
            Arc::clone(&host.session),
            sink,
        )
    } else {
        EventRouter::wire_bridge(&host.bridge, Arc::clone(&host.session), sink)
    };

    info!(supervised = host.supervised, url = %settings.channel.url, "pos terminal starting");
    println!("{HELP}");
    if host.supervised {
        if let Err(err) = host.supervisor.start().await {
            error!(%err, "worker failed to start; use `restart` to retry");
        }
    } else {
        host.bridge.connect();
    }

    let mut sessions = host.session.subscribe();
    println!("{}", render_session(&sessions.borrow_and_update()));
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("interrupt received");
                break;
            }
            changed = sessions.changed() => {
                if changed.is_err() {
                    break;
                }
                println!("{}", render_session(&sessions.borrow_and_update()));
            }
            Some(event) = forwarded.recv() => {
                if let Some(line) = render_event(&event) {
                    println!("{line}");
                }
            }
            line = lines.next_line() => {
                let Some(line) = line.context("failed to read stdin")? else {
                    break;
                };
                match parse_command(&line) {
                    Ok(Some(OperatorCommand::Quit)) => break,
                    Ok(Some(command)) => host.execute(command).await,
                    Ok(None) => {}
                    Err(err) => println!("{err}; type `help` for commands"),
                }
            }
        }
    }

    router.cleanup();
    host.bridge.destroy();
    host.supervisor.stop();
    info!("pos terminal stopped");
    Ok(())
}
