#![forbid(unsafe_code)]

//! Line-based operator commands read from stdin.

use std::sync::Arc;

use donerelay_domain::Platform;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::server::host::PresenceRegistry;
use crate::server::orchestrator::Orchestrator;

const TEST_DONOR: &str = "test-donor";

pub const HELP: &str = "commands: join <tag> | leave <tag> | reload | reconnect <target|all> | on | off | list | test <platform> <target> <amount>";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
	Join(String),
	Leave(String),
	Reload,
	Reconnect(String),
	On,
	Off,
	List,
	Test {
		platform: Platform,
		target: String,
		amount: u64,
	},
	Help,
}

/// `Ok(None)` for blank lines.
pub fn parse_line(line: &str) -> Result<Option<ControlCommand>, String> {
	let mut parts = line.split_whitespace();
	let Some(verb) = parts.next() else {
		return Ok(None);
	};
	let args: Vec<&str> = parts.collect();

	let one = |name: &str| -> Result<String, String> {
		match args.as_slice() {
			[arg] => Ok((*arg).to_string()),
			_ => Err(format!("usage: {verb} <{name}>")),
		}
	};

	let cmd = match verb.to_ascii_lowercase().as_str() {
		"join" => ControlCommand::Join(one("tag")?),
		"leave" => ControlCommand::Leave(one("tag")?),
		"reload" => ControlCommand::Reload,
		"reconnect" => ControlCommand::Reconnect(one("target")?),
		"on" => ControlCommand::On,
		"off" => ControlCommand::Off,
		"list" | "status" => ControlCommand::List,
		"help" | "?" => ControlCommand::Help,
		"test" => {
			let [platform, target, amount] = args.as_slice() else {
				return Err("usage: test <platform> <target> <amount>".to_string());
			};
			ControlCommand::Test {
				platform: platform.parse().map_err(|e| format!("{platform}: {e}"))?,
				target: (*target).to_string(),
				amount: amount.parse().map_err(|_| format!("amount must be a non-negative integer: {amount}"))?,
			}
		}
		other => return Err(format!("unknown command `{other}`; {HELP}")),
	};
	Ok(Some(cmd))
}

pub async fn execute(cmd: ControlCommand, orch: &Orchestrator, presence: &PresenceRegistry) {
	match cmd {
		ControlCommand::Join(tag) => {
			presence.join(&tag);
			let report = orch.on_presence_joined(&tag).await;
			info!(%tag, connected = report.connected, "presence joined");
		}
		ControlCommand::Leave(tag) => {
			presence.leave(&tag);
			let dropped = orch.on_presence_left(&tag).await;
			info!(%tag, dropped, "presence left");
		}
		ControlCommand::Reload => match orch.reload().await {
			Ok(report) => info!(connected = report.connected, total = report.total, "reload complete"),
			Err(e) => warn!(error = %e, "reload failed"),
		},
		ControlCommand::Reconnect(target) => {
			let report = orch.reconnect(&target).await;
			info!(%target, connected = report.connected, total = report.total, "reconnect complete");
		}
		ControlCommand::On => {
			let report = orch.connect_everything().await;
			info!(connected = report.connected, total = report.total, "relay on");
		}
		ControlCommand::Off => {
			let closed = orch.disconnect_everything().await;
			info!(closed, "relay off");
		}
		ControlCommand::List => {
			for row in orch.status() {
				match &row.session {
					Some(s) => info!(
						platform = %row.identity.platform,
						channel = %row.identity.nickname,
						tag = %row.identity.tag,
						state = %s.stats.state,
						reconnect_attempts = s.stats.reconnect_attempts,
						messages = s.stats.messages,
						donations = s.stats.donations,
						"channel"
					),
					None => info!(
						platform = %row.identity.platform,
						channel = %row.identity.nickname,
						tag = %row.identity.tag,
						state = "idle",
						"channel"
					),
				}
			}
		}
		ControlCommand::Test {
			platform,
			target,
			amount,
		} => match orch.test_donation(platform, &target, amount, TEST_DONOR, "").await {
			Some(report) => info!(
				%platform,
				%target,
				amount,
				rule_found = report.rule_found,
				submitted = report.submitted,
				succeeded = report.succeeded,
				"test donation dispatched"
			),
			None => warn!(%platform, %target, "test donation: unknown channel"),
		},
		ControlCommand::Help => info!("{HELP}"),
	}
}

/// Read commands until EOF or cancellation.
pub async fn run_control<R>(reader: R, orch: Arc<Orchestrator>, presence: Arc<PresenceRegistry>, stop: CancellationToken)
where
	R: AsyncBufRead + Unpin,
{
	let mut lines = reader.lines();
	loop {
		let line = tokio::select! {
			_ = stop.cancelled() => break,
			line = lines.next_line() => line,
		};
		match line {
			Ok(Some(line)) => match parse_line(&line) {
				Ok(Some(cmd)) => execute(cmd, &orch, &presence).await,
				Ok(None) => {}
				Err(e) => warn!("{e}"),
			},
			Ok(None) => {
				info!("control input closed");
				break;
			}
			Err(e) => {
				warn!(error = %e, "control input failed");
				break;
			}
		}
	}
}
