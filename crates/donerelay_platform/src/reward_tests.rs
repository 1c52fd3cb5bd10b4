#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use donerelay_domain::Platform;

use super::*;
use crate::test_support::{RecordingExecutor, mk_identity, mk_snapshot};

fn mk_dispatcher(exec: &Arc<RecordingExecutor>, rules: &[(u64, &[&str])], random: bool) -> RewardDispatcher {
	let bob = mk_identity(Platform::Chzzk, "Bob");
	RewardDispatcher::new(
		Platform::Chzzk,
		mk_snapshot(vec![bob], rules, random),
		exec.clone(),
		Duration::from_millis(100),
	)
}

#[test]
fn template_substitution_is_exact() {
	let out = render_template(
		"say %name% gave %amount%",
		&[("%name%", "Alice"), ("%amount%", "1000"), ("%tag%", "Bob"), ("%message%", "")],
	);
	assert_eq!(out, "say Alice gave 1000");
	assert!(!out.contains('%'), "no residual placeholders: {out}");
}

#[test]
fn substituted_values_are_not_rescanned() {
	let out = render_template("say %name% %amount%", &[("%name%", "%amount%"), ("%amount%", "5")]);
	assert_eq!(out, "say %amount% 5");
}

#[test]
fn unknown_placeholders_and_lone_percent_survive() {
	let out = render_template("100% of %other% by %name%", &[("%name%", "Carol")]);
	assert_eq!(out, "100% of %other% by Carol");
}

#[tokio::test]
async fn exact_rule_selected() {
	let exec = RecordingExecutor::new();
	let d = mk_dispatcher(&exec, &[(5000, &["exact %amount%"]), (0, &["wild"])], false);
	let report = d.dispatch(&mk_identity(Platform::Chzzk, "Bob"), "Carol", 5000, "").await;
	assert!(report.rule_found);
	assert_eq!(exec.commands(), vec!["exact 5000".to_string()]);
}

#[tokio::test]
async fn wildcard_rule_selected_without_exact_match() {
	let exec = RecordingExecutor::new();
	let d = mk_dispatcher(&exec, &[(5000, &["exact"]), (0, &["wild %amount%"])], false);
	d.dispatch(&mk_identity(Platform::Chzzk, "Bob"), "Carol", 7, "").await;
	assert_eq!(exec.commands(), vec!["wild 7".to_string()]);
}

#[tokio::test]
async fn no_rule_submits_nothing() {
	let exec = RecordingExecutor::new();
	let d = mk_dispatcher(&exec, &[(5000, &["exact"])], false);
	let report = d.dispatch(&mk_identity(Platform::Chzzk, "Bob"), "Carol", 7, "").await;
	assert!(!report.rule_found);
	assert_eq!(report.submitted, 0);
	assert!(exec.commands().is_empty());
}

#[tokio::test]
async fn end_to_end_reward_for_bob() {
	let exec = RecordingExecutor::new();
	let d = mk_dispatcher(&exec, &[(1000, &["give %tag% diamond 1"])], false);
	let report = d.dispatch(&mk_identity(Platform::Chzzk, "Bob"), "Carol", 1000, "").await;
	assert_eq!(report.submitted, 1);
	assert_eq!(report.succeeded, 1);
	assert_eq!(exec.commands(), vec!["give Bob diamond 1".to_string()]);
}

#[tokio::test]
async fn random_mode_with_single_template_runs_it() {
	let exec = RecordingExecutor::new();
	let d = mk_dispatcher(&exec, &[(1000, &["only %name%"])], true);
	for _ in 0..5 {
		d.dispatch(&mk_identity(Platform::Chzzk, "Bob"), "Carol", 1000, "").await;
	}
	assert_eq!(exec.commands(), vec!["only Carol".to_string(); 5]);
}

#[tokio::test]
async fn random_mode_runs_exactly_one() {
	let exec = RecordingExecutor::new();
	let d = mk_dispatcher(&exec, &[(1000, &["a", "b", "c"])], true);
	let report = d.dispatch(&mk_identity(Platform::Chzzk, "Bob"), "Carol", 1000, "").await;
	assert_eq!(report.submitted, 1);
	let seen = exec.commands();
	assert!(["a", "b", "c"].contains(&seen[0].as_str()));
}

#[tokio::test]
async fn sequential_mode_runs_all_in_order() {
	let exec = RecordingExecutor::new();
	let d = mk_dispatcher(&exec, &[(1000, &["first", "second", "third"])], false);
	d.dispatch(&mk_identity(Platform::Chzzk, "Bob"), "Carol", 1000, "").await;
	assert_eq!(exec.commands(), vec!["first", "second", "third"]);
}

#[tokio::test]
async fn semicolon_sub_commands_run_independently() {
	let exec = RecordingExecutor::new();
	let d = mk_dispatcher(&exec, &[(1000, &["say %name%; give %tag% apple;;say %message%"])], false);
	d.dispatch(&mk_identity(Platform::Chzzk, "Bob"), "Carol", 1000, "gg").await;
	assert_eq!(exec.commands(), vec!["say Carol", "give Bob apple", "say gg"]);
}

#[tokio::test]
async fn failures_do_not_stop_remaining_commands() {
	let exec = RecordingExecutor::new();
	let d = mk_dispatcher(&exec, &[(1000, &["hang forever", "deny this", "after"])], false);
	let report = d.dispatch(&mk_identity(Platform::Chzzk, "Bob"), "Carol", 1000, "").await;

	assert_eq!(exec.commands(), vec!["hang forever", "deny this", "after"]);
	assert_eq!(report.submitted, 3);
	assert_eq!(report.succeeded, 1);
	assert!(matches!(report.failures[0], CommandError::Timeout { .. }));
	assert_eq!(report.failures[1], CommandError::Rejected("deny this".to_string()));
	assert!(d.pending().is_empty(), "timed out units are released");
}

#[tokio::test]
async fn cancel_pending_aborts_in_flight_and_skips_rest() {
	let exec = RecordingExecutor::new();
	let bob = mk_identity(Platform::Chzzk, "Bob");
	let d = Arc::new(RewardDispatcher::new(
		Platform::Chzzk,
		mk_snapshot(vec![bob.clone()], &[(1000, &["hang here", "never"])], false),
		exec.clone(),
		Duration::from_secs(30),
	));

	let run = {
		let d = d.clone();
		tokio::spawn(async move { d.dispatch(&bob, "Carol", 1000, "").await })
	};

	exec.wait_for(1).await;
	assert_eq!(d.cancel_pending(), 1);

	let report = tokio::time::timeout(Duration::from_secs(2), run)
		.await
		.expect("dispatch returns promptly after cancel")
		.expect("join");
	assert_eq!(report.failures, vec![CommandError::Cancelled]);
	assert_eq!(exec.commands(), vec!["hang here"]);

	let after = d.dispatch(&mk_identity(Platform::Chzzk, "Bob"), "Carol", 1000, "").await;
	assert_eq!(after.submitted, 0, "cancelled dispatcher submits nothing");
}
