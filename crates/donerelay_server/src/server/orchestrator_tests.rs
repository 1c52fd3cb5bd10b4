#![forbid(unsafe_code)]

use std::sync::atomic::Ordering;

use donerelay_domain::Platform;
use donerelay_platform::SessionState;

use crate::server::test_support::{channel, rig, snapshot};

use super::*;

#[tokio::test]
async fn start_with_auto_connect_opens_every_channel() {
	let rig = rig(
		snapshot(
			vec![
				channel(Platform::Chzzk, "Alice"),
				channel(Platform::Soop, "Bob"),
				channel(Platform::Soop, "Carol"),
			],
			true,
		),
		&[],
	);

	let report = rig.orch.start().await.expect("start");
	assert_eq!(report, ReloadReport { connected: 3, total: 3 });
	assert_eq!(rig.orch.pool(Platform::Chzzk).len(), 1);
	assert_eq!(rig.orch.pool(Platform::Soop).len(), 2);
}

#[tokio::test]
async fn start_without_channels_is_fatal() {
	let rig = rig(snapshot(vec![channel(Platform::Chzzk, "Alice")], true), &[]);
	rig.provider.set(None);
	assert!(rig.orch.start().await.is_err());
	assert_eq!(rig.net.connects(), 0);
}

#[tokio::test]
async fn reload_without_auto_connect_only_connects_active_tags() {
	let rig = rig(
		snapshot(vec![channel(Platform::Chzzk, "Alice"), channel(Platform::Soop, "Bob")], true),
		&["Bob"],
	);
	rig.orch.start().await.expect("start");
	assert_eq!(rig.net.connects(), 2);

	rig.provider.set(Some(snapshot(
		vec![channel(Platform::Chzzk, "Alice"), channel(Platform::Soop, "Bob")],
		false,
	)));
	let report = rig.orch.reload().await.expect("reload");

	assert_eq!(report, ReloadReport { connected: 1, total: 1 });
	assert!(rig.orch.pool(Platform::Chzzk).is_empty());
	assert_eq!(rig.orch.pool(Platform::Soop).find("Bob").len(), 1);
	assert!(!rig.orch.snapshot().settings().auto_connect);
	assert!(!rig.orch.is_reloading());
}

#[tokio::test]
async fn overlapping_reload_is_rejected() {
	let rig = rig(snapshot(vec![channel(Platform::Chzzk, "Alice")], true), &[]);
	rig.orch.start().await.expect("start");

	let (a, b) = tokio::join!(rig.orch.reload(), rig.orch.reload());
	let in_progress = [&a, &b]
		.iter()
		.filter(|r| matches!(r, Err(ReloadError::InProgress)))
		.count();
	assert_eq!(in_progress, 1);
	assert!(a.is_ok() || b.is_ok());
}

#[tokio::test]
async fn failed_reload_keeps_running_sessions() {
	let rig = rig(snapshot(vec![channel(Platform::Chzzk, "Alice")], true), &[]);
	rig.orch.start().await.expect("start");
	let before = rig.orch.pool(Platform::Chzzk).find("Alice").remove(0);

	rig.provider.set(None);
	let err = rig.orch.reload().await.expect_err("reload fails");
	assert!(matches!(err, ReloadError::Config(ConfigLoadError::NoChannels)));

	assert_eq!(before.state(), SessionState::Connected);
	assert_eq!(rig.orch.snapshot().channels().len(), 1);
	assert_eq!(rig.net.connects(), 1);
	assert!(!rig.orch.is_reloading());
}

#[tokio::test]
async fn presence_join_and_leave_drive_sessions() {
	let rig = rig(
		snapshot(vec![channel(Platform::Chzzk, "Alice"), channel(Platform::Soop, "Alice")], false),
		&[],
	);
	let report = rig.orch.start().await.expect("start");
	assert_eq!(report.total, 0);

	rig.presence.join("alice");
	let joined = rig.orch.on_presence_joined("alice").await;
	assert_eq!(joined, ReloadReport { connected: 2, total: 2 });

	assert_eq!(rig.orch.on_presence_left("ALICE").await, 2);
	assert!(rig.orch.pool(Platform::Chzzk).is_empty());
	assert!(rig.orch.pool(Platform::Soop).is_empty());
}

#[tokio::test]
async fn presence_rejoin_reconnects_with_auto_connect() {
	let rig = rig(snapshot(vec![channel(Platform::Chzzk, "Alice")], true), &[]);
	rig.orch.start().await.expect("start");

	// already connected: join is a no-op
	let joined = rig.orch.on_presence_joined("Alice").await;
	assert_eq!(joined.connected, 1);
	assert_eq!(rig.net.connects(), 1);

	assert_eq!(rig.orch.on_presence_left("Alice").await, 1);
	assert!(rig.orch.pool(Platform::Chzzk).is_empty());

	let rejoined = rig.orch.on_presence_joined("Alice").await;
	assert_eq!(rejoined, ReloadReport { connected: 1, total: 1 });
	assert_eq!(rig.orch.pool(Platform::Chzzk).len(), 1);
	assert_eq!(rig.net.connects(), 2);
}

#[tokio::test]
async fn reconnect_target_reopens_only_that_channel() {
	let rig = rig(
		snapshot(vec![channel(Platform::Chzzk, "Alice"), channel(Platform::Chzzk, "Bob")], true),
		&[],
	);
	rig.orch.start().await.expect("start");
	let alice = rig.orch.pool(Platform::Chzzk).find("Alice").remove(0);

	let report = rig.orch.reconnect("Bob").await;
	assert_eq!(report, ReloadReport { connected: 1, total: 1 });
	assert_eq!(rig.net.connects(), 3);
	assert_eq!(alice.state(), SessionState::Connected);

	assert_eq!(rig.orch.reconnect("nobody").await.total, 0);
}

#[tokio::test]
async fn add_channel_shows_up_in_status_and_snapshot() {
	let rig = rig(snapshot(vec![channel(Platform::Chzzk, "Alice")], true), &[]);
	rig.orch.start().await.expect("start");

	let dave = channel(Platform::Soop, "Dave");
	rig.orch.add_channel(dave.clone()).await.expect("add");
	rig.orch.add_channel(dave.clone()).await.expect("duplicate add is a no-op");

	assert_eq!(rig.net.connects(), 2);
	assert_eq!(rig.orch.snapshot().channels().len(), 2);

	let status = rig.orch.status();
	assert_eq!(status.len(), 2);
	let row = status.iter().find(|r| r.identity.same_channel(&dave)).expect("dave row");
	let session = row.session.as_ref().expect("live session");
	assert_eq!(session.stats.state, SessionState::Connected);
}

#[tokio::test]
async fn add_channel_is_refused_when_gated() {
	let rig = rig(snapshot(vec![channel(Platform::Chzzk, "Alice")], true), &[]);
	rig.gate.0.store(false, Ordering::SeqCst);

	assert!(rig.orch.add_channel(channel(Platform::Soop, "Dave")).await.is_err());
	assert_eq!(rig.orch.snapshot().channels().len(), 0);
}

#[tokio::test]
async fn test_donation_runs_reward_rules() {
	let rig = rig(snapshot(vec![channel(Platform::Chzzk, "Alice")], true), &[]);
	rig.orch.start().await.expect("start");

	let report = rig
		.orch
		.test_donation(Platform::Chzzk, "alice", 1000, "tester", "")
		.await
		.expect("known channel");
	assert!(report.rule_found);
	assert_eq!(report.succeeded, 1);
	assert_eq!(rig.executor.commands.lock().as_slice(), ["give Alice diamond 1"]);

	let donations = rig.sink.donations.lock();
	assert_eq!(donations.len(), 1);
	assert!(donations[0].is_test);
	drop(donations);

	assert!(rig.orch.test_donation(Platform::Soop, "alice", 1000, "tester", "").await.is_none());
}

#[tokio::test]
async fn shutdown_closes_every_session() {
	let rig = rig(
		snapshot(vec![channel(Platform::Chzzk, "Alice"), channel(Platform::Soop, "Bob")], true),
		&[],
	);
	rig.orch.start().await.expect("start");
	let sessions: Vec<_> = rig
		.orch
		.pool(Platform::Chzzk)
		.find("Alice")
		.into_iter()
		.chain(rig.orch.pool(Platform::Soop).find("Bob"))
		.collect();

	rig.orch.shutdown().await;
	assert!(sessions.iter().all(|s| s.state() == SessionState::ShuttingDown));
	assert!(rig.orch.status().iter().all(|r| r.session.is_none()));
}
