// SPDX-License-Identifier: MIT OR Apache-2.0
//! End-to-end supervision tests against real shell processes.
#![cfg(unix)]

use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

use swb_supervisor::{
    BreakerState, IoMode, ProcessSpec, ProcessSupervisor, SupervisorConfig, TokioProcessManager,
};
use swb_telemetry::{BrokerEvent, EventBus};

fn supervisor(bus: &EventBus, config: SupervisorConfig) -> ProcessSupervisor {
    ProcessSupervisor::new(Arc::new(TokioProcessManager), config, bus.clone())
}

fn sh(script: &str) -> ProcessSpec {
    ProcessSpec::new("/bin/sh").arg("-c").arg(script)
}

async fn next_event_of(
    sub: &mut swb_telemetry::EventSubscription,
    name: &str,
) -> Option<BrokerEvent> {
    timeout(Duration::from_secs(5), async {
        loop {
            let event = sub.recv().await?;
            if event.name() == name {
                return Some(event);
            }
        }
    })
    .await
    .ok()
    .flatten()
}

#[tokio::test]
async fn spawn_emits_spawned_and_exited() {
    let bus = EventBus::new();
    let mut sub = bus.subscribe();
    let sup = supervisor(&bus, SupervisorConfig::default());

    let io = sup
        .spawn_process("s-1", sh("exit 0"), IoMode::Pumped)
        .await
        .expect("spawn");
    assert!(io.pid.is_some());

    let spawned = next_event_of(&mut sub, "process:spawned").await.unwrap();
    assert_eq!(spawned.session_id(), Some("s-1"));

    let exited = next_event_of(&mut sub, "process:exited").await.unwrap();
    match exited {
        BrokerEvent::ProcessExited { exit_code, .. } => assert_eq!(exit_code, Some(0)),
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn stdout_is_pumped_line_buffered() {
    let bus = EventBus::new();
    let mut sub = bus.subscribe();
    let sup = supervisor(&bus, SupervisorConfig::default());

    sup.spawn_process("s-2", sh("echo one; echo '  '; echo two"), IoMode::Pumped)
        .await
        .expect("spawn");

    let mut lines = Vec::new();
    while lines.len() < 2 {
        match next_event_of(&mut sub, "process:stdout").await {
            Some(BrokerEvent::ProcessStdout { line, .. }) => lines.push(line),
            Some(_) | None => break,
        }
    }
    // Blank lines are dropped by the pump.
    assert_eq!(lines, vec!["one", "two"]);
}

#[tokio::test]
async fn stderr_is_pumped_even_when_piped() {
    let bus = EventBus::new();
    let mut sub = bus.subscribe();
    let sup = supervisor(&bus, SupervisorConfig::default());

    let io = sup
        .spawn_process("s-3", sh("echo oops >&2"), IoMode::Piped)
        .await
        .expect("spawn");
    assert!(io.stdout.is_some());

    let event = next_event_of(&mut sub, "process:stderr").await.unwrap();
    match event {
        BrokerEvent::ProcessStderr { line, .. } => assert_eq!(line, "oops"),
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn kill_escalates_when_sigterm_is_trapped() {
    let bus = EventBus::new();
    let config = SupervisorConfig {
        kill_grace_period: Duration::from_millis(300),
        ..Default::default()
    };
    let sup = supervisor(&bus, config);

    sup.spawn_process("s-4", sh("trap '' TERM; sleep 30"), IoMode::Pumped)
        .await
        .expect("spawn");
    // Give the shell a beat to install the trap.
    tokio::time::sleep(Duration::from_millis(150)).await;

    timeout(Duration::from_secs(5), sup.kill_process("s-4"))
        .await
        .expect("kill within bound")
        .expect("kill ok");
    assert_eq!(sup.process_count(), 0);
}

#[tokio::test]
async fn quick_crashes_open_the_breaker() {
    let bus = EventBus::new();
    let mut sub = bus.subscribe();
    let config = SupervisorConfig {
        failure_threshold: 3,
        // Every exit counts as a crash.
        crash_threshold: Duration::from_secs(10),
        ..Default::default()
    };
    let sup = supervisor(&bus, config);

    for i in 0..3 {
        sup.spawn_process(&format!("s-{i}"), sh("exit 1"), IoMode::Pumped)
            .await
            .expect("spawn");
        next_event_of(&mut sub, "process:exited").await.unwrap();
    }

    assert_eq!(sup.breaker_state(), BreakerState::Open);
    assert!(!sup.can_restart());

    // A refused spawn returns None and emits an error event.
    let refused = sup.spawn_process("s-x", sh("exit 0"), IoMode::Pumped).await;
    assert!(refused.is_none());
    let event = next_event_of(&mut sub, "error").await.unwrap();
    match event {
        BrokerEvent::Error { source, .. } => assert_eq!(source, "process:spawn"),
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn probe_with_long_uptime_recloses_breaker() {
    let bus = EventBus::new();
    let mut sub = bus.subscribe();
    let config = SupervisorConfig {
        failure_threshold: 2,
        crash_threshold: Duration::from_millis(100),
        ..Default::default()
    };
    let sup = supervisor(&bus, config);

    for i in 0..2 {
        sup.spawn_process(&format!("s-{i}"), sh("exit 1"), IoMode::Pumped)
            .await
            .expect("spawn");
        next_event_of(&mut sub, "process:exited").await.unwrap();
    }
    assert!(!sup.can_restart());

    sup.allow_probe();
    sup.spawn_process("s-probe", sh("sleep 0.2; exit 0"), IoMode::Pumped)
        .await
        .expect("probe spawn");
    next_event_of(&mut sub, "process:exited").await.unwrap();

    assert_eq!(sup.breaker_state(), BreakerState::Closed);
    assert!(sup.can_restart());
}

#[tokio::test]
async fn failed_spawn_records_breaker_failure() {
    let bus = EventBus::new();
    let mut sub = bus.subscribe();
    let config = SupervisorConfig {
        failure_threshold: 1,
        event_prefix: "acp".into(),
        ..Default::default()
    };
    let sup = supervisor(&bus, config);

    let out = sup
        .spawn_process("s-5", ProcessSpec::new("/nope/nothing"), IoMode::Pumped)
        .await;
    assert!(out.is_none());

    let event = next_event_of(&mut sub, "error").await.unwrap();
    match event {
        BrokerEvent::Error { source, .. } => assert_eq!(source, "acp:spawn"),
        other => panic!("unexpected event {other:?}"),
    }
    assert!(!sup.can_restart());
}

#[tokio::test]
async fn kill_all_processes_drains_table() {
    let bus = EventBus::new();
    let sup = supervisor(&bus, SupervisorConfig::default());

    for i in 0..3 {
        sup.spawn_process(&format!("s-{i}"), sh("sleep 30"), IoMode::Pumped)
            .await
            .expect("spawn");
    }
    assert_eq!(sup.process_count(), 3);

    timeout(Duration::from_secs(10), sup.kill_all_processes())
        .await
        .expect("bounded");
    assert_eq!(sup.process_count(), 0);
}
