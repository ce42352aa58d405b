use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use clockfleet_controller::{DeviceController, EventSink, FLEET_STATUS_TOPIC};
use clockfleet_core::{Connectivity, CountDirection, DeviceId, DeviceMode, LinkRef, ManualClock};
use clockfleet_devices::DeviceStore;
use clockfleet_link::{DeviceCommand, DeviceLink, LinkError};
use clockfleet_scheduler::{ScheduleStore, SchedulerEngine, SchedulerHandle, TriggerStatus};
use rusqlite::Connection;
use serde_json::json;

const T0: i64 = 1_700_000_000_000;
const MINUTE: i64 = 60_000;
const HOUR: i64 = 60 * MINUTE;

#[derive(Default)]
struct FakeLink {
    sent: Mutex<Vec<(LinkRef, DeviceCommand)>>,
    fail: AtomicBool,
}

impl FakeLink {
    fn sent(&self) -> Vec<DeviceCommand> {
        self.sent.lock().unwrap().iter().map(|(_, c)| c.clone()).collect()
    }

    fn notices(&self) -> Vec<DeviceCommand> {
        self.sent()
            .into_iter()
            .filter(|c| matches!(c, DeviceCommand::Notice { .. }))
            .collect()
    }

    fn last(&self) -> Option<DeviceCommand> {
        self.sent().pop()
    }
}

#[async_trait]
impl DeviceLink for FakeLink {
    fn name(&self) -> &str {
        "fake"
    }

    async fn publish(&self, link_ref: &LinkRef, command: &DeviceCommand) -> Result<(), LinkError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(LinkError::PublishFailed("broker unreachable".into()));
        }
        self.sent
            .lock()
            .unwrap()
            .push((link_ref.clone(), command.clone()));
        Ok(())
    }
}

#[derive(Default)]
struct RecordingSink(Mutex<Vec<(String, serde_json::Value)>>);

impl EventSink for RecordingSink {
    fn emit(&self, topic: &str, payload: serde_json::Value) {
        self.0.lock().unwrap().push((topic.to_string(), payload));
    }
}

struct Harness {
    controller: Arc<DeviceController>,
    scheduler: SchedulerHandle,
    engine: SchedulerEngine,
    link: Arc<FakeLink>,
    sink: Arc<RecordingSink>,
    clock: Arc<ManualClock>,
}

impl Harness {
    fn build(devices: Connection, triggers: Connection, clock: Arc<ManualClock>) -> Self {
        let devices = Arc::new(DeviceStore::new(devices).unwrap());
        let scheduler = SchedulerHandle::new(ScheduleStore::new(triggers).unwrap(), clock.clone());
        scheduler.recover().unwrap();

        let link = Arc::new(FakeLink::default());
        let sink = Arc::new(RecordingSink::default());
        let controller = Arc::new(DeviceController::new(
            devices,
            scheduler.clone(),
            link.clone(),
            sink.clone(),
            clock.clone(),
        ));
        let engine = SchedulerEngine::new(scheduler.clone(), controller.clone(), 50);
        Self {
            controller,
            scheduler,
            engine,
            link,
            sink,
            clock,
        }
    }

    fn new() -> Self {
        Self::build(
            Connection::open_in_memory().unwrap(),
            Connection::open_in_memory().unwrap(),
            Arc::new(ManualClock::new(T0)),
        )
    }

    fn provision(&self, id: &str) -> DeviceId {
        let id = DeviceId::from(id);
        self.controller
            .provision_device(&id, &LinkRef::from(format!("link-{id}")))
            .unwrap();
        id
    }

    async fn online(&self, id: &str) -> DeviceId {
        let id = self.provision(id);
        self.controller
            .report_device_status(&id, Connectivity::Online, json!({}))
            .await
            .unwrap();
        id
    }

    async fn at(&self, ms: i64) -> usize {
        self.clock.set(ms);
        self.engine.run_due().await
    }
}

#[tokio::test]
async fn offline_notice_is_replayed_once_then_expires() {
    let h = Harness::new();
    let d1 = h.provision("D1");

    let device = h.controller.send_notice(&d1, "Fire drill", 5).await.unwrap();
    assert!(device.pending_notice);
    assert!(h.link.sent().is_empty());

    h.controller
        .report_device_status(&d1, Connectivity::Online, json!({ "rssi": -60 }))
        .await
        .unwrap();
    h.controller
        .report_device_status(&d1, Connectivity::Online, json!({}))
        .await
        .unwrap();

    assert_eq!(
        h.link.notices(),
        vec![DeviceCommand::Notice {
            text: "Fire drill".into(),
            duration_ms: Some(5 * MINUTE),
        }]
    );
    let device = h.controller.device(&d1).unwrap();
    assert!(!device.pending_notice);
    assert_eq!(device.mode, DeviceMode::Notice);
    assert_eq!(device.telemetry["rssi"], -60);

    assert_eq!(h.at(T0 + 5 * MINUTE - 1).await, 0);
    assert_eq!(h.at(T0 + 5 * MINUTE).await, 1);
    assert_eq!(h.controller.device(&d1).unwrap().mode, DeviceMode::Clock);
    assert_eq!(
        h.link.last(),
        Some(DeviceCommand::Mode {
            mode: DeviceMode::Clock
        })
    );
}

#[tokio::test]
async fn overlapping_schedule_is_rejected_without_triggers() {
    let h = Harness::new();
    let d2 = h.online("D2").await;

    h.controller
        .schedule_notice(&d2, "Exam today", T0 + HOUR, T0 + 2 * HOUR)
        .await
        .unwrap();
    let err = h
        .controller
        .schedule_notice(&d2, "Overlap", T0 + 90 * MINUTE, T0 + 150 * MINUTE)
        .await
        .unwrap_err();

    assert_eq!(err.code(), "OVERLAP");
    assert_eq!(h.scheduler.pending_count().unwrap(), 2);
    assert_eq!(h.controller.device(&d2).unwrap().scheduled_notices.len(), 1);

    // Back-to-back is fine under half-open intervals.
    h.controller
        .schedule_notice(&d2, "Next", T0 + 2 * HOUR, T0 + 3 * HOUR)
        .await
        .unwrap();
}

#[tokio::test]
async fn concurrent_overlapping_requests_admit_one() {
    let h = Harness::new();
    let d = h.online("D3").await;

    let (a, b) = tokio::join!(
        h.controller.schedule_notice(&d, "A", T0 + HOUR, T0 + 2 * HOUR),
        h.controller.schedule_notice(&d, "B", T0 + HOUR, T0 + 2 * HOUR),
    );
    assert_eq!(a.is_ok() as u8 + b.is_ok() as u8, 1);
    assert_eq!(h.scheduler.pending_count().unwrap(), 2);
}

#[tokio::test]
async fn scheduled_notice_shows_then_reverts() {
    let h = Harness::new();
    let d = h.online("D4").await;
    h.controller
        .schedule_notice(&d, "Assembly", T0 + 1_000, T0 + 61_000)
        .await
        .unwrap();

    assert_eq!(h.at(T0 + 1_000).await, 1);
    let device = h.controller.device(&d).unwrap();
    assert_eq!(device.mode, DeviceMode::Notice);
    assert_eq!(device.current_notice.as_deref(), Some("Assembly"));
    assert_eq!(
        h.link.notices(),
        vec![DeviceCommand::Notice {
            text: "Assembly".into(),
            duration_ms: Some(60_000),
        }]
    );

    assert_eq!(h.at(T0 + 61_000).await, 1);
    let device = h.controller.device(&d).unwrap();
    assert_eq!(device.mode, DeviceMode::Clock);
    assert!(device.scheduled_notices.is_empty());
}

#[tokio::test]
async fn cancel_before_start_suppresses_both_triggers() {
    let h = Harness::new();
    let d = h.online("D5").await;
    let sched = h
        .controller
        .schedule_notice(&d, "Never", T0 + 1_000, T0 + 2_000)
        .await
        .unwrap();

    h.controller
        .cancel_scheduled_notice(&d, &sched.schedule_id)
        .await
        .unwrap();
    assert_eq!(h.scheduler.pending_count().unwrap(), 0);
    assert_eq!(h.at(T0 + 10_000).await, 0);
    assert!(h.link.notices().is_empty());

    let err = h
        .controller
        .cancel_scheduled_notice(&d, &sched.schedule_id)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "NOT_FOUND");
}

#[tokio::test]
async fn cancel_while_showing_reverts_to_clock() {
    let h = Harness::new();
    let d = h.online("D6").await;
    let sched = h
        .controller
        .schedule_notice(&d, "Lunch", T0 + 1_000, T0 + HOUR)
        .await
        .unwrap();
    h.at(T0 + 1_000).await;
    assert_eq!(h.controller.device(&d).unwrap().mode, DeviceMode::Notice);

    h.controller
        .cancel_scheduled_notice(&d, &sched.schedule_id)
        .await
        .unwrap();
    assert_eq!(h.controller.device(&d).unwrap().mode, DeviceMode::Clock);
    assert_eq!(
        h.link.last(),
        Some(DeviceCommand::Mode {
            mode: DeviceMode::Clock
        })
    );

    // Cancelling after the start fired is a no-op for that trigger.
    let start = h.scheduler.get(sched.start_trigger.as_ref().unwrap()).unwrap().unwrap();
    assert_eq!(start.status, TriggerStatus::Executed);
    let end = h.scheduler.get(sched.end_trigger.as_ref().unwrap()).unwrap().unwrap();
    assert_eq!(end.status, TriggerStatus::Cancelled);
}

#[tokio::test]
async fn scheduled_notice_while_offline_replays_remaining_window() {
    let h = Harness::new();
    let d = h.provision("D7");
    h.controller
        .schedule_notice(&d, "Drill", T0 + 1_000, T0 + 5_000)
        .await
        .unwrap();

    h.at(T0 + 1_000).await;
    let device = h.controller.device(&d).unwrap();
    assert!(device.pending_notice);
    assert!(h.link.sent().is_empty());

    h.clock.set(T0 + 2_000);
    h.controller
        .report_device_status(&d, Connectivity::Online, json!({}))
        .await
        .unwrap();
    assert_eq!(
        h.link.notices(),
        vec![DeviceCommand::Notice {
            text: "Drill".into(),
            duration_ms: Some(3_000),
        }]
    );

    h.at(T0 + 5_000).await;
    assert_eq!(h.controller.device(&d).unwrap().mode, DeviceMode::Clock);
}

#[tokio::test]
async fn start_after_window_closed_is_skipped() {
    let h = Harness::new();
    let d = h.online("D8").await;
    h.controller
        .schedule_notice(&d, "Missed", T0 + 1_000, T0 + 2_000)
        .await
        .unwrap();

    assert_eq!(h.at(T0 + 3_000).await, 2);
    let device = h.controller.device(&d).unwrap();
    assert_eq!(device.mode, DeviceMode::Clock);
    assert!(device.scheduled_notices.is_empty());
    assert!(h.link.sent().is_empty());
}

#[tokio::test]
async fn newer_notice_outlives_older_end_trigger() {
    let h = Harness::new();
    let d = h.online("D9").await;
    h.controller.send_notice(&d, "First", 5).await.unwrap();
    h.clock.set(T0 + MINUTE);
    h.controller.send_notice(&d, "Second", 10).await.unwrap();

    assert_eq!(h.at(T0 + 5 * MINUTE).await, 0);
    let device = h.controller.device(&d).unwrap();
    assert_eq!(device.mode, DeviceMode::Notice);
    assert_eq!(device.current_notice.as_deref(), Some("Second"));

    assert_eq!(h.at(T0 + 11 * MINUTE).await, 1);
    assert_eq!(h.controller.device(&d).unwrap().mode, DeviceMode::Clock);
}

#[tokio::test]
async fn immediate_stopwatch_runs_until_end() {
    let h = Harness::new();
    let d = h.online("D10").await;
    let sw = h
        .controller
        .start_stopwatch(&d, T0, T0 + 10 * MINUTE, CountDirection::Down, false)
        .await
        .unwrap();
    assert!(sw.start_trigger.is_none());
    assert_eq!(h.controller.device(&d).unwrap().mode, DeviceMode::Stopwatch);
    assert_eq!(
        h.link.last(),
        Some(DeviceCommand::Stopwatch {
            start_ms: T0,
            end_ms: T0 + 10 * MINUTE,
            direction: CountDirection::Down,
        })
    );

    h.at(T0 + 10 * MINUTE).await;
    let device = h.controller.device(&d).unwrap();
    assert_eq!(device.mode, DeviceMode::Clock);
    assert!(device.stopwatches.is_empty());
}

#[tokio::test]
async fn scheduled_stopwatch_stopped_before_start_never_publishes() {
    let h = Harness::new();
    let d = h.online("D11").await;
    let sw = h
        .controller
        .start_stopwatch(&d, T0 + MINUTE, T0 + 2 * MINUTE, CountDirection::Up, true)
        .await
        .unwrap();
    assert!(h.link.sent().is_empty());
    assert!(!h.controller.device(&d).unwrap().stopwatches[0].executed);

    h.controller.stop_stopwatch(&d, &sw.schedule_id).await.unwrap();
    assert_eq!(h.scheduler.pending_count().unwrap(), 0);
    assert_eq!(h.at(T0 + 3 * MINUTE).await, 0);
    assert!(h.link.sent().is_empty());

    let err = h.controller.stop_stopwatch(&d, &sw.schedule_id).await.unwrap_err();
    assert_eq!(err.code(), "NOT_FOUND");
}

#[tokio::test]
async fn scheduled_stopwatch_starts_and_can_be_stopped() {
    let h = Harness::new();
    let d = h.online("D12").await;
    let sw = h
        .controller
        .start_stopwatch(&d, T0 + MINUTE, T0 + 10 * MINUTE, CountDirection::Up, true)
        .await
        .unwrap();

    h.at(T0 + MINUTE).await;
    let device = h.controller.device(&d).unwrap();
    assert_eq!(device.mode, DeviceMode::Stopwatch);
    assert!(device.stopwatches[0].executed);

    h.controller.stop_stopwatch(&d, &sw.schedule_id).await.unwrap();
    assert_eq!(h.link.last(), Some(DeviceCommand::StopwatchStop));
    assert_eq!(h.controller.device(&d).unwrap().mode, DeviceMode::Clock);
    assert_eq!(h.at(T0 + 10 * MINUTE).await, 0);
}

#[tokio::test]
async fn newer_stopwatch_supersedes_running_one() {
    let h = Harness::new();
    let d = h.online("D20").await;
    let a = h
        .controller
        .start_stopwatch(&d, T0, T0 + 10 * MINUTE, CountDirection::Down, false)
        .await
        .unwrap();
    let b = h
        .controller
        .start_stopwatch(&d, T0, T0 + HOUR, CountDirection::Up, false)
        .await
        .unwrap();

    let device = h.controller.device(&d).unwrap();
    assert!(device.is_running_stopwatch(&b.schedule_id));
    assert!(device.stopwatch(&a.schedule_id).is_none());

    // A's end-trigger was cancelled with it; B keeps running.
    assert_eq!(h.at(T0 + 10 * MINUTE).await, 0);
    let device = h.controller.device(&d).unwrap();
    assert_eq!(device.mode, DeviceMode::Stopwatch);
    assert_eq!(device.stopwatches.len(), 1);
    assert_eq!(
        h.link.last(),
        Some(DeviceCommand::Stopwatch {
            start_ms: T0,
            end_ms: T0 + HOUR,
            direction: CountDirection::Up,
        })
    );

    assert_eq!(h.at(T0 + HOUR).await, 1);
    assert_eq!(h.controller.device(&d).unwrap().mode, DeviceMode::Clock);
}

#[tokio::test]
async fn stopping_unstarted_stopwatch_leaves_running_one_alone() {
    let h = Harness::new();
    let d = h.online("D21").await;
    let a = h
        .controller
        .start_stopwatch(&d, T0, T0 + 30 * MINUTE, CountDirection::Down, false)
        .await
        .unwrap();
    let b = h
        .controller
        .start_stopwatch(&d, T0 + 40 * MINUTE, T0 + 50 * MINUTE, CountDirection::Up, true)
        .await
        .unwrap();
    let sent = h.link.sent().len();

    h.controller.stop_stopwatch(&d, &b.schedule_id).await.unwrap();

    let device = h.controller.device(&d).unwrap();
    assert!(device.is_running_stopwatch(&a.schedule_id));
    assert_eq!(device.stopwatches.len(), 1);
    assert_eq!(h.link.sent().len(), sent);
    assert_eq!(h.scheduler.pending_count().unwrap(), 1);

    assert_eq!(h.at(T0 + 30 * MINUTE).await, 1);
    assert_eq!(h.controller.device(&d).unwrap().mode, DeviceMode::Clock);
    assert_eq!(h.at(T0 + 50 * MINUTE).await, 0);
}

#[tokio::test]
async fn scheduled_stopwatch_start_replaces_running_one() {
    let h = Harness::new();
    let d = h.online("D22").await;
    h.controller
        .start_stopwatch(&d, T0, T0 + 30 * MINUTE, CountDirection::Down, false)
        .await
        .unwrap();
    let b = h
        .controller
        .start_stopwatch(&d, T0 + 5 * MINUTE, T0 + 20 * MINUTE, CountDirection::Up, true)
        .await
        .unwrap();

    assert_eq!(h.at(T0 + 5 * MINUTE).await, 1);
    let device = h.controller.device(&d).unwrap();
    assert!(device.is_running_stopwatch(&b.schedule_id));
    assert_eq!(device.stopwatches.len(), 1);

    assert_eq!(h.at(T0 + 20 * MINUTE).await, 1);
    assert_eq!(h.controller.device(&d).unwrap().mode, DeviceMode::Clock);
    assert_eq!(h.at(T0 + 30 * MINUTE).await, 0);
}

#[tokio::test]
async fn stopwatch_end_after_notice_took_over_keeps_notice() {
    let h = Harness::new();
    let d = h.online("D23").await;
    h.controller
        .start_stopwatch(&d, T0, T0 + 10 * MINUTE, CountDirection::Down, false)
        .await
        .unwrap();
    h.clock.set(T0 + MINUTE);
    h.controller.send_notice(&d, "Break", 0).await.unwrap();

    assert_eq!(h.at(T0 + 10 * MINUTE).await, 1);
    let device = h.controller.device(&d).unwrap();
    assert_eq!(device.mode, DeviceMode::Notice);
    assert!(device.stopwatches.is_empty());
    assert_eq!(
        h.link.last(),
        Some(DeviceCommand::Notice {
            text: "Break".into(),
            duration_ms: None,
        })
    );
}

#[tokio::test]
async fn set_mode_guards() {
    let h = Harness::new();
    let d = h.online("D13").await;

    let err = h.controller.set_mode(&d, DeviceMode::Notice).await.unwrap_err();
    assert_eq!(err.code(), "INVALID_ARGUMENT");
    let err = h.controller.set_mode(&d, DeviceMode::Stopwatch).await.unwrap_err();
    assert_eq!(err.code(), "INVALID_ARGUMENT");

    h.controller.set_mode(&d, DeviceMode::Clock).await.unwrap();
    assert!(h.link.sent().is_empty());

    h.controller.send_notice(&d, "Hello", 0).await.unwrap();
    h.controller.set_mode(&d, DeviceMode::Clock).await.unwrap();
    h.controller.set_mode(&d, DeviceMode::Notice).await.unwrap();
    assert_eq!(
        h.link.last(),
        Some(DeviceCommand::Mode {
            mode: DeviceMode::Notice
        })
    );

    let err = h
        .controller
        .set_mode(&DeviceId::from("ghost"), DeviceMode::Clock)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "NOT_FOUND");
}

#[tokio::test]
async fn delivery_failure_surfaces_for_commands_but_keeps_state() {
    let h = Harness::new();
    let d = h.online("D14").await;
    h.link.fail.store(true, Ordering::SeqCst);

    let err = h.controller.send_notice(&d, "Hi", 1).await.unwrap_err();
    assert_eq!(err.code(), "DELIVERY_FAILURE");
    assert_eq!(h.controller.device(&d).unwrap().mode, DeviceMode::Notice);
}

#[tokio::test]
async fn delivery_failure_in_trigger_is_swallowed() {
    let h = Harness::new();
    let d = h.online("D15").await;
    let sched = h
        .controller
        .schedule_notice(&d, "Quiet", T0 + 1_000, T0 + 2_000)
        .await
        .unwrap();
    h.link.fail.store(true, Ordering::SeqCst);

    assert_eq!(h.at(T0 + 1_000).await, 1);
    let start = h.scheduler.get(sched.start_trigger.as_ref().unwrap()).unwrap().unwrap();
    assert_eq!(start.status, TriggerStatus::Executed);
    assert_eq!(h.controller.device(&d).unwrap().mode, DeviceMode::Notice);
}

#[tokio::test]
async fn failed_replay_keeps_notice_pending() {
    let h = Harness::new();
    let d = h.provision("D16");
    h.controller.send_notice(&d, "Later", 0).await.unwrap();

    h.link.fail.store(true, Ordering::SeqCst);
    h.controller
        .report_device_status(&d, Connectivity::Online, json!({}))
        .await
        .unwrap();
    assert!(h.controller.device(&d).unwrap().pending_notice);

    h.link.fail.store(false, Ordering::SeqCst);
    h.controller
        .report_device_status(&d, Connectivity::Online, json!({}))
        .await
        .unwrap();
    assert!(!h.controller.device(&d).unwrap().pending_notice);
    assert_eq!(h.link.notices().len(), 1);
}

#[tokio::test]
async fn reports_broadcast_status_events() {
    let h = Harness::new();
    let d = h.online("D17").await;

    let events = h.sink.0.lock().unwrap().clone();
    let topics: Vec<&str> = events.iter().map(|(t, _)| t.as_str()).collect();
    assert!(topics.contains(&"device:D17:status"));
    assert!(topics.contains(&FLEET_STATUS_TOPIC));

    let (_, payload) = events.last().unwrap();
    assert_eq!(payload["deviceId"], d.as_str());
    assert_eq!(payload["connectivity"], "online");
    assert_eq!(payload["pendingNotice"], false);
    assert_eq!(payload["lastSeenMs"], T0);
}

#[tokio::test]
async fn first_contact_creates_device() {
    let h = Harness::new();
    let id = DeviceId::from("aa:bb:cc");
    h.controller
        .report_device_status(&id, Connectivity::Online, json!({ "fw": "2.0" }))
        .await
        .unwrap();

    let device = h.controller.device(&id).unwrap();
    assert!(device.is_online());
    assert_eq!(device.link_ref.as_str(), "aa:bb:cc");
    assert_eq!(h.controller.list_devices().unwrap().len(), 1);
}

fn open_pair(dir: &Path) -> (Connection, Connection) {
    let path = dir.join("clockfleet.db");
    (
        Connection::open(&path).unwrap(),
        Connection::open(&path).unwrap(),
    )
}

#[tokio::test]
async fn scheduled_notice_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(ManualClock::new(T0));

    let (d, schedule_id) = {
        let (devices, triggers) = open_pair(dir.path());
        let h = Harness::build(devices, triggers, clock.clone());
        let d = h.online("D18").await;
        let sched = h
            .controller
            .schedule_notice(&d, "After reboot", T0 + MINUTE, T0 + HOUR)
            .await
            .unwrap();
        (d, sched.schedule_id)
    };

    // Process was down across the start time.
    clock.set(T0 + 2 * MINUTE);
    let (devices, triggers) = open_pair(dir.path());
    let h = Harness::build(devices, triggers, clock.clone());
    assert_eq!(h.engine.run_due().await, 1);

    let device = h.controller.device(&d).unwrap();
    assert_eq!(device.mode, DeviceMode::Notice);
    assert_eq!(device.notice_schedule_id.as_ref(), Some(&schedule_id));
    assert_eq!(h.link.notices().len(), 1);

    assert_eq!(h.at(T0 + HOUR).await, 1);
    assert_eq!(h.controller.device(&d).unwrap().mode, DeviceMode::Clock);
}
