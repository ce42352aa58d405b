use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clockfleet_core::{Clock, DeviceId, ScheduleId, TriggerId};
use dashmap::DashSet;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::{
    error::Result,
    store::ScheduleStore,
    types::{CancelOutcome, RecoveryReport, Trigger, TriggerAction},
};

/// Error type a [`TriggerHandler`] may return. Its text lands in the
/// trigger's `last_error` column.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Receives every trigger the engine fires.
///
/// Called at most once per trigger, except after a crash mid-callback, when
/// [`SchedulerHandle::recover`] re-queues it. Implementations must therefore
/// tolerate a repeated call for the same trigger.
#[async_trait]
pub trait TriggerHandler: Send + Sync {
    async fn on_trigger(&self, trigger: &Trigger) -> std::result::Result<(), HandlerError>;
}

/// Cloneable handle for registering and cancelling triggers while the engine
/// loop runs. Every mutation wakes the engine so a new earliest deadline is
/// picked up without waiting out the current sleep.
#[derive(Clone)]
pub struct SchedulerHandle {
    store: Arc<ScheduleStore>,
    wake: Arc<Notify>,
    clock: Arc<dyn Clock>,
}

impl SchedulerHandle {
    pub fn new(store: ScheduleStore, clock: Arc<dyn Clock>) -> Self {
        Self {
            store: Arc::new(store),
            wake: Arc::new(Notify::new()),
            clock,
        }
    }

    pub fn store(&self) -> &ScheduleStore {
        &self.store
    }

    pub fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }

    /// Persist a trigger that fires at `fires_at_ms`. A time already in the
    /// past fires on the next engine pass.
    pub fn register(
        &self,
        device_id: &DeviceId,
        action: TriggerAction,
        fires_at_ms: i64,
    ) -> Result<Trigger> {
        let trigger = self.store.insert(device_id, action, fires_at_ms)?;
        info!(
            trigger_id = %trigger.id,
            device_id = %device_id,
            kind = %trigger.kind(),
            schedule_id = %trigger.schedule_id(),
            fires_at_ms,
            "trigger registered"
        );
        self.wake.notify_one();
        Ok(trigger)
    }

    pub fn cancel(&self, id: &TriggerId) -> Result<CancelOutcome> {
        let outcome = self.store.cancel(id)?;
        match outcome {
            CancelOutcome::Cancelled => info!(trigger_id = %id, "trigger cancelled"),
            CancelOutcome::AlreadyFinal(status) => {
                debug!(trigger_id = %id, %status, "cancel ignored; trigger already left pending")
            }
        }
        self.wake.notify_one();
        Ok(outcome)
    }

    /// Cancel all still-pending triggers of one schedule. Triggers that have
    /// already fired are left alone.
    pub fn cancel_schedule(&self, schedule_id: &ScheduleId) -> Result<Vec<TriggerId>> {
        let cancelled = self.store.cancel_schedule(schedule_id)?;
        if !cancelled.is_empty() {
            info!(schedule_id = %schedule_id, count = cancelled.len(), "schedule triggers cancelled");
            self.wake.notify_one();
        }
        Ok(cancelled)
    }

    pub fn get(&self, id: &TriggerId) -> Result<Option<Trigger>> {
        self.store.get(id)
    }

    /// Pending triggers that decode cleanly, oldest first.
    pub fn pending(&self) -> Result<Vec<Trigger>> {
        let rows = self.store.pending_rows()?;
        Ok(rows.into_iter().filter_map(|r| r.decode().ok()).collect())
    }

    pub fn pending_count(&self) -> Result<usize> {
        self.store.pending_count()
    }

    /// Startup pass over persisted triggers. Must run before the engine's
    /// first tick.
    ///
    /// Interrupted (`fired`) triggers go back to `pending`; overdue ones are
    /// left pending so the first tick fires them; undecodable rows are marked
    /// failed.
    pub fn recover(&self) -> Result<RecoveryReport> {
        let mut report = RecoveryReport {
            interrupted: self.store.reset_interrupted()?,
            ..RecoveryReport::default()
        };
        let now = self.clock.now_ms();

        for row in self.store.pending_rows()? {
            let id = row.id.clone();
            match row.decode() {
                Ok(t) if t.fires_at_ms <= now => report.overdue += 1,
                Ok(_) => report.rearmed += 1,
                Err(e) => {
                    error!(trigger_id = %id, error = %e, "undecodable trigger marked failed");
                    report.undecodable += 1;
                    if let Err(store_err) = self.store.mark_failed(&id, &e.to_string()) {
                        error!(trigger_id = %id, error = %store_err, "could not mark trigger failed");
                    }
                }
            }
        }

        info!(
            rearmed = report.rearmed,
            overdue = report.overdue,
            interrupted = report.interrupted,
            undecodable = report.undecodable,
            "trigger recovery complete"
        );
        self.wake.notify_one();
        Ok(report)
    }
}

/// Clears a device's busy flag when its firing task ends, including by panic.
struct BusyGuard {
    busy: Arc<DashSet<DeviceId>>,
    device_id: DeviceId,
    wake: Arc<Notify>,
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.busy.remove(&self.device_id);
        self.wake.notify_one();
    }
}

/// Drives trigger execution: sleeps until the earliest pending deadline
/// (capped at `max_sleep`), then fires everything that is due.
///
/// Triggers of one device run sequentially in `fires_at_ms` order; different
/// devices run concurrently. A device whose previous batch is still running
/// is skipped until that batch finishes.
pub struct SchedulerEngine {
    handle: SchedulerHandle,
    handler: Arc<dyn TriggerHandler>,
    busy: Arc<DashSet<DeviceId>>,
    max_sleep: Duration,
}

impl SchedulerEngine {
    pub fn new(handle: SchedulerHandle, handler: Arc<dyn TriggerHandler>, max_sleep_ms: u64) -> Self {
        Self {
            handle,
            handler,
            busy: Arc::new(DashSet::new()),
            max_sleep: Duration::from_millis(max_sleep_ms.max(1)),
        }
    }

    pub fn handle(&self) -> &SchedulerHandle {
        &self.handle
    }

    /// Main event loop. Runs until `shutdown` broadcasts `true`.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(max_sleep_ms = self.max_sleep.as_millis() as u64, "scheduler engine started");

        loop {
            let tick_at = self.handle.now_ms();
            self.tick();
            let delay = self.next_delay(tick_at);

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.handle.wake.notified() => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("scheduler engine shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// How long to sleep after a tick taken at `tick_at`. Anything that was
    /// already due then is either running or waiting on a busy device, and
    /// both paths notify on completion, so only future deadlines shorten
    /// the sleep.
    fn next_delay(&self, tick_at: i64) -> Duration {
        match self.handle.store.next_due_ms() {
            Ok(Some(next)) if next > tick_at => {
                let wait = next.saturating_sub(self.handle.now_ms()).max(0) as u64;
                Duration::from_millis(wait).min(self.max_sleep)
            }
            Ok(_) => self.max_sleep,
            Err(e) => {
                error!("next-due query failed: {e}");
                self.max_sleep
            }
        }
    }

    /// Spawn one task per device with due triggers. Returns the task handles;
    /// each yields the number of triggers it actually fired.
    pub fn tick(&self) -> Vec<JoinHandle<usize>> {
        let now = self.handle.now_ms();
        let rows = match self.handle.store.due(now) {
            Ok(rows) => rows,
            Err(e) => {
                error!("scheduler tick error: {e}");
                return Vec::new();
            }
        };

        let mut groups: Vec<(DeviceId, Vec<Trigger>)> = Vec::new();
        for row in rows {
            let id = row.id.clone();
            let trigger = match row.decode() {
                Ok(t) => t,
                Err(e) => {
                    error!(trigger_id = %id, error = %e, "bad trigger record");
                    if let Err(e) = self.handle.store.mark_failed(&id, &e.to_string()) {
                        error!(trigger_id = %id, "could not mark trigger failed: {e}");
                    }
                    continue;
                }
            };
            match groups.iter_mut().find(|(d, _)| d == &trigger.device_id) {
                Some((_, batch)) => batch.push(trigger),
                None => groups.push((trigger.device_id.clone(), vec![trigger])),
            }
        }

        let mut tasks = Vec::with_capacity(groups.len());
        for (device_id, batch) in groups {
            if !self.busy.insert(device_id.clone()) {
                debug!(device_id = %device_id, "device busy; due triggers wait for next pass");
                continue;
            }
            let guard = BusyGuard {
                busy: Arc::clone(&self.busy),
                device_id,
                wake: Arc::clone(&self.handle.wake),
            };
            let store = Arc::clone(&self.handle.store);
            let handler = Arc::clone(&self.handler);
            tasks.push(tokio::spawn(async move {
                let _guard = guard;
                fire_batch(&store, handler.as_ref(), batch).await
            }));
        }
        tasks
    }

    /// Fire everything due now, including triggers that callbacks register as
    /// already due, and wait for all of it. Returns the number fired.
    pub async fn run_due(&self) -> usize {
        let mut fired = 0;
        loop {
            let tasks = self.tick();
            if tasks.is_empty() {
                break;
            }
            for task in tasks {
                match task.await {
                    Ok(n) => fired += n,
                    Err(e) => error!("trigger task panicked: {e}"),
                }
            }
        }
        fired
    }
}

async fn fire_batch(store: &ScheduleStore, handler: &dyn TriggerHandler, batch: Vec<Trigger>) -> usize {
    let mut fired = 0;
    for trigger in batch {
        // A cancel that landed after the due query wins here.
        match store.claim(&trigger.id) {
            Ok(true) => {}
            Ok(false) => {
                debug!(trigger_id = %trigger.id, "trigger no longer pending; skipped");
                continue;
            }
            Err(e) => {
                error!(trigger_id = %trigger.id, "claim failed: {e}");
                continue;
            }
        }

        info!(
            trigger_id = %trigger.id,
            device_id = %trigger.device_id,
            kind = %trigger.kind(),
            fires_at_ms = trigger.fires_at_ms,
            "firing trigger"
        );
        let outcome = handler.on_trigger(&trigger).await.map_err(|e| e.to_string());
        if let Err(ref e) = outcome {
            warn!(trigger_id = %trigger.id, error = %e, "trigger callback failed");
        }
        if let Err(e) = store.finish(&trigger.id, outcome) {
            error!(trigger_id = %trigger.id, "could not record trigger outcome: {e}");
        }
        fired += 1;
    }
    fired
}
