use std::sync::Arc;

use async_trait::async_trait;
use clockfleet_core::clock::minutes_to_ms;
use clockfleet_core::{Clock, Connectivity, CountDirection, DeviceId, DeviceMode, LinkRef, ScheduleId, TriggerId};
use clockfleet_devices::{Device, DeviceStore, ModeChange, ScheduledNotice, Stopwatch};
use clockfleet_link::{DeviceCommand, DeviceLink, DeviceReport};
use clockfleet_scheduler::{HandlerError, SchedulerHandle, Trigger, TriggerAction, TriggerHandler};
use dashmap::{DashMap, DashSet};
use serde::Serialize;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, info, instrument, warn};

use crate::{
    error::{ControllerError, Result},
    events::{device_status_topic, EventSink, StatusEvent, FLEET_STATUS_TOPIC},
};

/// Handle to a schedule created by the controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleRef {
    pub schedule_id: ScheduleId,
    pub start_trigger: Option<TriggerId>,
    pub end_trigger: Option<TriggerId>,
}

/// Removes a device from the replay in-flight set when dropped.
struct ReplayGuard<'a> {
    replaying: &'a DashSet<DeviceId>,
    id: DeviceId,
}

impl Drop for ReplayGuard<'_> {
    fn drop(&mut self) {
        self.replaying.remove(&self.id);
    }
}

/// The device mode state machine.
///
/// Every operation takes the device's lock only while it reads and mutates
/// stored state (including trigger registration) and releases it before
/// publishing. Publishing happens after the state change and a publish
/// failure does not undo it.
///
/// Construct only after [`SchedulerHandle::recover`] has run, so overlap
/// checks and trigger bookkeeping see every persisted schedule.
pub struct DeviceController {
    devices: Arc<DeviceStore>,
    scheduler: SchedulerHandle,
    link: Arc<dyn DeviceLink>,
    events: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
    locks: DashMap<DeviceId, Arc<AsyncMutex<()>>>,
    replaying: DashSet<DeviceId>,
}

impl DeviceController {
    pub fn new(
        devices: Arc<DeviceStore>,
        scheduler: SchedulerHandle,
        link: Arc<dyn DeviceLink>,
        events: Arc<dyn EventSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            devices,
            scheduler,
            link,
            events,
            clock,
            locks: DashMap::new(),
            replaying: DashSet::new(),
        }
    }

    async fn lock(&self, id: &DeviceId) -> OwnedMutexGuard<()> {
        let mutex = Arc::clone(self.locks.entry(id.clone()).or_default().value());
        mutex.lock_owned().await
    }

    fn emit_status(&self, device: &Device) {
        let payload = match serde_json::to_value(StatusEvent::from(device)) {
            Ok(v) => v,
            Err(e) => {
                warn!(device_id = %device.id, "status event not serialisable: {e}");
                return;
            }
        };
        self.events.emit(&device_status_topic(&device.id), payload.clone());
        self.events.emit(FLEET_STATUS_TOPIC, payload);
    }

    async fn publish(&self, device: &Device, command: &DeviceCommand) -> Result<()> {
        self.link.publish(&device.link_ref, command).await?;
        debug!(
            device_id = %device.id,
            link = self.link.name(),
            channel = %command.channel(),
            "command published"
        );
        Ok(())
    }

    /// Cancel the end-trigger of the notice currently tied to `device`,
    /// unless that notice is a scheduled one (its end-trigger also removes
    /// the schedule entry and must still run).
    fn release_instant_notice(&self, device: &Device) -> Result<()> {
        if let Some(previous) = &device.notice_schedule_id {
            if device.scheduled_notice(previous).is_none() {
                self.scheduler.cancel_schedule(previous)?;
            }
        }
        Ok(())
    }

    /// Retire the stopwatch on screen before `next` replaces it: its
    /// triggers are cancelled and its entry removed.
    fn release_running_stopwatch(&self, device: &Device, next: &ScheduleId) -> Result<()> {
        if device.mode != DeviceMode::Stopwatch {
            return Ok(());
        }
        if let Some(previous) = device.stopwatch_id.as_ref().filter(|p| *p != next) {
            self.scheduler.cancel_schedule(previous)?;
            self.devices.remove_stopwatch(&device.id, previous)?;
            debug!(device_id = %device.id, schedule_id = %previous, "running stopwatch superseded");
        }
        Ok(())
    }

    // --- pass-throughs -----------------------------------------------------

    pub fn provision_device(&self, id: &DeviceId, link_ref: &LinkRef) -> Result<Device> {
        let device = self.devices.provision(id, link_ref)?;
        info!(device_id = %id, link_ref = %link_ref, "device provisioned");
        Ok(device)
    }

    pub fn device(&self, id: &DeviceId) -> Result<Device> {
        Ok(self.devices.get(id)?)
    }

    pub fn list_devices(&self) -> Result<Vec<Device>> {
        Ok(self.devices.list()?)
    }

    // --- commands ----------------------------------------------------------

    /// Switch between the clock face and the stored notice. Asking for the
    /// mode the device is already in changes nothing and publishes nothing.
    #[instrument(skip(self, id), fields(device_id = %id))]
    pub async fn set_mode(&self, id: &DeviceId, mode: DeviceMode) -> Result<Device> {
        let device = {
            let _lock = self.lock(id).await;
            let device = self.devices.get(id)?;
            if device.mode == mode {
                debug!("mode unchanged");
                return Ok(device);
            }
            let change = match mode {
                DeviceMode::Clock => {
                    self.release_instant_notice(&device)?;
                    ModeChange::Clock
                }
                DeviceMode::Notice => {
                    let text = device.current_notice.clone().ok_or_else(|| {
                        ControllerError::InvalidArgument(
                            "notice mode needs a notice; send one first".into(),
                        )
                    })?;
                    ModeChange::Notice {
                        text,
                        duration_ms: None,
                        schedule_id: None,
                    }
                }
                DeviceMode::Stopwatch => {
                    return Err(ControllerError::InvalidArgument(
                        "set_mode accepts clock or notice; use start_stopwatch".into(),
                    ))
                }
            };
            self.devices.apply_mode_change(id, &change)?
        };
        info!(%mode, "mode changed");
        self.emit_status(&device);
        self.publish(&device, &DeviceCommand::Mode { mode }).await?;
        Ok(device)
    }

    /// Show `text` now, or buffer it for replay if the device is offline.
    ///
    /// A non-zero `duration_minutes` reverts the device to its clock face when
    /// it runs out; for a buffered notice the countdown starts on replay.
    #[instrument(skip(self, id, text), fields(device_id = %id))]
    pub async fn send_notice(
        &self,
        id: &DeviceId,
        text: &str,
        duration_minutes: u32,
    ) -> Result<Device> {
        if text.trim().is_empty() {
            return Err(ControllerError::InvalidArgument("notice text is empty".into()));
        }
        let duration_ms = (duration_minutes > 0).then(|| minutes_to_ms(duration_minutes));
        let schedule_id = ScheduleId::new();

        let device = {
            let _lock = self.lock(id).await;
            let device = self.devices.get(id)?;
            self.release_instant_notice(&device)?;

            if !device.is_online() {
                let device = self.devices.apply_mode_change(
                    id,
                    &ModeChange::PendingNotice {
                        text: text.to_string(),
                        duration_ms,
                        schedule_id: Some(schedule_id),
                    },
                )?;
                info!("device offline; notice buffered for replay");
                self.emit_status(&device);
                return Ok(device);
            }

            let device = self.devices.apply_mode_change(
                id,
                &ModeChange::Notice {
                    text: text.to_string(),
                    duration_ms,
                    schedule_id: Some(schedule_id.clone()),
                },
            )?;
            if let Some(ms) = duration_ms {
                self.scheduler.register(
                    id,
                    TriggerAction::NoticeEnd { schedule_id },
                    self.clock.now_ms().saturating_add(ms),
                )?;
            }
            device
        };

        self.emit_status(&device);
        self.publish(
            &device,
            &DeviceCommand::Notice {
                text: text.to_string(),
                duration_ms,
            },
        )
        .await?;
        Ok(device)
    }

    /// Accept a notice for `[start_ms, end_ms)`, rejecting it if it overlaps
    /// an already scheduled notice on the same device.
    #[instrument(skip(self, id, text), fields(device_id = %id))]
    pub async fn schedule_notice(
        &self,
        id: &DeviceId,
        text: &str,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<ScheduleRef> {
        if text.trim().is_empty() {
            return Err(ControllerError::InvalidArgument("notice text is empty".into()));
        }
        if end_ms <= start_ms {
            return Err(ControllerError::InvalidArgument(format!(
                "end ({end_ms}) must be after start ({start_ms})"
            )));
        }
        if end_ms <= self.clock.now_ms() {
            return Err(ControllerError::InvalidArgument(
                "notice window has already closed".into(),
            ));
        }

        let entry = ScheduledNotice {
            schedule_id: ScheduleId::new(),
            notice: text.to_string(),
            start_ms,
            duration_ms: end_ms - start_ms,
        };

        let _lock = self.lock(id).await;
        self.devices.push_scheduled_notice_checked(id, &entry)?;
        let schedule_id = entry.schedule_id.clone();

        let registered = self
            .scheduler
            .register(
                id,
                TriggerAction::NoticeStart {
                    schedule_id: schedule_id.clone(),
                    notice: entry.notice,
                    end_ms,
                },
                start_ms,
            )
            .and_then(|start| {
                self.scheduler
                    .register(
                        id,
                        TriggerAction::NoticeEnd {
                            schedule_id: schedule_id.clone(),
                        },
                        end_ms,
                    )
                    .map(|end| (start, end))
            });

        match registered {
            Ok((start, end)) => {
                info!(schedule_id = %schedule_id, start_ms, end_ms, "notice scheduled");
                Ok(ScheduleRef {
                    schedule_id,
                    start_trigger: Some(start.id),
                    end_trigger: Some(end.id),
                })
            }
            Err(e) => {
                // Keep the entry and its triggers all-or-nothing.
                if let Err(cleanup) = self.scheduler.cancel_schedule(&schedule_id) {
                    warn!(schedule_id = %schedule_id, "trigger cleanup failed: {cleanup}");
                }
                if let Err(cleanup) = self.devices.remove_scheduled_notice(id, &schedule_id) {
                    warn!(schedule_id = %schedule_id, "entry cleanup failed: {cleanup}");
                }
                Err(e.into())
            }
        }
    }

    /// Drop a scheduled notice and both of its triggers. If the notice is on
    /// screen the device goes back to its clock face.
    #[instrument(skip(self, id, schedule_id), fields(device_id = %id, schedule_id = %schedule_id))]
    pub async fn cancel_scheduled_notice(&self, id: &DeviceId, schedule_id: &ScheduleId) -> Result<()> {
        let reverted = {
            let _lock = self.lock(id).await;
            let device = self.devices.get(id)?;
            if self.devices.remove_scheduled_notice(id, schedule_id)?.is_none() {
                return Err(ControllerError::ScheduleNotFound {
                    id: schedule_id.clone(),
                });
            }
            self.scheduler.cancel_schedule(schedule_id)?;

            if device.is_showing(schedule_id) {
                Some(self.devices.apply_mode_change(id, &ModeChange::Clock)?)
            } else {
                if device.pending_notice && device.notice_schedule_id.as_ref() == Some(schedule_id) {
                    let device = self.devices.apply_mode_change(id, &ModeChange::DropPendingNotice)?;
                    self.emit_status(&device);
                }
                None
            }
        };
        info!("scheduled notice cancelled");

        if let Some(device) = reverted {
            self.emit_status(&device);
            self.publish(
                &device,
                &DeviceCommand::Mode {
                    mode: DeviceMode::Clock,
                },
            )
            .await?;
        }
        Ok(())
    }

    /// Create a stopwatch entry. An immediate stopwatch is published now; a
    /// scheduled one gets a start-trigger at `start_ms`. Either way an
    /// end-trigger at `end_ms` returns the device to its clock face. A
    /// stopwatch that starts replaces the one on screen, if any.
    #[instrument(skip(self, id), fields(device_id = %id))]
    pub async fn start_stopwatch(
        &self,
        id: &DeviceId,
        start_ms: i64,
        end_ms: i64,
        direction: CountDirection,
        is_scheduled: bool,
    ) -> Result<ScheduleRef> {
        if end_ms <= start_ms {
            return Err(ControllerError::InvalidArgument(format!(
                "end ({end_ms}) must be after start ({start_ms})"
            )));
        }
        if end_ms <= self.clock.now_ms() {
            return Err(ControllerError::InvalidArgument(
                "stopwatch would already be over".into(),
            ));
        }

        let entry = Stopwatch {
            schedule_id: ScheduleId::new(),
            start_ms,
            end_ms,
            count_direction: direction,
            executed: !is_scheduled,
        };
        let schedule_id = entry.schedule_id.clone();

        let (device, schedule_ref) = {
            let _lock = self.lock(id).await;
            let current = self.devices.get(id)?;
            self.devices.push_stopwatch(id, &entry)?;

            let start_trigger = if is_scheduled {
                let trigger = self.scheduler.register(
                    id,
                    TriggerAction::StopwatchStart {
                        schedule_id: schedule_id.clone(),
                        start_ms,
                        end_ms,
                        direction,
                    },
                    start_ms,
                )?;
                Some(trigger.id)
            } else {
                None
            };
            let end_trigger = self.scheduler.register(
                id,
                TriggerAction::StopwatchEnd {
                    schedule_id: schedule_id.clone(),
                },
                end_ms,
            )?;
            let schedule_ref = ScheduleRef {
                schedule_id: schedule_id.clone(),
                start_trigger,
                end_trigger: Some(end_trigger.id),
            };

            if is_scheduled {
                info!(schedule_id = %schedule_id, start_ms, end_ms, "stopwatch scheduled");
                return Ok(schedule_ref);
            }
            self.release_running_stopwatch(&current, &schedule_id)?;
            (
                self.devices.apply_mode_change(
                    id,
                    &ModeChange::Stopwatch {
                        schedule_id: schedule_id.clone(),
                    },
                )?,
                schedule_ref,
            )
        };

        info!(schedule_id = %schedule_id, start_ms, end_ms, "stopwatch started");
        self.emit_status(&device);
        self.publish(
            &device,
            &DeviceCommand::Stopwatch {
                start_ms,
                end_ms,
                direction,
            },
        )
        .await?;
        Ok(schedule_ref)
    }

    /// Stop a stopwatch and cancel its pending triggers. If it is the one on
    /// screen the device goes back to its clock face; stopping any other
    /// entry leaves the display alone.
    #[instrument(skip(self, id, schedule_id), fields(device_id = %id, schedule_id = %schedule_id))]
    pub async fn stop_stopwatch(&self, id: &DeviceId, schedule_id: &ScheduleId) -> Result<()> {
        let device = {
            let _lock = self.lock(id).await;
            let device = self.devices.get(id)?;
            if self.devices.remove_stopwatch(id, schedule_id)?.is_none() {
                return Err(ControllerError::ScheduleNotFound {
                    id: schedule_id.clone(),
                });
            }
            self.scheduler.cancel_schedule(schedule_id)?;

            if !device.is_running_stopwatch(schedule_id) {
                info!("stopwatch removed; display unchanged");
                return Ok(());
            }
            self.devices.apply_mode_change(id, &ModeChange::Clock)?
        };
        info!("stopwatch stopped");

        self.emit_status(&device);
        self.publish(&device, &DeviceCommand::StopwatchStop).await?;
        Ok(())
    }

    // --- inbound -----------------------------------------------------------

    /// Apply a connectivity/telemetry report. Unknown ids are created with
    /// the id doubling as link ref.
    ///
    /// An online report for a device holding a pending notice replays it,
    /// after the online state has been stored and broadcast.
    #[instrument(skip(self, id, status, telemetry), fields(device_id = %id, %status))]
    pub async fn report_device_status(
        &self,
        id: &DeviceId,
        status: Connectivity,
        telemetry: serde_json::Value,
    ) -> Result<()> {
        let link_ref = match self.devices.get(id) {
            Ok(device) => device.link_ref,
            Err(clockfleet_devices::DeviceStoreError::NotFound { .. }) => LinkRef::from(id.as_str()),
            Err(e) => return Err(e.into()),
        };
        self.apply_report(id, &link_ref, status, &telemetry).await
    }

    /// Entry point for reports coming off the device link, which address
    /// devices by link ref.
    pub async fn handle_report(&self, report: DeviceReport) -> Result<()> {
        let id = match self.devices.find_by_link_ref(&report.link_ref)? {
            Some(device) => device.id,
            None => DeviceId::from(report.link_ref.as_str()),
        };
        self.apply_report(&id, &report.link_ref, report.status, &report.telemetry)
            .await
    }

    async fn apply_report(
        &self,
        id: &DeviceId,
        link_ref: &LinkRef,
        status: Connectivity,
        telemetry: &serde_json::Value,
    ) -> Result<()> {
        let upsert = {
            let _lock = self.lock(id).await;
            self.devices
                .upsert_from_link(id, link_ref, status, telemetry, self.clock.now_ms())?
        };
        if upsert.previous.is_none() {
            info!(device_id = %id, "device created on first contact");
        } else if upsert.changed() {
            info!(device_id = %id, %status, "connectivity changed");
        }
        self.emit_status(&upsert.device);

        if upsert.device.is_online() && upsert.device.pending_notice {
            self.replay_pending_notice(id).await?;
        }
        Ok(())
    }

    /// Publish a buffered notice, then clear the flag. At most one replay per
    /// device runs at a time. A failed publish is logged and leaves the flag
    /// set so the next online report retries.
    async fn replay_pending_notice(&self, id: &DeviceId) -> Result<()> {
        if !self.replaying.insert(id.clone()) {
            debug!(device_id = %id, "replay already in flight");
            return Ok(());
        }
        let _guard = ReplayGuard {
            replaying: &self.replaying,
            id: id.clone(),
        };

        let (device, text, schedule_id, duration_ms) = {
            let _lock = self.lock(id).await;
            let device = self.devices.get(id)?;
            if !device.pending_notice || !device.is_online() {
                return Ok(());
            }
            let Some(text) = device.current_notice.clone() else {
                warn!(device_id = %id, "pending notice without text dropped");
                self.devices.apply_mode_change(id, &ModeChange::DropPendingNotice)?;
                return Ok(());
            };
            let schedule_id = device.notice_schedule_id.clone();
            // A scheduled notice only shows for what is left of its window.
            let duration_ms = match schedule_id.as_ref().and_then(|s| device.scheduled_notice(s)) {
                Some(entry) => {
                    let remaining = entry.end_ms() - self.clock.now_ms();
                    if remaining <= 0 {
                        self.devices.apply_mode_change(id, &ModeChange::DropPendingNotice)?;
                        info!(device_id = %id, "buffered notice window closed; dropped");
                        return Ok(());
                    }
                    Some(remaining)
                }
                None => device.notice_duration_ms,
            };
            (device, text, schedule_id, duration_ms)
        };

        if let Err(e) = self
            .publish(
                &device,
                &DeviceCommand::Notice {
                    text: text.clone(),
                    duration_ms,
                },
            )
            .await
        {
            warn!(device_id = %id, error = %e, "pending notice replay failed; will retry on next report");
            return Ok(());
        }

        let device = {
            let _lock = self.lock(id).await;
            let current = self.devices.get(id)?;
            if !current.pending_notice || current.notice_schedule_id != schedule_id {
                debug!(device_id = %id, "notice superseded during replay");
                return Ok(());
            }
            let is_instant = schedule_id
                .as_ref()
                .is_some_and(|s| current.scheduled_notice(s).is_none());
            let device = self.devices.apply_mode_change(
                id,
                &ModeChange::Notice {
                    text,
                    duration_ms,
                    schedule_id: schedule_id.clone(),
                },
            )?;
            if let (true, Some(ms), Some(sid)) = (is_instant, duration_ms, schedule_id) {
                self.scheduler.register(
                    id,
                    TriggerAction::NoticeEnd { schedule_id: sid },
                    self.clock.now_ms().saturating_add(ms),
                )?;
            }
            device
        };
        info!(device_id = %id, "pending notice replayed");
        self.emit_status(&device);
        Ok(())
    }

    // --- trigger callbacks -------------------------------------------------

    /// Publish from a trigger callback. Delivery failures are logged and
    /// swallowed so one unreachable device never fails the trigger.
    async fn publish_from_trigger(&self, device: &Device, command: &DeviceCommand) {
        if let Err(e) = self.publish(device, command).await {
            warn!(device_id = %device.id, error = %e, "trigger publish failed");
        }
    }

    async fn on_notice_start(
        &self,
        id: &DeviceId,
        schedule_id: &ScheduleId,
        notice: &str,
        end_ms: i64,
    ) -> Result<()> {
        let (device, remaining) = {
            let _lock = self.lock(id).await;
            let device = self.devices.get(id)?;
            if device.scheduled_notice(schedule_id).is_none() {
                debug!(device_id = %id, schedule_id = %schedule_id, "scheduled notice gone; start skipped");
                return Ok(());
            }
            let remaining = end_ms - self.clock.now_ms();
            if remaining <= 0 {
                warn!(device_id = %id, schedule_id = %schedule_id, "notice window closed before start fired; skipped");
                return Ok(());
            }
            self.release_instant_notice(&device)?;

            let change = if device.is_online() {
                ModeChange::Notice {
                    text: notice.to_string(),
                    duration_ms: Some(remaining),
                    schedule_id: Some(schedule_id.clone()),
                }
            } else {
                ModeChange::PendingNotice {
                    text: notice.to_string(),
                    duration_ms: Some(remaining),
                    schedule_id: Some(schedule_id.clone()),
                }
            };
            (self.devices.apply_mode_change(id, &change)?, remaining)
        };
        self.emit_status(&device);

        if device.pending_notice {
            info!(device_id = %id, schedule_id = %schedule_id, "device offline; scheduled notice buffered");
            return Ok(());
        }
        info!(device_id = %id, schedule_id = %schedule_id, "scheduled notice shown");
        self.publish_from_trigger(
            &device,
            &DeviceCommand::Notice {
                text: notice.to_string(),
                duration_ms: Some(remaining),
            },
        )
        .await;
        Ok(())
    }

    async fn on_notice_end(&self, id: &DeviceId, schedule_id: &ScheduleId) -> Result<()> {
        let device = {
            let _lock = self.lock(id).await;
            let device = self.devices.get(id)?;
            self.devices.remove_scheduled_notice(id, schedule_id)?;

            if device.is_showing(schedule_id) {
                self.devices.apply_mode_change(id, &ModeChange::Clock)?
            } else if device.pending_notice && device.notice_schedule_id.as_ref() == Some(schedule_id) {
                let device = self.devices.apply_mode_change(id, &ModeChange::DropPendingNotice)?;
                info!(device_id = %id, schedule_id = %schedule_id, "buffered notice expired unseen");
                self.emit_status(&device);
                return Ok(());
            } else {
                debug!(device_id = %id, schedule_id = %schedule_id, "notice no longer shown; end is a no-op");
                return Ok(());
            }
        };
        info!(device_id = %id, schedule_id = %schedule_id, "notice ended");
        self.emit_status(&device);
        self.publish_from_trigger(
            &device,
            &DeviceCommand::Mode {
                mode: DeviceMode::Clock,
            },
        )
        .await;
        Ok(())
    }

    async fn on_stopwatch_start(
        &self,
        id: &DeviceId,
        schedule_id: &ScheduleId,
        start_ms: i64,
        end_ms: i64,
        direction: CountDirection,
    ) -> Result<()> {
        let device = {
            let _lock = self.lock(id).await;
            let device = self.devices.get(id)?;
            if device.stopwatch(schedule_id).is_none() {
                debug!(device_id = %id, schedule_id = %schedule_id, "stopwatch gone; start skipped");
                return Ok(());
            }
            if self.clock.now_ms() >= end_ms {
                warn!(device_id = %id, schedule_id = %schedule_id, "stopwatch over before start fired; skipped");
                return Ok(());
            }
            self.release_running_stopwatch(&device, schedule_id)?;
            self.devices.mark_stopwatch_executed(id, schedule_id)?;
            self.devices.apply_mode_change(
                id,
                &ModeChange::Stopwatch {
                    schedule_id: schedule_id.clone(),
                },
            )?
        };
        info!(device_id = %id, schedule_id = %schedule_id, "scheduled stopwatch started");
        self.emit_status(&device);
        self.publish_from_trigger(
            &device,
            &DeviceCommand::Stopwatch {
                start_ms,
                end_ms,
                direction,
            },
        )
        .await;
        Ok(())
    }

    async fn on_stopwatch_end(&self, id: &DeviceId, schedule_id: &ScheduleId) -> Result<()> {
        let device = {
            let _lock = self.lock(id).await;
            let device = self.devices.get(id)?;
            if self.devices.remove_stopwatch(id, schedule_id)?.is_none() {
                debug!(device_id = %id, schedule_id = %schedule_id, "stopwatch already stopped");
                return Ok(());
            }
            if !device.is_running_stopwatch(schedule_id) {
                debug!(device_id = %id, schedule_id = %schedule_id, "stopwatch not on screen; end is a no-op");
                return Ok(());
            }
            self.devices.apply_mode_change(id, &ModeChange::Clock)?
        };
        info!(device_id = %id, schedule_id = %schedule_id, "stopwatch ended");
        self.emit_status(&device);
        self.publish_from_trigger(
            &device,
            &DeviceCommand::Mode {
                mode: DeviceMode::Clock,
            },
        )
        .await;
        Ok(())
    }
}

#[async_trait]
impl TriggerHandler for DeviceController {
    /// Every callback re-reads device state before acting, so a late,
    /// repeated or superseded trigger degrades to a no-op.
    async fn on_trigger(&self, trigger: &Trigger) -> std::result::Result<(), HandlerError> {
        let id = &trigger.device_id;
        let outcome = match &trigger.action {
            TriggerAction::NoticeStart {
                schedule_id,
                notice,
                end_ms,
            } => self.on_notice_start(id, schedule_id, notice, *end_ms).await,
            TriggerAction::NoticeEnd { schedule_id } => self.on_notice_end(id, schedule_id).await,
            TriggerAction::StopwatchStart {
                schedule_id,
                start_ms,
                end_ms,
                direction,
            } => {
                self.on_stopwatch_start(id, schedule_id, *start_ms, *end_ms, *direction)
                    .await
            }
            TriggerAction::StopwatchEnd { schedule_id } => {
                self.on_stopwatch_end(id, schedule_id).await
            }
        };
        outcome.map_err(|e| Box::new(e) as HandlerError)
    }
}
