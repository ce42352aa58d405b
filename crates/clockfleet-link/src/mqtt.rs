use std::time::Duration;

use async_trait::async_trait;
use clockfleet_core::{config::MqttConfig, LinkRef};
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, QoS};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{
    backlog::ReportBacklog,
    error::LinkError,
    link::DeviceLink,
    topics::Topics,
    types::{DeviceCommand, DeviceReport},
};

const RECONNECT_BACKOFF: Duration = Duration::from_secs(2);

/// [`DeviceLink`] over an MQTT broker. Commands are published at QoS 1.
#[derive(Clone)]
pub struct MqttLink {
    client: AsyncClient,
    topics: Topics,
}

impl MqttLink {
    /// Build the client from config. The returned [`EventLoop`] must be
    /// driven by [`spawn_link_loop`] for anything to reach the broker.
    pub fn new(config: &MqttConfig) -> (Self, EventLoop) {
        let mut options = MqttOptions::new(&config.client_id, &config.host, config.port);
        options.set_keep_alive(Duration::from_secs(config.keep_alive_secs.max(5)));
        if let Some(user) = config.username.as_deref().filter(|u| !u.is_empty()) {
            options.set_credentials(user, config.password.clone().unwrap_or_default());
        }

        let (client, eventloop) = AsyncClient::new(options, config.channel_capacity);
        let link = Self {
            client,
            topics: Topics::new(&config.topic_prefix),
        };
        (link, eventloop)
    }

    pub fn topics(&self) -> &Topics {
        &self.topics
    }
}

#[async_trait]
impl DeviceLink for MqttLink {
    fn name(&self) -> &str {
        "mqtt"
    }

    async fn publish(&self, link_ref: &LinkRef, command: &DeviceCommand) -> Result<(), LinkError> {
        let topic = self.topics.command(link_ref, command.channel());
        let body = serde_json::to_vec(command)?;
        self.client
            .publish(&topic, QoS::AtLeastOnce, false, body)
            .await
            .map_err(|e| LinkError::PublishFailed(e.to_string()))?;
        debug!(%topic, "command queued");
        Ok(())
    }
}

/// Drive the MQTT event loop until `shutdown` flips to `true`.
///
/// Resubscribes to the status wildcard on every ConnAck and forwards parsed
/// status reports to `reports`. The forward never blocks the poll loop: when
/// the channel is full, reports wait in a [`ReportBacklog`] (one per device,
/// latest status kept) and drain as capacity frees up. Once anything is
/// backlogged, new reports queue behind it so a device's reports stay in
/// order.
pub fn spawn_link_loop(
    link: MqttLink,
    mut eventloop: EventLoop,
    reports: mpsc::Sender<DeviceReport>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let filter = link.topics.status_filter();
        let mut backlog = ReportBacklog::default();
        loop {
            tokio::select! {
                event = eventloop.poll() => match event {
                    Ok(Event::Incoming(Incoming::Publish(message))) => {
                        match link.topics.parse_report(&message.topic, &message.payload) {
                            Ok(report) => forward(&reports, &mut backlog, report),
                            Err(e) => warn!("ignoring mqtt message: {e}"),
                        }
                    }
                    Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                        info!(%filter, "mqtt connected");
                        if let Err(e) = link.client.try_subscribe(filter.as_str(), QoS::AtLeastOnce) {
                            warn!("status subscribe failed: {e}");
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("mqtt poll error: {e}");
                        tokio::time::sleep(RECONNECT_BACKOFF).await;
                    }
                },
                permit = reports.reserve(), if !backlog.is_empty() => match permit {
                    Ok(permit) => {
                        if let Some(report) = backlog.pop() {
                            permit.send(report);
                        }
                    }
                    Err(_) => {
                        warn!(dropped = backlog.len(), "report channel closed; backlog dropped");
                        backlog.clear();
                    }
                },
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        if let Err(e) = link.client.try_disconnect() {
                            debug!("mqtt disconnect: {e}");
                        }
                        info!("mqtt link loop stopped");
                        break;
                    }
                }
            }
        }
    })
}

/// Hand a report to the router without waiting. Backlogs it when the
/// channel is full or when earlier reports are still waiting.
fn forward(
    reports: &mpsc::Sender<DeviceReport>,
    backlog: &mut ReportBacklog,
    report: DeviceReport,
) {
    if !backlog.is_empty() {
        backlog.push(report);
        return;
    }
    match reports.try_send(report) {
        Ok(()) => {}
        Err(TrySendError::Full(report)) => {
            debug!(link_ref = %report.link_ref, "report channel full; status backlogged");
            backlog.push(report);
        }
        Err(TrySendError::Closed(report)) => {
            warn!(link_ref = %report.link_ref, "report channel closed; status dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clockfleet_core::Connectivity;
    use serde_json::json;

    fn report(link: &str, status: Connectivity) -> DeviceReport {
        DeviceReport {
            link_ref: LinkRef::from(link),
            status,
            telemetry: json!({}),
        }
    }

    #[tokio::test]
    async fn full_channel_backlogs_instead_of_dropping() {
        let (tx, mut rx) = mpsc::channel(1);
        let mut backlog = ReportBacklog::default();

        forward(&tx, &mut backlog, report("a", Connectivity::Online));
        forward(&tx, &mut backlog, report("b", Connectivity::Offline));
        forward(&tx, &mut backlog, report("b", Connectivity::Online));
        // Queues behind the backlog to keep arrival order.
        forward(&tx, &mut backlog, report("c", Connectivity::Online));
        assert_eq!(backlog.len(), 2);

        assert_eq!(rx.recv().await.unwrap().link_ref.as_str(), "a");

        let permit = tx.reserve().await.unwrap();
        permit.send(backlog.pop().unwrap());
        let b = rx.recv().await.unwrap();
        assert_eq!(b.link_ref.as_str(), "b");
        assert_eq!(b.status, Connectivity::Online);

        assert_eq!(backlog.pop().unwrap().link_ref.as_str(), "c");
        assert!(backlog.is_empty());
    }

    #[tokio::test]
    async fn closed_channel_drops_report() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let mut backlog = ReportBacklog::default();
        forward(&tx, &mut backlog, report("a", Connectivity::Online));
        assert!(backlog.is_empty());
    }
}
