use std::sync::Arc;

use clockfleet_link::DeviceReport;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::controller::DeviceController;

/// Feed inbound device reports to the controller, one at a time, so reports
/// for one device are applied in arrival order. Ends when every sender is
/// dropped.
pub fn spawn_report_router(
    controller: Arc<DeviceController>,
    mut reports: mpsc::Receiver<DeviceReport>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(report) = reports.recv().await {
            let link_ref = report.link_ref.clone();
            if let Err(e) = controller.handle_report(report).await {
                warn!(link_ref = %link_ref, code = e.code(), "device report not applied: {e}");
            }
        }
        info!("report router stopped");
    })
}
