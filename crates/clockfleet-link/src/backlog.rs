use std::collections::{HashMap, VecDeque};

use clockfleet_core::LinkRef;

use crate::types::DeviceReport;

/// Reports the link loop could not hand off yet, held at most once per
/// device.
///
/// A device that reports again while waiting has the new report folded into
/// the held one, so the backlog is bounded by fleet size and the latest
/// connectivity of every device survives. Devices leave in the order they
/// first entered.
#[derive(Debug, Default)]
pub struct ReportBacklog {
    order: VecDeque<LinkRef>,
    held: HashMap<LinkRef, DeviceReport>,
}

impl ReportBacklog {
    pub fn push(&mut self, report: DeviceReport) {
        match self.held.get_mut(&report.link_ref) {
            Some(existing) => existing.absorb(report),
            None => {
                self.order.push_back(report.link_ref.clone());
                self.held.insert(report.link_ref.clone(), report);
            }
        }
    }

    pub fn pop(&mut self) -> Option<DeviceReport> {
        let link_ref = self.order.pop_front()?;
        self.held.remove(&link_ref)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn clear(&mut self) {
        self.order.clear();
        self.held.clear();
    }
}
