//! Polling driver: periodic discovery passes over the tracker.

use std::time::Duration;

use tracing::{debug, info};

use crate::coordinator::Coordinator;

/// Runs the coordinator on a fixed interval, forever.
///
/// A pass that finds nothing, or whose tracker call fails, simply waits out
/// the interval; per-ticket errors are absorbed inside the coordinator, so
/// the loop itself never exits.
pub struct PollingDriver {
    coordinator: Coordinator,
    interval: Duration,
}

impl PollingDriver {
    pub fn new(coordinator: Coordinator, interval: Duration) -> Self {
        Self {
            coordinator,
            interval,
        }
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    /// One discovery pass: fetch eligible tickets and process them
    /// sequentially. Returns the number of tickets picked up.
    pub async fn run_once(&mut self) -> usize {
        let tickets = self.coordinator.fetch_eligible().await;
        if tickets.is_empty() {
            debug!("no eligible tickets this pass");
            return 0;
        }

        info!(count = tickets.len(), "picked up eligible tickets");
        for ticket in &tickets {
            self.coordinator.process_ticket(ticket).await;
        }
        tickets.len()
    }

    pub async fn run_forever(&mut self) {
        info!(interval_secs = self.interval.as_secs(), "polling loop started");
        loop {
            self.run_once().await;
            tokio::time::sleep(self.interval).await;
        }
    }
}
