// SPDX-License-Identifier: MIT

//! `ProgressBus`: pub/sub of `ProgressEvent`s keyed by `job_id`, with
//! bounded per-subscriber buffering and a drop-oldest backpressure policy.
//! `tokio::sync::broadcast` already implements exactly that contract (a
//! lagging receiver observes `Lagged(n)` and resumes from the oldest
//! retained message rather than blocking the sender), so each job gets one
//! broadcast channel instead of a hand-rolled fan-out list.

use codestory_core::{JobId, ProgressEvent};
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::sync::broadcast;

const DEFAULT_CAPACITY: usize = 256;

pub struct ProgressBus {
    capacity: usize,
    channels: Mutex<HashMap<JobId, broadcast::Sender<ProgressEvent>>>,
}

impl Default for ProgressBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl ProgressBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            channels: Mutex::new(HashMap::new()),
        }
    }

    fn channel_for(&self, job_id: &JobId) -> broadcast::Sender<ProgressEvent> {
        self.channels
            .lock()
            .entry(job_id.clone())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }

    /// Publish an event; dropped silently if the job currently has no
    /// subscribers, since a `broadcast::Sender::send` error only means
    /// "nobody is listening right now", not a delivery failure.
    pub fn publish(&self, event: ProgressEvent) {
        let sender = self.channel_for(&event.job_id);
        let _ = sender.send(event);
    }

    pub fn subscribe(&self, job_id: &JobId) -> broadcast::Receiver<ProgressEvent> {
        self.channel_for(job_id).subscribe()
    }

    /// Drop the channel for a job once nothing references it any more, so
    /// the map doesn't grow unbounded across a long-lived daemon process.
    pub fn retire(&self, job_id: &JobId) {
        let mut channels = self.channels.lock();
        if let Some(sender) = channels.get(job_id) {
            if sender.receiver_count() == 0 {
                channels.remove(job_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use codestory_core::ProgressKind;

    fn event(job_id: &JobId, seq: u64) -> ProgressEvent {
        ProgressEvent::step(job_id.clone(), "filesystem", seq, 1_000 + seq, ProgressKind::StepStarted)
    }

    #[tokio::test]
    async fn subscriber_receives_published_events_for_its_job() {
        let bus = ProgressBus::new(8);
        let job_id = JobId::new("job-1");
        let mut rx = bus.subscribe(&job_id);
        bus.publish(event(&job_id, 0));
        let received = rx.recv().await.unwrap();
        assert_eq!(received.sequence, 0);
    }

    #[tokio::test]
    async fn events_for_one_job_do_not_leak_to_a_subscriber_of_another() {
        let bus = ProgressBus::new(8);
        let job_a = JobId::new("a");
        let job_b = JobId::new("b");
        let mut rx_b = bus.subscribe(&job_b);
        bus.publish(event(&job_a, 0));
        bus.publish(event(&job_b, 0));
        let received = rx_b.recv().await.unwrap();
        assert_eq!(received.job_id, job_b);
    }

    #[tokio::test]
    async fn a_slow_subscriber_lags_instead_of_blocking_the_publisher() {
        let bus = ProgressBus::new(2);
        let job_id = JobId::new("job-1");
        let mut rx = bus.subscribe(&job_id);
        for seq in 0..10 {
            bus.publish(event(&job_id, seq));
        }
        match rx.recv().await {
            Err(broadcast::error::RecvError::Lagged(_)) => {}
            other => panic!("expected a Lagged error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn retire_drops_the_channel_once_no_subscribers_remain() {
        let bus = ProgressBus::new(8);
        let job_id = JobId::new("job-1");
        {
            let _rx = bus.subscribe(&job_id);
        }
        bus.retire(&job_id);
        assert!(bus.channels.lock().is_empty());
    }
}
