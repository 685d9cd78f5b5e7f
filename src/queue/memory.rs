//! In-memory queue used by tests and local development.
//!
//! Mirrors the Redis backend's semantics: FIFO main queue, delayed
//! entries promoted when due, reservations that expire back onto the
//! main queue, and registry counters.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::queue::{JobQueue, QueueError, QueueStats, ReservedJob, SchedulingJob};

struct Inflight {
    payload: String,
    deadline: DateTime<Utc>,
}

#[derive(Default)]
struct State {
    main: VecDeque<String>,
    delayed: Vec<(DateTime<Utc>, String)>,
    inflight: HashMap<u64, Inflight>,
    /// Custody refcount per deployment id; duplicates are possible under
    /// at-least-once delivery.
    tracked: HashMap<i64, u32>,
    finished: u64,
    failed: u64,
    next_token: u64,
}

impl State {
    fn track(&mut self, deployment_id: i64) {
        *self.tracked.entry(deployment_id).or_insert(0) += 1;
    }

    fn untrack(&mut self, deployment_id: i64) {
        if let Some(count) = self.tracked.get_mut(&deployment_id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.tracked.remove(&deployment_id);
            }
        }
    }

    /// Promote due delayed jobs and expired reservations onto the main
    /// queue. Returns how many entries moved.
    fn promote(&mut self, now: DateTime<Utc>) -> u64 {
        let mut moved = 0;

        let mut due: Vec<_> = Vec::new();
        self.delayed.retain(|(at, payload)| {
            if *at <= now {
                due.push((*at, payload.clone()));
                false
            } else {
                true
            }
        });
        due.sort_by(|a, b| a.0.cmp(&b.0));
        for (_, payload) in due {
            self.main.push_back(payload);
            moved += 1;
        }

        let expired: Vec<u64> = self
            .inflight
            .iter()
            .filter(|(_, entry)| entry.deadline <= now)
            .map(|(token, _)| *token)
            .collect();
        for token in expired {
            if let Some(entry) = self.inflight.remove(&token) {
                self.main.push_back(entry.payload);
                moved += 1;
            }
        }

        moved
    }
}

#[derive(Clone, Default)]
pub struct MemoryJobQueue {
    inner: Arc<Mutex<State>>,
}

impl MemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.inner.lock().expect("queue mutex poisoned")
    }
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    async fn ping(&self) -> Result<(), QueueError> {
        Ok(())
    }

    async fn enqueue(&self, job: SchedulingJob) -> Result<(), QueueError> {
        let payload = serde_json::to_string(&job)?;
        let mut state = self.lock();
        state.track(job.deployment_id);
        state.main.push_back(payload);
        Ok(())
    }

    async fn enqueue_after(&self, job: SchedulingJob, delay: Duration) -> Result<(), QueueError> {
        let payload = serde_json::to_string(&job)?;
        let due = Utc::now()
            + chrono::Duration::from_std(delay)
                .map_err(|e| QueueError::Backend(e.to_string()))?;
        let mut state = self.lock();
        state.track(job.deployment_id);
        state.delayed.push((due, payload));
        Ok(())
    }

    async fn reserve(&self, visibility: Duration) -> Result<Option<ReservedJob>, QueueError> {
        let now = Utc::now();
        let mut state = self.lock();
        state.promote(now);

        let Some(payload) = state.main.pop_front() else {
            return Ok(None);
        };

        let job: SchedulingJob = serde_json::from_str(&payload)?;
        state.next_token += 1;
        let token = state.next_token;
        let deadline = now
            + chrono::Duration::from_std(visibility)
                .map_err(|e| QueueError::Backend(e.to_string()))?;
        state.inflight.insert(
            token,
            Inflight {
                payload: payload.clone(),
                deadline,
            },
        );

        Ok(Some(ReservedJob {
            job,
            payload,
            token,
        }))
    }

    async fn ack(&self, job: &ReservedJob) -> Result<(), QueueError> {
        let mut state = self.lock();
        // A reservation that already expired was redelivered; this ack is
        // then a no-op and the duplicate delivery settles on its own.
        if state.inflight.remove(&job.token).is_some() {
            state.finished += 1;
            state.untrack(job.job.deployment_id);
        }
        Ok(())
    }

    async fn fail(&self, job: &ReservedJob) -> Result<(), QueueError> {
        let mut state = self.lock();
        if state.inflight.remove(&job.token).is_some() {
            state.failed += 1;
            state.untrack(job.job.deployment_id);
        }
        Ok(())
    }

    async fn nack(&self, job: &ReservedJob) -> Result<(), QueueError> {
        let mut state = self.lock();
        if let Some(entry) = state.inflight.remove(&job.token) {
            state.main.push_front(entry.payload);
        }
        Ok(())
    }

    async fn promote_due(&self) -> Result<u64, QueueError> {
        Ok(self.lock().promote(Utc::now()))
    }

    async fn is_tracked(&self, deployment_id: i64) -> Result<bool, QueueError> {
        Ok(self
            .lock()
            .tracked
            .get(&deployment_id)
            .is_some_and(|count| *count > 0))
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        let state = self.lock();
        Ok(QueueStats {
            queued: (state.main.len() + state.delayed.len()) as u64,
            started: state.inflight.len() as u64,
            finished: state.finished,
            failed: state.failed,
        })
    }
}
