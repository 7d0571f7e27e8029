//! Per-resource concurrency guard.
//!
//! At most one lease per resource is held at any instant; waiters are woken
//! strictly FIFO, which is what serializes same-resource jobs in enqueue
//! order. A holder that outlives the configured timeout (a crashed worker)
//! is reclaimed so the resource never stays permanently locked; the
//! scheduler marks the orphaned job as failed, it is never resumed.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tracing::warn;

use crate::errors::EngineError;

/// Proof of exclusive access to one resource
#[derive(Debug)]
pub struct Lease {
    pub resource_id: String,
    pub job_id: String,
    token: u64,
}

/// A fixed position in a resource's lease order, not yet awaited.
/// Dropping an enrollment while waiting forfeits the position.
pub struct Enrollment {
    resource_id: String,
    job_id: String,
    token: u64,
    wait_rx: Option<oneshot::Receiver<()>>,
}

impl Enrollment {
    /// Wait until the lease is ours
    pub async fn acquire(self) -> Result<Lease, EngineError> {
        if let Some(rx) = self.wait_rx {
            rx.await.map_err(|_| {
                EngineError::Internal(format!(
                    "lease waiter for {} dropped without wake",
                    self.resource_id
                ))
            })?;
        }

        Ok(Lease {
            resource_id: self.resource_id,
            job_id: self.job_id,
            token: self.token,
        })
    }
}

struct Holder {
    job_id: String,
    token: u64,
    acquired_at: Instant,
}

struct Waiter {
    job_id: String,
    token: u64,
    wake: oneshot::Sender<()>,
}

#[derive(Default)]
struct LockState {
    holder: Option<Holder>,
    waiters: VecDeque<Waiter>,
}

/// Per-resource single-flight lock with FIFO waiters and expiry reclaim
pub struct ConcurrencyGuard {
    locks: Mutex<HashMap<String, LockState>>,
    next_token: AtomicU64,
    lease_timeout: Duration,
}

impl ConcurrencyGuard {
    pub fn new(lease_timeout: Duration) -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(1),
            lease_timeout,
        }
    }

    /// Take the holder slot or join the FIFO waiter queue, without
    /// blocking. The returned enrollment fixes this job's position; callers
    /// needing strict ordering across tasks enroll inside their own
    /// ordering point (the queue claim) and await the lease afterwards.
    pub fn enroll(&self, resource_id: &str, job_id: &str) -> Enrollment {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);

        let wait_rx = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            let state = locks.entry(resource_id.to_string()).or_default();

            if state.holder.is_none() && state.waiters.is_empty() {
                state.holder = Some(Holder {
                    job_id: job_id.to_string(),
                    token,
                    acquired_at: Instant::now(),
                });
                None
            } else {
                let (tx, rx) = oneshot::channel();
                state.waiters.push_back(Waiter {
                    job_id: job_id.to_string(),
                    token,
                    wake: tx,
                });
                Some(rx)
            }
        };

        Enrollment {
            resource_id: resource_id.to_string(),
            job_id: job_id.to_string(),
            token,
            wait_rx,
        }
    }

    /// Acquire the lease for a resource, waiting FIFO behind current users
    pub async fn acquire(
        &self,
        resource_id: &str,
        job_id: &str,
    ) -> Result<Lease, EngineError> {
        self.enroll(resource_id, job_id).acquire().await
    }

    /// Release a lease, promoting the next FIFO waiter. Releasing a lease
    /// that was already reclaimed is a no-op.
    pub fn release(&self, lease: Lease) {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        let Some(state) = locks.get_mut(&lease.resource_id) else {
            return;
        };

        let held_by_us = state
            .holder
            .as_ref()
            .map(|h| h.token == lease.token)
            .unwrap_or(false);
        if !held_by_us {
            // Reclaimed while we were running; the successor already owns it
            return;
        }

        Self::promote(state);
        if state.holder.is_none() && state.waiters.is_empty() {
            locks.remove(&lease.resource_id);
        }
    }

    fn promote(state: &mut LockState) {
        state.holder = None;
        while let Some(waiter) = state.waiters.pop_front() {
            let holder = Holder {
                job_id: waiter.job_id,
                token: waiter.token,
                acquired_at: Instant::now(),
            };
            // A waiter may have been dropped (cancelled while queued)
            if waiter.wake.send(()).is_ok() {
                state.holder = Some(holder);
                return;
            }
        }
    }

    /// Whether a deployment currently holds or awaits the resource's lease
    pub fn is_in_flight(&self, resource_id: &str) -> bool {
        let locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .get(resource_id)
            .map(|state| state.holder.is_some() || !state.waiters.is_empty())
            .unwrap_or(false)
    }

    /// Reclaim leases held longer than the timeout. Returns the
    /// (resource, job) pairs whose leases were revoked so the scheduler
    /// can mark those jobs failed.
    pub fn reclaim_expired(&self) -> Vec<(String, String)> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        let mut reclaimed = Vec::new();

        for (resource_id, state) in locks.iter_mut() {
            let expired = state
                .holder
                .as_ref()
                .map(|h| h.acquired_at.elapsed() > self.lease_timeout)
                .unwrap_or(false);
            if expired {
                let holder = state.holder.take().unwrap();
                warn!(
                    "Reclaiming expired lease on {} held by job {}",
                    resource_id, holder.job_id
                );
                reclaimed.push((resource_id.clone(), holder.job_id));
                Self::promote(state);
            }
        }

        locks.retain(|_, state| state.holder.is_some() || !state.waiters.is_empty());
        reclaimed
    }
}
