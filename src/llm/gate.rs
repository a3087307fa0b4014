//! Process-wide bounded-concurrency gate for completion calls.
//!
//! Callers take a ticket and wait until their ticket is at the head of the
//! queue and a permit is free, so waiters resume in arrival order.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::debug;

#[derive(Debug, Default)]
struct GateState
{
    active: usize,
    next_ticket: u64,
    queue: VecDeque<u64>,
    acquired: u64,
    peak_active: usize,
    total_wait: Duration,
}

/// Snapshot of the gate counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateStats
{
    pub max_concurrent: usize,
    pub active: usize,
    pub waiting: usize,
    pub acquired: u64,
    pub peak_active: usize,
}

#[derive(Debug)]
pub struct CompletionGate
{
    max_concurrent: usize,
    state: Mutex<GateState>,
    freed: Condvar,
}

impl Default for CompletionGate
{
    fn default() -> Self
    {
        Self::new(1)
    }
}

impl CompletionGate
{
    /// Gate admitting `max_concurrent` callers at once (minimum 1)
    pub fn new(max_concurrent: usize) -> Self
    {
        Self {
            max_concurrent: max_concurrent.max(1),
            state: Mutex::new(GateState::default()),
            freed: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, GateState>
    {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Block until a permit is available for this caller's ticket
    pub fn acquire(&self) -> GatePermit<'_>
    {
        self.admit();

        GatePermit { gate: self }
    }

    /// Like `acquire`, but the permit can be moved to another thread
    pub fn acquire_owned(self: &Arc<Self>) -> OwnedGatePermit
    {
        self.admit();

        OwnedGatePermit { gate: Arc::clone(self) }
    }

    fn admit(&self)
    {
        let started = Instant::now();
        let mut state = self.lock();

        let ticket = state.next_ticket;
        state.next_ticket += 1;
        state
            .queue
            .push_back(ticket);

        while state
            .queue
            .front()
            != Some(&ticket)
            || state.active >= self.max_concurrent
        {
            state = self
                .freed
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }

        state
            .queue
            .pop_front();
        state.active += 1;
        state.acquired += 1;
        state.peak_active = state
            .peak_active
            .max(state.active);

        let waited = started.elapsed();
        state.total_wait += waited;
        let queued = state
            .queue
            .len();
        drop(state);

        // Next ticket may also fit under the limit
        self.freed
            .notify_all();

        debug!(ticket, waited_ms = waited.as_millis() as u64, queued, "completion_gate_wait");
    }

    pub fn stats(&self) -> GateStats
    {
        let state = self.lock();

        GateStats {
            max_concurrent: self.max_concurrent,
            active: state.active,
            waiting: state
                .queue
                .len(),
            acquired: state.acquired,
            peak_active: state.peak_active,
        }
    }

    /// Accumulated time callers spent waiting
    pub fn total_wait(&self) -> Duration
    {
        self.lock()
            .total_wait
    }

    fn release(&self)
    {
        let mut state = self.lock();
        state.active = state
            .active
            .saturating_sub(1);
        drop(state);

        self.freed
            .notify_all();
    }
}

/// Held for the duration of one completion call
#[derive(Debug)]
pub struct GatePermit<'a>
{
    gate: &'a CompletionGate,
}

impl Drop for GatePermit<'_>
{
    fn drop(&mut self)
    {
        self.gate
            .release();
    }
}

/// Permit that owns its gate handle, released when dropped
#[derive(Debug)]
pub struct OwnedGatePermit
{
    gate: Arc<CompletionGate>,
}

impl Drop for OwnedGatePermit
{
    fn drop(&mut self)
    {
        self.gate
            .release();
    }
}

#[cfg(test)]
mod tests
{
    use std::thread;

    use super::*;

    fn wait_for_waiting(
        gate: &CompletionGate,
        n: usize,
    )
    {
        let deadline = Instant::now() + Duration::from_secs(5);
        while gate.stats().waiting < n
        {
            assert!(Instant::now() < deadline, "waiters never queued");
            thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn waiters_resume_in_arrival_order()
    {
        let gate = Arc::new(CompletionGate::new(1));
        let order = Arc::new(Mutex::new(Vec::new()));

        let held = gate.acquire();
        let mut handles = Vec::new();

        for i in 0..4
        {
            let worker_gate = Arc::clone(&gate);
            let order = Arc::clone(&order);
            handles.push(thread::spawn(move || {
                let _permit = worker_gate.acquire();
                order.lock().unwrap().push(i);
            }));
            // Queue strictly one caller at a time
            wait_for_waiting(&gate, i + 1);
        }

        drop(held);
        for h in handles
        {
            h.join().unwrap();
        }

        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
        assert_eq!(gate.stats().peak_active, 1);
        assert_eq!(gate.stats().acquired, 5);
    }

    #[test]
    fn limit_allows_parallel_permits()
    {
        let gate = CompletionGate::new(2);

        let a = gate.acquire();
        let b = gate.acquire();
        assert_eq!(gate.stats().active, 2);

        drop(a);
        drop(b);
        assert_eq!(gate.stats().active, 0);
        assert_eq!(gate.stats().peak_active, 2);
    }

    #[test]
    fn zero_limit_is_raised_to_one()
    {
        let gate = CompletionGate::new(0);
        let _p = gate.acquire();

        assert_eq!(gate.stats().max_concurrent, 1);
    }

    #[test]
    fn owned_permit_releases_on_the_thread_that_drops_it()
    {
        let gate = Arc::new(CompletionGate::new(1));
        let permit = gate.acquire_owned();

        let worker = thread::spawn(move || drop(permit));
        worker.join().unwrap();

        assert_eq!(gate.stats().active, 0);
        let _again = gate.acquire();
        assert_eq!(gate.stats().acquired, 2);
    }
}
