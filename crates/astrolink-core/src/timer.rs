//! Clocks and one-shot timers
//!
//! Every driver owns a [`TimerQueue`] of typed events. The dispatch loop asks
//! the driver for its next deadline and calls back into it when that deadline
//! passes; the driver then pops due events and handles them. Each entry
//! carries a [`CancellationToken`] that is checked right before the entry is
//! handed out, so a cancelled timer never runs, even if it was already due.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

/// Time source shared by a driver and its state machines
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;

    /// Block the calling (dispatch) thread for `duration`
    fn sleep(&self, duration: Duration);
}

/// Wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Test clock: time only moves when told to, and `sleep` advances it
#[derive(Debug)]
pub struct ManualClock {
    start: Instant,
    now: Mutex<Instant>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualClock {
    pub fn new() -> Self {
        let start = Instant::now();
        Self {
            start,
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }

    /// Time elapsed since the clock was created
    pub fn elapsed(&self) -> Duration {
        self.now() - self.start
    }

    /// The instant `offset` after the clock was created
    pub fn at(&self, offset: Duration) -> Instant {
        self.start + offset
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn sleep(&self, duration: Duration) {
        self.advance(duration);
    }
}

/// Handle to a scheduled entry; cancelling it is idempotent
#[derive(Debug, Clone)]
pub struct TimerHandle {
    id: u64,
    token: CancellationToken,
}

impl TimerHandle {
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

#[derive(Debug)]
struct Entry<E> {
    id: u64,
    deadline: Instant,
    event: E,
    token: CancellationToken,
}

/// One-shot timers carrying events of type `E`
#[derive(Debug)]
pub struct TimerQueue<E> {
    entries: Vec<Entry<E>>,
    next_id: u64,
}

impl<E> Default for TimerQueue<E> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            next_id: 0,
        }
    }
}

impl<E> TimerQueue<E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&mut self, deadline: Instant, event: E) -> TimerHandle {
        let id = self.next_id;
        self.next_id += 1;
        let token = CancellationToken::new();
        self.entries.push(Entry {
            id,
            deadline,
            event,
            token: token.clone(),
        });
        TimerHandle { id, token }
    }

    /// Cancel and drop the entry behind `handle`. Returns false if it already fired.
    pub fn cancel(&mut self, handle: &TimerHandle) -> bool {
        handle.cancel();
        let before = self.entries.len();
        self.entries.retain(|e| e.id != handle.id);
        self.entries.len() != before
    }

    /// Cancel every pending entry
    pub fn cancel_all(&mut self) {
        for entry in self.entries.drain(..) {
            entry.token.cancel();
        }
    }

    /// Remove and return the earliest entry due at `now`, skipping cancelled ones
    pub fn pop_due(&mut self, now: Instant) -> Option<E> {
        loop {
            let index = self
                .entries
                .iter()
                .enumerate()
                .filter(|(_, e)| e.deadline <= now)
                .min_by_key(|(_, e)| (e.deadline, e.id))
                .map(|(i, _)| i)?;
            let entry = self.entries.swap_remove(index);
            if entry.token.is_cancelled() {
                continue;
            }
            return Some(entry.event);
        }
    }

    /// Earliest deadline among live entries
    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries
            .iter()
            .filter(|e| !e.token.is_cancelled())
            .map(|e| e.deadline)
            .min()
    }

    /// Live (not cancelled) entries
    pub fn len(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| !e.token.is_cancelled())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    enum Ev {
        A,
        B,
    }

    #[test]
    fn test_pops_in_deadline_order_when_due() {
        let clock = ManualClock::new();
        let mut q = TimerQueue::new();
        q.schedule(clock.at(Duration::from_millis(200)), Ev::B);
        q.schedule(clock.at(Duration::from_millis(100)), Ev::A);

        assert_eq!(q.pop_due(clock.now()), None);
        assert_eq!(q.next_deadline(), Some(clock.at(Duration::from_millis(100))));

        clock.advance(Duration::from_millis(250));
        assert_eq!(q.pop_due(clock.now()), Some(Ev::A));
        assert_eq!(q.pop_due(clock.now()), Some(Ev::B));
        assert!(q.is_empty());
    }

    #[test]
    fn test_cancelled_entry_never_runs_even_when_due() {
        let clock = ManualClock::new();
        let mut q = TimerQueue::new();
        let handle = q.schedule(clock.at(Duration::from_millis(10)), Ev::A);
        clock.advance(Duration::from_millis(20));

        // Token cancelled through a cloned handle, entry still queued
        handle.clone().cancel();
        assert_eq!(q.pop_due(clock.now()), None);
        assert!(!q.cancel(&handle));
    }

    #[test]
    fn test_cancel_all() {
        let clock = ManualClock::new();
        let mut q = TimerQueue::new();
        let h = q.schedule(clock.now(), Ev::A);
        q.schedule(clock.now(), Ev::B);
        q.cancel_all();
        assert!(h.is_cancelled());
        assert_eq!(q.pop_due(clock.now()), None);
        assert_eq!(q.next_deadline(), None);
    }

    #[test]
    fn test_manual_clock_sleep_advances() {
        let clock = ManualClock::new();
        clock.sleep(Duration::from_millis(30));
        assert_eq!(clock.elapsed(), Duration::from_millis(30));
    }
}
