//! Dispatch loop
//!
//! Drives one [`Driver`] on the current tokio task: a periodic
//! `timer_tick` at the driver's poll interval, and `run_timers` whenever its
//! earliest one-shot deadline passes. Callbacks run one at a time, so a
//! driver never sees two entry points overlap.

use std::time::Duration;

use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::driver::{ConnectionState, Driver};

/// Upper bound on how long the loop sleeps without re-reading deadlines
const MAX_IDLE: Duration = Duration::from_secs(1);
/// Shortest poll period the loop accepts
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Run until `shutdown` fires, then disconnect the driver
pub async fn run_driver<D: Driver + ?Sized>(driver: &mut D, shutdown: CancellationToken) {
    let period = driver.poll_interval();
    if period < MIN_POLL_INTERVAL {
        tracing::warn!(
            "{}: poll interval {:?} raised to {:?}",
            driver.name(),
            period,
            MIN_POLL_INTERVAL
        );
    }
    let period = period.max(MIN_POLL_INTERVAL);
    let mut ticker = time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick of an interval completes immediately
    ticker.tick().await;

    tracing::info!(
        "{}: dispatch loop started, polling every {}ms",
        driver.name(),
        period.as_millis()
    );

    loop {
        let wake = match driver.next_deadline() {
            Some(deadline) => Instant::from_std(deadline),
            None => Instant::now() + MAX_IDLE,
        };

        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            _ = time::sleep_until(wake) => {
                if driver.next_deadline().is_some() {
                    driver.run_timers();
                }
            }
            _ = ticker.tick() => {
                if driver.connection_state() == ConnectionState::Connected {
                    driver.timer_tick();
                }
            }
        }
    }

    tracing::info!("{}: shutting down", driver.name());
    driver.disconnect();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::property::Capabilities;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingDriver {
        ticks: Arc<AtomicUsize>,
        fired: Arc<AtomicUsize>,
        deadline: Option<std::time::Instant>,
        disconnected: bool,
        poll: Duration,
    }

    impl Driver for CountingDriver {
        fn name(&self) -> &str {
            "counter"
        }

        fn capabilities(&self) -> Capabilities {
            Capabilities::empty()
        }

        fn connection_state(&self) -> ConnectionState {
            ConnectionState::Connected
        }

        fn poll_interval(&self) -> Duration {
            self.poll
        }

        fn connect(&mut self) -> bool {
            true
        }

        fn disconnect(&mut self) -> bool {
            self.disconnected = true;
            true
        }

        fn timer_tick(&mut self) -> bool {
            self.ticks.fetch_add(1, Ordering::SeqCst);
            true
        }

        fn run_timers(&mut self) -> bool {
            if let Some(deadline) = self.deadline {
                if deadline <= std::time::Instant::now() {
                    self.deadline = None;
                    self.fired.fetch_add(1, Ordering::SeqCst);
                }
            }
            true
        }

        fn next_deadline(&self) -> Option<std::time::Instant> {
            self.deadline
        }

        fn update_number(&mut self, _name: &str, _values: &[f64]) -> bool {
            false
        }

        fn update_switch(&mut self, _name: &str, _states: &[bool]) -> bool {
            false
        }

        fn update_text(&mut self, _name: &str, _values: &[String]) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn test_loop_ticks_fires_deadline_and_disconnects() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let fired = Arc::new(AtomicUsize::new(0));
        let mut driver = CountingDriver {
            ticks: ticks.clone(),
            fired: fired.clone(),
            deadline: Some(std::time::Instant::now() + Duration::from_millis(30)),
            disconnected: false,
            poll: Duration::from_millis(20),
        };

        let shutdown = CancellationToken::new();
        let stopper = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            stopper.cancel();
        });

        run_driver(&mut driver, shutdown).await;

        assert!(ticks.load(Ordering::SeqCst) >= 3);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(driver.disconnected);
    }

    #[tokio::test]
    async fn test_zero_poll_interval_still_ticks() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let mut driver = CountingDriver {
            ticks: ticks.clone(),
            fired: Arc::new(AtomicUsize::new(0)),
            deadline: None,
            disconnected: false,
            poll: Duration::ZERO,
        };

        let shutdown = CancellationToken::new();
        let stopper = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            stopper.cancel();
        });

        run_driver(&mut driver, shutdown).await;

        assert!(ticks.load(Ordering::SeqCst) >= 1);
        assert!(driver.disconnected);
    }
}
