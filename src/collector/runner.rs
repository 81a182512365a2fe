use std::future::Future;
use std::ops::ControlFlow;

use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant, MissedTickBehavior, interval_at};

/// A cancellable repeating task.
///
/// Every `period` the tick closure is awaited once. The first tick
/// fires one full period after `start` (not immediately), and ticks
/// missed while a tick was running are delayed rather than burst.
///
/// GUARANTEES:
/// - Dropping or cancelling the schedule aborts the timer loop
/// - Work the tick itself spawned is NOT aborted
/// - The loop ends on its own when a tick returns `Break`
///
/// A tick that only dispatches work (spawns tasks) returns quickly,
/// so a slow target never holds up the next tick.
///
#[derive(Debug)]
pub struct Schedule {
    period: Duration,
    handle: JoinHandle<()>,
}

impl Schedule {
    /// Spawns the timer loop on the current tokio runtime.
    pub fn start<F, Fut>(period: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ControlFlow<()>> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            let mut timer = interval_at(Instant::now() + period, period);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                timer.tick().await;
                if tick().await.is_break() {
                    log::debug!("Schedule owner gone, stopping timer loop");
                    break;
                }
            }
        });

        Self { period, handle }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Stops the timer loop. Takes effect before this call returns for
    /// every tick that has not started yet.
    pub fn cancel(self) {
        // Drop aborts
    }
}

impl Drop for Schedule {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn counting(period: Duration, ticks: Arc<AtomicUsize>) -> Schedule {
        Schedule::start(period, move || {
            let ticks = ticks.clone();
            async move {
                ticks.fetch_add(1, Ordering::SeqCst);
                ControlFlow::Continue(())
            }
        })
    }

    #[tokio::test(start_paused = true)]
    async fn first_tick_waits_one_period() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let _schedule = counting(Duration::from_secs(20), ticks.clone());

        tokio::time::sleep(Duration::from_secs(19)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_stops_further_ticks() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let schedule = counting(Duration::from_secs(1), ticks.clone());

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 1);

        schedule.cancel();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn break_ends_the_loop() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let schedule = Schedule::start(Duration::from_secs(1), {
            let ticks = ticks.clone();
            move || {
                let ticks = ticks.clone();
                async move {
                    ticks.fetch_add(1, Ordering::SeqCst);
                    ControlFlow::Break(())
                }
            }
        });

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 1);
        assert!(schedule.handle.is_finished());
    }
}
