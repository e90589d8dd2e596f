//! Service loop: wait for the next scheduled instant, run, repeat.

use chrono::{DateTime, Local, Utc};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::schedule::ScheduleDriver;

/// Longest single sleep; the wall clock is re-checked after each slice so
/// host suspend or clock changes do not delay a run.
const MAX_SLEEP_SLICE: Duration = Duration::from_secs(60);

/// Drives runs from a schedule until shutdown.
///
/// Runs never overlap: the next instant is armed only after the previous
/// run returned.
pub struct ScheduleLoop {
    driver: ScheduleDriver,
    run_on_startup: bool,
}

impl ScheduleLoop {
    /// Create a new loop.
    pub fn new(driver: ScheduleDriver, run_on_startup: bool) -> Self {
        Self {
            driver,
            run_on_startup,
        }
    }

    /// Run until `shutdown` is cancelled.
    ///
    /// `sync_fn` receives the time each run starts. A run in progress is not
    /// interrupted by the loop; it observes `shutdown` itself.
    pub async fn run<F, Fut>(mut self, shutdown: CancellationToken, mut sync_fn: F)
    where
        F: FnMut(DateTime<Utc>) -> Fut,
        Fut: Future<Output = ()>,
    {
        info!(
            "Sync scheduler started ({})",
            self.driver.schedule().expression()
        );

        if self.run_on_startup && !shutdown.is_cancelled() {
            let now = Utc::now();
            self.driver.mark_started(now);
            info!("Running initial sync");
            sync_fn(now).await;
        }

        while !shutdown.is_cancelled() {
            let Some(tick) = self.driver.arm(Utc::now()) else {
                error!("Schedule has no further occurrences, stopping");
                break;
            };

            if tick.overdue {
                warn!(
                    "Previous run overran scheduled time {}, starting now",
                    tick.instant.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S")
                );
            } else {
                info!(
                    "Next sync at {} (in {})",
                    tick.instant.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S"),
                    format_delay(tick.delay)
                );
            }

            if !wait_until(tick.instant, &shutdown).await {
                break;
            }

            let now = Utc::now();
            self.driver.mark_fired(&tick, now);
            sync_fn(now).await;
        }

        info!("Sync scheduler stopped");
    }
}

/// Sleep until `instant`; false when shutdown was requested first.
async fn wait_until(instant: DateTime<Utc>, shutdown: &CancellationToken) -> bool {
    loop {
        let remaining = (instant - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        if remaining.is_zero() {
            return true;
        }
        let slice = remaining.min(MAX_SLEEP_SLICE);
        debug!("Sleeping {:?}", slice);

        tokio::select! {
            _ = sleep(slice) => {}
            _ = shutdown.cancelled() => return false,
        }
    }
}

fn format_delay(delay: Duration) -> String {
    let secs = delay.as_secs();
    let (hours, minutes, seconds) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if hours > 0 {
        format!("{}h {}m", hours, minutes)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::CronSchedule;
    use bwsync_common::ScheduleZone;
    use std::sync::{Arc, Mutex};

    fn daily() -> ScheduleDriver {
        ScheduleDriver::new(CronSchedule::parse("0 0 * * *", ScheduleZone::Utc).unwrap())
    }

    #[test]
    fn test_format_delay() {
        assert_eq!(format_delay(Duration::from_secs(3 * 3600 + 120)), "3h 2m");
        assert_eq!(format_delay(Duration::from_secs(125)), "2m 5s");
        assert_eq!(format_delay(Duration::from_secs(9)), "9s");
    }

    #[tokio::test]
    async fn test_startup_run_then_shutdown() {
        let shutdown = CancellationToken::new();
        let runs = Arc::new(Mutex::new(Vec::new()));

        let token = shutdown.clone();
        let recorded = runs.clone();
        ScheduleLoop::new(daily(), true)
            .run(shutdown.clone(), move |at| {
                recorded.lock().unwrap().push(at);
                token.cancel();
                async {}
            })
            .await;

        assert_eq!(runs.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_while_waiting() {
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(50)).await;
            token.cancel();
        });

        let mut runs = 0;
        tokio::time::timeout(
            Duration::from_secs(5),
            ScheduleLoop::new(daily(), false).run(shutdown, |_| {
                runs += 1;
                async {}
            }),
        )
        .await
        .expect("loop did not stop on shutdown");

        assert_eq!(runs, 0);
    }

    #[tokio::test]
    async fn test_runs_follow_schedule_without_overlap() {
        let schedule = CronSchedule::parse_with_interval(
            "* * * * * *",
            ScheduleZone::Utc,
            Utc::now(),
            Duration::ZERO,
        )
        .unwrap();
        let shutdown = CancellationToken::new();
        let runs = Arc::new(Mutex::new(Vec::new()));

        let token = shutdown.clone();
        let recorded = runs.clone();
        tokio::time::timeout(
            Duration::from_secs(10),
            ScheduleLoop::new(ScheduleDriver::new(schedule), false).run(shutdown, move |at| {
                let recorded = recorded.clone();
                let token = token.clone();
                async move {
                    let count = {
                        let mut runs = recorded.lock().unwrap();
                        runs.push(at);
                        runs.len()
                    };
                    if count == 3 {
                        token.cancel();
                    }
                }
            }),
        )
        .await
        .expect("loop did not stop");

        let runs = runs.lock().unwrap();
        assert_eq!(runs.len(), 3);
        assert!(runs.windows(2).all(|pair| pair[0] < pair[1]));
        // Each run lands in a distinct scheduled second.
        assert!(runs
            .windows(2)
            .all(|pair| pair[0].timestamp() != pair[1].timestamp()));
    }
}
