use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// Two schedule forms (spec §4.1): round-boundary intervals, or a fixed list of times-of-day.
#[derive(Debug, Clone)]
pub enum Schedule {
    IntervalMinutes(u32),
    FixedTimes(Vec<(u32, u32)>),
}

impl Schedule {
    /// Seconds to sleep from `now` until the next fire time, in the given timezone.
    pub fn next_delay(&self, now: DateTime<Utc>, tz: Tz) -> std::time::Duration {
        let local = now.with_timezone(&tz);
        match self {
            Schedule::IntervalMinutes(n) => {
                let n = (*n).max(1) as i64;
                let minute = local.minute() as i64;
                let next_boundary = ((minute / n) + 1) * n;
                let rollover_hours = next_boundary / 60;
                let target_minute = next_boundary % 60;
                let mut target = local
                    .date_naive()
                    .and_hms_opt(local.hour(), 0, 0)
                    .unwrap();
                target += ChronoDuration::hours(rollover_hours);
                target += ChronoDuration::minutes(target_minute);
                let target_tz = tz.from_local_datetime(&target).single().unwrap_or(local);
                (target_tz - local).to_std().unwrap_or(std::time::Duration::from_secs(1))
            }
            Schedule::FixedTimes(times) => {
                let mut candidates: Vec<DateTime<Tz>> = times
                    .iter()
                    .filter_map(|(h, m)| {
                        let naive = local.date_naive().and_hms_opt(*h, *m, 0)?;
                        tz.from_local_datetime(&naive).single()
                    })
                    .collect();
                candidates.sort();
                let next = candidates
                    .into_iter()
                    .find(|t| *t > local)
                    .unwrap_or_else(|| {
                        let (h, m) = times.first().copied().unwrap_or((1, 0));
                        let naive = (local.date_naive() + ChronoDuration::days(1))
                            .and_hms_opt(h, m, 0)
                            .expect("valid fixed time");
                        tz.from_local_datetime(&naive).single().unwrap_or(local)
                    });
                (next - local).to_std().unwrap_or(std::time::Duration::from_secs(1))
            }
        }
    }
}

/// Fires a handler on a schedule, in a fixed timezone (spec §4.1, C1). Ticks for the same service
/// never overlap: a tick that arrives while the previous is still running is skipped, not queued.
pub struct ScheduledWorker {
    running: Arc<AtomicBool>,
    stopped: Arc<AtomicBool>,
    wake: Arc<Notify>,
    handle: Option<JoinHandle<()>>,
}

impl ScheduledWorker {
    pub fn start<F, Fut>(name: String, schedule: Schedule, timezone: Tz, mut handler: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let running = Arc::new(AtomicBool::new(false));
        let stopped = Arc::new(AtomicBool::new(false));
        let wake = Arc::new(Notify::new());
        let running_task = running.clone();
        let stopped_task = stopped.clone();
        let wake_task = wake.clone();

        // `stopped` is the authoritative shutdown signal, polled after every suspension point
        // (including after a handler that may have run for minutes); `wake` only short-circuits
        // the sleep so stop() doesn't have to wait out a full schedule interval. A lone
        // `notify_waiters()` reaching no registered waiter (the handler is mid-flight) must never
        // be able to strand the loop waiting on a signal that already fired.
        let handle = tokio::spawn(async move {
            loop {
                if stopped_task.load(Ordering::SeqCst) {
                    break;
                }

                let delay = schedule.next_delay(Utc::now(), timezone);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = wake_task.notified() => {}
                }

                if stopped_task.load(Ordering::SeqCst) {
                    break;
                }

                if running_task
                    .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                    .is_err()
                {
                    tracing::warn!(worker = %name, "tick skipped: previous handler still running");
                    continue;
                }

                handler().await;
                running_task.store(false, Ordering::SeqCst);

                if stopped_task.load(Ordering::SeqCst) {
                    break;
                }
            }
        });

        Self {
            running,
            stopped,
            wake,
            handle: Some(handle),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Signals stop; in-flight handlers finish on their own, no new ticks fire (spec §4.1). Safe
    /// to call while a handler is running: `stopped` is polled again as soon as it returns, so a
    /// `wake` notification that arrives with no registered waiter can never strand the loop.
    pub async fn stop(mut self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.wake.notify_waiters();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}
