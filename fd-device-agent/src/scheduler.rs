//! Periodic job scheduler
//!
//! Single-threaded and cooperative: jobs run one at a time, and the loop
//! sleeps exactly until the earliest next due time instead of polling.
//! Cancellation is honored while sleeping and between jobs; a running job is
//! always allowed to finish.

use async_trait::async_trait;
use chrono::{DateTime, Duration, DurationRound, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Time source for the scheduler
#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
    async fn sleep(&self, duration: std::time::Duration);
}

/// Wall clock backed by tokio timers
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, duration: std::time::Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Where a job's next run lands after `now + interval`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Alignment {
    #[default]
    None,
    /// Pinned to second :00 of the minute
    MinuteStart,
}

/// What a job wants after it ran
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobControl {
    Continue,
    /// Never run again
    Cancel,
}

#[async_trait]
pub trait Job: Send {
    fn name(&self) -> &str;
    async fn run(&mut self) -> JobControl;
}

/// A job plus its timing state; only the scheduler moves `next_due`
pub struct ScheduledJob {
    interval: Duration,
    alignment: Alignment,
    run_at_startup: bool,
    next_due: Option<DateTime<Utc>>,
    action: Box<dyn Job>,
}

impl ScheduledJob {
    pub fn new(interval: Duration, action: impl Job + 'static) -> Self {
        Self {
            interval,
            alignment: Alignment::None,
            run_at_startup: false,
            next_due: None,
            action: Box::new(action),
        }
    }

    pub fn aligned(mut self, alignment: Alignment) -> Self {
        self.alignment = alignment;
        self
    }

    /// Run once as soon as the scheduler starts, before the first interval
    pub fn run_at_startup(mut self) -> Self {
        self.run_at_startup = true;
        self
    }

    pub fn name(&self) -> &str {
        self.action.name()
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn next_due(&self) -> Option<DateTime<Utc>> {
        self.next_due
    }

    fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_due.map(|due| due <= now).unwrap_or(false)
    }

    fn schedule_from(&mut self, now: DateTime<Utc>) {
        self.next_due = Some(next_due_after(now, self.interval, self.alignment));
    }
}

/// `now + interval`, aligned as requested and always strictly after `now`
pub fn next_due_after(now: DateTime<Utc>, interval: Duration, alignment: Alignment) -> DateTime<Utc> {
    let next = now + interval;
    match alignment {
        Alignment::None => next,
        Alignment::MinuteStart => {
            let aligned = next.duration_trunc(Duration::minutes(1)).unwrap_or(next);
            if aligned <= now {
                aligned + Duration::minutes(1)
            } else {
                aligned
            }
        }
    }
}

pub struct Scheduler<C> {
    clock: C,
    token: CancellationToken,
}

impl<C: Clock> Scheduler<C> {
    pub fn new(clock: C, token: CancellationToken) -> Self {
        Self { clock, token }
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    /// Run `jobs` until cancelled or until none is ever due again
    pub async fn run(&self, mut jobs: Vec<ScheduledJob>) {
        let start = self.clock.now();
        for job in jobs.iter_mut() {
            job.schedule_from(start);
        }
        info!("Scheduler started with {} job(s)", jobs.len());

        for job in jobs.iter_mut().filter(|j| j.run_at_startup) {
            if self.token.is_cancelled() {
                info!("Scheduler cancelled");
                return;
            }
            debug!("Running {} at startup", job.name());
            self.run_job(job).await;
        }

        loop {
            if self.token.is_cancelled() {
                info!("Scheduler cancelled");
                return;
            }

            let now = self.clock.now();
            let Some(next) = jobs.iter().filter_map(|j| j.next_due).min() else {
                warn!("No more jobs scheduled, stopping scheduler");
                return;
            };

            let wait = next - now;
            if wait > Duration::zero() {
                let wait = wait.to_std().unwrap_or_default();
                debug!("Sleeping {:?} until next job", wait);
                tokio::select! {
                    biased;
                    _ = self.token.cancelled() => {
                        info!("Scheduler cancelled while idle");
                        return;
                    }
                    _ = self.clock.sleep(wait) => {}
                }
                continue;
            }

            for job in jobs.iter_mut().filter(|j| j.is_due(now)) {
                if self.token.is_cancelled() {
                    break;
                }
                self.run_job(job).await;
            }
        }
    }

    async fn run_job(&self, job: &mut ScheduledJob) {
        match job.action.run().await {
            JobControl::Continue => {
                if job.next_due.is_some() {
                    job.schedule_from(self.clock.now());
                }
            }
            JobControl::Cancel => {
                info!("Job {} asked to be unscheduled", job.name());
                job.next_due = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, h, m, s).unwrap()
    }

    struct Noop;

    #[async_trait]
    impl Job for Noop {
        fn name(&self) -> &str {
            "noop"
        }

        async fn run(&mut self) -> JobControl {
            JobControl::Continue
        }
    }

    #[test]
    fn test_unaligned_next_due() {
        assert_eq!(next_due_after(at(12, 3, 27), Duration::minutes(5), Alignment::None), at(12, 8, 27));
    }

    #[test]
    fn test_minute_alignment() {
        assert_eq!(
            next_due_after(at(12, 3, 27), Duration::minutes(5), Alignment::MinuteStart),
            at(12, 8, 0)
        );
        assert_eq!(
            next_due_after(at(12, 3, 0), Duration::minutes(10), Alignment::MinuteStart),
            at(12, 13, 0)
        );
    }

    #[test]
    fn test_alignment_never_lands_in_the_past() {
        let next = next_due_after(at(12, 3, 10), Duration::seconds(20), Alignment::MinuteStart);
        assert_eq!(next, at(12, 4, 0));
    }

    #[test]
    fn test_schedule_from() {
        let mut job = ScheduledJob::new(Duration::minutes(5), Noop).aligned(Alignment::MinuteStart);
        assert!(job.next_due().is_none());
        assert!(!job.is_due(at(0, 0, 0)));

        job.schedule_from(at(9, 59, 59));
        assert_eq!(job.next_due(), Some(at(10, 4, 0)));
        assert!(job.is_due(at(10, 4, 0)));
        assert_eq!(job.name(), "noop");
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let token = CancellationToken::new();
        token.cancel();
        let scheduler = Scheduler::new(SystemClock, token);
        let job = ScheduledJob::new(Duration::minutes(5), Noop).run_at_startup();
        tokio::time::timeout(std::time::Duration::from_secs(1), scheduler.run(vec![job]))
            .await
            .unwrap();
    }
}
