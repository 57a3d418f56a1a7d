//! Scheduled Jobs
//!
//! A [`Cron`] is deferred or recurring work owned by a connection or by the
//! connection manager. The owner keeps its jobs in a [`CronList`] and runs
//! it once per loop iteration; inactive jobs are dropped by that same pass.

use std::fmt;
use std::mem;
use std::time::Duration;

use tracing::{debug, trace};

use crate::clock;

/// Work performed when a [`Cron`] fires.
///
/// `T` is the owner the job was attached to, handed back mutably each time
/// the job runs. Any `FnMut(&mut T)` closure is a job.
pub trait Job<T> {
    /// Run the job against its owner
    fn run_job(&mut self, target: &mut T);

    /// Checked after every run; returning `false` stops the cron
    fn keep_running(&self) -> bool {
        true
    }
}

impl<T, F> Job<T> for F
where
    F: FnMut(&mut T),
{
    fn run_job(&mut self, target: &mut T) {
        self(target)
    }
}

/// A single scheduled job
pub struct Cron<T> {
    name: String,
    active: bool,
    once: bool,
    next_fire: u64,
    interval: Duration,
    job: Box<dyn Job<T>>,
}

impl<T> Cron<T> {
    /// Create an active one-shot cron that is due immediately until started
    pub fn new(name: impl Into<String>, job: impl Job<T> + 'static) -> Self {
        Self {
            name: name.into(),
            active: true,
            once: true,
            next_fire: 0,
            interval: Duration::from_secs(60),
            job: Box::new(job),
        }
    }

    /// Create a cron that fires once, `delay` from now
    pub fn once(name: impl Into<String>, delay: Duration, job: impl Job<T> + 'static) -> Self {
        let mut cron = Self::new(name, job);
        cron.start(delay, true);
        cron
    }

    /// Create a cron that fires every `interval`, first after one interval
    pub fn every(name: impl Into<String>, interval: Duration, job: impl Job<T> + 'static) -> Self {
        let mut cron = Self::new(name, job);
        cron.start(interval, false);
        cron
    }

    /// Schedule the cron relative to the current wall clock
    pub fn start(&mut self, interval: Duration, once: bool) {
        self.start_at(clock::now_millis(), interval, once);
    }

    /// Schedule the cron relative to `now` (milliseconds)
    pub fn start_at(&mut self, now: u64, interval: Duration, once: bool) {
        self.interval = interval;
        self.next_fire = now.saturating_add(interval.as_millis() as u64);
        self.once = once;
    }

    /// Deactivate the cron; its owner drops it on the next pass
    pub fn stop(&mut self) {
        self.active = false;
    }

    /// Run the job if it is due at `now`. Returns true if it fired.
    pub fn run(&mut self, target: &mut T, now: u64) -> bool {
        if !self.active || now < self.next_fire {
            return false;
        }

        trace!("Running cron job {}", self.name);
        self.job.run_job(target);

        if self.once || !self.job.keep_running() {
            self.active = false;
        } else {
            self.next_fire = now.saturating_add(self.interval.as_millis() as u64);
        }
        true
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn is_once(&self) -> bool {
        self.once
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    /// Absolute fire time in milliseconds since the epoch
    pub fn next_fire(&self) -> u64 {
        self.next_fire
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}

impl<T> fmt::Debug for Cron<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cron")
            .field("name", &self.name)
            .field("active", &self.active)
            .field("once", &self.once)
            .field("next_fire", &self.next_fire)
            .field("interval", &self.interval)
            .finish()
    }
}

/// Jobs exclusively owned by one connection or manager
pub struct CronList<T> {
    crons: Vec<Cron<T>>,
    /// Names of jobs moved out by [`take_for_run`](Self::take_for_run)
    running: Vec<String>,
    /// Stops requested for those jobs while they were out
    stop_requests: Vec<String>,
}

impl<T> Default for CronList<T> {
    fn default() -> Self {
        Self {
            crons: Vec::new(),
            running: Vec::new(),
            stop_requests: Vec::new(),
        }
    }
}

impl<T> CronList<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a job
    pub fn add(&mut self, cron: Cron<T>) {
        debug!("Adding cron job {}", cron.name());
        self.crons.push(cron);
    }

    /// Housekeeping pass: drop inactive jobs, then run every due job.
    /// Returns the number of jobs that fired.
    pub fn run(&mut self, target: &mut T, now: u64) -> usize {
        self.crons.retain(|cron| {
            if !cron.is_active() {
                debug!("Removing inactive cron job {}", cron.name());
            }
            cron.is_active()
        });

        let mut fired = 0;
        for cron in self.crons.iter_mut() {
            if cron.run(target, now) {
                fired += 1;
            }
        }
        fired
    }

    /// Move the jobs out so they can run against their owner.
    ///
    /// The names stay behind: a job that stops itself or a sibling through
    /// the owner is still found, and the stop is applied by
    /// [`restore`](Self::restore).
    pub fn take_for_run(&mut self) -> CronList<T> {
        self.running = self.crons.iter().map(|c| c.name().to_string()).collect();
        CronList {
            crons: mem::take(&mut self.crons),
            ..CronList::default()
        }
    }

    /// Put back jobs taken by [`take_for_run`](Self::take_for_run). Stops
    /// requested meanwhile are applied and jobs added meanwhile are kept
    /// after them.
    pub fn restore(&mut self, mut ran: CronList<T>) {
        for name in self.stop_requests.drain(..) {
            ran.stop(&name);
        }
        self.running.clear();
        let added = mem::replace(&mut self.crons, ran.crons);
        self.crons.extend(added);
    }

    /// Stop every job called `name`. Returns true if any matched.
    pub fn stop(&mut self, name: &str) -> bool {
        let mut found = false;
        for cron in self.crons.iter_mut().filter(|c| c.name() == name) {
            cron.stop();
            found = true;
        }
        if self.running.iter().any(|n| n == name) {
            self.stop_requests.push(name.to_string());
            found = true;
        }
        found
    }

    pub fn find(&self, name: &str) -> Option<&Cron<T>> {
        self.crons.iter().find(|c| c.name() == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Cron<T>> {
        self.crons.iter()
    }

    pub fn len(&self) -> usize {
        self.crons.len()
    }

    pub fn is_empty(&self) -> bool {
        self.crons.is_empty()
    }
}

impl<T> fmt::Debug for CronList<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.crons.iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Counter {
        hits: u32,
    }

    struct StopAfter {
        remaining: u32,
    }

    impl Job<Counter> for StopAfter {
        fn run_job(&mut self, target: &mut Counter) {
            target.hits += 1;
            self.remaining = self.remaining.saturating_sub(1);
        }

        fn keep_running(&self) -> bool {
            self.remaining > 0
        }
    }

    #[test]
    fn test_one_shot_fires_once_and_is_collected() {
        let mut counter = Counter::default();
        let mut list = CronList::new();
        let mut cron = Cron::new("once", |c: &mut Counter| c.hits += 1);
        cron.start_at(1_000, Duration::from_secs(5), true);
        list.add(cron);

        // Not yet due
        assert_eq!(list.run(&mut counter, 5_999), 0);
        assert_eq!(counter.hits, 0);

        // Due: fires and deactivates, still listed until the next pass
        assert_eq!(list.run(&mut counter, 6_000), 1);
        assert_eq!(counter.hits, 1);
        assert_eq!(list.len(), 1);
        assert!(!list.find("once").unwrap().is_active());

        // Next pass removes it without firing again
        assert_eq!(list.run(&mut counter, 60_000), 0);
        assert_eq!(counter.hits, 1);
        assert!(list.is_empty());
    }

    #[test]
    fn test_recurring_reschedules_from_fire_time() {
        let mut counter = Counter::default();
        let mut cron = Cron::new("tick", |c: &mut Counter| c.hits += 1);
        cron.start_at(0, Duration::from_millis(100), false);

        assert!(cron.run(&mut counter, 100));
        assert_eq!(cron.next_fire(), 200);
        assert!(!cron.run(&mut counter, 150));
        assert!(cron.run(&mut counter, 250));
        assert_eq!(cron.next_fire(), 350);
        assert_eq!(counter.hits, 2);
        assert!(cron.is_active());
    }

    #[test]
    fn test_recurring_runs_until_stopped() {
        let mut counter = Counter::default();
        let mut list = CronList::new();
        let mut cron = Cron::new("tick", |c: &mut Counter| c.hits += 1);
        cron.start_at(0, Duration::from_millis(10), false);
        list.add(cron);

        for step in 1..=50u64 {
            list.run(&mut counter, step * 10);
        }
        assert_eq!(counter.hits, 50);

        assert!(list.stop("tick"));
        list.run(&mut counter, 1_000);
        assert_eq!(counter.hits, 50);
        assert!(list.is_empty());
    }

    #[test]
    fn test_job_can_stop_itself() {
        let mut counter = Counter::default();
        let mut cron = Cron::new("limited", StopAfter { remaining: 2 });
        cron.start_at(0, Duration::from_millis(1), false);

        assert!(cron.run(&mut counter, 1));
        assert!(cron.is_active());
        assert!(cron.run(&mut counter, 2));
        assert!(!cron.is_active());
        assert!(!cron.run(&mut counter, 3));
        assert_eq!(counter.hits, 2);
    }

    #[test]
    fn test_unstarted_cron_is_due_immediately() {
        let mut counter = Counter::default();
        let mut cron = Cron::new("now", |c: &mut Counter| c.hits += 1);
        assert!(cron.run(&mut counter, 0));
        assert!(!cron.is_active());
    }

    #[test]
    fn test_restore_keeps_added_jobs_after_existing() {
        let mut list: CronList<Counter> = CronList::new();
        list.add(Cron::new("first", |_: &mut Counter| {}));
        let ran = list.take_for_run();
        assert!(list.is_empty());

        list.add(Cron::new("second", |_: &mut Counter| {}));
        list.restore(ran);
        let names: Vec<_> = list.iter().map(|c| c.name().to_string()).collect();
        assert_eq!(names, vec!["first", "second"]);
    }

    #[test]
    fn test_stop_while_taken_applies_on_restore() {
        let mut counter = Counter::default();
        let mut list = CronList::new();
        let mut cron = Cron::new("tick", |c: &mut Counter| c.hits += 1);
        cron.start_at(0, Duration::from_millis(10), false);
        list.add(cron);

        let mut ran = list.take_for_run();
        ran.run(&mut counter, 10);
        assert!(list.stop("tick"));
        assert!(!list.stop("missing"));
        list.restore(ran);

        assert!(!list.find("tick").unwrap().is_active());
        list.run(&mut counter, 1_000);
        assert_eq!(counter.hits, 1);
        assert!(list.is_empty());
    }
}
