//! Event-loop port.
//!
//! Each tab runs its timers and deferred work on one logical loop. Listeners
//! that fire on another tab's thread never run protocol logic inline; they
//! `defer` it onto the owning tab's loop.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use crate::clock::ManualClock;
use crate::error::Result;

pub type Job = Box<dyn FnMut() + Send + 'static>;
pub type Deferred = Box<dyn FnOnce() + Send + 'static>;

pub trait Scheduler: Send + Sync {
    /// Run `job` every `period` until the returned handle is cancelled or dropped.
    fn every(&self, period: Duration, job: Job) -> TaskHandle;

    /// Run `job` once, as soon as the loop is free.
    fn defer(&self, job: Deferred);
}

/// Cancel handle for a repeating task. Dropping it cancels the task.
#[derive(Debug)]
pub struct TaskHandle {
    cancelled: Arc<AtomicBool>,
}

impl TaskHandle {
    fn new() -> (Self, Arc<AtomicBool>) {
        let cancelled = Arc::new(AtomicBool::new(false));
        (
            Self {
                cancelled: cancelled.clone(),
            },
            cancelled,
        )
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

impl Drop for TaskHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

fn clamp_period(period: Duration) -> Duration {
    period.max(Duration::from_millis(1))
}

// ---------------------------------------------------------------------------
// ThreadScheduler
// ---------------------------------------------------------------------------

enum Command {
    Every {
        period: Duration,
        job: Job,
        cancelled: Arc<AtomicBool>,
    },
    Defer(Deferred),
}

struct Timer {
    due: Instant,
    period: Duration,
    job: Job,
    cancelled: Arc<AtomicBool>,
}

/// One worker thread per scheduler; timers and deferred jobs run serially on it.
///
/// The worker exits once the scheduler is dropped.
pub struct ThreadScheduler {
    tx: Sender<Command>,
}

impl ThreadScheduler {
    pub fn spawn(name: &str) -> Result<Arc<Self>> {
        let (tx, rx) = mpsc::channel();
        thread::Builder::new()
            .name(name.to_string())
            .spawn(move || run_loop(rx))?;
        Ok(Arc::new(Self { tx }))
    }
}

impl Scheduler for ThreadScheduler {
    fn every(&self, period: Duration, job: Job) -> TaskHandle {
        let (handle, cancelled) = TaskHandle::new();
        let command = Command::Every {
            period: clamp_period(period),
            job,
            cancelled,
        };
        if self.tx.send(command).is_err() {
            handle.cancel();
        }
        handle
    }

    fn defer(&self, job: Deferred) {
        let _ = self.tx.send(Command::Defer(job));
    }
}

fn run_loop(rx: Receiver<Command>) {
    let mut timers: Vec<Timer> = Vec::new();
    loop {
        timers.retain(|t| !t.cancelled.load(Ordering::SeqCst));
        let received = match timers.iter().map(|t| t.due).min() {
            Some(due) => {
                let now = Instant::now();
                if due <= now {
                    Err(RecvTimeoutError::Timeout)
                } else {
                    rx.recv_timeout(due - now)
                }
            }
            None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };

        match received {
            Ok(Command::Every {
                period,
                job,
                cancelled,
            }) => match Instant::now().checked_add(period) {
                Some(due) => timers.push(Timer {
                    due,
                    period,
                    job,
                    cancelled,
                }),
                None => log::warn!("timer period {period:?} out of range, not armed"),
            },
            Ok(Command::Defer(job)) => job(),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }

        let now = Instant::now();
        for timer in timers.iter_mut() {
            if timer.due > now || timer.cancelled.load(Ordering::SeqCst) {
                continue;
            }
            (timer.job)();
            timer.due += timer.period;
            // A slow job must not trigger a burst of catch-up runs.
            if timer.due <= now {
                timer.due = now + timer.period;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// ManualScheduler
// ---------------------------------------------------------------------------

struct ManualTimer {
    id: u64,
    due: i64,
    period: i64,
    job: Option<Job>,
    cancelled: Arc<AtomicBool>,
}

#[derive(Default)]
struct ManualState {
    timers: Vec<ManualTimer>,
    deferred: VecDeque<Deferred>,
    next_id: u64,
}

/// Deterministic scheduler driven by [`ManualScheduler::advance`].
///
/// Several tabs may share one instance; their work then interleaves in
/// due-time order (ties by registration order), which is what multi-tab
/// tests rely on.
pub struct ManualScheduler {
    clock: ManualClock,
    state: Mutex<ManualState>,
}

impl ManualScheduler {
    pub fn new(clock: ManualClock) -> Arc<Self> {
        Arc::new(Self {
            clock,
            state: Mutex::new(ManualState::default()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, ManualState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run deferred jobs (including ones they enqueue) without moving time.
    pub fn run_pending(&self) -> usize {
        let mut ran = 0;
        loop {
            let next = self.lock().deferred.pop_front();
            match next {
                Some(job) => {
                    job();
                    ran += 1;
                }
                None => return ran,
            }
        }
    }

    /// Move time forward, firing every timer that falls due on the way.
    pub fn advance(&self, by: Duration) {
        let target = self.clock.millis() + by.as_millis() as i64;
        loop {
            self.run_pending();
            let next = {
                let mut state = self.lock();
                state.timers.retain(|t| !t.cancelled.load(Ordering::SeqCst));
                let candidate = state
                    .timers
                    .iter()
                    .filter(|t| t.job.is_some() && t.due <= target)
                    .min_by_key(|t| (t.due, t.id))
                    .map(|t| t.id);
                candidate.and_then(|id| {
                    let timer = state.timers.iter_mut().find(|t| t.id == id)?;
                    Some((id, timer.due, timer.job.take()?))
                })
            };
            let Some((id, due, mut job)) = next else {
                break;
            };
            if due > self.clock.millis() {
                self.clock.set_millis(due);
            }
            job();
            let mut state = self.lock();
            if let Some(timer) = state.timers.iter_mut().find(|t| t.id == id) {
                timer.job = Some(job);
                timer.due = due + timer.period;
            }
        }
        if target > self.clock.millis() {
            self.clock.set_millis(target);
        }
        self.run_pending();
    }

    /// Number of repeating tasks that are still scheduled.
    pub fn live_timers(&self) -> usize {
        self.lock()
            .timers
            .iter()
            .filter(|t| !t.cancelled.load(Ordering::SeqCst))
            .count()
    }
}

impl Scheduler for ManualScheduler {
    fn every(&self, period: Duration, job: Job) -> TaskHandle {
        let (handle, cancelled) = TaskHandle::new();
        let period = clamp_period(period).as_millis() as i64;
        let now = self.clock.millis();
        let mut state = self.lock();
        let id = state.next_id;
        state.next_id += 1;
        state.timers.push(ManualTimer {
            id,
            due: now + period,
            period,
            job: Some(job),
            cancelled,
        });
        handle
    }

    fn defer(&self, job: Deferred) {
        self.lock().deferred.push_back(job);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter() -> (Arc<AtomicUsize>, Job) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        (
            count,
            Box::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            }),
        )
    }

    #[test]
    fn manual_timer_fires_per_period() {
        let sched = ManualScheduler::new(ManualClock::fixed());
        let (count, job) = counter();
        let _handle = sched.every(Duration::from_millis(100), job);

        sched.advance(Duration::from_millis(99));
        assert_eq!(count.load(Ordering::SeqCst), 0);
        sched.advance(Duration::from_millis(1));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        sched.advance(Duration::from_millis(350));
        assert_eq!(count.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn dropping_handle_cancels() {
        let sched = ManualScheduler::new(ManualClock::fixed());
        let (count, job) = counter();
        let handle = sched.every(Duration::from_millis(10), job);
        assert_eq!(sched.live_timers(), 1);
        drop(handle);
        sched.advance(Duration::from_millis(100));
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(sched.live_timers(), 0);
    }

    #[test]
    fn deferred_jobs_run_before_timers() {
        let sched = ManualScheduler::new(ManualClock::fixed());
        let order = Arc::new(Mutex::new(Vec::new()));
        let o = order.clone();
        let _handle = sched.every(
            Duration::from_millis(5),
            Box::new(move || o.lock().unwrap().push("tick")),
        );
        let o = order.clone();
        sched.defer(Box::new(move || o.lock().unwrap().push("deferred")));
        sched.advance(Duration::from_millis(5));
        assert_eq!(*order.lock().unwrap(), vec!["deferred", "tick"]);
    }

    #[test]
    fn clock_lands_on_timer_due_time() {
        let clock = ManualClock::fixed();
        let start = clock.millis();
        let sched = ManualScheduler::new(clock.clone());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let c = clock.clone();
        let _handle = sched.every(
            Duration::from_millis(30),
            Box::new(move || s.lock().unwrap().push(c.millis() - start)),
        );
        sched.advance(Duration::from_millis(100));
        assert_eq!(*seen.lock().unwrap(), vec![30, 60, 90]);
        assert_eq!(clock.millis() - start, 100);
    }

    #[test]
    fn thread_scheduler_runs_and_stops() {
        let sched = ThreadScheduler::spawn("solotab-test").unwrap();
        let (count, job) = counter();
        let handle = sched.every(Duration::from_millis(5), job);
        thread::sleep(Duration::from_millis(60));
        handle.cancel();
        let seen = count.load(Ordering::SeqCst);
        assert!(seen >= 2, "expected several ticks, saw {seen}");
        thread::sleep(Duration::from_millis(30));
        assert!(count.load(Ordering::SeqCst) <= seen + 1);
    }

    #[test]
    fn thread_scheduler_runs_deferred_job() {
        let sched = ThreadScheduler::spawn("solotab-test").unwrap();
        let (tx, rx) = mpsc::channel();
        sched.defer(Box::new(move || {
            let _ = tx.send(7);
        }));
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 7);
    }
}
