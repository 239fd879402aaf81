use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;

use quiver_core::QuiverError;

use super::*;
use crate::context::ObserverSlot;
use crate::task::{Payload, TaskCore};

type Log = Arc<Mutex<Vec<(&'static str, Instant)>>>;

fn once(log: &Log, label: &'static str, due: Instant) -> TimedTask {
    let log = Arc::clone(log);
    let core = TaskCore::new(
        Payload::once(move || async move {
            log.lock().unwrap().push((label, Instant::now()));
            anyhow::Ok(())
        }),
        ObserverSlot::default(),
    );
    TimedTask::once(core, due)
}

fn interval(log: &Log, first_due: Instant, period: Duration, work: Duration) -> TimedTask {
    let log = Arc::clone(log);
    let core = TaskCore::new(
        Payload::repeat(move || {
            let log = Arc::clone(&log);
            async move {
                log.lock().unwrap().push(("tick", Instant::now()));
                tokio::time::sleep(work).await;
                anyhow::Ok(())
            }
        }),
        ObserverSlot::default(),
    );
    TimedTask::interval(core, first_due, period)
}

fn ms(n: u64) -> Duration {
    Duration::from_millis(n)
}

#[tokio::test(start_paused = true)]
async fn fires_in_due_order() {
    let timers = TimerScheduler::start();
    let log: Log = Arc::default();
    let t0 = Instant::now();

    timers.insert(once(&log, "late", t0 + ms(50))).unwrap();
    timers.insert(once(&log, "early", t0 + ms(10))).unwrap();
    timers.insert(once(&log, "tie-1", t0 + ms(30))).unwrap();
    timers.insert(once(&log, "tie-2", t0 + ms(30))).unwrap();

    tokio::time::sleep(ms(100)).await;
    let log = log.lock().unwrap();
    let labels: Vec<_> = log.iter().map(|(label, _)| *label).collect();
    assert_eq!(labels, vec!["early", "tie-1", "tie-2", "late"]);
    assert_eq!(log[0].1, t0 + ms(10));
    assert_eq!(log[3].1, t0 + ms(50));
}

#[tokio::test(start_paused = true)]
async fn past_due_fires_immediately() {
    let timers = TimerScheduler::start();
    let log: Log = Arc::default();
    let t0 = Instant::now();
    tokio::time::advance(ms(5)).await;

    timers.insert(once(&log, "overdue", t0)).unwrap();
    tokio::time::sleep(ms(1)).await;
    assert_eq!(log.lock().unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn cancelled_timer_never_fires() {
    let timers = TimerScheduler::start();
    let log: Log = Arc::default();
    let task = once(&log, "never", Instant::now() + ms(20));
    let id = task.id();
    timers.insert(task).unwrap();

    assert!(timers.cancel(id).await);
    assert!(!timers.cancel(id).await);
    tokio::time::sleep(ms(50)).await;
    assert!(log.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn interval_does_not_drift() {
    let timers = TimerScheduler::start();
    let log: Log = Arc::default();
    let t0 = Instant::now();
    let task = interval(&log, t0 + ms(100), ms(100), ms(30));
    let id = task.id();
    timers.insert(task).unwrap();

    tokio::time::sleep(ms(450)).await;
    assert!(timers.cancel(id).await);

    let fired: Vec<_> = log.lock().unwrap().iter().map(|(_, at)| *at - t0).collect();
    assert_eq!(fired, vec![ms(100), ms(200), ms(300), ms(400)]);
}

#[tokio::test(start_paused = true)]
async fn cancel_during_firing_lets_it_finish_then_stops() {
    let timers = TimerScheduler::start();
    let log: Log = Arc::default();
    let t0 = Instant::now();
    let task = interval(&log, t0 + ms(10), ms(10), ms(5));
    let id = task.id();
    timers.insert(task).unwrap();

    // Inside the first firing's payload.
    tokio::time::sleep(ms(12)).await;
    assert_eq!(log.lock().unwrap().len(), 1);
    assert!(timers.cancel(id).await);

    tokio::time::sleep(ms(100)).await;
    assert_eq!(log.lock().unwrap().len(), 1);
    let stats = timers.stats().await.unwrap();
    assert_eq!(stats.live, 0);
    assert_eq!(stats.intervals, 0);
}

#[tokio::test(start_paused = true)]
async fn wakeups_are_shared_between_deadlines() {
    let timers = TimerScheduler::start();
    let log: Log = Arc::default();
    let t0 = Instant::now();
    timers.insert(once(&log, "a", t0 + ms(10))).unwrap();
    timers.insert(once(&log, "b", t0 + ms(20))).unwrap();
    timers.insert(once(&log, "c", t0 + ms(30))).unwrap();

    let stats = timers.stats().await.unwrap();
    assert_eq!(
        stats,
        TimerStats {
            live: 3,
            heap_entries: 3,
            intervals: 0,
            pending_wakeups: 1,
        }
    );

    tokio::time::sleep(ms(40)).await;
    assert_eq!(log.lock().unwrap().len(), 3);
    assert_eq!(timers.stats().await.unwrap(), TimerStats::default());
}

#[tokio::test(start_paused = true)]
async fn stop_drops_pending_timers() {
    let timers = TimerScheduler::start();
    let log: Log = Arc::default();
    timers.insert(once(&log, "dropped", Instant::now() + ms(10))).unwrap();

    assert!(timers.stop());
    assert!(!timers.stop());
    assert!(matches!(
        timers.insert(once(&log, "rejected", Instant::now())),
        Err(QuiverError::QueueClosed)
    ));

    tokio::time::sleep(ms(50)).await;
    assert!(log.lock().unwrap().is_empty());
    assert!(timers.stats().await.is_err());
}
