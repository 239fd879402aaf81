use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;

use quiver_core::{QuiverConfig, QuiverError};

use super::*;
use crate::context::ObserverSlot;
use crate::task::{HandoffTask, Payload, ReportTask, TaskCore};

fn job<F, Fut>(f: F) -> Box<dyn Task>
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    let core = TaskCore::new(Payload::once(f), ObserverSlot::default());
    Box::new(ReportTask::new(core, None))
}

/// Task that holds its slot until `gate` fires.
fn gated(gate: oneshot::Receiver<()>) -> Box<dyn Task> {
    job(move || async move {
        let _ = gate.await;
        anyhow::Ok(())
    })
}

/// Let every runnable task make progress.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

fn config(queue_size: usize, max_concurrent: usize) -> QuiverConfig {
    QuiverConfig::default()
        .with_queue_size(queue_size)
        .with_max_concurrent(max_concurrent)
}

#[tokio::test(start_paused = true)]
async fn running_never_exceeds_cap() {
    let queue = DispatchQueue::start(config(16, 2));
    let live = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let done = Arc::new(AtomicUsize::new(0));

    for _ in 0..6 {
        let (live, peak, done) = (Arc::clone(&live), Arc::clone(&peak), Arc::clone(&done));
        let task = job(move || async move {
            let now = live.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            live.fetch_sub(1, Ordering::SeqCst);
            done.fetch_add(1, Ordering::SeqCst);
            anyhow::Ok(())
        });
        assert!(queue.submit(task).await);
    }

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(done.load(Ordering::SeqCst), 6);
    assert_eq!(peak.load(Ordering::SeqCst), 2);
    assert_eq!(queue.stats().running, 0);
}

#[tokio::test(start_paused = true)]
async fn full_queue_suspends_submitter() {
    let queue = DispatchQueue::start(config(1, 1));
    let (open_a, gate_a) = oneshot::channel();

    assert!(queue.submit(gated(gate_a)).await);
    settle().await;
    assert_eq!(queue.stats().running, 1);

    // Taken off the channel by the loop, which now waits for a slot.
    assert!(queue.submit(job(|| async { anyhow::Ok(()) })).await);
    settle().await;
    // Fills the single pending position.
    assert!(queue.submit(job(|| async { anyhow::Ok(()) })).await);
    assert!(queue.is_full());

    let blocked = {
        let queue = queue.clone();
        tokio::spawn(async move { queue.submit(job(|| async { anyhow::Ok(()) })).await })
    };
    settle().await;
    assert_eq!(
        queue.stats(),
        QueueStats {
            pending: 1,
            overflow: 1,
            running: 1
        }
    );

    open_a.send(()).unwrap();
    assert!(blocked.await.unwrap());
    settle().await;
    assert_eq!(queue.stats().overflow, 0);
    assert!(queue.is_empty());
}

#[tokio::test(start_paused = true)]
async fn tasks_start_in_submission_order() {
    let queue = DispatchQueue::start(config(16, 1));
    let order = Arc::new(std::sync::Mutex::new(Vec::new()));

    for i in 0..5 {
        let order = Arc::clone(&order);
        assert!(
            queue
                .submit(job(move || async move {
                    order.lock().unwrap().push(i);
                    anyhow::Ok(())
                }))
                .await
        );
    }

    settle().await;
    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
}

#[tokio::test(start_paused = true)]
async fn stop_rejects_new_work_and_abandons_pending() {
    let queue = DispatchQueue::start(config(4, 1));
    let (open_a, gate_a) = oneshot::channel();
    assert!(queue.submit(gated(gate_a)).await);
    settle().await;

    let core = TaskCore::new(Payload::once(|| async { anyhow::Ok(1u8) }), ObserverSlot::default());
    let (waiting, mut rx) = HandoffTask::channel(core);
    assert!(queue.submit(Box::new(waiting)).await);
    settle().await;

    assert!(queue.stop());
    assert!(!queue.stop());
    assert!(queue.is_stopped());
    assert!(!queue.submit(job(|| async { anyhow::Ok(()) })).await);

    settle().await;
    assert!(matches!(
        crate::task::await_outcome(&mut rx, Some(Duration::from_millis(5))).await,
        Err(QuiverError::QueueClosed)
    ));

    // The running task is not interrupted.
    open_a.send(()).unwrap();
    settle().await;
    assert_eq!(queue.stats().running, 0);
}
