use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info};

use quiver_scheduler::{
    FinishCallback, Quiver, QueueStats, QuiverConfig, QuiverError, TimerStats,
};

use crate::cli::BenchArgs;

#[derive(Debug, Default, Serialize)]
pub struct PhaseReport {
    pub submitted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub elapsed_ms: u64,
}

#[derive(Debug, Serialize)]
pub struct BenchReport {
    pub config: QuiverConfig,
    pub async_tasks: PhaseReport,
    pub waited: PhaseReport,
    pub deferred: PhaseReport,
    pub group: PhaseReport,
    pub interval_ticks: usize,
    pub observed: usize,
    pub queue_after_submit: QueueStats,
    pub queue_final: QueueStats,
    pub timers: TimerStats,
    pub total_ms: u64,
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Simulated unit of work: sleeps, then fails on schedule.
async fn work(n: usize, task_ms: u64, fail: bool) -> Result<usize> {
    tokio::time::sleep(Duration::from_millis(task_ms)).await;
    if fail {
        anyhow::bail!("task {n} failed on schedule");
    }
    Ok(n)
}

pub async fn run(quiver: &Quiver, args: &BenchArgs) -> Result<BenchReport> {
    let started = Instant::now();
    let observed = Arc::new(AtomicUsize::new(0));
    {
        let observed = Arc::clone(&observed);
        quiver.set_finish_observer(move |_, _, _| {
            observed.fetch_add(1, Ordering::Relaxed);
        });
    }

    let ticks = Arc::new(AtomicUsize::new(0));
    let interval = {
        let ticks = Arc::clone(&ticks);
        quiver.schedule_interval(
            Duration::from_millis(args.task_ms.max(1) * 10),
            move || {
                let ticks = Arc::clone(&ticks);
                async move {
                    ticks.fetch_add(1, Ordering::Relaxed);
                    anyhow::Ok(())
                }
            },
            None,
        )?
    };

    let (async_tasks, queue_after_submit) = async_phase(quiver, args).await?;
    let waited = waited_phase(quiver, args).await?;
    let deferred = deferred_phase(quiver, args).await?;
    let group = group_phase(quiver, args).await?;

    quiver.cancel_timed(interval).await;
    let timers = quiver.timer_stats().await?;
    let queue_final = quiver.stats();
    quiver.clear_finish_observer();

    Ok(BenchReport {
        config: quiver.config(),
        async_tasks,
        waited,
        deferred,
        group,
        interval_ticks: ticks.load(Ordering::Relaxed),
        observed: observed.load(Ordering::Relaxed),
        queue_after_submit,
        queue_final,
        timers,
        total_ms: elapsed_ms(started),
    })
}

async fn async_phase(quiver: &Quiver, args: &BenchArgs) -> Result<(PhaseReport, QueueStats)> {
    let started = Instant::now();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut report = PhaseReport::default();

    for n in 0..args.tasks {
        let tx = tx.clone();
        let on_finish: FinishCallback<usize> = Box::new(move |_, outcome| {
            let _ = tx.send(outcome.is_ok());
        });
        let (task_ms, fail) = (args.task_ms, args.fails(n));
        quiver
            .submit_async(move || work(n, task_ms, fail), Some(on_finish))
            .await
            .context("async submission refused")?;
        report.submitted += 1;
    }
    drop(tx);
    let after_submit = quiver.stats();
    debug!(?after_submit, "async phase submitted");

    while let Some(ok) = rx.recv().await {
        if ok {
            report.succeeded += 1;
        } else {
            report.failed += 1;
        }
    }
    report.elapsed_ms = elapsed_ms(started);
    info!(succeeded = report.succeeded, failed = report.failed, "async phase done");
    Ok((report, after_submit))
}

async fn waited_phase(quiver: &Quiver, args: &BenchArgs) -> Result<PhaseReport> {
    let started = Instant::now();
    let mut report = PhaseReport::default();
    let budget = Duration::from_millis(args.task_ms * 20 + 100);

    for n in 0..args.tasks / 10 {
        let (task_ms, fail) = (args.task_ms, args.fails(n));
        report.submitted += 1;
        match quiver.submit_and_wait(move || work(n, task_ms, fail), Some(budget)).await {
            Ok(_) => report.succeeded += 1,
            Err(QuiverError::Task(_) | QuiverError::Timeout(_)) => report.failed += 1,
            Err(e) => return Err(e).context("wait submission refused"),
        }
    }
    report.elapsed_ms = elapsed_ms(started);
    Ok(report)
}

async fn deferred_phase(quiver: &Quiver, args: &BenchArgs) -> Result<PhaseReport> {
    let started = Instant::now();
    let mut report = PhaseReport::default();
    let mut handles = Vec::with_capacity(args.tasks / 10);

    for n in 0..args.tasks / 10 {
        let (task_ms, fail) = (args.task_ms, args.fails(n));
        handles.push(quiver.submit_deferred(move || work(n, task_ms, fail)).await?);
        report.submitted += 1;
    }
    for handle in &mut handles {
        match handle.receive(None).await {
            Ok(_) => report.succeeded += 1,
            Err(QuiverError::Task(_)) => report.failed += 1,
            Err(e) => return Err(e).context("deferred outcome lost"),
        }
    }
    report.elapsed_ms = elapsed_ms(started);
    Ok(report)
}

async fn group_phase(quiver: &Quiver, args: &BenchArgs) -> Result<PhaseReport> {
    let started = Instant::now();
    let group = quiver.new_group::<usize>(args.group_cap);

    for n in 0..args.tasks / 10 {
        let (task_ms, fail) = (args.task_ms, args.fails(n));
        group.add(move || work(n, task_ms, fail)).await?;
    }
    let results = group.wait_for_all(None).await?;

    let report = PhaseReport {
        submitted: group.len(),
        succeeded: results.len(),
        failed: group.errors().len(),
        elapsed_ms: elapsed_ms(started),
    };
    info!(group_id = %group.id(), cap = ?args.group_cap, succeeded = report.succeeded, "group phase done");
    Ok(report)
}
