use clap::Parser;

use quiver_core::QuiverConfig;

/// Load generator for the quiver scheduler.
///
/// Drives every submission path (async, wait, deferred, group, timers)
/// and prints a JSON report of what happened.
#[derive(Parser, Debug)]
#[command(name = "quiver-bench", version, about = "Load generator for the quiver scheduler")]
pub struct BenchArgs {
    /// Fire-and-report tasks to submit; the other paths get a tenth each
    #[arg(long, env = "QUIVER_BENCH_TASKS", default_value_t = 1000)]
    pub tasks: usize,

    /// Simulated work per task, in milliseconds
    #[arg(long, env = "QUIVER_BENCH_TASK_MS", default_value_t = 5)]
    pub task_ms: u64,

    /// Every n-th task fails (0 disables failures)
    #[arg(long, default_value_t = 10)]
    pub fail_every: usize,

    /// Pending queue capacity (overrides QUIVER_QUEUE_SIZE)
    #[arg(long)]
    pub queue_size: Option<usize>,

    /// Concurrency cap (overrides QUIVER_MAX_CONCURRENT)
    #[arg(long)]
    pub max_concurrent: Option<usize>,

    /// Throttle for the group phase (unthrottled if not set)
    #[arg(long)]
    pub group_cap: Option<usize>,

    /// Pretty-print the JSON report
    #[arg(long)]
    pub pretty: bool,
}

impl BenchArgs {
    /// Environment config with command-line overrides applied.
    pub fn config(&self, base: QuiverConfig) -> QuiverConfig {
        let mut config = base;
        if let Some(queue_size) = self.queue_size {
            config = config.with_queue_size(queue_size);
        }
        if let Some(max_concurrent) = self.max_concurrent {
            config = config.with_max_concurrent(max_concurrent);
        }
        config
    }

    pub fn fails(&self, n: usize) -> bool {
        self.fail_every != 0 && n % self.fail_every == self.fail_every - 1
    }
}
