use anyhow::{Context, Result};
use std::{
    collections::VecDeque,
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

/// Throughput statistics with *all-time* totals and a *sliding window* rate.
/// Units are whatever the caller records (samples, bytes).
#[derive(Debug, Clone)]
pub struct Counter {
    /// All-time total units
    pub total: u64,
    /// All-time number of records
    pub n_records: u64,
    /// Time when this counter was created or last reset
    pub t_begin: Instant,

    window: Duration,
    recent: VecDeque<(Instant, u64)>,
    in_window: u64,
}

impl Default for Counter {
    fn default() -> Self {
        Counter::with_window(Duration::from_secs(1))
    }
}

impl Counter {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn with_window(window: Duration) -> Self {
        Counter {
            total: 0,
            n_records: 0,
            t_begin: Instant::now(),
            window,
            recent: VecDeque::new(),
            in_window: 0,
        }
    }

    /// Units per second since `t_begin`.
    pub fn average_rate(&self) -> f64 {
        let secs = self.t_begin.elapsed().as_secs_f64().max(1e-6);
        self.total as f64 / secs
    }

    /// Units per second over the sliding window.
    pub fn rate(&self) -> f64 {
        // young counters have not filled a whole window yet
        let span = self.window.min(self.t_begin.elapsed()).as_secs_f64().max(1e-3);
        self.in_window as f64 / span
    }

    /// Sliding window rate scaled to MB/s, `unit_bytes` being the size of one unit.
    pub fn mb_per_sec(&self, unit_bytes: usize) -> f64 {
        self.rate() * unit_bytes as f64 / (1024.0 * 1024.0)
    }

    pub fn increment(&mut self, n: u64) {
        let now = Instant::now();
        self.total += n;
        self.n_records += 1;
        self.recent.push_back((now, n));
        self.in_window += n;
        self.evict(now);
    }

    /// Drops window entries that have aged out without recording anything.
    pub fn tick(&mut self) {
        self.evict(Instant::now());
    }

    fn evict(&mut self, now: Instant) {
        while let Some(&(ts, n)) = self.recent.front() {
            if now.duration_since(ts) > self.window {
                self.recent.pop_front();
                self.in_window -= n;
            } else {
                break;
            }
        }
    }

    pub fn reset(&mut self) {
        self.total = 0;
        self.n_records = 0;
        self.t_begin = Instant::now();
        self.recent.clear();
        self.in_window = 0;
    }
}

/// Picks `<dir>/<name>.<ext>`, or `<dir>/<name>_<n>.<ext>` with the lowest
/// `n` not already taken. Creates `dir` if needed.
pub fn next_run_path(dir: &Path, name: &str, ext: &str) -> Result<PathBuf> {
    if !dir.exists() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("creating output directory {}", dir.display()))?;
    }
    let first = dir.join(format!("{name}.{ext}"));
    if !first.exists() {
        return Ok(first);
    }
    let mut n = 1;
    loop {
        let candidate = dir.join(format!("{name}_{n}.{ext}"));
        if !candidate.exists() {
            return Ok(candidate);
        }
        n += 1;
    }
}
