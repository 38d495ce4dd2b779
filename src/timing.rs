//! Wall-clock timers for accelerator work, and the end-of-run diagnostic report.

use std::{
    fmt,
    time::{Duration, Instant},
};

/// A start/stop timer. The last interval is kept separately, and only counts toward the total
/// once `add_to_total` is called.
#[derive(Clone, Debug, Default)]
pub struct Timer {
    start: Option<Instant>,
    last: Duration,
    total: Duration,
}

impl Timer {
    pub fn start(&mut self) {
        self.start = Some(Instant::now());
    }

    pub fn stop(&mut self) {
        if let Some(start) = self.start.take() {
            self.last = start.elapsed();
        }
    }

    /// Seconds in the last start/stop interval.
    pub fn seconds(&self) -> f64 {
        self.last.as_secs_f64()
    }

    pub fn add_to_total(&mut self) {
        self.total += self.last;
        self.last = Duration::ZERO;
    }

    pub fn total_seconds(&self) -> f64 {
        self.total.as_secs_f64()
    }

    pub fn zero_total(&mut self) {
        self.total = Duration::ZERO;
    }
}

/// Per-process averages over the replica, as reported at the end of a run.
#[derive(Clone, Debug, PartialEq)]
pub struct TimingReport {
    /// Device-side lines are only meaningful when a process has its accelerator to itself.
    pub time_device: bool,
    pub gpu_nbor: bool,
    pub transfer: f64,
    pub cast: f64,
    pub nbor_copy: f64,
    pub nbor_build: f64,
    pub force: f64,
    pub overhead: f64,
    pub avg_split: f64,
    pub threads_per_atom: usize,
    pub max_mb: f64,
    pub driver: f64,
    pub idle: f64,
}

const RULE: &str = "---------------------------------------------------------------------------";

impl fmt::Display for TimingReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{RULE}")?;
        writeln!(f, "      Accelerator Time Info (average):")?;
        writeln!(f, "{RULE}")?;
        if self.time_device {
            writeln!(f, "Data Transfer:   {:.4} s.", self.transfer)?;
            writeln!(f, "Data Cast/Pack:  {:.4} s.", self.cast)?;
            writeln!(f, "Neighbor copy:   {:.4} s.", self.nbor_copy)?;
            if self.gpu_nbor {
                writeln!(f, "Neighbor build:  {:.4} s.", self.nbor_build)?;
            } else {
                writeln!(f, "Neighbor unpack: {:.4} s.", self.nbor_build)?;
            }
            writeln!(f, "Force calc:      {:.4} s.", self.force)?;
        }
        writeln!(f, "GPU Overhead:    {:.4} s.", self.overhead)?;
        writeln!(f, "Average split:   {:.4}.", self.avg_split)?;
        writeln!(f, "Threads / atom:  {}.", self.threads_per_atom)?;
        writeln!(f, "Max Mem / Proc:  {:.2} MB.", self.max_mb)?;
        writeln!(f, "CPU Driver_Time: {:.4} s.", self.driver)?;
        writeln!(f, "CPU Idle_Time:   {:.4} s.", self.idle)?;
        write!(f, "{RULE}")
    }
}
