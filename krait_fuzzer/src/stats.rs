//! Run statistics and the periodic progress line.

use std::time::Instant;

#[derive(Debug)]
pub struct Stats {
    pub executions: u64,
    pub crashes: u64,
    executions_in_window: u64,
    window_start: Instant,
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

impl Stats {
    pub fn new() -> Self {
        Self {
            executions: 0,
            crashes: 0,
            executions_in_window: 0,
            window_start: Instant::now(),
        }
    }

    pub fn add_executions(&mut self, n: u64) {
        self.executions += n;
        self.executions_in_window += n;
    }

    pub fn inc_crashes(&mut self) {
        self.crashes += 1;
    }

    /// Emits one progress line and starts a new sampling window.
    pub fn report(&mut self, edges: usize, corpus: usize) {
        let elapsed = self.window_start.elapsed().as_secs_f64();
        let rate = if elapsed > 0.0 {
            (self.executions_in_window as f64 / elapsed) as u64
        } else {
            0
        };
        log::info!(
            "#{} cov: {} corp: {} exec/s: {} crashes: {}",
            self.executions,
            edges,
            corpus,
            rate,
            self.crashes
        );
        self.executions_in_window = 0;
        self.window_start = Instant::now();
    }
}
