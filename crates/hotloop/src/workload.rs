//! Busy-loop workload: fill a fixed buffer with ones, sum it, repeat.
//!
//! The loop exists only to give the profiler something to look at, so the
//! sum is passed through an optimisation barrier and dropped.

use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

/// Number of elements in the sample buffer
pub const BUFFER_LEN: usize = 10_000;

/// Value written to every element on each fill
pub const FILL_VALUE: i64 = 1;

/// Iterations between debug progress lines
const PROGRESS_INTERVAL: u64 = 100_000;

/// Fixed-length integer buffer, allocated once and never resized.
pub struct SampleBuffer {
    values: Box<[i64]>,
}

impl SampleBuffer {
    pub fn new() -> Self {
        Self {
            values: vec![0; BUFFER_LEN].into_boxed_slice(),
        }
    }

    /// Overwrite every element with [`FILL_VALUE`].
    #[inline(never)]
    pub fn fill(&mut self) {
        for value in self.values.iter_mut() {
            *value = FILL_VALUE;
        }
    }

    /// Arithmetic sum of all elements.
    #[inline(never)]
    pub fn sum(&self) -> i64 {
        let mut sum = 0i64;
        for &value in self.values.iter() {
            sum += value;
        }
        sum
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn as_slice(&self) -> &[i64] {
        &self.values
    }
}

impl Default for SampleBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Owns the sample buffer and drives the fill/sum loop.
pub struct Workload {
    buffer: SampleBuffer,
    iterations: u64,
}

impl Workload {
    pub fn new() -> Self {
        Self {
            buffer: SampleBuffer::new(),
            iterations: 0,
        }
    }

    /// One fill followed by one sum. Returns the sum.
    #[inline(never)]
    pub fn step(&mut self) -> i64 {
        self.buffer.fill();
        let sum = std::hint::black_box(self.buffer.sum());
        self.iterations += 1;
        sum
    }

    /// Run until `stop` is set. Returns the number of iterations completed
    /// by this call.
    pub fn run_until(&mut self, stop: &AtomicBool) -> u64 {
        let start = self.iterations;

        while !stop.load(Ordering::Relaxed) {
            self.step();

            if self.iterations.is_multiple_of(PROGRESS_INTERVAL) {
                debug!(iterations = self.iterations, "workload progress");
            }
        }

        self.iterations - start
    }

    pub fn iterations(&self) -> u64 {
        self.iterations
    }

    pub fn buffer(&self) -> &SampleBuffer {
        &self.buffer
    }
}

impl Default for Workload {
    fn default() -> Self {
        Self::new()
    }
}
