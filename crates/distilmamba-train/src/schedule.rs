//! Learning-rate schedule.

use std::f64::consts::PI;

/// Linear warm-up from zero followed by a half-cosine decay to zero.
///
/// [`factor`](Self::factor) is the multiplier for the *next* optimiser step;
/// call [`step`](Self::step) after every optimiser step. The factor at step 0
/// is 0, so the very first update runs at a learning rate of zero.
#[derive(Debug, Clone)]
pub struct CosineWithWarmup {
    warmup_steps: usize,
    total_steps: usize,
    current: usize,
}

impl CosineWithWarmup {
    pub fn new(warmup_steps: usize, total_steps: usize) -> Self {
        Self { warmup_steps, total_steps, current: 0 }
    }

    /// Warm-up over the first tenth of `total_steps`.
    pub fn with_warmup_ratio(total_steps: usize) -> Self {
        Self::new(total_steps / 10, total_steps)
    }

    pub fn warmup_steps(&self) -> usize {
        self.warmup_steps
    }

    pub fn total_steps(&self) -> usize {
        self.total_steps
    }

    pub fn current_step(&self) -> usize {
        self.current
    }

    pub fn factor(&self) -> f64 {
        self.factor_at(self.current)
    }

    pub fn factor_at(&self, step: usize) -> f64 {
        if step < self.warmup_steps {
            return step as f64 / self.warmup_steps.max(1) as f64;
        }
        let decay_steps = self.total_steps.saturating_sub(self.warmup_steps).max(1);
        let progress = (step - self.warmup_steps) as f64 / decay_steps as f64;
        (0.5 * (1.0 + (PI * progress).cos())).max(0.0)
    }

    pub fn step(&mut self) {
        self.current += 1;
    }
}
