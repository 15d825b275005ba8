//! Patience-based early stopping on a maximised metric.

/// What the training loop should do after an epoch's evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// New best; persist the weights.
    Improved,
    Continue,
    Stop,
}

/// Tracks the best accuracy and the number of consecutive epochs without
/// a strict improvement over it.
#[derive(Debug, Clone)]
pub struct EarlyStopping {
    patience: usize,
    best: f64,
    epochs_without_improvement: usize,
}

impl EarlyStopping {
    /// The best value starts at `0.0`, so an epoch scoring exactly zero never
    /// counts as an improvement.
    pub fn new(patience: usize) -> Self {
        Self { patience, best: 0.0, epochs_without_improvement: 0 }
    }

    pub fn observe(&mut self, metric: f64) -> Verdict {
        if metric > self.best {
            self.best = metric;
            self.epochs_without_improvement = 0;
            return Verdict::Improved;
        }
        self.epochs_without_improvement += 1;
        if self.epochs_without_improvement >= self.patience {
            Verdict::Stop
        } else {
            Verdict::Continue
        }
    }

    pub fn best(&self) -> f64 {
        self.best
    }

    pub fn epochs_without_improvement(&self) -> usize {
        self.epochs_without_improvement
    }
}
