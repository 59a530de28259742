/// The state of the step controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Only the grafting method is applied, no inverse root was computed yet.
    Warmup,
    /// The grafted shampoo direction is applied.
    Active,
}

/// When shampoo kicks in and how often its inverse roots are refreshed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Schedule {
    start: u64,
    frequency: u64,
}

impl Schedule {
    pub fn new(start: u64, frequency: u64) -> Self {
        Self {
            start,
            frequency: frequency.max(1),
        }
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn phase(&self, step: u64) -> Phase {
        if step < self.start {
            Phase::Warmup
        } else {
            Phase::Active
        }
    }

    /// Whether the inverse roots are recomputed at `step`.
    pub fn refreshes_roots(&self, step: u64) -> bool {
        step >= self.start && (step - self.start) % self.frequency == 0
    }
}
