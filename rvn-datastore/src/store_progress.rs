/// Tracker for progress of operations iterating over repository contents.
#[derive(Debug, Default)]
pub struct StoreProgress {
    /// Completed items
    pub done: u64,
    /// Total items
    pub total: u64,
}

impl StoreProgress {
    pub fn new(total: u64) -> Self {
        StoreProgress {
            total,
            ..Default::default()
        }
    }

    /// Relative progress based on current counters.
    pub fn percentage(&self) -> f64 {
        if self.total == 0 {
            1.0
        } else {
            (self.done as f64) / (self.total as f64)
        }
    }
}

impl std::fmt::Display for StoreProgress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:.2}% ({}/{})",
            self.percentage() * 100.0,
            self.done,
            self.total,
        )
    }
}
