use serde::Serialize;

/// bytes sent so far out of the whole file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Progress {
    pub loaded: u64,
    pub total: u64,
}

impl Progress {
    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            return 100.0;
        }
        (self.loaded as f64 / self.total as f64 * 10_000.0).round() / 100.0
    }
}

pub trait ProgressListener: Send + Sync {
    fn on_progress(&self, progress: Progress);
}

impl<F> ProgressListener for F
where
    F: Fn(Progress) + Send + Sync,
{
    fn on_progress(&self, progress: Progress) {
        self(progress)
    }
}
