//! Step timing.

use std::time::{Duration, Instant};

/// Measures how long a provisioning step took.
pub struct Timer {
    step: String,
    start: Instant,
}

impl Timer {
    pub fn start(step: &str) -> Self {
        Self {
            step: step.to_string(),
            start: Instant::now(),
        }
    }

    /// Stop the timer, log the elapsed time and return it.
    pub fn finish(self) -> Duration {
        let elapsed = self.start.elapsed();
        log::info!("  [{}] {}", human(elapsed), self.step);
        elapsed
    }
}

/// Short human form: seconds below a minute, minutes above.
pub fn human(elapsed: Duration) -> String {
    let secs = elapsed.as_secs_f64();
    if secs >= 60.0 {
        format!("{:.1}m", secs / 60.0)
    } else {
        format!("{:.1}s", secs)
    }
}
