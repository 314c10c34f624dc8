// Frame statistics
use std::time::{Duration, Instant};

/// Frames-per-second counter reporting at a fixed interval
pub struct FpsCounter {
    /// Start of the current measurement window
    last_report: Instant,
    /// Frames since last report
    frame_count: u32,
    report_interval: Duration,
}

impl FpsCounter {
    pub fn new(report_interval: Duration) -> Self {
        Self {
            last_report: Instant::now(),
            frame_count: 0,
            report_interval,
        }
    }

    /// Call this after each painted frame
    /// Returns Some(fps) when a measurement window just closed
    pub fn tick(&mut self) -> Option<f64> {
        self.tick_at(Instant::now())
    }

    fn tick_at(&mut self, now: Instant) -> Option<f64> {
        self.frame_count += 1;

        let elapsed = now.saturating_duration_since(self.last_report);
        if elapsed < self.report_interval {
            return None;
        }

        let fps = self.frame_count as f64 / elapsed.as_secs_f64();
        self.frame_count = 0;
        self.last_report = now;
        Some(fps)
    }
}

impl Default for FpsCounter {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}
