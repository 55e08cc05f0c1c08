//! Frame rate and frame time statistics

use std::time::{Duration, Instant};

/// Frames per second over a reporting window, plus the slowest frame in it
pub struct FpsCounter {
    last_report: Instant,
    frame_count: u32,
    current_fps: f64,
    /// Longest paint of the current window
    max_frame_time: Duration,
    report_interval: Duration,
}

/// One measurement, available once per interval
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameStats {
    pub fps: f64,
    pub max_frame_time: Duration,
}

impl FpsCounter {
    pub fn new() -> Self {
        Self::with_interval(Duration::from_secs(1))
    }

    pub fn with_interval(report_interval: Duration) -> Self {
        Self {
            last_report: Instant::now(),
            frame_count: 0,
            current_fps: 0.0,
            max_frame_time: Duration::ZERO,
            report_interval,
        }
    }

    /// Call after each painted frame with the time it took. Returns the
    /// statistics when a reporting interval has passed.
    pub fn tick(&mut self, frame_time: Duration) -> Option<FrameStats> {
        self.frame_count += 1;
        self.max_frame_time = self.max_frame_time.max(frame_time);

        let elapsed = self.last_report.elapsed();
        if elapsed < self.report_interval {
            return None;
        }
        self.current_fps = self.frame_count as f64 / elapsed.as_secs_f64();
        let stats = FrameStats {
            fps: self.current_fps,
            max_frame_time: self.max_frame_time,
        };
        self.frame_count = 0;
        self.max_frame_time = Duration::ZERO;
        self.last_report = Instant::now();
        Some(stats)
    }

    /// Last calculated frame rate
    pub fn fps(&self) -> f64 {
        self.current_fps
    }
}

impl Default for FpsCounter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reports_after_interval() {
        let mut counter = FpsCounter::with_interval(Duration::ZERO);
        let stats = counter.tick(Duration::from_millis(3)).unwrap();
        assert!(stats.fps > 0.0);
        assert_eq!(stats.max_frame_time, Duration::from_millis(3));
        assert_eq!(counter.fps(), stats.fps);
    }

    #[test]
    fn test_quiet_within_interval() {
        let mut counter = FpsCounter::with_interval(Duration::from_secs(3600));
        assert!(counter.tick(Duration::from_millis(1)).is_none());
        assert!(counter.tick(Duration::from_millis(1)).is_none());
        assert_eq!(counter.fps(), 0.0);
    }
}
