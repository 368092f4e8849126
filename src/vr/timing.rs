use std::collections::VecDeque;
use std::time::{Duration, Instant};

const FRAME_HISTORY_SIZE: usize = 180;  // two seconds at 90 Hz

#[derive(Debug, Clone, Copy)]
pub struct FrameTiming {
    pub predicted_display_time: f64,
    pub render_start: Instant,
    pub render_end: Option<Instant>,
    pub frame_index: u64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimingStats {
    pub average_frame_time_ms: f32,
    pub fps: f32,
    pub max_frame_time_ms: f32,
    pub min_frame_time_ms: f32,
    pub frames_over_budget: u32,
}

impl Default for TimingStats {
    fn default() -> Self {
        Self {
            average_frame_time_ms: 0.0,
            fps: 0.0,
            max_frame_time_ms: 0.0,
            min_frame_time_ms: f32::MAX,
            frames_over_budget: 0,
        }
    }
}

/// Rolling CPU frame timings, logged once per second.
pub struct FrameTimingManager {
    frame_history: VecDeque<FrameTiming>,
    current_frame: Option<FrameTiming>,
    last_stats_update: Instant,
    last_stats: TimingStats,
    frame_budget: Duration,
}

impl FrameTimingManager {
    pub fn new(target_fps: u32) -> Self {
        Self {
            frame_history: VecDeque::with_capacity(FRAME_HISTORY_SIZE),
            current_frame: None,
            last_stats_update: Instant::now(),
            last_stats: TimingStats::default(),
            frame_budget: Duration::from_secs_f32(1.0 / target_fps.max(1) as f32),
        }
    }

    pub fn begin_frame(&mut self, frame_index: u64, predicted_display_time: f64) {
        self.current_frame = Some(FrameTiming {
            predicted_display_time,
            render_start: Instant::now(),
            render_end: None,
            frame_index,
        });
    }

    pub fn end_frame(&mut self) {
        if let Some(mut frame) = self.current_frame.take() {
            frame.render_end = Some(Instant::now());

            if self.frame_history.len() >= FRAME_HISTORY_SIZE {
                self.frame_history.pop_front();
            }
            self.frame_history.push_back(frame);

            if self.last_stats_update.elapsed() >= Duration::from_secs(1) {
                self.update_stats();
                let interval_ms = self.predicted_frame_interval().unwrap_or(0.0) * 1000.0;
                let stats = &self.last_stats;
                log::debug!(
                    "frame {}: {:.2} ms avg, {:.1} fps, {} over budget, display interval {:.2} ms",
                    frame.frame_index,
                    stats.average_frame_time_ms,
                    stats.fps,
                    stats.frames_over_budget,
                    interval_ms
                );
            }
        }
    }

    pub fn stats(&self) -> &TimingStats {
        &self.last_stats
    }

    pub fn force_stats_update(&mut self) {
        self.update_stats();
    }

    fn update_stats(&mut self) {
        let frame_times: Vec<Duration> = self
            .frame_history
            .iter()
            .filter_map(|frame| frame.render_end.map(|end| end - frame.render_start))
            .collect();

        if let (Some(max), Some(min)) = (frame_times.iter().max(), frame_times.iter().min()) {
            let total: Duration = frame_times.iter().sum();
            let average = total / frame_times.len() as u32;
            let average_secs = average.as_secs_f32();

            self.last_stats = TimingStats {
                average_frame_time_ms: average_secs * 1000.0,
                fps: if average_secs > 0.0 { 1.0 / average_secs } else { 0.0 },
                max_frame_time_ms: max.as_secs_f32() * 1000.0,
                min_frame_time_ms: min.as_secs_f32() * 1000.0,
                frames_over_budget: frame_times
                    .iter()
                    .filter(|&&t| t > self.frame_budget)
                    .count() as u32,
            };
        }

        self.last_stats_update = Instant::now();
    }

    /// Seconds between the last two predicted display times, if known.
    pub fn predicted_frame_interval(&self) -> Option<f64> {
        let mut recent = self.frame_history.iter().rev();
        let last = recent.next()?;
        let previous = recent.next()?;
        Some(last.predicted_display_time - previous.predicted_display_time)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_frame_timing_basic() {
        let mut manager = FrameTimingManager::new(90);

        for i in 0..5 {
            manager.begin_frame(i, i as f64 / 90.0);
            thread::sleep(Duration::from_millis(2));
            manager.end_frame();
        }

        manager.force_stats_update();

        let stats = manager.stats();
        assert!(stats.fps > 0.0, "FPS should be greater than 0");
        assert!(stats.average_frame_time_ms >= 2.0, "Average frame time should include the sleep");
        assert!(stats.max_frame_time_ms >= stats.average_frame_time_ms);
        assert!(stats.min_frame_time_ms <= stats.average_frame_time_ms);
    }

    #[test]
    fn test_slow_frames_count_against_budget() {
        let mut manager = FrameTimingManager::new(1000);
        manager.begin_frame(0, 0.0);
        thread::sleep(Duration::from_millis(5));
        manager.end_frame();
        manager.force_stats_update();
        assert_eq!(manager.stats().frames_over_budget, 1);
    }

    #[test]
    fn test_predicted_interval() {
        let mut manager = FrameTimingManager::new(90);
        assert!(manager.predicted_frame_interval().is_none());
        manager.begin_frame(0, 1.0);
        manager.end_frame();
        manager.begin_frame(1, 1.5);
        manager.end_frame();
        let interval = manager.predicted_frame_interval().unwrap();
        assert!((interval - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_end_without_begin_is_ignored() {
        let mut manager = FrameTimingManager::new(90);
        manager.end_frame();
        manager.force_stats_update();
        assert_eq!(manager.stats(), &TimingStats::default());
    }
}
