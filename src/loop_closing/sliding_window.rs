//! Translation-driven sliding window over the local frame history.

use nalgebra::Vector3;

use crate::geometry::SE3;

/// Tracks the first frame of the active window.
///
/// Path length is accumulated between consecutive poses. Once it exceeds
/// the threshold the window restarts at the current frame.
#[derive(Debug, Clone)]
pub struct SlidingWindow {
    translation_threshold: f64,
    window_start: u32,
    anchor: Option<Vector3<f64>>,
    last_position: Option<Vector3<f64>>,
    travelled: f64,
}

impl SlidingWindow {
    pub fn new(translation_threshold: f64) -> Self {
        Self {
            translation_threshold,
            window_start: 0,
            anchor: None,
            last_position: None,
            travelled: 0.0,
        }
    }

    pub fn update(&mut self, frame_id: u32, pose: &SE3) {
        let position = pose.translation;
        match self.last_position {
            Some(last) => self.travelled += (position - last).norm(),
            None => self.anchor = Some(position),
        }
        self.last_position = Some(position);

        if self.travelled > self.translation_threshold {
            self.window_start = self.window_start.max(frame_id);
            self.anchor = Some(position);
            self.travelled = 0.0;
        }
    }

    pub fn window_start_frame(&self) -> u32 {
        self.window_start
    }

    /// Position the current window started from.
    pub fn anchor(&self) -> Option<Vector3<f64>> {
        self.anchor
    }

    /// Path length accumulated since the anchor.
    pub fn travelled(&self) -> f64 {
        self.travelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn pose_at(x: f64) -> SE3 {
        let mut pose = SE3::identity();
        pose.translation = Vector3::new(x, 0.0, 0.0);
        pose
    }

    #[test]
    fn test_window_advances_when_threshold_exceeded() {
        let mut window = SlidingWindow::new(1.0);
        window.update(0, &pose_at(0.0));
        window.update(1, &pose_at(0.6));
        assert_eq!(window.window_start_frame(), 0);

        window.update(2, &pose_at(1.2));
        assert_eq!(window.window_start_frame(), 2);
        assert_relative_eq!(window.travelled(), 0.0);
        assert_relative_eq!(window.anchor().unwrap().x, 1.2);
    }

    #[test]
    fn test_back_and_forth_motion_accumulates() {
        let mut window = SlidingWindow::new(1.0);
        for (frame, x) in [0.0, 0.4, 0.0, 0.4].into_iter().enumerate() {
            window.update(frame as u32, &pose_at(x));
        }
        assert_eq!(window.window_start_frame(), 3);
    }

    #[test]
    fn test_window_start_never_regresses() {
        let mut window = SlidingWindow::new(0.5);
        window.update(10, &pose_at(0.0));
        window.update(20, &pose_at(1.0));
        assert_eq!(window.window_start_frame(), 20);

        // Out-of-order frame ids do not move the window back.
        window.update(5, &pose_at(2.0));
        assert_eq!(window.window_start_frame(), 20);

        let mut previous = window.window_start_frame();
        for frame in 21..60 {
            window.update(frame, &pose_at(frame as f64 * 0.3));
            assert!(window.window_start_frame() >= previous);
            previous = window.window_start_frame();
        }
    }
}
