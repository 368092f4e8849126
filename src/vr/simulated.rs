use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use glam::{Quat, Vec3};

use super::{
    EyeRenderDesc, Extent, Eye, FovPort, HmdInfo, LayerEyeFov, Pose, StartupError, SubmitStatus,
    TrackingState, VrRuntime,
};
use crate::render::EyeImageSource;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeadMotion {
    Still,
    /// Slow yaw and pitch oscillation, enough to see the stereo cameras move.
    Sway,
}

/// Description of the simulated headset.
#[derive(Debug, Clone)]
pub struct SimulatedHmd {
    pub product_name: String,
    pub connected: bool,
    pub eye_resolution: Extent,
    pub ipd: f32,
    pub texture_count: usize,
    pub refresh_rate: f64,
    pub motion: HeadMotion,
}

impl Default for SimulatedHmd {
    fn default() -> Self {
        Self {
            product_name: "Simulated HMD".to_string(),
            connected: true,
            eye_resolution: Extent::new(1512, 1680),
            ipd: 0.0719,
            texture_count: 3,
            refresh_rate: 90.0,
            motion: HeadMotion::Still,
        }
    }
}

/// Submitted frames kept for inspection; older ones are dropped.
pub const SUBMIT_HISTORY: usize = 64;

#[derive(Debug, Clone, PartialEq)]
pub struct SubmittedFrame {
    pub frame_index: u64,
    pub layer: LayerEyeFov,
    pub status: SubmitStatus,
}

#[derive(Debug, Default)]
pub struct SimulatedState {
    /// Statuses returned by upcoming submits, oldest first. Empty means success.
    pub scripted_statuses: VecDeque<SubmitStatus>,
    /// The most recent submits, at most [`SUBMIT_HISTORY`].
    pub submitted: VecDeque<SubmittedFrame>,
    pub submit_count: u64,
    pub head_pose: Option<Pose>,
    pub recenter_count: u32,
    pub shut_down: bool,
    pub now: f64,
}

/// In-process headset with fixed optics and scripted compositor results.
pub struct SimulatedRuntime {
    hmd: SimulatedHmd,
    info: HmdInfo,
    fovs: [FovPort; 2],
    yaw_origin: f32,
    state: Arc<Mutex<SimulatedState>>,
}

fn degrees_fov(up: f32, down: f32, left: f32, right: f32) -> FovPort {
    FovPort {
        up_tan: up.to_radians().tan(),
        down_tan: down.to_radians().tan(),
        left_tan: left.to_radians().tan(),
        right_tan: right.to_radians().tan(),
    }
}

impl SimulatedRuntime {
    pub fn new(hmd: SimulatedHmd) -> Result<Self, StartupError> {
        if !hmd.connected {
            return Err(StartupError::HmdNotDetected);
        }
        if hmd.product_name.is_empty() {
            return Err(StartupError::HmdDisabled);
        }

        let info = HmdInfo {
            product_name: hmd.product_name.clone(),
            runtime_version: format!("simulated {}", env!("CARGO_PKG_VERSION")),
        };
        log::info!(
            "Simulated HMD '{}': {}x{} per eye at {} Hz",
            info.product_name,
            hmd.eye_resolution.width,
            hmd.eye_resolution.height,
            hmd.refresh_rate
        );

        Ok(Self {
            fovs: [
                degrees_fov(55.82, 55.71, 54.42, 51.27),
                degrees_fov(55.90, 55.61, 51.30, 54.37),
            ],
            info,
            hmd,
            yaw_origin: 0.0,
            state: Arc::new(Mutex::new(SimulatedState::default())),
        })
    }

    pub fn state_handle(&self) -> Arc<Mutex<SimulatedState>> {
        self.state.clone()
    }

    fn state(&self) -> MutexGuard<'_, SimulatedState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn frame_period(&self) -> f64 {
        1.0 / self.hmd.refresh_rate.max(1.0)
    }

    fn motion_yaw(&self, at: f64) -> f32 {
        match self.hmd.motion {
            HeadMotion::Still => 0.0,
            HeadMotion::Sway => 0.3 * (at * 0.5).sin() as f32,
        }
    }

    fn motion_pose(&self, at: f64) -> Pose {
        let yaw = self.motion_yaw(at) - self.yaw_origin;
        let pitch = match self.hmd.motion {
            HeadMotion::Still => 0.0,
            HeadMotion::Sway => 0.1 * (at * 0.7).sin() as f32,
        };
        Pose::new(Quat::from_rotation_y(yaw) * Quat::from_rotation_x(pitch), Vec3::ZERO)
    }
}

impl VrRuntime for SimulatedRuntime {
    fn info(&self) -> &HmdInfo {
        &self.info
    }

    fn default_eye_fov(&self, eye: Eye) -> FovPort {
        self.fovs[eye.index()]
    }

    fn eye_render_desc(&self, eye: Eye, fov: FovPort) -> EyeRenderDesc {
        let half_ipd = self.hmd.ipd * 0.5;
        let x = match eye {
            Eye::Left => -half_ipd,
            Eye::Right => half_ipd,
        };
        EyeRenderDesc {
            eye,
            fov,
            hmd_to_eye_offset: Vec3::new(x, 0.0, 0.0),
            hmd_to_eye_orientation: Quat::IDENTITY,
        }
    }

    fn fov_texture_size(&self, eye: Eye, fov: FovPort, pixel_density: f32) -> Extent {
        let default = self.fovs[eye.index()];
        let scale_x = fov.horizontal_tan() / default.horizontal_tan();
        let scale_y = fov.vertical_tan() / default.vertical_tan();
        let width = (self.hmd.eye_resolution.width as f32 * scale_x * pixel_density).round();
        let height = (self.hmd.eye_resolution.height as f32 * scale_y * pixel_density).round();
        Extent::new((width as u32).max(1), (height as u32).max(1))
    }

    fn swap_texture_count(&self) -> usize {
        self.hmd.texture_count
    }

    fn predicted_display_time(&mut self, frame_index: u64) -> f64 {
        let period = self.frame_period();
        let now = frame_index as f64 * period;
        self.state().now = now;
        now + period
    }

    fn time_in_seconds(&self) -> f64 {
        self.state().now
    }

    fn tracking_state(&mut self, at: f64) -> TrackingState {
        let scripted = self.state().head_pose;
        TrackingState {
            head_pose: scripted.unwrap_or_else(|| self.motion_pose(at)),
            sample_time: at,
        }
    }

    fn submit_frame(
        &mut self,
        frame_index: u64,
        layer: &LayerEyeFov,
        _images: &mut dyn EyeImageSource,
    ) -> SubmitStatus {
        let mut state = self.state();
        let status = state
            .scripted_statuses
            .pop_front()
            .unwrap_or(SubmitStatus::Success);
        log::trace!("Simulated submit of frame {}: {:?}", frame_index, status);
        if state.submitted.len() == SUBMIT_HISTORY {
            state.submitted.pop_front();
        }
        state.submitted.push_back(SubmittedFrame {
            frame_index,
            layer: layer.clone(),
            status,
        });
        state.submit_count += 1;
        status
    }

    fn recenter_pose(&mut self) {
        let now = self.state().now;
        self.yaw_origin = self.motion_yaw(now);
        self.state().recenter_count += 1;
        log::debug!("Simulated HMD recentered");
    }

    fn shutdown(&mut self) {
        let mut state = self.state();
        if !state.shut_down {
            state.shut_down = true;
            log::info!("Simulated HMD released");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::RecordingBackend;
    use approx::assert_relative_eq;

    #[test]
    fn test_disconnected_hmd_is_not_detected() {
        let hmd = SimulatedHmd { connected: false, ..Default::default() };
        assert_eq!(SimulatedRuntime::new(hmd).err(), Some(StartupError::HmdNotDetected));
    }

    #[test]
    fn test_unnamed_hmd_is_disabled() {
        let hmd = SimulatedHmd { product_name: String::new(), ..Default::default() };
        assert_eq!(SimulatedRuntime::new(hmd).err(), Some(StartupError::HmdDisabled));
    }

    #[test]
    fn test_texture_size_at_default_fov() {
        let runtime = SimulatedRuntime::new(SimulatedHmd::default()).unwrap();
        let fov = runtime.default_eye_fov(Eye::Left);
        assert_eq!(runtime.fov_texture_size(Eye::Left, fov, 1.0), Extent::new(1512, 1680));
        assert_eq!(runtime.fov_texture_size(Eye::Left, fov, 0.5), Extent::new(756, 840));
    }

    #[test]
    fn test_eye_offsets_are_symmetric() {
        let runtime = SimulatedRuntime::new(SimulatedHmd::default()).unwrap();
        let fov = runtime.default_eye_fov(Eye::Left);
        let left = runtime.eye_render_desc(Eye::Left, fov).hmd_to_eye_offset;
        let right = runtime.eye_render_desc(Eye::Right, fov).hmd_to_eye_offset;
        assert_relative_eq!(left.x, -right.x);
        assert_relative_eq!(right.x - left.x, 0.0719, epsilon = 0.0001);
    }

    #[test]
    fn test_predicted_time_is_one_frame_ahead() {
        let mut runtime = SimulatedRuntime::new(SimulatedHmd::default()).unwrap();
        let predicted = runtime.predicted_display_time(9);
        assert_relative_eq!(runtime.time_in_seconds(), 0.1, epsilon = 1e-9);
        assert_relative_eq!(predicted, 0.1 + 1.0 / 90.0, epsilon = 1e-9);
    }

    #[test]
    fn test_scripted_statuses_then_success() {
        let mut runtime = SimulatedRuntime::new(SimulatedHmd::default()).unwrap();
        runtime
            .state_handle()
            .lock()
            .unwrap()
            .scripted_statuses
            .push_back(SubmitStatus::NotVisible);

        let layer = LayerEyeFov::new(crate::vr::TextureOrigin::TopLeft);
        let mut images = RecordingBackend::new();
        assert_eq!(runtime.submit_frame(0, &layer, &mut images), SubmitStatus::NotVisible);
        assert_eq!(runtime.submit_frame(1, &layer, &mut images), SubmitStatus::Success);
        assert_eq!(runtime.state_handle().lock().unwrap().submitted.len(), 2);
    }

    #[test]
    fn test_submit_history_is_bounded() {
        let mut runtime = SimulatedRuntime::new(SimulatedHmd::default()).unwrap();
        let layer = LayerEyeFov::new(crate::vr::TextureOrigin::TopLeft);
        let mut images = RecordingBackend::new();
        let frames = SUBMIT_HISTORY as u64 * 10 + 3;
        for frame_index in 0..frames {
            runtime.submit_frame(frame_index, &layer, &mut images);
        }

        let handle = runtime.state_handle();
        let state = handle.lock().unwrap();
        assert_eq!(state.submitted.len(), SUBMIT_HISTORY);
        assert_eq!(state.submit_count, frames);
        assert_eq!(state.submitted.front().unwrap().frame_index, frames - SUBMIT_HISTORY as u64);
        assert_eq!(state.submitted.back().unwrap().frame_index, frames - 1);
    }

    #[test]
    fn test_recenter_cancels_current_yaw() {
        let hmd = SimulatedHmd { motion: HeadMotion::Sway, ..Default::default() };
        let mut runtime = SimulatedRuntime::new(hmd).unwrap();
        runtime.predicted_display_time(200);
        let now = runtime.time_in_seconds();
        runtime.recenter_pose();

        let pose = runtime.tracking_state(now).head_pose;
        let (yaw, _, _) = pose.orientation.to_euler(glam::EulerRot::YXZ);
        assert_relative_eq!(yaw, 0.0, epsilon = 0.001);
        assert_eq!(runtime.state_handle().lock().unwrap().recenter_count, 1);
    }
}
