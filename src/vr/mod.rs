use std::fmt;

pub mod math;
pub mod simulated;
pub mod system;
pub mod timing;
pub mod types;
pub mod vulkan;

pub use simulated::{HeadMotion, SimulatedHmd, SimulatedRuntime};
pub use system::OpenXrRuntime;
pub use types::*;

use crate::render::EyeImageSource;

/// What the compositor reported for a submitted frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitStatus {
    Success,
    /// The frame was accepted but is not being shown, e.g. the headset is
    /// off the user's head or another application has focus.
    NotVisible,
    DisplayLost,
    /// The runtime wants the application to shut down.
    ExitRequested,
}

impl SubmitStatus {
    pub fn is_success(self) -> bool {
        self == SubmitStatus::Success
    }
}

/// Startup failures. None of these are retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartupError {
    RuntimeUnavailable(String),
    HmdNotDetected,
    HmdDisabled,
}

impl StartupError {
    pub fn title(&self) -> &'static str {
        match self {
            StartupError::RuntimeUnavailable(_) => "Runtime error",
            StartupError::HmdNotDetected => "HMD not detected",
            StartupError::HmdDisabled => "HMD disabled",
        }
    }
}

impl fmt::Display for StartupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StartupError::RuntimeUnavailable(reason) => {
                write!(f, "Failed to initialize the VR runtime: {}", reason)
            }
            StartupError::HmdNotDetected => write!(f, "Head-mounted display not detected."),
            StartupError::HmdDisabled => write!(f, "The HMD is not enabled."),
        }
    }
}

impl std::error::Error for StartupError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HmdInfo {
    pub product_name: String,
    pub runtime_version: String,
}

/// Connection to a VR runtime and the head-mounted display it drives.
pub trait VrRuntime {
    fn info(&self) -> &HmdInfo;

    fn default_eye_fov(&self, eye: Eye) -> FovPort;

    fn eye_render_desc(&self, eye: Eye, fov: FovPort) -> EyeRenderDesc;

    /// Recommended per-eye texture size for `fov` at the given pixel density.
    fn fov_texture_size(&self, eye: Eye, fov: FovPort, pixel_density: f32) -> Extent;

    /// Number of textures each eye's swap set rotates through.
    fn swap_texture_count(&self) -> usize;

    /// Predicted mid-photon time, in seconds, for the given frame.
    fn predicted_display_time(&mut self, frame_index: u64) -> f64;

    fn time_in_seconds(&self) -> f64;

    fn tracking_state(&mut self, at: f64) -> TrackingState;

    fn submit_frame(
        &mut self,
        frame_index: u64,
        layer: &LayerEyeFov,
        images: &mut dyn EyeImageSource,
    ) -> SubmitStatus;

    fn recenter_pose(&mut self);

    /// Releases the display handle, then the runtime session. Safe to call twice.
    fn shutdown(&mut self);
}

/// Runtime chosen at startup.
pub enum AnyRuntime {
    OpenXr(OpenXrRuntime),
    Simulated(SimulatedRuntime),
}

macro_rules! dispatch {
    ($self:ident, $rt:ident => $body:expr) => {
        match $self {
            AnyRuntime::OpenXr($rt) => $body,
            AnyRuntime::Simulated($rt) => $body,
        }
    };
}

impl VrRuntime for AnyRuntime {
    fn info(&self) -> &HmdInfo {
        dispatch!(self, rt => rt.info())
    }

    fn default_eye_fov(&self, eye: Eye) -> FovPort {
        dispatch!(self, rt => rt.default_eye_fov(eye))
    }

    fn eye_render_desc(&self, eye: Eye, fov: FovPort) -> EyeRenderDesc {
        dispatch!(self, rt => rt.eye_render_desc(eye, fov))
    }

    fn fov_texture_size(&self, eye: Eye, fov: FovPort, pixel_density: f32) -> Extent {
        dispatch!(self, rt => rt.fov_texture_size(eye, fov, pixel_density))
    }

    fn swap_texture_count(&self) -> usize {
        dispatch!(self, rt => rt.swap_texture_count())
    }

    fn predicted_display_time(&mut self, frame_index: u64) -> f64 {
        dispatch!(self, rt => rt.predicted_display_time(frame_index))
    }

    fn time_in_seconds(&self) -> f64 {
        dispatch!(self, rt => rt.time_in_seconds())
    }

    fn tracking_state(&mut self, at: f64) -> TrackingState {
        dispatch!(self, rt => rt.tracking_state(at))
    }

    fn submit_frame(
        &mut self,
        frame_index: u64,
        layer: &LayerEyeFov,
        images: &mut dyn EyeImageSource,
    ) -> SubmitStatus {
        dispatch!(self, rt => rt.submit_frame(frame_index, layer, images))
    }

    fn recenter_pose(&mut self) {
        dispatch!(self, rt => rt.recenter_pose())
    }

    fn shutdown(&mut self) {
        dispatch!(self, rt => rt.shutdown())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_success_is_success() {
        assert!(SubmitStatus::Success.is_success());
        assert!(!SubmitStatus::NotVisible.is_success());
        assert!(!SubmitStatus::DisplayLost.is_success());
        assert!(!SubmitStatus::ExitRequested.is_success());
    }

    #[test]
    fn test_startup_error_messages() {
        assert_eq!(StartupError::HmdDisabled.to_string(), "The HMD is not enabled.");
        assert_eq!(StartupError::HmdNotDetected.title(), "HMD not detected");

        let err = anyhow::Error::new(StartupError::RuntimeUnavailable("no loader".into()));
        let startup = err.downcast_ref::<StartupError>();
        assert!(
            matches!(startup, Some(StartupError::RuntimeUnavailable(_))),
            "startup errors should survive conversion to anyhow"
        );
    }
}
