use std::sync::Arc;

use anyhow::Result;
use winit::window::Window;

pub mod config;
pub mod frame;
pub mod render;
pub mod vr;

use config::{AppConfig, RuntimeKind};
use frame::{FrameLoop, FrameReport};
use render::WgpuBackend;
use vr::{
    AnyRuntime, Extent, HeadMotion, OpenXrRuntime, SimulatedHmd, SimulatedRuntime, StartupError,
};

/// Connects to the configured runtime. Failures here are fatal and not retried.
pub fn open_runtime(config: &AppConfig) -> Result<AnyRuntime, StartupError> {
    match config.runtime {
        RuntimeKind::OpenXr => OpenXrRuntime::new().map(AnyRuntime::OpenXr),
        RuntimeKind::Simulated => SimulatedRuntime::new(SimulatedHmd {
            texture_count: config.simulated_swap_textures,
            motion: HeadMotion::Sway,
            ..Default::default()
        })
        .map(AnyRuntime::Simulated),
    }
}

pub struct State {
    window: Arc<Window>,
    frame_loop: FrameLoop<AnyRuntime, WgpuBackend>,
}

impl State {
    /// Opens the runtime, then the renderer for `window`, then the eye
    /// targets and mirror. The mirror takes the window's size at this point.
    pub fn new(window: Arc<Window>, config: &AppConfig) -> Result<Self> {
        let runtime = open_runtime(config)?;
        let graphics = WgpuBackend::new(window.clone(), config.vsync)?;

        let size = window.inner_size();
        let mirror_extent = Extent::new(size.width.max(1), size.height.max(1));
        let frame_loop = FrameLoop::new(runtime, graphics, config.scene, mirror_extent)?;

        Ok(Self { window, frame_loop })
    }

    pub fn window(&self) -> &Window {
        &self.window
    }

    pub fn resize(&mut self, width: u32, height: u32) {
        self.frame_loop.graphics_mut().resize_surface(width, height);
    }

    pub fn render(&mut self, dt: f32) -> FrameReport {
        self.frame_loop.tick(dt)
    }

    pub fn shutdown(self) {
        self.frame_loop.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vr::VrRuntime;

    #[test]
    fn test_simulated_runtime_uses_configured_swap_textures() {
        let config = AppConfig {
            runtime: RuntimeKind::Simulated,
            simulated_swap_textures: 2,
            ..Default::default()
        };
        let runtime = open_runtime(&config).unwrap();
        assert!(matches!(runtime, AnyRuntime::Simulated(_)));
        assert_eq!(runtime.swap_texture_count(), 2);
        assert_eq!(runtime.info().product_name, "Simulated HMD");
    }
}
