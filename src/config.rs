use anyhow::Result;
use glam::Vec3;

/// Camera and rendering parameters shared by both eyes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SceneSettings {
    pub near: f32,
    pub far: f32,
    pub pixel_density: f32,
    pub player_position: Vec3,
}

impl Default for SceneSettings {
    fn default() -> Self {
        Self {
            near: 0.1,
            far: 1000.0,
            pixel_density: 1.0,
            player_position: Vec3::new(0.0, 0.0, -10.0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeKind {
    OpenXr,
    Simulated,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    pub runtime: RuntimeKind,
    pub scene: SceneSettings,
    pub window_width: u32,
    pub window_height: u32,
    pub vsync: bool,
    /// Swap set size for the simulated headset; real runtimes choose their own.
    pub simulated_swap_textures: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            runtime: RuntimeKind::OpenXr,
            scene: SceneSettings::default(),
            window_width: 1280,
            window_height: 800,
            vsync: false,
            simulated_swap_textures: 3,
        }
    }
}

impl AppConfig {
    pub fn validate(&self) -> Result<()> {
        let scene = &self.scene;
        if !(scene.pixel_density > 0.0 && scene.pixel_density.is_finite()) {
            return Err(anyhow::anyhow!(
                "Pixel density must be positive and finite, got {}",
                scene.pixel_density
            ));
        }
        if !(scene.near > 0.0 && scene.near.is_finite()) {
            return Err(anyhow::anyhow!(
                "Near plane must be positive and finite, got {}",
                scene.near
            ));
        }
        if !scene.far.is_finite() {
            return Err(anyhow::anyhow!("Far plane must be finite, got {}", scene.far));
        }
        if !(scene.far > scene.near) {
            return Err(anyhow::anyhow!(
                "Far plane ({}) must be beyond the near plane ({})",
                scene.far,
                scene.near
            ));
        }
        if self.window_width == 0 || self.window_height == 0 {
            return Err(anyhow::anyhow!(
                "Window size must be non-zero, got {}x{}",
                self.window_width,
                self.window_height
            ));
        }
        if self.simulated_swap_textures == 0 {
            return Err(anyhow::anyhow!("At least one swap texture is required"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.scene.player_position, Vec3::new(0.0, 0.0, -10.0));
        assert_eq!(config.runtime, RuntimeKind::OpenXr);
        assert!(!config.vsync, "vsync is off unless requested");
    }

    #[test]
    fn test_rejects_inverted_clip_planes() {
        let mut config = AppConfig::default();
        config.scene.far = 0.05;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("Far plane"));
    }

    #[test]
    fn test_rejects_infinite_clip_planes() {
        let mut config = AppConfig::default();
        config.scene.far = f32::INFINITY;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("finite"));

        let mut config = AppConfig::default();
        config.scene.near = f32::INFINITY;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_bad_density() {
        let mut config = AppConfig::default();
        config.scene.pixel_density = 0.0;
        assert!(config.validate().is_err());
        config.scene.pixel_density = f32::NAN;
        assert!(config.validate().is_err(), "NaN density must be rejected");
        config.scene.pixel_density = f32::INFINITY;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_empty_window() {
        let config = AppConfig { window_height: 0, ..Default::default() };
        assert!(config.validate().is_err());
    }
}
