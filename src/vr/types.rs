use glam::{Quat, Vec3};
use openxr as xr;

use crate::render::target::TargetId;

/// Eyes are always processed left first, then right.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Eye {
    Left = 0,
    Right = 1,
}

impl Eye {
    pub const ALL: [Eye; 2] = [Eye::Left, Eye::Right];

    pub fn index(self) -> usize {
        self as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pose {
    pub orientation: Quat,
    pub position: Vec3,
}

impl Pose {
    pub const IDENTITY: Pose = Pose {
        orientation: Quat::IDENTITY,
        position: Vec3::ZERO,
    };

    pub fn new(orientation: Quat, position: Vec3) -> Self {
        Self { orientation, position }
    }
}

impl Default for Pose {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl From<xr::Posef> for Pose {
    fn from(pose: xr::Posef) -> Self {
        Self {
            orientation: Quat::from_xyzw(
                pose.orientation.x,
                pose.orientation.y,
                pose.orientation.z,
                pose.orientation.w,
            ),
            position: Vec3::new(pose.position.x, pose.position.y, pose.position.z),
        }
    }
}

impl From<Pose> for xr::Posef {
    fn from(pose: Pose) -> Self {
        xr::Posef {
            orientation: xr::Quaternionf {
                x: pose.orientation.x,
                y: pose.orientation.y,
                z: pose.orientation.z,
                w: pose.orientation.w,
            },
            position: xr::Vector3f {
                x: pose.position.x,
                y: pose.position.y,
                z: pose.position.z,
            },
        }
    }
}

/// Field of view as four positive half-angle tangents.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FovPort {
    pub up_tan: f32,
    pub down_tan: f32,
    pub left_tan: f32,
    pub right_tan: f32,
}

impl FovPort {
    /// Symmetric field of view from full horizontal and vertical angles in radians.
    pub fn symmetric(horizontal: f32, vertical: f32) -> Self {
        let h = (horizontal * 0.5).tan();
        let v = (vertical * 0.5).tan();
        Self {
            up_tan: v,
            down_tan: v,
            left_tan: h,
            right_tan: h,
        }
    }

    pub fn horizontal_tan(&self) -> f32 {
        self.left_tan + self.right_tan
    }

    pub fn vertical_tan(&self) -> f32 {
        self.up_tan + self.down_tan
    }
}

// OpenXR angles are signed: left and down are negative for a typical view.
impl From<xr::Fovf> for FovPort {
    fn from(fov: xr::Fovf) -> Self {
        Self {
            up_tan: fov.angle_up.tan(),
            down_tan: (-fov.angle_down).tan(),
            left_tan: (-fov.angle_left).tan(),
            right_tan: fov.angle_right.tan(),
        }
    }
}

impl From<FovPort> for xr::Fovf {
    fn from(fov: FovPort) -> Self {
        xr::Fovf {
            angle_left: -fov.left_tan.atan(),
            angle_right: fov.right_tan.atan(),
            angle_up: fov.up_tan.atan(),
            angle_down: -fov.down_tan.atan(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Extent {
    pub width: u32,
    pub height: u32,
}

impl Extent {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

/// Pixel rectangle with a top-left origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Viewport {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Viewport {
    pub fn covering(extent: Extent) -> Self {
        Self {
            x: 0,
            y: 0,
            width: extent.width,
            height: extent.height,
        }
    }
}

/// Per-eye description fixed once the display is detected.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EyeRenderDesc {
    pub eye: Eye,
    pub fov: FovPort,
    /// Eye position relative to the head center, in head space.
    pub hmd_to_eye_offset: Vec3,
    /// Eye rotation relative to the head. Identity unless the displays are canted.
    pub hmd_to_eye_orientation: Quat,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackingState {
    pub head_pose: Pose,
    pub sample_time: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureRef {
    pub target: TargetId,
    pub index: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextureOrigin {
    TopLeft,
    BottomLeft,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LayerEye {
    pub texture: Option<TextureRef>,
    pub viewport: Viewport,
    pub fov: FovPort,
    pub render_pose: Pose,
}

/// The single projection layer handed to the compositor every frame.
#[derive(Debug, Clone, PartialEq)]
pub struct LayerEyeFov {
    pub origin: TextureOrigin,
    pub eyes: [LayerEye; 2],
    pub sensor_sample_time: f64,
}

impl LayerEyeFov {
    pub fn new(origin: TextureOrigin) -> Self {
        let empty = LayerEye {
            texture: None,
            viewport: Viewport::covering(Extent::new(0, 0)),
            fov: FovPort::symmetric(0.0, 0.0),
            render_pose: Pose::IDENTITY,
        };
        Self {
            origin,
            eyes: [empty; 2],
            sensor_sample_time: 0.0,
        }
    }

    pub fn eye(&self, eye: Eye) -> &LayerEye {
        &self.eyes[eye.index()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_fov_round_trips_through_openxr_angles() {
        let fov = FovPort {
            up_tan: 1.2,
            down_tan: 1.1,
            left_tan: 1.0,
            right_tan: 0.8,
        };
        let angles: xr::Fovf = fov.into();
        assert!(angles.angle_left < 0.0, "left angle should be negative");
        assert!(angles.angle_down < 0.0, "down angle should be negative");

        let back = FovPort::from(angles);
        assert_relative_eq!(back.up_tan, fov.up_tan, epsilon = 0.001);
        assert_relative_eq!(back.down_tan, fov.down_tan, epsilon = 0.001);
        assert_relative_eq!(back.left_tan, fov.left_tan, epsilon = 0.001);
        assert_relative_eq!(back.right_tan, fov.right_tan, epsilon = 0.001);
    }

    #[test]
    fn test_symmetric_fov() {
        let fov = FovPort::symmetric(std::f32::consts::FRAC_PI_2, std::f32::consts::FRAC_PI_2);
        assert_relative_eq!(fov.left_tan, 1.0, epsilon = 0.001);
        assert_relative_eq!(fov.up_tan, 1.0, epsilon = 0.001);
        assert_relative_eq!(fov.horizontal_tan(), 2.0, epsilon = 0.001);
    }

    #[test]
    fn test_eye_indices() {
        assert_eq!(Eye::Left.index(), 0);
        assert_eq!(Eye::Right.index(), 1);
        assert_eq!(Eye::ALL, [Eye::Left, Eye::Right]);
    }
}
