use glam::{Mat4, Vec3};

use super::types::{EyeRenderDesc, FovPort, Pose};

/// Mirror across the X and Z axes. Head orientations from the runtime are
/// conjugated by this before deriving the look and up vectors.
pub const AXIS_FLIP: Mat4 = Mat4::from_cols_array(&[
    -1.0, 0.0, 0.0, 0.0,
    0.0, 1.0, 0.0, 0.0,
    0.0, 0.0, -1.0, 0.0,
    0.0, 0.0, 0.0, 1.0,
]);

/// Computes `S * m * S` with `S = diag(-1, 1, -1)`.
pub fn axis_flip(m: Mat4) -> Mat4 {
    AXIS_FLIP * m * AXIS_FLIP
}

/// Combines the tracked head pose with each eye's fixed offset.
pub fn calc_eye_poses(head: &Pose, descs: &[EyeRenderDesc; 2]) -> [Pose; 2] {
    descs.map(|desc| Pose {
        orientation: head.orientation * desc.hmd_to_eye_orientation,
        position: head.position + head.orientation * desc.hmd_to_eye_offset,
    })
}

/// Right-handed view matrix for an eye pose placed relative to the player.
///
/// Only the orientation is flipped; the eye position is added to the player
/// position as reported.
pub fn eye_view_matrix(player_position: Vec3, eye_pose: &Pose) -> Mat4 {
    let rotation = axis_flip(Mat4::from_quat(eye_pose.orientation));
    let look_up = rotation.transform_vector3(Vec3::Y);
    let look_at = rotation.transform_vector3(Vec3::Z);
    let view_position = player_position + eye_pose.position;
    Mat4::look_at_rh(view_position, view_position + look_at, look_up)
}

/// Projection in the runtime's row-major layout (`rows[r][c]`, column vectors).
///
/// Right-handed, depth mapped to [0, 1], off-center from the FOV tangents.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Projection {
    pub rows: [[f32; 4]; 4],
}

impl Projection {
    pub fn from_fov(fov: &FovPort, near: f32, far: f32) -> Self {
        let x_scale = 2.0 / (fov.left_tan + fov.right_tan);
        let x_offset = (fov.left_tan - fov.right_tan) * x_scale * 0.5;
        let y_scale = 2.0 / (fov.up_tan + fov.down_tan);
        let y_offset = (fov.up_tan - fov.down_tan) * y_scale * 0.5;
        let handedness = -1.0;

        Self {
            rows: [
                [x_scale, 0.0, handedness * x_offset, 0.0],
                [0.0, y_scale, handedness * -y_offset, 0.0],
                [0.0, 0.0, -handedness * far / (near - far), (far * near) / (near - far)],
                [0.0, 0.0, handedness, 0.0],
            ],
        }
    }

    pub fn matrix(&self) -> Mat4 {
        Mat4::from_cols_array_2d(&self.rows).transpose()
    }

    /// Column-major layout as written into uniform buffers.
    pub fn gpu_upload(&self) -> [[f32; 4]; 4] {
        self.matrix().to_cols_array_2d()
    }
}
