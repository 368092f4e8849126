use glam::{Mat4, Vec3};

pub const CUBE_POSITIONS: [[f32; 3]; 8] = [
    [-1.0, -1.0, 1.0],
    [1.0, -1.0, 1.0],
    [1.0, 1.0, 1.0],
    [-1.0, 1.0, 1.0],
    [-1.0, -1.0, -1.0],
    [1.0, -1.0, -1.0],
    [1.0, 1.0, -1.0],
    [-1.0, 1.0, -1.0],
];

const RED: [f32; 4] = [1.0, 0.0, 0.0, 1.0];
const GREEN: [f32; 4] = [0.0, 1.0, 0.0, 1.0];
const BLUE: [f32; 4] = [0.0, 0.0, 1.0, 1.0];

pub const CUBE_COLORS: [[f32; 4]; 8] = [RED, GREEN, BLUE, RED, GREEN, BLUE, RED, GREEN];

pub const CUBE_INDICES: [u16; 36] = [
    0, 1, 2, 2, 3, 0, // front
    3, 2, 6, 6, 7, 3, // top
    4, 0, 3, 3, 7, 4, // left
    5, 1, 0, 0, 4, 5, // bottom
    6, 2, 1, 1, 5, 6, // right
    7, 6, 5, 5, 4, 7, // back
];

pub const CUBE_SCALE: f32 = 5.0;
pub const CUBE_CENTER: Vec3 = Vec3::new(0.0, 0.0, 10.0);

/// Positions and colors live in separate vertex buffers.
pub struct CubeVertexLayout;

impl CubeVertexLayout {
    pub const POSITION_ATTRIBUTES: [wgpu::VertexAttribute; 1] = wgpu::vertex_attr_array![
        0 => Float32x3,
    ];
    pub const COLOR_ATTRIBUTES: [wgpu::VertexAttribute; 1] = wgpu::vertex_attr_array![
        1 => Float32x4,
    ];

    pub fn buffers() -> [wgpu::VertexBufferLayout<'static>; 2] {
        [
            wgpu::VertexBufferLayout {
                array_stride: std::mem::size_of::<[f32; 3]>() as wgpu::BufferAddress,
                step_mode: wgpu::VertexStepMode::Vertex,
                attributes: &Self::POSITION_ATTRIBUTES,
            },
            wgpu::VertexBufferLayout {
                array_stride: std::mem::size_of::<[f32; 4]>() as wgpu::BufferAddress,
                step_mode: wgpu::VertexStepMode::Vertex,
                attributes: &Self::COLOR_ATTRIBUTES,
            },
        ]
    }
}

pub struct Transform {
    pub position: Vec3,
    /// Angles about X, Y and Z, applied X first.
    pub rotation: Vec3,
    pub scale: Vec3,
}

impl Transform {
    /// The demo cube after `seconds` of accumulated frame time.
    pub fn spinning_cube(seconds: f32) -> Self {
        Self {
            position: CUBE_CENTER,
            rotation: Vec3::splat(seconds),
            scale: Vec3::splat(CUBE_SCALE),
        }
    }

    pub fn to_matrix(&self) -> Mat4 {
        let translation = Mat4::from_translation(self.position);
        let rotation = Mat4::from_euler(
            glam::EulerRot::ZYX,
            self.rotation.z,
            self.rotation.y,
            self.rotation.x,
        );
        let scale = Mat4::from_scale(self.scale);
        translation * rotation * scale
    }
}

impl Default for Transform {
    fn default() -> Self {
        Self {
            position: Vec3::ZERO,
            rotation: Vec3::ZERO,
            scale: Vec3::ONE,
        }
    }
}
