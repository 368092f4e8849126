use anyhow::Result;
use glam::Mat4;

pub mod backend;
pub mod cube;
pub mod recording;
pub mod target;

pub use backend::WgpuBackend;
pub use recording::{GraphicsCall, RecordingBackend};
pub use target::{RenderTarget, SwapTextureSet, TargetId};

use crate::vr::{Extent, Eye, TextureOrigin, TextureRef};

/// Texture mirroring what the compositor shows, sized to the window at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MirrorSurface {
    pub extent: Extent,
}

/// Rectangle given by two corners, in bottom-left-origin pixel coordinates.
/// Corners may be swapped to express a flip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlitRect {
    pub x0: i32,
    pub y0: i32,
    pub x1: i32,
    pub y1: i32,
}

impl BlitRect {
    pub fn new(x0: i32, y0: i32, x1: i32, y1: i32) -> Self {
        Self { x0, y0, x1, y1 }
    }
}

/// Source and destination rectangles for copying the mirror to the window.
/// The source is read with Y growing downward, so it is vertically inverted.
pub fn mirror_blit_rects(extent: Extent) -> (BlitRect, BlitRect) {
    let w = extent.width as i32;
    let h = extent.height as i32;
    (BlitRect::new(0, h, w, 0), BlitRect::new(0, 0, w, h))
}

/// Tightly packed RGBA8 pixels of one eye texture, top row first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EyeImage {
    pub width: u32,
    pub height: u32,
    pub rgba: Vec<u8>,
}

/// CPU access to rendered eye textures, for runtimes that cannot share GPU
/// memory with the renderer.
pub trait EyeImageSource {
    fn read_eye_image(&mut self, texture: TextureRef) -> Option<EyeImage>;
}

/// Graphics capabilities the frame loop needs.
pub trait GraphicsBackend: EyeImageSource {
    fn texture_origin(&self) -> TextureOrigin;

    fn create_target(
        &mut self,
        eye: Eye,
        extent: Extent,
        texture_count: usize,
    ) -> Result<RenderTarget>;

    fn create_mirror(&mut self, extent: Extent) -> Result<MirrorSurface>;

    /// Directs draws into the target's current swap texture and clears color and depth.
    fn bind(&mut self, target: &RenderTarget);

    /// One indexed draw of the cube mesh.
    fn draw(&mut self, view_projection: &Mat4, world: &Mat4);

    fn unbind(&mut self, target: &RenderTarget);

    fn blit(&mut self, mirror: &MirrorSurface, src: BlitRect, dst: BlitRect);

    fn present(&mut self);

    fn destroy_target(&mut self, target: &RenderTarget);

    fn destroy_mirror(&mut self, mirror: &MirrorSurface);

    /// Drops the mesh buffers, then the shader program. Safe to call twice.
    fn release(&mut self);
}

/// Viewport and texture coordinate transform that realise a blit as a quad draw.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlitMapping {
    /// x, y, width, height with a top-left origin, as render passes expect.
    pub viewport: [f32; 4],
    pub uv_origin: [f32; 2],
    pub uv_span: [f32; 2],
}

/// Maps a GL-style blit onto a textured quad. Destination pixels are measured
/// from the bottom of the destination; source coordinates are texel rows from
/// the start of the source image. The destination is clipped to its extent.
pub fn blit_mapping(
    src: BlitRect,
    src_extent: Extent,
    dst: BlitRect,
    dst_extent: Extent,
) -> Option<BlitMapping> {
    if src_extent.is_empty() || dst_extent.is_empty() || dst.x0 == dst.x1 || dst.y0 == dst.y1 {
        return None;
    }

    let left = dst.x0.min(dst.x1).max(0);
    let right = dst.x0.max(dst.x1).min(dst_extent.width as i32);
    let bottom = dst.y0.min(dst.y1).max(0);
    let top = dst.y0.max(dst.y1).min(dst_extent.height as i32);
    if left >= right || bottom >= top {
        return None;
    }

    let map_x = |x: f32| {
        let t = (x - dst.x0 as f32) / (dst.x1 - dst.x0) as f32;
        (src.x0 as f32 + t * (src.x1 - src.x0) as f32) / src_extent.width as f32
    };
    let map_y = |y: f32| {
        let t = (y - dst.y0 as f32) / (dst.y1 - dst.y0) as f32;
        (src.y0 as f32 + t * (src.y1 - src.y0) as f32) / src_extent.height as f32
    };

    let u0 = map_x(left as f32);
    let u1 = map_x(right as f32);
    // Quad space starts at the top of the viewport.
    let v0 = map_y(top as f32);
    let v1 = map_y(bottom as f32);

    Some(BlitMapping {
        viewport: [
            left as f32,
            (dst_extent.height as i32 - top) as f32,
            (right - left) as f32,
            (top - bottom) as f32,
        ],
        uv_origin: [u0, v0],
        uv_span: [u1 - u0, v1 - v0],
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_mirror_source_is_vertically_inverted() {
        for (w, h) in [(1, 1), (640, 480), (1280, 800), (3, 1024)] {
            let (src, dst) = mirror_blit_rects(Extent::new(w, h));
            assert_eq!(dst, BlitRect::new(0, 0, w as i32, h as i32));
            assert_eq!(src.x0, dst.x0, "horizontal extent is not flipped");
            assert_eq!(src.x1, dst.x1, "horizontal extent is not flipped");
            assert_eq!(src.y0, dst.y1, "source starts where the destination ends");
            assert_eq!(src.y1, dst.y0, "source ends where the destination starts");
        }
    }

    #[test]
    fn test_mirror_mapping_shows_first_row_at_top() {
        let extent = Extent::new(800, 600);
        let (src, dst) = mirror_blit_rects(extent);
        let mapping = blit_mapping(src, extent, dst, extent).unwrap();
        assert_eq!(mapping.viewport, [0.0, 0.0, 800.0, 600.0]);
        assert_relative_eq!(mapping.uv_origin[0], 0.0);
        assert_relative_eq!(mapping.uv_origin[1], 0.0);
        assert_relative_eq!(mapping.uv_span[0], 1.0);
        assert_relative_eq!(mapping.uv_span[1], 1.0);
    }

    #[test]
    fn test_unflipped_mapping_reads_bottom_up() {
        let extent = Extent::new(100, 50);
        let rect = BlitRect::new(0, 0, 100, 50);
        let mapping = blit_mapping(rect, extent, rect, extent).unwrap();
        assert_relative_eq!(mapping.uv_origin[1], 1.0);
        assert_relative_eq!(mapping.uv_span[1], -1.0);
    }

    #[test]
    fn test_mapping_clips_to_smaller_window() {
        let mirror = Extent::new(200, 100);
        let window = Extent::new(100, 100);
        let (src, dst) = mirror_blit_rects(mirror);
        let mapping = blit_mapping(src, mirror, dst, window).unwrap();
        assert_eq!(mapping.viewport, [0.0, 0.0, 100.0, 100.0]);
        assert_relative_eq!(mapping.uv_span[0], 0.5);
        assert_relative_eq!(mapping.uv_span[1], 1.0);
    }

    #[test]
    fn test_empty_blits_are_skipped() {
        let extent = Extent::new(10, 10);
        let empty = BlitRect::new(0, 0, 0, 10);
        assert!(blit_mapping(empty, extent, empty, extent).is_none());
        let rect = BlitRect::new(0, 0, 10, 10);
        assert!(blit_mapping(rect, Extent::new(0, 10), rect, extent).is_none());
    }
}
