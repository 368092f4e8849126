use crate::vr::{Extent, Eye, TextureRef};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TargetId(pub u32);

/// Ring of color textures shared with the compositor.
///
/// The index is advanced before the frame is written, so the texture the
/// compositor may still be reading from the previous submit is never drawn to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapTextureSet {
    current_index: usize,
    texture_count: usize,
}

impl SwapTextureSet {
    pub fn new(texture_count: usize) -> Self {
        Self {
            current_index: 0,
            texture_count: texture_count.max(1),
        }
    }

    pub fn current_index(&self) -> usize {
        self.current_index
    }

    pub fn texture_count(&self) -> usize {
        self.texture_count
    }

    pub fn advance(&mut self) -> usize {
        self.current_index = (self.current_index + 1) % self.texture_count;
        self.current_index
    }
}

/// One eye's offscreen color+depth surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderTarget {
    pub id: TargetId,
    pub eye: Eye,
    pub extent: Extent,
    pub swap: SwapTextureSet,
}

impl RenderTarget {
    pub fn new(id: TargetId, eye: Eye, extent: Extent, texture_count: usize) -> Self {
        Self {
            id,
            eye,
            extent,
            swap: SwapTextureSet::new(texture_count),
        }
    }

    pub fn current_texture(&self) -> TextureRef {
        TextureRef {
            target: self.id,
            index: self.swap.current_index(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_swap_set_wraps() {
        let mut swap = SwapTextureSet::new(3);
        assert_eq!(swap.current_index(), 0);
        assert_eq!(swap.advance(), 1);
        assert_eq!(swap.advance(), 2);
        assert_eq!(swap.advance(), 0);
    }

    #[test]
    fn test_single_texture_set_stays_put() {
        let mut swap = SwapTextureSet::new(0);
        assert_eq!(swap.texture_count(), 1, "empty sets are clamped to one texture");
        assert_eq!(swap.advance(), 0);
    }

    #[test]
    fn test_current_texture_tracks_swap_index() {
        let mut target = RenderTarget::new(TargetId(7), Eye::Right, Extent::new(64, 32), 2);
        target.swap.advance();
        assert_eq!(target.current_texture(), TextureRef { target: TargetId(7), index: 1 });
    }
}
