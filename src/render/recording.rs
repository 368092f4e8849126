use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::Result;
use glam::Mat4;

use super::{
    BlitRect, EyeImage, EyeImageSource, GraphicsBackend, MirrorSurface, RenderTarget, TargetId,
};
use crate::vr::{Extent, Eye, TextureOrigin, TextureRef};

#[derive(Debug, Clone, PartialEq)]
pub enum GraphicsCall {
    CreateTarget { eye: Eye, extent: Extent, texture_count: usize },
    CreateMirror { extent: Extent },
    Bind { eye: Eye, texture_index: usize, extent: Extent },
    Draw { view_projection: Mat4, world: Mat4 },
    Unbind { eye: Eye },
    Blit { src: BlitRect, dst: BlitRect },
    Present,
    ReadEyeImage { texture: TextureRef },
    DestroyTarget { eye: Eye },
    DestroyMirror,
    ReleaseBuffers,
    ReleaseProgram,
}

/// Backend that draws nothing and records every call it receives.
///
/// The call log is shared, so it stays readable after the backend has been
/// moved into (and dropped with) a frame loop.
pub struct RecordingBackend {
    calls: Arc<Mutex<Vec<GraphicsCall>>>,
    next_id: u32,
    released: bool,
    fail_target_for: Option<Eye>,
}

impl RecordingBackend {
    pub fn new() -> Self {
        Self {
            calls: Arc::new(Mutex::new(Vec::new())),
            next_id: 0,
            released: false,
            fail_target_for: None,
        }
    }

    /// Makes `create_target` fail for `eye`.
    pub fn failing_target(mut self, eye: Eye) -> Self {
        self.fail_target_for = Some(eye);
        self
    }

    pub fn log_handle(&self) -> Arc<Mutex<Vec<GraphicsCall>>> {
        self.calls.clone()
    }

    fn record(&self, call: GraphicsCall) {
        log::trace!("graphics call: {:?}", call);
        lock(&self.calls).push(call);
    }
}

impl Default for RecordingBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn lock(calls: &Mutex<Vec<GraphicsCall>>) -> MutexGuard<'_, Vec<GraphicsCall>> {
    calls.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl EyeImageSource for RecordingBackend {
    fn read_eye_image(&mut self, texture: TextureRef) -> Option<EyeImage> {
        self.record(GraphicsCall::ReadEyeImage { texture });
        None
    }
}

impl GraphicsBackend for RecordingBackend {
    fn texture_origin(&self) -> TextureOrigin {
        TextureOrigin::TopLeft
    }

    fn create_target(
        &mut self,
        eye: Eye,
        extent: Extent,
        texture_count: usize,
    ) -> Result<RenderTarget> {
        if self.fail_target_for == Some(eye) {
            return Err(anyhow::anyhow!("Failed to create {:?} eye target", eye));
        }
        self.record(GraphicsCall::CreateTarget { eye, extent, texture_count });
        let id = TargetId(self.next_id);
        self.next_id += 1;
        Ok(RenderTarget::new(id, eye, extent, texture_count))
    }

    fn create_mirror(&mut self, extent: Extent) -> Result<MirrorSurface> {
        self.record(GraphicsCall::CreateMirror { extent });
        Ok(MirrorSurface { extent })
    }

    fn bind(&mut self, target: &RenderTarget) {
        self.record(GraphicsCall::Bind {
            eye: target.eye,
            texture_index: target.swap.current_index(),
            extent: target.extent,
        });
    }

    fn draw(&mut self, view_projection: &Mat4, world: &Mat4) {
        self.record(GraphicsCall::Draw {
            view_projection: *view_projection,
            world: *world,
        });
    }

    fn unbind(&mut self, target: &RenderTarget) {
        self.record(GraphicsCall::Unbind { eye: target.eye });
    }

    fn blit(&mut self, _mirror: &MirrorSurface, src: BlitRect, dst: BlitRect) {
        self.record(GraphicsCall::Blit { src, dst });
    }

    fn present(&mut self) {
        self.record(GraphicsCall::Present);
    }

    fn destroy_target(&mut self, target: &RenderTarget) {
        self.record(GraphicsCall::DestroyTarget { eye: target.eye });
    }

    fn destroy_mirror(&mut self, _mirror: &MirrorSurface) {
        self.record(GraphicsCall::DestroyMirror);
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.record(GraphicsCall::ReleaseBuffers);
        self.record(GraphicsCall::ReleaseProgram);
    }
}
