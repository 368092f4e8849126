use anyhow::Result;
use glam::Mat4;
use log::{debug, info, trace, warn};

use crate::config::SceneSettings;
use crate::render::cube::Transform;
use crate::render::{mirror_blit_rects, GraphicsBackend, MirrorSurface, RenderTarget};
use crate::vr::math::{calc_eye_poses, eye_view_matrix, Projection};
use crate::vr::timing::FrameTimingManager;
use crate::vr::{
    Extent, Eye, EyeRenderDesc, LayerEye, LayerEyeFov, Pose, SubmitStatus, Viewport, VrRuntime,
};

#[cfg(test)]
mod tests;

/// Whether the next frame draws anything. Only a successful submit makes it visible.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Visible,
    Suppressed,
}

impl Visibility {
    pub fn after_submit(status: SubmitStatus) -> Self {
        if status.is_success() {
            Visibility::Visible
        } else {
            Visibility::Suppressed
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramePhase {
    AcquirePose,
    RenderLeftEye,
    RenderRightEye,
    Submit,
    Mirror,
}

impl FramePhase {
    /// The phase after `self`, given the visibility the frame started with.
    pub fn next(self, visibility: Visibility) -> Option<FramePhase> {
        match (self, visibility) {
            (FramePhase::AcquirePose, Visibility::Visible) => Some(FramePhase::RenderLeftEye),
            (FramePhase::AcquirePose, Visibility::Suppressed) => Some(FramePhase::Submit),
            (FramePhase::RenderLeftEye, _) => Some(FramePhase::RenderRightEye),
            (FramePhase::RenderRightEye, _) => Some(FramePhase::Submit),
            (FramePhase::Submit, _) => Some(FramePhase::Mirror),
            (FramePhase::Mirror, _) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FrameReport {
    pub frame_index: u64,
    pub phases: Vec<FramePhase>,
    pub draw_calls: u32,
    pub status: SubmitStatus,
    /// Visibility the next frame will start with.
    pub visibility: Visibility,
}

impl FrameReport {
    pub fn exit_requested(&self) -> bool {
        self.status == SubmitStatus::ExitRequested
    }
}

/// Everything acquired at startup, released in reverse order at shutdown.
#[derive(Debug)]
pub struct StereoResources {
    pub eye_descs: [EyeRenderDesc; 2],
    pub projections: [Projection; 2],
    pub targets: [RenderTarget; 2],
    pub mirror: MirrorSurface,
}

impl StereoResources {
    fn acquire<R: VrRuntime, G: GraphicsBackend>(
        runtime: &R,
        graphics: &mut G,
        settings: &SceneSettings,
        mirror_extent: Extent,
    ) -> Result<Self> {
        let eye_descs =
            Eye::ALL.map(|eye| runtime.eye_render_desc(eye, runtime.default_eye_fov(eye)));
        let projections =
            eye_descs.map(|desc| Projection::from_fov(&desc.fov, settings.near, settings.far));
        let texture_count = runtime.swap_texture_count();

        let create = |graphics: &mut G, eye: Eye| {
            let fov = eye_descs[eye.index()].fov;
            let extent = runtime.fov_texture_size(eye, fov, settings.pixel_density);
            info!(
                "{:?} eye target: {}x{}, {} textures",
                eye, extent.width, extent.height, texture_count
            );
            graphics.create_target(eye, extent, texture_count)
        };

        let left = create(graphics, Eye::Left)?;
        let right = match create(graphics, Eye::Right) {
            Ok(target) => target,
            Err(err) => {
                graphics.destroy_target(&left);
                return Err(err);
            }
        };
        let mirror = match graphics.create_mirror(mirror_extent) {
            Ok(mirror) => mirror,
            Err(err) => {
                graphics.destroy_target(&right);
                graphics.destroy_target(&left);
                return Err(err);
            }
        };

        Ok(Self {
            eye_descs,
            projections,
            targets: [left, right],
            mirror,
        })
    }
}

/// Drives one stereo frame per call to [`FrameLoop::tick`].
pub struct FrameLoop<R: VrRuntime, G: GraphicsBackend> {
    runtime: R,
    graphics: G,
    resources: StereoResources,
    settings: SceneSettings,
    layer: LayerEyeFov,
    visibility: Visibility,
    elapsed: f32,
    frame_index: u64,
    timing: FrameTimingManager,
    torn_down: bool,
}

impl<R: VrRuntime, G: GraphicsBackend> FrameLoop<R, G> {
    /// Acquires the eye targets and mirror. On failure everything already
    /// acquired is released, including the graphics program and the runtime.
    pub fn new(
        mut runtime: R,
        mut graphics: G,
        settings: SceneSettings,
        mirror_extent: Extent,
    ) -> Result<Self> {
        info!("HMD: {}", runtime.info().product_name);
        info!("Runtime version: {}", runtime.info().runtime_version);

        let acquired = StereoResources::acquire(&runtime, &mut graphics, &settings, mirror_extent);
        let resources = match acquired {
            Ok(resources) => resources,
            Err(err) => {
                graphics.release();
                runtime.shutdown();
                return Err(err);
            }
        };

        let layer = LayerEyeFov::new(graphics.texture_origin());
        runtime.recenter_pose();

        Ok(Self {
            runtime,
            graphics,
            resources,
            settings,
            layer,
            visibility: Visibility::Visible,
            elapsed: 0.0,
            frame_index: 0,
            timing: FrameTimingManager::new(90),
            torn_down: false,
        })
    }

    pub fn tick(&mut self, dt: f32) -> FrameReport {
        self.elapsed += dt;
        let frame_index = self.frame_index;
        let started = self.visibility;
        let world = Transform::spinning_cube(self.elapsed).to_matrix();

        let mut report = FrameReport {
            frame_index,
            phases: Vec::with_capacity(5),
            draw_calls: 0,
            status: SubmitStatus::Success,
            visibility: started,
        };
        let mut eye_poses = [Pose::IDENTITY; 2];

        let mut phase = Some(FramePhase::AcquirePose);
        while let Some(current) = phase {
            trace!("frame {}: {:?}", frame_index, current);
            report.phases.push(current);
            match current {
                FramePhase::AcquirePose => eye_poses = self.acquire_pose(frame_index),
                FramePhase::RenderLeftEye => {
                    report.draw_calls += self.render_eye(Eye::Left, &eye_poses[0], &world);
                }
                FramePhase::RenderRightEye => {
                    report.draw_calls += self.render_eye(Eye::Right, &eye_poses[1], &world);
                }
                FramePhase::Submit => report.status = self.submit(frame_index, &eye_poses),
                FramePhase::Mirror => self.mirror(),
            }
            phase = current.next(started);
        }

        self.timing.end_frame();
        self.frame_index += 1;
        report.visibility = self.visibility;
        report
    }

    fn acquire_pose(&mut self, frame_index: u64) -> [Pose; 2] {
        let predicted = self.runtime.predicted_display_time(frame_index);
        self.timing.begin_frame(frame_index, predicted);
        self.layer.sensor_sample_time = self.runtime.time_in_seconds();
        let tracking = self.runtime.tracking_state(predicted);
        calc_eye_poses(&tracking.head_pose, &self.resources.eye_descs)
    }

    fn render_eye(&mut self, eye: Eye, pose: &Pose, world: &Mat4) -> u32 {
        let i = eye.index();
        let target = &mut self.resources.targets[i];
        target.swap.advance();
        self.graphics.bind(target);

        let view = eye_view_matrix(self.settings.player_position, pose);
        let view_projection = self.resources.projections[i].matrix() * view;
        self.graphics.draw(&view_projection, world);

        self.graphics.unbind(target);
        1
    }

    fn submit(&mut self, frame_index: u64, eye_poses: &[Pose; 2]) -> SubmitStatus {
        for eye in Eye::ALL {
            let i = eye.index();
            let target = &self.resources.targets[i];
            self.layer.eyes[i] = LayerEye {
                texture: Some(target.current_texture()),
                viewport: Viewport::covering(target.extent),
                fov: self.resources.eye_descs[i].fov,
                render_pose: eye_poses[i],
            };
        }

        let status = self.runtime.submit_frame(frame_index, &self.layer, &mut self.graphics);
        let next = Visibility::after_submit(status);
        if next != self.visibility {
            match next {
                Visibility::Visible => info!("Frame {} accepted, rendering resumed", frame_index),
                Visibility::Suppressed => {
                    warn!("Frame {} not shown ({:?}), skipping rendering", frame_index, status)
                }
            }
        }
        self.visibility = next;
        status
    }

    fn mirror(&mut self) {
        let mirror = self.resources.mirror;
        let (src, dst) = mirror_blit_rects(mirror.extent);
        self.graphics.blit(&mirror, src, dst);
        self.graphics.present();
    }

    pub fn visibility(&self) -> Visibility {
        self.visibility
    }

    pub fn frame_index(&self) -> u64 {
        self.frame_index
    }

    pub fn target(&self, eye: Eye) -> &RenderTarget {
        &self.resources.targets[eye.index()]
    }

    pub fn layer(&self) -> &LayerEyeFov {
        &self.layer
    }

    pub fn runtime(&self) -> &R {
        &self.runtime
    }

    pub fn graphics_mut(&mut self) -> &mut G {
        &mut self.graphics
    }

    /// Releases eye targets, mirror, GPU buffers, shader program, then the
    /// runtime. The layer goes last, with `self`.
    pub fn shutdown(mut self) {
        self.teardown();
    }

    fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        debug!("Tearing down after {} frames", self.frame_index);

        for target in &self.resources.targets {
            self.graphics.destroy_target(target);
        }
        self.graphics.destroy_mirror(&self.resources.mirror);
        self.graphics.release();
        self.runtime.shutdown();
    }
}

impl<R: VrRuntime, G: GraphicsBackend> Drop for FrameLoop<R, G> {
    fn drop(&mut self) {
        self.teardown();
    }
}
