use std::time::{Duration, Instant};

use anyhow::Result;
use ash::vk;
use ash::vk::Handle;
use glam::{Quat, Vec3};
use log::{debug, info, warn};
use openxr as xr;

use super::vulkan::{choose_swapchain_format, VulkanContext};
use super::{
    EyeRenderDesc, Extent, Eye, FovPort, HmdInfo, LayerEyeFov, Pose, StartupError, SubmitStatus,
    TextureOrigin, TrackingState, VrRuntime,
};
use crate::render::EyeImageSource;

const VIEW_TYPE: xr::ViewConfigurationType = xr::ViewConfigurationType::PRIMARY_STEREO;
const CALIBRATION_TIMEOUT: Duration = Duration::from_secs(5);
const FALLBACK_FRAME_PERIOD: f64 = 1.0 / 90.0;
const FALLBACK_IPD: f32 = 0.064;
/// Textures per eye on the rendering side. Swapchain images are separate.
const RENDER_TEXTURE_COUNT: usize = 3;

pub fn seconds_from_time(time: xr::Time) -> f64 {
    time.as_nanos() as f64 * 1e-9
}

fn startup_error(context: &str, err: xr::sys::Result) -> StartupError {
    StartupError::RuntimeUnavailable(format!("{}: {}", context, err))
}

struct EyeSwapchain {
    handle: xr::Swapchain<xr::Vulkan>,
    images: Vec<vk::Image>,
    extent: Extent,
}

/// Session objects, dropped swapchains first and the session last.
struct HmdSession {
    swapchains: [Option<EyeSwapchain>; 2],
    view_space: xr::Space,
    local_space: xr::Space,
    frame_stream: xr::FrameStream<xr::Vulkan>,
    frame_waiter: xr::FrameWaiter,
    session: xr::Session<xr::Vulkan>,
}

/// A frame between `xrBeginFrame` and `xrEndFrame`.
struct BegunFrame {
    frame_index: u64,
    state: xr::FrameState,
    seconds: f64,
}

/// OpenXR runtime over a Vulkan session.
///
/// Eye images are read back from the renderer and copied into one swapchain
/// per eye. Swapchains are created at the first submit, sized to the layer's
/// viewports.
pub struct OpenXrRuntime {
    hmd: Option<HmdSession>,
    vulkan: Option<VulkanContext>,
    instance: Option<xr::Instance>,
    system: xr::SystemId,
    info: HmdInfo,
    views: Vec<xr::ViewConfigurationView>,
    fovs: [FovPort; 2],
    /// Each eye relative to the head; canted displays carry a rotation.
    eye_poses: [Pose; 2],
    swapchain_format: (vk::Format, bool),
    session_running: bool,
    exit_requested: bool,
    frame: Option<BegunFrame>,
    start: Instant,
    last_pose: Pose,
}

impl OpenXrRuntime {
    pub fn new() -> Result<Self, StartupError> {
        let entry = xr::Entry::linked();

        let available_extensions = entry
            .enumerate_extensions()
            .map_err(|err| startup_error("Failed to enumerate OpenXR extensions", err))?;
        if !available_extensions.khr_vulkan_enable2 {
            return Err(StartupError::RuntimeUnavailable(
                "OpenXR Vulkan support not available".to_string(),
            ));
        }
        let mut enabled_extensions = xr::ExtensionSet::default();
        enabled_extensions.khr_vulkan_enable2 = true;

        let app_info = xr::ApplicationInfo {
            application_name: env!("CARGO_PKG_NAME"),
            application_version: 0,
            engine_name: env!("CARGO_PKG_NAME"),
            engine_version: 0,
        };
        let instance = entry
            .create_instance(&app_info, &enabled_extensions, &[])
            .map_err(|err| startup_error("Failed to create OpenXR instance", err))?;

        let properties = instance
            .properties()
            .map_err(|err| startup_error("Failed to query runtime properties", err))?;
        let runtime_version = format!(
            "{} {}.{}.{}",
            properties.runtime_name,
            properties.runtime_version.major(),
            properties.runtime_version.minor(),
            properties.runtime_version.patch()
        );

        let system = match instance.system(xr::FormFactor::HEAD_MOUNTED_DISPLAY) {
            Ok(system) => system,
            Err(xr::sys::Result::ERROR_FORM_FACTOR_UNAVAILABLE) => {
                return Err(StartupError::HmdNotDetected)
            }
            Err(err) => return Err(startup_error("Failed to get system ID", err)),
        };
        let system_properties = instance
            .system_properties(system)
            .map_err(|err| startup_error("Failed to query HMD properties", err))?;
        if system_properties.system_name.trim().is_empty() {
            return Err(StartupError::HmdDisabled);
        }

        let views = instance
            .enumerate_view_configuration_views(system, VIEW_TYPE)
            .map_err(|err| startup_error("Failed to get view configuration", err))?;
        if views.len() < 2 {
            return Err(StartupError::RuntimeUnavailable(format!(
                "Expected two stereo views, runtime reports {}",
                views.len()
            )));
        }

        let vulkan = VulkanContext::new(&instance, system)
            .map_err(|err| StartupError::RuntimeUnavailable(err.to_string()))?;

        let (session, frame_waiter, frame_stream) = unsafe {
            instance
                .create_session::<xr::Vulkan>(system, &vulkan.session_create_info())
                .map_err(|err| startup_error("Failed to create session", err))?
        };

        let formats = session
            .enumerate_swapchain_formats()
            .map_err(|err| startup_error("Failed to get swapchain formats", err))?;
        let swapchain_format = choose_swapchain_format(&formats).ok_or_else(|| {
            StartupError::RuntimeUnavailable("No sRGB RGBA8 swapchain format available".to_string())
        })?;

        let local_space = session
            .create_reference_space(xr::ReferenceSpaceType::LOCAL, xr::Posef::IDENTITY)
            .map_err(|err| startup_error("Failed to create reference space", err))?;
        let view_space = session
            .create_reference_space(xr::ReferenceSpaceType::VIEW, xr::Posef::IDENTITY)
            .map_err(|err| startup_error("Failed to create view space", err))?;

        info!(
            "OpenXR system '{}' ({}x{} recommended per eye)",
            system_properties.system_name,
            views[0].recommended_image_rect_width,
            views[0].recommended_image_rect_height
        );

        let fallback_fov = FovPort::symmetric(100f32.to_radians(), 100f32.to_radians());
        let mut runtime = Self {
            hmd: Some(HmdSession {
                swapchains: [None, None],
                view_space,
                local_space,
                frame_stream,
                frame_waiter,
                session,
            }),
            vulkan: Some(vulkan),
            instance: Some(instance),
            system,
            info: HmdInfo {
                product_name: system_properties.system_name,
                runtime_version,
            },
            views,
            fovs: [fallback_fov; 2],
            eye_poses: [
                Pose::new(Quat::IDENTITY, Vec3::new(-FALLBACK_IPD * 0.5, 0.0, 0.0)),
                Pose::new(Quat::IDENTITY, Vec3::new(FALLBACK_IPD * 0.5, 0.0, 0.0)),
            ],
            swapchain_format,
            session_running: false,
            exit_requested: false,
            frame: None,
            start: Instant::now(),
            last_pose: Pose::IDENTITY,
        };

        if let Err(err) = runtime.calibrate() {
            warn!("Using default optics, calibration failed: {}", err);
        }
        Ok(runtime)
    }

    /// Waits for the session to start, then reads per-eye FOV and offsets
    /// from one frame.
    fn calibrate(&mut self) -> Result<()> {
        let deadline = Instant::now() + CALIBRATION_TIMEOUT;
        while !self.session_running && !self.exit_requested && Instant::now() < deadline {
            self.poll_events();
            std::thread::sleep(Duration::from_millis(10));
        }
        if !self.session_running {
            return Err(anyhow::anyhow!("session did not become ready"));
        }
        let hmd = self
            .hmd
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("session already released"))?;

        let state = hmd
            .frame_waiter
            .wait()
            .map_err(|err| anyhow::anyhow!("Failed to wait for frame: {}", err))?;
        hmd.frame_stream
            .begin()
            .map_err(|err| anyhow::anyhow!("Failed to begin frame: {}", err))?;
        let located = hmd
            .session
            .locate_views(VIEW_TYPE, state.predicted_display_time, &hmd.view_space);
        hmd.frame_stream
            .end(state.predicted_display_time, xr::EnvironmentBlendMode::OPAQUE, &[])
            .map_err(|err| anyhow::anyhow!("Failed to end frame: {}", err))?;

        let (_, views) = located.map_err(|err| anyhow::anyhow!("Failed to locate views: {}", err))?;
        if views.len() < 2 {
            return Err(anyhow::anyhow!("runtime located {} views", views.len()));
        }
        for eye in Eye::ALL {
            let view = &views[eye.index()];
            self.fovs[eye.index()] = FovPort::from(view.fov);
            self.eye_poses[eye.index()] = Pose::from(view.pose);
        }
        debug!(
            "Calibrated eye poses {:?} / {:?}",
            self.eye_poses[0], self.eye_poses[1]
        );
        Ok(())
    }

    fn poll_events(&mut self) {
        let (Some(instance), Some(hmd)) = (&self.instance, &mut self.hmd) else {
            return;
        };
        let mut buffer = xr::EventDataBuffer::new();
        loop {
            let event = match instance.poll_event(&mut buffer) {
                Ok(Some(event)) => event,
                Ok(None) => break,
                Err(err) => {
                    warn!("Failed to poll OpenXR events: {}", err);
                    break;
                }
            };
            match event {
                xr::Event::SessionStateChanged(change) => {
                    let state = change.state();
                    info!("Session state changed to: {:?}", state);
                    match state {
                        xr::SessionState::READY => match hmd.session.begin(VIEW_TYPE) {
                            Ok(_) => self.session_running = true,
                            Err(err) => warn!("Failed to begin session: {}", err),
                        },
                        xr::SessionState::STOPPING => {
                            self.session_running = false;
                            if let Err(err) = hmd.session.end() {
                                warn!("Failed to end session: {}", err);
                            }
                        }
                        xr::SessionState::EXITING | xr::SessionState::LOSS_PENDING => {
                            self.session_running = false;
                            self.exit_requested = true;
                        }
                        _ => {}
                    }
                }
                xr::Event::InstanceLossPending(_) => {
                    self.session_running = false;
                    self.exit_requested = true;
                }
                _ => {}
            }
        }
    }

    /// Ends a begun frame without layers.
    fn end_empty(&mut self, frame: &BegunFrame) {
        if let Some(hmd) = &mut self.hmd {
            if let Err(err) =
                hmd.frame_stream
                    .end(frame.state.predicted_display_time, xr::EnvironmentBlendMode::OPAQUE, &[])
            {
                warn!("Failed to end frame {}: {}", frame.frame_index, err);
            }
        }
    }

    fn time_for(&self, seconds: f64) -> xr::Time {
        match &self.frame {
            Some(frame) if frame.seconds == seconds => frame.state.predicted_display_time,
            _ => xr::Time::from_nanos((seconds * 1e9) as i64),
        }
    }

    fn submit_layer(
        &mut self,
        frame: &BegunFrame,
        layer: &LayerEyeFov,
        images: &mut dyn EyeImageSource,
    ) -> Result<()> {
        let (Some(hmd), Some(vulkan)) = (&mut self.hmd, &mut self.vulkan) else {
            return Err(anyhow::anyhow!("session already released"));
        };
        let (format, swap_rb) = self.swapchain_format;
        let flip = layer.origin == TextureOrigin::BottomLeft;

        for eye in Eye::ALL {
            let slot = layer.eye(eye);
            let texture = slot
                .texture
                .ok_or_else(|| anyhow::anyhow!("{:?} eye has no texture", eye))?;
            let extent = Extent::new(slot.viewport.width, slot.viewport.height);
            let image = images
                .read_eye_image(texture)
                .ok_or_else(|| anyhow::anyhow!("Failed to read {:?} eye image", eye))?;

            let swapchain = &mut hmd.swapchains[eye.index()];
            if swapchain.as_ref().map(|s| s.extent) != Some(extent) {
                *swapchain = Some(create_eye_swapchain(&hmd.session, format, extent)?);
                info!("{:?} eye swapchain: {}x{}", eye, extent.width, extent.height);
            }
            let Some(swapchain) = swapchain.as_mut() else {
                continue;
            };

            let index = swapchain
                .handle
                .acquire_image()
                .map_err(|err| anyhow::anyhow!("Failed to acquire swapchain image: {}", err))?;
            swapchain
                .handle
                .wait_image(xr::Duration::INFINITE)
                .map_err(|err| anyhow::anyhow!("Failed to wait for swapchain image: {}", err))?;
            let uploaded = swapchain
                .images
                .get(index as usize)
                .copied()
                .ok_or_else(|| anyhow::anyhow!("Swapchain image {} out of range", index))
                .and_then(|target| {
                    vulkan.upload_rgba(
                        target,
                        extent.width.min(image.width),
                        extent.height.min(image.height),
                        &image.rgba,
                        flip,
                        swap_rb,
                    )
                });
            // Released even when the upload failed; an acquired image must go back.
            swapchain
                .handle
                .release_image()
                .map_err(|err| anyhow::anyhow!("Failed to release swapchain image: {}", err))?;
            uploaded?;
        }

        let [Some(left), Some(right)] = &hmd.swapchains else {
            return Err(anyhow::anyhow!("Eye swapchains missing"));
        };
        let projection_views = [
            projection_view(left, layer, Eye::Left),
            projection_view(right, layer, Eye::Right),
        ];
        let projection = xr::CompositionLayerProjection::new()
            .space(&hmd.local_space)
            .views(&projection_views);
        hmd.frame_stream
            .end(
                frame.state.predicted_display_time,
                xr::EnvironmentBlendMode::OPAQUE,
                &[&projection],
            )
            .map_err(|err| anyhow::anyhow!("Failed to submit frame: {}", err))?;
        Ok(())
    }
}

fn create_eye_swapchain(
    session: &xr::Session<xr::Vulkan>,
    format: vk::Format,
    extent: Extent,
) -> Result<EyeSwapchain> {
    let handle = session
        .create_swapchain(&xr::SwapchainCreateInfo {
            create_flags: xr::SwapchainCreateFlags::EMPTY,
            usage_flags: xr::SwapchainUsageFlags::COLOR_ATTACHMENT
                | xr::SwapchainUsageFlags::TRANSFER_DST,
            format: format.as_raw() as u32,
            sample_count: 1,
            width: extent.width,
            height: extent.height,
            face_count: 1,
            array_size: 1,
            mip_count: 1,
        })
        .map_err(|err| anyhow::anyhow!("Failed to create swapchain: {}", err))?;
    let images = handle
        .enumerate_images()
        .map_err(|err| anyhow::anyhow!("Failed to enumerate swapchain images: {}", err))?
        .into_iter()
        .map(vk::Image::from_raw)
        .collect();
    Ok(EyeSwapchain { handle, images, extent })
}

fn projection_view<'a>(
    swapchain: &'a EyeSwapchain,
    layer: &LayerEyeFov,
    eye: Eye,
) -> xr::CompositionLayerProjectionView<'a, xr::Vulkan> {
    let slot = layer.eye(eye);
    xr::CompositionLayerProjectionView::new()
        .pose(slot.render_pose.into())
        .fov(slot.fov.into())
        .sub_image(
            xr::SwapchainSubImage::new()
                .swapchain(&swapchain.handle)
                .image_array_index(0)
                .image_rect(xr::Rect2Di {
                    offset: xr::Offset2Di { x: 0, y: 0 },
                    extent: xr::Extent2Di {
                        width: swapchain.extent.width as i32,
                        height: swapchain.extent.height as i32,
                    },
                }),
        )
}

impl VrRuntime for OpenXrRuntime {
    fn info(&self) -> &HmdInfo {
        &self.info
    }

    fn default_eye_fov(&self, eye: Eye) -> FovPort {
        self.fovs[eye.index()]
    }

    fn eye_render_desc(&self, eye: Eye, fov: FovPort) -> EyeRenderDesc {
        EyeRenderDesc {
            eye,
            fov,
            hmd_to_eye_offset: self.eye_poses[eye.index()].position,
            hmd_to_eye_orientation: self.eye_poses[eye.index()].orientation,
        }
    }

    fn fov_texture_size(&self, eye: Eye, fov: FovPort, pixel_density: f32) -> Extent {
        let view = &self.views[eye.index()];
        let default = self.fovs[eye.index()];
        let scale_x = fov.horizontal_tan() / default.horizontal_tan();
        let scale_y = fov.vertical_tan() / default.vertical_tan();
        let width = view.recommended_image_rect_width as f32 * scale_x * pixel_density;
        let height = view.recommended_image_rect_height as f32 * scale_y * pixel_density;
        let (width, height) = (width.round() as u32, height.round() as u32);
        Extent::new(
            width.clamp(1, view.max_image_rect_width.max(1)),
            height.clamp(1, view.max_image_rect_height.max(1)),
        )
    }

    fn swap_texture_count(&self) -> usize {
        RENDER_TEXTURE_COUNT
    }

    fn predicted_display_time(&mut self, frame_index: u64) -> f64 {
        self.poll_events();
        if let Some(stale) = self.frame.take() {
            debug!("Frame {} was never submitted, ending it empty", stale.frame_index);
            self.end_empty(&stale);
        }

        let fallback = self.time_in_seconds() + FALLBACK_FRAME_PERIOD;
        if !self.session_running {
            return fallback;
        }
        let Some(hmd) = &mut self.hmd else {
            return fallback;
        };

        let state = match hmd.frame_waiter.wait() {
            Ok(state) => state,
            Err(err) => {
                warn!("Failed to wait for frame {}: {}", frame_index, err);
                return fallback;
            }
        };
        if let Err(err) = hmd.frame_stream.begin() {
            warn!("Failed to begin frame {}: {}", frame_index, err);
            return fallback;
        }

        let seconds = seconds_from_time(state.predicted_display_time);
        self.frame = Some(BegunFrame {
            frame_index,
            state,
            seconds,
        });
        seconds
    }

    fn time_in_seconds(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }

    fn tracking_state(&mut self, at: f64) -> TrackingState {
        let time = self.time_for(at);
        if let Some(hmd) = &self.hmd {
            match hmd.view_space.locate(&hmd.local_space, time) {
                Ok(location) => {
                    let valid = xr::SpaceLocationFlags::ORIENTATION_VALID
                        | xr::SpaceLocationFlags::POSITION_VALID;
                    if location.location_flags.contains(valid) {
                        self.last_pose = Pose::from(location.pose);
                    }
                }
                Err(err) => debug!("Head pose unavailable: {}", err),
            }
        }
        TrackingState {
            head_pose: self.last_pose,
            sample_time: at,
        }
    }

    fn submit_frame(
        &mut self,
        frame_index: u64,
        layer: &LayerEyeFov,
        images: &mut dyn EyeImageSource,
    ) -> SubmitStatus {
        let Some(frame) = self.frame.take() else {
            return if self.exit_requested {
                SubmitStatus::ExitRequested
            } else {
                SubmitStatus::NotVisible
            };
        };
        if frame.frame_index != frame_index {
            debug!("Submitting frame {} against begun frame {}", frame_index, frame.frame_index);
        }

        if !frame.state.should_render {
            self.end_empty(&frame);
            return SubmitStatus::NotVisible;
        }

        match self.submit_layer(&frame, layer, images) {
            Ok(()) => SubmitStatus::Success,
            Err(err) => {
                warn!("Frame {} not submitted: {}", frame_index, err);
                self.end_empty(&frame);
                SubmitStatus::DisplayLost
            }
        }
    }

    fn recenter_pose(&mut self) {
        debug!("Recentering is left to the OpenXR runtime's own controls");
    }

    fn shutdown(&mut self) {
        if let Some(frame) = self.frame.take() {
            self.end_empty(&frame);
        }
        if let Some(hmd) = self.hmd.take() {
            if self.session_running {
                if let Err(err) = hmd.session.request_exit() {
                    debug!("Failed to request session exit: {}", err);
                }
            }
            drop(hmd);
            self.session_running = false;
            info!("OpenXR session released");
        }
        self.vulkan = None;
        if self.instance.take().is_some() {
            debug!("OpenXR instance released ({:?})", self.system);
        }
    }
}

impl Drop for OpenXrRuntime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_predicted_time_converts_to_seconds() {
        let time = xr::Time::from_nanos(1_500_000_000);
        assert!((seconds_from_time(time) - 1.5).abs() < 1e-12);
    }

    #[test]
    fn test_runtime_failures_carry_context() {
        let err = startup_error("Failed to create session", xr::sys::Result::ERROR_RUNTIME_FAILURE);
        let message = err.to_string();
        assert!(message
            .starts_with("Failed to initialize the VR runtime: Failed to create session"));
        assert_eq!(err.title(), "Runtime error");
    }

    #[test]
    #[serial]
    fn test_startup_fails_cleanly_or_reports_hmd() {
        // Depends on the machine: without a runtime or headset this must be a
        // startup error rather than a panic.
        match OpenXrRuntime::new() {
            Ok(mut runtime) => {
                assert!(!runtime.info().product_name.is_empty());
                assert_eq!(runtime.swap_texture_count(), RENDER_TEXTURE_COUNT);
                runtime.shutdown();
                runtime.shutdown();
            }
            Err(err) => assert!(!err.to_string().is_empty()),
        }
    }
}
