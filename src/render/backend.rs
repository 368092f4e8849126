use std::collections::HashMap;
use std::sync::{mpsc, Arc};

use anyhow::Result;
use glam::Mat4;
use log::{debug, info, trace, warn};
use wgpu::util::DeviceExt;
use winit::window::Window;

use super::cube::{CubeVertexLayout, CUBE_COLORS, CUBE_INDICES, CUBE_POSITIONS};
use super::{
    blit_mapping, BlitMapping, BlitRect, EyeImage, EyeImageSource, GraphicsBackend, MirrorSurface,
    RenderTarget, TargetId,
};
use crate::vr::{Extent, Eye, TextureOrigin, TextureRef};

pub const EYE_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8UnormSrgb;
pub const DEPTH_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Depth32Float;

const CLEAR_COLOR: wgpu::Color = wgpu::Color { r: 0.0, g: 0.0, b: 0.0, a: 1.0 };

#[repr(C)]
#[derive(Debug, Copy, Clone, bytemuck::Pod, bytemuck::Zeroable)]
struct CubeUniform {
    view_projection: [[f32; 4]; 4],
    world: [[f32; 4]; 4],
}

impl CubeUniform {
    fn new(view_projection: &Mat4, world: &Mat4) -> Self {
        Self {
            view_projection: view_projection.to_cols_array_2d(),
            world: world.to_cols_array_2d(),
        }
    }
}

#[repr(C)]
#[derive(Debug, Copy, Clone, bytemuck::Pod, bytemuck::Zeroable)]
struct BlitUniform {
    uv_origin: [f32; 2],
    uv_span: [f32; 2],
}

struct CubeMesh {
    positions: wgpu::Buffer,
    colors: wgpu::Buffer,
    indices: wgpu::Buffer,
    index_count: u32,
}

impl CubeMesh {
    fn new(device: &wgpu::Device) -> Self {
        let positions = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Cube Positions"),
            contents: bytemuck::cast_slice(&CUBE_POSITIONS),
            usage: wgpu::BufferUsages::VERTEX,
        });
        let colors = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Cube Colors"),
            contents: bytemuck::cast_slice(&CUBE_COLORS),
            usage: wgpu::BufferUsages::VERTEX,
        });
        let indices = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Cube Indices"),
            contents: bytemuck::cast_slice(&CUBE_INDICES),
            usage: wgpu::BufferUsages::INDEX,
        });
        Self {
            positions,
            colors,
            indices,
            index_count: CUBE_INDICES.len() as u32,
        }
    }

    fn destroy(&self) {
        self.positions.destroy();
        self.colors.destroy();
        self.indices.destroy();
    }
}

struct CubeProgram {
    pipeline: wgpu::RenderPipeline,
    bind_group_layout: wgpu::BindGroupLayout,
}

struct BlitProgram {
    module: wgpu::ShaderModule,
    layout: wgpu::PipelineLayout,
    bind_group_layout: wgpu::BindGroupLayout,
    sampler: wgpu::Sampler,
    /// Renders into the mirror texture.
    mirror_pipeline: wgpu::RenderPipeline,
}

struct GpuTarget {
    extent: Extent,
    color: Vec<wgpu::Texture>,
    color_views: Vec<wgpu::TextureView>,
    depth: wgpu::Texture,
    depth_view: wgpu::TextureView,
}

struct GpuMirror {
    extent: Extent,
    texture: wgpu::Texture,
    view: wgpu::TextureView,
}

struct WindowSurface {
    surface: wgpu::Surface<'static>,
    config: wgpu::SurfaceConfiguration,
    blit_pipeline: wgpu::RenderPipeline,
}

/// Draws recorded between `bind` and `unbind`.
struct PendingPass {
    target: TargetId,
    index: usize,
    draws: Vec<CubeUniform>,
}

/// wgpu renderer for the eye targets, the mirror texture and the window.
///
/// Eye passes are recorded on `bind` and `draw` and encoded on `unbind`, which
/// also copies the finished eye into its half of the mirror.
pub struct WgpuBackend {
    device: wgpu::Device,
    queue: wgpu::Queue,
    window: Option<WindowSurface>,
    mesh: Option<CubeMesh>,
    cube_program: Option<CubeProgram>,
    blit: BlitProgram,
    targets: HashMap<TargetId, GpuTarget>,
    mirror: Option<GpuMirror>,
    pending: Option<PendingPass>,
    frame: Option<wgpu::SurfaceTexture>,
    next_id: u32,
}

impl WgpuBackend {
    /// Renders to `window`, presenting with vsync only when asked to.
    pub fn new(window: Arc<Window>, vsync: bool) -> Result<Self> {
        let size = window.inner_size();
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::PRIMARY,
            ..Default::default()
        });

        let surface = instance
            .create_surface(window)
            .map_err(|e| anyhow::anyhow!("Failed to create surface: {}", e))?;

        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: Some(&surface),
            force_fallback_adapter: false,
        }))
        .ok_or_else(|| anyhow::anyhow!("Failed to find appropriate adapter"))?;
        log_adapter(&adapter);

        let (device, queue) = request_device(&adapter)?;

        let surface_caps = surface.get_capabilities(&adapter);
        let format = surface_caps
            .formats
            .iter()
            .copied()
            .find(|f| f.is_srgb())
            .or_else(|| surface_caps.formats.first().copied())
            .ok_or_else(|| anyhow::anyhow!("Surface reports no supported formats"))?;
        let present_mode = choose_present_mode(vsync, &surface_caps.present_modes);
        info!("Surface format {:?}, present mode {:?}", format, present_mode);

        let config = wgpu::SurfaceConfiguration {
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            format,
            width: size.width.max(1),
            height: size.height.max(1),
            present_mode,
            alpha_mode: surface_caps
                .alpha_modes
                .first()
                .copied()
                .unwrap_or(wgpu::CompositeAlphaMode::Auto),
            view_formats: vec![],
            desired_maximum_frame_latency: 2,
        };
        surface.configure(&device, &config);

        let mut backend = Self::with_device(device, queue)?;
        let blit_pipeline = backend
            .blit
            .create_pipeline(&backend.device, format, "Window Blit Pipeline");
        backend.window = Some(WindowSurface {
            surface,
            config,
            blit_pipeline,
        });
        Ok(backend)
    }

    /// Renders offscreen only. Blits to the window are skipped.
    pub fn headless() -> Result<Self> {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor::default());
        let adapter =
            pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions::default()))
                .ok_or_else(|| anyhow::anyhow!("Failed to find appropriate adapter"))?;
        log_adapter(&adapter);
        let (device, queue) = request_device(&adapter)?;
        Self::with_device(device, queue)
    }

    fn with_device(device: wgpu::Device, queue: wgpu::Queue) -> Result<Self> {
        let blit = BlitProgram::new(&device)?;
        let cube_program = create_cube_program(&device);
        let mesh = CubeMesh::new(&device);

        Ok(Self {
            device,
            queue,
            window: None,
            mesh: Some(mesh),
            cube_program,
            blit,
            targets: HashMap::new(),
            mirror: None,
            pending: None,
            frame: None,
            next_id: 0,
        })
    }

    /// Follows the window size. The mirror texture keeps its startup size.
    pub fn resize_surface(&mut self, width: u32, height: u32) {
        if width == 0 || height == 0 {
            return;
        }
        if let Some(window) = &mut self.window {
            window.config.width = width;
            window.config.height = height;
            window.surface.configure(&self.device, &window.config);
        }
    }

    fn encode_eye_pass(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        target: &GpuTarget,
        color_view: &wgpu::TextureView,
        draws: &[CubeUniform],
    ) {
        let drawable = match (&self.cube_program, &self.mesh) {
            (Some(program), Some(mesh)) => Some((program, mesh)),
            _ => None,
        };

        // Bind groups must outlive the pass that uses them.
        let bind_groups: Vec<wgpu::BindGroup> = match drawable {
            Some((program, _)) => draws
                .iter()
                .map(|uniform| {
                    let buffer = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                        label: Some("Cube Uniform Buffer"),
                        contents: bytemuck::cast_slice(&[*uniform]),
                        usage: wgpu::BufferUsages::UNIFORM,
                    });
                    self.device.create_bind_group(&wgpu::BindGroupDescriptor {
                        label: Some("Cube Bind Group"),
                        layout: &program.bind_group_layout,
                        entries: &[wgpu::BindGroupEntry {
                            binding: 0,
                            resource: buffer.as_entire_binding(),
                        }],
                    })
                })
                .collect(),
            None => Vec::new(),
        };

        let mut render_pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("Eye Render Pass"),
            color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                view: color_view,
                resolve_target: None,
                ops: wgpu::Operations {
                    load: wgpu::LoadOp::Clear(CLEAR_COLOR),
                    store: wgpu::StoreOp::Store,
                },
            })],
            depth_stencil_attachment: Some(wgpu::RenderPassDepthStencilAttachment {
                view: &target.depth_view,
                depth_ops: Some(wgpu::Operations {
                    load: wgpu::LoadOp::Clear(1.0),
                    store: wgpu::StoreOp::Store,
                }),
                stencil_ops: None,
            }),
            occlusion_query_set: None,
            timestamp_writes: None,
        });

        let Some((program, mesh)) = drawable else {
            return;
        };
        render_pass.set_viewport(
            0.0,
            0.0,
            target.extent.width as f32,
            target.extent.height as f32,
            0.0,
            1.0,
        );
        render_pass.set_pipeline(&program.pipeline);
        render_pass.set_vertex_buffer(0, mesh.positions.slice(..));
        render_pass.set_vertex_buffer(1, mesh.colors.slice(..));
        render_pass.set_index_buffer(mesh.indices.slice(..), wgpu::IndexFormat::Uint16);
        for bind_group in &bind_groups {
            render_pass.set_bind_group(0, bind_group, &[]);
            render_pass.draw_indexed(0..mesh.index_count, 0, 0..1);
        }
    }

    fn encode_blit(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        pipeline: &wgpu::RenderPipeline,
        source: &wgpu::TextureView,
        destination: &wgpu::TextureView,
        load: wgpu::LoadOp<wgpu::Color>,
        mapping: Option<&BlitMapping>,
    ) {
        let bind_group = mapping.map(|mapping| {
            let uniform = BlitUniform {
                uv_origin: mapping.uv_origin,
                uv_span: mapping.uv_span,
            };
            let buffer = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("Blit Uniform Buffer"),
                contents: bytemuck::cast_slice(&[uniform]),
                usage: wgpu::BufferUsages::UNIFORM,
            });
            self.device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("Blit Bind Group"),
                layout: &self.blit.bind_group_layout,
                entries: &[
                    wgpu::BindGroupEntry {
                        binding: 0,
                        resource: wgpu::BindingResource::TextureView(source),
                    },
                    wgpu::BindGroupEntry {
                        binding: 1,
                        resource: wgpu::BindingResource::Sampler(&self.blit.sampler),
                    },
                    wgpu::BindGroupEntry {
                        binding: 2,
                        resource: buffer.as_entire_binding(),
                    },
                ],
            })
        });

        let mut render_pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("Blit Pass"),
            color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                view: destination,
                resolve_target: None,
                ops: wgpu::Operations {
                    load,
                    store: wgpu::StoreOp::Store,
                },
            })],
            depth_stencil_attachment: None,
            occlusion_query_set: None,
            timestamp_writes: None,
        });

        if let (Some(mapping), Some(bind_group)) = (mapping, &bind_group) {
            let [x, y, width, height] = mapping.viewport;
            render_pass.set_viewport(x, y, width, height, 0.0, 1.0);
            render_pass.set_pipeline(pipeline);
            render_pass.set_bind_group(0, bind_group, &[]);
            render_pass.draw(0..3, 0..1);
        }
    }

    fn read_texture(&self, texture: &wgpu::Texture, extent: Extent) -> Result<EyeImage> {
        let unpadded = extent.width * 4;
        let padded = padded_bytes_per_row(extent.width);
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Eye Readback Buffer"),
            size: padded as wgpu::BufferAddress * extent.height as wgpu::BufferAddress,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });

        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Eye Readback Encoder"),
        });
        encoder.copy_texture_to_buffer(
            wgpu::ImageCopyTexture {
                texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::ImageCopyBuffer {
                buffer: &buffer,
                layout: wgpu::ImageDataLayout {
                    offset: 0,
                    bytes_per_row: Some(padded),
                    rows_per_image: Some(extent.height),
                },
            },
            wgpu::Extent3d {
                width: extent.width,
                height: extent.height,
                depth_or_array_layers: 1,
            },
        );
        self.queue.submit(Some(encoder.finish()));

        let slice = buffer.slice(..);
        let (tx, rx) = mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        self.device.poll(wgpu::Maintain::Wait);
        rx.recv()
            .map_err(|e| anyhow::anyhow!("Readback callback was dropped: {}", e))?
            .map_err(|e| anyhow::anyhow!("Failed to map readback buffer: {}", e))?;

        let rgba = {
            let mapped = slice.get_mapped_range();
            strip_row_padding(&mapped, unpadded, padded, extent.height)
        };
        buffer.unmap();

        Ok(EyeImage {
            width: extent.width,
            height: extent.height,
            rgba,
        })
    }
}

fn request_device(adapter: &wgpu::Adapter) -> Result<(wgpu::Device, wgpu::Queue)> {
    let (device, queue) = pollster::block_on(adapter.request_device(
        &wgpu::DeviceDescriptor {
            label: Some("Stereo Device"),
            required_features: wgpu::Features::empty(),
            required_limits: adapter.limits(),
            memory_hints: Default::default(),
        },
        None,
    ))
    .map_err(|e| anyhow::anyhow!("Failed to create device: {}", e))?;

    device.on_uncaptured_error(Box::new(|error: wgpu::Error| {
        log::error!("wgpu error: {}", error);
    }));
    Ok((device, queue))
}

fn log_adapter(adapter: &wgpu::Adapter) {
    let info = adapter.get_info();
    info!("Using adapter: {} ({:?})", info.name, info.backend);
    debug!("Adapter driver: {} {}", info.driver, info.driver_info);
}

/// Fifo waits for vblank; otherwise the lowest-latency mode on offer.
pub fn choose_present_mode(vsync: bool, available: &[wgpu::PresentMode]) -> wgpu::PresentMode {
    if vsync {
        return wgpu::PresentMode::Fifo;
    }
    [wgpu::PresentMode::Immediate, wgpu::PresentMode::Mailbox]
        .into_iter()
        .find(|mode| available.contains(mode))
        .unwrap_or(wgpu::PresentMode::Fifo)
}

pub fn padded_bytes_per_row(width: u32) -> u32 {
    let unpadded = width * 4;
    let align = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
    unpadded.div_ceil(align) * align
}

fn strip_row_padding(data: &[u8], unpadded: u32, padded: u32, rows: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity((unpadded * rows) as usize);
    for row in data.chunks(padded as usize).take(rows as usize) {
        out.extend_from_slice(&row[..unpadded as usize]);
    }
    out
}

/// Where an eye lands in the mirror: left eye in the left half, right eye in
/// the right half, upright.
pub fn mirror_half(eye: Eye, mirror: Extent) -> BlitMapping {
    let half = mirror.width as f32 * 0.5;
    BlitMapping {
        viewport: [half * eye.index() as f32, 0.0, half, mirror.height as f32],
        uv_origin: [0.0, 0.0],
        uv_span: [1.0, 1.0],
    }
}

fn log_shader_messages(name: &str, module: &wgpu::ShaderModule) {
    let compilation = pollster::block_on(module.get_compilation_info());
    for message in compilation.messages {
        let line = message.location.map(|l| l.line_number).unwrap_or(0);
        let text = &message.message;
        match message.message_type {
            wgpu::CompilationMessageType::Error => warn!("{} shader:{}: {}", name, line, text),
            wgpu::CompilationMessageType::Warning => info!("{} shader:{}: {}", name, line, text),
            wgpu::CompilationMessageType::Info => debug!("{} shader:{}: {}", name, line, text),
        }
    }
}

/// Builds the cube pipeline. A shader that fails to build is logged and
/// leaves the eyes cleared but empty.
fn create_cube_program(device: &wgpu::Device) -> Option<CubeProgram> {
    device.push_error_scope(wgpu::ErrorFilter::Validation);

    let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some("Cube Shader"),
        source: wgpu::ShaderSource::Wgsl(include_str!("shaders/cube.wgsl").into()),
    });
    log_shader_messages("cube", &shader);

    let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
        label: Some("Cube Bind Group Layout"),
        entries: &[wgpu::BindGroupLayoutEntry {
            binding: 0,
            visibility: wgpu::ShaderStages::VERTEX,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Uniform,
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        }],
    });

    let layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
        label: Some("Cube Pipeline Layout"),
        bind_group_layouts: &[&bind_group_layout],
        push_constant_ranges: &[],
    });

    let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
        label: Some("Cube Pipeline"),
        layout: Some(&layout),
        vertex: wgpu::VertexState {
            module: &shader,
            entry_point: Some("vs_main"),
            buffers: &CubeVertexLayout::buffers(),
            compilation_options: wgpu::PipelineCompilationOptions::default(),
        },
        fragment: Some(wgpu::FragmentState {
            module: &shader,
            entry_point: Some("fs_main"),
            targets: &[Some(wgpu::ColorTargetState {
                format: EYE_FORMAT,
                blend: Some(wgpu::BlendState::REPLACE),
                write_mask: wgpu::ColorWrites::ALL,
            })],
            compilation_options: wgpu::PipelineCompilationOptions::default(),
        }),
        primitive: wgpu::PrimitiveState {
            topology: wgpu::PrimitiveTopology::TriangleList,
            strip_index_format: None,
            front_face: wgpu::FrontFace::Ccw,
            cull_mode: None,
            polygon_mode: wgpu::PolygonMode::Fill,
            unclipped_depth: false,
            conservative: false,
        },
        depth_stencil: Some(wgpu::DepthStencilState {
            format: DEPTH_FORMAT,
            depth_write_enabled: true,
            depth_compare: wgpu::CompareFunction::Less,
            stencil: wgpu::StencilState::default(),
            bias: wgpu::DepthBiasState::default(),
        }),
        multisample: wgpu::MultisampleState {
            count: 1,
            mask: !0,
            alpha_to_coverage_enabled: false,
        },
        multiview: None,
        cache: None,
    });

    match pollster::block_on(device.pop_error_scope()) {
        Some(err) => {
            warn!("Cube shader program failed to build: {}", err);
            None
        }
        None => Some(CubeProgram {
            pipeline,
            bind_group_layout,
        }),
    }
}

impl BlitProgram {
    fn new(device: &wgpu::Device) -> Result<Self> {
        device.push_error_scope(wgpu::ErrorFilter::Validation);

        let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Blit Shader"),
            source: wgpu::ShaderSource::Wgsl(include_str!("shaders/blit.wgsl").into()),
        });
        log_shader_messages("blit", &module);

        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Blit Bind Group Layout"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Float { filterable: true },
                        view_dimension: wgpu::TextureViewDimension::D2,
                        multisampled: false,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 2,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
            ],
        });

        let layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Blit Pipeline Layout"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });

        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("Blit Sampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            address_mode_w: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Nearest,
            min_filter: wgpu::FilterMode::Nearest,
            mipmap_filter: wgpu::FilterMode::Nearest,
            ..Default::default()
        });

        let mirror_pipeline =
            build_blit_pipeline(device, &layout, &module, EYE_FORMAT, "Mirror Blit Pipeline");

        if let Some(err) = pollster::block_on(device.pop_error_scope()) {
            return Err(anyhow::anyhow!("Failed to build blit program: {}", err));
        }

        Ok(Self {
            module,
            layout,
            bind_group_layout,
            sampler,
            mirror_pipeline,
        })
    }

    fn create_pipeline(
        &self,
        device: &wgpu::Device,
        format: wgpu::TextureFormat,
        label: &str,
    ) -> wgpu::RenderPipeline {
        build_blit_pipeline(device, &self.layout, &self.module, format, label)
    }
}

fn build_blit_pipeline(
    device: &wgpu::Device,
    layout: &wgpu::PipelineLayout,
    module: &wgpu::ShaderModule,
    format: wgpu::TextureFormat,
    label: &str,
) -> wgpu::RenderPipeline {
    device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
        label: Some(label),
        layout: Some(layout),
        vertex: wgpu::VertexState {
            module,
            entry_point: Some("vs_main"),
            buffers: &[],
            compilation_options: wgpu::PipelineCompilationOptions::default(),
        },
        fragment: Some(wgpu::FragmentState {
            module,
            entry_point: Some("fs_main"),
            targets: &[Some(wgpu::ColorTargetState {
                format,
                blend: Some(wgpu::BlendState::REPLACE),
                write_mask: wgpu::ColorWrites::ALL,
            })],
            compilation_options: wgpu::PipelineCompilationOptions::default(),
        }),
        primitive: wgpu::PrimitiveState::default(),
        depth_stencil: None,
        multisample: wgpu::MultisampleState::default(),
        multiview: None,
        cache: None,
    })
}

fn create_texture(
    device: &wgpu::Device,
    label: &str,
    extent: Extent,
    format: wgpu::TextureFormat,
    usage: wgpu::TextureUsages,
) -> wgpu::Texture {
    device.create_texture(&wgpu::TextureDescriptor {
        label: Some(label),
        size: wgpu::Extent3d {
            width: extent.width,
            height: extent.height,
            depth_or_array_layers: 1,
        },
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format,
        usage,
        view_formats: &[],
    })
}

impl EyeImageSource for WgpuBackend {
    fn read_eye_image(&mut self, texture: TextureRef) -> Option<EyeImage> {
        let target = self.targets.get(&texture.target)?;
        let color = target.color.get(texture.index)?;
        match self.read_texture(color, target.extent) {
            Ok(image) => Some(image),
            Err(err) => {
                warn!("Failed to read back eye texture {:?}: {}", texture, err);
                None
            }
        }
    }
}

impl GraphicsBackend for WgpuBackend {
    fn texture_origin(&self) -> TextureOrigin {
        TextureOrigin::TopLeft
    }

    fn create_target(
        &mut self,
        eye: Eye,
        extent: Extent,
        texture_count: usize,
    ) -> Result<RenderTarget> {
        if extent.is_empty() {
            return Err(anyhow::anyhow!("Failed to create {:?} eye target: empty extent", eye));
        }
        let limit = self.device.limits().max_texture_dimension_2d;
        if extent.width > limit || extent.height > limit {
            return Err(anyhow::anyhow!(
                "Failed to create {:?} eye target: {}x{} exceeds the device limit of {}",
                eye,
                extent.width,
                extent.height,
                limit
            ));
        }

        let id = TargetId(self.next_id);
        self.next_id += 1;
        let target = RenderTarget::new(id, eye, extent, texture_count);

        let color: Vec<wgpu::Texture> = (0..target.swap.texture_count())
            .map(|i| {
                create_texture(
                    &self.device,
                    &format!("{:?} Eye Texture {}", eye, i),
                    extent,
                    EYE_FORMAT,
                    wgpu::TextureUsages::RENDER_ATTACHMENT
                        | wgpu::TextureUsages::TEXTURE_BINDING
                        | wgpu::TextureUsages::COPY_SRC,
                )
            })
            .collect();
        let color_views = color
            .iter()
            .map(|texture| texture.create_view(&wgpu::TextureViewDescriptor::default()))
            .collect();
        let depth = create_texture(
            &self.device,
            &format!("{:?} Eye Depth", eye),
            extent,
            DEPTH_FORMAT,
            wgpu::TextureUsages::RENDER_ATTACHMENT,
        );
        let depth_view = depth.create_view(&wgpu::TextureViewDescriptor::default());

        self.targets.insert(
            id,
            GpuTarget {
                extent,
                color,
                color_views,
                depth,
                depth_view,
            },
        );
        Ok(target)
    }

    fn create_mirror(&mut self, extent: Extent) -> Result<MirrorSurface> {
        if extent.is_empty() {
            return Err(anyhow::anyhow!("Failed to create mirror texture: empty extent"));
        }
        let texture = create_texture(
            &self.device,
            "Mirror Texture",
            extent,
            EYE_FORMAT,
            wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::TEXTURE_BINDING,
        );
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        self.mirror = Some(GpuMirror { extent, texture, view });
        Ok(MirrorSurface { extent })
    }

    fn bind(&mut self, target: &RenderTarget) {
        if self.pending.is_some() {
            warn!("{:?} eye bound while another target is still bound", target.eye);
        }
        self.pending = Some(PendingPass {
            target: target.id,
            index: target.swap.current_index(),
            draws: Vec::new(),
        });
    }

    fn draw(&mut self, view_projection: &Mat4, world: &Mat4) {
        match &mut self.pending {
            Some(pass) => pass.draws.push(CubeUniform::new(view_projection, world)),
            None => warn!("Draw issued with no target bound"),
        }
    }

    fn unbind(&mut self, target: &RenderTarget) {
        let Some(pass) = self.pending.take() else {
            warn!("{:?} eye unbound without being bound", target.eye);
            return;
        };
        let Some(gpu) = self.targets.get(&pass.target) else {
            warn!("{:?} eye target is not live", target.eye);
            return;
        };
        let Some(color_view) = gpu.color_views.get(pass.index) else {
            warn!("{:?} eye has no texture {}", target.eye, pass.index);
            return;
        };

        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Eye Render Encoder"),
        });
        self.encode_eye_pass(&mut encoder, gpu, color_view, &pass.draws);

        if let Some(mirror) = &self.mirror {
            let mapping = mirror_half(target.eye, mirror.extent);
            self.encode_blit(
                &mut encoder,
                &self.blit.mirror_pipeline,
                color_view,
                &mirror.view,
                wgpu::LoadOp::Load,
                Some(&mapping),
            );
        }

        self.queue.submit(Some(encoder.finish()));
    }

    fn blit(&mut self, _mirror: &MirrorSurface, src: BlitRect, dst: BlitRect) {
        let Some(window) = &self.window else {
            trace!("No window surface, skipping mirror blit");
            return;
        };
        let Some(mirror) = &self.mirror else {
            return;
        };

        let frame = match window.surface.get_current_texture() {
            Ok(frame) => frame,
            Err(wgpu::SurfaceError::Outdated | wgpu::SurfaceError::Lost) => {
                debug!("Window surface out of date, reconfiguring");
                window.surface.configure(&self.device, &window.config);
                return;
            }
            Err(err) => {
                warn!("Failed to acquire window surface: {}", err);
                return;
            }
        };

        let window_extent = Extent::new(window.config.width, window.config.height);
        let mapping = blit_mapping(src, mirror.extent, dst, window_extent);
        let view = frame.texture.create_view(&wgpu::TextureViewDescriptor::default());

        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Mirror Blit Encoder"),
        });
        self.encode_blit(
            &mut encoder,
            &window.blit_pipeline,
            &mirror.view,
            &view,
            wgpu::LoadOp::Clear(CLEAR_COLOR),
            mapping.as_ref(),
        );
        self.queue.submit(Some(encoder.finish()));
        self.frame = Some(frame);
    }

    fn present(&mut self) {
        if let Some(frame) = self.frame.take() {
            frame.present();
        }
    }

    fn destroy_target(&mut self, target: &RenderTarget) {
        if let Some(gpu) = self.targets.remove(&target.id) {
            for texture in &gpu.color {
                texture.destroy();
            }
            gpu.depth.destroy();
            debug!("Destroyed {:?} eye target", target.eye);
        }
    }

    fn destroy_mirror(&mut self, _mirror: &MirrorSurface) {
        if let Some(mirror) = self.mirror.take() {
            mirror.texture.destroy();
            debug!("Destroyed mirror texture");
        }
    }

    fn release(&mut self) {
        self.pending = None;
        self.frame = None;
        if let Some(mesh) = self.mesh.take() {
            mesh.destroy();
            debug!("Released cube buffers");
        }
        if self.cube_program.take().is_some() {
            debug!("Released cube shader program");
        }
    }
}
