//! GPU presentation: frames are uploaded into a texture and drawn as a
//! full-viewport quad, either onto a window surface or into an offscreen
//! texture when no window exists.

use std::collections::HashMap;

use edge_pixels::Frame;
use tracing::{debug, info};

use crate::preview::sink::{FrameSink, PresentError, PresentFormat, TargetState};

const SHADER_SOURCE: &str = include_str!("quad.wgsl");

const OFFSCREEN_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8Unorm;

#[repr(C)]
#[derive(Debug, Copy, Clone, bytemuck::Pod, bytemuck::Zeroable)]
struct QuadUniforms {
    /// Non-zero when the source texture is single-channel.
    luminance: u32,
    _padding: [u32; 3],
}

/// Display surface handed to a [`GpuSink`].
pub enum GpuSurface {
    /// A window surface created from [`GpuSink::instance`].
    Window(wgpu::Surface<'static>),
    /// Render into a texture owned by the sink.
    Offscreen,
}

enum Output {
    Window {
        surface: wgpu::Surface<'static>,
        config: wgpu::SurfaceConfiguration,
    },
    Offscreen {
        texture: wgpu::Texture,
    },
}

impl Output {
    fn format(&self) -> wgpu::TextureFormat {
        match self {
            Self::Window { config, .. } => config.format,
            Self::Offscreen { .. } => OFFSCREEN_FORMAT,
        }
    }
}

struct SourceTexture {
    texture: wgpu::Texture,
    bind_group: wgpu::BindGroup,
}

/// [`FrameSink`] backed by wgpu.
///
/// The frame texture is reallocated whenever the frame dimensions or
/// format change. Render pipelines are cached per output format so
/// reattaching a surface does not recompile the shader.
pub struct GpuSink {
    instance: wgpu::Instance,
    adapter: wgpu::Adapter,
    device: wgpu::Device,
    queue: wgpu::Queue,
    shader: wgpu::ShaderModule,
    bind_group_layout: wgpu::BindGroupLayout,
    pipeline_layout: wgpu::PipelineLayout,
    sampler: wgpu::Sampler,
    uniforms: wgpu::Buffer,
    pipelines: HashMap<wgpu::TextureFormat, wgpu::RenderPipeline>,
    output: Option<Output>,
    source: Option<SourceTexture>,
    target: TargetState,
}

impl GpuSink {
    /// Create a device on the default adapter. Blocks until the adapter
    /// and device requests complete.
    pub fn new() -> Result<Self, PresentError> {
        pollster::block_on(Self::init())
    }

    async fn init() -> Result<Self, PresentError> {
        let instance = wgpu::Instance::default();
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::default(),
                force_fallback_adapter: false,
                compatible_surface: None,
            })
            .await
            .map_err(|e| PresentError::Backend(format!("no graphics adapter: {e}")))?;

        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some("preview-device"),
                required_limits: wgpu::Limits::downlevel_webgl2_defaults()
                    .using_resolution(adapter.limits()),
                ..Default::default()
            })
            .await
            .map_err(|e| PresentError::Backend(format!("failed to create device: {e}")))?;

        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("preview-quad-shader"),
            source: wgpu::ShaderSource::Wgsl(SHADER_SOURCE.into()),
        });

        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("preview-bind-group-layout"),
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

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("preview-pipeline-layout"),
            bind_group_layouts: &[&bind_group_layout],
            ..Default::default()
        });

        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("preview-sampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            address_mode_w: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            ..Default::default()
        });

        let uniforms = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("preview-uniforms"),
            size: std::mem::size_of::<QuadUniforms>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let info = adapter.get_info();
        info!(adapter = %info.name, backend = ?info.backend, "GPU presenter initialized");

        Ok(Self {
            instance,
            adapter,
            device,
            queue,
            shader,
            bind_group_layout,
            pipeline_layout,
            sampler,
            uniforms,
            pipelines: HashMap::new(),
            output: None,
            source: None,
            target: TargetState::Uninitialized,
        })
    }

    /// Instance window surfaces must be created from.
    pub fn instance(&self) -> &wgpu::Instance {
        &self.instance
    }

    pub fn adapter_info(&self) -> wgpu::AdapterInfo {
        self.adapter.get_info()
    }

    fn allocate_source(&self, width: u32, height: u32, format: PresentFormat) -> SourceTexture {
        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("preview-frame-texture"),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: texture_format(format),
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("preview-bind-group"),
            layout: &self.bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::TextureView(&view),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::Sampler(&self.sampler),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: self.uniforms.as_entire_binding(),
                },
            ],
        });
        SourceTexture { texture, bind_group }
    }

    fn offscreen_output(&self, width: u32, height: u32) -> Output {
        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("preview-offscreen-target"),
            size: wgpu::Extent3d {
                width: width.max(1),
                height: height.max(1),
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: OFFSCREEN_FORMAT,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_SRC,
            view_formats: &[],
        });
        Output::Offscreen { texture }
    }
}

impl FrameSink for GpuSink {
    type Surface = GpuSurface;

    fn attach(&mut self, surface: GpuSurface, width: u32, height: u32) -> Result<(), PresentError> {
        let output = match surface {
            GpuSurface::Window(surface) => {
                let mut config = surface
                    .get_default_config(&self.adapter, width.max(1), height.max(1))
                    .ok_or_else(|| {
                        PresentError::Backend("surface is not supported by the adapter".to_string())
                    })?;
                let caps = surface.get_capabilities(&self.adapter);
                if let Some(format) = pick_surface_format(&caps.formats) {
                    config.format = format;
                }
                surface.configure(&self.device, &config);
                debug!(format = ?config.format, width, height, "window surface configured");
                Output::Window { surface, config }
            }
            GpuSurface::Offscreen => self.offscreen_output(width, height),
        };
        self.output = Some(output);
        Ok(())
    }

    fn resize(&mut self, width: u32, height: u32) {
        match self.output.take() {
            Some(Output::Window { surface, mut config }) => {
                config.width = width.max(1);
                config.height = height.max(1);
                surface.configure(&self.device, &config);
                self.output = Some(Output::Window { surface, config });
            }
            Some(Output::Offscreen { .. }) => {
                self.output = Some(self.offscreen_output(width, height));
            }
            None => {}
        }
    }

    fn detach(&mut self) {
        self.output = None;
    }

    fn is_attached(&self) -> bool {
        self.output.is_some()
    }

    fn ensure_target(
        &mut self,
        width: u32,
        height: u32,
        format: PresentFormat,
    ) -> Result<(), PresentError> {
        if self.target.fits(width, height, format) {
            return Ok(());
        }
        let max = self.device.limits().max_texture_dimension_2d;
        if width > max || height > max {
            return Err(PresentError::Backend(format!(
                "{width}x{height} exceeds the maximum texture size {max}"
            )));
        }
        if let Some(old) = self.source.take() {
            old.texture.destroy();
        }
        self.source = Some(self.allocate_source(width, height, format));
        let uniforms = QuadUniforms {
            luminance: u32::from(format == PresentFormat::Luma),
            _padding: [0; 3],
        };
        self.queue.write_buffer(&self.uniforms, 0, bytemuck::cast_slice(&[uniforms]));
        self.target = TargetState::Ready { width, height, format };
        Ok(())
    }

    fn upload(&mut self, frame: &Frame) -> Result<(), PresentError> {
        let format = self.target.check(frame)?;
        let source = self.source.as_ref().ok_or(PresentError::NoTarget)?;
        let (width, height) = frame.dimensions();
        self.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &source.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            frame.data(),
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(width * bytes_per_texel(format)),
                rows_per_image: Some(height),
            },
            wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
        );
        Ok(())
    }

    fn draw(&mut self) -> Result<(), PresentError> {
        let source = self.source.as_ref().ok_or(PresentError::NoTarget)?;
        let output = self.output.as_ref().ok_or(PresentError::SurfaceLost)?;
        let format = output.format();
        let pipeline = self
            .pipelines
            .entry(format)
            .or_insert_with(|| {
                create_pipeline(&self.device, &self.pipeline_layout, &self.shader, format)
            });

        match output {
            Output::Window { surface, config } => {
                let frame = match surface.get_current_texture() {
                    Ok(frame) => frame,
                    Err(wgpu::SurfaceError::Lost | wgpu::SurfaceError::Outdated) => {
                        debug!("surface outdated, reconfiguring");
                        surface.configure(&self.device, config);
                        surface.get_current_texture().map_err(|_| PresentError::SurfaceLost)?
                    }
                    Err(e) => {
                        return Err(PresentError::Backend(format!(
                            "failed to acquire surface texture: {e}"
                        )))
                    }
                };
                let view = frame.texture.create_view(&wgpu::TextureViewDescriptor::default());
                encode_quad(&self.device, &self.queue, pipeline, &source.bind_group, &view);
                frame.present();
            }
            Output::Offscreen { texture } => {
                let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
                encode_quad(&self.device, &self.queue, pipeline, &source.bind_group, &view);
            }
        }
        Ok(())
    }

    fn target(&self) -> TargetState {
        self.target
    }
}

fn texture_format(format: PresentFormat) -> wgpu::TextureFormat {
    match format {
        PresentFormat::Rgba => wgpu::TextureFormat::Rgba8Unorm,
        PresentFormat::Luma => wgpu::TextureFormat::R8Unorm,
    }
}

fn bytes_per_texel(format: PresentFormat) -> u32 {
    match format {
        PresentFormat::Rgba => 4,
        PresentFormat::Luma => 1,
    }
}

/// Prefer a linear swapchain format: texels are already display-encoded.
fn pick_surface_format(formats: &[wgpu::TextureFormat]) -> Option<wgpu::TextureFormat> {
    formats
        .iter()
        .copied()
        .find(|f| !f.is_srgb())
        .or_else(|| formats.first().copied())
}

fn create_pipeline(
    device: &wgpu::Device,
    layout: &wgpu::PipelineLayout,
    shader: &wgpu::ShaderModule,
    format: wgpu::TextureFormat,
) -> wgpu::RenderPipeline {
    debug!(?format, "creating preview render pipeline");
    device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
        label: Some("preview-render-pipeline"),
        layout: Some(layout),
        vertex: wgpu::VertexState {
            module: shader,
            entry_point: Some("vs_main"),
            buffers: &[],
            compilation_options: wgpu::PipelineCompilationOptions::default(),
        },
        fragment: Some(wgpu::FragmentState {
            module: shader,
            entry_point: Some("fs_main"),
            targets: &[Some(wgpu::ColorTargetState {
                format,
                blend: Some(wgpu::BlendState::REPLACE),
                write_mask: wgpu::ColorWrites::ALL,
            })],
            compilation_options: wgpu::PipelineCompilationOptions::default(),
        }),
        primitive: wgpu::PrimitiveState {
            topology: wgpu::PrimitiveTopology::TriangleStrip,
            ..Default::default()
        },
        depth_stencil: None,
        multisample: wgpu::MultisampleState::default(),
        multiview_mask: None,
        cache: None,
    })
}

fn encode_quad(
    device: &wgpu::Device,
    queue: &wgpu::Queue,
    pipeline: &wgpu::RenderPipeline,
    bind_group: &wgpu::BindGroup,
    view: &wgpu::TextureView,
) {
    let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
        label: Some("preview-encoder"),
    });
    {
        let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("preview-pass"),
            color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                view,
                resolve_target: None,
                ops: wgpu::Operations {
                    load: wgpu::LoadOp::Clear(wgpu::Color::BLACK),
                    store: wgpu::StoreOp::Store,
                },
                depth_slice: None,
            })],
            ..Default::default()
        });
        pass.set_pipeline(pipeline);
        pass.set_bind_group(0, bind_group, &[]);
        pass.draw(0..4, 0..1);
    }
    queue.submit(Some(encoder.finish()));
}
