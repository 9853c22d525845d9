use std::borrow::Cow;

use wgpu::{
    BindGroup, BindGroupDescriptor, BindGroupEntry, BindGroupLayoutDescriptor,
    BindGroupLayoutEntry, Buffer, CommandEncoder, Device, FragmentState, LoadOp,
    MultisampleState, Operations, PipelineLayoutDescriptor, PrimitiveState,
    RenderPassColorAttachment, RenderPassDescriptor, RenderPipeline, RenderPipelineDescriptor,
    ShaderStages, StoreOp, TextureFormat, TextureView, VertexState,
};

use crate::sim::{PingPong, SimulationFrame, TickPlan};
use crate::util::Color;

/// Palette stops for field values 0, 0.5 and 1. The render shader uses the same stops.
pub const PALETTE: [Color; 3] = [
    Color::rgb(10, 12, 40),
    Color::rgb(30, 160, 200),
    Color::rgb(250, 250, 240),
];

const CLEAR_COLOR: wgpu::Color = wgpu::Color {
    r: 0.0,
    g: 0.0,
    b: 0.0,
    a: 1.0,
};

/// Source text and entry points of the render kernel.
///
/// The fragment stage sees the sampled field at binding 0 and the parameter
/// block at binding 1, in group 0.
#[derive(Clone, Debug)]
pub struct RenderKernel {
    pub source: Cow<'static, str>,
    pub vertex_entry: Cow<'static, str>,
    pub fragment_entry: Cow<'static, str>,
}

impl Default for RenderKernel {
    fn default() -> Self {
        Self {
            source: Cow::Borrowed(include_str!("./render.wgsl")),
            vertex_entry: Cow::Borrowed("vs_main"),
            fragment_entry: Cow::Borrowed("fs_main"),
        }
    }
}

/// The render pipeline plus one bind group per ping-pong slot.
///
/// Slot `i` binds the buffer that compute slot `i` writes, so a tick always
/// draws what its own compute pass produced.
pub struct RenderStage {
    pipeline: RenderPipeline,
    bind_groups: [BindGroup; 2],
}

impl RenderStage {
    pub fn new(
        device: &Device,
        kernel: &RenderKernel,
        format: TextureFormat,
        field_bufs: &[Buffer; 2],
        params_buf: &Buffer,
        table: &PingPong,
    ) -> Self {
        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("field render shader"),
            source: wgpu::ShaderSource::Wgsl(kernel.source.clone()),
        });

        let layout = device.create_bind_group_layout(&BindGroupLayoutDescriptor {
            label: Some("field render bind group layout"),
            entries: &[
                BindGroupLayoutEntry {
                    binding: 0,
                    visibility: ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Storage { read_only: true },
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                BindGroupLayoutEntry {
                    binding: 1,
                    visibility: ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
            ],
        });

        let bind_groups = table.passes().map(|pass| {
            device.create_bind_group(&BindGroupDescriptor {
                label: Some("field render bind group"),
                layout: &layout,
                entries: &[
                    BindGroupEntry {
                        binding: 0,
                        resource: field_bufs[pass.sampled().index()].as_entire_binding(),
                    },
                    BindGroupEntry {
                        binding: 1,
                        resource: params_buf.as_entire_binding(),
                    },
                ],
            })
        });

        let pipeline_layout = device.create_pipeline_layout(&PipelineLayoutDescriptor {
            label: Some("field render pipeline layout"),
            bind_group_layouts: &[&layout],
            push_constant_ranges: &[],
        });

        let pipeline = device.create_render_pipeline(&RenderPipelineDescriptor {
            label: Some("field render pipeline"),
            layout: Some(&pipeline_layout),
            vertex: VertexState {
                module: &shader,
                entry_point: Some(&kernel.vertex_entry),
                buffers: &[],
                compilation_options: Default::default(),
            },
            fragment: Some(FragmentState {
                module: &shader,
                entry_point: Some(&kernel.fragment_entry),
                targets: &[Some(wgpu::ColorTargetState {
                    format,
                    blend: Some(wgpu::BlendState::REPLACE),
                    write_mask: wgpu::ColorWrites::ALL,
                })],
                compilation_options: Default::default(),
            }),
            primitive: PrimitiveState {
                topology: wgpu::PrimitiveTopology::TriangleStrip,
                strip_index_format: None,
                front_face: wgpu::FrontFace::Ccw,
                cull_mode: None,
                unclipped_depth: false,
                polygon_mode: wgpu::PolygonMode::Fill,
                conservative: false,
            },
            depth_stencil: None,
            multisample: MultisampleState {
                count: 1,
                mask: !0,
                alpha_to_coverage_enabled: false,
            },
            multiview: None,
            cache: None,
        });

        Self {
            pipeline,
            bind_groups,
        }
    }

    /// Record one full-surface draw of the buffer written by `plan`'s compute pass.
    pub fn encode(&self, encoder: &mut CommandEncoder, view: &TextureView, plan: &TickPlan) {
        let mut render_pass = encoder.begin_render_pass(&RenderPassDescriptor {
            label: Some("field render pass"),
            color_attachments: &[Some(RenderPassColorAttachment {
                view,
                resolve_target: None,
                ops: Operations {
                    load: LoadOp::Clear(CLEAR_COLOR),
                    store: StoreOp::Store,
                },
                depth_slice: None,
            })],
            depth_stencil_attachment: None,
            timestamp_writes: None,
            occlusion_query_set: None,
        });
        render_pass.set_pipeline(&self.pipeline);
        render_pass.set_bind_group(0, &self.bind_groups[plan.slot], &[]);
        render_pass.draw(0..4, 0..1);
    }
}

/// Palette color of one field value, mirroring `palette` in the render shader.
pub fn shade(value: f32) -> Color {
    let v = if value.is_nan() { 0.0 } else { value.clamp(0.0, 1.0) };
    if v < 0.5 {
        PALETTE[0].lerp(&PALETTE[1], v * 2.0)
    } else {
        PALETTE[1].lerp(&PALETTE[2], (v - 0.5) * 2.0)
    }
}

/// CPU rendition of the fragment stage: fill an XRGB `buf` of `width × height`
/// pixels from `frame`.
pub fn display_frame(frame: &SimulationFrame, buf: &mut [u32], width: usize, height: usize) {
    let ratio_x = frame.width as f32 / width as f32;
    let ratio_y = frame.height as f32 / height as f32;
    for y in 0..height {
        // Sample at pixel centres, as the rasterizer does.
        let cell_y = (((y as f32 + 0.5) * ratio_y) as usize).min(frame.height - 1);
        for x in 0..width {
            let cell_x = (((x as f32 + 0.5) * ratio_x) as usize).min(frame.width - 1);
            buf[x + y * width] = shade(frame.get(cell_x, cell_y)).as_u32();
        }
    }
}
