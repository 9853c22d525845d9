use std::borrow::Cow;

use wgpu::{
    BindGroup, BindGroupDescriptor, BindGroupEntry, BindGroupLayout, BindGroupLayoutDescriptor,
    BindGroupLayoutEntry, Buffer, CommandEncoder, ComputePassDescriptor, ComputePipeline,
    ComputePipelineDescriptor, Device, PipelineCompilationOptions, PipelineLayoutDescriptor,
    ShaderStages,
};

use crate::sim::pingpong::{FieldBuffer, PassDescriptor, PingPong, TickPlan};

/// Source text and entry point of the compute kernel.
///
/// The kernel sees the read buffer at binding 0, the write buffer at binding 1
/// and the parameter block at binding 2, all in group 0.
#[derive(Clone, Debug)]
pub struct ComputeKernel {
    pub source: Cow<'static, str>,
    pub entry_point: Cow<'static, str>,
}

impl Default for ComputeKernel {
    fn default() -> Self {
        Self {
            source: Cow::Borrowed(include_str!("./shader.wgsl")),
            entry_point: Cow::Borrowed("cs_main"),
        }
    }
}

/// The compute pipeline plus one bind group per ping-pong slot
pub struct ComputeStage {
    pipeline: ComputePipeline,
    bind_groups: [BindGroup; 2],
}

impl ComputeStage {
    pub fn new(
        device: &Device,
        kernel: &ComputeKernel,
        field_bufs: &[Buffer; 2],
        params_buf: &Buffer,
        table: &PingPong,
    ) -> Self {
        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("field compute shader"),
            source: wgpu::ShaderSource::Wgsl(kernel.source.clone()),
        });

        let layout = device.create_bind_group_layout(&BindGroupLayoutDescriptor {
            label: Some("field compute bind group layout"),
            entries: &[
                BindGroupLayoutEntry {
                    binding: 0,
                    visibility: ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Storage { read_only: true },
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                BindGroupLayoutEntry {
                    binding: 1,
                    visibility: ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Storage { read_only: false },
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                BindGroupLayoutEntry {
                    binding: 2,
                    visibility: ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
            ],
        });

        let bind_groups = table
            .passes()
            .map(|pass| create_bind_group(device, &layout, field_bufs, params_buf, pass));

        let pipeline_layout = device.create_pipeline_layout(&PipelineLayoutDescriptor {
            label: Some("field compute pipeline layout"),
            bind_group_layouts: &[&layout],
            push_constant_ranges: &[],
        });

        let pipeline = device.create_compute_pipeline(&ComputePipelineDescriptor {
            label: Some("field compute pipeline"),
            layout: Some(&pipeline_layout),
            module: &shader,
            entry_point: Some(&kernel.entry_point),
            compilation_options: PipelineCompilationOptions::default(),
            cache: None,
        });

        Self {
            pipeline,
            bind_groups,
        }
    }

    /// Record the step for `plan` as one compute pass.
    pub fn encode(&self, encoder: &mut CommandEncoder, plan: &TickPlan) {
        let mut pass = encoder.begin_compute_pass(&ComputePassDescriptor {
            label: Some("field step compute pass"),
            ..Default::default()
        });
        pass.set_pipeline(&self.pipeline);
        pass.set_bind_group(0, &self.bind_groups[plan.slot], &[]);
        pass.dispatch_workgroups(plan.dispatch[0], plan.dispatch[1], 1);
    }
}

fn create_bind_group(
    device: &Device,
    layout: &BindGroupLayout,
    field_bufs: &[Buffer; 2],
    params_buf: &Buffer,
    pass: PassDescriptor,
) -> BindGroup {
    device.create_bind_group(&BindGroupDescriptor {
        label: Some(match pass.read {
            FieldBuffer::A => "field compute bind group (a -> b)",
            FieldBuffer::B => "field compute bind group (b -> a)",
        }),
        layout,
        entries: &[
            BindGroupEntry {
                binding: 0,
                resource: field_bufs[pass.read.index()].as_entire_binding(),
            },
            BindGroupEntry {
                binding: 1,
                resource: field_bufs[pass.write.index()].as_entire_binding(),
            },
            BindGroupEntry {
                binding: 2,
                resource: params_buf.as_entire_binding(),
            },
        ],
    })
}
