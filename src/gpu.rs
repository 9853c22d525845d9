//! GPU backends for the frame scheduler
//!
//! `FieldResources` holds everything a tick touches: the two field buffers, the
//! parameter buffer, and both stages with their precomputed bind groups.
//! `GpuSimRenderer` presents to a window surface, `HeadlessRenderer` draws into
//! an offscreen texture and can read buffers back.

use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Context;
use wgpu::{
    Adapter, Buffer, BufferUsages, CommandEncoderDescriptor, Device, Extent3d, Instance, Queue,
    Surface, SurfaceConfiguration, Texture, TextureFormat, TextureUsages, TextureView,
    TextureViewDescriptor,
    util::{BufferInitDescriptor, DeviceExt},
};
use winit::window::Window;

use crate::{
    error::{SetupError, TickError},
    rendering::{RenderKernel, RenderStage},
    schedule::FrameBackend,
    sim::{
        FieldBuffer, PingPong, SimulationConfig, SimulationFrame, SimulationParameters, TickPlan,
        gpucompute::{ComputeKernel, ComputeStage},
        pingpong::dispatch_size,
    },
};

/// Kernel sources for both stages. Defaults to the bundled WGSL.
#[derive(Clone, Debug, Default)]
pub struct KernelSources {
    pub compute: ComputeKernel,
    pub render: RenderKernel,
}

/// Set from the device-lost callback, polled before every tick.
#[derive(Clone, Default)]
struct DeviceLostFlag(Arc<Mutex<Option<String>>>);

impl DeviceLostFlag {
    fn set(&self, message: String) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = Some(message);
    }

    fn check(&self) -> Result<(), TickError> {
        match &*self.0.lock().unwrap_or_else(PoisonError::into_inner) {
            Some(message) => Err(TickError::DeviceLost(message.clone())),
            None => Ok(()),
        }
    }
}

async fn request_device(
    instance: &Instance,
    compatible_surface: Option<&Surface<'_>>,
) -> Result<(Adapter, Device, Queue, DeviceLostFlag), SetupError> {
    let adapter = instance
        .request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            force_fallback_adapter: false,
            compatible_surface,
        })
        .await
        .map_err(|e| SetupError::NoAdapter(e.to_string()))?;

    log::info!("Using adapter: {:?}", adapter.get_info());

    let downlevel_caps = adapter.get_downlevel_capabilities();
    if !downlevel_caps
        .flags
        .contains(wgpu::DownlevelFlags::COMPUTE_SHADERS)
    {
        return Err(SetupError::MissingCapability("compute shaders"));
    }
    if !downlevel_caps
        .flags
        .contains(wgpu::DownlevelFlags::FRAGMENT_STORAGE)
    {
        return Err(SetupError::MissingCapability("storage buffers in fragment shaders"));
    }

    let (device, queue) = adapter
        .request_device(&wgpu::DeviceDescriptor {
            label: Some("diffusim device"),
            required_features: wgpu::Features::empty(),
            required_limits: wgpu::Limits::downlevel_defaults().using_resolution(adapter.limits()),
            experimental_features: wgpu::ExperimentalFeatures::disabled(),
            memory_hints: wgpu::MemoryHints::MemoryUsage,
            trace: wgpu::Trace::Off,
        })
        .await
        .map_err(|e| SetupError::RequestDevice(e.to_string()))?;

    let lost = DeviceLostFlag::default();
    let flag = lost.clone();
    device.set_device_lost_callback(move |reason, message| {
        flag.set(format!("{reason:?}: {message}"));
    });

    let flag = lost.clone();
    device.on_uncaptured_error(Arc::new(move |error| {
        log::error!("GPU uncaptured error: {error}");
        if matches!(error, wgpu::Error::OutOfMemory { .. }) {
            flag.set(format!("out of memory: {error}"));
        }
    }));

    Ok((adapter, device, queue, lost))
}

/// Reject grids the device cannot bind as one storage buffer or cover in one dispatch.
fn check_grid_limits(config: &SimulationConfig, limits: &wgpu::Limits) -> Result<(), SetupError> {
    let limit = limits.max_storage_buffer_binding_size as u64;
    if config.buffer_size() > limit {
        return Err(SetupError::GridTooLarge {
            size: config.buffer_size(),
            limit,
        });
    }
    let [groups_x, groups_y] = dispatch_size(config.grid_width, config.grid_height);
    let max_groups = limits.max_compute_workgroups_per_dimension;
    if groups_x > max_groups || groups_y > max_groups {
        return Err(SetupError::InvalidConfig(format!(
            "{}x{} grid needs {groups_x}x{groups_y} workgroups, the device allows {max_groups} per dimension",
            config.grid_width, config.grid_height
        )));
    }
    Ok(())
}

/// Reject grids larger than the offscreen target can be.
fn check_target_size(config: &SimulationConfig, limits: &wgpu::Limits) -> Result<(), SetupError> {
    let max = limits.max_texture_dimension_2d;
    if config.grid_width > max || config.grid_height > max {
        return Err(SetupError::InvalidConfig(format!(
            "{}x{} grid exceeds the maximum texture dimension {max}",
            config.grid_width, config.grid_height
        )));
    }
    Ok(())
}

/// Field buffers, parameter buffer and both stages.
pub struct FieldResources {
    config: SimulationConfig,
    field_bufs: [Buffer; 2],
    params_buf: Buffer,
    compute: ComputeStage,
    render: RenderStage,
}

impl FieldResources {
    pub async fn new(
        device: &Device,
        config: &SimulationConfig,
        start: &SimulationFrame,
        parameters: &SimulationParameters,
        kernels: &KernelSources,
        format: TextureFormat,
    ) -> Result<Self, SetupError> {
        config.validate()?;
        if start.width != config.grid_width as usize || start.height != config.grid_height as usize
        {
            return Err(SetupError::InvalidConfig(format!(
                "initial frame is {}x{}, grid is {}x{}",
                start.width, start.height, config.grid_width, config.grid_height
            )));
        }
        check_grid_limits(config, &device.limits())?;

        let usage = BufferUsages::STORAGE | BufferUsages::COPY_DST | BufferUsages::COPY_SRC;
        let buf_a = device.create_buffer_init(&BufferInitDescriptor {
            label: Some("field buffer a"),
            contents: bytemuck::cast_slice(&start.grid),
            usage,
        });
        let buf_b = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("field buffer b"),
            size: config.buffer_size(),
            usage,
            mapped_at_creation: false,
        });
        let field_bufs = [buf_a, buf_b];

        let params_buf = device.create_buffer_init(&BufferInitDescriptor {
            label: Some("simulation parameters buffer"),
            contents: bytemuck::bytes_of(parameters),
            usage: BufferUsages::UNIFORM | BufferUsages::COPY_DST,
        });

        let table = PingPong::new();

        device.push_error_scope(wgpu::ErrorFilter::Validation);
        let compute = ComputeStage::new(device, &kernels.compute, &field_bufs, &params_buf, &table);
        if let Some(err) = device.pop_error_scope().await {
            return Err(SetupError::Pipeline {
                stage: "compute",
                message: err.to_string(),
            });
        }

        device.push_error_scope(wgpu::ErrorFilter::Validation);
        let render = RenderStage::new(
            device,
            &kernels.render,
            format,
            &field_bufs,
            &params_buf,
            &table,
        );
        if let Some(err) = device.pop_error_scope().await {
            return Err(SetupError::Pipeline {
                stage: "render",
                message: err.to_string(),
            });
        }

        Ok(Self {
            config: config.clone(),
            field_bufs,
            params_buf,
            compute,
            render,
        })
    }

    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    pub fn buffer(&self, which: FieldBuffer) -> &Buffer {
        &self.field_bufs[which.index()]
    }

    pub fn upload_parameters(&self, queue: &Queue, params: &SimulationParameters) {
        queue.write_buffer(&self.params_buf, 0, bytemuck::bytes_of(params));
    }

    /// One encoder, compute pass closed before the render pass begins, one submit.
    pub fn submit_tick(&self, device: &Device, queue: &Queue, view: &TextureView, plan: &TickPlan) {
        let mut encoder = device.create_command_encoder(&CommandEncoderDescriptor {
            label: Some("compute and render encoder"),
        });
        self.compute.encode(&mut encoder, plan);
        self.render.encode(&mut encoder, view, plan);
        queue.submit(std::iter::once(encoder.finish()));
    }
}

/// Backend presenting to a window surface
pub struct GpuSimRenderer {
    #[allow(dead_code)]
    instance: Instance, // Keep instance alive for the lifetime of the renderer
    device: Device,
    queue: Queue,
    surface: Surface<'static>,
    surface_config: SurfaceConfiguration,
    resources: FieldResources,
    lost: DeviceLostFlag,
    window: Arc<Window>,
}

impl GpuSimRenderer {
    pub async fn new(
        window: Arc<Window>,
        config: &SimulationConfig,
        start: &SimulationFrame,
        parameters: &SimulationParameters,
        kernels: &KernelSources,
    ) -> Result<Self, SetupError> {
        let instance = Instance::new(&wgpu::InstanceDescriptor::default());

        // Create surface first to find compatible adapter
        let surface = instance
            .create_surface(window.clone())
            .map_err(|e| SetupError::CreateSurface(e.to_string()))?;

        let (adapter, device, queue, lost) = request_device(&instance, Some(&surface)).await?;

        let size = window.inner_size();
        let surface_caps = surface.get_capabilities(&adapter);
        let surface_format = surface_caps
            .formats
            .iter()
            .find(|f| f.is_srgb())
            .copied()
            .or_else(|| surface_caps.formats.first().copied())
            .ok_or(SetupError::MissingCapability("a presentable surface format"))?;

        let surface_config = SurfaceConfiguration {
            usage: TextureUsages::RENDER_ATTACHMENT,
            format: surface_format,
            width: size.width.max(1),
            height: size.height.max(1),
            present_mode: wgpu::PresentMode::AutoVsync,
            alpha_mode: surface_caps.alpha_modes[0],
            view_formats: vec![],
            desired_maximum_frame_latency: 2,
        };
        surface.configure(&device, &surface_config);

        let resources =
            FieldResources::new(&device, config, start, parameters, kernels, surface_format)
                .await?;

        Ok(Self {
            instance,
            device,
            queue,
            surface,
            surface_config,
            resources,
            lost,
            window,
        })
    }

    /// Request a redraw of the window
    /// Call this after a tick to keep the frame loop going
    pub fn request_redraw(&self) {
        self.window.request_redraw();
    }

    pub fn window(&self) -> &Window {
        &self.window
    }

    /// Current surface size in pixels
    pub fn surface_size(&self) -> (u32, u32) {
        (self.surface_config.width, self.surface_config.height)
    }

    /// Resize the render surface
    pub fn resize(&mut self, width: u32, height: u32) {
        if width > 0 && height > 0 {
            self.surface_config.width = width;
            self.surface_config.height = height;
            self.surface.configure(&self.device, &self.surface_config);
        }
    }

    pub fn resources(&self) -> &FieldResources {
        &self.resources
    }
}

impl FrameBackend for GpuSimRenderer {
    fn upload_parameters(&mut self, params: &SimulationParameters) -> Result<(), TickError> {
        self.lost.check()?;
        self.resources.upload_parameters(&self.queue, params);
        Ok(())
    }

    fn submit(&mut self, plan: &TickPlan) -> Result<(), TickError> {
        self.lost.check()?;
        // Only a window surface produces these; the headless backend has no equivalent.
        let output = match self.surface.get_current_texture() {
            Ok(output) => output,
            Err(wgpu::SurfaceError::Lost | wgpu::SurfaceError::Outdated) => {
                self.surface.configure(&self.device, &self.surface_config);
                return Err(TickError::Transient("surface reconfigured".into()));
            }
            Err(wgpu::SurfaceError::OutOfMemory) => {
                return Err(TickError::DeviceLost("out of memory".into()));
            }
            Err(e) => return Err(TickError::Transient(e.to_string())),
        };
        let view = output
            .texture
            .create_view(&TextureViewDescriptor::default());
        self.resources
            .submit_tick(&self.device, &self.queue, &view, plan);
        output.present();
        Ok(())
    }
}

/// Format of the offscreen target of [`HeadlessRenderer`]
pub const HEADLESS_FORMAT: TextureFormat = TextureFormat::Rgba8Unorm;

/// Backend drawing into an offscreen texture the size of the grid
pub struct HeadlessRenderer {
    device: Device,
    queue: Queue,
    target: Texture,
    view: TextureView,
    resources: FieldResources,
    lost: DeviceLostFlag,
}

impl HeadlessRenderer {
    pub async fn new(
        config: &SimulationConfig,
        start: &SimulationFrame,
        parameters: &SimulationParameters,
        kernels: &KernelSources,
    ) -> Result<Self, SetupError> {
        let instance = Instance::new(&wgpu::InstanceDescriptor::default());
        let (_adapter, device, queue, lost) = request_device(&instance, None).await?;

        let resources =
            FieldResources::new(&device, config, start, parameters, kernels, HEADLESS_FORMAT)
                .await?;
        check_target_size(config, &device.limits())?;

        let target = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("offscreen field target"),
            size: Extent3d {
                width: config.grid_width,
                height: config.grid_height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: HEADLESS_FORMAT,
            usage: TextureUsages::RENDER_ATTACHMENT | TextureUsages::COPY_SRC,
            view_formats: &[],
        });
        let view = target.create_view(&TextureViewDescriptor::default());

        Ok(Self {
            device,
            queue,
            target,
            view,
            resources,
            lost,
        })
    }

    /// Overwrite one field buffer with `frame`.
    pub fn write_field(&self, which: FieldBuffer, frame: &SimulationFrame) -> anyhow::Result<()> {
        let config = self.resources.config();
        anyhow::ensure!(
            frame.width == config.grid_width as usize && frame.height == config.grid_height as usize,
            "frame is {}x{}, grid is {}x{}",
            frame.width,
            frame.height,
            config.grid_width,
            config.grid_height
        );
        self.queue.write_buffer(
            self.resources.buffer(which),
            0,
            bytemuck::cast_slice(&frame.grid),
        );
        Ok(())
    }

    /// Copy one field buffer back to the host.
    pub async fn read_field(&self, which: FieldBuffer) -> anyhow::Result<SimulationFrame> {
        let config = self.resources.config();
        let src = self.resources.buffer(which);
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("field readback buffer"),
            size: src.size(),
            usage: BufferUsages::MAP_READ | BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut encoder = self
            .device
            .create_command_encoder(&CommandEncoderDescriptor {
                label: Some("field readback encoder"),
            });
        encoder.copy_buffer_to_buffer(src, 0, &staging, 0, None);
        self.queue.submit(std::iter::once(encoder.finish()));

        let data = self.map_read(&staging).await?;
        let grid = data
            .chunks_exact(std::mem::size_of::<f32>())
            .map(bytemuck::pod_read_unaligned::<f32>)
            .collect();

        Ok(SimulationFrame {
            width: config.grid_width as usize,
            height: config.grid_height as usize,
            grid,
        })
    }

    /// Copy the last rendered image back to the host, one RGBA texel per cell.
    pub async fn read_target(&self) -> anyhow::Result<Vec<[u8; 4]>> {
        let config = self.resources.config();
        let (width, height) = (config.grid_width, config.grid_height);
        let unpadded = width * 4;
        let padded = unpadded.div_ceil(wgpu::COPY_BYTES_PER_ROW_ALIGNMENT)
            * wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;

        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("target readback buffer"),
            size: padded as u64 * height as u64,
            usage: BufferUsages::MAP_READ | BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut encoder = self
            .device
            .create_command_encoder(&CommandEncoderDescriptor {
                label: Some("target readback encoder"),
            });
        encoder.copy_texture_to_buffer(
            self.target.as_image_copy(),
            wgpu::TexelCopyBufferInfo {
                buffer: &staging,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(padded),
                    rows_per_image: Some(height),
                },
            },
            self.target.size(),
        );
        self.queue.submit(std::iter::once(encoder.finish()));

        let data = self.map_read(&staging).await?;
        Ok(data
            .chunks(padded as usize)
            .flat_map(|row| row[..unpadded as usize].chunks_exact(4))
            .map(|px| [px[0], px[1], px[2], px[3]])
            .collect())
    }

    /// Map `staging` after all submitted work finished and copy its contents out.
    async fn map_read(&self, staging: &Buffer) -> anyhow::Result<Vec<u8>> {
        let slice = staging.slice(..);
        let (sender, receiver) = futures_intrusive::channel::shared::oneshot_channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        self.device
            .poll(wgpu::PollType::Wait {
                submission_index: None,
                timeout: None,
            })
            .context("failed to wait for readback")?;
        receiver
            .receive()
            .await
            .context("readback callback dropped")?
            .context("failed to map readback buffer")?;
        let data = slice.get_mapped_range().to_vec();
        staging.unmap();
        Ok(data)
    }

    pub fn resources(&self) -> &FieldResources {
        &self.resources
    }
}

impl FrameBackend for HeadlessRenderer {
    fn upload_parameters(&mut self, params: &SimulationParameters) -> Result<(), TickError> {
        self.lost.check()?;
        self.resources.upload_parameters(&self.queue, params);
        Ok(())
    }

    fn submit(&mut self, plan: &TickPlan) -> Result<(), TickError> {
        self.lost.check()?;
        self.resources
            .submit_tick(&self.device, &self.queue, &self.view, plan);
        Ok(())
    }
}
