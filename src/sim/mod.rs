use bytemuck::{Pod, Zeroable};

use crate::error::SetupError;

pub mod gpucompute;
pub mod params;
pub mod pingpong;

pub use params::{ParameterStore, PointerSample};
pub use pingpong::{FieldBuffer, PassDescriptor, PingPong, StepCounter, TickPlan};

/// Host-side snapshot of the field, used for the initial upload and for readback.
#[derive(Clone, Debug, PartialEq)]
pub struct SimulationFrame {
    pub width: usize,
    pub height: usize,
    pub grid: Vec<f32>,
}

impl SimulationFrame {
    pub fn new(width: usize, height: usize) -> SimulationFrame {
        Self::filled(width, height, 0.0)
    }

    pub fn filled(width: usize, height: usize, value: f32) -> SimulationFrame {
        SimulationFrame {
            width,
            height,
            grid: vec![value; width * height],
        }
    }

    pub fn get(&self, x: usize, y: usize) -> f32 {
        self.grid[x + y * self.width]
    }

    pub fn set(&mut self, x: usize, y: usize, value: f32) {
        self.grid[x + y * self.width] = value;
    }
}

/// The parameter block shared with the compute and render kernels.
///
/// Eight packed 4-byte fields in a fixed order; the WGSL `Params` struct mirrors
/// this layout exactly, so fields must not be reordered or resized.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Pod, Zeroable)]
pub struct SimulationParameters {
    /// Grid width in cells
    pub width: f32,
    /// Grid height in cells
    pub height: f32,
    /// Timestep of one simulation step
    pub dt: f32,
    /// Diffusion coefficient applied to the Laplacian
    pub diffusion_rate: f32,
    /// Pointer position in grid space
    pub pointer_x: f32,
    pub pointer_y: f32,
    /// `1.0` while the primary button is held, `0.0` otherwise
    pub pointer_active: f32,
    pub reserved: f32,
}

impl SimulationParameters {
    pub fn is_pointer_active(&self) -> bool {
        self.pointer_active > 0.5
    }
}

impl From<&SimulationConfig> for SimulationParameters {
    fn from(config: &SimulationConfig) -> Self {
        Self {
            width: config.grid_width as f32,
            height: config.grid_height as f32,
            dt: config.timestep,
            diffusion_rate: config.diffusion_rate,
            pointer_x: 0.0,
            pointer_y: 0.0,
            pointer_active: 0.0,
            reserved: 0.0,
        }
    }
}

/// Startup configuration of a simulation session
#[derive(Clone, Debug, PartialEq)]
pub struct SimulationConfig {
    pub grid_width: u32,
    pub grid_height: u32,
    pub timestep: f32,
    pub diffusion_rate: f32,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            grid_width: 512,
            grid_height: 512,
            timestep: 0.016,
            diffusion_rate: 0.5,
        }
    }
}

impl SimulationConfig {
    pub fn square(size: u32) -> Self {
        Self {
            grid_width: size,
            grid_height: size,
            ..Default::default()
        }
    }

    pub fn cell_count(&self) -> usize {
        self.grid_width as usize * self.grid_height as usize
    }

    /// Size in bytes of one field buffer
    pub fn buffer_size(&self) -> u64 {
        self.cell_count() as u64 * std::mem::size_of::<f32>() as u64
    }

    pub fn validate(&self) -> Result<(), SetupError> {
        if self.grid_width == 0 || self.grid_height == 0 {
            return Err(SetupError::InvalidConfig(format!(
                "grid must be non-empty, got {}x{}",
                self.grid_width, self.grid_height
            )));
        }
        if !self.timestep.is_finite() || !self.diffusion_rate.is_finite() {
            return Err(SetupError::InvalidConfig(
                "timestep and diffusion rate must be finite".into(),
            ));
        }
        Ok(())
    }

    /// Apply `DIFFUSIM_GRID` (`N` or `WxH`), `DIFFUSIM_DT` and `DIFFUSIM_DIFFUSION`
    /// overrides on top of the defaults.
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    fn from_vars(var: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        use anyhow::Context;

        let mut config = Self::default();
        if let Some(grid) = var("DIFFUSIM_GRID") {
            let (w, h) = match grid.split_once(['x', 'X']) {
                Some((w, h)) => (w.trim(), h.trim()),
                None => (grid.trim(), grid.trim()),
            };
            config.grid_width = w.parse().with_context(|| format!("bad DIFFUSIM_GRID `{grid}`"))?;
            config.grid_height = h.parse().with_context(|| format!("bad DIFFUSIM_GRID `{grid}`"))?;
        }
        if let Some(dt) = var("DIFFUSIM_DT") {
            config.timestep = dt.trim().parse().with_context(|| format!("bad DIFFUSIM_DT `{dt}`"))?;
        }
        if let Some(rate) = var("DIFFUSIM_DIFFUSION") {
            config.diffusion_rate = rate
                .trim()
                .parse()
                .with_context(|| format!("bad DIFFUSIM_DIFFUSION `{rate}`"))?;
        }
        config.validate()?;
        Ok(config)
    }
}
