//! Staging of host input into the simulation parameter block.

use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::sim::{SimulationConfig, SimulationParameters};

/// A pointer position in surface space, with the state of the primary button.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PointerSample {
    pub x: f64,
    pub y: f64,
    pub surface_width: u32,
    pub surface_height: u32,
    pub pressed: bool,
}

/// Cloneable handle to the staged parameter record.
///
/// Input handlers write through one handle and the frame scheduler reads through
/// another. The record is replaced as a whole, so a reader never observes a mix
/// of old and new fields. Grid dimensions are fixed at construction.
#[derive(Clone)]
pub struct ParameterStore {
    staged: Arc<ArcSwap<SimulationParameters>>,
}

impl ParameterStore {
    pub fn new(initial: SimulationParameters) -> Self {
        Self {
            staged: Arc::new(ArcSwap::from_pointee(initial)),
        }
    }

    /// The latest staged record. Only the most recent write is visible.
    pub fn snapshot(&self) -> SimulationParameters {
        **self.staged.load()
    }

    /// Map a pointer sample into grid space and stage it.
    pub fn stage_pointer(&self, sample: PointerSample) {
        self.staged.rcu(|current| {
            let mut next = **current;
            next.pointer_x = to_grid(sample.x, sample.surface_width, next.width);
            next.pointer_y = to_grid(sample.y, sample.surface_height, next.height);
            next.pointer_active = if sample.pressed { 1.0 } else { 0.0 };
            next
        });
    }

    /// Clear the pressed state, keeping the last pointer position.
    pub fn release_pointer(&self) {
        self.staged.rcu(|current| {
            let mut next = **current;
            next.pointer_active = 0.0;
            next
        });
    }

    /// Change the simulation rates without touching pointer state or grid size.
    pub fn set_rates(&self, dt: f32, diffusion_rate: f32) {
        self.staged.rcu(|current| {
            let mut next = **current;
            next.dt = dt;
            next.diffusion_rate = diffusion_rate;
            next
        });
    }
}

impl From<&SimulationConfig> for ParameterStore {
    fn from(config: &SimulationConfig) -> Self {
        Self::new(SimulationParameters::from(config))
    }
}

/// Linear surface → grid scaling, clamped to the last cell.
fn to_grid(surface_pos: f64, surface_dim: u32, grid_dim: f32) -> f32 {
    let scale = grid_dim as f64 / surface_dim.max(1) as f64;
    let pos = surface_pos * scale;
    if !pos.is_finite() {
        return 0.0;
    }
    pos.clamp(0.0, (grid_dim as f64 - 1.0).max(0.0)) as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(size: u32) -> ParameterStore {
        ParameterStore::from(&SimulationConfig::square(size))
    }

    fn sample(x: f64, y: f64, pressed: bool) -> PointerSample {
        PointerSample {
            x,
            y,
            surface_width: 1024,
            surface_height: 512,
            pressed,
        }
    }

    #[test]
    fn scales_surface_to_grid() {
        let store = store(512);
        store.stage_pointer(sample(512.0, 128.0, true));
        let params = store.snapshot();
        assert_eq!(params.pointer_x, 256.0);
        assert_eq!(params.pointer_y, 128.0);
        assert!(params.is_pointer_active());
    }

    #[test]
    fn clamps_outside_surface() {
        let store = store(512);
        store.stage_pointer(sample(-40.0, 9000.0, false));
        let params = store.snapshot();
        assert_eq!(params.pointer_x, 0.0);
        assert_eq!(params.pointer_y, 511.0);
        assert!(!params.is_pointer_active());

        store.stage_pointer(sample(f64::NAN, f64::INFINITY, true));
        let params = store.snapshot();
        assert_eq!((params.pointer_x, params.pointer_y), (0.0, 0.0));
    }

    #[test]
    fn zero_sized_surface_does_not_divide_by_zero() {
        let store = store(16);
        store.stage_pointer(PointerSample {
            x: 3.0,
            y: 2.0,
            surface_width: 0,
            surface_height: 0,
            pressed: true,
        });
        let params = store.snapshot();
        assert_eq!(params.pointer_x, 15.0);
        assert_eq!(params.pointer_y, 15.0);
    }

    #[test]
    fn last_write_wins() {
        let store = store(512);
        store.stage_pointer(sample(10.0, 10.0, true));
        store.stage_pointer(sample(100.0, 50.0, true));
        let params = store.snapshot();
        assert_eq!(params.pointer_x, 50.0);
        assert_eq!(params.pointer_y, 50.0);
    }

    #[test]
    fn release_keeps_position_and_dimensions() {
        let store = store(64);
        store.stage_pointer(sample(512.0, 256.0, true));
        store.release_pointer();
        let params = store.snapshot();
        assert!(!params.is_pointer_active());
        assert_eq!(params.pointer_x, 32.0);
        assert_eq!(params.width, 64.0);
        assert_eq!(params.height, 64.0);
    }

    #[test]
    fn clones_share_the_record() {
        let writer = store(32);
        let reader = writer.clone();
        writer.set_rates(0.1, 0.0);
        assert_eq!(reader.snapshot().dt, 0.1);
        assert_eq!(reader.snapshot().diffusion_rate, 0.0);
    }
}
