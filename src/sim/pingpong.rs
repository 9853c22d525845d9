//! Read/write role bookkeeping for the two field buffers.

/// Workgroup edge length of the compute kernel (`@workgroup_size(8, 8)`)
pub const WORKGROUP_SIZE: u32 = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FieldBuffer {
    A,
    B,
}

impl FieldBuffer {
    pub const BOTH: [FieldBuffer; 2] = [FieldBuffer::A, FieldBuffer::B];

    pub fn index(self) -> usize {
        match self {
            FieldBuffer::A => 0,
            FieldBuffer::B => 1,
        }
    }

    pub fn other(self) -> FieldBuffer {
        match self {
            FieldBuffer::A => FieldBuffer::B,
            FieldBuffer::B => FieldBuffer::A,
        }
    }
}

/// Which buffer a step reads and which it writes.
///
/// The render pass of the same tick samples `write`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PassDescriptor {
    pub read: FieldBuffer,
    pub write: FieldBuffer,
}

impl PassDescriptor {
    /// The buffer the render pass samples for this step
    pub fn sampled(&self) -> FieldBuffer {
        self.write
    }
}

/// The two possible pass descriptors, indexed by step parity.
///
/// Backends build their bind groups from [`PingPong::passes`] once, in slot
/// order, so that slot `i` on the GPU always means `passes()[i]` here.
#[derive(Clone, Debug)]
pub struct PingPong {
    passes: [PassDescriptor; 2],
}

impl PingPong {
    pub const fn new() -> Self {
        Self {
            passes: [
                PassDescriptor {
                    read: FieldBuffer::A,
                    write: FieldBuffer::B,
                },
                PassDescriptor {
                    read: FieldBuffer::B,
                    write: FieldBuffer::A,
                },
            ],
        }
    }

    pub fn slot(step: u64) -> usize {
        (step % 2) as usize
    }

    pub fn pass(&self, step: u64) -> PassDescriptor {
        self.passes[Self::slot(step)]
    }

    pub fn passes(&self) -> &[PassDescriptor; 2] {
        &self.passes
    }
}

impl Default for PingPong {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StepCounter(u64);

impl StepCounter {
    pub fn get(&self) -> u64 {
        self.0
    }

    pub fn advance(&mut self) {
        self.0 += 1;
    }
}

/// Everything a backend needs to issue one tick.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TickPlan {
    pub step: u64,
    /// Index into the backend's precomputed bind groups
    pub slot: usize,
    pub pass: PassDescriptor,
    /// Workgroup counts in x and y
    pub dispatch: [u32; 2],
}

/// Workgroups needed to cover a `width × height` grid
pub fn dispatch_size(width: u32, height: u32) -> [u32; 2] {
    [
        width.div_ceil(WORKGROUP_SIZE),
        height.div_ceil(WORKGROUP_SIZE),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_alternates_and_never_aliases() {
        let table = PingPong::new();
        for step in 0..16 {
            let pass = table.pass(step);
            assert_ne!(pass.read, pass.write);
            if step > 0 {
                assert_eq!(pass.read, table.pass(step - 1).write);
            }
        }
        assert_eq!(table.pass(0).read, FieldBuffer::A);
        assert_eq!(table.pass(u64::MAX).read, FieldBuffer::B);
    }

    #[test]
    fn dispatch_covers_partial_tiles() {
        assert_eq!(dispatch_size(512, 512), [64, 64]);
        assert_eq!(dispatch_size(4, 4), [1, 1]);
        assert_eq!(dispatch_size(9, 17), [2, 3]);
        assert_eq!(dispatch_size(1, 8), [1, 1]);
    }

    #[test]
    fn other_flips() {
        for buffer in FieldBuffer::BOTH {
            assert_ne!(buffer, buffer.other());
            assert_eq!(buffer, buffer.other().other());
        }
    }
}
