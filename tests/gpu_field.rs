//! GPU field tests on the headless backend.
//!
//! Each test skips with a message when no adapter with compute support is
//! available, so the suite stays green on machines without a GPU.
//!
//! Run with: cargo test --test gpu_field -- --nocapture

use diffusim::{
    error::SetupError,
    gpu::{HeadlessRenderer, KernelSources},
    rendering::display_frame,
    schedule::{FrameScheduler, FrameTiming, ShutdownToken, SimulationSession, TickOutcome},
    sim::{
        FieldBuffer, ParameterStore, PointerSample, SimulationConfig, SimulationFrame,
        SimulationParameters, gpucompute::ComputeKernel,
    },
};

fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn headless(
    config: &SimulationConfig,
    start: &SimulationFrame,
    store: &ParameterStore,
) -> Option<FrameScheduler<HeadlessRenderer>> {
    init_logs();
    let renderer = match pollster::block_on(HeadlessRenderer::new(
        config,
        start,
        &store.snapshot(),
        &KernelSources::default(),
    )) {
        Ok(renderer) => renderer,
        Err(e) => {
            eprintln!("No usable GPU, skipping: {e}");
            return None;
        }
    };
    let session = SimulationSession::new(store.clone(), None);
    Some(FrameScheduler::new(session, renderer, ShutdownToken::new()))
}

fn run_ticks(scheduler: &mut FrameScheduler<HeadlessRenderer>, count: u32) {
    for n in 0..count {
        let frame = FrameTiming {
            now_ms: 1.0 + n as f64 * 16.0,
        };
        assert_eq!(scheduler.tick(frame), Ok(TickOutcome::Submitted));
    }
}

fn read(scheduler: &FrameScheduler<HeadlessRenderer>, which: FieldBuffer) -> SimulationFrame {
    pollster::block_on(scheduler.backend().read_field(which)).unwrap()
}

fn config(width: u32, height: u32, dt: f32, diffusion_rate: f32) -> SimulationConfig {
    SimulationConfig {
        grid_width: width,
        grid_height: height,
        timestep: dt,
        diffusion_rate,
    }
}

/// Host rendition of one kernel step, for comparison.
fn reference_step(field: &SimulationFrame, params: &SimulationParameters) -> SimulationFrame {
    let (w, h) = (field.width as i64, field.height as i64);
    let sample = |x: i64, y: i64| field.get(x.clamp(0, w - 1) as usize, y.clamp(0, h - 1) as usize);
    let mut next = SimulationFrame::new(field.width, field.height);
    for y in 0..h {
        for x in 0..w {
            let c = sample(x, y);
            let laplacian =
                sample(x - 1, y) + sample(x + 1, y) + sample(x, y - 1) + sample(x, y + 1) - 4.0 * c;
            let mut value = c + params.dt * params.diffusion_rate * laplacian;
            if params.is_pointer_active() {
                let (px, py) = (params.pointer_x.floor(), params.pointer_y.floor());
                if ((x as f32 - px).powi(2) + (y as f32 - py).powi(2)).sqrt() <= 1.0 {
                    value = 1.0;
                }
            }
            next.set(x as usize, y as usize, value.clamp(0.0, 1.0));
        }
    }
    next
}

fn assert_close(actual: &SimulationFrame, expected: &SimulationFrame, tolerance: f32) {
    for y in 0..expected.height {
        for x in 0..expected.width {
            let (a, e) = (actual.get(x, y), expected.get(x, y));
            assert!(
                (a - e).abs() <= tolerance,
                "cell ({x}, {y}): got {a}, expected {e}"
            );
        }
    }
}

#[test]
fn every_cell_is_written_on_ragged_grids() {
    // Neither dimension is a multiple of the workgroup size.
    let config = config(13, 10, 0.1, 0.5);
    let store = ParameterStore::from(&config);
    let Some(mut scheduler) = headless(&config, &SimulationFrame::new(13, 10), &store) else {
        return;
    };
    scheduler
        .backend()
        .write_field(FieldBuffer::B, &SimulationFrame::filled(13, 10, -7.0))
        .unwrap();

    run_ticks(&mut scheduler, 1);

    let written = read(&scheduler, FieldBuffer::B);
    assert!(
        written.grid.iter().all(|&v| v == 0.0),
        "stale cells left in the output buffer: {:?}",
        written.grid
    );
}

#[test]
fn pointer_press_paints_the_brush_footprint() {
    let config = config(4, 4, 0.1, 0.5);
    let store = ParameterStore::from(&config);
    let Some(mut scheduler) = headless(&config, &SimulationFrame::new(4, 4), &store) else {
        return;
    };
    store.stage_pointer(PointerSample {
        x: 2.0,
        y: 2.0,
        surface_width: 4,
        surface_height: 4,
        pressed: true,
    });

    run_ticks(&mut scheduler, 1);

    let field = read(&scheduler, scheduler.session().current());
    for y in 0..4usize {
        for x in 0..4usize {
            let manhattan = x.abs_diff(2) + y.abs_diff(2);
            let value = field.get(x, y);
            if manhattan <= 1 {
                assert_eq!(value, 1.0, "brush cell ({x}, {y})");
            } else {
                assert_eq!(value, 0.0, "cell ({x}, {y}) outside the brush");
            }
        }
    }
}

#[test]
fn render_samples_the_buffer_compute_just_wrote() {
    let config = config(4, 4, 0.1, 0.5);
    let store = ParameterStore::from(&config);
    let Some(mut scheduler) = headless(&config, &SimulationFrame::new(4, 4), &store) else {
        return;
    };
    store.stage_pointer(PointerSample {
        x: 2.0,
        y: 2.0,
        surface_width: 4,
        surface_height: 4,
        pressed: true,
    });

    run_ticks(&mut scheduler, 1);

    // The read buffer is still all zeros, so any lit pixel came from the written one.
    let field = read(&scheduler, scheduler.session().current());
    let mut expected = vec![0u32; 16];
    display_frame(&field, &mut expected, 4, 4);

    let pixels = pollster::block_on(scheduler.backend().read_target()).unwrap();
    assert_eq!(pixels.len(), 16);
    for (i, (got, want)) in pixels.iter().zip(&expected).enumerate() {
        let want = [(want >> 16) as u8, (want >> 8) as u8, *want as u8];
        for channel in 0..3 {
            assert!(
                got[channel].abs_diff(want[channel]) <= 1,
                "pixel ({}, {}) channel {channel}: got {}, expected {}",
                i % 4,
                i / 4,
                got[channel],
                want[channel]
            );
        }
    }
}

#[test]
fn steps_match_the_host_reference() {
    let config = config(24, 17, 0.2, 0.9);
    let mut start = SimulationFrame::new(24, 17);
    for y in 0..17 {
        for x in 0..24 {
            start.set(x, y, ((x * 7 + y * 13) % 11) as f32 / 10.0);
        }
    }
    let store = ParameterStore::from(&config);
    store.stage_pointer(PointerSample {
        x: 0.0,
        y: 16.5,
        surface_width: 24,
        surface_height: 17,
        pressed: true,
    });
    let Some(mut scheduler) = headless(&config, &start, &store) else {
        return;
    };

    let params = store.snapshot();
    let mut expected = start;
    for _ in 0..3 {
        expected = reference_step(&expected, &params);
    }
    run_ticks(&mut scheduler, 3);

    assert_close(&read(&scheduler, scheduler.session().current()), &expected, 1e-5);
}

#[test]
fn zero_diffusion_leaves_the_field_unchanged() {
    let config = config(16, 16, 0.016, 0.0);
    let mut start = SimulationFrame::new(16, 16);
    for (i, cell) in start.grid.iter_mut().enumerate() {
        *cell = (i % 9) as f32 / 8.0;
    }
    let store = ParameterStore::from(&config);
    let Some(mut scheduler) = headless(&config, &start, &store) else {
        return;
    };

    for _ in 0..4 {
        run_ticks(&mut scheduler, 1);
        let field = read(&scheduler, scheduler.session().current());
        assert_eq!(field, start);
    }
}

#[test]
fn runs_are_bitwise_reproducible() {
    let config = config(9, 9, 0.1, 1.0);
    let mut start = SimulationFrame::new(9, 9);
    start.set(0, 0, 1.0);
    start.set(8, 4, 0.75);

    let mut results = Vec::new();
    for _ in 0..2 {
        let store = ParameterStore::from(&config);
        store.stage_pointer(PointerSample {
            x: 8.9,
            y: 0.0,
            surface_width: 9,
            surface_height: 9,
            pressed: true,
        });
        let Some(mut scheduler) = headless(&config, &start, &store) else {
            return;
        };
        run_ticks(&mut scheduler, 5);
        results.push(read(&scheduler, scheduler.session().current()));
    }

    let bits = |frame: &SimulationFrame| frame.grid.iter().map(|v| v.to_bits()).collect::<Vec<_>>();
    assert_eq!(bits(&results[0]), bits(&results[1]));
    assert!(results[0].grid.iter().all(|v| v.is_finite()));
    assert_eq!(results[0].get(8, 0), 1.0);
}

#[test]
fn broken_kernel_fails_setup() {
    init_logs();
    let config = config(8, 8, 0.1, 0.5);
    let kernels = KernelSources {
        compute: ComputeKernel {
            source: "@compute @workgroup_size(8, 8) fn cs_main( {".into(),
            ..Default::default()
        },
        ..Default::default()
    };
    let result = pollster::block_on(HeadlessRenderer::new(
        &config,
        &SimulationFrame::new(8, 8),
        &SimulationParameters::from(&config),
        &kernels,
    ));
    match result {
        Err(SetupError::Pipeline { stage, .. }) => assert_eq!(stage, "compute"),
        Err(SetupError::NoAdapter(_) | SetupError::MissingCapability(_)) => {
            eprintln!("No usable GPU, skipping");
        }
        Err(e) => panic!("unexpected setup error: {e}"),
        Ok(_) => panic!("setup accepted a kernel that does not parse"),
    }
}

#[test]
fn mismatched_start_frame_is_rejected() {
    init_logs();
    let config = config(8, 8, 0.1, 0.5);
    let result = pollster::block_on(HeadlessRenderer::new(
        &config,
        &SimulationFrame::new(4, 8),
        &SimulationParameters::from(&config),
        &KernelSources::default(),
    ));
    match result {
        Err(SetupError::InvalidConfig(_)) => {}
        Err(SetupError::NoAdapter(_) | SetupError::MissingCapability(_)) => {
            eprintln!("No usable GPU, skipping");
        }
        Err(e) => panic!("unexpected setup error: {e}"),
        Ok(_) => panic!("setup accepted a start frame of the wrong size"),
    }
}

fn expect_setup_rejects(config: &SimulationConfig, what: &str) {
    init_logs();
    let start = SimulationFrame::new(config.grid_width as usize, config.grid_height as usize);
    let result = pollster::block_on(HeadlessRenderer::new(
        config,
        &start,
        &SimulationParameters::from(config),
        &KernelSources::default(),
    ));
    match result {
        Err(SetupError::InvalidConfig(message)) => {
            assert!(message.contains(what), "unexpected message: {message}")
        }
        Err(SetupError::NoAdapter(_) | SetupError::MissingCapability(_)) => {
            eprintln!("No usable GPU, skipping");
        }
        Err(e) => panic!("unexpected setup error: {e}"),
        Ok(_) => panic!(
            "setup accepted a {}x{} grid",
            config.grid_width, config.grid_height
        ),
    }
}

#[test]
fn grid_wider_than_the_target_is_rejected() {
    expect_setup_rejects(&config(40_000, 1, 0.1, 0.5), "texture dimension");
}

#[test]
fn grid_beyond_one_dispatch_is_rejected() {
    expect_setup_rejects(&config(600_000, 1, 0.1, 0.5), "workgroups");
}
