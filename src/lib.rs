use std::sync::Arc;

#[cfg(target_arch = "wasm32")]
use wasm_bindgen::prelude::*;
#[cfg(target_arch = "wasm32")]
use web_sys::HtmlCanvasElement;
use winit::{
    event::{ElementState, KeyEvent, MouseButton, WindowEvent},
    event_loop::{ActiveEventLoop, EventLoop, EventLoopProxy},
    keyboard::{Key, NamedKey},
    window::WindowAttributes,
};

#[cfg(target_arch = "wasm32")]
use winit::platform::web::WindowAttributesExtWebSys;

use crate::{
    gpu::{GpuSimRenderer, KernelSources},
    schedule::{FrameScheduler, FrameTiming, ShutdownToken, SimulationSession, TickOutcome},
    sim::{ParameterStore, PointerSample, SimulationConfig, SimulationFrame},
};

pub mod error;
pub mod gpu;
pub mod rendering;
pub mod schedule;
pub mod sim;
pub mod util;

/// Diffusion rate bounds for the arrow-key controls
const MIN_DIFFUSION: f32 = 0.01;
const MAX_DIFFUSION: f32 = 50.0;

/// Message type for GPU renderer events
pub enum GpuMessage {
    Initialized(GpuSimRenderer),
    Error(String),
}

struct Application {
    proxy: Option<EventLoopProxy<GpuMessage>>,
    config: SimulationConfig,
    params: ParameterStore,
    shutdown: ShutdownToken,
    scheduler: Option<FrameScheduler<GpuSimRenderer>>,
    /// Last cursor position in surface pixels
    cursor: Option<(f64, f64)>,
    pressed: bool,
    failure: Option<anyhow::Error>,
}

impl Application {
    fn new(event_loop: &EventLoop<GpuMessage>, config: SimulationConfig) -> Self {
        let params = ParameterStore::from(&config);
        Self {
            proxy: Some(event_loop.create_proxy()),
            config,
            params,
            shutdown: ShutdownToken::new(),
            scheduler: None,
            cursor: None,
            pressed: false,
            failure: None,
        }
    }

    fn window_attributes() -> WindowAttributes {
        WindowAttributes::default()
            .with_title("diffusim")
            .with_inner_size(winit::dpi::LogicalSize::new(800, 800))
    }

    fn stage_pointer(&self) {
        let (Some(scheduler), Some((x, y))) = (&self.scheduler, self.cursor) else {
            return;
        };
        let (surface_width, surface_height) = scheduler.backend().surface_size();
        self.params.stage_pointer(PointerSample {
            x,
            y,
            surface_width,
            surface_height,
            pressed: self.pressed,
        });
    }

    /// Scale the diffusion rate, keeping the timestep.
    fn adjust_diffusion(&self, factor: f32) {
        let current = self.params.snapshot();
        let rate = (current.diffusion_rate * factor).clamp(MIN_DIFFUSION, MAX_DIFFUSION);
        self.params.set_rates(current.dt, rate);
        log::info!("diffusion rate set to {rate:.3}");
    }

    fn fail(&mut self, event_loop: &ActiveEventLoop, error: anyhow::Error) {
        log::error!("{error:#}");
        self.shutdown.cancel();
        self.scheduler = None;
        self.failure = Some(error);
        event_loop.exit();
    }
}

impl winit::application::ApplicationHandler<GpuMessage> for Application {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.scheduler.is_some() {
            return;
        }
        let Some(proxy) = self.proxy.take() else {
            return;
        };

        #[cfg(target_arch = "wasm32")]
        let window_attrs = {
            let canvas = web_sys::window()
                .and_then(|w| w.document())
                .and_then(|d| d.get_element_by_id("sim-surface"))
                .and_then(|e| e.dyn_into::<HtmlCanvasElement>().ok());
            if canvas.is_none() {
                log::warn!("no canvas with id `sim-surface`, letting winit create one");
            }
            Self::window_attributes().with_canvas(canvas)
        };
        #[cfg(not(target_arch = "wasm32"))]
        let window_attrs = Self::window_attributes();

        let window = match event_loop.create_window(window_attrs) {
            Ok(window) => Arc::new(window),
            Err(e) => {
                self.fail(event_loop, anyhow::anyhow!("failed to create window: {e}"));
                return;
            }
        };

        let config = self.config.clone();
        let parameters = self.params.snapshot();
        let start_frame = SimulationFrame::new(
            config.grid_width as usize,
            config.grid_height as usize,
        );
        let init = async move {
            let message = match GpuSimRenderer::new(
                window,
                &config,
                &start_frame,
                &parameters,
                &KernelSources::default(),
            )
            .await
            {
                Ok(renderer) => GpuMessage::Initialized(renderer),
                Err(e) => GpuMessage::Error(e.to_string()),
            };
            let _ = proxy.send_event(message);
        };

        #[cfg(target_arch = "wasm32")]
        wasm_bindgen_futures::spawn_local(init);

        // On native, use pollster to block on the future
        #[cfg(not(target_arch = "wasm32"))]
        pollster::block_on(init);
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _window_id: winit::window::WindowId,
        event: WindowEvent,
    ) {
        match event {
            WindowEvent::CloseRequested | WindowEvent::Destroyed => {
                self.shutdown.cancel();
                self.scheduler = None;
                event_loop.exit();
            }
            WindowEvent::Resized(size) => {
                if let Some(ref mut scheduler) = self.scheduler {
                    scheduler.backend_mut().resize(size.width, size.height);
                }
            }
            WindowEvent::CursorMoved { position, .. } => {
                self.cursor = Some((position.x, position.y));
                self.stage_pointer();
            }
            WindowEvent::MouseInput {
                state,
                button: MouseButton::Left,
                ..
            } => {
                self.pressed = state == ElementState::Pressed;
                self.stage_pointer();
            }
            WindowEvent::CursorLeft { .. } => {
                self.cursor = None;
                self.pressed = false;
                self.params.release_pointer();
            }
            WindowEvent::KeyboardInput {
                event:
                    KeyEvent {
                        logical_key: Key::Named(key),
                        state: ElementState::Pressed,
                        ..
                    },
                ..
            } => match key {
                NamedKey::ArrowUp => self.adjust_diffusion(1.25),
                NamedKey::ArrowDown => self.adjust_diffusion(0.8),
                _ => (),
            },
            WindowEvent::RedrawRequested => {
                let Some(ref mut scheduler) = self.scheduler else {
                    return;
                };
                match scheduler.tick(FrameTiming::now()) {
                    Ok(TickOutcome::Submitted | TickOutcome::Skipped) => {
                        scheduler.backend().request_redraw();
                    }
                    Ok(TickOutcome::Cancelled | TickOutcome::Halted) => {}
                    Err(e) => self.fail(event_loop, e.into()),
                }
            }
            _ => (),
        };
    }

    fn user_event(&mut self, event_loop: &ActiveEventLoop, event: GpuMessage) {
        match event {
            GpuMessage::Initialized(renderer) => {
                log::info!("GPU renderer initialized successfully");
                // Request first redraw to kick off the frame loop
                renderer.request_redraw();
                let session = SimulationSession::new(self.params.clone(), None);
                self.scheduler = Some(FrameScheduler::new(
                    session,
                    renderer,
                    self.shutdown.clone(),
                ));
            }
            GpuMessage::Error(e) => {
                self.fail(event_loop, anyhow::anyhow!("GPU initialization error: {e}"));
            }
        }
    }
}

/// Initialize logging for the native binary; `RUST_LOG` overrides the default `info` level.
#[cfg(not(target_arch = "wasm32"))]
pub fn init_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .try_init();
}

/// Open a window and run the simulation until it is closed or the device is lost.
#[cfg(not(target_arch = "wasm32"))]
pub fn run(config: SimulationConfig) -> anyhow::Result<()> {
    config.validate()?;
    log::info!(
        "Starting {}x{} field simulation (dt={}, diffusion={})",
        config.grid_width,
        config.grid_height,
        config.timestep,
        config.diffusion_rate
    );

    let event_loop = EventLoop::<GpuMessage>::with_user_event().build()?;
    let mut app = Application::new(&event_loop, config);
    event_loop.run_app(&mut app)?;

    match app.failure.take() {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

#[cfg(target_arch = "wasm32")]
#[wasm_bindgen(start)]
pub fn initialize() {
    console_error_panic_hook::set_once();
    let _ = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{} {}] {}",
                record.level(),
                record.target(),
                message
            ))
        })
        .level(log::LevelFilter::Debug)
        .chain(fern::Output::call(console_log::log))
        .apply();
}

/// Start the field simulation on the `sim-surface` canvas.
#[cfg(target_arch = "wasm32")]
#[wasm_bindgen]
pub fn start() -> Result<(), JsValue> {
    use winit::platform::web::EventLoopExtWebSys;

    log::info!("Starting field simulation with GPU rendering");

    let event_loop = EventLoop::<GpuMessage>::with_user_event()
        .build()
        .map_err(|e| JsValue::from_str(&format!("Failed to create event loop: {e}")))?;
    let app = Application::new(&event_loop, SimulationConfig::default());
    event_loop.spawn_app(app);
    Ok(())
}
