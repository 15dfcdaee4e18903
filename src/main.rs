// Inkwash - GPU fluid canvas
// Licensed under MIT License
//
// Window host. Routes pointer and keyboard input into the engine,
// drives one simulation tick per redraw and persists settings on exit.

mod color;
mod config;
mod fluid;
mod oscillator;
mod programs;
mod targets;

use std::sync::Arc;
use std::time::Instant;

use winit::{
    event::{ElementState, Event, KeyEvent, MouseButton, WindowEvent},
    event_loop::{ActiveEventLoop, EventLoop},
    keyboard::{KeyCode, PhysicalKey},
};

use crate::config::{ConfigPatch, SimulationConfig};
use crate::fluid::{FluidEngine, RenderMode};

fn main() {
    use env_logger::Env;
    env_logger::Builder::from_env(Env::default().default_filter_or("error")).init();

    let config_path = SimulationConfig::default_path();
    let config = SimulationConfig::load_or_default(&config_path);

    let event_loop = EventLoop::new().unwrap();
    let window = Arc::new(
        event_loop
            .create_window(
                winit::window::WindowAttributes::default()
                    .with_title("Inkwash")
                    .with_inner_size(winit::dpi::PhysicalSize::new(1280, 720)),
            )
            .unwrap(),
    );

    let mut engine = match pollster::block_on(FluidEngine::new(window.clone(), config)) {
        Ok(engine) => engine,
        Err(err) => {
            eprintln!("Failed to initialise GPU: {:#}", err);
            std::process::exit(1);
        }
    };

    let mut last_frame = Instant::now();
    let mut cursor_pos: Option<(f32, f32)> = None;
    let mut frame_count = 0u32;
    let mut last_title_update = Instant::now();

    event_loop
        .run(move |event, control_flow| {
            match event {
                Event::WindowEvent {
                    ref event,
                    window_id,
                } if window_id == window.id() => match event {
                    WindowEvent::CloseRequested => control_flow.exit(),
                    WindowEvent::KeyboardInput {
                        event:
                            KeyEvent {
                                physical_key: PhysicalKey::Code(key),
                                state: ElementState::Pressed,
                                ..
                            },
                        ..
                    } => handle_key(*key, &mut engine, control_flow),
                    WindowEvent::CursorMoved { position, .. } => {
                        let pos = (position.x as f32, position.y as f32);
                        cursor_pos = Some(pos);
                        engine.pointer_move(pos.0, pos.1);
                    }
                    WindowEvent::MouseInput {
                        state,
                        button: MouseButton::Left,
                        ..
                    } => {
                        if *state == ElementState::Pressed {
                            let (x, y) = cursor_pos.unwrap_or((0.0, 0.0));
                            engine.pointer_down(x, y);
                        } else {
                            engine.pointer_up();
                        }
                    }
                    WindowEvent::Resized(physical_size) => {
                        engine.resize(*physical_size);
                    }
                    WindowEvent::RedrawRequested => {
                        let now = Instant::now();
                        let dt = fluid::clamp_delta_time((now - last_frame).as_secs_f32());
                        last_frame = now;

                        engine.update(dt);
                        match engine.render() {
                            Ok(()) => {}
                            Err(wgpu::SurfaceError::Lost) => engine.reconfigure_surface(),
                            Err(wgpu::SurfaceError::OutOfMemory) => control_flow.exit(),
                            Err(e) => eprintln!("{:?}", e),
                        }

                        frame_count += 1;
                        let elapsed = last_title_update.elapsed().as_secs_f32();
                        if elapsed >= 1.0 {
                            let fps = frame_count as f32 / elapsed;
                            let frame_ms = 1000.0 * elapsed / frame_count as f32;
                            let (sim_w, sim_h) = engine.sim_dims();
                            let (dye_w, dye_h) = engine.dye_dims();
                            window.set_title(&format!(
                                "Inkwash | sim {}x{} dye {}x{} | {:.0} FPS | {:.2} ms/frame",
                                sim_w, sim_h, dye_w, dye_h, fps, frame_ms
                            ));
                            frame_count = 0;
                            last_title_update = Instant::now();
                        }
                    }
                    _ => {}
                },
                Event::AboutToWait => {
                    window.request_redraw();
                }
                Event::LoopExiting => {
                    if let Err(err) = engine.config().save_to_disk(&config_path) {
                        eprintln!("Failed to save settings: {:#}", err);
                    }
                }
                _ => {}
            }
        })
        .unwrap();
}

fn handle_key(key: KeyCode, engine: &mut FluidEngine, control_flow: &ActiveEventLoop) {
    match key {
        KeyCode::Escape => control_flow.exit(),
        KeyCode::KeyP => engine.toggle_pause(),
        KeyCode::Space => engine.splat_burst(),
        KeyCode::KeyC => engine.cycle_scheme(),
        KeyCode::KeyS => engine.request_screenshot(),
        // 1 composited dye, 2 velocity, 3 pressure, 4 divergence, 5 curl
        KeyCode::Digit1 => engine.set_render_mode(RenderMode::Composite),
        KeyCode::Digit2 => engine.set_render_mode(RenderMode::Velocity),
        KeyCode::Digit3 => engine.set_render_mode(RenderMode::Pressure),
        KeyCode::Digit4 => engine.set_render_mode(RenderMode::Divergence),
        KeyCode::Digit5 => engine.set_render_mode(RenderMode::Curl),
        KeyCode::KeyB => {
            engine.apply_patch(ConfigPatch {
                bloom: Some(!engine.config().bloom),
                ..Default::default()
            });
            println!("Bloom: {}", on_off(engine.config().bloom));
        }
        KeyCode::KeyN => {
            engine.apply_patch(ConfigPatch {
                sunrays: Some(!engine.config().sunrays),
                ..Default::default()
            });
            println!("Sunrays: {}", on_off(engine.config().sunrays));
        }
        KeyCode::KeyH => {
            engine.apply_patch(ConfigPatch {
                shading: Some(!engine.config().shading),
                ..Default::default()
            });
            println!("Shading: {}", on_off(engine.config().shading));
        }
        KeyCode::ArrowUp => {
            engine.apply_patch(ConfigPatch {
                curl: Some(engine.config().curl + 5.0),
                ..Default::default()
            });
            println!("Curl strength: {}", engine.config().curl);
        }
        KeyCode::ArrowDown => {
            engine.apply_patch(ConfigPatch {
                curl: Some(engine.config().curl - 5.0),
                ..Default::default()
            });
            println!("Curl strength: {}", engine.config().curl);
        }
        KeyCode::ArrowRight => {
            engine.apply_patch(ConfigPatch {
                splat_radius: Some(engine.config().splat_radius + 0.05),
                ..Default::default()
            });
            println!("Splat radius: {}", engine.config().splat_radius);
        }
        KeyCode::ArrowLeft => {
            engine.apply_patch(ConfigPatch {
                splat_radius: Some(engine.config().splat_radius - 0.05),
                ..Default::default()
            });
            println!("Splat radius: {}", engine.config().splat_radius);
        }
        _ => {}
    }
}

fn on_off(value: bool) -> &'static str {
    if value {
        "on"
    } else {
        "off"
    }
}
