use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use stereo_cube::config::{AppConfig, RuntimeKind};
use stereo_cube::vr::StartupError;
use stereo_cube::State;
use winit::{
    dpi::PhysicalSize,
    event::*,
    keyboard::{KeyCode, PhysicalKey},
    window::WindowBuilder,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Use the built-in simulated headset instead of an OpenXR runtime
    #[arg(long)]
    simulate: bool,

    /// Eye texture resolution relative to the headset's recommendation
    #[arg(long)]
    pixel_density: Option<f32>,

    /// Near clip plane distance
    #[arg(long)]
    near: Option<f32>,

    /// Far clip plane distance
    #[arg(long)]
    far: Option<f32>,

    /// Mirror window width
    #[arg(long)]
    width: Option<u32>,

    /// Mirror window height
    #[arg(long)]
    height: Option<u32>,

    /// Wait for vertical blank when presenting the mirror window
    #[arg(long)]
    vsync: bool,

    /// Textures per eye for the simulated headset
    #[arg(long)]
    swap_textures: Option<usize>,
}

impl Args {
    fn into_config(self) -> AppConfig {
        let mut config = AppConfig::default();
        if self.simulate {
            config.runtime = RuntimeKind::Simulated;
        }
        if let Some(density) = self.pixel_density {
            config.scene.pixel_density = density;
        }
        if let Some(near) = self.near {
            config.scene.near = near;
        }
        if let Some(far) = self.far {
            config.scene.far = far;
        }
        if let Some(width) = self.width {
            config.window_width = width;
        }
        if let Some(height) = self.height {
            config.window_height = height;
        }
        if let Some(count) = self.swap_textures {
            config.simulated_swap_textures = count;
        }
        config.vsync = self.vsync;
        config
    }
}

fn main() {
    env_logger::init();
    let config = Args::parse().into_config();

    if let Err(err) = config.validate() {
        log::error!("Invalid configuration: {}", err);
        eprintln!("Invalid configuration: {}", err);
        std::process::exit(2);
    }

    if let Err(err) = run(config) {
        report_fatal(&err);
        std::process::exit(1);
    }
}

/// Startup failures get their own title; anything else is reported as is.
fn report_fatal(err: &anyhow::Error) {
    match err.downcast_ref::<StartupError>() {
        Some(startup) => {
            log::error!("{}: {}", startup.title(), startup);
            eprintln!("{}: {}", startup.title(), startup);
        }
        None => {
            log::error!("{:#}", err);
            eprintln!("Error: {:#}", err);
        }
    }
}

fn run(config: AppConfig) -> anyhow::Result<()> {
    let event_loop = winit::event_loop::EventLoop::new()
        .map_err(|e| anyhow::anyhow!("Failed to create event loop: {}", e))?;

    let window = WindowBuilder::new()
        .with_title("Stereo Cube")
        .with_inner_size(PhysicalSize::new(config.window_width, config.window_height))
        .with_visible(true)
        .build(&event_loop)
        .map_err(|e| anyhow::anyhow!("Failed to create window: {}", e))?;
    let window = Arc::new(window);

    let mut state = Some(State::new(window.clone(), &config)?);
    let mut last_frame = Instant::now();

    event_loop
        .run(move |event, window_target| match event {
            Event::WindowEvent { window_id, event } if window_id == window.id() => match event {
                WindowEvent::KeyboardInput {
                    event:
                        KeyEvent {
                            physical_key: PhysicalKey::Code(KeyCode::Escape),
                            state: ElementState::Pressed,
                            ..
                        },
                    ..
                }
                | WindowEvent::CloseRequested => {
                    window_target.exit();
                }
                WindowEvent::Resized(new_size) => {
                    if let Some(state) = &mut state {
                        state.resize(new_size.width, new_size.height);
                    }
                }
                WindowEvent::RedrawRequested => {
                    let now = Instant::now();
                    let dt = (now - last_frame).as_secs_f32();
                    last_frame = now;

                    if let Some(state) = &mut state {
                        let report = state.render(dt);
                        if report.exit_requested() {
                            log::info!("Runtime requested exit after frame {}", report.frame_index);
                            window_target.exit();
                        }
                    }
                }
                _ => {}
            },
            Event::AboutToWait => {
                if let Some(state) = &state {
                    state.window().request_redraw();
                }
            }
            Event::LoopExiting => {
                if let Some(state) = state.take() {
                    state.shutdown();
                }
            }
            _ => {}
        })
        .map_err(|e| anyhow::anyhow!("Event loop failed: {}", e))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_without_flags() {
        let config = Args::parse_from(["stereo-cube"]).into_config();
        assert_eq!(config, AppConfig::default());
    }

    #[test]
    fn test_flags_override_defaults() {
        let config = Args::parse_from([
            "stereo-cube",
            "--simulate",
            "--pixel-density",
            "0.75",
            "--far",
            "500",
            "--vsync",
            "--swap-textures",
            "2",
        ])
        .into_config();
        assert_eq!(config.runtime, RuntimeKind::Simulated);
        assert_eq!(config.scene.pixel_density, 0.75);
        assert_eq!(config.scene.far, 500.0);
        assert_eq!(config.scene.near, 0.1);
        assert!(config.vsync);
        assert_eq!(config.simulated_swap_textures, 2);
    }

    #[test]
    fn test_infinite_far_plane_is_rejected() {
        let config = Args::parse_from(["stereo-cube", "--far", "inf"]).into_config();
        assert!(config.scene.far.is_infinite());
        assert!(config.validate().is_err());
    }
}
