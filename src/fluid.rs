// Inkwash - GPU fluid canvas
// Licensed under MIT License
//
// The solver and frame orchestration. Every stage is a fullscreen
// fragment pass over small float textures; double buffers swap after
// each write so no pass reads its own output.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use rand::Rng;
use wgpu::util::DeviceExt;
use winit::dpi::PhysicalSize;
use winit::window::Window;

use crate::color::SchemeManager;
use crate::config::{ConfigPatch, SimulationConfig};
use crate::oscillator::{OscillatorField, OscillatorParams};
use crate::programs::{bind_group, ProgramDesc, ShaderRegistry};
use crate::targets::{grid_size, texel_size, DoubleBuffer, RenderTarget};

const COPY_SRC: &str = include_str!("../shaders/copy.wgsl");
const CLEAR_SRC: &str = include_str!("../shaders/clear.wgsl");
const SPLAT_SRC: &str = include_str!("../shaders/splat.wgsl");
const CURL_SRC: &str = include_str!("../shaders/curl.wgsl");
const VORTICITY_SRC: &str = include_str!("../shaders/vorticity.wgsl");
const DIVERGENCE_SRC: &str = include_str!("../shaders/divergence.wgsl");
const PRESSURE_SRC: &str = include_str!("../shaders/pressure.wgsl");
const GRADIENT_SUBTRACT_SRC: &str = include_str!("../shaders/gradient_subtract.wgsl");
const ADVECTION_SRC: &str = include_str!("../shaders/advection.wgsl");
const BLOOM_PREFILTER_SRC: &str = include_str!("../shaders/bloom_prefilter.wgsl");
const BLOOM_BLUR_SRC: &str = include_str!("../shaders/bloom_blur.wgsl");
const BLOOM_FINAL_SRC: &str = include_str!("../shaders/bloom_final.wgsl");
const SUNRAYS_MASK_SRC: &str = include_str!("../shaders/sunrays_mask.wgsl");
const SUNRAYS_SRC: &str = include_str!("../shaders/sunrays.wgsl");
const BLUR_SRC: &str = include_str!("../shaders/blur.wgsl");
const DISPLAY_SRC: &str = include_str!("../shaders/display.wgsl");
const DEBUG_SRC: &str = include_str!("../shaders/debug.wgsl");

const DYE_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba16Float;
const VELOCITY_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rg16Float;
const SCALAR_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::R16Float;

// Large pauses (window dragging, debugger stops) must not explode the
// integration step.
const MAX_DELTA_TIME: f32 = 1.0 / 60.0;

// A configured radius of zero is legal; the splat still needs a finite
// Gaussian footprint.
const SPLAT_RADIUS_EPSILON: f32 = 1e-6;

const ADDITIVE_BLEND: wgpu::BlendState = wgpu::BlendState {
    color: wgpu::BlendComponent {
        src_factor: wgpu::BlendFactor::One,
        dst_factor: wgpu::BlendFactor::One,
        operation: wgpu::BlendOperation::Add,
    },
    alpha: wgpu::BlendComponent {
        src_factor: wgpu::BlendFactor::One,
        dst_factor: wgpu::BlendFactor::One,
        operation: wgpu::BlendOperation::Add,
    },
};

// Display emits premultiplied color with brightness in alpha, blended
// over the cleared background.
const DISPLAY_BLEND: wgpu::BlendState = wgpu::BlendState {
    color: wgpu::BlendComponent {
        src_factor: wgpu::BlendFactor::One,
        dst_factor: wgpu::BlendFactor::OneMinusSrcAlpha,
        operation: wgpu::BlendOperation::Add,
    },
    alpha: wgpu::BlendComponent {
        src_factor: wgpu::BlendFactor::One,
        dst_factor: wgpu::BlendFactor::OneMinusSrcAlpha,
        operation: wgpu::BlendOperation::Add,
    },
};

const CLEAR_BLACK: wgpu::LoadOp<wgpu::Color> = wgpu::LoadOp::Clear(wgpu::Color::TRANSPARENT);

#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct TexelParams {
    texel_size: [f32; 2],
    _pad: [f32; 2],
}

#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct AdvectionParams {
    texel_size: [f32; 2],
    source_texel_size: [f32; 2],
    dt: f32,
    dissipation: f32,
    _pad: [f32; 2],
}

#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct VorticityParams {
    texel_size: [f32; 2],
    curl: f32,
    dt: f32,
}

#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct ClearParams {
    value: f32,
    _pad: [f32; 3],
}

#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct SplatParams {
    color: [f32; 4],
    point: [f32; 2],
    aspect_ratio: f32,
    radius: f32,
}

#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct BloomPrefilterParams {
    curve: [f32; 4],
}

#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct BloomFinalParams {
    texel_size: [f32; 2],
    intensity: f32,
    _pad: f32,
}

#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct SunraysParams {
    weight: f32,
    _pad: [f32; 3],
}

#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct BlurParams {
    direction: [f32; 2],
    _pad: [f32; 2],
}

#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct DisplayParams {
    texel_size: [f32; 2],
    dither_scale: [f32; 2],
}

#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct DebugParams {
    mode: u32,
    scale: f32,
    _pad: [f32; 2],
}

pub fn clamp_delta_time(elapsed: f32) -> f32 {
    elapsed.clamp(0.0, MAX_DELTA_TIME)
}

// Pointer deltas are normalized against the short screen axis so a
// diagonal drag feels the same in any window shape.
pub fn correct_delta_x(delta: f32, aspect_ratio: f32) -> f32 {
    if aspect_ratio < 1.0 {
        delta * aspect_ratio
    } else {
        delta
    }
}

pub fn correct_delta_y(delta: f32, aspect_ratio: f32) -> f32 {
    if aspect_ratio > 1.0 {
        delta / aspect_ratio
    } else {
        delta
    }
}

pub fn correct_radius(radius: f32, aspect_ratio: f32) -> f32 {
    let mut radius = radius;
    if aspect_ratio > 1.0 {
        radius *= aspect_ratio;
    }
    radius.max(SPLAT_RADIUS_EPSILON)
}

pub fn pointer_texcoord(x: f32, y: f32, width: u32, height: u32) -> [f32; 2] {
    [
        (x / width.max(1) as f32).clamp(0.0, 1.0),
        (y / height.max(1) as f32).clamp(0.0, 1.0),
    ]
}

// Pyramid level sizes below the base, halving until either axis would
// drop under two texels or the iteration cap runs out.
pub fn bloom_chain_dims(base_width: u32, base_height: u32, iterations: u32) -> Vec<(u32, u32)> {
    let mut dims = Vec::new();
    let mut width = base_width >> 1;
    let mut height = base_height >> 1;
    for _ in 0..iterations {
        if width < 2 || height < 2 {
            break;
        }
        dims.push((width, height));
        width >>= 1;
        height >>= 1;
    }
    dims
}

// curve = (threshold - knee, knee * 2, 0.25 / knee), threshold in w.
fn soft_knee_curve(threshold: f32, soft_knee: f32) -> [f32; 4] {
    let knee = threshold * soft_knee + 0.0001;
    [threshold - knee, knee * 2.0, 0.25 / knee, threshold]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderMode {
    Composite,
    Velocity,
    Pressure,
    Divergence,
    Curl,
}

#[derive(Debug, Clone, Copy)]
struct Pointer {
    down: bool,
    moved: bool,
    texcoord: [f32; 2],
    prev_texcoord: [f32; 2],
    delta: [f32; 2],
    color: [f32; 3],
}

impl Default for Pointer {
    fn default() -> Self {
        Self {
            down: false,
            moved: false,
            texcoord: [0.0, 0.0],
            prev_texcoord: [0.0, 0.0],
            delta: [0.0, 0.0],
            color: [0.15, 0.15, 0.15],
        }
    }
}

// One queued impulse. velocity_delta already carries the force factor.
#[derive(Debug, Clone, Copy)]
struct Splat {
    position: [f32; 2],
    velocity_delta: [f32; 2],
    color: [f32; 3],
}

pub struct FluidEngine {
    // GPU stack
    surface: wgpu::Surface<'static>,
    device: wgpu::Device,
    queue: wgpu::Queue,
    surface_config: wgpu::SurfaceConfiguration,
    surface_copy: bool,

    config: SimulationConfig,
    scheme: SchemeManager,
    oscillators: OscillatorField,
    oscillator_colors: Vec<[f32; 3]>,
    registry: ShaderRegistry,
    linear_filtering: bool,

    // Simulation fields
    velocity: DoubleBuffer<RenderTarget>,
    dye: DoubleBuffer<RenderTarget>,
    pressure: DoubleBuffer<RenderTarget>,
    curl: RenderTarget,
    divergence: RenderTarget,

    // Post-processing targets
    bloom: RenderTarget,
    bloom_mips: Vec<RenderTarget>,
    bloom_level_params: Vec<wgpu::Buffer>,
    sunrays: RenderTarget,
    sunrays_temp: RenderTarget,

    linear_sampler: wgpu::Sampler,
    nearest_sampler: wgpu::Sampler,
    dither_view: wgpu::TextureView,
    dither_size: (u32, u32),

    // Per-stage uniforms, rewritten before each submit
    curl_params: wgpu::Buffer,
    vorticity_params: wgpu::Buffer,
    divergence_params: wgpu::Buffer,
    clear_params: wgpu::Buffer,
    pressure_params: wgpu::Buffer,
    gradient_params: wgpu::Buffer,
    advect_velocity_params: wgpu::Buffer,
    advect_dye_params: wgpu::Buffer,
    bloom_prefilter_params: wgpu::Buffer,
    bloom_final_params: wgpu::Buffer,
    sunrays_params: wgpu::Buffer,
    blur_h_params: wgpu::Buffer,
    blur_v_params: wgpu::Buffer,
    display_params: wgpu::Buffer,
    debug_params: wgpu::Buffer,

    // Input state
    pointer: Pointer,
    splat_queue: Vec<Splat>,
    render_mode: RenderMode,
    screenshot_requested: bool,
}

impl FluidEngine {
    pub async fn new(window: Arc<Window>, config: SimulationConfig) -> anyhow::Result<Self> {
        let size = window.inner_size();

        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::PRIMARY,
            ..Default::default()
        });

        let surface = instance
            .create_surface(window.clone())
            .context("failed to create window surface")?;

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: Some(&surface),
                ..Default::default()
            })
            .await
            .context("no suitable GPU adapter found")?;

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("Fluid Device"),
                    required_features: wgpu::Features::empty(),
                    required_limits: wgpu::Limits::default(),
                    memory_hints: Default::default(),
                },
                None,
            )
            .await
            .context("failed to acquire GPU device")?;

        // Half-float render targets are the baseline requirement. Bail
        // with a readable message instead of a validation panic later.
        for format in [DYE_FORMAT, VELOCITY_FORMAT, SCALAR_FORMAT] {
            let features = adapter.get_texture_format_features(format);
            if !features
                .allowed_usages
                .contains(wgpu::TextureUsages::RENDER_ATTACHMENT)
            {
                anyhow::bail!("adapter cannot render to {:?}", format);
            }
        }
        let linear_filtering = [DYE_FORMAT, VELOCITY_FORMAT, SCALAR_FORMAT]
            .iter()
            .all(|format| {
                adapter
                    .get_texture_format_features(*format)
                    .flags
                    .contains(wgpu::TextureFormatFeatureFlags::FILTERABLE)
            });

        // A broken effect pipeline should degrade that effect, not kill
        // the process at submit time.
        device.on_uncaptured_error(Box::new(|error| {
            eprintln!("wgpu error: {}", error);
        }));

        let surface_caps = surface.get_capabilities(&adapter);
        let surface_format = surface_caps.formats[0];
        let surface_copy = surface_caps.usages.contains(wgpu::TextureUsages::COPY_SRC);
        let mut usage = wgpu::TextureUsages::RENDER_ATTACHMENT;
        if surface_copy {
            usage |= wgpu::TextureUsages::COPY_SRC;
        }
        let surface_config = wgpu::SurfaceConfiguration {
            usage,
            format: surface_format,
            width: size.width.max(1),
            height: size.height.max(1),
            present_mode: wgpu::PresentMode::Fifo,
            alpha_mode: surface_caps.alpha_modes[0],
            view_formats: vec![],
            desired_maximum_frame_latency: 2,
        };
        surface.configure(&device, &surface_config);

        let linear_sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("Linear Sampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            address_mode_w: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            ..Default::default()
        });
        let nearest_sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("Nearest Sampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            address_mode_w: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Nearest,
            min_filter: wgpu::FilterMode::Nearest,
            ..Default::default()
        });

        let (dither_view, dither_size) = load_dither_texture(&device, &queue);

        let field_filter = if linear_filtering {
            wgpu::FilterMode::Linear
        } else {
            wgpu::FilterMode::Nearest
        };
        let screen = (surface_config.width, surface_config.height);
        let (sim_w, sim_h) = grid_size(config.sim_resolution, screen.0, screen.1);
        let (dye_w, dye_h) = grid_size(config.dye_resolution, screen.0, screen.1);

        let velocity =
            DoubleBuffer::create(&device, "velocity", sim_w, sim_h, VELOCITY_FORMAT, field_filter);
        let dye = DoubleBuffer::create(&device, "dye", dye_w, dye_h, DYE_FORMAT, field_filter);
        let pressure = DoubleBuffer::create(
            &device,
            "pressure",
            sim_w,
            sim_h,
            SCALAR_FORMAT,
            wgpu::FilterMode::Nearest,
        );
        let curl = RenderTarget::new(&device, "curl", sim_w, sim_h, SCALAR_FORMAT, wgpu::FilterMode::Nearest);
        let divergence = RenderTarget::new(
            &device,
            "divergence",
            sim_w,
            sim_h,
            SCALAR_FORMAT,
            wgpu::FilterMode::Nearest,
        );

        let (bloom, bloom_mips, bloom_level_params) =
            build_bloom_targets(&device, &config, screen, field_filter);
        let (sunrays, sunrays_temp) = build_sunrays_targets(&device, &config, screen, field_filter);

        let blur_h_params = uniform_buffer(&device, "Blur H Params", BlurParams::default_for(&sunrays, true));
        let blur_v_params = uniform_buffer(&device, "Blur V Params", BlurParams::default_for(&sunrays, false));

        use bytemuck::Zeroable;
        let curl_params = uniform_buffer(&device, "Curl Params", TexelParams::zeroed());
        let vorticity_params = uniform_buffer(&device, "Vorticity Params", VorticityParams::zeroed());
        let divergence_params = uniform_buffer(&device, "Divergence Params", TexelParams::zeroed());
        let clear_params = uniform_buffer(&device, "Clear Params", ClearParams::zeroed());
        let pressure_params = uniform_buffer(&device, "Pressure Params", TexelParams::zeroed());
        let gradient_params = uniform_buffer(&device, "Gradient Params", TexelParams::zeroed());
        let advect_velocity_params =
            uniform_buffer(&device, "Advect Velocity Params", AdvectionParams::zeroed());
        let advect_dye_params = uniform_buffer(&device, "Advect Dye Params", AdvectionParams::zeroed());
        let bloom_prefilter_params =
            uniform_buffer(&device, "Bloom Prefilter Params", BloomPrefilterParams::zeroed());
        let bloom_final_params = uniform_buffer(&device, "Bloom Final Params", BloomFinalParams::zeroed());
        let sunrays_params = uniform_buffer(&device, "Sunrays Params", SunraysParams::zeroed());
        let display_params = uniform_buffer(&device, "Display Params", DisplayParams::zeroed());
        let debug_params = uniform_buffer(&device, "Debug Params", DebugParams::zeroed());

        let scheme = SchemeManager::new(&config.color_scheme);
        let oscillators = OscillatorField::new(oscillator_params(&config));
        let registry = ShaderRegistry::new(&device);

        let mut engine = Self {
            surface,
            device,
            queue,
            surface_config,
            surface_copy,
            config,
            scheme,
            oscillators,
            oscillator_colors: Vec::new(),
            registry,
            linear_filtering,
            velocity,
            dye,
            pressure,
            curl,
            divergence,
            bloom,
            bloom_mips,
            bloom_level_params,
            sunrays,
            sunrays_temp,
            linear_sampler,
            nearest_sampler,
            dither_view,
            dither_size,
            curl_params,
            vorticity_params,
            divergence_params,
            clear_params,
            pressure_params,
            gradient_params,
            advect_velocity_params,
            advect_dye_params,
            bloom_prefilter_params,
            bloom_final_params,
            sunrays_params,
            blur_h_params,
            blur_v_params,
            display_params,
            debug_params,
            pointer: Pointer::default(),
            splat_queue: Vec::new(),
            render_mode: RenderMode::Composite,
            screenshot_requested: false,
        };

        engine.refresh_oscillator_colors();
        // An initial burst so the canvas is not empty on startup.
        engine.splat_burst();

        Ok(engine)
    }

    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    pub fn sim_dims(&self) -> (u32, u32) {
        (self.velocity.width(), self.velocity.height())
    }

    pub fn dye_dims(&self) -> (u32, u32) {
        (self.dye.width(), self.dye.height())
    }

    pub fn resize(&mut self, new_size: PhysicalSize<u32>) {
        if new_size.width == 0 || new_size.height == 0 {
            return; // Minimized; keep the old configuration.
        }
        if new_size.width == self.surface_config.width
            && new_size.height == self.surface_config.height
        {
            return;
        }
        self.surface_config.width = new_size.width;
        self.surface_config.height = new_size.height;
        self.surface.configure(&self.device, &self.surface_config);
        self.allocate_sim_targets();
        self.allocate_bloom_targets();
        self.allocate_sunrays_targets();
    }

    // Used after SurfaceError::Lost.
    pub fn reconfigure_surface(&mut self) {
        self.surface.configure(&self.device, &self.surface_config);
    }

    pub fn pointer_down(&mut self, x: f32, y: f32) {
        let texcoord = pointer_texcoord(x, y, self.surface_config.width, self.surface_config.height);
        self.pointer.down = true;
        self.pointer.moved = false;
        self.pointer.texcoord = texcoord;
        self.pointer.prev_texcoord = texcoord;
        self.pointer.delta = [0.0, 0.0];
        let mut rng = rand::thread_rng();
        self.pointer.color = self.scheme.random_color(&mut rng);
    }

    pub fn pointer_move(&mut self, x: f32, y: f32) {
        if !self.pointer.down {
            return;
        }
        let aspect_ratio = self.surface_config.width as f32 / self.surface_config.height as f32;
        let texcoord = pointer_texcoord(x, y, self.surface_config.width, self.surface_config.height);
        self.pointer.prev_texcoord = self.pointer.texcoord;
        self.pointer.texcoord = texcoord;
        self.pointer.delta = [
            correct_delta_x(texcoord[0] - self.pointer.prev_texcoord[0], aspect_ratio),
            correct_delta_y(texcoord[1] - self.pointer.prev_texcoord[1], aspect_ratio),
        ];
        self.pointer.moved = self.pointer.delta[0] != 0.0 || self.pointer.delta[1] != 0.0;
    }

    pub fn pointer_up(&mut self) {
        self.pointer.down = false;
    }

    pub fn toggle_pause(&mut self) {
        self.config.paused = !self.config.paused;
    }

    pub fn cycle_scheme(&mut self) {
        self.scheme.cycle();
        self.config.color_scheme = self.scheme.active_name().to_string();
        self.refresh_oscillator_colors();
        println!("Color scheme: {}", self.config.color_scheme);
    }

    pub fn set_render_mode(&mut self, mode: RenderMode) {
        self.render_mode = mode;
    }

    pub fn request_screenshot(&mut self) {
        self.screenshot_requested = true;
    }

    // Random dye burst, also fired once at startup.
    pub fn splat_burst(&mut self) {
        let mut rng = rand::thread_rng();
        let count = rng.gen_range(5..=25);
        for _ in 0..count {
            let mut color = self.scheme.random_color(&mut rng);
            for channel in &mut color {
                *channel *= 10.0;
            }
            self.splat_queue.push(Splat {
                position: [rng.gen::<f32>(), rng.gen::<f32>()],
                velocity_delta: [
                    1000.0 * (rng.gen::<f32>() - 0.5),
                    1000.0 * (rng.gen::<f32>() - 0.5),
                ],
                color,
            });
        }
    }

    // Runtime reconfiguration; reacts to whatever the patch touched.
    pub fn apply_patch(&mut self, patch: ConfigPatch) {
        let old = self.config.clone();
        patch.apply(&mut self.config);

        if self.config.color_scheme != old.color_scheme {
            let name = self.config.color_scheme.clone();
            self.scheme.set_scheme(&name);
            self.config.color_scheme = self.scheme.active_name().to_string();
            self.refresh_oscillator_colors();
        }

        let params = oscillator_params(&self.config);
        if *self.oscillators.params() != params {
            let count_changed = self.oscillators.params().count != params.count;
            self.oscillators.set_params(params);
            if count_changed {
                self.refresh_oscillator_colors();
            }
        }

        if self.config.sim_resolution != old.sim_resolution
            || self.config.dye_resolution != old.dye_resolution
        {
            self.allocate_sim_targets();
        }
        if self.config.bloom_resolution != old.bloom_resolution
            || self.config.bloom_iterations != old.bloom_iterations
        {
            self.allocate_bloom_targets();
        }
        if self.config.sunrays_resolution != old.sunrays_resolution {
            self.allocate_sunrays_targets();
        }
    }

    fn refresh_oscillator_colors(&mut self) {
        let mut rng = rand::thread_rng();
        self.oscillator_colors = (0..self.config.oscillator_count)
            .map(|_| self.scheme.random_color(&mut rng))
            .collect();
    }

    fn field_filter(&self) -> wgpu::FilterMode {
        if self.linear_filtering {
            wgpu::FilterMode::Linear
        } else {
            wgpu::FilterMode::Nearest
        }
    }

    // Advance the simulation one frame: queued impulses first, then the
    // solver passes. Everything lands in a single submit.
    pub fn update(&mut self, dt: f32) {
        self.drive_oscillators(dt);
        self.queue_pointer_splat();

        if self.splat_queue.is_empty() && self.config.paused {
            return;
        }

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Update Encoder"),
            });

        // 1. Impulses (pointer, auto driver, bursts)
        let splats = std::mem::take(&mut self.splat_queue);
        for splat in &splats {
            self.encode_splat(&mut encoder, splat);
        }

        if !self.config.paused {
            self.encode_step(&mut encoder, dt);
        }

        self.queue.submit(Some(encoder.finish()));
    }

    fn drive_oscillators(&mut self, dt: f32) {
        if self.config.paused || self.pointer.down || self.config.oscillator_count == 0 {
            return;
        }
        let force = self.config.splat_force;
        for (i, seed) in self.oscillators.step(dt).into_iter().enumerate() {
            let color = self
                .oscillator_colors
                .get(i)
                .copied()
                .unwrap_or([0.15, 0.15, 0.15]);
            self.splat_queue.push(Splat {
                position: seed.position,
                velocity_delta: [seed.delta[0] * force, seed.delta[1] * force],
                color,
            });
        }
    }

    fn queue_pointer_splat(&mut self) {
        if !self.pointer.moved {
            return;
        }
        self.pointer.moved = false;
        let force = self.config.splat_force;
        self.splat_queue.push(Splat {
            position: self.pointer.texcoord,
            velocity_delta: [
                self.pointer.delta[0] * force,
                self.pointer.delta[1] * force,
            ],
            color: self.pointer.color,
        });
    }

    fn encode_splat(&mut self, encoder: &mut wgpu::CommandEncoder, splat: &Splat) {
        let aspect_ratio = self.surface_config.width as f32 / self.surface_config.height as f32;
        let radius = correct_radius(self.config.splat_radius / 100.0, aspect_ratio);

        let velocity_params = uniform_buffer(
            &self.device,
            "Splat Velocity Params",
            SplatParams {
                color: [splat.velocity_delta[0], splat.velocity_delta[1], 0.0, 1.0],
                point: splat.position,
                aspect_ratio,
                radius,
            },
        );
        {
            let program = self.registry.get(
                &self.device,
                ProgramDesc {
                    name: "splat",
                    fragment: SPLAT_SRC,
                    format: VELOCITY_FORMAT,
                    blend: None,
                },
                &[],
            );
            let bind = bind_group(
                &self.device,
                &program.layout,
                "Splat Velocity Bind Group",
                Some(&velocity_params),
                pick_sampler(&self.linear_sampler, &self.nearest_sampler, self.velocity.read()),
                &[&self.velocity.read().view],
            );
            fullscreen_pass(
                encoder,
                "Splat Velocity Pass",
                &program.pipeline,
                &bind,
                &self.velocity.write().view,
                CLEAR_BLACK,
            );
        }
        self.velocity.swap();

        let dye_params = uniform_buffer(
            &self.device,
            "Splat Dye Params",
            SplatParams {
                color: [splat.color[0], splat.color[1], splat.color[2], 1.0],
                point: splat.position,
                aspect_ratio,
                radius,
            },
        );
        {
            let program = self.registry.get(
                &self.device,
                ProgramDesc {
                    name: "splat",
                    fragment: SPLAT_SRC,
                    format: DYE_FORMAT,
                    blend: None,
                },
                &[],
            );
            let bind = bind_group(
                &self.device,
                &program.layout,
                "Splat Dye Bind Group",
                Some(&dye_params),
                pick_sampler(&self.linear_sampler, &self.nearest_sampler, self.dye.read()),
                &[&self.dye.read().view],
            );
            fullscreen_pass(
                encoder,
                "Splat Dye Pass",
                &program.pipeline,
                &bind,
                &self.dye.write().view,
                CLEAR_BLACK,
            );
        }
        self.dye.swap();
    }

    fn encode_step(&mut self, encoder: &mut wgpu::CommandEncoder, dt: f32) {
        let texel = self.velocity.texel_size();

        self.queue.write_buffer(
            &self.curl_params,
            0,
            bytemuck::bytes_of(&TexelParams { texel_size: texel, _pad: [0.0; 2] }),
        );
        self.queue.write_buffer(
            &self.vorticity_params,
            0,
            bytemuck::bytes_of(&VorticityParams {
                texel_size: texel,
                curl: self.config.curl,
                dt,
            }),
        );
        self.queue.write_buffer(
            &self.divergence_params,
            0,
            bytemuck::bytes_of(&TexelParams { texel_size: texel, _pad: [0.0; 2] }),
        );
        self.queue.write_buffer(
            &self.clear_params,
            0,
            bytemuck::bytes_of(&ClearParams {
                value: self.config.pressure,
                _pad: [0.0; 3],
            }),
        );
        self.queue.write_buffer(
            &self.pressure_params,
            0,
            bytemuck::bytes_of(&TexelParams { texel_size: texel, _pad: [0.0; 2] }),
        );
        self.queue.write_buffer(
            &self.gradient_params,
            0,
            bytemuck::bytes_of(&TexelParams { texel_size: texel, _pad: [0.0; 2] }),
        );
        self.queue.write_buffer(
            &self.advect_velocity_params,
            0,
            bytemuck::bytes_of(&AdvectionParams {
                texel_size: texel,
                source_texel_size: texel,
                dt,
                dissipation: self.config.velocity_dissipation,
                _pad: [0.0; 2],
            }),
        );
        self.queue.write_buffer(
            &self.advect_dye_params,
            0,
            bytemuck::bytes_of(&AdvectionParams {
                texel_size: texel,
                source_texel_size: self.dye.texel_size(),
                dt,
                dissipation: self.config.density_dissipation,
                _pad: [0.0; 2],
            }),
        );

        let advect_keywords: &[&str] = if self.linear_filtering {
            &[]
        } else {
            &["MANUAL_FILTERING"]
        };

        // 2. Curl (velocity -> curl)
        {
            let program = self.registry.get(
                &self.device,
                ProgramDesc { name: "curl", fragment: CURL_SRC, format: SCALAR_FORMAT, blend: None },
                &[],
            );
            let bind = bind_group(
                &self.device,
                &program.layout,
                "Curl Bind Group",
                Some(&self.curl_params),
                pick_sampler(&self.linear_sampler, &self.nearest_sampler, self.velocity.read()),
                &[&self.velocity.read().view],
            );
            fullscreen_pass(encoder, "Curl Pass", &program.pipeline, &bind, &self.curl.view, CLEAR_BLACK);
        }

        // 3. Vorticity confinement (velocity + curl -> velocity)
        {
            let program = self.registry.get(
                &self.device,
                ProgramDesc {
                    name: "vorticity",
                    fragment: VORTICITY_SRC,
                    format: VELOCITY_FORMAT,
                    blend: None,
                },
                &[],
            );
            let bind = bind_group(
                &self.device,
                &program.layout,
                "Vorticity Bind Group",
                Some(&self.vorticity_params),
                pick_sampler(&self.linear_sampler, &self.nearest_sampler, self.velocity.read()),
                &[&self.velocity.read().view, &self.curl.view],
            );
            fullscreen_pass(
                encoder,
                "Vorticity Pass",
                &program.pipeline,
                &bind,
                &self.velocity.write().view,
                CLEAR_BLACK,
            );
        }
        self.velocity.swap();

        // 4. Divergence (velocity -> divergence)
        {
            let program = self.registry.get(
                &self.device,
                ProgramDesc {
                    name: "divergence",
                    fragment: DIVERGENCE_SRC,
                    format: SCALAR_FORMAT,
                    blend: None,
                },
                &[],
            );
            let bind = bind_group(
                &self.device,
                &program.layout,
                "Divergence Bind Group",
                Some(&self.divergence_params),
                pick_sampler(&self.linear_sampler, &self.nearest_sampler, self.velocity.read()),
                &[&self.velocity.read().view],
            );
            fullscreen_pass(
                encoder,
                "Divergence Pass",
                &program.pipeline,
                &bind,
                &self.divergence.view,
                CLEAR_BLACK,
            );
        }

        // 5. Pressure decay (pressure * value -> pressure)
        {
            let program = self.registry.get(
                &self.device,
                ProgramDesc { name: "clear", fragment: CLEAR_SRC, format: SCALAR_FORMAT, blend: None },
                &[],
            );
            let bind = bind_group(
                &self.device,
                &program.layout,
                "Clear Bind Group",
                Some(&self.clear_params),
                pick_sampler(&self.linear_sampler, &self.nearest_sampler, self.pressure.read()),
                &[&self.pressure.read().view],
            );
            fullscreen_pass(
                encoder,
                "Clear Pressure Pass",
                &program.pipeline,
                &bind,
                &self.pressure.write().view,
                CLEAR_BLACK,
            );
        }
        self.pressure.swap();

        // 6. Jacobi relaxation, fixed iteration count
        for _ in 0..self.config.pressure_iterations {
            let program = self.registry.get(
                &self.device,
                ProgramDesc {
                    name: "pressure",
                    fragment: PRESSURE_SRC,
                    format: SCALAR_FORMAT,
                    blend: None,
                },
                &[],
            );
            let bind = bind_group(
                &self.device,
                &program.layout,
                "Pressure Bind Group",
                Some(&self.pressure_params),
                pick_sampler(&self.linear_sampler, &self.nearest_sampler, self.pressure.read()),
                &[&self.pressure.read().view, &self.divergence.view],
            );
            fullscreen_pass(
                encoder,
                "Pressure Pass",
                &program.pipeline,
                &bind,
                &self.pressure.write().view,
                CLEAR_BLACK,
            );
            self.pressure.swap();
        }

        // 7. Gradient subtraction (pressure + velocity -> velocity)
        {
            let program = self.registry.get(
                &self.device,
                ProgramDesc {
                    name: "gradient_subtract",
                    fragment: GRADIENT_SUBTRACT_SRC,
                    format: VELOCITY_FORMAT,
                    blend: None,
                },
                &[],
            );
            let bind = bind_group(
                &self.device,
                &program.layout,
                "Gradient Bind Group",
                Some(&self.gradient_params),
                pick_sampler(&self.linear_sampler, &self.nearest_sampler, self.velocity.read()),
                &[&self.pressure.read().view, &self.velocity.read().view],
            );
            fullscreen_pass(
                encoder,
                "Gradient Subtract Pass",
                &program.pipeline,
                &bind,
                &self.velocity.write().view,
                CLEAR_BLACK,
            );
        }
        self.velocity.swap();

        // 8. Velocity self-advection
        {
            let program = self.registry.get(
                &self.device,
                ProgramDesc {
                    name: "advection",
                    fragment: ADVECTION_SRC,
                    format: VELOCITY_FORMAT,
                    blend: None,
                },
                advect_keywords,
            );
            let bind = bind_group(
                &self.device,
                &program.layout,
                "Advect Velocity Bind Group",
                Some(&self.advect_velocity_params),
                pick_sampler(&self.linear_sampler, &self.nearest_sampler, self.velocity.read()),
                &[&self.velocity.read().view, &self.velocity.read().view],
            );
            fullscreen_pass(
                encoder,
                "Advect Velocity Pass",
                &program.pipeline,
                &bind,
                &self.velocity.write().view,
                CLEAR_BLACK,
            );
        }
        self.velocity.swap();

        // 9. Dye advection
        {
            let program = self.registry.get(
                &self.device,
                ProgramDesc {
                    name: "advection",
                    fragment: ADVECTION_SRC,
                    format: DYE_FORMAT,
                    blend: None,
                },
                advect_keywords,
            );
            let bind = bind_group(
                &self.device,
                &program.layout,
                "Advect Dye Bind Group",
                Some(&self.advect_dye_params),
                pick_sampler(&self.linear_sampler, &self.nearest_sampler, self.velocity.read()),
                &[&self.velocity.read().view, &self.dye.read().view],
            );
            fullscreen_pass(
                encoder,
                "Advect Dye Pass",
                &program.pipeline,
                &bind,
                &self.dye.write().view,
                CLEAR_BLACK,
            );
        }
        self.dye.swap();
    }

    // Composite the current dye field to the screen.
    pub fn render(&mut self) -> Result<(), wgpu::SurfaceError> {
        let output = self.surface.get_current_texture()?;
        let view = output
            .texture
            .create_view(&wgpu::TextureViewDescriptor::default());

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Render Encoder"),
            });

        if self.render_mode == RenderMode::Composite {
            if self.config.bloom {
                self.encode_bloom(&mut encoder);
            }
            if self.config.sunrays {
                self.encode_sunrays(&mut encoder);
            }
            self.encode_display(&mut encoder, &view);
        } else {
            self.encode_debug(&mut encoder, &view);
        }

        self.queue.submit(Some(encoder.finish()));

        if self.screenshot_requested {
            self.screenshot_requested = false;
            if let Err(error) = self.save_screenshot(&output.texture) {
                eprintln!("Failed to save screenshot: {:#}", error);
            }
        }

        output.present();
        Ok(())
    }

    fn encode_bloom(&mut self, encoder: &mut wgpu::CommandEncoder) {
        // Needs at least two pyramid levels, otherwise the bloom target
        // is left untouched.
        if self.bloom_mips.len() < 2 {
            return;
        }

        let curve = soft_knee_curve(self.config.bloom_threshold, self.config.bloom_soft_knee);
        self.queue.write_buffer(
            &self.bloom_prefilter_params,
            0,
            bytemuck::bytes_of(&BloomPrefilterParams { curve }),
        );
        self.queue.write_buffer(
            &self.bloom_final_params,
            0,
            bytemuck::bytes_of(&BloomFinalParams {
                texel_size: self.bloom_mips[0].texel_size,
                intensity: self.config.bloom_intensity,
                _pad: 0.0,
            }),
        );

        // 1. Prefilter dye into the pyramid base
        {
            let program = self.registry.get(
                &self.device,
                ProgramDesc {
                    name: "bloom_prefilter",
                    fragment: BLOOM_PREFILTER_SRC,
                    format: DYE_FORMAT,
                    blend: None,
                },
                &[],
            );
            let bind = bind_group(
                &self.device,
                &program.layout,
                "Bloom Prefilter Bind Group",
                Some(&self.bloom_prefilter_params),
                pick_sampler(&self.linear_sampler, &self.nearest_sampler, self.dye.read()),
                &[&self.dye.read().view],
            );
            fullscreen_pass(
                encoder,
                "Bloom Prefilter Pass",
                &program.pipeline,
                &bind,
                &self.bloom.view,
                CLEAR_BLACK,
            );
        }

        // 2. Downsample through the pyramid
        for i in 0..self.bloom_mips.len() {
            let program = self.registry.get(
                &self.device,
                ProgramDesc {
                    name: "bloom_blur",
                    fragment: BLOOM_BLUR_SRC,
                    format: DYE_FORMAT,
                    blend: None,
                },
                &[],
            );
            let source_view = if i == 0 {
                &self.bloom.view
            } else {
                &self.bloom_mips[i - 1].view
            };
            let bind = bind_group(
                &self.device,
                &program.layout,
                "Bloom Downsample Bind Group",
                Some(&self.bloom_level_params[i]),
                pick_sampler(&self.linear_sampler, &self.nearest_sampler, &self.bloom),
                &[source_view],
            );
            fullscreen_pass(
                encoder,
                "Bloom Downsample Pass",
                &program.pipeline,
                &bind,
                &self.bloom_mips[i].view,
                CLEAR_BLACK,
            );
        }

        // 3. Upsample additively back towards the base
        for i in (0..self.bloom_mips.len() - 1).rev() {
            let program = self.registry.get(
                &self.device,
                ProgramDesc {
                    name: "bloom_blur_add",
                    fragment: BLOOM_BLUR_SRC,
                    format: DYE_FORMAT,
                    blend: Some(ADDITIVE_BLEND),
                },
                &[],
            );
            let bind = bind_group(
                &self.device,
                &program.layout,
                "Bloom Upsample Bind Group",
                Some(&self.bloom_level_params[i + 2]),
                pick_sampler(&self.linear_sampler, &self.nearest_sampler, &self.bloom),
                &[&self.bloom_mips[i + 1].view],
            );
            fullscreen_pass(
                encoder,
                "Bloom Upsample Pass",
                &program.pipeline,
                &bind,
                &self.bloom_mips[i].view,
                wgpu::LoadOp::Load,
            );
        }

        // 4. Final gather into the bloom target
        {
            let program = self.registry.get(
                &self.device,
                ProgramDesc {
                    name: "bloom_final",
                    fragment: BLOOM_FINAL_SRC,
                    format: DYE_FORMAT,
                    blend: None,
                },
                &[],
            );
            let bind = bind_group(
                &self.device,
                &program.layout,
                "Bloom Final Bind Group",
                Some(&self.bloom_final_params),
                pick_sampler(&self.linear_sampler, &self.nearest_sampler, &self.bloom),
                &[&self.bloom_mips[0].view],
            );
            fullscreen_pass(
                encoder,
                "Bloom Final Pass",
                &program.pipeline,
                &bind,
                &self.bloom.view,
                CLEAR_BLACK,
            );
        }
    }

    fn encode_sunrays(&mut self, encoder: &mut wgpu::CommandEncoder) {
        self.queue.write_buffer(
            &self.sunrays_params,
            0,
            bytemuck::bytes_of(&SunraysParams {
                weight: self.config.sunrays_weight,
                _pad: [0.0; 3],
            }),
        );

        // 1. Occlusion mask, written into the dye scratch side
        {
            let program = self.registry.get(
                &self.device,
                ProgramDesc {
                    name: "sunrays_mask",
                    fragment: SUNRAYS_MASK_SRC,
                    format: DYE_FORMAT,
                    blend: None,
                },
                &[],
            );
            let bind = bind_group(
                &self.device,
                &program.layout,
                "Sunrays Mask Bind Group",
                None,
                pick_sampler(&self.linear_sampler, &self.nearest_sampler, self.dye.read()),
                &[&self.dye.read().view],
            );
            fullscreen_pass(
                encoder,
                "Sunrays Mask Pass",
                &program.pipeline,
                &bind,
                &self.dye.write().view,
                CLEAR_BLACK,
            );
        }

        // 2. Radial march
        {
            let program = self.registry.get(
                &self.device,
                ProgramDesc {
                    name: "sunrays",
                    fragment: SUNRAYS_SRC,
                    format: SCALAR_FORMAT,
                    blend: None,
                },
                &[],
            );
            let bind = bind_group(
                &self.device,
                &program.layout,
                "Sunrays Bind Group",
                Some(&self.sunrays_params),
                pick_sampler(&self.linear_sampler, &self.nearest_sampler, self.dye.read()),
                &[&self.dye.write().view],
            );
            fullscreen_pass(
                encoder,
                "Sunrays Pass",
                &program.pipeline,
                &bind,
                &self.sunrays.view,
                CLEAR_BLACK,
            );
        }

        // 3. One separable blur round to soften the rays
        {
            let program = self.registry.get(
                &self.device,
                ProgramDesc { name: "blur", fragment: BLUR_SRC, format: SCALAR_FORMAT, blend: None },
                &[],
            );
            let bind = bind_group(
                &self.device,
                &program.layout,
                "Blur H Bind Group",
                Some(&self.blur_h_params),
                pick_sampler(&self.linear_sampler, &self.nearest_sampler, &self.sunrays),
                &[&self.sunrays.view],
            );
            fullscreen_pass(
                encoder,
                "Blur H Pass",
                &program.pipeline,
                &bind,
                &self.sunrays_temp.view,
                CLEAR_BLACK,
            );
        }
        {
            let program = self.registry.get(
                &self.device,
                ProgramDesc { name: "blur", fragment: BLUR_SRC, format: SCALAR_FORMAT, blend: None },
                &[],
            );
            let bind = bind_group(
                &self.device,
                &program.layout,
                "Blur V Bind Group",
                Some(&self.blur_v_params),
                pick_sampler(&self.linear_sampler, &self.nearest_sampler, &self.sunrays_temp),
                &[&self.sunrays_temp.view],
            );
            fullscreen_pass(
                encoder,
                "Blur V Pass",
                &program.pipeline,
                &bind,
                &self.sunrays.view,
                CLEAR_BLACK,
            );
        }
    }

    fn encode_display(&mut self, encoder: &mut wgpu::CommandEncoder, surface_view: &wgpu::TextureView) {
        let width = self.surface_config.width;
        let height = self.surface_config.height;
        self.queue.write_buffer(
            &self.display_params,
            0,
            bytemuck::bytes_of(&DisplayParams {
                texel_size: texel_size(width, height),
                dither_scale: [
                    width as f32 / self.dither_size.0 as f32,
                    height as f32 / self.dither_size.1 as f32,
                ],
            }),
        );

        let mut keywords: Vec<&str> = Vec::new();
        if self.config.shading {
            keywords.push("SHADING");
        }
        if self.config.bloom {
            keywords.push("BLOOM");
        }
        if self.config.sunrays {
            keywords.push("SUNRAYS");
        }

        let background = self.config.background_color;
        {
            let program = self.registry.get(
                &self.device,
                ProgramDesc {
                    name: "display",
                    fragment: DISPLAY_SRC,
                    format: self.surface_config.format,
                    blend: Some(DISPLAY_BLEND),
                },
                &keywords,
            );
            // Disabled effects still bind their targets; the keyword
            // branches simply never sample them.
            let bind = bind_group(
                &self.device,
                &program.layout,
                "Display Bind Group",
                Some(&self.display_params),
                pick_sampler(&self.linear_sampler, &self.nearest_sampler, self.dye.read()),
                &[
                    &self.dye.read().view,
                    &self.bloom.view,
                    &self.sunrays.view,
                    &self.dither_view,
                ],
            );
            fullscreen_pass(
                encoder,
                "Display Pass",
                &program.pipeline,
                &bind,
                surface_view,
                wgpu::LoadOp::Clear(wgpu::Color {
                    r: background[0] as f64,
                    g: background[1] as f64,
                    b: background[2] as f64,
                    a: 1.0,
                }),
            );
        }
    }

    fn encode_debug(&mut self, encoder: &mut wgpu::CommandEncoder, surface_view: &wgpu::TextureView) {
        let (field_view, scale, mode) = match self.render_mode {
            RenderMode::Composite => return,
            RenderMode::Velocity => (&self.velocity.read().view, 0.01, 1u32),
            RenderMode::Pressure => (&self.pressure.read().view, 0.05, 2u32),
            RenderMode::Divergence => (&self.divergence.view, 0.05, 3u32),
            RenderMode::Curl => (&self.curl.view, 0.02, 4u32),
        };
        self.queue.write_buffer(
            &self.debug_params,
            0,
            bytemuck::bytes_of(&DebugParams { mode, scale, _pad: [0.0; 2] }),
        );
        {
            let program = self.registry.get(
                &self.device,
                ProgramDesc {
                    name: "debug",
                    fragment: DEBUG_SRC,
                    format: self.surface_config.format,
                    blend: None,
                },
                &[],
            );
            let bind = bind_group(
                &self.device,
                &program.layout,
                "Debug Bind Group",
                Some(&self.debug_params),
                &self.nearest_sampler,
                &[field_view],
            );
            fullscreen_pass(
                encoder,
                "Debug Pass",
                &program.pipeline,
                &bind,
                surface_view,
                wgpu::LoadOp::Clear(wgpu::Color::BLACK),
            );
        }
    }

    // Velocity and dye survive a reshape by resampling the read side;
    // pressure, curl and divergence restart from zero.
    fn allocate_sim_targets(&mut self) {
        let screen = (self.surface_config.width, self.surface_config.height);
        let (sim_w, sim_h) = grid_size(self.config.sim_resolution, screen.0, screen.1);
        let (dye_w, dye_h) = grid_size(self.config.dye_resolution, screen.0, screen.1);
        let filter = self.field_filter();

        if self.velocity.width() != sim_w || self.velocity.height() != sim_h {
            let front = RenderTarget::new(&self.device, "velocity_front", sim_w, sim_h, VELOCITY_FORMAT, filter);
            let back = RenderTarget::new(&self.device, "velocity_back", sim_w, sim_h, VELOCITY_FORMAT, filter);
            let (old_front, _) = self.velocity.replace(front, back);
            resample_into(
                &self.device,
                &self.queue,
                &mut self.registry,
                pick_sampler(&self.linear_sampler, &self.nearest_sampler, &old_front),
                &old_front,
                self.velocity.read(),
            );
        }

        if self.dye.width() != dye_w || self.dye.height() != dye_h {
            let front = RenderTarget::new(&self.device, "dye_front", dye_w, dye_h, DYE_FORMAT, filter);
            let back = RenderTarget::new(&self.device, "dye_back", dye_w, dye_h, DYE_FORMAT, filter);
            let (old_front, _) = self.dye.replace(front, back);
            resample_into(
                &self.device,
                &self.queue,
                &mut self.registry,
                pick_sampler(&self.linear_sampler, &self.nearest_sampler, &old_front),
                &old_front,
                self.dye.read(),
            );
        }

        if self.pressure.width() != sim_w || self.pressure.height() != sim_h {
            self.pressure = DoubleBuffer::create(
                &self.device,
                "pressure",
                sim_w,
                sim_h,
                SCALAR_FORMAT,
                wgpu::FilterMode::Nearest,
            );
            self.curl = RenderTarget::new(&self.device, "curl", sim_w, sim_h, SCALAR_FORMAT, wgpu::FilterMode::Nearest);
            self.divergence = RenderTarget::new(
                &self.device,
                "divergence",
                sim_w,
                sim_h,
                SCALAR_FORMAT,
                wgpu::FilterMode::Nearest,
            );
        }
    }

    fn allocate_bloom_targets(&mut self) {
        let screen = (self.surface_config.width, self.surface_config.height);
        let filter = self.field_filter();
        let (bloom, mips, params) = build_bloom_targets(&self.device, &self.config, screen, filter);
        self.bloom = bloom;
        self.bloom_mips = mips;
        self.bloom_level_params = params;
    }

    fn allocate_sunrays_targets(&mut self) {
        let screen = (self.surface_config.width, self.surface_config.height);
        let filter = self.field_filter();
        let (sunrays, sunrays_temp) = build_sunrays_targets(&self.device, &self.config, screen, filter);
        self.queue.write_buffer(
            &self.blur_h_params,
            0,
            bytemuck::bytes_of(&BlurParams::default_for(&sunrays, true)),
        );
        self.queue.write_buffer(
            &self.blur_v_params,
            0,
            bytemuck::bytes_of(&BlurParams::default_for(&sunrays, false)),
        );
        self.sunrays = sunrays;
        self.sunrays_temp = sunrays_temp;
    }

    fn save_screenshot(&self, frame: &wgpu::Texture) -> anyhow::Result<()> {
        if !self.surface_copy {
            anyhow::bail!("surface does not support copying frames on this backend");
        }

        let width = self.surface_config.width;
        let height = self.surface_config.height;
        let unpadded = width * 4;
        let align = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
        let padded = (unpadded + align - 1) / align * align;

        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Screenshot Readback"),
            size: (padded * height) as u64,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Screenshot Encoder"),
            });
        encoder.copy_texture_to_buffer(
            wgpu::ImageCopyTexture {
                texture: frame,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::ImageCopyBuffer {
                buffer: &buffer,
                layout: wgpu::ImageDataLayout {
                    offset: 0,
                    bytes_per_row: Some(padded),
                    rows_per_image: None,
                },
            },
            wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
        );
        self.queue.submit(Some(encoder.finish()));

        let slice = buffer.slice(..);
        slice.map_async(wgpu::MapMode::Read, |_| {});
        self.device.poll(wgpu::Maintain::Wait);

        let swap_rb = matches!(
            self.surface_config.format,
            wgpu::TextureFormat::Bgra8Unorm | wgpu::TextureFormat::Bgra8UnormSrgb
        );
        let mut img_data = vec![0u8; (width * height * 3) as usize];
        {
            let data = slice.get_mapped_range();
            for y in 0..height as usize {
                let row = &data[y * padded as usize..y * padded as usize + unpadded as usize];
                for x in 0..width as usize {
                    let px = &row[x * 4..x * 4 + 4];
                    let (r, g, b) = if swap_rb {
                        (px[2], px[1], px[0])
                    } else {
                        (px[0], px[1], px[2])
                    };
                    let out = (y * width as usize + x) * 3;
                    img_data[out] = r;
                    img_data[out + 1] = g;
                    img_data[out + 2] = b;
                }
            }
        }
        buffer.unmap();

        let dir = PathBuf::from("screenshots");
        std::fs::create_dir_all(&dir)?;
        let name = format!("inkwash_{}.png", chrono::Local::now().format("%Y%m%d_%H%M%S"));
        let path = dir.join(name);

        let file = std::fs::File::create(&path)?;
        let writer = std::io::BufWriter::new(file);
        let mut png_encoder = png::Encoder::new(writer, width, height);
        png_encoder.set_color(png::ColorType::Rgb);
        png_encoder.set_depth(png::BitDepth::Eight);
        let mut png_writer = png_encoder.write_header()?;
        png_writer.write_image_data(&img_data)?;

        println!("Saved screenshot: {}", path.display());
        Ok(())
    }
}

impl BlurParams {
    fn default_for(target: &RenderTarget, horizontal: bool) -> Self {
        let direction = if horizontal {
            [1.0 / target.width as f32, 0.0]
        } else {
            [0.0, 1.0 / target.height as f32]
        };
        Self { direction, _pad: [0.0; 2] }
    }
}

fn oscillator_params(config: &SimulationConfig) -> OscillatorParams {
    OscillatorParams {
        count: config.oscillator_count,
        damping: config.oscillator_damping,
        stiffness: config.oscillator_stiffness,
        cubic_stiffness: config.oscillator_cubic_stiffness,
        forcing_amplitude: config.oscillator_forcing_amplitude,
        forcing_frequency: config.oscillator_forcing_frequency,
    }
}

fn uniform_buffer<T: bytemuck::Pod>(device: &wgpu::Device, label: &str, value: T) -> wgpu::Buffer {
    device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
        label: Some(label),
        contents: bytemuck::bytes_of(&value),
        usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
    })
}

fn pick_sampler<'a>(
    linear: &'a wgpu::Sampler,
    nearest: &'a wgpu::Sampler,
    target: &RenderTarget,
) -> &'a wgpu::Sampler {
    if target.filter == wgpu::FilterMode::Linear {
        linear
    } else {
        nearest
    }
}

fn fullscreen_pass(
    encoder: &mut wgpu::CommandEncoder,
    label: &str,
    pipeline: &wgpu::RenderPipeline,
    bind: &wgpu::BindGroup,
    view: &wgpu::TextureView,
    load: wgpu::LoadOp<wgpu::Color>,
) {
    let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
        label: Some(label),
        color_attachments: &[Some(wgpu::RenderPassColorAttachment {
            view,
            resolve_target: None,
            ops: wgpu::Operations {
                load,
                store: wgpu::StoreOp::Store,
            },
        })],
        depth_stencil_attachment: None,
        timestamp_writes: None,
        occlusion_query_set: None,
    });
    pass.set_pipeline(pipeline);
    pass.set_bind_group(0, bind, &[]);
    pass.draw(0..3, 0..1); // Full-screen triangle
}

// Blit the old contents into a freshly sized target.
fn resample_into(
    device: &wgpu::Device,
    queue: &wgpu::Queue,
    registry: &mut ShaderRegistry,
    sampler: &wgpu::Sampler,
    source: &RenderTarget,
    dest: &RenderTarget,
) {
    let program = registry.get(
        device,
        ProgramDesc {
            name: "copy",
            fragment: COPY_SRC,
            format: dest.format,
            blend: None,
        },
        &[],
    );
    let bind = bind_group(device, &program.layout, "Resample Bind Group", None, sampler, &[&source.view]);
    let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
        label: Some("Resize Encoder"),
    });
    fullscreen_pass(&mut encoder, "Resample Pass", &program.pipeline, &bind, &dest.view, CLEAR_BLACK);
    queue.submit(Some(encoder.finish()));
}

fn build_bloom_targets(
    device: &wgpu::Device,
    config: &SimulationConfig,
    screen: (u32, u32),
    filter: wgpu::FilterMode,
) -> (RenderTarget, Vec<RenderTarget>, Vec<wgpu::Buffer>) {
    let (base_w, base_h) = grid_size(config.bloom_resolution, screen.0, screen.1);
    let bloom = RenderTarget::new(device, "bloom", base_w, base_h, DYE_FORMAT, filter);

    let mut mips = Vec::new();
    // Level params hold the texel size of each pyramid level, base first.
    let mut level_params = vec![uniform_buffer(
        device,
        "Bloom Level Params",
        TexelParams { texel_size: bloom.texel_size, _pad: [0.0; 2] },
    )];
    for (i, (w, h)) in bloom_chain_dims(base_w, base_h, config.bloom_iterations)
        .into_iter()
        .enumerate()
    {
        let target = RenderTarget::new(device, &format!("bloom_mip_{i}"), w, h, DYE_FORMAT, filter);
        level_params.push(uniform_buffer(
            device,
            "Bloom Level Params",
            TexelParams { texel_size: target.texel_size, _pad: [0.0; 2] },
        ));
        mips.push(target);
    }
    (bloom, mips, level_params)
}

fn build_sunrays_targets(
    device: &wgpu::Device,
    config: &SimulationConfig,
    screen: (u32, u32),
    filter: wgpu::FilterMode,
) -> (RenderTarget, RenderTarget) {
    let (w, h) = grid_size(config.sunrays_resolution, screen.0, screen.1);
    let sunrays = RenderTarget::new(device, "sunrays", w, h, SCALAR_FORMAT, filter);
    let sunrays_temp = RenderTarget::new(device, "sunrays_temp", w, h, SCALAR_FORMAT, filter);
    (sunrays, sunrays_temp)
}

fn load_dither_texture(device: &wgpu::Device, queue: &wgpu::Queue) -> (wgpu::TextureView, (u32, u32)) {
    let (pixels, width, height) = match image::open("assets/dither.png") {
        Ok(img) => {
            let gray = img.to_luma8();
            let (w, h) = gray.dimensions();
            (gray.into_raw(), w, h)
        }
        Err(error) => {
            eprintln!(
                "Warning: could not load assets/dither.png ({}), using generated noise",
                error
            );
            let mut rng = rand::thread_rng();
            let side = 64u32;
            let pixels = (0..side * side).map(|_| rng.gen::<u8>()).collect();
            (pixels, side, side)
        }
    };

    let texture = device.create_texture(&wgpu::TextureDescriptor {
        label: Some("Dither Noise"),
        size: wgpu::Extent3d {
            width,
            height,
            depth_or_array_layers: 1,
        },
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format: wgpu::TextureFormat::R8Unorm,
        usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
        view_formats: &[],
    });
    queue.write_texture(
        wgpu::ImageCopyTexture {
            texture: &texture,
            mip_level: 0,
            origin: wgpu::Origin3d::ZERO,
            aspect: wgpu::TextureAspect::All,
        },
        &pixels,
        wgpu::ImageDataLayout {
            offset: 0,
            bytes_per_row: Some(width),
            rows_per_image: Some(height),
        },
        wgpu::Extent3d {
            width,
            height,
            depth_or_array_layers: 1,
        },
    );
    let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
    (view, (width, height))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delta_time_is_clamped() {
        assert_eq!(clamp_delta_time(0.008), 0.008);
        assert_eq!(clamp_delta_time(0.25), MAX_DELTA_TIME);
        assert_eq!(clamp_delta_time(-0.1), 0.0);
    }

    #[test]
    fn test_delta_correction_landscape() {
        // Wide window: horizontal motion is untouched, vertical shrinks.
        let aspect = 2.0;
        assert_eq!(correct_delta_x(0.1, aspect), 0.1);
        assert!((correct_delta_y(0.1, aspect) - 0.05).abs() < 1e-6);
    }

    #[test]
    fn test_delta_correction_portrait() {
        // Tall window: horizontal shrinks, vertical untouched.
        let aspect = 0.5;
        assert!((correct_delta_x(0.1, aspect) - 0.05).abs() < 1e-6);
        assert_eq!(correct_delta_y(0.1, aspect), 0.1);
    }

    #[test]
    fn test_delta_correction_square_is_identity() {
        assert_eq!(correct_delta_x(0.3, 1.0), 0.3);
        assert_eq!(correct_delta_y(0.3, 1.0), 0.3);
    }

    #[test]
    fn test_radius_correction() {
        assert!((correct_radius(0.0025, 2.0) - 0.005).abs() < 1e-6);
        assert_eq!(correct_radius(0.0025, 0.5), 0.0025);
        assert_eq!(correct_radius(0.0025, 1.0), 0.0025);
    }

    #[test]
    fn test_zero_radius_clamps_to_epsilon() {
        assert!(correct_radius(0.0, 1.5) > 0.0);
        assert!(correct_radius(0.0, 0.5) > 0.0);
    }

    #[test]
    fn test_pointer_texcoord_normalizes_and_clamps() {
        assert_eq!(pointer_texcoord(400.0, 300.0, 800, 600), [0.5, 0.5]);
        assert_eq!(pointer_texcoord(-20.0, 900.0, 800, 600), [0.0, 1.0]);
        // Degenerate window still produces a finite coordinate.
        let coord = pointer_texcoord(10.0, 10.0, 0, 0);
        assert!(coord[0].is_finite() && coord[1].is_finite());
    }

    #[test]
    fn test_bloom_chain_halves_until_too_small() {
        let dims = bloom_chain_dims(256, 128, 8);
        assert_eq!(dims[0], (128, 64));
        assert_eq!(dims[1], (64, 32));
        let last = dims[dims.len() - 1];
        assert!(last.0 >= 2 && last.1 >= 2);
        // 128 halves to 2 in six steps; the seventh would go below two.
        assert_eq!(dims.len(), 6);
    }

    #[test]
    fn test_bloom_chain_respects_iteration_cap() {
        let dims = bloom_chain_dims(256, 128, 3);
        assert_eq!(dims.len(), 3);
    }

    #[test]
    fn test_bloom_chain_too_small_for_pyramid() {
        // Fewer than two levels means the bloom pass must skip entirely.
        let dims = bloom_chain_dims(4, 4, 8);
        assert!(dims.len() < 2);
    }

    #[test]
    fn test_soft_knee_curve_shape() {
        let curve = soft_knee_curve(0.6, 0.7);
        let knee = 0.6 * 0.7 + 0.0001;
        assert!((curve[0] - (0.6 - knee)).abs() < 1e-6);
        assert!((curve[1] - knee * 2.0).abs() < 1e-6);
        assert!((curve[2] - 0.25 / knee).abs() < 1e-6);
        assert_eq!(curve[3], 0.6);
    }

    #[test]
    fn test_soft_knee_curve_survives_zero_knee() {
        let curve = soft_knee_curve(0.5, 0.0);
        assert!(curve[2].is_finite());
    }

}
