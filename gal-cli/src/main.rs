// SPDX-FileCopyrightText: 2025 gal contributors
// SPDX-License-Identifier: GPL-3.0-or-later

mod config;

use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};
use std::path::PathBuf;

use gal::backend::vulkan::ContextOptions;
use gal::format::{ImageDescriptor, ImageFormat, NumericType, Sampler, Shape, Swizzle};
use gal::shader::{BufferBindings, ShaderDecl, StageKind};
use gal::{Backend, BackendType, Renderer, RendererConfig, SoftwareBackend, VulkanBackend};
use gal_common::settings::RendererBackend;
use gal_common::CacheKey;

/// gal - host graphics abstraction layer driver
#[derive(Parser, Debug)]
#[command(name = "gal", version, about = "Runs a resource and submission workload against a host backend")]
struct Args {
    /// Path to config file (default: $XDG_CONFIG_HOME/gal/config.ini)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Renderer backend: vulkan or software
    #[arg(short, long)]
    backend: Option<String>,

    /// Number of frames to run
    #[arg(short, long, default_value_t = 3)]
    frames: u32,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

const TEXTURE_KEY: CacheKey = 0x1000;
const FRAME_KEY: CacheKey = 0x1800;
const TARGET_KEY: CacheKey = 0x2000;
const TRANSFORM_KEY: CacheKey = 0x3000;
const VERTEX_KEY: CacheKey = 0x4000;
const FRAGMENT_KEY: CacheKey = 0x4001;

const VERTEX_SOURCE: &str = r#"#version 450
layout(set = 0, binding = 0) uniform Transform {
    mat4 mvp;
} transform;
layout(location = 0) in vec3 position;
layout(location = 1) in vec2 uv;
layout(location = 0) out vec2 frag_uv;
void main() {
    frag_uv = uv;
    gl_Position = transform.mvp * vec4(position, 1.0);
}
"#;

const FRAGMENT_SOURCE: &str = r#"#version 450
layout(location = 0) in vec2 frag_uv;
layout(location = 0) out vec4 color;
void main() {
    color = vec4(frag_uv, 0.5, 1.0);
}
"#;

fn rgba8(width: u32, height: u32) -> Result<ImageDescriptor> {
    let format = ImageFormat::new(Shape::R8G8B8A8, NumericType::Unorm)?;
    Ok(ImageDescriptor::new(width, height, format))
}

fn gradient(width: u32, height: u32) -> Vec<u8> {
    let mut data = Vec::with_capacity((width * height * 4) as usize);
    for y in 0..height {
        for x in 0..width {
            data.extend_from_slice(&[(x * 255 / width) as u8, (y * 255 / height) as u8, 0x80, 0xFF]);
        }
    }
    data
}

fn transform_bytes(frame: u32) -> Vec<u8> {
    let scale = 1.0 + frame as f32 * 0.1;
    #[rustfmt::skip]
    let mvp: [f32; 16] = [
        scale, 0.0, 0.0, 0.0,
        0.0, scale, 0.0, 0.0,
        0.0, 0.0, 1.0, 0.0,
        0.0, 0.0, 0.0, 1.0,
    ];
    mvp.iter().flat_map(|v| v.to_le_bytes()).collect()
}

/// Exercise the caches, the program cache and the submission tracker.
/// `advance` runs after every frame so a simulated device can make progress.
fn run_workload<B: Backend + 'static>(
    renderer: &mut Renderer<B>,
    frames: u32,
    mut advance: impl FnMut(&mut B),
) -> Result<()> {
    let texture = rgba8(64, 64)?;
    renderer
        .create_image(TEXTURE_KEY, &gradient(64, 64), texture)
        .context("creating texture")?;
    renderer
        .create_image(FRAME_KEY, &gradient(320, 180), rgba8(320, 180)?)
        .context("creating frame image")?;
    renderer
        .ensure_render_target(TARGET_KEY, rgba8(128, 128)?)
        .context("creating render target")?;

    // Same bytes, different view of them.
    let r16 = ImageDescriptor::new(128, 64, ImageFormat::new(Shape::R16, NumericType::Uint)?);
    renderer
        .reinterpret_image(TEXTURE_KEY, r16)
        .context("reinterpreting texture")?;
    info!(
        "Texture 0x{:X} reinterpreted: {} bytes cached",
        TEXTURE_KEY,
        renderer.image_size(TEXTURE_KEY).unwrap_or(0)
    );

    renderer.create_uniform_buffer(TRANSFORM_KEY, 64)?;
    let vertex = renderer
        .create_shader_stage(
            StageKind::Vertex,
            VERTEX_KEY,
            VERTEX_SOURCE.to_string(),
            Vec::new(),
            vec![ShaderDecl::new("Transform", 0)],
        )
        .context("creating vertex stage")?;
    let fragment = renderer
        .create_shader_stage(
            StageKind::Fragment,
            FRAGMENT_KEY,
            FRAGMENT_SOURCE.to_string(),
            Vec::new(),
            Vec::new(),
        )
        .context("creating fragment stage")?;

    let mut bindings = BufferBindings::new();
    bindings.set(StageKind::Vertex, 0, Some(TRANSFORM_KEY));

    for frame in 0..frames {
        renderer.lock_caches();
        renderer.set_uniform_buffer_data(TRANSFORM_KEY, 64, &transform_bytes(frame))?;
        renderer.bind_shader(vertex);
        renderer.bind_shader(fragment);
        if !renderer.bind_active_program()? {
            warn!("No program active for frame {}", frame);
        }
        let bound = renderer.bind_const_buffers(&bindings)?;
        renderer.bind_texture(FRAME_KEY, 0, &Swizzle::IDENTITY, &Sampler::default())?;
        renderer.unlock_caches();

        let call = renderer.flush()?;
        match renderer.present(Some(FRAME_KEY)) {
            Ok(status) => info!("Frame {}: call {:?}, {} buffers bound, {:?}", frame, call, bound, status),
            // Headless devices have nothing to present to.
            Err(e) if e.is_not_supported() => {
                info!("Frame {}: call {:?}, {} buffers bound", frame, call, bound)
            }
            Err(e) => return Err(e.into()),
        }
        advance(renderer.backend_mut());
    }

    let stats = renderer.stats();
    info!(
        "Stats: {} images, {} buffers, {} stages, {} programs, {} reinterprets, {} calls outstanding",
        stats.images, stats.buffers, stats.stages, stats.programs, stats.reinterprets, stats.outstanding_calls
    );
    renderer.shutdown()?;
    Ok(())
}

fn run_software(config: RendererConfig, frames: u32) -> Result<()> {
    let mut renderer = Renderer::new(SoftwareBackend::new(), config);
    renderer.enable_presentation();
    run_workload(&mut renderer, frames, |backend| backend.device_mut().complete_all())
}

fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level))
        .format_timestamp_millis()
        .init();

    info!("gal - host graphics abstraction layer");

    let mut settings = config::load_config(args.config.as_deref());
    if let Some(backend) = &args.backend {
        settings.renderer_backend = RendererBackend::from_str_or_default(backend);
    }
    info!("Renderer backend: {}", settings.renderer_backend.label());
    let renderer_config = RendererConfig::from(&settings);

    match BackendType::from(settings.renderer_backend) {
        BackendType::Vulkan => {
            let options = ContextOptions {
                enable_validation: settings.enable_validation,
                ..ContextOptions::default()
            };
            match VulkanBackend::headless(&options) {
                Ok(backend) => {
                    let mut renderer = Renderer::new(backend, renderer_config);
                    run_workload(&mut renderer, args.frames, |_| {})
                }
                Err(e) => {
                    warn!("Vulkan unavailable ({}), falling back to the software backend", e);
                    run_software(renderer_config, args.frames)
                }
            }
        }
        BackendType::Software => run_software(renderer_config, args.frames),
    }
}
