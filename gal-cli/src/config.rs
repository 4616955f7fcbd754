// SPDX-FileCopyrightText: 2025 gal contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use gal_common::settings::{PresentModePreference, RendererBackend, Settings};
use ini::{Ini, Properties};
use log::{debug, info, warn};
use std::path::{Path, PathBuf};

const CONFIG_DIR: &str = "gal";
const CONFIG_FILE: &str = "config.ini";

/// Locate config.ini under `$XDG_CONFIG_HOME/gal` or `~/.config/gal`.
pub fn find_config_path() -> Option<PathBuf> {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        let path = PathBuf::from(&xdg).join(CONFIG_DIR).join(CONFIG_FILE);
        if path.exists() {
            return Some(path);
        }
    }

    if let Ok(home) = std::env::var("HOME") {
        let path = PathBuf::from(&home)
            .join(".config")
            .join(CONFIG_DIR)
            .join(CONFIG_FILE);
        if path.exists() {
            return Some(path);
        }
    }

    None
}

fn parse_bool(value: &str) -> bool {
    let value = value.trim();
    value == "true" || value == "1"
}

fn parse_or<T: std::str::FromStr>(section: &Properties, key: &str, default: T) -> T {
    match section.get(key) {
        Some(value) => value.trim().parse().unwrap_or_else(|_| {
            warn!("Ignoring invalid value for {}: {:?}", key, value);
            default
        }),
        None => default,
    }
}

/// Parse "r, g, b, a" with components in [0, 1].
fn parse_color(value: &str) -> Option<[f32; 4]> {
    let parts: Vec<f32> = value
        .split(',')
        .map(|c| c.trim().parse::<f32>())
        .collect::<Result<_, _>>()
        .ok()?;
    match parts.as_slice() {
        &[r, g, b, a] => Some([r, g, b, a].map(|c| c.clamp(0.0, 1.0))),
        &[r, g, b] => Some([r.clamp(0.0, 1.0), g.clamp(0.0, 1.0), b.clamp(0.0, 1.0), 1.0]),
        _ => None,
    }
}

/// Apply the known sections of `conf` on top of `settings`.
pub fn apply_ini(settings: &mut Settings, conf: &Ini) {
    // [Renderer]
    if let Some(section) = conf.section(Some("Renderer")) {
        if let Some(backend) = section.get("backend") {
            settings.renderer_backend = RendererBackend::from_str_or_default(backend);
            debug!("Renderer backend: {:?}", settings.renderer_backend);
        }
        if let Some(vsync) = section.get("use_vsync") {
            settings.vsync_enabled = parse_bool(vsync);
        }
        if let Some(mode) = section.get("present_mode") {
            settings.present_mode = PresentModePreference::from_str_or_default(mode);
        }
        settings.window_width = parse_or(section, "window_width", settings.window_width);
        settings.window_height = parse_or(section, "window_height", settings.window_height);
        if let Some(color) = section.get("clear_color") {
            match parse_color(color) {
                Some(c) => settings.clear_color = c,
                None => warn!("Ignoring invalid clear_color: {:?}", color),
            }
        }
        settings.transfer_buffer_initial_size = parse_or(
            section,
            "transfer_buffer_initial_size",
            settings.transfer_buffer_initial_size,
        );
    }

    // [Cache]
    if let Some(section) = conf.section(Some("Cache")) {
        settings.cache_max_age_secs = parse_or(section, "max_age_secs", settings.cache_max_age_secs);
        settings.cache_max_removals_per_run = parse_or(
            section,
            "max_removals_per_run",
            settings.cache_max_removals_per_run,
        );
    }

    // [Debugging]
    if let Some(section) = conf.section(Some("Debugging")) {
        if let Some(validation) = section.get("enable_validation") {
            settings.enable_validation = parse_bool(validation);
        }
        if let Some(debug_log) = section.get("use_debug_logging") {
            settings.use_debug_logging = parse_bool(debug_log);
        }
    }
}

/// Load settings from config.ini, falling back to defaults.
pub fn load_config(path: Option<&Path>) -> Settings {
    let mut settings = Settings::default();

    let config_path = match path {
        Some(p) => {
            if !p.exists() {
                warn!("Config file not found: {}", p.display());
                return settings;
            }
            p.to_path_buf()
        }
        None => match find_config_path() {
            Some(p) => p,
            None => {
                info!("No config file found, using defaults");
                return settings;
            }
        },
    };

    info!("Loading config from: {}", config_path.display());

    match Ini::load_from_file(&config_path) {
        Ok(conf) => apply_ini(&mut settings, &conf),
        Err(e) => warn!("Failed to parse config: {}", e),
    }
    settings
}
