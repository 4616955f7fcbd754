// SPDX-FileCopyrightText: 2025 gal contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Renderer configuration derived from user settings.

use std::time::Duration;

use gal_common::settings::{PresentModePreference, Settings};
use gal_common::Extent2D;

use crate::cache::CacheLimits;

/// Renderer configuration, derived from [`Settings`] at startup.
#[derive(Debug, Clone)]
pub struct RendererConfig {
    pub cache_limits: CacheLimits,
    pub clear_color: [f32; 4],
    pub vsync: bool,
    pub present_mode: PresentModePreference,
    pub window: Extent2D,
    pub transfer_buffer_initial_size: u64,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self::from(&Settings::default())
    }
}

impl From<&Settings> for RendererConfig {
    fn from(settings: &Settings) -> Self {
        Self {
            cache_limits: CacheLimits {
                max_age: Duration::from_secs(settings.cache_max_age_secs),
                max_removals_per_run: settings.cache_max_removals_per_run,
            },
            clear_color: settings.clear_color,
            vsync: settings.vsync_enabled,
            present_mode: settings.present_mode,
            window: Extent2D::new(settings.window_width, settings.window_height),
            transfer_buffer_initial_size: settings.transfer_buffer_initial_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_settings() {
        let mut settings = Settings::default();
        settings.cache_max_age_secs = 30;
        settings.cache_max_removals_per_run = 4;
        settings.window_width = 640;
        settings.window_height = 360;

        let config = RendererConfig::from(&settings);
        assert_eq!(config.cache_limits.max_age, Duration::from_secs(30));
        assert_eq!(config.cache_limits.max_removals_per_run, 4);
        assert_eq!(config.window, Extent2D::new(640, 360));
    }
}
