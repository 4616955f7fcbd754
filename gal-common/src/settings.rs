// SPDX-FileCopyrightText: 2025 gal contributors
// SPDX-License-Identifier: GPL-3.0-or-later

/// Renderer settings, populated from the config INI and command line.
#[derive(Debug, Clone)]
pub struct Settings {
    // Renderer
    pub renderer_backend: RendererBackend,
    pub vsync_enabled: bool,
    pub present_mode: PresentModePreference,
    pub window_width: u32,
    pub window_height: u32,
    pub clear_color: [f32; 4],
    pub transfer_buffer_initial_size: u64,

    // Cache
    pub cache_max_age_secs: u64,
    pub cache_max_removals_per_run: usize,

    // Debug
    pub enable_validation: bool,
    pub use_debug_logging: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            renderer_backend: RendererBackend::Vulkan,
            vsync_enabled: true,
            present_mode: PresentModePreference::Auto,
            window_width: 1280,
            window_height: 720,
            // Cornflower blue, shown until the guest supplies a frame.
            clear_color: [0.39, 0.58, 0.93, 1.0],
            transfer_buffer_initial_size: 0,
            cache_max_age_secs: 5 * 60,
            cache_max_removals_per_run: 10,
            enable_validation: false,
            use_debug_logging: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RendererBackend {
    Vulkan,
    Software,
}

impl RendererBackend {
    pub fn from_str_or_default(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "0" | "software" | "null" => Self::Software,
            "1" | "vulkan" => Self::Vulkan,
            _ => Self::Vulkan,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Vulkan => "vulkan",
            Self::Software => "software",
        }
    }
}

/// Requested presentation pacing. `Auto` follows `vsync_enabled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentModePreference {
    Auto,
    Fifo,
    Mailbox,
    Immediate,
}

impl PresentModePreference {
    pub fn from_str_or_default(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "fifo" => Self::Fifo,
            "mailbox" => Self::Mailbox,
            "immediate" => Self::Immediate,
            _ => Self::Auto,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_from_str() {
        assert_eq!(RendererBackend::from_str_or_default("software"), RendererBackend::Software);
        assert_eq!(RendererBackend::from_str_or_default(" Vulkan "), RendererBackend::Vulkan);
        assert_eq!(RendererBackend::from_str_or_default("0"), RendererBackend::Software);
        assert_eq!(RendererBackend::from_str_or_default("bogus"), RendererBackend::Vulkan);
    }

    #[test]
    fn test_present_mode_from_str() {
        assert_eq!(PresentModePreference::from_str_or_default("MAILBOX"), PresentModePreference::Mailbox);
        assert_eq!(PresentModePreference::from_str_or_default(""), PresentModePreference::Auto);
    }

    #[test]
    fn test_default_cache_limits() {
        let s = Settings::default();
        assert_eq!(s.cache_max_age_secs, 300);
        assert_eq!(s.cache_max_removals_per_run, 10);
    }
}
