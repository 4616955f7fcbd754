// SPDX-FileCopyrightText: 2025 gal contributors
// SPDX-License-Identifier: GPL-3.0-or-later

/// Identity of a cached host resource (usually a resolved guest GPU address).
///
/// Only unique within one cache instance: the image cache and the buffer cache
/// may both hold an entry for the same key.
pub type CacheKey = u64;

/// Number of shader stages that can participate in a linked program.
pub const GRAPHICS_STAGE_COUNT: usize = 5;

/// Const buffer slots per shader stage on the emulated GPU.
pub const CONST_BUFFERS_PER_STAGE: usize = 18;

/// Width/height pair in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Extent2D {
    pub width: u32,
    pub height: u32,
}

impl Extent2D {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// True if either dimension is zero (e.g. a minimised window).
    pub const fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

/// Align a value up to the given power-of-two alignment.
#[inline]
pub const fn align_up(value: u64, alignment: u64) -> u64 {
    let mask = alignment - 1;
    (value + mask) & !mask
}

/// Integer division rounding towards positive infinity.
#[inline]
pub const fn div_round_up(value: u32, divisor: u32) -> u32 {
    (value + divisor - 1) / divisor
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 256), 0);
        assert_eq!(align_up(1, 256), 256);
        assert_eq!(align_up(256, 256), 256);
        assert_eq!(align_up(257, 256), 512);
    }

    #[test]
    fn test_div_round_up() {
        assert_eq!(div_round_up(64, 4), 16);
        assert_eq!(div_round_up(65, 4), 17);
        assert_eq!(div_round_up(1, 12), 1);
    }

    #[test]
    fn test_extent_is_empty() {
        assert!(Extent2D::new(0, 720).is_empty());
        assert!(Extent2D::new(1280, 0).is_empty());
        assert!(!Extent2D::new(1280, 720).is_empty());
    }
}
