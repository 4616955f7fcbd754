// SPDX-FileCopyrightText: 2025 gal contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Image formats, descriptors and samplers.
//!
//! A guest format is a `(Shape, NumericType)` pair. Only the pairs listed in
//! [`Shape::allowed_types`] exist on the emulated hardware; everything else is
//! rejected when an [`ImageFormat`] is built.

use byteorder::{ByteOrder, LittleEndian};
use gal_common::div_round_up;

use crate::error::{GalError, GalResult};

/// How the bits of a texel are interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NumericType {
    Snorm,
    Unorm,
    Sint,
    Uint,
    Sfloat,
}

/// Block-compression family of a shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Compression {
    None,
    Bc,
    Etc,
    Astc,
}

/// Pixel shape: channel layout and bit widths, or a compressed block layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Shape {
    Astc4x4,
    Astc5x4,
    Astc5x5,
    Astc6x5,
    Astc6x6,
    Astc8x5,
    Astc8x6,
    Astc8x8,
    Astc10x5,
    Astc10x6,
    Astc10x8,
    Astc10x10,
    Astc12x10,
    Astc12x12,
    R4G4,
    R4G4B4A4,
    B4G4R4A4,
    R5G6B5,
    B5G6R5,
    R5G5B5A1,
    B5G5R5A1,
    A1R5G5B5,
    R8,
    R8G8,
    R8G8B8,
    B8G8R8,
    R8G8B8A8,
    B8G8R8A8,
    A8B8G8R8,
    A8B8G8R8Srgb,
    A2R10G10B10,
    A2B10G10R10,
    R16,
    R16G16,
    R16G16B16,
    R16G16B16A16,
    R32,
    R32G32,
    R32G32B32,
    R32G32B32A32,
    R64,
    R64G64,
    R64G64B64,
    R64G64B64A64,
    B10G11R11,
    E5B9G9R9,
    D16,
    X8D24,
    D32,
    S8,
    D16S8,
    D24S8,
    D32S8,
    Bc1Rgb,
    Bc1Rgba,
    Bc2,
    Bc3,
    Bc4,
    Bc5,
    Bc6hSf16,
    Bc6hUf16,
    Bc7,
    Etc2R8G8B8,
    Etc2R8G8B8A1,
    Etc2R8G8B8A8,
    EacR11,
    EacR11G11,
    R4G4B4A4Reversed,
}

impl Shape {
    /// Every shape, in declaration order.
    pub const ALL: [Shape; 68] = [
        Shape::Astc4x4,
        Shape::Astc5x4,
        Shape::Astc5x5,
        Shape::Astc6x5,
        Shape::Astc6x6,
        Shape::Astc8x5,
        Shape::Astc8x6,
        Shape::Astc8x8,
        Shape::Astc10x5,
        Shape::Astc10x6,
        Shape::Astc10x8,
        Shape::Astc10x10,
        Shape::Astc12x10,
        Shape::Astc12x12,
        Shape::R4G4,
        Shape::R4G4B4A4,
        Shape::B4G4R4A4,
        Shape::R5G6B5,
        Shape::B5G6R5,
        Shape::R5G5B5A1,
        Shape::B5G5R5A1,
        Shape::A1R5G5B5,
        Shape::R8,
        Shape::R8G8,
        Shape::R8G8B8,
        Shape::B8G8R8,
        Shape::R8G8B8A8,
        Shape::B8G8R8A8,
        Shape::A8B8G8R8,
        Shape::A8B8G8R8Srgb,
        Shape::A2R10G10B10,
        Shape::A2B10G10R10,
        Shape::R16,
        Shape::R16G16,
        Shape::R16G16B16,
        Shape::R16G16B16A16,
        Shape::R32,
        Shape::R32G32,
        Shape::R32G32B32,
        Shape::R32G32B32A32,
        Shape::R64,
        Shape::R64G64,
        Shape::R64G64B64,
        Shape::R64G64B64A64,
        Shape::B10G11R11,
        Shape::E5B9G9R9,
        Shape::D16,
        Shape::X8D24,
        Shape::D32,
        Shape::S8,
        Shape::D16S8,
        Shape::D24S8,
        Shape::D32S8,
        Shape::Bc1Rgb,
        Shape::Bc1Rgba,
        Shape::Bc2,
        Shape::Bc3,
        Shape::Bc4,
        Shape::Bc5,
        Shape::Bc6hSf16,
        Shape::Bc6hUf16,
        Shape::Bc7,
        Shape::Etc2R8G8B8,
        Shape::Etc2R8G8B8A1,
        Shape::Etc2R8G8B8A8,
        Shape::EacR11,
        Shape::EacR11G11,
        Shape::R4G4B4A4Reversed,
    ];
}

use NumericType::*;

const UNORM: &[NumericType] = &[Unorm];
const UNORM_SNORM: &[NumericType] = &[Unorm, Snorm];
const UNORM_UINT: &[NumericType] = &[Unorm, Uint];
const SFLOAT: &[NumericType] = &[Sfloat];
const UINT: &[NumericType] = &[Uint];
const INT8: &[NumericType] = &[Unorm, Snorm, Uint, Sint];
const INT16: &[NumericType] = &[Unorm, Snorm, Uint, Sint, Sfloat];
const WIDE: &[NumericType] = &[Uint, Sint, Sfloat];

impl Shape {
    /// Numeric types this shape can be combined with.
    pub fn allowed_types(self) -> &'static [NumericType] {
        use Shape::*;
        match self {
            Astc4x4 | Astc5x4 | Astc5x5 | Astc6x5 | Astc6x6 | Astc8x5 | Astc8x6 | Astc8x8
            | Astc10x5 | Astc10x6 | Astc10x8 | Astc10x10 | Astc12x10 | Astc12x12 => UNORM,

            R4G4 | R4G4B4A4 | B4G4R4A4 | R5G6B5 | B5G6R5 | R5G5B5A1 | B5G5R5A1 | A1R5G5B5
            | R4G4B4A4Reversed => UNORM,

            R8 | R8G8 | R8G8B8 | B8G8R8 | R8G8B8A8 | B8G8R8A8 | A8B8G8R8 => INT8,
            A8B8G8R8Srgb => UNORM,
            A2R10G10B10 | A2B10G10R10 => UNORM_UINT,

            R16 | R16G16 | R16G16B16 | R16G16B16A16 => INT16,
            R32 | R32G32 | R32G32B32 | R32G32B32A32 => WIDE,
            R64 | R64G64 | R64G64B64 | R64G64B64A64 => WIDE,
            B10G11R11 | E5B9G9R9 => SFLOAT,

            D16 | X8D24 | D16S8 | D24S8 => UNORM,
            D32 | D32S8 => SFLOAT,
            S8 => UINT,

            Bc1Rgb | Bc1Rgba | Bc2 | Bc3 | Bc7 => UNORM,
            Bc4 | Bc5 => UNORM_SNORM,
            Bc6hSf16 | Bc6hUf16 => SFLOAT,

            Etc2R8G8B8 | Etc2R8G8B8A1 | Etc2R8G8B8A8 => UNORM,
            EacR11 | EacR11G11 => UNORM_SNORM,
        }
    }

    pub fn compression(self) -> Compression {
        use Shape::*;
        match self {
            Astc4x4 | Astc5x4 | Astc5x5 | Astc6x5 | Astc6x6 | Astc8x5 | Astc8x6 | Astc8x8
            | Astc10x5 | Astc10x6 | Astc10x8 | Astc10x10 | Astc12x10 | Astc12x12 => {
                Compression::Astc
            }
            Bc1Rgb | Bc1Rgba | Bc2 | Bc3 | Bc4 | Bc5 | Bc6hSf16 | Bc6hUf16 | Bc7 => {
                Compression::Bc
            }
            Etc2R8G8B8 | Etc2R8G8B8A1 | Etc2R8G8B8A8 | EacR11 | EacR11G11 => Compression::Etc,
            _ => Compression::None,
        }
    }

    pub fn is_compressed(self) -> bool {
        self.compression() != Compression::None
    }

    /// Block footprint in texels. Uncompressed shapes are 1x1.
    pub fn block_size(self) -> (u32, u32) {
        match self.compression() {
            Compression::None => (1, 1),
            Compression::Bc | Compression::Etc => (4, 4),
            Compression::Astc => astc_block_size(self),
        }
    }

    /// Bytes occupied by one block (one texel for uncompressed shapes).
    pub fn bytes_per_block(self) -> u32 {
        use Shape::*;
        match self {
            Astc4x4 | Astc5x4 | Astc5x5 | Astc6x5 | Astc6x6 | Astc8x5 | Astc8x6 | Astc8x8
            | Astc10x5 | Astc10x6 | Astc10x8 | Astc10x10 | Astc12x10 | Astc12x12 => 16,

            R4G4 | R8 | S8 => 1,
            R4G4B4A4 | B4G4R4A4 | R5G6B5 | B5G6R5 | R5G5B5A1 | B5G5R5A1 | A1R5G5B5
            | R4G4B4A4Reversed | R8G8 | R16 | D16 => 2,
            R8G8B8 | B8G8R8 => 3,
            R8G8B8A8 | B8G8R8A8 | A8B8G8R8 | A8B8G8R8Srgb | A2R10G10B10 | A2B10G10R10
            | R16G16 | R32 | B10G11R11 | E5B9G9R9 | X8D24 | D32 | D16S8 | D24S8 => 4,
            R16G16B16 => 6,
            R16G16B16A16 | R32G32 | R64 | D32S8 => 8,
            R32G32B32 => 12,
            R32G32B32A32 | R64G64 => 16,
            R64G64B64 => 24,
            R64G64B64A64 => 32,

            Bc1Rgb | Bc1Rgba | Bc4 | Etc2R8G8B8 | Etc2R8G8B8A1 | EacR11 => 8,
            Bc2 | Bc3 | Bc5 | Bc6hSf16 | Bc6hUf16 | Bc7 | Etc2R8G8B8A8 | EacR11G11 => 16,
        }
    }

    pub fn has_depth(self) -> bool {
        matches!(
            self,
            Shape::D16 | Shape::X8D24 | Shape::D32 | Shape::D16S8 | Shape::D24S8 | Shape::D32S8
        )
    }

    pub fn has_stencil(self) -> bool {
        matches!(
            self,
            Shape::S8 | Shape::D16S8 | Shape::D24S8 | Shape::D32S8
        )
    }

    pub fn has_color(self) -> bool {
        !self.has_depth() && !self.has_stencil()
    }
}

/// Block footprint of an ASTC shape.
///
/// # Panics
///
/// Panics if `shape` is not an ASTC shape; callers must check
/// [`Shape::compression`] first.
pub fn astc_block_size(shape: Shape) -> (u32, u32) {
    use Shape::*;
    match shape {
        Astc4x4 => (4, 4),
        Astc5x4 => (5, 4),
        Astc5x5 => (5, 5),
        Astc6x5 => (6, 5),
        Astc6x6 => (6, 6),
        Astc8x5 => (8, 5),
        Astc8x6 => (8, 6),
        Astc8x8 => (8, 8),
        Astc10x5 => (10, 5),
        Astc10x6 => (10, 6),
        Astc10x8 => (10, 8),
        Astc10x10 => (10, 10),
        Astc12x10 => (12, 10),
        Astc12x12 => (12, 12),
        other => panic!("{other:?} is not an ASTC shape"),
    }
}

/// A validated `(Shape, NumericType)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageFormat {
    shape: Shape,
    ty: NumericType,
}

impl ImageFormat {
    pub fn new(shape: Shape, ty: NumericType) -> GalResult<Self> {
        if shape.allowed_types().contains(&ty) {
            Ok(Self { shape, ty })
        } else {
            Err(GalError::InvalidFormat { shape, ty })
        }
    }

    /// Format every decoded ASTC image is stored as.
    pub const RGBA8_UNORM: Self = Self {
        shape: Shape::R8G8B8A8,
        ty: Unorm,
    };

    pub fn shape(self) -> Shape {
        self.shape
    }

    pub fn numeric_type(self) -> NumericType {
        self.ty
    }

    pub fn byte_size(self, width: u32, height: u32) -> u64 {
        let (bw, bh) = self.shape.block_size();
        let blocks_x = div_round_up(width, bw) as u64;
        let blocks_y = div_round_up(height, bh) as u64;
        blocks_x * blocks_y * self.shape.bytes_per_block() as u64
    }

    /// The format the host stores this one as when the channel order cannot
    /// be expressed directly, or `None` if it is stored as is.
    pub fn host_swapped(self) -> Option<ImageFormat> {
        match self.shape {
            Shape::R4G4B4A4Reversed => Some(Self {
                shape: Shape::R4G4B4A4,
                ty: self.ty,
            }),
            _ => None,
        }
    }
}

/// Reorder texel channels for shapes the host cannot express.
///
/// `R4G4B4A4_REVERSED` texels are 16-bit little-endian words whose four
/// nibbles are stored in reverse order.
pub fn swap_channels(shape: Shape, data: &[u8]) -> Vec<u8> {
    let mut out = data.to_vec();
    if shape == Shape::R4G4B4A4Reversed {
        for texel in out.chunks_exact_mut(2) {
            let value = LittleEndian::read_u16(texel);
            let swapped = ((value & 0x000F) << 12)
                | ((value & 0x00F0) << 4)
                | ((value & 0x0F00) >> 4)
                | ((value & 0xF000) >> 12);
            LittleEndian::write_u16(texel, swapped);
        }
    }
    out
}

/// Source of one output channel when an image is sampled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureSource {
    Zero,
    Red,
    Green,
    Blue,
    Alpha,
    OneInt,
    OneFloat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Swizzle {
    pub x: TextureSource,
    pub y: TextureSource,
    pub z: TextureSource,
    pub w: TextureSource,
}

impl Swizzle {
    pub const IDENTITY: Self = Self {
        x: TextureSource::Red,
        y: TextureSource::Green,
        z: TextureSource::Blue,
        w: TextureSource::Alpha,
    };

    pub fn new(x: TextureSource, y: TextureSource, z: TextureSource, w: TextureSource) -> Self {
        Self { x, y, z, w }
    }
}

impl Default for Swizzle {
    fn default() -> Self {
        Self::IDENTITY
    }
}

/// Logical description of an image as the guest sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageDescriptor {
    pub width: u32,
    pub height: u32,
    pub format: ImageFormat,
    pub swizzle: Swizzle,
}

impl ImageDescriptor {
    pub fn new(width: u32, height: u32, format: ImageFormat) -> Self {
        Self {
            width,
            height,
            format,
            swizzle: Swizzle::IDENTITY,
        }
    }

    pub fn with_swizzle(mut self, swizzle: Swizzle) -> Self {
        self.swizzle = swizzle;
        self
    }

    pub fn with_format(mut self, format: ImageFormat) -> Self {
        self.format = format;
        self
    }

    /// True if an image described by `other` can reuse this one's backing
    /// storage. Swizzle only affects views and is ignored.
    pub fn cache_equals(&self, other: &ImageDescriptor) -> bool {
        self.width == other.width && self.height == other.height && self.format == other.format
    }

    pub fn byte_size(&self) -> u64 {
        self.format.byte_size(self.width, self.height)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressMode {
    Wrap,
    MirroredRepeat,
    ClampToEdge,
    ClampToBorder,
    Clamp,
    MirrorClampToEdge,
    MirrorClampToBorder,
    MirrorClamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Filter {
    Nearest,
    Linear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MipFilter {
    None,
    Nearest,
    Linear,
}

/// Sampling state applied when an image is bound to a texture slot.
#[derive(Debug, Clone, Copy)]
pub struct Sampler {
    pub address_u: AddressMode,
    pub address_v: AddressMode,
    pub address_p: AddressMode,
    pub min_filter: Filter,
    pub mag_filter: Filter,
    pub mip_filter: MipFilter,
    pub border_color: [f32; 4],
}

impl Default for Sampler {
    fn default() -> Self {
        Self {
            address_u: AddressMode::Wrap,
            address_v: AddressMode::Wrap,
            address_p: AddressMode::Wrap,
            min_filter: Filter::Linear,
            mag_filter: Filter::Linear,
            mip_filter: MipFilter::None,
            border_color: [0.0; 4],
        }
    }
}

impl Sampler {
    fn border_bits(&self) -> [u32; 4] {
        self.border_color.map(f32::to_bits)
    }
}

// Compared bitwise so samplers can key a host sampler cache.
impl PartialEq for Sampler {
    fn eq(&self, other: &Self) -> bool {
        self.address_u == other.address_u
            && self.address_v == other.address_v
            && self.address_p == other.address_p
            && self.min_filter == other.min_filter
            && self.mag_filter == other.mag_filter
            && self.mip_filter == other.mip_filter
            && self.border_bits() == other.border_bits()
    }
}

impl Eq for Sampler {}

impl std::hash::Hash for Sampler {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.address_u.hash(state);
        self.address_v.hash(state);
        self.address_p.hash(state);
        self.min_filter.hash(state);
        self.mag_filter.hash(state);
        self.mip_filter.hash(state);
        self.border_bits().hash(state);
    }
}
