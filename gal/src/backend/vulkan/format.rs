// SPDX-FileCopyrightText: 2025 gal contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Translation of guest formats and sampling state into Vulkan enums.

use ash::vk;

use crate::format::{AddressMode, Filter, ImageFormat, MipFilter, NumericType, Sampler, Shape, Swizzle, TextureSource};
use crate::swapchain::PresentMode;

/// Host format for a guest format, or `None` if Vulkan has no equivalent.
pub fn to_vk_format(format: ImageFormat) -> Option<vk::Format> {
    use NumericType::*;
    use Shape::*;

    let ty = format.numeric_type();
    let by_type = |unorm, snorm, uint, sint, sfloat| match ty {
        Unorm => unorm,
        Snorm => snorm,
        Uint => uint,
        Sint => sint,
        Sfloat => sfloat,
    };
    let undefined = vk::Format::UNDEFINED;

    let vk_format = match format.shape() {
        Astc4x4 => vk::Format::ASTC_4X4_UNORM_BLOCK,
        Astc5x4 => vk::Format::ASTC_5X4_UNORM_BLOCK,
        Astc5x5 => vk::Format::ASTC_5X5_UNORM_BLOCK,
        Astc6x5 => vk::Format::ASTC_6X5_UNORM_BLOCK,
        Astc6x6 => vk::Format::ASTC_6X6_UNORM_BLOCK,
        Astc8x5 => vk::Format::ASTC_8X5_UNORM_BLOCK,
        Astc8x6 => vk::Format::ASTC_8X6_UNORM_BLOCK,
        Astc8x8 => vk::Format::ASTC_8X8_UNORM_BLOCK,
        Astc10x5 => vk::Format::ASTC_10X5_UNORM_BLOCK,
        Astc10x6 => vk::Format::ASTC_10X6_UNORM_BLOCK,
        Astc10x8 => vk::Format::ASTC_10X8_UNORM_BLOCK,
        Astc10x10 => vk::Format::ASTC_10X10_UNORM_BLOCK,
        Astc12x10 => vk::Format::ASTC_12X10_UNORM_BLOCK,
        Astc12x12 => vk::Format::ASTC_12X12_UNORM_BLOCK,

        R4G4 => vk::Format::R4G4_UNORM_PACK8,
        R4G4B4A4 => vk::Format::R4G4B4A4_UNORM_PACK16,
        B4G4R4A4 => vk::Format::B4G4R4A4_UNORM_PACK16,
        R5G6B5 => vk::Format::R5G6B5_UNORM_PACK16,
        B5G6R5 => vk::Format::B5G6R5_UNORM_PACK16,
        R5G5B5A1 => vk::Format::R5G5B5A1_UNORM_PACK16,
        B5G5R5A1 => vk::Format::B5G5R5A1_UNORM_PACK16,
        A1R5G5B5 => vk::Format::A1R5G5B5_UNORM_PACK16,
        R4G4B4A4Reversed => return None,

        R8 => by_type(
            vk::Format::R8_UNORM,
            vk::Format::R8_SNORM,
            vk::Format::R8_UINT,
            vk::Format::R8_SINT,
            undefined,
        ),
        R8G8 => by_type(
            vk::Format::R8G8_UNORM,
            vk::Format::R8G8_SNORM,
            vk::Format::R8G8_UINT,
            vk::Format::R8G8_SINT,
            undefined,
        ),
        R8G8B8 => by_type(
            vk::Format::R8G8B8_UNORM,
            vk::Format::R8G8B8_SNORM,
            vk::Format::R8G8B8_UINT,
            vk::Format::R8G8B8_SINT,
            undefined,
        ),
        B8G8R8 => by_type(
            vk::Format::B8G8R8_UNORM,
            vk::Format::B8G8R8_SNORM,
            vk::Format::B8G8R8_UINT,
            vk::Format::B8G8R8_SINT,
            undefined,
        ),
        R8G8B8A8 => by_type(
            vk::Format::R8G8B8A8_UNORM,
            vk::Format::R8G8B8A8_SNORM,
            vk::Format::R8G8B8A8_UINT,
            vk::Format::R8G8B8A8_SINT,
            undefined,
        ),
        B8G8R8A8 => by_type(
            vk::Format::B8G8R8A8_UNORM,
            vk::Format::B8G8R8A8_SNORM,
            vk::Format::B8G8R8A8_UINT,
            vk::Format::B8G8R8A8_SINT,
            undefined,
        ),
        A8B8G8R8 => by_type(
            vk::Format::A8B8G8R8_UNORM_PACK32,
            vk::Format::A8B8G8R8_SNORM_PACK32,
            vk::Format::A8B8G8R8_UINT_PACK32,
            vk::Format::A8B8G8R8_SINT_PACK32,
            undefined,
        ),
        A8B8G8R8Srgb => vk::Format::A8B8G8R8_SRGB_PACK32,
        A2R10G10B10 => by_type(
            vk::Format::A2R10G10B10_UNORM_PACK32,
            undefined,
            vk::Format::A2R10G10B10_UINT_PACK32,
            undefined,
            undefined,
        ),
        A2B10G10R10 => by_type(
            vk::Format::A2B10G10R10_UNORM_PACK32,
            undefined,
            vk::Format::A2B10G10R10_UINT_PACK32,
            undefined,
            undefined,
        ),

        R16 => by_type(
            vk::Format::R16_UNORM,
            vk::Format::R16_SNORM,
            vk::Format::R16_UINT,
            vk::Format::R16_SINT,
            vk::Format::R16_SFLOAT,
        ),
        R16G16 => by_type(
            vk::Format::R16G16_UNORM,
            vk::Format::R16G16_SNORM,
            vk::Format::R16G16_UINT,
            vk::Format::R16G16_SINT,
            vk::Format::R16G16_SFLOAT,
        ),
        R16G16B16 => by_type(
            vk::Format::R16G16B16_UNORM,
            vk::Format::R16G16B16_SNORM,
            vk::Format::R16G16B16_UINT,
            vk::Format::R16G16B16_SINT,
            vk::Format::R16G16B16_SFLOAT,
        ),
        R16G16B16A16 => by_type(
            vk::Format::R16G16B16A16_UNORM,
            vk::Format::R16G16B16A16_SNORM,
            vk::Format::R16G16B16A16_UINT,
            vk::Format::R16G16B16A16_SINT,
            vk::Format::R16G16B16A16_SFLOAT,
        ),
        R32 => by_type(
            undefined,
            undefined,
            vk::Format::R32_UINT,
            vk::Format::R32_SINT,
            vk::Format::R32_SFLOAT,
        ),
        R32G32 => by_type(
            undefined,
            undefined,
            vk::Format::R32G32_UINT,
            vk::Format::R32G32_SINT,
            vk::Format::R32G32_SFLOAT,
        ),
        R32G32B32 => by_type(
            undefined,
            undefined,
            vk::Format::R32G32B32_UINT,
            vk::Format::R32G32B32_SINT,
            vk::Format::R32G32B32_SFLOAT,
        ),
        R32G32B32A32 => by_type(
            undefined,
            undefined,
            vk::Format::R32G32B32A32_UINT,
            vk::Format::R32G32B32A32_SINT,
            vk::Format::R32G32B32A32_SFLOAT,
        ),
        R64 => by_type(
            undefined,
            undefined,
            vk::Format::R64_UINT,
            vk::Format::R64_SINT,
            vk::Format::R64_SFLOAT,
        ),
        R64G64 => by_type(
            undefined,
            undefined,
            vk::Format::R64G64_UINT,
            vk::Format::R64G64_SINT,
            vk::Format::R64G64_SFLOAT,
        ),
        R64G64B64 => by_type(
            undefined,
            undefined,
            vk::Format::R64G64B64_UINT,
            vk::Format::R64G64B64_SINT,
            vk::Format::R64G64B64_SFLOAT,
        ),
        R64G64B64A64 => by_type(
            undefined,
            undefined,
            vk::Format::R64G64B64A64_UINT,
            vk::Format::R64G64B64A64_SINT,
            vk::Format::R64G64B64A64_SFLOAT,
        ),
        B10G11R11 => vk::Format::B10G11R11_UFLOAT_PACK32,
        E5B9G9R9 => vk::Format::E5B9G9R9_UFLOAT_PACK32,

        D16 => vk::Format::D16_UNORM,
        X8D24 => vk::Format::X8_D24_UNORM_PACK32,
        D32 => vk::Format::D32_SFLOAT,
        S8 => vk::Format::S8_UINT,
        D16S8 => vk::Format::D16_UNORM_S8_UINT,
        D24S8 => vk::Format::D24_UNORM_S8_UINT,
        D32S8 => vk::Format::D32_SFLOAT_S8_UINT,

        Bc1Rgb => vk::Format::BC1_RGB_UNORM_BLOCK,
        Bc1Rgba => vk::Format::BC1_RGBA_UNORM_BLOCK,
        Bc2 => vk::Format::BC2_UNORM_BLOCK,
        Bc3 => vk::Format::BC3_UNORM_BLOCK,
        Bc4 => by_type(
            vk::Format::BC4_UNORM_BLOCK,
            vk::Format::BC4_SNORM_BLOCK,
            undefined,
            undefined,
            undefined,
        ),
        Bc5 => by_type(
            vk::Format::BC5_UNORM_BLOCK,
            vk::Format::BC5_SNORM_BLOCK,
            undefined,
            undefined,
            undefined,
        ),
        Bc6hSf16 => vk::Format::BC6H_SFLOAT_BLOCK,
        Bc6hUf16 => vk::Format::BC6H_UFLOAT_BLOCK,
        Bc7 => vk::Format::BC7_UNORM_BLOCK,

        Etc2R8G8B8 => vk::Format::ETC2_R8G8B8_UNORM_BLOCK,
        Etc2R8G8B8A1 => vk::Format::ETC2_R8G8B8A1_UNORM_BLOCK,
        Etc2R8G8B8A8 => vk::Format::ETC2_R8G8B8A8_UNORM_BLOCK,
        EacR11 => by_type(
            vk::Format::EAC_R11_UNORM_BLOCK,
            vk::Format::EAC_R11_SNORM_BLOCK,
            undefined,
            undefined,
            undefined,
        ),
        EacR11G11 => by_type(
            vk::Format::EAC_R11G11_UNORM_BLOCK,
            vk::Format::EAC_R11G11_SNORM_BLOCK,
            undefined,
            undefined,
            undefined,
        ),
    };

    (vk_format != undefined).then_some(vk_format)
}

/// All aspects an image of this shape has.
pub fn aspect_mask(shape: Shape) -> vk::ImageAspectFlags {
    let mut mask = vk::ImageAspectFlags::empty();
    if shape.has_depth() {
        mask |= vk::ImageAspectFlags::DEPTH;
    }
    if shape.has_stencil() {
        mask |= vk::ImageAspectFlags::STENCIL;
    }
    if mask.is_empty() {
        mask = vk::ImageAspectFlags::COLOR;
    }
    mask
}

/// The single aspect used for buffer copies and sampled views. Depth wins
/// over stencil on combined formats.
pub fn primary_aspect(mask: vk::ImageAspectFlags) -> vk::ImageAspectFlags {
    if mask.contains(vk::ImageAspectFlags::DEPTH) {
        vk::ImageAspectFlags::DEPTH
    } else if mask.contains(vk::ImageAspectFlags::STENCIL) {
        vk::ImageAspectFlags::STENCIL
    } else {
        vk::ImageAspectFlags::COLOR
    }
}

fn to_vk_component(source: TextureSource) -> vk::ComponentSwizzle {
    match source {
        TextureSource::Zero => vk::ComponentSwizzle::ZERO,
        TextureSource::Red => vk::ComponentSwizzle::R,
        TextureSource::Green => vk::ComponentSwizzle::G,
        TextureSource::Blue => vk::ComponentSwizzle::B,
        TextureSource::Alpha => vk::ComponentSwizzle::A,
        TextureSource::OneInt | TextureSource::OneFloat => vk::ComponentSwizzle::ONE,
    }
}

pub fn to_vk_components(swizzle: &Swizzle) -> vk::ComponentMapping {
    vk::ComponentMapping {
        r: to_vk_component(swizzle.x),
        g: to_vk_component(swizzle.y),
        b: to_vk_component(swizzle.z),
        a: to_vk_component(swizzle.w),
    }
}

pub fn to_vk_address_mode(mode: AddressMode) -> vk::SamplerAddressMode {
    match mode {
        AddressMode::Wrap => vk::SamplerAddressMode::REPEAT,
        AddressMode::MirroredRepeat => vk::SamplerAddressMode::MIRRORED_REPEAT,
        AddressMode::ClampToEdge | AddressMode::Clamp => vk::SamplerAddressMode::CLAMP_TO_EDGE,
        AddressMode::ClampToBorder => vk::SamplerAddressMode::CLAMP_TO_BORDER,
        // No mirror-once-to-border mode in core Vulkan.
        AddressMode::MirrorClampToEdge | AddressMode::MirrorClampToBorder | AddressMode::MirrorClamp => {
            vk::SamplerAddressMode::MIRROR_CLAMP_TO_EDGE
        }
    }
}

pub fn to_vk_filter(filter: Filter) -> vk::Filter {
    match filter {
        Filter::Nearest => vk::Filter::NEAREST,
        Filter::Linear => vk::Filter::LINEAR,
    }
}

pub fn to_vk_mipmap_mode(filter: MipFilter) -> vk::SamplerMipmapMode {
    match filter {
        MipFilter::None | MipFilter::Nearest => vk::SamplerMipmapMode::NEAREST,
        MipFilter::Linear => vk::SamplerMipmapMode::LINEAR,
    }
}

/// Nearest fixed border color. Custom border colors need an extension.
pub fn to_vk_border_color(color: [f32; 4]) -> vk::BorderColor {
    let rgb_zero = color[..3].iter().all(|&c| c <= 0.5);
    let rgb_one = color[..3].iter().all(|&c| c > 0.5);
    match (rgb_zero, rgb_one, color[3] > 0.5) {
        (true, _, false) => vk::BorderColor::FLOAT_TRANSPARENT_BLACK,
        (_, true, true) => vk::BorderColor::FLOAT_OPAQUE_WHITE,
        _ => vk::BorderColor::FLOAT_OPAQUE_BLACK,
    }
}

pub fn sampler_create_info(sampler: &Sampler) -> vk::SamplerCreateInfo {
    // Without mipmapping, clamp the lod so only the base level is read.
    let max_lod = match sampler.mip_filter {
        MipFilter::None => 0.25,
        _ => vk::LOD_CLAMP_NONE,
    };
    vk::SamplerCreateInfo::builder()
        .mag_filter(to_vk_filter(sampler.mag_filter))
        .min_filter(to_vk_filter(sampler.min_filter))
        .mipmap_mode(to_vk_mipmap_mode(sampler.mip_filter))
        .address_mode_u(to_vk_address_mode(sampler.address_u))
        .address_mode_v(to_vk_address_mode(sampler.address_v))
        .address_mode_w(to_vk_address_mode(sampler.address_p))
        .min_lod(0.0)
        .max_lod(max_lod)
        .border_color(to_vk_border_color(sampler.border_color))
        .build()
}

/// Prefer B8G8R8A8_UNORM with sRGB non-linear color space.
pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> vk::SurfaceFormatKHR {
    let preferred = vk::SurfaceFormatKHR {
        format: vk::Format::B8G8R8A8_UNORM,
        color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
    };
    match formats {
        [] => preferred,
        [only] if only.format == vk::Format::UNDEFINED => preferred,
        _ => formats
            .iter()
            .find(|f| f.format == preferred.format && f.color_space == preferred.color_space)
            .copied()
            .unwrap_or(formats[0]),
    }
}

pub fn to_vk_present_mode(mode: PresentMode) -> vk::PresentModeKHR {
    match mode {
        PresentMode::Immediate => vk::PresentModeKHR::IMMEDIATE,
        PresentMode::Mailbox => vk::PresentModeKHR::MAILBOX,
        PresentMode::Fifo => vk::PresentModeKHR::FIFO,
        PresentMode::FifoRelaxed => vk::PresentModeKHR::FIFO_RELAXED,
    }
}

pub fn from_vk_present_mode(mode: vk::PresentModeKHR) -> Option<PresentMode> {
    match mode {
        vk::PresentModeKHR::IMMEDIATE => Some(PresentMode::Immediate),
        vk::PresentModeKHR::MAILBOX => Some(PresentMode::Mailbox),
        vk::PresentModeKHR::FIFO => Some(PresentMode::Fifo),
        vk::PresentModeKHR::FIFO_RELAXED => Some(PresentMode::FifoRelaxed),
        _ => None,
    }
}

/// Access mask and pipeline stage that last touched (or will next touch)
/// an image in `layout`.
pub fn layout_access(layout: vk::ImageLayout) -> (vk::AccessFlags, vk::PipelineStageFlags) {
    match layout {
        vk::ImageLayout::UNDEFINED => (vk::AccessFlags::empty(), vk::PipelineStageFlags::TOP_OF_PIPE),
        vk::ImageLayout::TRANSFER_DST_OPTIMAL => {
            (vk::AccessFlags::TRANSFER_WRITE, vk::PipelineStageFlags::TRANSFER)
        }
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL => {
            (vk::AccessFlags::TRANSFER_READ, vk::PipelineStageFlags::TRANSFER)
        }
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL => (
            vk::AccessFlags::SHADER_READ,
            vk::PipelineStageFlags::VERTEX_SHADER | vk::PipelineStageFlags::FRAGMENT_SHADER,
        ),
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL => (
            vk::AccessFlags::COLOR_ATTACHMENT_READ | vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        ),
        vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL => (
            vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ
                | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
        ),
        vk::ImageLayout::PRESENT_SRC_KHR => (vk::AccessFlags::empty(), vk::PipelineStageFlags::BOTTOM_OF_PIPE),
        _ => (
            vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE,
            vk::PipelineStageFlags::ALL_COMMANDS,
        ),
    }
}
