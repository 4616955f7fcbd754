// SPDX-FileCopyrightText: 2025 gal contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Host graphics backends.
//!
//! Each manager is generic over the capability trait it needs, so the
//! backend is chosen once at startup and shared logic never branches on it.

pub mod software;
pub mod vulkan;

use bitflags::bitflags;

use crate::error::GalResult;
use crate::format::{ImageDescriptor, ImageFormat, Sampler, Swizzle};
use crate::shader::{StageKind, UniformBlockBinding};
use crate::swapchain::PresentDevice;
use crate::sync::{SubmissionTracker, SyncDevice};

/// Backend type selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendType {
    Software,
    Vulkan,
}

impl From<gal_common::settings::RendererBackend> for BackendType {
    fn from(backend: gal_common::settings::RendererBackend) -> Self {
        use gal_common::settings::RendererBackend;
        match backend {
            RendererBackend::Software => Self::Software,
            RendererBackend::Vulkan => Self::Vulkan,
        }
    }
}

bitflags! {
    /// What a host image will be used for.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ImageUsage: u32 {
        const SAMPLED = 1 << 0;
        const RENDER_TARGET = 1 << 1;
        const TRANSFER = 1 << 2;
    }
}

pub trait ImageBackend {
    type Image;
    type TransferBuffer;

    /// True if images of `format` can be created and sampled natively.
    fn supports_format(&self, format: ImageFormat) -> bool;
    fn create_image(&mut self, desc: &ImageDescriptor, usage: ImageUsage) -> GalResult<Self::Image>;
    /// Fill the image with `data`, which is laid out as `desc.byte_size()`
    /// tightly packed bytes.
    fn upload_image(&mut self, image: &mut Self::Image, data: &[u8]) -> GalResult<()>;

    fn create_transfer_buffer(&mut self, size: u64) -> GalResult<Self::TransferBuffer>;
    fn destroy_transfer_buffer(&mut self, buffer: Self::TransferBuffer);
    /// Zero `size` bytes of `buffer` starting at `offset`, ordered before
    /// any copy recorded after it.
    fn clear_transfer_buffer(
        &mut self,
        buffer: &mut Self::TransferBuffer,
        offset: u64,
        size: u64,
    ) -> GalResult<()>;
    /// Copy the raw bytes of `image` to the start of `buffer`.
    fn copy_image_to_buffer(
        &mut self,
        image: &mut Self::Image,
        buffer: &mut Self::TransferBuffer,
    ) -> GalResult<()>;
    /// Fill `image` from the start of `buffer`, reading the bytes under the
    /// image's own format.
    fn copy_buffer_to_image(
        &mut self,
        buffer: &Self::TransferBuffer,
        image: &mut Self::Image,
    ) -> GalResult<()>;

    fn bind_texture(
        &mut self,
        slot: u32,
        image: &mut Self::Image,
        swizzle: &Swizzle,
        sampler: &Sampler,
    ) -> GalResult<()>;

    /// Disposer handed to the image cache.
    fn image_disposer(&self) -> Box<dyn FnMut(Self::Image) + Send>;
}

pub trait BufferBackend {
    type Buffer;

    fn create_uniform_buffer(&mut self, size: u64) -> GalResult<Self::Buffer>;
    fn write_buffer(&mut self, buffer: &mut Self::Buffer, data: &[u8]) -> GalResult<()>;
    fn bind_uniform_buffer(&mut self, slot: u32, buffer: &Self::Buffer) -> GalResult<()>;
    fn buffer_disposer(&self) -> Box<dyn FnMut(Self::Buffer) + Send>;
}

pub trait ShaderBackend {
    type Shader;
    type Program;

    fn compile_shader(&mut self, kind: StageKind, source: &str) -> GalResult<Self::Shader>;
    /// Link `stages` into a program, giving each uniform block in
    /// `uniform_blocks` its assigned binding slot.
    fn link_program(
        &mut self,
        stages: &[(StageKind, &Self::Shader)],
        uniform_blocks: &[UniformBlockBinding],
    ) -> GalResult<Self::Program>;
    fn use_program(&mut self, program: &Self::Program) -> GalResult<()>;
    /// Point the sampler uniform `name` of `program` at texture unit `unit`.
    fn set_texture_binding(&mut self, program: &mut Self::Program, name: &str, unit: u32) -> GalResult<()>;
    fn destroy_shader(&mut self, shader: Self::Shader);
    fn destroy_program(&mut self, program: Self::Program);
}

/// A complete backend: resources, shaders, submission and presentation.
pub trait Backend: ImageBackend + BufferBackend + ShaderBackend {
    type Device: PresentDevice;

    fn backend_type(&self) -> BackendType;
    fn tracker(&mut self) -> &mut SubmissionTracker<Self::Device>;
    fn tracker_ref(&self) -> &SubmissionTracker<Self::Device>;
    fn queue(&self) -> <Self::Device as SyncDevice>::Queue;
    /// Describe `image` as a frame source for the swapchain.
    fn blit_source(&self, image: &Self::Image) -> <Self::Device as PresentDevice>::BlitSource;
    /// Move handles released by cache disposers into the submission tracker.
    fn collect_garbage(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use gal_common::settings::RendererBackend;

    #[test]
    fn test_backend_type_from_settings() {
        assert_eq!(BackendType::from(RendererBackend::Software), BackendType::Software);
        assert_eq!(BackendType::from(RendererBackend::Vulkan), BackendType::Vulkan);
    }

    #[test]
    fn test_image_usage_flags() {
        let usage = ImageUsage::SAMPLED | ImageUsage::TRANSFER;
        assert!(usage.contains(ImageUsage::SAMPLED));
        assert!(!usage.contains(ImageUsage::RENDER_TARGET));
    }
}
