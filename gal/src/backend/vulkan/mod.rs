// SPDX-FileCopyrightText: 2025 gal contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Vulkan backend.
//!
//! Everything is recorded into one-shot command buffers owned by the
//! submission tracker. Handles released by the caches go through a shared
//! garbage list and are destroyed once the call that last used them retires.

mod buffer;
pub mod context;
pub mod device;
pub mod format;
mod image;
mod shader;

use std::collections::HashMap;
use std::sync::Arc;

use ash::prelude::VkResult;
use ash::vk;
use log::{debug, info};
use parking_lot::Mutex;

pub use buffer::VulkanBuffer;
pub use context::{ContextOptions, SurfaceFactory, VulkanContext};
pub use device::{VulkanBlitSource, VulkanDevice, VulkanGarbage, VulkanSwapchain};
pub use image::{VulkanImage, VulkanTransferBuffer};
pub use shader::{VulkanProgram, VulkanShader};

use super::{Backend, BackendType};
use crate::error::{GalError, GalResult};
use crate::format::Sampler;
use crate::sync::SubmissionTracker;

/// Maps a raw Vulkan result into [`GalError::Host`].
pub(crate) trait OrHost<T> {
    fn or_host(self, call: &'static str) -> GalResult<T>;
}

impl<T> OrHost<T> for VkResult<T> {
    fn or_host(self, call: &'static str) -> GalResult<T> {
        self.map_err(|e| GalError::host(call, e))
    }
}

type GarbageList = Arc<Mutex<Vec<VulkanGarbage>>>;

/// Texture slot state: the view and sampler a draw would read.
#[derive(Debug, Clone, Copy)]
pub struct BoundTexture {
    pub view: vk::ImageView,
    pub sampler: vk::Sampler,
}

pub struct VulkanBackend {
    ctx: Arc<VulkanContext>,
    tracker: SubmissionTracker<VulkanDevice>,
    garbage: GarbageList,
    samplers: HashMap<Sampler, vk::Sampler>,
    textures: HashMap<u32, BoundTexture>,
    uniforms: HashMap<u32, vk::Buffer>,
    current_program: Option<vk::PipelineLayout>,
}

impl VulkanBackend {
    pub fn new(options: &ContextOptions, surface_factory: Option<SurfaceFactory<'_>>) -> GalResult<Self> {
        let ctx = Arc::new(VulkanContext::new(options, surface_factory)?);
        let device = VulkanDevice::new(Arc::clone(&ctx))?;
        info!("Vulkan backend ready on {}", ctx.device_name());
        Ok(Self {
            ctx,
            tracker: SubmissionTracker::new(device),
            garbage: Arc::new(Mutex::new(Vec::new())),
            samplers: HashMap::new(),
            textures: HashMap::new(),
            uniforms: HashMap::new(),
            current_program: None,
        })
    }

    /// A backend with no presentation surface.
    pub fn headless(options: &ContextOptions) -> GalResult<Self> {
        Self::new(options, None)
    }

    pub fn context(&self) -> &VulkanContext {
        &self.ctx
    }

    pub fn bound_texture(&self, slot: u32) -> Option<BoundTexture> {
        self.textures.get(&slot).copied()
    }

    pub fn bound_uniform_buffer(&self, slot: u32) -> Option<vk::Buffer> {
        self.uniforms.get(&slot).copied()
    }

    pub fn current_program(&self) -> Option<vk::PipelineLayout> {
        self.current_program
    }

    fn garbage_sink(&self) -> GarbageList {
        Arc::clone(&self.garbage)
    }

    fn allocate_memory(
        &self,
        requirements: vk::MemoryRequirements,
        flags: vk::MemoryPropertyFlags,
    ) -> GalResult<vk::DeviceMemory> {
        let memory_type = self.ctx.find_memory_type(requirements.memory_type_bits, flags)?;
        let alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type);
        unsafe { self.ctx.device.allocate_memory(&alloc_info, None) }.or_host("vkAllocateMemory")
    }

    fn create_buffer(
        &self,
        size: u64,
        usage: vk::BufferUsageFlags,
        flags: vk::MemoryPropertyFlags,
    ) -> GalResult<(vk::Buffer, vk::DeviceMemory)> {
        let device = &self.ctx.device;
        let info = vk::BufferCreateInfo::builder()
            .size(size.max(1))
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer = unsafe { device.create_buffer(&info, None) }.or_host("vkCreateBuffer")?;
        let requirements = unsafe { device.get_buffer_memory_requirements(buffer) };
        let memory = match self.allocate_memory(requirements, flags) {
            Ok(memory) => memory,
            Err(e) => {
                unsafe { device.destroy_buffer(buffer, None) };
                return Err(e);
            }
        };
        if let Err(e) = unsafe { device.bind_buffer_memory(buffer, memory, 0) } {
            unsafe {
                device.destroy_buffer(buffer, None);
                device.free_memory(memory, None);
            }
            return Err(GalError::host("vkBindBufferMemory", e));
        }
        Ok((buffer, memory))
    }

    /// Host-visible buffer of `size` bytes holding a copy of `data`.
    /// Short data leaves the tail zeroed; long data is truncated.
    fn create_staging(&self, data: &[u8], size: u64) -> GalResult<(vk::Buffer, vk::DeviceMemory)> {
        let (buffer, memory) = self.create_buffer(
            size,
            vk::BufferUsageFlags::TRANSFER_SRC,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )?;
        let device = &self.ctx.device;
        let mapped = unsafe { device.map_memory(memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty()) };
        match mapped {
            Ok(ptr) => unsafe {
                let dst = std::slice::from_raw_parts_mut(ptr as *mut u8, size as usize);
                let n = data.len().min(dst.len());
                dst[..n].copy_from_slice(&data[..n]);
                dst[n..].fill(0);
                device.unmap_memory(memory);
            },
            Err(e) => {
                unsafe { VulkanGarbage::Buffer { buffer, memory }.destroy(device) };
                return Err(GalError::host("vkMapMemory", e));
            }
        }
        Ok((buffer, memory))
    }

    /// Record commands into a fresh command buffer of the current call.
    fn record<F>(&mut self, f: F) -> GalResult<()>
    where
        F: FnOnce(&ash::Device, vk::CommandBuffer),
    {
        let cb = self.tracker.begin_record()?;
        f(&self.ctx.device, cb);
        self.tracker.end_record(cb)
    }

    fn sampler(&mut self, sampler: &Sampler) -> GalResult<vk::Sampler> {
        if let Some(&handle) = self.samplers.get(sampler) {
            return Ok(handle);
        }
        let info = format::sampler_create_info(sampler);
        let handle = unsafe { self.ctx.device.create_sampler(&info, None) }.or_host("vkCreateSampler")?;
        debug!("Created sampler {:?}", sampler);
        self.samplers.insert(*sampler, handle);
        Ok(handle)
    }
}

impl Backend for VulkanBackend {
    type Device = VulkanDevice;

    fn backend_type(&self) -> BackendType {
        BackendType::Vulkan
    }

    fn tracker(&mut self) -> &mut SubmissionTracker<VulkanDevice> {
        &mut self.tracker
    }

    fn tracker_ref(&self) -> &SubmissionTracker<VulkanDevice> {
        &self.tracker
    }

    fn queue(&self) -> vk::Queue {
        self.ctx.queue
    }

    fn blit_source(&self, image: &VulkanImage) -> VulkanBlitSource {
        VulkanBlitSource {
            image: image.handle(),
            extent: image.extent(),
            layout: image.layout(),
            blittable: image.blittable(),
        }
    }

    fn collect_garbage(&mut self) {
        let items: Vec<VulkanGarbage> = std::mem::take(&mut *self.garbage.lock());
        for item in items {
            self.tracker.defer_release(item);
        }
    }
}

impl Drop for VulkanBackend {
    fn drop(&mut self) {
        self.collect_garbage();
        if let Err(e) = self.tracker.shutdown() {
            log::warn!("Vulkan backend shutdown failed: {}", e);
        }
        // Disposers that ran after shutdown.
        let late: Vec<VulkanGarbage> = std::mem::take(&mut *self.garbage.lock());
        unsafe {
            for item in late {
                item.destroy(&self.ctx.device);
            }
            for (_, sampler) in self.samplers.drain() {
                self.ctx.device.destroy_sampler(sampler, None);
            }
        }
        debug!("Vulkan backend released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BufferBackend, ImageBackend, ImageUsage};
    use crate::format::{ImageDescriptor, ImageFormat, NumericType, Shape};

    fn try_backend() -> Option<VulkanBackend> {
        match VulkanBackend::headless(&ContextOptions::default()) {
            Ok(backend) => Some(backend),
            Err(e) => {
                // No loader or driver on CI.
                log::info!("Vulkan not available (expected on CI): {}", e);
                None
            }
        }
    }

    #[test]
    fn test_or_host() {
        let failed: VkResult<()> = Err(vk::Result::ERROR_DEVICE_LOST);
        match failed.or_host("vkQueueSubmit") {
            Err(GalError::Host { call, code }) => {
                assert_eq!(call, "vkQueueSubmit");
                assert_eq!(code.0, vk::Result::ERROR_DEVICE_LOST.as_raw());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_headless_image_round_trip() {
        let Some(mut backend) = try_backend() else {
            return;
        };
        let format = ImageFormat::new(Shape::R8G8B8A8, NumericType::Unorm).unwrap();
        let desc = ImageDescriptor::new(16, 16, format);
        let data: Vec<u8> = (0..desc.byte_size()).map(|i| (i % 251) as u8).collect();

        let mut image = backend
            .create_image(&desc, ImageUsage::SAMPLED | ImageUsage::TRANSFER)
            .unwrap();
        backend.upload_image(&mut image, &data).unwrap();
        let mut buffer = backend.create_transfer_buffer(desc.byte_size()).unwrap();
        backend.copy_image_to_buffer(&mut image, &mut buffer).unwrap();

        let queue = backend.queue();
        let call = backend.tracker().execute(queue).unwrap();
        backend.tracker().wait_for(call).unwrap();
        assert_eq!(backend.read_transfer_buffer(&buffer).unwrap(), data);

        backend.destroy_transfer_buffer(buffer);
        let mut dispose = backend.image_disposer();
        dispose(image);
        backend.collect_garbage();
    }

    #[test]
    fn test_headless_uniform_buffer() {
        let Some(mut backend) = try_backend() else {
            return;
        };
        let mut buffer = backend.create_uniform_buffer(256).unwrap();
        backend.write_buffer(&mut buffer, &[7u8; 64]).unwrap();
        backend.bind_uniform_buffer(3, &buffer).unwrap();
        assert_eq!(backend.bound_uniform_buffer(3), Some(buffer.handle()));

        let queue = backend.queue();
        backend.tracker().execute(queue).unwrap();
        let mut dispose = backend.buffer_disposer();
        dispose(buffer);
        backend.collect_garbage();
        backend.tracker().shutdown().unwrap();
    }
}
