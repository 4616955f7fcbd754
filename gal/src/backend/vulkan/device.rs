// SPDX-FileCopyrightText: 2025 gal contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Vulkan implementation of the submission and presentation primitives.

use std::sync::Arc;

use ash::extensions::khr;
use ash::vk;
use gal_common::Extent2D;
use log::{debug, trace, warn};

use super::context::{SurfaceContext, VulkanContext};
use super::format::{choose_surface_format, from_vk_present_mode, layout_access, to_vk_present_mode};
use super::OrHost;
use crate::error::{GalError, GalResult};
use crate::swapchain::{
    choose_extent, choose_image_count, choose_present_mode, AcquireOutcome, FrameContent, PresentDevice,
    PresentMode, PresentOutcome, SurfaceCaps, SwapchainInfo, SwapchainRequest,
};
use crate::sync::{Submission, SyncDevice};

/// Upper bound for a blocking fence wait.
const FENCE_WAIT_TIMEOUT_NS: u64 = 5_000_000_000;

/// A host object destroyed once the GPU can no longer be using it.
#[derive(Debug)]
pub enum VulkanGarbage {
    Image {
        image: vk::Image,
        memory: vk::DeviceMemory,
        views: Vec<vk::ImageView>,
    },
    Buffer {
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
    },
    ShaderModule(vk::ShaderModule),
    Program {
        set_layout: vk::DescriptorSetLayout,
        pipeline_layout: vk::PipelineLayout,
    },
}

impl VulkanGarbage {
    /// # Safety
    ///
    /// No pending GPU work may reference the object.
    pub(crate) unsafe fn destroy(self, device: &ash::Device) {
        match self {
            VulkanGarbage::Image { image, memory, views } => {
                for view in views {
                    device.destroy_image_view(view, None);
                }
                device.destroy_image(image, None);
                device.free_memory(memory, None);
            }
            VulkanGarbage::Buffer { buffer, memory } => {
                device.destroy_buffer(buffer, None);
                device.free_memory(memory, None);
            }
            VulkanGarbage::ShaderModule(module) => device.destroy_shader_module(module, None),
            VulkanGarbage::Program {
                set_layout,
                pipeline_layout,
            } => {
                device.destroy_pipeline_layout(pipeline_layout, None);
                device.destroy_descriptor_set_layout(set_layout, None);
            }
        }
    }
}

pub struct VulkanSwapchain {
    handle: vk::SwapchainKHR,
    images: Vec<vk::Image>,
    views: Vec<vk::ImageView>,
    render_pass: vk::RenderPass,
    framebuffers: Vec<vk::Framebuffer>,
    format: vk::SurfaceFormatKHR,
    extent: Extent2D,
    present_mode: PresentMode,
}

impl VulkanSwapchain {
    pub fn format(&self) -> vk::Format {
        self.format.format
    }

    /// Single color attachment pass that keeps the transferred frame and
    /// leaves the image ready to present.
    pub fn render_pass(&self) -> vk::RenderPass {
        self.render_pass
    }

    pub fn framebuffer(&self, index: u32) -> Option<vk::Framebuffer> {
        self.framebuffers.get(index as usize).copied()
    }
}

/// An image the presenter may blit from.
#[derive(Debug, Clone, Copy)]
pub struct VulkanBlitSource {
    pub image: vk::Image,
    pub extent: Extent2D,
    pub layout: vk::ImageLayout,
    /// False for formats the device cannot blit into a color swapchain.
    pub blittable: bool,
}

pub struct VulkanDevice {
    ctx: Arc<VulkanContext>,
    pool: vk::CommandPool,
}

impl VulkanDevice {
    pub fn new(ctx: Arc<VulkanContext>) -> GalResult<Self> {
        let pool_info = vk::CommandPoolCreateInfo::builder()
            .flags(vk::CommandPoolCreateFlags::TRANSIENT)
            .queue_family_index(ctx.queue_family_index);
        let pool = unsafe { ctx.device.create_command_pool(&pool_info, None) }.or_host("vkCreateCommandPool")?;
        Ok(Self { ctx, pool })
    }

    pub fn context(&self) -> &Arc<VulkanContext> {
        &self.ctx
    }

    /// Images, views, render pass and framebuffers of a new swapchain.
    /// Whatever was created before a failure stays in `swapchain` for the
    /// caller to destroy.
    fn create_swapchain_targets(&self, swapchain: &mut VulkanSwapchain) -> GalResult<()> {
        let (_, loader) = self.presentation()?;
        let device = &self.ctx.device;
        swapchain.images =
            unsafe { loader.get_swapchain_images(swapchain.handle) }.or_host("vkGetSwapchainImagesKHR")?;

        for &image in &swapchain.images {
            let info = vk::ImageViewCreateInfo::builder()
                .image(image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(swapchain.format.format)
                .subresource_range(color_range());
            let view = unsafe { device.create_image_view(&info, None) }.or_host("vkCreateImageView")?;
            swapchain.views.push(view);
        }

        let attachment = vk::AttachmentDescription::builder()
            .format(swapchain.format.format)
            .samples(vk::SampleCountFlags::TYPE_1)
            .load_op(vk::AttachmentLoadOp::LOAD)
            .store_op(vk::AttachmentStoreOp::STORE)
            .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
            .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
            .initial_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
            .final_layout(vk::ImageLayout::PRESENT_SRC_KHR)
            .build();
        let color_ref = vk::AttachmentReference {
            attachment: 0,
            layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        };
        let subpass = vk::SubpassDescription::builder()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(std::slice::from_ref(&color_ref))
            .build();
        let render_pass_info = vk::RenderPassCreateInfo::builder()
            .attachments(std::slice::from_ref(&attachment))
            .subpasses(std::slice::from_ref(&subpass));
        swapchain.render_pass =
            unsafe { device.create_render_pass(&render_pass_info, None) }.or_host("vkCreateRenderPass")?;

        for &view in &swapchain.views {
            let info = vk::FramebufferCreateInfo::builder()
                .render_pass(swapchain.render_pass)
                .attachments(std::slice::from_ref(&view))
                .width(swapchain.extent.width)
                .height(swapchain.extent.height)
                .layers(1);
            let framebuffer = unsafe { device.create_framebuffer(&info, None) }.or_host("vkCreateFramebuffer")?;
            swapchain.framebuffers.push(framebuffer);
        }
        Ok(())
    }

    fn presentation(&self) -> GalResult<(&SurfaceContext, &khr::Swapchain)> {
        match (&self.ctx.surface, &self.ctx.swapchain_loader) {
            (Some(surface), Some(loader)) => Ok((surface, loader)),
            _ => Err(GalError::NotSupported("device was created without a presentation surface")),
        }
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        unsafe {
            if let Err(e) = self.ctx.device.device_wait_idle() {
                warn!("vkDeviceWaitIdle failed before destroying the command pool: {:?}", e);
            }
            self.ctx.device.destroy_command_pool(self.pool, None);
        }
    }
}

impl SyncDevice for VulkanDevice {
    type Queue = vk::Queue;
    type CommandBuffer = vk::CommandBuffer;
    type CommandPool = vk::CommandPool;
    type Fence = vk::Fence;
    type Semaphore = vk::Semaphore;
    type Deferred = VulkanGarbage;

    fn begin_one_shot(&mut self) -> GalResult<(vk::CommandBuffer, vk::CommandPool)> {
        let device = &self.ctx.device;
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(self.pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let buffers = unsafe { device.allocate_command_buffers(&alloc_info) }.or_host("vkAllocateCommandBuffers")?;
        let cb = buffers[0];

        let begin_info = vk::CommandBufferBeginInfo::builder().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        if let Err(e) = unsafe { device.begin_command_buffer(cb, &begin_info) } {
            unsafe { device.free_command_buffers(self.pool, &[cb]) };
            return Err(GalError::host("vkBeginCommandBuffer", e));
        }
        Ok((cb, self.pool))
    }

    fn end_command_buffer(&mut self, command_buffer: vk::CommandBuffer) -> GalResult<()> {
        unsafe { self.ctx.device.end_command_buffer(command_buffer) }.or_host("vkEndCommandBuffer")
    }

    fn free_command_buffer(&mut self, pool: vk::CommandPool, command_buffer: vk::CommandBuffer) {
        unsafe { self.ctx.device.free_command_buffers(pool, &[command_buffer]) };
    }

    fn create_fence(&mut self) -> GalResult<vk::Fence> {
        let info = vk::FenceCreateInfo::builder();
        unsafe { self.ctx.device.create_fence(&info, None) }.or_host("vkCreateFence")
    }

    fn destroy_fence(&mut self, fence: vk::Fence) {
        unsafe { self.ctx.device.destroy_fence(fence, None) };
    }

    fn fence_signaled(&mut self, fence: &vk::Fence) -> GalResult<bool> {
        unsafe { self.ctx.device.get_fence_status(*fence) }.or_host("vkGetFenceStatus")
    }

    fn wait_fence(&mut self, fence: &vk::Fence) -> GalResult<()> {
        unsafe {
            self.ctx
                .device
                .wait_for_fences(std::slice::from_ref(fence), true, FENCE_WAIT_TIMEOUT_NS)
        }
        .or_host("vkWaitForFences")
    }

    fn create_semaphore(&mut self) -> GalResult<vk::Semaphore> {
        let info = vk::SemaphoreCreateInfo::builder();
        unsafe { self.ctx.device.create_semaphore(&info, None) }.or_host("vkCreateSemaphore")
    }

    fn destroy_semaphore(&mut self, semaphore: vk::Semaphore) {
        unsafe { self.ctx.device.destroy_semaphore(semaphore, None) };
    }

    fn submit(&mut self, queue: vk::Queue, submission: &Submission<'_, Self>) -> GalResult<()> {
        let wait_stages = vec![vk::PipelineStageFlags::ALL_COMMANDS; submission.wait_semaphores.len()];
        let signal = [submission.signal_semaphore];
        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(submission.wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(submission.command_buffers)
            .signal_semaphores(&signal);
        trace!(
            "vkQueueSubmit: {} command buffers, {} waits",
            submission.command_buffers.len(),
            submission.wait_semaphores.len()
        );
        unsafe {
            self.ctx
                .device
                .queue_submit(queue, std::slice::from_ref(&submit_info), *submission.fence)
        }
        .or_host("vkQueueSubmit")
    }

    fn release_deferred(&mut self, item: VulkanGarbage) {
        unsafe { item.destroy(&self.ctx.device) };
    }

    fn wait_idle(&mut self) -> GalResult<()> {
        unsafe { self.ctx.device.device_wait_idle() }.or_host("vkDeviceWaitIdle")
    }
}

fn surface_caps(caps: &vk::SurfaceCapabilitiesKHR) -> SurfaceCaps {
    // u32::MAX marks a surface whose size follows the swapchain.
    let current_extent = (caps.current_extent.width != u32::MAX)
        .then(|| Extent2D::new(caps.current_extent.width, caps.current_extent.height));
    SurfaceCaps {
        current_extent,
        min_extent: Extent2D::new(caps.min_image_extent.width, caps.min_image_extent.height),
        max_extent: Extent2D::new(caps.max_image_extent.width, caps.max_image_extent.height),
        min_image_count: caps.min_image_count,
        max_image_count: caps.max_image_count,
    }
}

fn color_range() -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        base_mip_level: 0,
        level_count: 1,
        base_array_layer: 0,
        layer_count: 1,
    }
}

/// Record a full-image layout transition.
///
/// # Safety
///
/// `command_buffer` must be recording and `image` alive.
pub(crate) unsafe fn transition_image(
    device: &ash::Device,
    command_buffer: vk::CommandBuffer,
    image: vk::Image,
    aspect_mask: vk::ImageAspectFlags,
    old_layout: vk::ImageLayout,
    new_layout: vk::ImageLayout,
) {
    let (src_access, src_stage) = layout_access(old_layout);
    let (dst_access, dst_stage) = layout_access(new_layout);
    let barrier = vk::ImageMemoryBarrier::builder()
        .old_layout(old_layout)
        .new_layout(new_layout)
        .src_access_mask(src_access)
        .dst_access_mask(dst_access)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask,
            ..color_range()
        });
    device.cmd_pipeline_barrier(
        command_buffer,
        src_stage,
        dst_stage,
        vk::DependencyFlags::empty(),
        &[],
        &[],
        std::slice::from_ref(&barrier),
    );
}

impl PresentDevice for VulkanDevice {
    type Swapchain = VulkanSwapchain;
    type BlitSource = VulkanBlitSource;

    fn create_swapchain(
        &mut self,
        request: &SwapchainRequest,
        previous: Option<&VulkanSwapchain>,
    ) -> GalResult<VulkanSwapchain> {
        let (surface, loader) = self.presentation()?;
        let pd = self.ctx.physical_device;

        let raw_caps = unsafe {
            surface
                .loader
                .get_physical_device_surface_capabilities(pd, surface.surface)
        }
        .or_host("vkGetPhysicalDeviceSurfaceCapabilitiesKHR")?;
        let formats = unsafe {
            surface
                .loader
                .get_physical_device_surface_formats(pd, surface.surface)
        }
        .or_host("vkGetPhysicalDeviceSurfaceFormatsKHR")?;
        let modes = unsafe {
            surface
                .loader
                .get_physical_device_surface_present_modes(pd, surface.surface)
        }
        .or_host("vkGetPhysicalDeviceSurfacePresentModesKHR")?;

        let caps = surface_caps(&raw_caps);
        let extent = choose_extent(&caps, request.extent);
        if request.extent.is_empty() || extent.is_empty() {
            return Err(GalError::InvalidState("swapchain with no area"));
        }
        let format = choose_surface_format(&formats);
        let available: Vec<PresentMode> = modes.iter().filter_map(|&m| from_vk_present_mode(m)).collect();
        let present_mode = choose_present_mode(&available, request.present_mode, request.vsync);
        let image_count = choose_image_count(&caps);

        debug!(
            "Creating swapchain: {}x{}, {} images, {:?}, {:?}",
            extent.width, extent.height, image_count, format.format, present_mode
        );

        let create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(surface.surface)
            .min_image_count(image_count)
            .image_format(format.format)
            .image_color_space(format.color_space)
            .image_extent(vk::Extent2D {
                width: extent.width,
                height: extent.height,
            })
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(raw_caps.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(to_vk_present_mode(present_mode))
            .clipped(true)
            .old_swapchain(previous.map_or(vk::SwapchainKHR::null(), |p| p.handle));

        let handle = unsafe { loader.create_swapchain(&create_info, None) }.or_host("vkCreateSwapchainKHR")?;
        let mut swapchain = VulkanSwapchain {
            handle,
            images: Vec::new(),
            views: Vec::new(),
            render_pass: vk::RenderPass::null(),
            framebuffers: Vec::new(),
            format,
            extent,
            present_mode,
        };
        if let Err(e) = self.create_swapchain_targets(&mut swapchain) {
            self.destroy_swapchain(swapchain);
            return Err(e);
        }
        Ok(swapchain)
    }

    fn destroy_swapchain(&mut self, swapchain: VulkanSwapchain) {
        let device = &self.ctx.device;
        unsafe {
            for framebuffer in swapchain.framebuffers {
                device.destroy_framebuffer(framebuffer, None);
            }
            if swapchain.render_pass != vk::RenderPass::null() {
                device.destroy_render_pass(swapchain.render_pass, None);
            }
            for view in swapchain.views {
                device.destroy_image_view(view, None);
            }
        }
        if let Ok((_, loader)) = self.presentation() {
            unsafe { loader.destroy_swapchain(swapchain.handle, None) };
        }
    }

    fn swapchain_info(&self, swapchain: &VulkanSwapchain) -> SwapchainInfo {
        SwapchainInfo {
            extent: swapchain.extent,
            image_count: swapchain.images.len(),
            present_mode: swapchain.present_mode,
        }
    }

    fn acquire_next_image(&mut self, swapchain: &VulkanSwapchain, signal: vk::Semaphore) -> GalResult<AcquireOutcome> {
        let (_, loader) = self.presentation()?;
        match unsafe { loader.acquire_next_image(swapchain.handle, u64::MAX, signal, vk::Fence::null()) } {
            Ok((index, suboptimal)) => Ok(AcquireOutcome::Acquired { index, suboptimal }),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(AcquireOutcome::OutOfDate),
            Err(vk::Result::ERROR_SURFACE_LOST_KHR) => Err(GalError::SurfaceLost),
            Err(e) => Err(GalError::host("vkAcquireNextImageKHR", e)),
        }
    }

    fn record_frame(
        &mut self,
        command_buffer: vk::CommandBuffer,
        swapchain: &VulkanSwapchain,
        index: u32,
        content: &FrameContent<'_, VulkanBlitSource>,
    ) -> GalResult<()> {
        let device = &self.ctx.device;
        let target = *swapchain
            .images
            .get(index as usize)
            .ok_or(GalError::InvalidState("swapchain image index out of range"))?;
        let color = vk::ImageAspectFlags::COLOR;
        let range = color_range();

        unsafe {
            transition_image(
                device,
                command_buffer,
                target,
                color,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            );

            let clear = vk::ClearColorValue {
                float32: content.clear_color,
            };
            device.cmd_clear_color_image(
                command_buffer,
                target,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &clear,
                std::slice::from_ref(&range),
            );

            if let Some(source) = content.source {
                if !source.blittable || source.layout == vk::ImageLayout::UNDEFINED {
                    trace!("Skipping blit of {:?}: not blittable or never written", source.image);
                } else {
                    // Clear and blit both write the target.
                    let write_after_write = vk::MemoryBarrier::builder()
                        .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
                        .dst_access_mask(vk::AccessFlags::TRANSFER_WRITE);
                    device.cmd_pipeline_barrier(
                        command_buffer,
                        vk::PipelineStageFlags::TRANSFER,
                        vk::PipelineStageFlags::TRANSFER,
                        vk::DependencyFlags::empty(),
                        std::slice::from_ref(&write_after_write),
                        &[],
                        &[],
                    );
                    transition_image(
                        device,
                        command_buffer,
                        source.image,
                        color,
                        source.layout,
                        vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    );

                    let [(x0, y0), (x1, y1)] = content
                        .transform
                        .source_corners(source.extent.width, source.extent.height);
                    let layers = vk::ImageSubresourceLayers {
                        aspect_mask: color,
                        mip_level: 0,
                        base_array_layer: 0,
                        layer_count: 1,
                    };
                    let region = vk::ImageBlit {
                        src_subresource: layers,
                        src_offsets: [
                            vk::Offset3D { x: x0, y: y0, z: 0 },
                            vk::Offset3D { x: x1, y: y1, z: 1 },
                        ],
                        dst_subresource: layers,
                        dst_offsets: [
                            vk::Offset3D { x: 0, y: 0, z: 0 },
                            vk::Offset3D {
                                x: swapchain.extent.width as i32,
                                y: swapchain.extent.height as i32,
                                z: 1,
                            },
                        ],
                    };
                    device.cmd_blit_image(
                        command_buffer,
                        source.image,
                        vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                        target,
                        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        std::slice::from_ref(&region),
                        vk::Filter::LINEAR,
                    );

                    transition_image(
                        device,
                        command_buffer,
                        source.image,
                        color,
                        vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                        source.layout,
                    );
                }
            }

            transition_image(
                device,
                command_buffer,
                target,
                color,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::ImageLayout::PRESENT_SRC_KHR,
            );
        }
        Ok(())
    }

    fn present(
        &mut self,
        queue: vk::Queue,
        swapchain: &VulkanSwapchain,
        index: u32,
        wait_semaphores: &[vk::Semaphore],
    ) -> GalResult<PresentOutcome> {
        let (_, loader) = self.presentation()?;
        let swapchains = [swapchain.handle];
        let indices = [index];
        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&indices);

        match unsafe { loader.queue_present(queue, &present_info) } {
            Ok(false) => Ok(PresentOutcome::Optimal),
            Ok(true) => Ok(PresentOutcome::Suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(PresentOutcome::OutOfDate),
            Err(vk::Result::ERROR_SURFACE_LOST_KHR) => {
                warn!("Presentation surface lost");
                Err(GalError::SurfaceLost)
            }
            Err(e) => Err(GalError::host("vkQueuePresentKHR", e)),
        }
    }
}
