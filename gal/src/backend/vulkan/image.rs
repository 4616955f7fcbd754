// SPDX-FileCopyrightText: 2025 gal contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use ash::vk;
use gal_common::Extent2D;
use log::trace;

use super::device::{transition_image, VulkanGarbage};
use super::format::{aspect_mask, primary_aspect, to_vk_components, to_vk_format};
use super::{BoundTexture, OrHost, VulkanBackend};
use crate::backend::{ImageBackend, ImageUsage};
use crate::error::{GalError, GalResult};
use crate::format::{ImageDescriptor, ImageFormat, NumericType, Sampler, Swizzle};

pub struct VulkanImage {
    image: vk::Image,
    memory: vk::DeviceMemory,
    format: vk::Format,
    aspect: vk::ImageAspectFlags,
    extent: Extent2D,
    byte_size: u64,
    /// Layout after all recorded commands have run.
    layout: vk::ImageLayout,
    blittable: bool,
    views: Vec<(Swizzle, vk::ImageView)>,
}

impl VulkanImage {
    pub fn handle(&self) -> vk::Image {
        self.image
    }

    pub fn extent(&self) -> Extent2D {
        self.extent
    }

    pub fn layout(&self) -> vk::ImageLayout {
        self.layout
    }

    pub fn blittable(&self) -> bool {
        self.blittable
    }

    pub fn format(&self) -> vk::Format {
        self.format
    }

    fn copy_region(&self) -> vk::BufferImageCopy {
        vk::BufferImageCopy {
            buffer_offset: 0,
            buffer_row_length: 0,
            buffer_image_height: 0,
            image_subresource: vk::ImageSubresourceLayers {
                aspect_mask: primary_aspect(self.aspect),
                mip_level: 0,
                base_array_layer: 0,
                layer_count: 1,
            },
            image_offset: vk::Offset3D::default(),
            image_extent: vk::Extent3D {
                width: self.extent.width,
                height: self.extent.height,
                depth: 1,
            },
        }
    }

    fn into_garbage(self) -> VulkanGarbage {
        VulkanGarbage::Image {
            image: self.image,
            memory: self.memory,
            views: self.views.into_iter().map(|(_, view)| view).collect(),
        }
    }
}

/// Host-visible scratch buffer for image-to-image copies.
pub struct VulkanTransferBuffer {
    buffer: vk::Buffer,
    memory: vk::DeviceMemory,
    size: u64,
}

impl VulkanTransferBuffer {
    pub fn size(&self) -> u64 {
        self.size
    }
}

impl VulkanBackend {
    /// Read back the contents of a transfer buffer. The copies that wrote
    /// it must have completed.
    pub fn read_transfer_buffer(&self, buffer: &VulkanTransferBuffer) -> GalResult<Vec<u8>> {
        let device = &self.ctx.device;
        unsafe {
            let ptr = device
                .map_memory(buffer.memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty())
                .or_host("vkMapMemory")?;
            let data = std::slice::from_raw_parts(ptr as *const u8, buffer.size as usize).to_vec();
            device.unmap_memory(buffer.memory);
            Ok(data)
        }
    }

    fn image_view(&mut self, image: &mut VulkanImage, swizzle: &Swizzle) -> GalResult<vk::ImageView> {
        if let Some((_, view)) = image.views.iter().find(|(s, _)| s == swizzle) {
            return Ok(*view);
        }
        let info = vk::ImageViewCreateInfo::builder()
            .image(image.image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(image.format)
            .components(to_vk_components(swizzle))
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: primary_aspect(image.aspect),
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            });
        let view = unsafe { self.ctx.device.create_image_view(&info, None) }.or_host("vkCreateImageView")?;
        image.views.push((*swizzle, view));
        Ok(view)
    }

    /// Record a transition of `image` to `layout` unless it is already there.
    fn ensure_layout(&mut self, image: &mut VulkanImage, layout: vk::ImageLayout) -> GalResult<()> {
        if image.layout == layout {
            return Ok(());
        }
        let (handle, aspect, old) = (image.image, image.aspect, image.layout);
        self.record(|device, cb| unsafe { transition_image(device, cb, handle, aspect, old, layout) })?;
        image.layout = layout;
        Ok(())
    }
}

fn is_blittable(format: ImageFormat, features: vk::FormatFeatureFlags) -> bool {
    let shape = format.shape();
    shape.has_color()
        && !shape.is_compressed()
        && !matches!(format.numeric_type(), NumericType::Uint | NumericType::Sint)
        && features.contains(vk::FormatFeatureFlags::BLIT_SRC)
}

impl ImageBackend for VulkanBackend {
    type Image = VulkanImage;
    type TransferBuffer = VulkanTransferBuffer;

    fn supports_format(&self, format: ImageFormat) -> bool {
        to_vk_format(format).map_or(false, |f| {
            self.ctx
                .format_properties(f)
                .optimal_tiling_features
                .contains(vk::FormatFeatureFlags::SAMPLED_IMAGE)
        })
    }

    fn create_image(&mut self, desc: &ImageDescriptor, usage: ImageUsage) -> GalResult<VulkanImage> {
        let format = to_vk_format(desc.format).ok_or(GalError::FormatUnsupported(desc.format))?;
        let shape = desc.format.shape();
        let aspect = aspect_mask(shape);

        let mut vk_usage = vk::ImageUsageFlags::TRANSFER_SRC | vk::ImageUsageFlags::TRANSFER_DST;
        if usage.contains(ImageUsage::SAMPLED) {
            vk_usage |= vk::ImageUsageFlags::SAMPLED;
        }
        if usage.contains(ImageUsage::RENDER_TARGET) {
            if shape.is_compressed() {
                return Err(GalError::NotSupported("compressed render targets"));
            }
            vk_usage |= if shape.has_color() {
                vk::ImageUsageFlags::COLOR_ATTACHMENT
            } else {
                vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT
            };
        }

        let info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .format(format)
            .extent(vk::Extent3D {
                width: desc.width,
                height: desc.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(vk_usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let device = &self.ctx.device;
        let image = unsafe { device.create_image(&info, None) }.or_host("vkCreateImage")?;
        let requirements = unsafe { device.get_image_memory_requirements(image) };
        let memory = match self.allocate_memory(requirements, vk::MemoryPropertyFlags::DEVICE_LOCAL) {
            Ok(memory) => memory,
            Err(e) => {
                unsafe { device.destroy_image(image, None) };
                return Err(e);
            }
        };
        if let Err(e) = unsafe { device.bind_image_memory(image, memory, 0) } {
            unsafe {
                device.destroy_image(image, None);
                device.free_memory(memory, None);
            }
            return Err(GalError::host("vkBindImageMemory", e));
        }

        let features = self.ctx.format_properties(format).optimal_tiling_features;
        trace!(
            "Created {}x{} image {:?} ({:?}, {} bytes)",
            desc.width,
            desc.height,
            image,
            format,
            requirements.size
        );
        Ok(VulkanImage {
            image,
            memory,
            format,
            aspect,
            extent: Extent2D::new(desc.width, desc.height),
            byte_size: desc.byte_size(),
            layout: vk::ImageLayout::UNDEFINED,
            blittable: is_blittable(desc.format, features),
            views: Vec::new(),
        })
    }

    fn upload_image(&mut self, image: &mut VulkanImage, data: &[u8]) -> GalResult<()> {
        let (staging, staging_memory) = self.create_staging(data, image.byte_size)?;
        let (handle, aspect, old) = (image.image, image.aspect, image.layout);
        let region = image.copy_region();

        let recorded = self.record(|device, cb| unsafe {
            transition_image(device, cb, handle, aspect, old, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
            device.cmd_copy_buffer_to_image(
                cb,
                staging,
                handle,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                std::slice::from_ref(&region),
            );
            transition_image(
                device,
                cb,
                handle,
                aspect,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            );
        });
        self.tracker.defer_release(VulkanGarbage::Buffer {
            buffer: staging,
            memory: staging_memory,
        });
        recorded?;
        image.layout = vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL;
        Ok(())
    }

    fn create_transfer_buffer(&mut self, size: u64) -> GalResult<VulkanTransferBuffer> {
        let (buffer, memory) = self.create_buffer(
            size,
            vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )?;
        Ok(VulkanTransferBuffer { buffer, memory, size })
    }

    fn destroy_transfer_buffer(&mut self, buffer: VulkanTransferBuffer) {
        self.tracker.defer_release(VulkanGarbage::Buffer {
            buffer: buffer.buffer,
            memory: buffer.memory,
        });
    }

    fn clear_transfer_buffer(&mut self, buffer: &mut VulkanTransferBuffer, offset: u64, size: u64) -> GalResult<()> {
        if size == 0 || offset >= buffer.size {
            return Ok(());
        }
        // vkCmdFillBuffer wants a 4-byte aligned offset. Anything below
        // `offset` is rewritten by the copy recorded after this fill.
        let start = offset & !3;
        let target = buffer.buffer;
        self.record(|device, cb| unsafe {
            device.cmd_fill_buffer(cb, target, start, vk::WHOLE_SIZE, 0);
            let filled = vk::MemoryBarrier::builder()
                .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
                .dst_access_mask(vk::AccessFlags::TRANSFER_READ | vk::AccessFlags::TRANSFER_WRITE);
            device.cmd_pipeline_barrier(
                cb,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::TRANSFER,
                vk::DependencyFlags::empty(),
                std::slice::from_ref(&filled),
                &[],
                &[],
            );
        })
    }

    fn copy_image_to_buffer(&mut self, image: &mut VulkanImage, buffer: &mut VulkanTransferBuffer) -> GalResult<()> {
        if buffer.size < image.byte_size {
            return Err(GalError::InvalidState("transfer buffer smaller than the image"));
        }
        let (handle, aspect, old) = (image.image, image.aspect, image.layout);
        // An image that was never written has nothing to restore.
        let restore = if old == vk::ImageLayout::UNDEFINED {
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
        } else {
            old
        };
        let region = image.copy_region();
        let target = buffer.buffer;

        self.record(|device, cb| unsafe {
            transition_image(device, cb, handle, aspect, old, vk::ImageLayout::TRANSFER_SRC_OPTIMAL);
            device.cmd_copy_image_to_buffer(
                cb,
                handle,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                target,
                std::slice::from_ref(&region),
            );
            let written = vk::MemoryBarrier::builder()
                .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
                .dst_access_mask(vk::AccessFlags::TRANSFER_READ | vk::AccessFlags::HOST_READ);
            device.cmd_pipeline_barrier(
                cb,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::TRANSFER | vk::PipelineStageFlags::HOST,
                vk::DependencyFlags::empty(),
                std::slice::from_ref(&written),
                &[],
                &[],
            );
            transition_image(device, cb, handle, aspect, vk::ImageLayout::TRANSFER_SRC_OPTIMAL, restore);
        })?;
        image.layout = restore;
        Ok(())
    }

    fn copy_buffer_to_image(&mut self, buffer: &VulkanTransferBuffer, image: &mut VulkanImage) -> GalResult<()> {
        if buffer.size < image.byte_size {
            return Err(GalError::InvalidState("transfer buffer smaller than the image"));
        }
        let (handle, aspect, old) = (image.image, image.aspect, image.layout);
        let region = image.copy_region();
        let source = buffer.buffer;

        self.record(|device, cb| unsafe {
            transition_image(device, cb, handle, aspect, old, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
            device.cmd_copy_buffer_to_image(
                cb,
                source,
                handle,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                std::slice::from_ref(&region),
            );
            transition_image(
                device,
                cb,
                handle,
                aspect,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            );
        })?;
        image.layout = vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL;
        Ok(())
    }

    fn bind_texture(
        &mut self,
        slot: u32,
        image: &mut VulkanImage,
        swizzle: &Swizzle,
        sampler: &Sampler,
    ) -> GalResult<()> {
        self.ensure_layout(image, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)?;
        let view = self.image_view(image, swizzle)?;
        let sampler = self.sampler(sampler)?;
        self.textures.insert(slot, BoundTexture { view, sampler });
        Ok(())
    }

    fn image_disposer(&self) -> Box<dyn FnMut(VulkanImage) + Send> {
        let sink = self.garbage_sink();
        Box::new(move |image: VulkanImage| sink.lock().push(image.into_garbage()))
    }
}
