// SPDX-FileCopyrightText: 2025 gal contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use ash::vk;

use super::device::VulkanGarbage;
use super::VulkanBackend;
use crate::backend::BufferBackend;
use crate::error::GalResult;

/// Device-local uniform buffer. Writes go through a staging copy.
#[derive(Debug)]
pub struct VulkanBuffer {
    buffer: vk::Buffer,
    memory: vk::DeviceMemory,
    size: u64,
}

impl VulkanBuffer {
    pub fn handle(&self) -> vk::Buffer {
        self.buffer
    }

    pub fn size(&self) -> u64 {
        self.size
    }
}

impl BufferBackend for VulkanBackend {
    type Buffer = VulkanBuffer;

    fn create_uniform_buffer(&mut self, size: u64) -> GalResult<VulkanBuffer> {
        let (buffer, memory) = self.create_buffer(
            size,
            vk::BufferUsageFlags::UNIFORM_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )?;
        Ok(VulkanBuffer { buffer, memory, size })
    }

    fn write_buffer(&mut self, buffer: &mut VulkanBuffer, data: &[u8]) -> GalResult<()> {
        let len = (data.len() as u64).min(buffer.size);
        if len == 0 {
            return Ok(());
        }
        let (staging, staging_memory) = self.create_staging(data, len)?;
        let target = buffer.buffer;

        let recorded = self.record(|device, cb| unsafe {
            let region = vk::BufferCopy {
                src_offset: 0,
                dst_offset: 0,
                size: len,
            };
            device.cmd_copy_buffer(cb, staging, target, std::slice::from_ref(&region));
            let visible = vk::BufferMemoryBarrier::builder()
                .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
                .dst_access_mask(vk::AccessFlags::UNIFORM_READ)
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .buffer(target)
                .offset(0)
                .size(len);
            device.cmd_pipeline_barrier(
                cb,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::VERTEX_SHADER | vk::PipelineStageFlags::FRAGMENT_SHADER,
                vk::DependencyFlags::empty(),
                &[],
                std::slice::from_ref(&visible),
                &[],
            );
        });
        self.tracker.defer_release(VulkanGarbage::Buffer {
            buffer: staging,
            memory: staging_memory,
        });
        recorded
    }

    fn bind_uniform_buffer(&mut self, slot: u32, buffer: &VulkanBuffer) -> GalResult<()> {
        self.uniforms.insert(slot, buffer.buffer);
        Ok(())
    }

    fn buffer_disposer(&self) -> Box<dyn FnMut(VulkanBuffer) + Send> {
        let sink = self.garbage_sink();
        Box::new(move |buffer: VulkanBuffer| {
            sink.lock().push(VulkanGarbage::Buffer {
                buffer: buffer.buffer,
                memory: buffer.memory,
            })
        })
    }
}
