// SPDX-FileCopyrightText: 2025 gal contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! CPU reference backend.
//!
//! Resources live in host memory and operations take effect immediately,
//! the way a bound-state API behaves from the caller's side. Submission is
//! simulated: every submit gets the next value on a GPU timeline, and that
//! timeline only advances when told to (`complete_all`, `complete_through`)
//! or when the host waits on a fence. This makes fence polling and
//! reclamation observable without a GPU.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use gal_common::Extent2D;
use log::{debug, info, trace};
use parking_lot::RwLock;

use super::{Backend, BackendType, BufferBackend, ImageBackend, ImageUsage, ShaderBackend};
use crate::error::{GalError, GalResult};
use crate::format::{ImageDescriptor, ImageFormat, Sampler, Shape, Swizzle};
use crate::shader::{StageKind, UniformBlockBinding};
use crate::swapchain::{
    choose_extent, choose_image_count, choose_present_mode, AcquireOutcome, FrameContent,
    PresentDevice, PresentMode, PresentOutcome, SurfaceCaps, SwapchainInfo, SwapchainRequest,
};
use crate::sync::{SubmissionTracker, Submission, SyncDevice};

const ONE_SHOT_POOL: u32 = 1;
const MAX_SURFACE_EXTENT: u32 = 16384;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SoftwareQueue;

/// Placeholder for an object whose release must wait for the GPU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SoftwareGarbage(pub &'static str);

#[derive(Debug)]
pub struct SoftwareFence {
    id: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionRecord {
    pub command_buffers: Vec<u64>,
    pub waits: Vec<u64>,
    pub signal: u64,
    /// Timeline value the batch completes at.
    pub timeline: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresentRecord {
    pub swapchain: u64,
    pub index: u32,
    pub waits: Vec<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurfaceEvent {
    Created { id: u64, previous: Option<u64> },
    Destroyed { id: u64 },
}

#[derive(Debug)]
pub struct SoftwareSwapchain {
    id: u64,
    extent: Extent2D,
    image_count: usize,
    present_mode: PresentMode,
}

/// RGBA8 copy of an image, used as a frame source.
#[derive(Debug, Clone)]
pub struct SoftwareBlitSource {
    pub width: u32,
    pub height: u32,
    /// Empty if the image format cannot be shown.
    pub pixels: Vec<u8>,
}

/// Simulated GPU: submission timeline, sync objects and one window surface.
pub struct SoftwareDevice {
    next_handle: u64,
    submitted: u64,
    completed: u64,
    fences: HashMap<u64, Option<u64>>,
    semaphores: HashSet<u64>,
    waited: HashSet<u64>,
    command_buffers: HashSet<u64>,
    invalid_destroys: usize,
    submissions: Vec<SubmissionRecord>,
    released: Vec<&'static str>,

    surface_extent: Extent2D,
    surface_stale: bool,
    present_modes: Vec<PresentMode>,
    next_image: HashMap<u64, u32>,
    framebuffers: HashMap<u64, Vec<Vec<u8>>>,
    presents: Vec<PresentRecord>,
    surface_events: Vec<SurfaceEvent>,
    last_presented: Option<(u64, u32)>,
    last_acquire: Option<u64>,
    fail_next_record: bool,
}

impl Default for SoftwareDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl SoftwareDevice {
    pub fn new() -> Self {
        Self {
            next_handle: 1,
            submitted: 0,
            completed: 0,
            fences: HashMap::new(),
            semaphores: HashSet::new(),
            waited: HashSet::new(),
            command_buffers: HashSet::new(),
            invalid_destroys: 0,
            submissions: Vec::new(),
            released: Vec::new(),
            surface_extent: Extent2D::new(1280, 720),
            surface_stale: false,
            present_modes: vec![PresentMode::Fifo, PresentMode::Mailbox, PresentMode::Immediate],
            next_image: HashMap::new(),
            framebuffers: HashMap::new(),
            presents: Vec::new(),
            surface_events: Vec::new(),
            last_presented: None,
            last_acquire: None,
            fail_next_record: false,
        }
    }

    fn handle(&mut self) -> u64 {
        let id = self.next_handle;
        self.next_handle += 1;
        id
    }

    /// Finish every submitted batch.
    pub fn complete_all(&mut self) {
        self.completed = self.submitted;
    }

    /// Finish batches up to timeline value `value`.
    pub fn complete_through(&mut self, value: u64) {
        self.completed = self.completed.max(value.min(self.submitted));
    }

    /// Change the window size. Swapchains of another size become suboptimal.
    pub fn resize_surface(&mut self, extent: Extent2D) {
        self.surface_extent = extent;
    }

    /// Make acquire and present report the surface as out of date until
    /// the next swapchain is created.
    pub fn invalidate_surface(&mut self) {
        self.surface_stale = true;
    }

    /// Make the next `record_frame` fail as a host error would.
    pub fn fail_next_record(&mut self) {
        self.fail_next_record = true;
    }

    pub fn set_present_modes(&mut self, modes: Vec<PresentMode>) {
        self.present_modes = modes;
    }

    pub fn submissions(&self) -> &[SubmissionRecord] {
        &self.submissions
    }

    pub fn presents(&self) -> &[PresentRecord] {
        &self.presents
    }

    pub fn surface_events(&self) -> &[SurfaceEvent] {
        &self.surface_events
    }

    pub fn released(&self) -> &[&'static str] {
        &self.released
    }

    pub fn last_acquire_semaphore(&self) -> Option<u64> {
        self.last_acquire
    }

    /// RGBA8 contents of the most recently presented image.
    pub fn presented_pixels(&self) -> Option<&[u8]> {
        let (swapchain, index) = self.last_presented?;
        self.framebuffers
            .get(&swapchain)?
            .get(index as usize)
            .map(Vec::as_slice)
    }

    pub fn live_semaphores(&self) -> usize {
        self.semaphores.len()
    }

    pub fn is_semaphore_alive(&self, semaphore: u64) -> bool {
        self.semaphores.contains(&semaphore)
    }

    pub fn live_fences(&self) -> usize {
        self.fences.len()
    }

    pub fn live_command_buffers(&self) -> usize {
        self.command_buffers.len()
    }

    /// Destroy calls on handles that were not alive.
    pub fn double_destroys(&self) -> usize {
        self.invalid_destroys
    }
}

impl SyncDevice for SoftwareDevice {
    type Queue = SoftwareQueue;
    type CommandBuffer = u64;
    type CommandPool = u32;
    type Fence = SoftwareFence;
    type Semaphore = u64;
    type Deferred = SoftwareGarbage;

    fn begin_one_shot(&mut self) -> GalResult<(u64, u32)> {
        let id = self.handle();
        self.command_buffers.insert(id);
        Ok((id, ONE_SHOT_POOL))
    }

    fn end_command_buffer(&mut self, command_buffer: u64) -> GalResult<()> {
        if self.command_buffers.contains(&command_buffer) {
            Ok(())
        } else {
            Err(GalError::InvalidState("ending a command buffer that does not exist"))
        }
    }

    fn free_command_buffer(&mut self, _pool: u32, command_buffer: u64) {
        if !self.command_buffers.remove(&command_buffer) {
            self.invalid_destroys += 1;
        }
    }

    fn create_fence(&mut self) -> GalResult<SoftwareFence> {
        let id = self.handle();
        self.fences.insert(id, None);
        Ok(SoftwareFence { id })
    }

    fn destroy_fence(&mut self, fence: SoftwareFence) {
        if self.fences.remove(&fence.id).is_none() {
            self.invalid_destroys += 1;
        }
    }

    fn fence_signaled(&mut self, fence: &SoftwareFence) -> GalResult<bool> {
        match self.fences.get(&fence.id) {
            Some(Some(value)) => Ok(*value <= self.completed),
            Some(None) => Ok(false),
            None => Err(GalError::InvalidState("polling a destroyed fence")),
        }
    }

    fn wait_fence(&mut self, fence: &SoftwareFence) -> GalResult<()> {
        match self.fences.get(&fence.id) {
            Some(Some(value)) => {
                self.completed = self.completed.max(*value);
                Ok(())
            }
            Some(None) => Err(GalError::InvalidState("waiting on a fence that was never submitted")),
            None => Err(GalError::InvalidState("waiting on a destroyed fence")),
        }
    }

    fn create_semaphore(&mut self) -> GalResult<u64> {
        let id = self.handle();
        self.semaphores.insert(id);
        Ok(id)
    }

    fn destroy_semaphore(&mut self, semaphore: u64) {
        if !self.semaphores.remove(&semaphore) {
            self.invalid_destroys += 1;
        }
    }

    fn submit(&mut self, _queue: SoftwareQueue, submission: &Submission<'_, Self>) -> GalResult<()> {
        for semaphore in submission.wait_semaphores {
            if !self.semaphores.contains(semaphore) {
                return Err(GalError::InvalidState("waiting on a destroyed semaphore"));
            }
            if !self.waited.insert(*semaphore) {
                return Err(GalError::InvalidState("semaphore waited on twice"));
            }
        }
        self.submitted += 1;
        self.fences.insert(submission.fence.id, Some(self.submitted));
        self.submissions.push(SubmissionRecord {
            command_buffers: submission.command_buffers.to_vec(),
            waits: submission.wait_semaphores.to_vec(),
            signal: submission.signal_semaphore,
            timeline: self.submitted,
        });
        trace!("Software submit #{}", self.submitted);
        Ok(())
    }

    fn release_deferred(&mut self, item: SoftwareGarbage) {
        self.released.push(item.0);
    }

    fn wait_idle(&mut self) -> GalResult<()> {
        self.complete_all();
        Ok(())
    }
}

impl PresentDevice for SoftwareDevice {
    type Swapchain = SoftwareSwapchain;
    type BlitSource = SoftwareBlitSource;

    fn create_swapchain(
        &mut self,
        request: &SwapchainRequest,
        previous: Option<&SoftwareSwapchain>,
    ) -> GalResult<SoftwareSwapchain> {
        if request.extent.is_empty() || self.surface_extent.is_empty() {
            return Err(GalError::InvalidState("swapchain with no area"));
        }
        let caps = SurfaceCaps {
            current_extent: Some(self.surface_extent),
            min_extent: Extent2D::new(1, 1),
            max_extent: Extent2D::new(MAX_SURFACE_EXTENT, MAX_SURFACE_EXTENT),
            min_image_count: 2,
            max_image_count: 3,
        };
        let extent = choose_extent(&caps, request.extent);
        let image_count = choose_image_count(&caps) as usize;
        let present_mode = choose_present_mode(&self.present_modes, request.present_mode, request.vsync);

        let id = self.handle();
        let size = extent.width as usize * extent.height as usize * 4;
        self.framebuffers.insert(id, vec![vec![0; size]; image_count]);
        self.surface_events.push(SurfaceEvent::Created {
            id,
            previous: previous.map(|p| p.id),
        });
        self.surface_stale = false;
        Ok(SoftwareSwapchain {
            id,
            extent,
            image_count,
            present_mode,
        })
    }

    fn destroy_swapchain(&mut self, swapchain: SoftwareSwapchain) {
        self.framebuffers.remove(&swapchain.id);
        self.next_image.remove(&swapchain.id);
        self.surface_events
            .push(SurfaceEvent::Destroyed { id: swapchain.id });
    }

    fn swapchain_info(&self, swapchain: &SoftwareSwapchain) -> SwapchainInfo {
        SwapchainInfo {
            extent: swapchain.extent,
            image_count: swapchain.image_count,
            present_mode: swapchain.present_mode,
        }
    }

    fn acquire_next_image(
        &mut self,
        swapchain: &SoftwareSwapchain,
        signal: u64,
    ) -> GalResult<AcquireOutcome> {
        if self.surface_stale {
            return Ok(AcquireOutcome::OutOfDate);
        }
        if !self.semaphores.contains(&signal) {
            return Err(GalError::InvalidState("acquire with a destroyed semaphore"));
        }
        let next = self.next_image.entry(swapchain.id).or_insert(0);
        let index = *next % swapchain.image_count as u32;
        *next = next.wrapping_add(1);
        self.last_acquire = Some(signal);
        Ok(AcquireOutcome::Acquired {
            index,
            suboptimal: self.surface_extent != swapchain.extent,
        })
    }

    fn record_frame(
        &mut self,
        command_buffer: u64,
        swapchain: &SoftwareSwapchain,
        index: u32,
        content: &FrameContent<'_, SoftwareBlitSource>,
    ) -> GalResult<()> {
        if !self.command_buffers.contains(&command_buffer) {
            return Err(GalError::InvalidState("recording into a freed command buffer"));
        }
        if std::mem::take(&mut self.fail_next_record) {
            return Err(GalError::host("record_frame", ash::vk::Result::ERROR_OUT_OF_DEVICE_MEMORY));
        }
        let target = self
            .framebuffers
            .get_mut(&swapchain.id)
            .and_then(|images| images.get_mut(index as usize))
            .ok_or(GalError::InvalidState("swapchain image out of range"))?;

        let color = content.clear_color.map(|c| (c.clamp(0.0, 1.0) * 255.0).round() as u8);
        for texel in target.chunks_exact_mut(4) {
            texel.copy_from_slice(&color);
        }
        if let Some(source) = content.source.filter(|s| !s.pixels.is_empty()) {
            let corners = content.transform.source_corners(source.width, source.height);
            blit_nearest(source, corners, target, swapchain.extent);
        }
        Ok(())
    }

    fn present(
        &mut self,
        _queue: SoftwareQueue,
        swapchain: &SoftwareSwapchain,
        index: u32,
        wait_semaphores: &[u64],
    ) -> GalResult<PresentOutcome> {
        if self.surface_stale {
            return Ok(PresentOutcome::OutOfDate);
        }
        self.presents.push(PresentRecord {
            swapchain: swapchain.id,
            index,
            waits: wait_semaphores.to_vec(),
        });
        self.last_presented = Some((swapchain.id, index));
        if self.surface_extent != swapchain.extent {
            Ok(PresentOutcome::Suboptimal)
        } else {
            Ok(PresentOutcome::Optimal)
        }
    }
}

/// Nearest-neighbour scale of the `corners` region of `source` onto the
/// whole of `target`.
fn blit_nearest(
    source: &SoftwareBlitSource,
    corners: [(i32, i32); 2],
    target: &mut [u8],
    extent: Extent2D,
) {
    let [(x0, y0), (x1, y1)] = corners;
    if x0 == x1 || y0 == y1 {
        return;
    }
    let pick = |from: i32, to: i32, dst: u32, size: u32| -> usize {
        let t = (dst as f32 + 0.5) / size as f32;
        let pos = (from as f32 + (to - from) as f32 * t).floor() as i32;
        pos.clamp(from.min(to), from.max(to) - 1) as usize
    };
    for dy in 0..extent.height {
        let sy = pick(y0, y1, dy, extent.height);
        for dx in 0..extent.width {
            let sx = pick(x0, x1, dx, extent.width);
            let src = (sy * source.width as usize + sx) * 4;
            let dst = (dy as usize * extent.width as usize + dx as usize) * 4;
            if let (Some(from), Some(to)) = (source.pixels.get(src..src + 4), target.get_mut(dst..dst + 4)) {
                to.copy_from_slice(from);
            }
        }
    }
}

#[derive(Debug)]
pub struct SoftwareImage {
    id: u64,
    descriptor: ImageDescriptor,
    usage: ImageUsage,
    data: Vec<u8>,
}

impl SoftwareImage {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn descriptor(&self) -> &ImageDescriptor {
        &self.descriptor
    }

    pub fn usage(&self) -> ImageUsage {
        self.usage
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

#[derive(Debug)]
pub struct SoftwareTransferBuffer {
    data: Vec<u8>,
}

#[derive(Debug)]
pub struct SoftwareBuffer {
    storage: Arc<RwLock<Vec<u8>>>,
    mapped: bool,
}

impl SoftwareBuffer {
    fn map(&mut self) -> GalResult<()> {
        if self.mapped {
            return Err(GalError::InvalidState("buffer is already mapped"));
        }
        self.mapped = true;
        Ok(())
    }

    fn unmap(&mut self) {
        self.mapped = false;
    }
}

#[derive(Debug)]
pub struct SoftwareShader {
    kind: StageKind,
    source: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SoftwareProgram(pub u64);

/// Texture unit state.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundTexture {
    pub image: u64,
    pub swizzle: Swizzle,
    pub sampler: Sampler,
}

pub struct SoftwareBackend {
    tracker: SubmissionTracker<SoftwareDevice>,
    next_id: u64,
    destroyed_images: Arc<AtomicUsize>,
    destroyed_buffers: Arc<AtomicUsize>,
    textures: BTreeMap<u32, BoundTexture>,
    uniforms: BTreeMap<u32, Arc<RwLock<Vec<u8>>>>,
    current_program: Option<SoftwareProgram>,
    texture_units: HashMap<(SoftwareProgram, String), u32>,
    compiles: usize,
    links: usize,
}

impl Default for SoftwareBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl SoftwareBackend {
    pub fn new() -> Self {
        Self::with_device(SoftwareDevice::new())
    }

    pub fn with_device(device: SoftwareDevice) -> Self {
        info!("Software backend initialized");
        Self {
            tracker: SubmissionTracker::new(device),
            next_id: 1,
            destroyed_images: Arc::new(AtomicUsize::new(0)),
            destroyed_buffers: Arc::new(AtomicUsize::new(0)),
            textures: BTreeMap::new(),
            uniforms: BTreeMap::new(),
            current_program: None,
            texture_units: HashMap::new(),
            compiles: 0,
            links: 0,
        }
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub fn device(&self) -> &SoftwareDevice {
        self.tracker.device()
    }

    pub fn device_mut(&mut self) -> &mut SoftwareDevice {
        self.tracker.device_mut()
    }

    pub fn destroyed_images(&self) -> usize {
        self.destroyed_images.load(Ordering::Relaxed)
    }

    pub fn destroyed_buffers(&self) -> usize {
        self.destroyed_buffers.load(Ordering::Relaxed)
    }

    pub fn bound_texture(&self, slot: u32) -> Option<&BoundTexture> {
        self.textures.get(&slot)
    }

    /// Contents of the buffer bound to uniform `slot`.
    pub fn uniform_slot_data(&self, slot: u32) -> Option<Vec<u8>> {
        self.uniforms.get(&slot).map(|storage| storage.read().clone())
    }

    pub fn current_program(&self) -> Option<SoftwareProgram> {
        self.current_program
    }

    /// Texture unit assigned to sampler `name` of `program`.
    pub fn texture_unit(&self, program: SoftwareProgram, name: &str) -> Option<u32> {
        self.texture_units.get(&(program, name.to_string())).copied()
    }

    pub fn compile_count(&self) -> usize {
        self.compiles
    }

    pub fn link_count(&self) -> usize {
        self.links
    }
}

impl ImageBackend for SoftwareBackend {
    type Image = SoftwareImage;
    type TransferBuffer = SoftwareTransferBuffer;

    fn supports_format(&self, format: ImageFormat) -> bool {
        // Compressed blocks are stored raw; only ASTC needs decoding first.
        format.shape().compression() != crate::format::Compression::Astc
    }

    fn create_image(&mut self, desc: &ImageDescriptor, usage: ImageUsage) -> GalResult<SoftwareImage> {
        let id = self.next_id();
        Ok(SoftwareImage {
            id,
            descriptor: *desc,
            usage,
            data: vec![0; desc.byte_size() as usize],
        })
    }

    fn upload_image(&mut self, image: &mut SoftwareImage, data: &[u8]) -> GalResult<()> {
        let len = image.data.len().min(data.len());
        if len < image.data.len() {
            debug!(
                "Image {}: upload of {} bytes is short of {}",
                image.id,
                data.len(),
                image.data.len()
            );
        }
        image.data[..len].copy_from_slice(&data[..len]);
        Ok(())
    }

    fn create_transfer_buffer(&mut self, size: u64) -> GalResult<SoftwareTransferBuffer> {
        Ok(SoftwareTransferBuffer {
            data: vec![0; size as usize],
        })
    }

    fn destroy_transfer_buffer(&mut self, _buffer: SoftwareTransferBuffer) {}

    fn clear_transfer_buffer(
        &mut self,
        buffer: &mut SoftwareTransferBuffer,
        offset: u64,
        size: u64,
    ) -> GalResult<()> {
        let len = buffer.data.len();
        let start = (offset as usize).min(len);
        let end = (offset.saturating_add(size) as usize).min(len);
        buffer.data[start..end].fill(0);
        Ok(())
    }

    fn copy_image_to_buffer(
        &mut self,
        image: &mut SoftwareImage,
        buffer: &mut SoftwareTransferBuffer,
    ) -> GalResult<()> {
        let len = image.data.len().min(buffer.data.len());
        buffer.data[..len].copy_from_slice(&image.data[..len]);
        Ok(())
    }

    fn copy_buffer_to_image(
        &mut self,
        buffer: &SoftwareTransferBuffer,
        image: &mut SoftwareImage,
    ) -> GalResult<()> {
        let len = image.data.len().min(buffer.data.len());
        image.data[..len].copy_from_slice(&buffer.data[..len]);
        Ok(())
    }

    fn bind_texture(
        &mut self,
        slot: u32,
        image: &mut SoftwareImage,
        swizzle: &Swizzle,
        sampler: &Sampler,
    ) -> GalResult<()> {
        trace!("Texture unit {}: image {}", slot, image.id);
        self.textures.insert(
            slot,
            BoundTexture {
                image: image.id,
                swizzle: *swizzle,
                sampler: *sampler,
            },
        );
        Ok(())
    }

    fn image_disposer(&self) -> Box<dyn FnMut(SoftwareImage) + Send> {
        let destroyed = self.destroyed_images.clone();
        Box::new(move |image| {
            trace!("Image {} destroyed", image.id);
            destroyed.fetch_add(1, Ordering::Relaxed);
        })
    }
}

impl BufferBackend for SoftwareBackend {
    type Buffer = SoftwareBuffer;

    fn create_uniform_buffer(&mut self, size: u64) -> GalResult<SoftwareBuffer> {
        Ok(SoftwareBuffer {
            storage: Arc::new(RwLock::new(vec![0; size as usize])),
            mapped: false,
        })
    }

    fn write_buffer(&mut self, buffer: &mut SoftwareBuffer, data: &[u8]) -> GalResult<()> {
        buffer.map()?;
        {
            let mut storage = buffer.storage.write();
            let len = storage.len().min(data.len());
            storage[..len].copy_from_slice(&data[..len]);
        }
        buffer.unmap();
        Ok(())
    }

    fn bind_uniform_buffer(&mut self, slot: u32, buffer: &SoftwareBuffer) -> GalResult<()> {
        self.uniforms.insert(slot, buffer.storage.clone());
        Ok(())
    }

    fn buffer_disposer(&self) -> Box<dyn FnMut(SoftwareBuffer) + Send> {
        let destroyed = self.destroyed_buffers.clone();
        Box::new(move |_| {
            destroyed.fetch_add(1, Ordering::Relaxed);
        })
    }
}

impl ShaderBackend for SoftwareBackend {
    type Shader = SoftwareShader;
    type Program = SoftwareProgram;

    fn compile_shader(&mut self, kind: StageKind, source: &str) -> GalResult<SoftwareShader> {
        if source.trim().is_empty() {
            return Err(GalError::Compile {
                stage: kind,
                log: "empty source".to_string(),
            });
        }
        if !source.contains("main") {
            return Err(GalError::Compile {
                stage: kind,
                log: "entry point 'main' not found".to_string(),
            });
        }
        self.compiles += 1;
        Ok(SoftwareShader {
            kind,
            source: source.to_string(),
        })
    }

    fn link_program(
        &mut self,
        stages: &[(StageKind, &SoftwareShader)],
        uniform_blocks: &[UniformBlockBinding],
    ) -> GalResult<SoftwareProgram> {
        for block in uniform_blocks {
            let declared = stages
                .iter()
                .find(|(kind, _)| *kind == block.stage)
                .map_or(false, |(_, shader)| shader.source.contains(block.name.as_str()));
            if !declared {
                return Err(GalError::Link {
                    log: format!(
                        "uniform block '{}' not found in {:?} stage",
                        block.name, block.stage
                    ),
                });
            }
        }
        if let Some((kind, shader)) = stages.iter().find(|(kind, shader)| *kind != shader.kind) {
            return Err(GalError::Link {
                log: format!("{:?} shader attached as {:?}", shader.kind, kind),
            });
        }
        self.links += 1;
        Ok(SoftwareProgram(self.next_id()))
    }

    fn use_program(&mut self, program: &SoftwareProgram) -> GalResult<()> {
        self.current_program = Some(*program);
        Ok(())
    }

    fn set_texture_binding(&mut self, program: &mut SoftwareProgram, name: &str, unit: u32) -> GalResult<()> {
        trace!("Program {}: sampler '{}' on unit {}", program.0, name, unit);
        self.texture_units.insert((*program, name.to_string()), unit);
        Ok(())
    }

    fn destroy_shader(&mut self, _shader: SoftwareShader) {}

    fn destroy_program(&mut self, program: SoftwareProgram) {
        if self.current_program == Some(program) {
            self.current_program = None;
        }
        self.texture_units.retain(|(p, _), _| *p != program);
    }
}

impl Backend for SoftwareBackend {
    type Device = SoftwareDevice;

    fn backend_type(&self) -> BackendType {
        BackendType::Software
    }

    fn tracker(&mut self) -> &mut SubmissionTracker<SoftwareDevice> {
        &mut self.tracker
    }

    fn tracker_ref(&self) -> &SubmissionTracker<SoftwareDevice> {
        &self.tracker
    }

    fn queue(&self) -> SoftwareQueue {
        SoftwareQueue
    }

    fn blit_source(&self, image: &SoftwareImage) -> SoftwareBlitSource {
        let desc = image.descriptor;
        let pixels = match desc.format.shape() {
            Shape::R8G8B8A8 | Shape::A8B8G8R8 | Shape::A8B8G8R8Srgb => image.data.clone(),
            Shape::B8G8R8A8 => {
                let mut pixels = image.data.clone();
                for texel in pixels.chunks_exact_mut(4) {
                    texel.swap(0, 2);
                }
                pixels
            }
            other => {
                debug!("Cannot show {:?} images, clearing instead", other);
                Vec::new()
            }
        };
        SoftwareBlitSource {
            width: desc.width,
            height: desc.height,
            pixels,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::NumericType;
    use crate::swapchain::FrameTransform;

    #[test]
    fn test_timeline_controls_fences() {
        let mut device = SoftwareDevice::new();
        let fence = device.create_fence().unwrap();
        assert!(!device.fence_signaled(&fence).unwrap());
        assert!(device.wait_fence(&fence).is_err());

        let signal = device.create_semaphore().unwrap();
        device
            .submit(
                SoftwareQueue,
                &Submission {
                    command_buffers: &[],
                    wait_semaphores: &[],
                    signal_semaphore: signal,
                    fence: &fence,
                },
            )
            .unwrap();
        assert!(!device.fence_signaled(&fence).unwrap());
        device.complete_all();
        assert!(device.fence_signaled(&fence).unwrap());
    }

    #[test]
    fn test_semaphore_waited_twice_is_rejected() {
        let mut device = SoftwareDevice::new();
        let semaphore = device.create_semaphore().unwrap();
        let signal = device.create_semaphore().unwrap();
        let first = device.create_fence().unwrap();
        let second = device.create_fence().unwrap();
        let waits = [semaphore];

        device
            .submit(
                SoftwareQueue,
                &Submission {
                    command_buffers: &[],
                    wait_semaphores: &waits,
                    signal_semaphore: signal,
                    fence: &first,
                },
            )
            .unwrap();
        assert!(device
            .submit(
                SoftwareQueue,
                &Submission {
                    command_buffers: &[],
                    wait_semaphores: &waits,
                    signal_semaphore: signal,
                    fence: &second,
                },
            )
            .is_err());
    }

    #[test]
    fn test_double_destroy_is_counted() {
        let mut device = SoftwareDevice::new();
        let semaphore = device.create_semaphore().unwrap();
        device.destroy_semaphore(semaphore);
        device.destroy_semaphore(semaphore);
        assert_eq!(device.double_destroys(), 1);
    }

    #[test]
    fn test_blit_source_swaps_bgra() {
        let mut backend = SoftwareBackend::new();
        let desc = ImageDescriptor::new(
            1,
            1,
            ImageFormat::new(Shape::B8G8R8A8, NumericType::Unorm).unwrap(),
        );
        let mut image = backend.create_image(&desc, ImageUsage::SAMPLED).unwrap();
        backend.upload_image(&mut image, &[1, 2, 3, 4]).unwrap();
        assert_eq!(backend.blit_source(&image).pixels, vec![3, 2, 1, 4]);
    }

    #[test]
    fn test_blit_nearest_flips() {
        let source = SoftwareBlitSource {
            width: 2,
            height: 1,
            pixels: vec![10, 10, 10, 255, 20, 20, 20, 255],
        };
        let mut target = vec![0; 2 * 4];
        let transform = FrameTransform {
            flip_x: true,
            ..Default::default()
        };
        blit_nearest(
            &source,
            transform.source_corners(2, 1),
            &mut target,
            Extent2D::new(2, 1),
        );
        assert_eq!(target, vec![20, 20, 20, 255, 10, 10, 10, 255]);
    }

    #[test]
    fn test_buffer_map_is_exclusive() {
        let mut backend = SoftwareBackend::new();
        let mut buffer = backend.create_uniform_buffer(4).unwrap();
        buffer.map().unwrap();
        assert!(matches!(
            backend.write_buffer(&mut buffer, &[1]),
            Err(GalError::InvalidState(_))
        ));
        buffer.unmap();
        backend.write_buffer(&mut buffer, &[1]).unwrap();
        assert_eq!(buffer.storage.read()[0], 1);
    }
}
