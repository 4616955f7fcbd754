// SPDX-FileCopyrightText: 2025 gal contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Swapchain management and frame presentation.
//!
//! Per frame: acquire an image, wait for the call that last rendered into
//! it, record a clear or blit, submit chained after all prior work, then
//! present waiting on that submission's signal. Stale or suboptimal results
//! flag the swapchain for recreation before the next frame.

use gal_common::settings::PresentModePreference;
use gal_common::Extent2D;
use log::{debug, info, warn};

use crate::error::{GalError, GalResult};
use crate::sync::{CallId, SubmissionTracker, SyncDevice};

/// Clear color: cornflower blue (matches XNA/MonoGame default).
pub const CLEAR_COLOR: [f32; 4] = [0.39, 0.58, 0.93, 1.0];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PresentMode {
    Immediate,
    Mailbox,
    Fifo,
    FifoRelaxed,
}

/// Surface limits reported by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SurfaceCaps {
    /// `None` when the surface size is decided by the swapchain.
    pub current_extent: Option<Extent2D>,
    pub min_extent: Extent2D,
    pub max_extent: Extent2D,
    pub min_image_count: u32,
    /// Zero means unlimited.
    pub max_image_count: u32,
}

/// Pick a present mode. FIFO is always available and is the fallback.
pub fn choose_present_mode(
    available: &[PresentMode],
    preference: PresentModePreference,
    vsync: bool,
) -> PresentMode {
    let wanted: &[PresentMode] = match preference {
        PresentModePreference::Auto if vsync => &[PresentMode::Fifo],
        PresentModePreference::Auto => &[PresentMode::Mailbox, PresentMode::Immediate],
        PresentModePreference::Fifo => &[PresentMode::Fifo],
        PresentModePreference::Mailbox => &[PresentMode::Mailbox],
        PresentModePreference::Immediate => &[PresentMode::Immediate],
    };
    wanted
        .iter()
        .copied()
        .find(|mode| available.contains(mode))
        .unwrap_or(PresentMode::Fifo)
}

/// One more image than the minimum, capped by the maximum.
pub fn choose_image_count(caps: &SurfaceCaps) -> u32 {
    let desired = caps.min_image_count + 1;
    if caps.max_image_count > 0 {
        desired.min(caps.max_image_count)
    } else {
        desired
    }
}

pub fn choose_extent(caps: &SurfaceCaps, requested: Extent2D) -> Extent2D {
    match caps.current_extent {
        Some(extent) => extent,
        None => Extent2D::new(
            requested
                .width
                .clamp(caps.min_extent.width, caps.max_extent.width),
            requested
                .height
                .clamp(caps.min_extent.height, caps.max_extent.height),
        ),
    }
}

/// Source region of a frame blit. A zero `right`/`bottom` means the full
/// width/height of the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CropRect {
    pub left: u32,
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameTransform {
    pub flip_x: bool,
    pub flip_y: bool,
    pub crop: CropRect,
}

impl FrameTransform {
    /// Corners of the source rectangle within a `width`x`height` image.
    /// Flipped axes have their corners swapped.
    pub fn source_corners(&self, width: u32, height: u32) -> [(i32, i32); 2] {
        let right = if self.crop.right == 0 {
            width
        } else {
            self.crop.right.min(width)
        };
        let bottom = if self.crop.bottom == 0 {
            height
        } else {
            self.crop.bottom.min(height)
        };
        let (mut x0, mut x1) = (self.crop.left.min(right) as i32, right as i32);
        let (mut y0, mut y1) = (self.crop.top.min(bottom) as i32, bottom as i32);
        if self.flip_x {
            std::mem::swap(&mut x0, &mut x1);
        }
        if self.flip_y {
            std::mem::swap(&mut y0, &mut y1);
        }
        [(x0, y0), (x1, y1)]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapchainRequest {
    pub extent: Extent2D,
    pub vsync: bool,
    pub present_mode: PresentModePreference,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapchainInfo {
    pub extent: Extent2D,
    pub image_count: usize,
    pub present_mode: PresentMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    Acquired { index: u32, suboptimal: bool },
    OutOfDate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentOutcome {
    Optimal,
    Suboptimal,
    OutOfDate,
}

/// What to draw into an acquired image.
pub struct FrameContent<'a, S> {
    pub clear_color: [f32; 4],
    /// Blitted over the clear color when present.
    pub source: Option<&'a S>,
    pub transform: FrameTransform,
}

/// Host presentation primitives.
pub trait PresentDevice: SyncDevice {
    type Swapchain;
    type BlitSource;

    /// Build a swapchain. `previous` is still alive and may be handed to the
    /// host for resource reuse; the caller destroys it afterwards.
    fn create_swapchain(
        &mut self,
        request: &SwapchainRequest,
        previous: Option<&Self::Swapchain>,
    ) -> GalResult<Self::Swapchain>;
    fn destroy_swapchain(&mut self, swapchain: Self::Swapchain);
    fn swapchain_info(&self, swapchain: &Self::Swapchain) -> SwapchainInfo;
    fn acquire_next_image(
        &mut self,
        swapchain: &Self::Swapchain,
        signal: Self::Semaphore,
    ) -> GalResult<AcquireOutcome>;
    fn record_frame(
        &mut self,
        command_buffer: Self::CommandBuffer,
        swapchain: &Self::Swapchain,
        index: u32,
        content: &FrameContent<'_, Self::BlitSource>,
    ) -> GalResult<()>;
    fn present(
        &mut self,
        queue: Self::Queue,
        swapchain: &Self::Swapchain,
        index: u32,
        wait_semaphores: &[Self::Semaphore],
    ) -> GalResult<PresentOutcome>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    Presented { index: u32, call: CallId },
    /// Presented, but the swapchain will be rebuilt before the next frame.
    Stale { index: u32, call: CallId },
    /// Nothing presented: no usable swapchain, or the surface went stale
    /// while acquiring.
    Skipped,
}

struct FrameSlot<S> {
    last_call: Option<CallId>,
    render_complete: Option<S>,
}

impl<S> Default for FrameSlot<S> {
    fn default() -> Self {
        Self {
            last_call: None,
            render_complete: None,
        }
    }
}

pub struct SwapchainManager<P: PresentDevice> {
    swapchain: Option<P::Swapchain>,
    request: SwapchainRequest,
    frames: Vec<FrameSlot<P::Semaphore>>,
    needs_recreate: bool,
    generation: u64,
}

impl<P: PresentDevice> SwapchainManager<P> {
    pub fn new(request: SwapchainRequest) -> Self {
        Self {
            swapchain: None,
            request,
            frames: Vec::new(),
            needs_recreate: false,
            generation: 0,
        }
    }

    pub fn has_swapchain(&self) -> bool {
        self.swapchain.is_some()
    }

    pub fn needs_recreate(&self) -> bool {
        self.needs_recreate
    }

    /// Number of swapchains built so far.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn info(&self, device: &P) -> Option<SwapchainInfo> {
        self.swapchain.as_ref().map(|s| device.swapchain_info(s))
    }

    /// Request a new size. Applied when the next frame is presented.
    pub fn resize(&mut self, extent: Extent2D) {
        if extent != self.request.extent {
            debug!("Swapchain resize requested: {}x{}", extent.width, extent.height);
            self.request.extent = extent;
            self.needs_recreate = true;
        }
    }

    /// Build a swapchain for the current request, replacing the old one.
    /// Returns false if the requested area is empty.
    pub fn recreate(&mut self, tracker: &mut SubmissionTracker<P>) -> GalResult<bool> {
        if self.request.extent.is_empty() {
            debug!("Swapchain recreation postponed: window has no area");
            return Ok(false);
        }
        tracker.device_mut().wait_idle()?;
        tracker.free_unused_memory()?;

        let device = tracker.device_mut();
        let swapchain = device.create_swapchain(&self.request, self.swapchain.as_ref())?;
        let info = device.swapchain_info(&swapchain);
        if let Some(old) = self.swapchain.replace(swapchain) {
            device.destroy_swapchain(old);
        }
        for slot in self.frames.drain(..) {
            if let Some(semaphore) = slot.render_complete {
                device.destroy_semaphore(semaphore);
            }
        }
        self.frames = (0..info.image_count).map(|_| FrameSlot::default()).collect();
        self.needs_recreate = false;
        self.generation += 1;

        info!(
            "Swapchain created: {}x{}, {} images, {:?}",
            info.extent.width, info.extent.height, info.image_count, info.present_mode
        );
        Ok(true)
    }

    pub fn present_frame(
        &mut self,
        tracker: &mut SubmissionTracker<P>,
        queue: P::Queue,
        content: &FrameContent<'_, P::BlitSource>,
    ) -> GalResult<FrameStatus> {
        if (self.swapchain.is_none() || self.needs_recreate) && !self.recreate(tracker)? {
            return Ok(FrameStatus::Skipped);
        }
        let Some(swapchain) = self.swapchain.as_ref() else {
            return Ok(FrameStatus::Skipped);
        };

        let device = tracker.device_mut();
        let acquire = device.create_semaphore()?;
        let index = match device.acquire_next_image(swapchain, acquire) {
            Ok(AcquireOutcome::Acquired { index, suboptimal }) => {
                if suboptimal {
                    self.needs_recreate = true;
                }
                index
            }
            Ok(AcquireOutcome::OutOfDate) => {
                device.destroy_semaphore(acquire);
                warn!("Swapchain out of date on acquire, recreating");
                self.needs_recreate = true;
                return Ok(FrameStatus::Skipped);
            }
            Err(e) => {
                device.destroy_semaphore(acquire);
                return Err(e);
            }
        };
        let Some(slot) = self.frames.get_mut(index as usize) else {
            device.destroy_semaphore(acquire);
            return Err(GalError::InvalidState("acquired swapchain image index out of range"));
        };

        let command_buffer = match prepare_frame(tracker, slot, swapchain, index, content) {
            Ok(command_buffer) => command_buffer,
            Err(e) => {
                warn!("Frame for swapchain image {} failed: {}", index, e);
                tracker.device_mut().destroy_semaphore(acquire);
                self.needs_recreate = true;
                return Err(e);
            }
        };

        // On failure the tracker has already destroyed `acquire`.
        let call = match tracker.execute_with(queue, vec![acquire]) {
            Ok(call) => call,
            Err(e) => {
                tracker.abort_record(command_buffer);
                self.needs_recreate = true;
                return Err(e);
            }
        };
        let render_complete = tracker.query_signal();
        slot.last_call = Some(call);
        slot.render_complete = render_complete;

        let waits: Vec<P::Semaphore> = render_complete.into_iter().collect();
        let presented = tracker.device_mut().present(queue, swapchain, index, &waits);
        if presented.is_err() {
            self.needs_recreate = true;
        }
        match presented? {
            PresentOutcome::Optimal if !self.needs_recreate => {
                Ok(FrameStatus::Presented { index, call })
            }
            outcome => {
                warn!("Swapchain {:?} on present, recreating", outcome);
                self.needs_recreate = true;
                Ok(FrameStatus::Stale { index, call })
            }
        }
    }

    /// Wait for the device and destroy the swapchain and its semaphores.
    pub fn shutdown(&mut self, tracker: &mut SubmissionTracker<P>) -> GalResult<()> {
        tracker.device_mut().wait_idle()?;
        tracker.free_unused_memory()?;
        let device = tracker.device_mut();
        for slot in self.frames.drain(..) {
            if let Some(semaphore) = slot.render_complete {
                device.destroy_semaphore(semaphore);
            }
        }
        if let Some(swapchain) = self.swapchain.take() {
            device.destroy_swapchain(swapchain);
            info!("Swapchain destroyed");
        }
        Ok(())
    }
}

/// Wait out the previous use of an acquired image and record its frame.
/// On error nothing new is left in the tracker's current call.
fn prepare_frame<P: PresentDevice>(
    tracker: &mut SubmissionTracker<P>,
    slot: &mut FrameSlot<P::Semaphore>,
    swapchain: &P::Swapchain,
    index: u32,
    content: &FrameContent<'_, P::BlitSource>,
) -> GalResult<P::CommandBuffer> {
    // The image is ours again; the work that last rendered into it must be
    // finished before its semaphore can go.
    if let Some(call) = slot.last_call {
        tracker.wait_for(call)?;
        slot.last_call = None;
    }
    if let Some(semaphore) = slot.render_complete.take() {
        tracker.device_mut().destroy_semaphore(semaphore);
    }

    let command_buffer = tracker.begin_record()?;
    let recorded = tracker
        .device_mut()
        .record_frame(command_buffer, swapchain, index, content)
        .and_then(|()| tracker.end_record(command_buffer));
    if let Err(e) = recorded {
        tracker.abort_record(command_buffer);
        return Err(e);
    }
    Ok(command_buffer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::software::{SoftwareDevice, SoftwareQueue, SurfaceEvent};

    fn request(width: u32, height: u32) -> SwapchainRequest {
        SwapchainRequest {
            extent: Extent2D::new(width, height),
            vsync: true,
            present_mode: PresentModePreference::Auto,
        }
    }

    fn clear(color: [f32; 4]) -> FrameContent<'static, crate::backend::software::SoftwareBlitSource> {
        FrameContent {
            clear_color: color,
            source: None,
            transform: FrameTransform::default(),
        }
    }

    fn setup(width: u32, height: u32) -> (SubmissionTracker<SoftwareDevice>, SwapchainManager<SoftwareDevice>) {
        let mut device = SoftwareDevice::new();
        device.resize_surface(Extent2D::new(width, height));
        (SubmissionTracker::new(device), SwapchainManager::new(request(width, height)))
    }

    #[test]
    fn test_choose_present_mode() {
        let all = [PresentMode::Immediate, PresentMode::Mailbox, PresentMode::Fifo];
        assert_eq!(choose_present_mode(&all, PresentModePreference::Auto, true), PresentMode::Fifo);
        assert_eq!(choose_present_mode(&all, PresentModePreference::Auto, false), PresentMode::Mailbox);
        assert_eq!(
            choose_present_mode(&[PresentMode::Immediate, PresentMode::Fifo], PresentModePreference::Auto, false),
            PresentMode::Immediate
        );
        assert_eq!(
            choose_present_mode(&[PresentMode::Fifo], PresentModePreference::Mailbox, false),
            PresentMode::Fifo
        );
    }

    #[test]
    fn test_choose_image_count_and_extent() {
        let mut caps = SurfaceCaps {
            current_extent: None,
            min_extent: Extent2D::new(1, 1),
            max_extent: Extent2D::new(1920, 1080),
            min_image_count: 2,
            max_image_count: 0,
        };
        assert_eq!(choose_image_count(&caps), 3);
        caps.max_image_count = 2;
        assert_eq!(choose_image_count(&caps), 2);

        assert_eq!(choose_extent(&caps, Extent2D::new(4000, 600)), Extent2D::new(1920, 600));
        caps.current_extent = Some(Extent2D::new(800, 600));
        assert_eq!(choose_extent(&caps, Extent2D::new(4000, 600)), Extent2D::new(800, 600));
    }

    #[test]
    fn test_source_corners() {
        let plain = FrameTransform::default();
        assert_eq!(plain.source_corners(64, 32), [(0, 0), (64, 32)]);

        let flipped = FrameTransform {
            flip_y: true,
            crop: CropRect {
                left: 8,
                top: 0,
                right: 40,
                bottom: 0,
            },
            ..Default::default()
        };
        assert_eq!(flipped.source_corners(64, 32), [(8, 32), (40, 0)]);
    }

    #[test]
    fn test_first_present_creates_swapchain() {
        let (mut tracker, mut manager) = setup(4, 4);
        assert!(!manager.has_swapchain());

        let status = manager
            .present_frame(&mut tracker, SoftwareQueue, &clear([1.0, 0.0, 0.0, 1.0]))
            .unwrap();
        assert!(matches!(status, FrameStatus::Presented { index: 0, call: 1 }));
        assert!(manager.has_swapchain());
        assert_eq!(manager.generation(), 1);

        let pixels = tracker.device().presented_pixels().unwrap();
        assert_eq!(&pixels[..4], &[255, 0, 0, 255]);
    }

    #[test]
    fn test_present_waits_on_frame_signal() {
        let (mut tracker, mut manager) = setup(4, 4);
        manager.present_frame(&mut tracker, SoftwareQueue, &clear(CLEAR_COLOR)).unwrap();

        let device = tracker.device();
        let submission = device.submissions().last().unwrap();
        // The frame waits on the acquire semaphore and signals render-complete.
        assert_eq!(submission.waits.len(), 1);
        assert_eq!(submission.waits[0], device.last_acquire_semaphore().unwrap());
        assert_eq!(device.presents().last().unwrap().waits, vec![submission.signal]);
    }

    #[test]
    fn test_frames_chain_and_reuse_waits() {
        let (mut tracker, mut manager) = setup(4, 4);
        let image_count = 3;
        let mut calls = Vec::new();
        for _ in 0..image_count + 1 {
            match manager.present_frame(&mut tracker, SoftwareQueue, &clear(CLEAR_COLOR)).unwrap() {
                FrameStatus::Presented { call, .. } => calls.push(call),
                other => panic!("unexpected {other:?}"),
            }
        }
        // Reacquiring image 0 waited for the first frame's call.
        assert!(tracker.is_retired(calls[0]));
        assert!(!tracker.is_retired(calls[image_count]));
        // The second frame does not wait on the first one's signal: it was
        // handed to present instead.
        let submissions = tracker.device().submissions();
        assert_eq!(submissions[1].waits.len(), 1);
    }

    #[test]
    fn test_stale_present_triggers_recreate() {
        let (mut tracker, mut manager) = setup(4, 4);
        manager.present_frame(&mut tracker, SoftwareQueue, &clear(CLEAR_COLOR)).unwrap();

        tracker.device_mut().resize_surface(Extent2D::new(8, 8));
        manager.resize(Extent2D::new(8, 8));
        tracker.device_mut().invalidate_surface();
        let status = manager.present_frame(&mut tracker, SoftwareQueue, &clear(CLEAR_COLOR)).unwrap();
        assert!(matches!(status, FrameStatus::Presented { .. }));
        assert_eq!(manager.generation(), 2);
        assert_eq!(manager.info(tracker.device()).unwrap().extent, Extent2D::new(8, 8));

        // The old swapchain was handed to the new one and destroyed after.
        let events = tracker.device().surface_events();
        assert_eq!(
            events,
            &[
                SurfaceEvent::Created { id: 1, previous: None },
                SurfaceEvent::Created { id: 2, previous: Some(1) },
                SurfaceEvent::Destroyed { id: 1 },
            ]
        );
    }

    #[test]
    fn test_out_of_date_acquire_skips_frame() {
        let (mut tracker, mut manager) = setup(4, 4);
        manager.present_frame(&mut tracker, SoftwareQueue, &clear(CLEAR_COLOR)).unwrap();
        tracker.device_mut().invalidate_surface();

        let status = manager.present_frame(&mut tracker, SoftwareQueue, &clear(CLEAR_COLOR)).unwrap();
        assert_eq!(status, FrameStatus::Skipped);
        assert!(manager.needs_recreate());

        let status = manager.present_frame(&mut tracker, SoftwareQueue, &clear(CLEAR_COLOR)).unwrap();
        assert!(matches!(status, FrameStatus::Presented { .. }));
        assert_eq!(manager.generation(), 2);
    }

    #[test]
    fn test_zero_area_postpones_recreate() {
        let (mut tracker, mut manager) = setup(4, 4);
        manager.present_frame(&mut tracker, SoftwareQueue, &clear(CLEAR_COLOR)).unwrap();

        manager.resize(Extent2D::new(0, 0));
        let status = manager.present_frame(&mut tracker, SoftwareQueue, &clear(CLEAR_COLOR)).unwrap();
        assert_eq!(status, FrameStatus::Skipped);
        assert_eq!(manager.generation(), 1);
        assert!(manager.has_swapchain());

        tracker.device_mut().resize_surface(Extent2D::new(2, 2));
        manager.resize(Extent2D::new(2, 2));
        manager.present_frame(&mut tracker, SoftwareQueue, &clear(CLEAR_COLOR)).unwrap();
        assert_eq!(manager.generation(), 2);
    }

    #[test]
    fn test_failed_record_releases_frame() {
        let (mut tracker, mut manager) = setup(4, 4);
        manager.present_frame(&mut tracker, SoftwareQueue, &clear(CLEAR_COLOR)).unwrap();
        let semaphores = tracker.device().live_semaphores();

        tracker.device_mut().fail_next_record();
        assert!(manager
            .present_frame(&mut tracker, SoftwareQueue, &clear(CLEAR_COLOR))
            .is_err());
        assert!(manager.needs_recreate());
        assert_eq!(tracker.pending_commands(), 0);
        // The acquire semaphore of the failed frame is gone again.
        assert_eq!(tracker.device().live_semaphores(), semaphores);

        let status = manager.present_frame(&mut tracker, SoftwareQueue, &clear(CLEAR_COLOR)).unwrap();
        assert!(matches!(status, FrameStatus::Presented { .. }));
        assert_eq!(tracker.device().submissions().last().unwrap().command_buffers.len(), 1);

        manager.shutdown(&mut tracker).unwrap();
        tracker.shutdown().unwrap();
        assert_eq!(tracker.device().live_semaphores(), 0);
        assert_eq!(tracker.device().live_command_buffers(), 0);
        assert_eq!(tracker.device().double_destroys(), 0);
    }

    #[test]
    fn test_shutdown_releases_everything() {
        let (mut tracker, mut manager) = setup(4, 4);
        for _ in 0..5 {
            manager.present_frame(&mut tracker, SoftwareQueue, &clear(CLEAR_COLOR)).unwrap();
        }
        manager.shutdown(&mut tracker).unwrap();
        tracker.shutdown().unwrap();

        let device = tracker.device();
        assert!(!manager.has_swapchain());
        assert_eq!(device.live_semaphores(), 0);
        assert_eq!(device.live_fences(), 0);
        assert_eq!(device.double_destroys(), 0);
    }
}
