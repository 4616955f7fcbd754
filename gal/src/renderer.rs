// SPDX-FileCopyrightText: 2025 gal contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Renderer context.
//!
//! Owns the backend and every manager, and is the single place where
//! "current program" and "current call" state lives. All methods run on the
//! render thread. Other threads reach it only through [`ResizeHandle`] and
//! [`ActionQueue`], both applied at the next frame boundary.

use std::sync::Arc;

use gal_common::{CacheKey, Extent2D};
use log::{debug, info, warn};
use parking_lot::Mutex;

use crate::astc::AstcDecoder;
use crate::backend::Backend;
use crate::buffer::BufferManager;
use crate::config::RendererConfig;
use crate::error::{GalError, GalResult};
use crate::format::{ImageDescriptor, Sampler, Swizzle};
use crate::image::ImageManager;
use crate::shader::{BufferBindings, ProgramCache, ShaderDecl, StageKey, StageKind};
use crate::swapchain::{
    FrameContent, FrameStatus, FrameTransform, SwapchainInfo, SwapchainManager, SwapchainRequest,
};
use crate::sync::{CallId, SyncDevice};

/// Records window resizes from the event thread. The render thread applies
/// the latest one at the next frame boundary.
#[derive(Debug, Clone, Default)]
pub struct ResizeHandle(Arc<Mutex<Option<Extent2D>>>);

impl ResizeHandle {
    pub fn request(&self, extent: Extent2D) {
        *self.0.lock() = Some(extent);
    }

    fn take(&self) -> Option<Extent2D> {
        self.0.lock().take()
    }
}

type Action<B> = Box<dyn FnOnce(&mut Renderer<B>) + Send>;

/// Work queued from other threads, run on the render thread by the next
/// [`Renderer::flush`] or [`Renderer::present`] in submission order.
pub struct ActionQueue<B: Backend>(Arc<Mutex<Vec<Action<B>>>>);

impl<B: Backend> Clone for ActionQueue<B> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<B: Backend> Default for ActionQueue<B> {
    fn default() -> Self {
        Self(Arc::new(Mutex::new(Vec::new())))
    }
}

impl<B: Backend> ActionQueue<B> {
    pub fn queue(&self, action: impl FnOnce(&mut Renderer<B>) + Send + 'static) {
        self.0.lock().push(Box::new(action));
    }

    pub fn len(&self) -> usize {
        self.0.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.lock().is_empty()
    }

    fn take(&self) -> Vec<Action<B>> {
        std::mem::take(&mut *self.0.lock())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RendererStats {
    pub images: usize,
    pub buffers: usize,
    pub stages: usize,
    pub programs: usize,
    pub reinterprets: u64,
    pub outstanding_calls: usize,
}

pub struct Renderer<B: Backend> {
    backend: B,
    images: ImageManager<B>,
    buffers: BufferManager<B>,
    programs: ProgramCache<B>,
    swapchain: Option<SwapchainManager<B::Device>>,
    resize: ResizeHandle,
    actions: ActionQueue<B>,
    transform: FrameTransform,
    config: RendererConfig,
    shut_down: bool,
}

impl<B: Backend + 'static> Renderer<B> {
    pub fn new(backend: B, config: RendererConfig) -> Self {
        info!("Renderer: {:?} backend", backend.backend_type());
        let images = ImageManager::new(
            &backend,
            config.cache_limits,
            config.transfer_buffer_initial_size,
        );
        let buffers = BufferManager::new(&backend, config.cache_limits);
        Self {
            backend,
            images,
            buffers,
            programs: ProgramCache::new(),
            swapchain: None,
            resize: ResizeHandle::default(),
            actions: ActionQueue::default(),
            transform: FrameTransform::default(),
            config,
            shut_down: false,
        }
    }
}

impl<B: Backend> Renderer<B> {
    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn config(&self) -> &RendererConfig {
        &self.config
    }

    pub fn set_astc_decoder(&mut self, decoder: Box<dyn AstcDecoder>) {
        self.images.set_astc_decoder(decoder);
    }

    /// Start presenting to the backend's surface. The swapchain itself is
    /// built on the first [`present`](Self::present).
    pub fn enable_presentation(&mut self) {
        if self.swapchain.is_none() {
            self.swapchain = Some(SwapchainManager::new(SwapchainRequest {
                extent: self.config.window,
                vsync: self.config.vsync,
                present_mode: self.config.present_mode,
            }));
        }
    }

    pub fn resize_handle(&self) -> ResizeHandle {
        self.resize.clone()
    }

    pub fn action_queue(&self) -> ActionQueue<B> {
        self.actions.clone()
    }

    /// Run every queued action. Actions queued while running wait for the
    /// next call.
    pub fn run_actions(&mut self) -> usize {
        let actions = self.actions.take();
        let count = actions.len();
        for action in actions {
            action(self);
        }
        if count > 0 {
            debug!("Ran {} queued actions", count);
        }
        count
    }

    pub fn set_frame_transform(&mut self, transform: FrameTransform) {
        self.transform = transform;
    }

    pub fn swapchain_info(&self) -> Option<SwapchainInfo> {
        let swapchain = self.swapchain.as_ref()?;
        swapchain.info(self.backend.tracker_ref().device())
    }

    // Images

    pub fn create_image(&mut self, key: CacheKey, data: &[u8], desc: ImageDescriptor) -> GalResult<()> {
        self.images.create(&mut self.backend, key, data, desc)
    }

    pub fn ensure_render_target(&mut self, key: CacheKey, desc: ImageDescriptor) -> GalResult<()> {
        self.images.ensure_render_target(&mut self.backend, key, desc)
    }

    pub fn reinterpret_image(&mut self, key: CacheKey, desc: ImageDescriptor) -> GalResult<()> {
        self.images.reinterpret(&mut self.backend, key, desc)
    }

    pub fn bind_texture(
        &mut self,
        key: CacheKey,
        slot: u32,
        swizzle: &Swizzle,
        sampler: &Sampler,
    ) -> GalResult<bool> {
        self.images.bind(&mut self.backend, key, slot, swizzle, sampler)
    }

    pub fn is_image_cached(&self, key: CacheKey) -> bool {
        self.images.is_cached(key)
    }

    pub fn try_get_cached_image(&self, key: CacheKey, expected_size: u64) -> Option<ImageDescriptor> {
        self.images.try_get_cached_image(key, expected_size)
    }

    pub fn image_size(&self, key: CacheKey) -> Option<u64> {
        self.images.cached_size(key)
    }

    // Shaders

    pub fn create_shader_stage(
        &mut self,
        kind: StageKind,
        key: CacheKey,
        source: String,
        texture_usage: Vec<ShaderDecl>,
        uniform_usage: Vec<ShaderDecl>,
    ) -> GalResult<StageKey> {
        self.programs
            .create_stage(kind, key, source, texture_usage, uniform_usage)
    }

    pub fn bind_shader(&mut self, stage: StageKey) -> bool {
        self.programs.bind(stage)
    }

    pub fn unbind_shader(&mut self, kind: StageKind) {
        self.programs.unbind(kind);
    }

    /// Link or reuse the program for the bound stages. Returns false if no
    /// program could become active because a mandatory stage is missing.
    pub fn bind_active_program(&mut self) -> GalResult<bool> {
        Ok(self
            .programs
            .bind_active_program(&mut self.backend)?
            .is_some())
    }

    pub fn current_program(&self) -> Option<&B::Program> {
        self.programs.current_program()
    }

    /// Assign sampler `name` of the active program to texture `unit`.
    /// Returns false if no program is active.
    pub fn ensure_texture_binding(&mut self, name: &str, unit: u32) -> GalResult<bool> {
        self.programs
            .ensure_texture_binding(&mut self.backend, name, unit)
    }

    pub fn texture_usage(&self, stage: StageKey) -> &[ShaderDecl] {
        self.programs.texture_usage(stage)
    }

    /// Bind the guest's const buffers to the active program's uniform slots.
    /// Returns how many were bound.
    pub fn bind_const_buffers(&mut self, bindings: &BufferBindings) -> GalResult<usize> {
        let mut bound = 0;
        for (slot, key) in self.programs.const_buffer_slots(bindings) {
            if self.buffers.bind_uniform(&mut self.backend, slot, key)? {
                bound += 1;
            }
        }
        Ok(bound)
    }

    // Uniform buffers

    pub fn create_uniform_buffer(&mut self, key: CacheKey, size: u64) -> GalResult<()> {
        self.buffers.create(&mut self.backend, key, size)
    }

    pub fn is_uniform_buffer_cached(&self, key: CacheKey, size: u64) -> bool {
        self.buffers.is_cached(key, size)
    }

    pub fn set_uniform_buffer_data(&mut self, key: CacheKey, size: u64, data: &[u8]) -> GalResult<()> {
        self.buffers.set_data(&mut self.backend, key, size, data)
    }

    /// Pin every cached image and buffer for a multi-step draw batch.
    pub fn lock_caches(&mut self) {
        self.images.lock_cache();
        self.buffers.lock_cache();
    }

    pub fn unlock_caches(&mut self) {
        self.images.unlock_cache();
        self.buffers.unlock_cache();
        self.backend.collect_garbage();
    }

    // Submission

    /// Submit recorded work, if any, and reclaim whatever has completed.
    pub fn flush(&mut self) -> GalResult<Option<CallId>> {
        self.run_actions();
        self.backend.collect_garbage();
        let queue = self.backend.queue();
        let tracker = self.backend.tracker();
        let call = if tracker.pending_commands() > 0 {
            Some(tracker.execute(queue)?)
        } else {
            None
        };
        tracker.free_unused_memory()?;

        let expired = self.images.expire_unused() + self.buffers.expire_unused();
        if expired > 0 {
            self.backend.collect_garbage();
        }
        Ok(call)
    }

    /// Present one frame, showing the image under `source` if it is cached
    /// and the clear color otherwise.
    pub fn present(&mut self, source: Option<CacheKey>) -> GalResult<FrameStatus> {
        self.run_actions();
        let Some(swapchain) = self.swapchain.as_mut() else {
            return Err(GalError::NotSupported("presentation is not enabled"));
        };
        if let Some(extent) = self.resize.take() {
            swapchain.resize(extent);
        }
        self.backend.collect_garbage();

        let blit = source
            .and_then(|key| self.images.image(key))
            .map(|image| self.backend.blit_source(image));
        let content = FrameContent {
            clear_color: self.config.clear_color,
            source: blit.as_ref(),
            transform: self.transform,
        };
        let queue = self.backend.queue();
        let status = swapchain.present_frame(self.backend.tracker(), queue, &content)?;
        self.backend.tracker().free_unused_memory()?;
        Ok(status)
    }

    pub fn stats(&self) -> RendererStats {
        RendererStats {
            images: self.images.len(),
            buffers: self.buffers.len(),
            stages: self.programs.stage_count(),
            programs: self.programs.program_count(),
            reinterprets: self.images.reinterpret_count(),
            outstanding_calls: self.backend.tracker_ref().outstanding(),
        }
    }

    /// Wait for the device to go idle and release every resource.
    pub fn shutdown(&mut self) -> GalResult<()> {
        if self.shut_down {
            return Ok(());
        }
        self.shut_down = true;
        self.backend.tracker().device_mut().wait_idle()?;

        if let Some(mut swapchain) = self.swapchain.take() {
            swapchain.shutdown(self.backend.tracker())?;
        }
        self.images.unlock_cache();
        self.buffers.unlock_cache();
        self.programs.release(&mut self.backend);
        self.images.release(&mut self.backend);
        self.buffers.release();
        self.backend.collect_garbage();
        self.backend.tracker().shutdown()?;
        debug!("Renderer resources released");
        info!("Renderer shut down");
        Ok(())
    }
}

impl<B: Backend> Drop for Renderer<B> {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!("Renderer shutdown failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::software::SoftwareBackend;
    use crate::format::{ImageFormat, NumericType, Shape};

    fn renderer(width: u32, height: u32) -> Renderer<SoftwareBackend> {
        let mut backend = SoftwareBackend::new();
        backend.device_mut().resize_surface(Extent2D::new(width, height));
        let config = RendererConfig {
            window: Extent2D::new(width, height),
            ..RendererConfig::default()
        };
        Renderer::new(backend, config)
    }

    fn rgba8(width: u32, height: u32) -> ImageDescriptor {
        ImageDescriptor::new(
            width,
            height,
            ImageFormat::new(Shape::R8G8B8A8, NumericType::Unorm).unwrap(),
        )
    }

    #[test]
    fn test_image_scenario() {
        let mut r = renderer(4, 4);
        r.create_image(0x1000, &[0; 16384], rgba8(64, 64)).unwrap();
        assert!(r.is_image_cached(0x1000));
        assert_eq!(r.try_get_cached_image(0x1000, 16384), Some(rgba8(64, 64)));

        r.ensure_render_target(0x1000, rgba8(128, 128)).unwrap();
        assert_eq!(r.image_size(0x1000), Some(65536));
        assert_eq!(r.stats().reinterprets, 1);
    }

    #[test]
    fn test_present_requires_enable() {
        let mut r = renderer(4, 4);
        assert!(r.present(None).unwrap_err().is_not_supported());
    }

    #[test]
    fn test_present_shows_source_image() {
        let mut r = renderer(2, 2);
        r.enable_presentation();
        let pixels: Vec<u8> = [[255, 0, 0, 255], [0, 255, 0, 255], [0, 0, 255, 255], [9, 9, 9, 255]]
            .concat();
        r.create_image(0x10, &pixels, rgba8(2, 2)).unwrap();

        let status = r.present(Some(0x10)).unwrap();
        assert!(matches!(status, FrameStatus::Presented { .. }));
        assert_eq!(r.backend().device().presented_pixels().unwrap(), &pixels[..]);

        // Unknown key: clear color only.
        r.present(Some(0x20)).unwrap();
        let shown = r.backend().device().presented_pixels().unwrap();
        assert_eq!(&shown[..4], &[99, 148, 237, 255]);
    }

    #[test]
    fn test_resize_applied_at_next_frame() {
        let mut r = renderer(4, 4);
        r.enable_presentation();
        r.present(None).unwrap();

        let handle = r.resize_handle();
        std::thread::spawn(move || handle.request(Extent2D::new(8, 6)))
            .join()
            .unwrap();
        assert_eq!(r.swapchain_info().unwrap().extent, Extent2D::new(4, 4));

        r.backend_mut().device_mut().resize_surface(Extent2D::new(8, 6));
        r.present(None).unwrap();
        assert_eq!(r.swapchain_info().unwrap().extent, Extent2D::new(8, 6));
    }

    #[test]
    fn test_const_buffers_follow_link_slots() {
        let mut r = renderer(4, 4);
        let vs = r
            .create_shader_stage(
                StageKind::Vertex,
                1,
                "uniform Globals {}; void main() {}".to_string(),
                Vec::new(),
                vec![ShaderDecl::new("Globals", 0)],
            )
            .unwrap();
        let fs = r
            .create_shader_stage(
                StageKind::Fragment,
                2,
                "uniform Params {}; void main() {}".to_string(),
                Vec::new(),
                vec![ShaderDecl::new("Params", 2)],
            )
            .unwrap();
        r.bind_shader(vs);
        r.bind_shader(fs);
        assert!(r.bind_active_program().unwrap());

        r.create_uniform_buffer(0xA0, 4).unwrap();
        r.set_uniform_buffer_data(0xA0, 4, &[1, 2, 3, 4]).unwrap();
        r.create_uniform_buffer(0xB0, 4).unwrap();
        r.set_uniform_buffer_data(0xB0, 4, &[5, 6, 7, 8]).unwrap();

        let mut bindings = BufferBindings::new();
        bindings.set(StageKind::Vertex, 0, Some(0xA0));
        bindings.set(StageKind::Fragment, 2, Some(0xB0));
        assert_eq!(r.bind_const_buffers(&bindings).unwrap(), 2);
        assert_eq!(r.backend().uniform_slot_data(0).unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(r.backend().uniform_slot_data(1).unwrap(), vec![5, 6, 7, 8]);
    }

    #[test]
    fn test_queued_actions_run_on_flush() {
        let mut r = renderer(4, 4);
        let actions = r.action_queue();
        std::thread::spawn(move || {
            actions.queue(|r| {
                r.set_frame_transform(FrameTransform {
                    flip_y: true,
                    ..Default::default()
                })
            });
            actions.queue(|r| r.create_uniform_buffer(0x30, 16).unwrap());
        })
        .join()
        .unwrap();

        assert_eq!(r.action_queue().len(), 2);
        assert!(!r.is_uniform_buffer_cached(0x30, 16));

        r.flush().unwrap();
        assert!(r.action_queue().is_empty());
        assert!(r.is_uniform_buffer_cached(0x30, 16));
        assert!(r.transform.flip_y);
    }

    #[test]
    fn test_ensure_texture_binding_needs_program() {
        let mut r = renderer(4, 4);
        assert!(!r.ensure_texture_binding("tex0", 1).unwrap());

        let vs = r
            .create_shader_stage(
                StageKind::Vertex,
                1,
                "void main() {}".to_string(),
                Vec::new(),
                Vec::new(),
            )
            .unwrap();
        let fs = r
            .create_shader_stage(
                StageKind::Fragment,
                2,
                "uniform sampler2D tex0; void main() {}".to_string(),
                vec![ShaderDecl::new("tex0", 0)],
                Vec::new(),
            )
            .unwrap();
        r.bind_shader(vs);
        r.bind_shader(fs);
        assert!(r.bind_active_program().unwrap());
        assert!(r.ensure_texture_binding("tex0", 1).unwrap());

        let program = *r.current_program().unwrap();
        assert_eq!(r.backend().texture_unit(program, "tex0"), Some(1));
    }

    #[test]
    fn test_flush_without_work_submits_nothing() {
        let mut r = renderer(4, 4);
        assert_eq!(r.flush().unwrap(), None);
        assert!(r.backend().device().submissions().is_empty());
    }

    #[test]
    fn test_shutdown_releases_everything() {
        let mut r = renderer(4, 4);
        r.enable_presentation();
        r.create_image(1, &[0; 64], rgba8(4, 4)).unwrap();
        r.create_uniform_buffer(2, 16).unwrap();
        for _ in 0..4 {
            r.present(Some(1)).unwrap();
        }
        r.shutdown().unwrap();

        let backend = r.backend();
        assert_eq!(backend.destroyed_images(), 1);
        assert_eq!(backend.destroyed_buffers(), 1);
        assert_eq!(backend.device().live_semaphores(), 0);
        assert_eq!(backend.device().live_fences(), 0);
        assert_eq!(backend.device().live_command_buffers(), 0);
        assert_eq!(backend.device().double_destroys(), 0);
        // A second shutdown (e.g. from drop) is a no-op.
        r.shutdown().unwrap();
    }
}
