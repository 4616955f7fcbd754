// SPDX-FileCopyrightText: 2025 gal contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Image lifecycle: creation, render-target reuse and reinterpretation.
//!
//! The descriptor stored for an entry is the one the host image was really
//! created with. ASTC images the host cannot sample are decoded to RGBA8 and
//! stored under that format, and channel orders the host cannot express are
//! swapped and stored under the corrected shape. Every later lookup compares
//! against the stored descriptor.

use std::borrow::Cow;

use gal_common::CacheKey;
use log::{debug, trace};

use crate::astc::{self, AstcDecoder};
use crate::backend::{ImageBackend, ImageUsage};
use crate::cache::{CacheLimits, ResourceCache};
use crate::error::{GalError, GalResult};
use crate::format::{swap_channels, Compression, ImageDescriptor, Sampler, Swizzle};

/// A host image together with the descriptor it was created with.
pub struct CachedImage<I> {
    pub handle: I,
    pub descriptor: ImageDescriptor,
    pub usage: ImageUsage,
}

struct TransferBuffer<T> {
    buffer: T,
    size: u64,
}

pub struct ImageManager<B: ImageBackend> {
    cache: ResourceCache<CachedImage<B::Image>>,
    transfer: Option<TransferBuffer<B::TransferBuffer>>,
    transfer_initial_size: u64,
    decoder: Option<Box<dyn AstcDecoder>>,
    reinterpret_count: u64,
}

impl<B: ImageBackend + 'static> ImageManager<B> {
    pub fn new(backend: &B, limits: CacheLimits, transfer_initial_size: u64) -> Self {
        let mut dispose = backend.image_disposer();
        Self {
            cache: ResourceCache::new(
                "image cache",
                limits,
                Box::new(move |image: CachedImage<B::Image>| dispose(image.handle)),
            ),
            transfer: None,
            transfer_initial_size,
            decoder: None,
            reinterpret_count: 0,
        }
    }
}

impl<B: ImageBackend> ImageManager<B> {
    pub fn set_astc_decoder(&mut self, decoder: Box<dyn AstcDecoder>) {
        self.decoder = Some(decoder);
    }

    /// Create an image under `key` and upload `data` into it, replacing any
    /// previous entry.
    pub fn create(
        &mut self,
        backend: &mut B,
        key: CacheKey,
        data: &[u8],
        desc: ImageDescriptor,
    ) -> GalResult<()> {
        let (stored, bytes) = self.materialize(backend, data, desc)?;
        let usage = ImageUsage::SAMPLED | ImageUsage::TRANSFER;
        let handle = backend.create_image(&stored, usage)?;

        debug!(
            "Image 0x{:X}: {}x{} {:?} ({} bytes)",
            key,
            stored.width,
            stored.height,
            stored.format,
            stored.byte_size()
        );
        self.cache.add_or_update(
            key,
            CachedImage {
                handle,
                descriptor: stored,
                usage,
            },
            stored.byte_size(),
        );
        let image = self
            .cache
            .try_get_value_mut(key)
            .ok_or(GalError::NotCached { key })?;
        backend.upload_image(&mut image.handle, &bytes)
    }

    /// Make sure `key` holds a render target compatible with `desc`,
    /// reinterpreting the existing image if it is not.
    pub fn ensure_render_target(
        &mut self,
        backend: &mut B,
        key: CacheKey,
        desc: ImageDescriptor,
    ) -> GalResult<()> {
        let desc = host_descriptor(desc)?;
        let stored = self
            .cache
            .try_get_value(key)
            .map(|image| (image.descriptor, image.usage));
        match stored {
            Some((stored, usage))
                if stored.cache_equals(&desc) && usage.contains(ImageUsage::RENDER_TARGET) =>
            {
                Ok(())
            }
            // Also taken by sample-only images, which must become attachable.
            Some((_, usage)) => {
                self.reinterpret_with(backend, key, desc, usage | ImageUsage::RENDER_TARGET)
            }
            None => {
                if !backend.supports_format(desc.format) {
                    return Err(GalError::FormatUnsupported(desc.format));
                }
                let usage = ImageUsage::RENDER_TARGET | ImageUsage::SAMPLED | ImageUsage::TRANSFER;
                let handle = backend.create_image(&desc, usage)?;
                debug!(
                    "Render target 0x{:X}: {}x{} {:?}",
                    key, desc.width, desc.height, desc.format
                );
                self.cache.add_or_update(
                    key,
                    CachedImage {
                        handle,
                        descriptor: desc,
                        usage,
                    },
                    desc.byte_size(),
                );
                Ok(())
            }
        }
    }

    /// Reallocate the image under `key` for `desc`, carrying its raw bytes
    /// over unchanged.
    pub fn reinterpret(
        &mut self,
        backend: &mut B,
        key: CacheKey,
        desc: ImageDescriptor,
    ) -> GalResult<()> {
        let usage = self
            .cache
            .try_get_value(key)
            .map(|image| image.usage)
            .ok_or(GalError::NotCached { key })?;
        self.reinterpret_with(backend, key, desc, usage)
    }

    fn reinterpret_with(
        &mut self,
        backend: &mut B,
        key: CacheKey,
        desc: ImageDescriptor,
        usage: ImageUsage,
    ) -> GalResult<()> {
        let desc = host_descriptor(desc)?;
        if !backend.supports_format(desc.format) {
            return Err(GalError::FormatUnsupported(desc.format));
        }
        let image = self
            .cache
            .try_get_value_mut(key)
            .ok_or(GalError::NotCached { key })?;

        let old_size = image.descriptor.byte_size();
        let new_size = desc.byte_size();
        let transfer_size = old_size.max(new_size);

        let transfer = ensure_transfer(
            &mut self.transfer,
            backend,
            transfer_size.max(self.transfer_initial_size),
        )?;
        // Bytes past the old image would otherwise carry an earlier copy.
        if new_size > old_size {
            backend.clear_transfer_buffer(&mut transfer.buffer, old_size, new_size - old_size)?;
        }
        backend.copy_image_to_buffer(&mut image.handle, &mut transfer.buffer)?;

        let mut handle = backend.create_image(&desc, usage)?;
        backend.copy_buffer_to_image(&transfer.buffer, &mut handle)?;

        debug!(
            "Reinterpret 0x{:X}: {:?} -> {}x{} {:?} ({} -> {} bytes)",
            key, image.descriptor.format, desc.width, desc.height, desc.format, old_size, new_size
        );
        self.cache.replace_value(
            key,
            CachedImage {
                handle,
                descriptor: desc,
                usage,
            },
        )?;
        self.cache.resize(key, new_size)?;
        self.reinterpret_count += 1;
        Ok(())
    }

    /// Bind the image under `key` to texture `slot`. Returns false if the
    /// key is not cached.
    pub fn bind(
        &mut self,
        backend: &mut B,
        key: CacheKey,
        slot: u32,
        swizzle: &Swizzle,
        sampler: &Sampler,
    ) -> GalResult<bool> {
        if !self.cache.touch(key) {
            trace!("Bind of uncached image 0x{:X} ignored", key);
            return Ok(false);
        }
        let image = self
            .cache
            .try_get_value_mut(key)
            .ok_or(GalError::NotCached { key })?;
        backend.bind_texture(slot, &mut image.handle, swizzle, sampler)?;
        Ok(true)
    }

    pub fn is_cached(&self, key: CacheKey) -> bool {
        self.cache.contains(key)
    }

    /// Stored descriptor of `key`, if its declared size is `expected_size`.
    pub fn try_get_cached_image(&self, key: CacheKey, expected_size: u64) -> Option<ImageDescriptor> {
        match self.cache.try_get_size(key) {
            Some(size) if size == expected_size => self.descriptor(key),
            _ => None,
        }
    }

    pub fn descriptor(&self, key: CacheKey) -> Option<ImageDescriptor> {
        self.cache.try_get_value(key).map(|image| image.descriptor)
    }

    pub fn cached_size(&self, key: CacheKey) -> Option<u64> {
        self.cache.try_get_size(key)
    }

    pub fn image(&self, key: CacheKey) -> Option<&B::Image> {
        self.cache.try_get_value(key).map(|image| &image.handle)
    }

    pub fn lock_cache(&mut self) {
        self.cache.lock();
    }

    pub fn unlock_cache(&mut self) {
        self.cache.unlock();
    }

    pub fn expire_unused(&mut self) -> usize {
        self.cache.expire_unused(std::time::Instant::now())
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    pub fn reinterpret_count(&self) -> u64 {
        self.reinterpret_count
    }

    pub fn transfer_buffer_size(&self) -> u64 {
        self.transfer.as_ref().map_or(0, |t| t.size)
    }

    /// Dispose every image and the shared transfer buffer.
    pub fn release(&mut self, backend: &mut B) {
        self.cache.clear();
        if let Some(transfer) = self.transfer.take() {
            backend.destroy_transfer_buffer(transfer.buffer);
        }
    }

    /// Work out the descriptor and bytes the host image is created from.
    fn materialize<'a>(
        &self,
        backend: &B,
        data: &'a [u8],
        desc: ImageDescriptor,
    ) -> GalResult<(ImageDescriptor, Cow<'a, [u8]>)> {
        let format = desc.format;
        if format.shape().compression() == Compression::Astc && !backend.supports_format(format) {
            let decoder = self
                .decoder
                .as_deref()
                .ok_or(GalError::NotSupported("ASTC images without a block decoder"))?;
            let decoded = astc::decode_2d(decoder, format.shape(), data, desc.width, desc.height)?;
            trace!("Decoded {}x{} {:?} on the CPU", desc.width, desc.height, format);
            let stored = desc.with_format(crate::format::ImageFormat::RGBA8_UNORM);
            return Ok((stored, Cow::Owned(decoded)));
        }
        if let Some(host_format) = format.host_swapped() {
            let swapped = swap_channels(format.shape(), data);
            return Ok((desc.with_format(host_format), Cow::Owned(swapped)));
        }
        if !backend.supports_format(format) {
            return Err(GalError::FormatUnsupported(format));
        }
        Ok((desc, Cow::Borrowed(data)))
    }
}

/// Map a guest descriptor to the one a host render target would use.
fn host_descriptor(desc: ImageDescriptor) -> GalResult<ImageDescriptor> {
    if desc.format.shape().compression() == Compression::Astc {
        return Err(GalError::NotSupported("ASTC render targets"));
    }
    Ok(match desc.format.host_swapped() {
        Some(format) => desc.with_format(format),
        None => desc,
    })
}

/// Grow the shared transfer buffer to at least `size` bytes. It never shrinks.
fn ensure_transfer<'t, B: ImageBackend>(
    slot: &'t mut Option<TransferBuffer<B::TransferBuffer>>,
    backend: &mut B,
    size: u64,
) -> GalResult<&'t mut TransferBuffer<B::TransferBuffer>> {
    if slot.as_ref().map_or(true, |t| t.size < size) {
        if let Some(old) = slot.take() {
            backend.destroy_transfer_buffer(old.buffer);
        }
        debug!("Transfer buffer grown to {} bytes", size);
        let buffer = backend.create_transfer_buffer(size)?;
        *slot = Some(TransferBuffer { buffer, size });
    }
    slot.as_mut()
        .ok_or(GalError::InvalidState("transfer buffer missing after allocation"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::software::SoftwareBackend;
    use crate::format::{ImageFormat, NumericType, Shape, TextureSource};

    fn rgba8(width: u32, height: u32) -> ImageDescriptor {
        ImageDescriptor::new(
            width,
            height,
            ImageFormat::new(Shape::R8G8B8A8, NumericType::Unorm).unwrap(),
        )
    }

    fn setup() -> (SoftwareBackend, ImageManager<SoftwareBackend>) {
        let backend = SoftwareBackend::new();
        let images = ImageManager::new(&backend, CacheLimits::default(), 0);
        (backend, images)
    }

    #[test]
    fn test_create_and_lookup() {
        let (mut backend, mut images) = setup();
        images.create(&mut backend, 0x1000, &[0; 16384], rgba8(64, 64)).unwrap();

        assert!(images.is_cached(0x1000));
        assert_eq!(images.try_get_cached_image(0x1000, 16384), Some(rgba8(64, 64)));
        assert_eq!(images.try_get_cached_image(0x1000, 4096), None);
        assert_eq!(images.try_get_cached_image(0x2000, 16384), None);
    }

    #[test]
    fn test_ensure_render_target_reinterprets_once() {
        let (mut backend, mut images) = setup();
        images.create(&mut backend, 0x1000, &[0; 16384], rgba8(64, 64)).unwrap();

        images.ensure_render_target(&mut backend, 0x1000, rgba8(128, 128)).unwrap();
        assert_eq!(images.reinterpret_count(), 1);
        assert_eq!(images.cached_size(0x1000), Some(65536));

        // Already compatible: nothing to do.
        images.ensure_render_target(&mut backend, 0x1000, rgba8(128, 128)).unwrap();
        assert_eq!(images.reinterpret_count(), 1);
        assert_eq!(images.transfer_buffer_size(), 65536);
        assert_eq!(backend.destroyed_images(), 1);
    }

    #[test]
    fn test_ensure_render_target_adds_render_target_usage() {
        let (mut backend, mut images) = setup();
        images.create(&mut backend, 0x1000, &[0; 16384], rgba8(64, 64)).unwrap();
        assert!(!images.image(0x1000).unwrap().usage().contains(ImageUsage::RENDER_TARGET));

        images.ensure_render_target(&mut backend, 0x1000, rgba8(128, 128)).unwrap();
        let usage = images.image(0x1000).unwrap().usage();
        assert!(usage.contains(ImageUsage::RENDER_TARGET));
        assert!(usage.contains(ImageUsage::SAMPLED));

        // Same descriptor but created for sampling only: still upgraded.
        images.create(&mut backend, 0x2000, &[0; 64], rgba8(4, 4)).unwrap();
        images.ensure_render_target(&mut backend, 0x2000, rgba8(4, 4)).unwrap();
        assert!(images.image(0x2000).unwrap().usage().contains(ImageUsage::RENDER_TARGET));
    }

    #[test]
    fn test_reinterpret_keeps_usage() {
        let (mut backend, mut images) = setup();
        images.create(&mut backend, 1, &[0; 64], rgba8(4, 4)).unwrap();
        images.reinterpret(&mut backend, 1, rgba8(8, 8)).unwrap();
        assert_eq!(
            images.image(1).unwrap().usage(),
            ImageUsage::SAMPLED | ImageUsage::TRANSFER
        );
    }

    #[test]
    fn test_reinterpret_growth_is_zero_filled() {
        let (mut backend, mut images) = setup();
        // Leave non-zero bytes in the shared transfer buffer.
        images.create(&mut backend, 1, &[0xEE; 256], rgba8(8, 8)).unwrap();
        images.reinterpret(&mut backend, 1, rgba8(8, 4)).unwrap();

        images.create(&mut backend, 2, &[0x11; 64], rgba8(4, 4)).unwrap();
        images.reinterpret(&mut backend, 2, rgba8(8, 8)).unwrap();

        let data = images.image(2).unwrap().data();
        assert_eq!(&data[..64], &[0x11; 64][..]);
        assert!(data[64..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_ensure_render_target_creates_fresh() {
        let (mut backend, mut images) = setup();
        images.ensure_render_target(&mut backend, 0x40, rgba8(32, 32)).unwrap();
        assert_eq!(images.cached_size(0x40), Some(4096));
        assert_eq!(images.reinterpret_count(), 0);
        let image = images.image(0x40).unwrap();
        assert!(image.usage().contains(ImageUsage::RENDER_TARGET));
    }

    #[test]
    fn test_reinterpret_round_trip() {
        let (mut backend, mut images) = setup();
        let pattern: Vec<u8> = (0..64 * 64 * 4).map(|i| (i * 7 % 251) as u8).collect();
        let a = rgba8(64, 64);
        let b = ImageDescriptor::new(
            128,
            64,
            ImageFormat::new(Shape::R16, NumericType::Uint).unwrap(),
        );
        assert_eq!(a.byte_size(), b.byte_size());

        images.create(&mut backend, 1, &pattern, a).unwrap();
        images.reinterpret(&mut backend, 1, b).unwrap();
        images.reinterpret(&mut backend, 1, a).unwrap();

        assert_eq!(images.image(1).unwrap().data(), &pattern[..]);
        assert_eq!(images.descriptor(1), Some(a));
    }

    #[test]
    fn test_reinterpret_missing_key() {
        let (mut backend, mut images) = setup();
        assert!(matches!(
            images.reinterpret(&mut backend, 5, rgba8(4, 4)),
            Err(GalError::NotCached { key: 5 })
        ));
    }

    #[test]
    fn test_astc_requires_decoder() {
        let (mut backend, mut images) = setup();
        let astc = ImageDescriptor::new(
            8,
            8,
            ImageFormat::new(Shape::Astc4x4, NumericType::Unorm).unwrap(),
        );
        assert!(matches!(
            images.create(&mut backend, 1, &[0; 64], astc),
            Err(GalError::NotSupported(_))
        ));

        images.set_astc_decoder(Box::new(
            |_: &[u8], _: u32, _: u32, _: u32, w: u32, h: u32, _: u32| -> Result<Vec<u8>, String> {
                Ok(vec![0xAB; (w * h * 4) as usize])
            },
        ));
        images.create(&mut backend, 1, &[0; 64], astc).unwrap();

        // Stored under the decoded format from now on.
        let stored = images.descriptor(1).unwrap();
        assert_eq!(stored.format, ImageFormat::RGBA8_UNORM);
        assert_eq!(images.try_get_cached_image(1, 256), Some(stored));
        assert_eq!(images.image(1).unwrap().data(), &[0xAB; 256][..]);
    }

    #[test]
    fn test_reversed_channels_are_swapped() {
        let (mut backend, mut images) = setup();
        let desc = ImageDescriptor::new(
            1,
            1,
            ImageFormat::new(Shape::R4G4B4A4Reversed, NumericType::Unorm).unwrap(),
        );
        images.create(&mut backend, 1, &[0x34, 0x12], desc).unwrap();

        assert_eq!(images.descriptor(1).unwrap().format.shape(), Shape::R4G4B4A4);
        assert_eq!(images.image(1).unwrap().data(), &[0x21, 0x43]);
    }

    #[test]
    fn test_bind_applies_swizzle() {
        let (mut backend, mut images) = setup();
        images.create(&mut backend, 9, &[0; 64], rgba8(4, 4)).unwrap();
        let swizzle = Swizzle::new(
            TextureSource::Alpha,
            TextureSource::Blue,
            TextureSource::Green,
            TextureSource::Red,
        );

        assert!(images.bind(&mut backend, 9, 3, &swizzle, &Sampler::default()).unwrap());
        assert!(!images.bind(&mut backend, 10, 3, &swizzle, &Sampler::default()).unwrap());
        let bound = backend.bound_texture(3).unwrap();
        assert_eq!(bound.swizzle, swizzle);
        // Binding never changes cache membership.
        assert_eq!(images.len(), 1);
    }

    #[test]
    fn test_lock_keeps_replaced_images_alive() {
        let (mut backend, mut images) = setup();
        images.create(&mut backend, 1, &[0; 64], rgba8(4, 4)).unwrap();
        images.lock_cache();
        images.create(&mut backend, 1, &[1; 64], rgba8(4, 4)).unwrap();
        assert_eq!(backend.destroyed_images(), 0);
        images.unlock_cache();
        assert_eq!(backend.destroyed_images(), 1);
    }
}
