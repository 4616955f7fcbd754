// SPDX-FileCopyrightText: 2025 gal contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Uniform (constant) buffer storage.

use gal_common::CacheKey;
use log::{debug, trace};

use crate::backend::BufferBackend;
use crate::cache::{CacheLimits, ResourceCache};
use crate::error::{GalError, GalResult};

pub struct BufferManager<B: BufferBackend> {
    cache: ResourceCache<B::Buffer>,
}

impl<B: BufferBackend + 'static> BufferManager<B> {
    pub fn new(backend: &B, limits: CacheLimits) -> Self {
        Self {
            cache: ResourceCache::new("buffer cache", limits, backend.buffer_disposer()),
        }
    }
}

impl<B: BufferBackend> BufferManager<B> {
    pub fn create(&mut self, backend: &mut B, key: CacheKey, size: u64) -> GalResult<()> {
        let buffer = backend.create_uniform_buffer(size)?;
        debug!("Uniform buffer 0x{:X}: {} bytes", key, size);
        self.cache.add_or_update(key, buffer, size);
        Ok(())
    }

    /// True if `key` is cached with exactly `size` bytes.
    pub fn is_cached(&self, key: CacheKey, size: u64) -> bool {
        self.cache.try_get_size(key) == Some(size)
    }

    /// Copy the first `size` bytes of `data` into the buffer under `key`.
    pub fn set_data(
        &mut self,
        backend: &mut B,
        key: CacheKey,
        size: u64,
        data: &[u8],
    ) -> GalResult<()> {
        let capacity = self
            .cache
            .try_get_size(key)
            .ok_or(GalError::NotCached { key })?;
        if size > capacity {
            return Err(GalError::SizeExceeded {
                key,
                requested: size,
                capacity,
            });
        }
        if size > data.len() as u64 {
            return Err(GalError::SizeExceeded {
                key,
                requested: size,
                capacity: data.len() as u64,
            });
        }
        let buffer = self
            .cache
            .try_get_value_mut(key)
            .ok_or(GalError::NotCached { key })?;
        trace!("Uniform buffer 0x{:X}: writing {} bytes", key, size);
        backend.write_buffer(buffer, &data[..size as usize])
    }

    /// Bind the buffer under `key` to uniform `slot`. Returns false if the
    /// key is not cached.
    pub fn bind_uniform(&mut self, backend: &mut B, slot: u32, key: CacheKey) -> GalResult<bool> {
        if !self.cache.touch(key) {
            return Ok(false);
        }
        match self.cache.try_get_value(key) {
            Some(buffer) => {
                backend.bind_uniform_buffer(slot, buffer)?;
                Ok(true)
            }
            None => Ok(false),
        }
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

    pub fn release(&mut self) {
        self.cache.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::software::SoftwareBackend;

    fn setup() -> (SoftwareBackend, BufferManager<SoftwareBackend>) {
        let backend = SoftwareBackend::new();
        let buffers = BufferManager::new(&backend, CacheLimits::default());
        (backend, buffers)
    }

    #[test]
    fn test_is_cached_matches_size() {
        let (mut backend, mut buffers) = setup();
        buffers.create(&mut backend, 0x80, 256).unwrap();
        assert!(buffers.is_cached(0x80, 256));
        assert!(!buffers.is_cached(0x80, 128));
        assert!(!buffers.is_cached(0x90, 256));
    }

    #[test]
    fn test_set_data_writes_prefix() {
        let (mut backend, mut buffers) = setup();
        buffers.create(&mut backend, 1, 8).unwrap();
        buffers.set_data(&mut backend, 1, 4, &[1, 2, 3, 4, 5, 6]).unwrap();

        assert!(buffers.bind_uniform(&mut backend, 0, 1).unwrap());
        assert_eq!(backend.uniform_slot_data(0).unwrap(), &[1, 2, 3, 4, 0, 0, 0, 0]);
    }

    #[test]
    fn test_set_data_bounds() {
        let (mut backend, mut buffers) = setup();
        assert!(matches!(
            buffers.set_data(&mut backend, 1, 4, &[0; 4]),
            Err(GalError::NotCached { key: 1 })
        ));

        buffers.create(&mut backend, 1, 16).unwrap();
        assert!(matches!(
            buffers.set_data(&mut backend, 1, 32, &[0; 32]),
            Err(GalError::SizeExceeded { requested: 32, capacity: 16, .. })
        ));
        assert!(matches!(
            buffers.set_data(&mut backend, 1, 16, &[0; 8]),
            Err(GalError::SizeExceeded { requested: 16, capacity: 8, .. })
        ));
    }

    #[test]
    fn test_recreate_disposes_old_buffer() {
        let (mut backend, mut buffers) = setup();
        buffers.create(&mut backend, 1, 16).unwrap();
        buffers.create(&mut backend, 1, 32).unwrap();
        assert_eq!(backend.destroyed_buffers(), 1);
        assert!(buffers.is_cached(1, 32));
    }
}
