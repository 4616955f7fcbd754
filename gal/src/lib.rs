// SPDX-FileCopyrightText: 2025 gal contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Host graphics abstraction layer for emulated GPUs.
//!
//! Guest resources (images, uniform buffers, shader stages) are cached on
//! the host under guest-chosen keys, recorded work is batched into fenced
//! submissions, and finished frames are presented through a swapchain.
//! Two backends exist: Vulkan, and a software backend that simulates the
//! host for tests and GPU-less machines.

pub mod astc;
pub mod backend;
pub mod buffer;
pub mod cache;
pub mod config;
pub mod error;
pub mod format;
pub mod image;
pub mod renderer;
pub mod shader;
pub mod swapchain;
pub mod sync;

pub use backend::software::SoftwareBackend;
pub use backend::vulkan::VulkanBackend;
pub use backend::{Backend, BackendType, ImageUsage};
pub use config::RendererConfig;
pub use error::{GalError, GalResult};
pub use format::{ImageDescriptor, ImageFormat, NumericType, Sampler, Shape, Swizzle, TextureSource};
pub use renderer::{ActionQueue, Renderer, RendererStats, ResizeHandle};
pub use shader::{ShaderDecl, StageKind};
pub use swapchain::{FrameStatus, FrameTransform};
