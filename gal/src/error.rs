// SPDX-FileCopyrightText: 2025 gal contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Error type shared by every manager and backend.

use std::fmt;

use ash::vk;
use gal_common::CacheKey;
use thiserror::Error;

use crate::format::{ImageFormat, NumericType, Shape};
use crate::shader::StageKind;

/// Raw result code returned by a host graphics API call.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct HostCode(pub i32);

impl From<vk::Result> for HostCode {
    fn from(result: vk::Result) -> Self {
        Self(result.as_raw())
    }
}

impl fmt::Debug for HostCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HostCode({:?})", vk::Result::from_raw(self.0))
    }
}

impl fmt::Display for HostCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} ({})", vk::Result::from_raw(self.0), self.0)
    }
}

#[derive(Debug, Error)]
pub enum GalError {
    #[error("No cached resource for key 0x{key:X}")]
    NotCached { key: CacheKey },
    #[error("Write of {requested} bytes exceeds the {capacity} bytes available for key 0x{key:X}")]
    SizeExceeded {
        key: CacheKey,
        requested: u64,
        capacity: u64,
    },
    #[error("Invalid image format: {shape:?} cannot be {ty:?}")]
    InvalidFormat { shape: Shape, ty: NumericType },
    #[error("Image format {0:?} is not supported by the host device")]
    FormatUnsupported(ImageFormat),
    #[error("Invalid state: {0}")]
    InvalidState(&'static str),
    #[error("{call} failed: {code}")]
    Host { call: &'static str, code: HostCode },
    #[error("{stage:?} shader compilation failed: {log}")]
    Compile { stage: StageKind, log: String },
    #[error("Program link failed: {log}")]
    Link { log: String },
    #[error("Texture decode failed: {0}")]
    Decode(String),
    #[error("Not supported: {0}")]
    NotSupported(&'static str),
    #[error("Presentation surface lost")]
    SurfaceLost,
}

impl GalError {
    /// Wrap a failed host call.
    pub fn host(call: &'static str, code: impl Into<HostCode>) -> Self {
        Self::Host {
            call,
            code: code.into(),
        }
    }

    /// True for the "feature absent" signal, which callers may treat as a
    /// missing capability rather than a failure.
    pub fn is_not_supported(&self) -> bool {
        matches!(self, Self::NotSupported(_))
    }
}

pub type GalResult<T> = Result<T, GalError>;
