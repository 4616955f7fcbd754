// SPDX-FileCopyrightText: 2025 gal contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Hook for the external ASTC block decoder.

use crate::error::{GalError, GalResult};
use crate::format::{astc_block_size, Shape};

/// Decodes ASTC blocks to tightly packed RGBA8 texels.
pub trait AstcDecoder: Send {
    #[allow(clippy::too_many_arguments)]
    fn decode(
        &self,
        data: &[u8],
        block_width: u32,
        block_height: u32,
        block_depth: u32,
        width: u32,
        height: u32,
        depth: u32,
    ) -> Result<Vec<u8>, String>;
}

impl<F> AstcDecoder for F
where
    F: Fn(&[u8], u32, u32, u32, u32, u32, u32) -> Result<Vec<u8>, String> + Send,
{
    fn decode(
        &self,
        data: &[u8],
        block_width: u32,
        block_height: u32,
        block_depth: u32,
        width: u32,
        height: u32,
        depth: u32,
    ) -> Result<Vec<u8>, String> {
        self(data, block_width, block_height, block_depth, width, height, depth)
    }
}

/// Decode a 2D ASTC image, checking the decoder returned a full RGBA8 image.
pub fn decode_2d(
    decoder: &dyn AstcDecoder,
    shape: Shape,
    data: &[u8],
    width: u32,
    height: u32,
) -> GalResult<Vec<u8>> {
    let (bw, bh) = astc_block_size(shape);
    let decoded = decoder
        .decode(data, bw, bh, 1, width, height, 1)
        .map_err(GalError::Decode)?;
    let expected = width as usize * height as usize * 4;
    if decoded.len() < expected {
        return Err(GalError::Decode(format!(
            "decoder returned {} bytes for a {}x{} image, expected {}",
            decoded.len(),
            width,
            height,
            expected
        )));
    }
    Ok(decoded)
}
