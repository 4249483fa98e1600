use bytes::Bytes;
use thiserror::Error;

/// Bytes per pixel of the interleaved RGB layout every frame uses.
pub const BYTES_PER_PIXEL: usize = 3;

#[derive(Debug, Error)]
#[error("frame buffer is {actual} bytes, expected {expected} for {width}x{height} rgb24")]
pub struct FrameSizeMismatch {
    width: u32,
    height: u32,
    expected: usize,
    actual: usize,
}

/// One decoded video image: tightly packed interleaved RGB with fixed
/// dimensions, immutable once produced. The pixel payload is shared by
/// reference, so cloning a frame is cheap.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawFrame {
    width: u32,
    height: u32,
    data: Bytes,
}

impl RawFrame {
    /// Wraps an already packed `width * height * 3` pixel buffer.
    pub fn from_packed(
        width: u32,
        height: u32,
        data: impl Into<Bytes>,
    ) -> Result<Self, FrameSizeMismatch> {
        let data = data.into();
        let expected = width as usize * height as usize * BYTES_PER_PIXEL;
        if data.len() != expected {
            return Err(FrameSizeMismatch {
                width,
                height,
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            width,
            height,
            data,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }
}
