//! Camera frames and their content fingerprint.

use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Instant;

use crate::error::{CadenceError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    Rgba8888,
    Rgb888,
    /// Y plane followed by interleaved VU at half vertical resolution.
    Nv21,
}

impl PixelFormat {
    /// Bytes per pixel in the primary plane.
    const fn plane_bpp(self) -> usize {
        match self {
            Self::Rgba8888 => 4,
            Self::Rgb888 => 3,
            Self::Nv21 => 1,
        }
    }
}

/// One captured image. Pixel data is shared, so cloning is cheap.
#[derive(Clone)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    /// Bytes per row, including any padding past the visible pixels.
    pub stride: usize,
    pub format: PixelFormat,
    pub data: Arc<[u8]>,
    pub captured_at: Instant,
}

impl Frame {
    pub fn new(
        width: u32,
        height: u32,
        stride: usize,
        format: PixelFormat,
        data: impl Into<Arc<[u8]>>,
    ) -> Result<Self> {
        let frame = Self {
            width,
            height,
            stride,
            format,
            data: data.into(),
            captured_at: Instant::now(),
        };
        frame.check_layout()?;
        Ok(frame)
    }

    /// Tightly packed frame: the stride is the widest row (`width * bpp`,
    /// or the even-rounded width for NV21).
    pub fn packed(width: u32, height: u32, format: PixelFormat, data: impl Into<Arc<[u8]>>) -> Result<Self> {
        let stride = match format {
            PixelFormat::Nv21 => (width as usize).div_ceil(2).saturating_mul(2),
            _ => (width as usize).saturating_mul(format.plane_bpp()),
        };
        Self::new(width, height, stride, format, data)
    }

    fn row_bytes(&self) -> usize {
        self.width as usize * self.format.plane_bpp()
    }

    /// NV21 chroma rows hold one VU pair per two pixels, rounded up for
    /// odd widths.
    fn chroma_row_bytes(&self) -> usize {
        (self.width as usize).div_ceil(2) * 2
    }

    fn row_len(&self, row: usize) -> usize {
        match self.format {
            PixelFormat::Nv21 if row >= self.height as usize => self.chroma_row_bytes(),
            _ => self.row_bytes(),
        }
    }

    fn row_count(&self) -> usize {
        let h = self.height as usize;
        match self.format {
            PixelFormat::Nv21 => h + h.div_ceil(2),
            _ => h,
        }
    }

    fn check_layout(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(CadenceError::InvalidFrame("zero-sized frame".into()));
        }
        let widest = (self.width as usize)
            .checked_mul(self.format.plane_bpp())
            .map(|row| match self.format {
                PixelFormat::Nv21 => self.chroma_row_bytes(),
                _ => row,
            })
            .ok_or_else(|| CadenceError::InvalidFrame(format!("width {} is too large", self.width)))?;
        if self.stride < widest {
            return Err(CadenceError::InvalidFrame(format!(
                "stride {} shorter than a row of {widest} bytes",
                self.stride
            )));
        }
        let last = self.row_count() - 1;
        let needed = last
            .checked_mul(self.stride)
            .and_then(|offset| offset.checked_add(self.row_len(last)))
            .ok_or_else(|| {
                CadenceError::InvalidFrame(format!(
                    "{}x{} frame with stride {} does not fit in memory",
                    self.width, self.height, self.stride
                ))
            })?;
        if self.data.len() < needed {
            return Err(CadenceError::InvalidFrame(format!(
                "{} bytes supplied, {needed} needed",
                self.data.len()
            )));
        }
        Ok(())
    }

    /// Visible bytes of each row, row padding excluded.
    pub fn rows(&self) -> impl Iterator<Item = &[u8]> + '_ {
        (0..self.row_count()).map(move |r| {
            let start = r * self.stride;
            &self.data[start..start + self.row_len(r)]
        })
    }

    pub fn fingerprint(&self) -> FrameFingerprint {
        FrameFingerprint::of(self)
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("stride", &self.stride)
            .field("format", &self.format)
            .field("bytes", &self.data.len())
            .finish()
    }
}

/// 64-bit non-cryptographic hash of a frame's visible pixels.
///
/// Only used to detect an unchanged camera view; collisions just mean a
/// stale cached answer for one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameFingerprint(pub u64);

impl FrameFingerprint {
    pub fn of(frame: &Frame) -> Self {
        let mut hasher = DefaultHasher::new();
        frame.width.hash(&mut hasher);
        frame.height.hash(&mut hasher);
        frame.format.hash(&mut hasher);
        for row in frame.rows() {
            hasher.write(row);
        }
        Self(hasher.finish())
    }
}

impl fmt::Display for FrameFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rgb(width: u32, height: u32, fill: u8) -> Frame {
        Frame::packed(width, height, PixelFormat::Rgb888, vec![fill; (width * height * 3) as usize]).unwrap()
    }

    #[test]
    fn identical_frames_share_a_fingerprint() {
        assert_eq!(rgb(4, 4, 7).fingerprint(), rgb(4, 4, 7).fingerprint());
    }

    #[test]
    fn single_byte_change_alters_fingerprint() {
        let a = rgb(4, 4, 7);
        let mut bytes = a.data.to_vec();
        bytes[20] ^= 1;
        let b = Frame::packed(4, 4, PixelFormat::Rgb888, bytes).unwrap();
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn row_padding_is_ignored() {
        // 2x2 RGBA with 4 bytes of padding per row.
        let mut padded = Vec::new();
        for row in 0..2u8 {
            padded.extend_from_slice(&[row; 8]);
            padded.extend_from_slice(&[0xAA; 4]);
        }
        let a = Frame::new(2, 2, 12, PixelFormat::Rgba8888, padded.clone()).unwrap();
        for b in padded.iter_mut().skip(8).take(4) {
            *b = 0x55;
        }
        let b = Frame::new(2, 2, 12, PixelFormat::Rgba8888, padded).unwrap();
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn nv21_includes_chroma_plane() {
        let y_and_vu = vec![1u8; 4 * 4 + 4 * 2];
        let frame = Frame::packed(4, 4, PixelFormat::Nv21, y_and_vu).unwrap();
        assert_eq!(frame.rows().count(), 6);
    }

    #[test]
    fn odd_width_nv21_chroma_rows_are_rounded_up() {
        // 3x2: two luma rows of 3 bytes, one VU row of 4, stride 4.
        let bytes: Vec<u8> = (0..12).collect();
        let frame = Frame::packed(3, 2, PixelFormat::Nv21, bytes).unwrap();
        assert_eq!(frame.stride, 4);
        let rows: Vec<&[u8]> = frame.rows().collect();
        assert_eq!(rows, vec![&[0u8, 1, 2][..], &[4, 5, 6][..], &[8, 9, 10, 11][..]]);

        // A stride that only fits the luma row is too short for the VU pairs.
        let err = Frame::new(3, 2, 3, PixelFormat::Nv21, vec![0u8; 12]).unwrap_err();
        assert!(matches!(err, CadenceError::InvalidFrame(_)));
    }

    #[test]
    fn oversized_dimensions_are_rejected_without_overflow() {
        let err = Frame::new(u32::MAX, u32::MAX, usize::MAX, PixelFormat::Rgba8888, vec![0u8; 16]).unwrap_err();
        assert!(matches!(err, CadenceError::InvalidFrame(_)));

        let err = Frame::new(4, u32::MAX, usize::MAX / 2, PixelFormat::Nv21, vec![0u8; 16]).unwrap_err();
        assert!(matches!(err, CadenceError::InvalidFrame(_)));
    }

    #[test]
    fn short_buffer_is_rejected() {
        let err = Frame::packed(4, 4, PixelFormat::Rgba8888, vec![0u8; 10]).unwrap_err();
        assert!(matches!(err, CadenceError::InvalidFrame(_)));
    }
}
