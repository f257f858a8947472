use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::buffer::{Pixels, VideoBuf};

/// Pixel formats we support
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    Yuyv,
    Grey,
    Rgb24,
    Bgr24,
    Rgb565,
    Nv12,
    Mjpeg,
}

impl PixelFormat {
    /// Bytes in one row of the first plane
    pub fn stride(self, width: u32) -> usize {
        let w = width as usize;
        match self {
            PixelFormat::Grey | PixelFormat::Nv12 => w,
            PixelFormat::Yuyv | PixelFormat::Rgb565 | PixelFormat::Mjpeg => w * 2,
            PixelFormat::Rgb24 | PixelFormat::Bgr24 => w * 3,
        }
    }

    /// Bytes needed to hold one full frame.
    ///
    /// For MJPEG this is an upper bound; actual frames are smaller.
    pub fn frame_size(self, width: u32, height: u32) -> usize {
        let h = height as usize;
        match self {
            PixelFormat::Nv12 => self.stride(width) * h * 3 / 2,
            _ => self.stride(width) * h,
        }
    }

    pub fn is_compressed(self) -> bool {
        matches!(self, PixelFormat::Mjpeg)
    }
}

/// Format, resolution and rate of the images exchanged on one side of the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ImageSpec {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub fps: f32,
}

impl ImageSpec {
    pub fn frame_size(&self) -> usize {
        self.format.frame_size(self.width, self.height)
    }
}

/// Zero-copy view of one pool slot.
///
/// The pixel memory is the slot's mapping itself; it is never reallocated or
/// replaced, only read or written in place.
#[derive(Debug)]
pub struct RawImage {
    pub spec: ImageSpec,
    buf: Arc<VideoBuf>,
}

impl RawImage {
    pub fn new(buf: Arc<VideoBuf>, spec: ImageSpec) -> Self {
        Self { spec, buf }
    }

    pub fn width(&self) -> u32 {
        self.spec.width
    }

    pub fn height(&self) -> u32 {
        self.spec.height
    }

    pub fn format(&self) -> PixelFormat {
        self.spec.format
    }

    pub fn stride(&self) -> usize {
        self.spec.format.stride(self.spec.width)
    }

    /// Slot index in the owning device's pool
    pub fn index(&self) -> usize {
        self.buf.index()
    }

    pub fn buf(&self) -> &Arc<VideoBuf> {
        &self.buf
    }

    pub fn bytes_used(&self) -> usize {
        self.buf.bytes_used()
    }

    pub fn set_bytes_used(&self, n: usize) {
        self.buf.set_bytes_used(n);
    }

    /// Pixel data of the full frame
    pub fn pixels(&self) -> Pixels<'_> {
        self.buf.pixels(self.spec.frame_size())
    }

    /// Writable pixel data; same memory as [`RawImage::pixels`]
    pub fn pixels_mut(&self) -> Pixels<'_> {
        self.pixels()
    }

    /// Check that the slot holds a complete frame of `self.spec`
    pub fn is_complete(&self) -> bool {
        let used = self.bytes_used();
        if self.spec.format.is_compressed() {
            used > 0 && used <= self.spec.frame_size()
        } else {
            used == self.spec.frame_size()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_sizes() {
        assert_eq!(PixelFormat::Yuyv.frame_size(320, 240), 320 * 240 * 2);
        assert_eq!(PixelFormat::Grey.frame_size(320, 240), 320 * 240);
        assert_eq!(PixelFormat::Rgb24.stride(640), 1920);
        assert_eq!(PixelFormat::Nv12.frame_size(4, 4), 24);
    }

    #[test]
    fn completeness_depends_on_format() {
        let spec = ImageSpec {
            width: 4,
            height: 2,
            format: PixelFormat::Grey,
            fps: 30.0,
        };
        let img = RawImage::new(Arc::new(VideoBuf::new(0, spec.frame_size()).unwrap()), spec);
        assert!(!img.is_complete());
        img.set_bytes_used(8);
        assert!(img.is_complete());

        let mjpeg = ImageSpec {
            format: PixelFormat::Mjpeg,
            ..spec
        };
        let img = RawImage::new(Arc::new(VideoBuf::new(1, mjpeg.frame_size()).unwrap()), mjpeg);
        img.set_bytes_used(5);
        assert!(img.is_complete());
    }
}
