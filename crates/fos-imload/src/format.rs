//! Pixel formats
//!
//! Decoded tiles store rows in the frame's declared format. Render tiles
//! always hold premultiplied RGBA, which is what tiny-skia surfaces expect.

use crate::Color;

/// Declared pixel format of a frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PixelFormat {
    /// 32-bit RGB, the fourth byte is ignored
    Rgb32,
    /// 32-bit RGBA, stored premultiplied
    Rgba32,
    /// 8-bit indices into a palette; entry alpha expresses transparency
    Palette(Vec<Color>),
}

impl PixelFormat {
    /// Bytes per pixel
    pub fn depth(&self) -> usize {
        match self {
            PixelFormat::Rgb32 | PixelFormat::Rgba32 => 4,
            PixelFormat::Palette(_) => 1,
        }
    }

    pub fn has_alpha(&self) -> bool {
        match self {
            PixelFormat::Rgb32 => false,
            PixelFormat::Rgba32 => true,
            PixelFormat::Palette(palette) => palette.iter().any(|c| c.a != 255),
        }
    }

    /// Copy one decoder row segment into tile storage
    pub fn store_row(&self, src: &[u8], dst: &mut [u8]) {
        match self {
            PixelFormat::Rgba32 => {
                for (s, d) in src.chunks_exact(4).zip(dst.chunks_exact_mut(4)) {
                    let a = s[3];
                    d[0] = premultiply(s[0], a);
                    d[1] = premultiply(s[1], a);
                    d[2] = premultiply(s[2], a);
                    d[3] = a;
                }
            }
            _ => dst.copy_from_slice(src),
        }
    }

    /// Convert stored pixels to premultiplied RGBA
    pub fn render_row(&self, src: &[u8], dst: &mut [u8]) {
        match self {
            PixelFormat::Rgb32 => {
                for (s, d) in src.chunks_exact(4).zip(dst.chunks_exact_mut(4)) {
                    d[..3].copy_from_slice(&s[..3]);
                    d[3] = 255;
                }
            }
            PixelFormat::Rgba32 => dst.copy_from_slice(src),
            PixelFormat::Palette(palette) => {
                for (&index, d) in src.iter().zip(dst.chunks_exact_mut(4)) {
                    let color = palette.get(index as usize).copied().unwrap_or(Color::TRANSPARENT);
                    d.copy_from_slice(&color.premultiplied());
                }
            }
        }
    }
}

/// Scale a colour channel by alpha, rounding to nearest
#[inline]
pub fn premultiply(c: u8, a: u8) -> u8 {
    ((c as u16 * a as u16 + 127) / 255) as u8
}
