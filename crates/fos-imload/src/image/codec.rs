//! Codec bridge to the `image` crate
//!
//! Buffers the encoded stream and decodes it at end of data, then pushes
//! the pixels through the sink as one pass. GIFs are pushed frame by frame
//! with their delays so they animate. The `image` crate hands back every
//! GIF frame already composited onto the full canvas, so each one clears
//! the backing store to transparent before the next lands.

use std::io::Cursor;

use ::image::{AnimationDecoder, ImageDecoder, ImageFormat};

use super::loader::{ImageLoader, ImageSink, LoaderProvider, Sniff};
use super::FrameInfo;
use crate::animation::Disposal;
use crate::format::PixelFormat;
use crate::{Color, ImageError};

const PNG: &[u8] = b"\x89PNG\r\n\x1a\n";
const JPEG: &[u8] = b"\xFF\xD8\xFF";
const GIF87: &[u8] = b"GIF87a";
const GIF89: &[u8] = b"GIF89a";

/// Still and animated raster formats decoded by the `image` crate
#[derive(Debug, Clone, Copy, Default)]
pub struct StillImageProvider;

fn sniff_signature(prefix: &[u8], signature: &[u8]) -> Sniff {
    let n = prefix.len().min(signature.len());
    if prefix[..n] != signature[..n] {
        Sniff::NoMatch
    } else if n < signature.len() {
        Sniff::NeedMore
    } else {
        Sniff::Match
    }
}

fn sniff_webp(prefix: &[u8]) -> Sniff {
    match sniff_signature(prefix, b"RIFF") {
        Sniff::Match if prefix.len() >= 12 => {
            if &prefix[8..12] == b"WEBP" { Sniff::Match } else { Sniff::NoMatch }
        }
        Sniff::Match => Sniff::NeedMore,
        other => other,
    }
}

impl LoaderProvider for StillImageProvider {
    fn name(&self) -> &'static str {
        "image"
    }

    fn sniff(&self, prefix: &[u8]) -> Sniff {
        let answers = [
            sniff_signature(prefix, PNG),
            sniff_signature(prefix, JPEG),
            sniff_signature(prefix, GIF87),
            sniff_signature(prefix, GIF89),
            sniff_webp(prefix),
        ];

        if answers.contains(&Sniff::Match) {
            Sniff::Match
        } else if answers.contains(&Sniff::NeedMore) {
            Sniff::NeedMore
        } else {
            Sniff::NoMatch
        }
    }

    fn create(&self) -> Box<dyn ImageLoader> {
        Box::new(BufferedLoader::default())
    }
}

fn decode_error(err: ::image::ImageError) -> ImageError {
    ImageError::Decode(err.to_string())
}

#[derive(Debug, Default)]
struct BufferedLoader {
    data: Vec<u8>,
}

impl BufferedLoader {
    fn decode_still(&self, sink: &mut ImageSink<'_>, format: ImageFormat) -> Result<(), ImageError> {
        let decoded = ::image::load_from_memory_with_format(&self.data, format).map_err(decode_error)?;
        let pixel_format = if decoded.color().has_alpha() { PixelFormat::Rgba32 } else { PixelFormat::Rgb32 };
        let rgba = decoded.to_rgba8();
        let (width, height) = rgba.dimensions();

        sink.notify_image_info(width, height)?;
        sink.notify_append_frame(FrameInfo::new(width, height, pixel_format))?;
        for row in rgba.as_raw().chunks_exact(width as usize * 4) {
            sink.notify_scanline(1, row)?;
        }
        sink.notify_finished()
    }

    fn decode_gif(&self, sink: &mut ImageSink<'_>) -> Result<(), ImageError> {
        let decoder = ::image::codecs::gif::GifDecoder::new(Cursor::new(&self.data)).map_err(decode_error)?;
        let (width, height) = decoder.dimensions();
        let frames = decoder.into_frames().collect_frames().map_err(decode_error)?;

        sink.notify_image_info(width, height)?;
        sink.notify_background(Color::TRANSPARENT);
        for frame in frames {
            let (numer, denom) = frame.delay().numer_denom_ms();
            let delay_ms = if denom == 0 { 0 } else { numer / denom };
            let (left, top) = (frame.left(), frame.top());
            let buffer = frame.into_buffer();
            let (frame_width, frame_height) = buffer.dimensions();

            let info = FrameInfo::new(frame_width, frame_height, PixelFormat::Rgba32)
                .with_offset(left, top)
                .with_delay(delay_ms)
                .with_disposal(Disposal::RestoreBackground);
            sink.notify_append_frame(info)?;
            for row in buffer.as_raw().chunks_exact(frame_width as usize * 4) {
                sink.notify_scanline(1, row)?;
            }
            sink.notify_finished()?;
        }

        tracing::debug!("GIF {}x{} decoded into {} frames", width, height, sink.frame_count());
        Ok(())
    }
}

impl ImageLoader for BufferedLoader {
    fn process_data(&mut self, _sink: &mut ImageSink<'_>, data: &[u8]) -> Result<(), ImageError> {
        self.data.extend_from_slice(data);
        Ok(())
    }

    fn process_eof(&mut self, sink: &mut ImageSink<'_>) -> Result<(), ImageError> {
        let format = ::image::guess_format(&self.data).map_err(decode_error)?;
        match format {
            ImageFormat::Gif => self.decode_gif(sink),
            _ => self.decode_still(sink, format),
        }
    }
}
