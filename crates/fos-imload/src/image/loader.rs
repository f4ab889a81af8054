//! Decoder registry
//!
//! Decoders register as [`LoaderProvider`]s. An image buffers its first
//! bytes until one provider recognizes the signature, then streams every
//! byte through the [`ImageLoader`] that provider creates.

use super::{FrameInfo, Image};
use crate::context::ImageContext;
use crate::{Color, ImageError};

/// Answer of a provider looking at the start of a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sniff {
    Match,
    NoMatch,
    /// The prefix is too short to tell
    NeedMore,
}

/// Creates decoders for one family of formats
pub trait LoaderProvider {
    fn name(&self) -> &'static str;
    fn sniff(&self, prefix: &[u8]) -> Sniff;
    fn create(&self) -> Box<dyn ImageLoader>;
}

/// A streaming decoder feeding one image
pub trait ImageLoader {
    fn process_data(&mut self, sink: &mut ImageSink<'_>, data: &[u8]) -> Result<(), ImageError>;
    fn process_eof(&mut self, sink: &mut ImageSink<'_>) -> Result<(), ImageError>;
}

/// Decoder-facing view of an image
pub struct ImageSink<'a> {
    image: &'a mut Image,
    ctx: &'a mut ImageContext,
}

impl<'a> ImageSink<'a> {
    pub fn new(image: &'a mut Image, ctx: &'a mut ImageContext) -> Self {
        Self { image, ctx }
    }

    pub fn notify_image_info(&mut self, width: u32, height: u32) -> Result<(), ImageError> {
        self.image.notify_image_info(width, height)
    }

    pub fn notify_background(&mut self, color: Color) {
        self.image.notify_background(color);
    }

    pub fn notify_append_frame(&mut self, info: FrameInfo) -> Result<(), ImageError> {
        self.image.notify_append_frame(self.ctx, info)
    }

    pub fn notify_scanline(&mut self, version: u8, row: &[u8]) -> Result<(), ImageError> {
        self.image.notify_scanline(self.ctx, version, row)
    }

    pub fn notify_finished(&mut self) -> Result<(), ImageError> {
        self.image.notify_finished(self.ctx)
    }

    pub fn request_scanline(&mut self, line: u32, buf: &mut [u8]) {
        self.image.request_scanline(self.ctx, line, buf);
    }

    pub fn notify_error(&mut self, message: impl Into<String>) {
        self.image.notify_error(self.ctx, message);
    }

    pub fn frame_count(&self) -> usize {
        self.image.frame_count()
    }
}

/// Outcome of matching a prefix against every provider
pub enum Detection<'a> {
    Found(&'a dyn LoaderProvider),
    NeedMore,
    Unrecognized,
}

/// Ordered set of decoder providers
#[derive(Default)]
pub struct LoaderRegistry {
    providers: Vec<Box<dyn LoaderProvider>>,
}

impl std::fmt::Debug for LoaderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<_> = self.providers.iter().map(|p| p.name()).collect();
        f.debug_struct("LoaderRegistry").field("providers", &names).finish()
    }
}

impl LoaderRegistry {
    /// Registry with no providers
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the `image`-crate backed provider
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(super::StillImageProvider));
        registry
    }

    /// Add a provider; earlier providers win ties
    pub fn register(&mut self, provider: Box<dyn LoaderProvider>) {
        self.providers.push(provider);
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// First provider that matches `prefix`
    pub fn detect(&self, prefix: &[u8]) -> Detection<'_> {
        let mut undecided = false;
        for provider in &self.providers {
            match provider.sniff(prefix) {
                Sniff::Match => return Detection::Found(provider.as_ref()),
                Sniff::NeedMore => undecided = true,
                Sniff::NoMatch => {}
            }
        }

        if undecided { Detection::NeedMore } else { Detection::Unrecognized }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Magic(&'static [u8]);

    struct Nop;

    impl ImageLoader for Nop {
        fn process_data(&mut self, _: &mut ImageSink<'_>, _: &[u8]) -> Result<(), ImageError> {
            Ok(())
        }
        fn process_eof(&mut self, _: &mut ImageSink<'_>) -> Result<(), ImageError> {
            Ok(())
        }
    }

    impl LoaderProvider for Magic {
        fn name(&self) -> &'static str {
            "magic"
        }
        fn sniff(&self, prefix: &[u8]) -> Sniff {
            if prefix.len() < self.0.len() {
                if self.0.starts_with(prefix) { Sniff::NeedMore } else { Sniff::NoMatch }
            } else if prefix.starts_with(self.0) {
                Sniff::Match
            } else {
                Sniff::NoMatch
            }
        }
        fn create(&self) -> Box<dyn ImageLoader> {
            Box::new(Nop)
        }
    }

    #[test]
    fn test_detect() {
        let mut registry = LoaderRegistry::new();
        registry.register(Box::new(Magic(b"ABCD")));

        assert!(matches!(registry.detect(b"AB"), Detection::NeedMore));
        assert!(matches!(registry.detect(b"ABCDxyz"), Detection::Found(p) if p.name() == "magic"));
        assert!(matches!(registry.detect(b"XY"), Detection::Unrecognized));
    }

    #[test]
    fn test_empty_registry_recognizes_nothing() {
        let registry = LoaderRegistry::new();
        assert!(registry.is_empty());
        assert!(matches!(registry.detect(b"\x89PNG"), Detection::Unrecognized));
    }

    #[test]
    fn test_defaults_know_png() {
        let registry = LoaderRegistry::with_defaults();
        assert_eq!(registry.len(), 1);
        assert!(matches!(registry.detect(b"\x89PNG\r\n\x1a\n"), Detection::Found(_)));
        assert!(matches!(registry.detect(b"\x89PN"), Detection::NeedMore));
    }
}
