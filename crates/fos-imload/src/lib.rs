//! fOS Image Loader
//!
//! Tiled, memory-bounded image cache and progressive loading pipeline.
//!
//! Images are never materialized as one decoded buffer. Each frame is split
//! into 64x64 tiles that live in two bounded LRU caches (decoded pixels and
//! render-ready surfaces); evicted pixel tiles are parked in swap arenas.
//!
//! This crate provides:
//! - Tile slot arena and pixel buffer pool
//! - Generic LRU tile cache with pinning
//! - Swap arenas (memory or temp-file backed) for evicted tiles
//! - Plane tiling and nearest-neighbour scale tables
//! - Incremental rescaling driven by per-row version stamps
//! - Progressive scanline ingestion with damage tracking
//! - Painting onto tiny-skia surfaces with an optional time budget
//! - Animated image frame switching and update coalescing
//! - Decoder registry with format sniffing and an `image` crate bridge
//!
//! # Example
//! ```rust,ignore
//! use fos_imload::{ImageContext, ImageConfig, Image, LoaderRegistry};
//!
//! let mut ctx = ImageContext::new(ImageConfig::default());
//! let registry = LoaderRegistry::with_defaults();
//! let mut image = Image::new(ctx.next_image_id(), Box::new(owner));
//! image.process_data(&mut ctx, &registry, &bytes)?;
//! image.process_eof(&mut ctx)?;
//! image.paint(&mut ctx, 0, 0, &mut surface, 0, 0, 800, 600, Some(16));
//! ```

mod config;
mod context;
pub mod animation;
pub mod cache;
pub mod format;
pub mod image;
pub mod plane;
pub mod pool;
pub mod scaled;
pub mod swap;
pub mod tile;
pub mod updater;

pub use animation::{AnimProvider, AnimState, AnimTimer, Disposal};
pub use cache::{CacheStats, Cacheable, TileCache};
pub use config::{ImageConfig, SwapBacking};
pub use context::{ImageContext, TimerEvent};
pub use format::PixelFormat;
pub use crate::image::{
    FrameInfo, Image, ImageOwner, LoadState, PaintOutcome, Size,
    Detection, ImageLoader, ImageSink, LoaderProvider, LoaderRegistry, Sniff, StillImageProvider,
};
pub use plane::{Plane, ScaleEntry, ScaleTable, TileRect};
pub use pool::{BufferPool, PoolStats, TileId, TilePool};
pub use scaled::ScaledImagePlane;
pub use swap::{BackingStore, FileStore, MemoryStore, SwapBlock, SwapError, SwapManager, SwapStats};
pub use tile::{
    DecodedTile, Leftovers, ProgressVector, ReleaseQueue, RenderTile, SwapSlot, TileBacking, TileResources, TileStack,
};
pub use updater::Updater;

use serde::{Deserialize, Serialize};

/// Edge length of a square tile, in pixels
pub const TILE_SIZE: u32 = 64;

/// Tile edge as an index type
pub(crate) const TS: usize = TILE_SIZE as usize;

/// Identifies an image within an [`ImageContext`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ImageId(pub u32);

/// Color (RGBA, straight alpha)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl Color {
    pub const WHITE: Color = Color { r: 255, g: 255, b: 255, a: 255 };
    pub const BLACK: Color = Color { r: 0, g: 0, b: 0, a: 255 };
    pub const TRANSPARENT: Color = Color { r: 0, g: 0, b: 0, a: 0 };
    pub const LIGHT_GRAY: Color = Color { r: 211, g: 211, b: 211, a: 255 };

    pub const fn rgb(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b, a: 255 }
    }

    pub const fn rgba(r: u8, g: u8, b: u8, a: u8) -> Self {
        Self { r, g, b, a }
    }

    /// Premultiplied RGBA bytes, as stored in render surfaces
    pub fn premultiplied(&self) -> [u8; 4] {
        [
            format::premultiply(self.r, self.a),
            format::premultiply(self.g, self.a),
            format::premultiply(self.b, self.a),
            self.a,
        ]
    }
}

/// Image loading error
#[derive(Debug, thiserror::Error)]
pub enum ImageError {
    #[error("Decode error: {0}")]
    Decode(String),

    #[error("No image format recognized in the first {scanned} bytes")]
    UnrecognizedFormat { scanned: usize },

    #[error("Image has already finished loading or failed")]
    Terminated,

    #[error("Invalid image dimensions {width}x{height}")]
    InvalidDimensions { width: u32, height: u32 },

    #[error(transparent)]
    Swap(#[from] SwapError),
}
