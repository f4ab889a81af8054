//! Image handling module
//!
//! The progressive-ingestion front end. A decoder pushes frames and
//! scanlines into an [`Image`]; the image writes them into tiles, tracks
//! damage per frame, and reports it to its [`ImageOwner`] when the update
//! coalescer flushes it.

mod codec;
mod loader;
mod paint;

pub use codec::StillImageProvider;
pub use loader::{Detection, ImageLoader, ImageSink, LoaderProvider, LoaderRegistry, Sniff};
pub use paint::PaintOutcome;

use std::collections::HashMap;

use crate::animation::{AnimProvider, Disposal};
use crate::context::ImageContext;
use crate::format::PixelFormat;
use crate::plane::{Plane, ScaleTable};
use crate::scaled::ScaledImagePlane;
use crate::{Color, ImageError, ImageId, TILE_SIZE, TS};

/// Receives geometry, damage and completion callbacks for one image
pub trait ImageOwner {
    /// Dimensions are known
    fn image_has_geometry(&mut self, id: ImageId, width: u32, height: u32, frames: usize);

    /// Rows `start..=end` of `frame` changed, in display coordinates
    fn image_change(&mut self, id: ImageId, frame: usize, start: u32, end: u32);

    /// All data arrived and was decoded
    fn image_done(&mut self, id: ImageId);

    /// Decoding failed; no further callbacks follow
    fn image_error(&mut self, id: ImageId);
}

/// Frame declaration from a decoder
#[derive(Debug, Clone, PartialEq)]
pub struct FrameInfo {
    /// Offset within the image
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    /// Display time before the next frame (ms)
    pub delay_ms: u32,
    pub disposal: Disposal,
}

impl FrameInfo {
    pub fn new(width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            x: 0,
            y: 0,
            width,
            height,
            format,
            delay_ms: 0,
            disposal: Disposal::Leave,
        }
    }

    pub fn with_offset(mut self, x: u32, y: u32) -> Self {
        self.x = x;
        self.y = y;
        self
    }

    pub fn with_delay(mut self, delay_ms: u32) -> Self {
        self.delay_ms = delay_ms;
        self
    }

    pub fn with_disposal(mut self, disposal: Disposal) -> Self {
        self.disposal = disposal;
        self
    }
}

#[derive(Debug)]
pub(crate) struct Frame {
    pub(crate) info: FrameInfo,
    pub(crate) plane: Plane,
    /// Every pass so far has been delivered
    pub(crate) complete: bool,
    /// Rows changed since the last flush, in frame coordinates
    pub(crate) damage: Option<(u32, u32)>,
}

impl Frame {
    pub(crate) fn add_damage(&mut self, start: u32, end: u32) {
        merge_range(&mut self.damage, start, end);
    }
}

/// Grow an inclusive row range to cover `start..=end`
pub(crate) fn merge_range(range: &mut Option<(u32, u32)>, start: u32, end: u32) {
    *range = Some(match *range {
        Some((s, e)) => (s.min(start), e.max(end)),
        None => (start, end),
    });
}

/// Image dimensions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

impl Size {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

/// Load state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadState {
    Loading,
    Done,
    Error,
}

/// Scaled planes shared by every viewer of one size
#[derive(Debug, Default)]
pub(crate) struct ScaledSet {
    pub(crate) refs: u32,
    /// Rescaled first frame, built on first paint
    pub(crate) plane: Option<ScaledImagePlane>,
}

enum LoaderSlot {
    /// Buffering bytes until a provider recognizes them
    Sniffing(Vec<u8>),
    Active(Box<dyn ImageLoader>),
    Finished,
}

/// A progressively loaded, possibly animated image
pub struct Image {
    id: ImageId,
    owner: Box<dyn ImageOwner>,
    width: u32,
    height: u32,
    background: Color,
    pub(crate) frames: Vec<Frame>,
    state: LoadState,
    /// Next row the decoder will deliver
    loader_scanline: u32,
    last_version: u8,
    /// Tile row of the current frame pinned while it is written
    locked_row: Option<u32>,
    pub(crate) scaled: HashMap<Size, ScaledSet>,
    display: Option<Size>,
    pub(crate) anim: Option<AnimProvider>,
    loader: LoaderSlot,
}

impl std::fmt::Debug for Image {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Image")
            .field("id", &self.id)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("frames", &self.frames.len())
            .field("state", &self.state)
            .field("display", &self.display)
            .finish()
    }
}

impl Image {
    pub fn new(id: ImageId, owner: Box<dyn ImageOwner>) -> Self {
        Self {
            id,
            owner,
            width: 0,
            height: 0,
            background: Color::TRANSPARENT,
            frames: Vec::new(),
            state: LoadState::Loading,
            loader_scanline: 0,
            last_version: 0,
            locked_row: None,
            scaled: HashMap::new(),
            display: None,
            anim: None,
            loader: LoaderSlot::Sniffing(Vec::new()),
        }
    }

    pub fn id(&self) -> ImageId {
        self.id
    }

    pub fn state(&self) -> LoadState {
        self.state
    }

    /// Original dimensions
    pub fn size(&self) -> Size {
        Size::new(self.width, self.height)
    }

    /// Dimensions painted at
    pub fn display_size(&self) -> Size {
        self.display.unwrap_or(self.size())
    }

    pub fn background(&self) -> Color {
        self.background
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    pub fn frame_info(&self, index: usize) -> Option<&FrameInfo> {
        self.frames.get(index).map(|frame| &frame.info)
    }

    pub fn frame_plane(&self, index: usize) -> Option<&Plane> {
        self.frames.get(index).map(|frame| &frame.plane)
    }

    pub fn is_animated(&self) -> bool {
        self.anim.is_some()
    }

    /// Index of the frame on screen
    pub fn current_frame(&self) -> usize {
        self.anim.as_ref().map_or(0, AnimProvider::frame)
    }

    fn ensure_loading(&self) -> Result<(), ImageError> {
        match self.state {
            LoadState::Loading => Ok(()),
            _ => Err(ImageError::Terminated),
        }
    }

    // ========================================================================
    // Decoder side
    // ========================================================================

    /// Image dimensions are known
    pub fn notify_image_info(&mut self, width: u32, height: u32) -> Result<(), ImageError> {
        self.ensure_loading()?;
        if width == 0 || height == 0 {
            return Err(ImageError::InvalidDimensions { width, height });
        }

        self.width = width;
        self.height = height;
        self.owner.image_has_geometry(self.id, width, height, self.frames.len().max(1));
        Ok(())
    }

    pub fn notify_background(&mut self, color: Color) {
        self.background = color;
    }

    /// Declare a new frame; following scanlines belong to it
    pub fn notify_append_frame(&mut self, ctx: &mut ImageContext, info: FrameInfo) -> Result<(), ImageError> {
        self.ensure_loading()?;
        if info.width == 0 || info.height == 0 {
            return Err(ImageError::InvalidDimensions { width: info.width, height: info.height });
        }

        if let Some(frame) = self.frames.last_mut() {
            if let Some(row) = self.locked_row.take() {
                frame.plane.unlock_row(&mut ctx.tiles, row);
            }
            frame.complete = true;
        }

        if self.width == 0 {
            self.width = info.x + info.width;
            self.height = info.y + info.height;
            self.owner.image_has_geometry(self.id, self.width, self.height, 1);
        }

        let depth = info.format.depth();
        self.frames.push(Frame {
            plane: Plane::new(info.width, info.height, depth),
            info,
            complete: false,
            damage: None,
        });
        self.loader_scanline = 0;
        self.last_version = 0;

        if self.frames.len() == 2 {
            tracing::debug!("Image {:?} is animated", self.id);
            self.anim = Some(AnimProvider::new());
        }
        Ok(())
    }

    /// Deliver the next row of the current pass
    ///
    /// A version different from the previous row's starts a new pass at
    /// row 0. The tile row being written stays pinned until the decoder
    /// moves past it.
    pub fn notify_scanline(&mut self, ctx: &mut ImageContext, version: u8, row: &[u8]) -> Result<(), ImageError> {
        self.ensure_loading()?;
        assert!(version != 0, "scanline version 0 is reserved for unwritten rows");
        let index = match self.frames.len() {
            0 => panic!("notify_scanline before notify_append_frame"),
            n => n - 1,
        };

        let res = &mut ctx.tiles;
        let Frame { info, plane, .. } = &mut self.frames[index];
        let depth = info.format.depth();
        assert!(
            row.len() >= info.width as usize * depth,
            "scanline of {} bytes is shorter than frame width {}",
            row.len(),
            info.width
        );

        if version != self.last_version {
            tracing::debug!("Image {:?} frame {} pass {}", self.id, index, version);
            self.last_version = version;
            self.loader_scanline = 0;
        }

        let line = self.loader_scanline;
        assert!(line < info.height, "scanline {line} past frame height {}", info.height);
        let tile_y = line / TILE_SIZE;

        if self.locked_row != Some(tile_y) {
            if let Some(previous) = self.locked_row.take() {
                plane.unlock_row(res, previous);
            }
            plane.lock_row(res, tile_y);
            self.locked_row = Some(tile_y);
        }

        let offset = (line % TILE_SIZE) as usize;
        let stride = plane.tile_stride();
        for tile_x in 0..plane.tiles_width() {
            let width = plane.tile_width(tile_x) as usize;
            let start = tile_x as usize * TS * depth;
            let src = &row[start..start + width * depth];

            let id = plane.decoded_tile(res, tile_x, tile_y);
            let dst = &mut res.decoded.tile_mut(id).pixels_mut()[offset * stride..offset * stride + width * depth];
            info.format.store_row(src, dst);
            plane.stack_mut(tile_x, tile_y).progress_mut()[offset] = version;
        }

        self.frames[index].add_damage(line, line);
        self.loader_scanline = (line + 1) % self.frames[index].info.height;

        if let Some(anim) = &mut self.anim {
            if index <= anim.frame() {
                anim.invalidate_backing();
            }
        }
        ctx.updater.have_updates(self.id);
        Ok(())
    }

    /// The latest pass is authoritative; release the pinned tile row
    pub fn notify_finished(&mut self, ctx: &mut ImageContext) -> Result<(), ImageError> {
        self.ensure_loading()?;
        if let Some(frame) = self.frames.last_mut() {
            if let Some(row) = self.locked_row.take() {
                frame.plane.unlock_row(&mut ctx.tiles, row);
            }
            frame.complete = true;
        }
        Ok(())
    }

    /// Read back a row of the current frame as stored
    pub fn request_scanline(&mut self, ctx: &mut ImageContext, line: u32, buf: &mut [u8]) {
        let Some(frame) = self.frames.last_mut() else {
            panic!("request_scanline before notify_append_frame");
        };
        read_row(&mut frame.plane, ctx, line, buf);
    }

    /// The decoder hit malformed input
    pub fn notify_error(&mut self, ctx: &mut ImageContext, message: impl Into<String>) {
        self.fail(ctx, ImageError::Decode(message.into()));
    }

    /// Enter the error state once; later failures only return the error
    fn fail(&mut self, ctx: &mut ImageContext, err: ImageError) -> ImageError {
        if self.state == LoadState::Error {
            return err;
        }

        tracing::warn!("Image {:?} failed: {}", self.id, err);
        self.state = LoadState::Error;
        self.loader = LoaderSlot::Finished;
        if let (Some(frame), Some(row)) = (self.frames.last_mut(), self.locked_row.take()) {
            frame.plane.unlock_row(&mut ctx.tiles, row);
        }
        ctx.updater.cancel(self.id);
        self.owner.image_error(self.id);
        err
    }

    // ========================================================================
    // Data side
    // ========================================================================

    /// Feed encoded bytes, picking a decoder once the format is recognized
    pub fn process_data(
        &mut self,
        ctx: &mut ImageContext,
        registry: &LoaderRegistry,
        data: &[u8],
    ) -> Result<(), ImageError> {
        self.ensure_loading()?;

        let mut loader = match std::mem::replace(&mut self.loader, LoaderSlot::Finished) {
            LoaderSlot::Active(loader) => loader,
            LoaderSlot::Finished => return Err(ImageError::Terminated),
            LoaderSlot::Sniffing(mut prefix) => {
                prefix.extend_from_slice(data);
                let limit = ctx.config().sniff_limit;
                match registry.detect(&prefix) {
                    Detection::Found(provider) => {
                        tracing::debug!("Image {:?} decoded by {}", self.id, provider.name());
                        let mut loader = provider.create();
                        let result = loader.process_data(&mut ImageSink::new(self, ctx), &prefix);
                        return self.resume_loader(ctx, loader, result);
                    }
                    Detection::NeedMore if prefix.len() < limit => {
                        self.loader = LoaderSlot::Sniffing(prefix);
                        return Ok(());
                    }
                    _ => {
                        let scanned = prefix.len().min(limit);
                        return Err(self.fail(ctx, ImageError::UnrecognizedFormat { scanned }));
                    }
                }
            }
        };

        let result = loader.process_data(&mut ImageSink::new(self, ctx), data);
        self.resume_loader(ctx, loader, result)
    }

    fn resume_loader(
        &mut self,
        ctx: &mut ImageContext,
        loader: Box<dyn ImageLoader>,
        result: Result<(), ImageError>,
    ) -> Result<(), ImageError> {
        match result {
            Ok(()) if self.state == LoadState::Loading => {
                self.loader = LoaderSlot::Active(loader);
                Ok(())
            }
            Ok(()) => Ok(()),
            Err(err) => Err(self.fail(ctx, err)),
        }
    }

    /// No more bytes will arrive
    ///
    /// An image fed directly through the `notify_*` calls, without
    /// [`process_data`](Self::process_data), finishes here as well.
    pub fn process_eof(&mut self, ctx: &mut ImageContext) -> Result<(), ImageError> {
        self.ensure_loading()?;

        match std::mem::replace(&mut self.loader, LoaderSlot::Finished) {
            LoaderSlot::Active(mut loader) => {
                if let Err(err) = loader.process_eof(&mut ImageSink::new(self, ctx)) {
                    return Err(self.fail(ctx, err));
                }
                self.ensure_loading()?;
            }
            LoaderSlot::Sniffing(prefix) if prefix.is_empty() && !self.frames.is_empty() => {}
            LoaderSlot::Sniffing(prefix) => {
                return Err(self.fail(ctx, ImageError::UnrecognizedFormat { scanned: prefix.len() }));
            }
            LoaderSlot::Finished => return Err(ImageError::Terminated),
        }

        if self.frames.is_empty() {
            return Err(self.fail(ctx, ImageError::Decode("no frames decoded".into())));
        }

        self.notify_finished(ctx)?;
        for frame in &mut self.frames {
            frame.complete = true;
        }
        self.state = LoadState::Done;
        self.flush_updates(ctx);
        ctx.updater.cancel(self.id);
        self.owner.image_done(self.id);
        Ok(())
    }

    // ========================================================================
    // Owner side
    // ========================================================================

    /// Report damage accumulated since the last flush
    pub fn flush_updates(&mut self, _ctx: &mut ImageContext) {
        let Image { id, owner, frames, display, height, .. } = self;
        let y_table = display.map(|size| ScaleTable::calc(*height, size.height));

        for (index, frame) in frames.iter_mut().enumerate() {
            let Some((start, end)) = frame.damage.take() else {
                continue;
            };
            let (start, end) = (start + frame.info.y, end + frame.info.y);
            let mapped = match &y_table {
                Some(table) => table.map_source_range(start, end),
                None => Some((start, end)),
            };
            if let Some((start, end)) = mapped {
                owner.image_change(*id, index, start, end);
            }
        }
    }

    // ========================================================================
    // Sizing
    // ========================================================================

    /// Paint at `width x height` from now on
    pub fn scale(&mut self, ctx: &mut ImageContext, width: u32, height: u32) {
        let size = Size::new(width, height);
        if self.display == Some(size) {
            return;
        }
        if size == self.size() {
            self.dont_scale(ctx);
            return;
        }

        self.ref_size(size);
        if let Some(old) = self.display.replace(size) {
            self.deref_size(ctx, old);
        }
    }

    /// Paint at the original size
    pub fn dont_scale(&mut self, ctx: &mut ImageContext) {
        if let Some(old) = self.display.take() {
            self.deref_size(ctx, old);
        }
    }

    /// Share the scaled planes of `size`; the original size is never counted
    pub fn ref_size(&mut self, size: Size) {
        if size == self.size() {
            return;
        }
        self.scaled.entry(size).or_default().refs += 1;
    }

    /// Drop a reference; the last holder frees the scaled planes
    pub fn deref_size(&mut self, ctx: &mut ImageContext, size: Size) {
        if size == self.size() {
            return;
        }
        let Some(set) = self.scaled.get_mut(&size) else {
            return;
        };
        set.refs = set.refs.saturating_sub(1);
        if set.refs == 0 {
            if let Some(mut set) = self.scaled.remove(&size) {
                if let Some(plane) = &mut set.plane {
                    plane.release(&mut ctx.tiles);
                }
            }
        }
    }

    /// Viewers holding `size`
    pub fn size_refs(&self, size: Size) -> u32 {
        self.scaled.get(&size).map_or(0, |set| set.refs)
    }

    // ========================================================================
    // Animation
    // ========================================================================

    /// Timer callback; the switch happens on the next paint
    pub fn switch_frame(&mut self) {
        let Some(anim) = &mut self.anim else {
            return;
        };
        anim.switch_frame();
        if anim.is_switch_pending() {
            let height = self.display_size().height;
            let frame = self.current_frame();
            self.owner.image_change(self.id, frame, 0, height.saturating_sub(1));
        }
    }

    pub fn stop_animation(&mut self, ctx: &mut ImageContext) {
        if let Some(anim) = &mut self.anim {
            anim.stop();
            ctx.anim.cancel(self.id);
        }
    }

    pub fn resume_animation(&mut self, ctx: &mut ImageContext) {
        let Some(anim) = &mut self.anim else {
            return;
        };
        anim.resume();
        if !anim.is_armed() {
            let delay = self.frames[anim.frame()].info.delay_ms;
            ctx.anim.schedule(self.id, delay);
            anim.set_armed(true);
        }
    }

    // ========================================================================
    // Teardown
    // ========================================================================

    /// Release every plane and deregister from the shared timers
    pub fn dispose(mut self, ctx: &mut ImageContext) {
        ctx.anim.cancel(self.id);
        ctx.updater.cancel(self.id);

        self.locked_row = None;
        for frame in &mut self.frames {
            frame.plane.release(&mut ctx.tiles);
        }
        for set in self.scaled.values_mut() {
            if let Some(plane) = &mut set.plane {
                plane.release(&mut ctx.tiles);
            }
        }
    }
}

/// Copy one stored row of a plane into `buf`
pub(crate) fn read_row(plane: &mut Plane, ctx: &mut ImageContext, line: u32, buf: &mut [u8]) {
    assert!(line < plane.height(), "row {line} past plane height {}", plane.height());
    let depth = plane.depth();
    assert!(buf.len() >= plane.width() as usize * depth, "row buffer too short");

    let tile_y = line / TILE_SIZE;
    let offset = (line % TILE_SIZE) as usize * plane.tile_stride();
    for tile_x in 0..plane.tiles_width() {
        let width = plane.tile_width(tile_x) as usize * depth;
        let start = tile_x as usize * TS * depth;
        let id = plane.decoded_tile(&mut ctx.tiles, tile_x, tile_y);
        let pixels = ctx.tiles.decoded.tile(id).pixels();
        buf[start..start + width].copy_from_slice(&pixels[offset..offset + width]);
    }
}
