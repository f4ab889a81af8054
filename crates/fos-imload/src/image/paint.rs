//! Painting
//!
//! Blits an image region onto a tiny-skia surface. Still images paint
//! through render tiles, converting only rows whose decoded version moved;
//! animated images paint from a composited backing store.

use std::time::{Duration, Instant};

use super::{merge_range, Frame, Image, LoadState, Size};
use crate::animation::fill;
use crate::context::ImageContext;
use crate::plane::{Plane, ScaleTable};
use crate::pool::TileId;
use crate::scaled::ScaledImagePlane;
use crate::tile::TileResources;
use crate::{format, TILE_SIZE, TS};

/// Result of a paint call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaintOutcome {
    /// Everything requested was drawn from current data
    Complete,
    /// The time budget ran out; rows from `unfinished_from` on were drawn
    /// from stale cache or the fallback colour and will be flushed again
    Partial { unfinished_from: u32 },
}

/// Requested region, in display coordinates, and where it lands
#[derive(Debug, Clone, Copy)]
struct Area {
    dst_x: i32,
    dst_y: i32,
    src_x: u32,
    src_y: u32,
    width: u32,
    height: u32,
}

impl Area {
    /// Draw a run of premultiplied pixels that starts at display `(x, y)`
    fn put_row(&self, surface: &mut tiny_skia::Pixmap, x: u32, y: u32, row: &[u8], blend: bool) {
        if y < self.src_y || y >= self.src_y + self.height {
            return;
        }
        let sy = self.dst_y as i64 + (y - self.src_y) as i64;
        if sy < 0 || sy >= surface.height() as i64 {
            return;
        }

        let surface_width = surface.width() as i64;
        let start = x.max(self.src_x);
        let end = (x + (row.len() / 4) as u32).min(self.src_x + self.width);
        let data = surface.data_mut();

        for px in start..end {
            let sx = self.dst_x as i64 + (px - self.src_x) as i64;
            if sx < 0 || sx >= surface_width {
                continue;
            }
            let s = &row[(px - x) as usize * 4..][..4];
            let at = ((sy * surface_width + sx) * 4) as usize;
            let d = &mut data[at..at + 4];
            if blend {
                blend_pixel(d, s);
            } else {
                d.copy_from_slice(s);
            }
        }
    }
}

/// Premultiplied source-over
fn blend_pixel(dst: &mut [u8], src: &[u8]) {
    match src[3] {
        255 => dst.copy_from_slice(src),
        0 => {}
        alpha => {
            let inv = 255 - alpha;
            for i in 0..4 {
                dst[i] = src[i].saturating_add(format::premultiply(dst[i], inv));
            }
        }
    }
}

/// The plane painted for a still image
enum Target<'a> {
    Direct(&'a mut Plane),
    Scaled(&'a mut ScaledImagePlane, &'a mut Plane),
}

impl Target<'_> {
    fn plane(&self) -> &Plane {
        match self {
            Target::Direct(plane) => plane,
            Target::Scaled(scaled, _) => scaled.plane(),
        }
    }

    fn plane_mut(&mut self) -> &mut Plane {
        match self {
            Target::Direct(plane) => plane,
            Target::Scaled(scaled, _) => scaled.plane_mut(),
        }
    }

    /// Decoded tile with current data
    fn decoded(&mut self, res: &mut TileResources, tile_x: u32, tile_y: u32) -> TileId {
        match self {
            Target::Direct(plane) => plane.decoded_tile(res, tile_x, tile_y),
            Target::Scaled(scaled, src) => scaled.ensure_up_to_date(src, res, tile_x, tile_y),
        }
    }

    /// Frame row a painted row was sampled from
    fn source_row(&self, row: u32) -> u32 {
        match self {
            Target::Direct(_) => row,
            Target::Scaled(scaled, _) => scaled.y_table().source_pixel(row),
        }
    }
}

fn scale_coord(value: u32, scaled: u32, original: u32) -> u32 {
    (value as u64 * scaled as u64 / original.max(1) as u64) as u32
}

impl Image {
    /// Paint the display-space region `src_x, src_y, width, height` with
    /// its top-left corner at `dst_x, dst_y` on `surface`
    ///
    /// With a time limit, painting stops refreshing tiles once the limit
    /// has passed. The remaining tiles come from the render cache, or the
    /// fallback colour where nothing is cached, and their rows are queued
    /// for another flush. Animated images ignore the limit: their frames
    /// are already composited into one backing store, which is always
    /// blitted whole.
    #[allow(clippy::too_many_arguments)]
    pub fn paint(
        &mut self,
        ctx: &mut ImageContext,
        dst_x: i32,
        dst_y: i32,
        surface: &mut tiny_skia::Pixmap,
        src_x: u32,
        src_y: u32,
        width: u32,
        height: u32,
        time_limit_ms: Option<u32>,
    ) -> PaintOutcome {
        if self.frames.is_empty() || width == 0 || height == 0 {
            return PaintOutcome::Complete;
        }

        let area = Area { dst_x, dst_y, src_x, src_y, width, height };
        if self.anim.is_some() {
            self.paint_animated(ctx, surface, area);
            return PaintOutcome::Complete;
        }
        self.paint_still(ctx, surface, area, time_limit_ms)
    }

    fn paint_still(
        &mut self,
        ctx: &mut ImageContext,
        surface: &mut tiny_skia::Pixmap,
        area: Area,
        time_limit_ms: Option<u32>,
    ) -> PaintOutcome {
        let deadline = time_limit_ms.map(|ms| Instant::now() + Duration::from_millis(ms as u64));
        let fallback = ctx.config().fallback_color;
        let display = self.display_size();
        let image = self.size();

        let Image { id, frames, scaled, display: scaled_to, .. } = self;
        let Frame { info, plane, damage, .. } = &mut frames[0];

        let (origin_x, origin_y, mut target) = match scaled_to {
            Some(size) => {
                let width = scale_coord(info.width, size.width, image.width).max(1);
                let height = scale_coord(info.height, size.height, image.height).max(1);
                let set = scaled.entry(*size).or_default();
                let stale = set
                    .plane
                    .as_ref()
                    .is_some_and(|p| p.plane().width() != width || p.plane().height() != height);
                if stale {
                    if let Some(mut old) = set.plane.take() {
                        old.release(&mut ctx.tiles);
                    }
                }
                let target = set
                    .plane
                    .get_or_insert_with(|| ScaledImagePlane::new(info.width, info.height, width, height, plane.depth()));
                (
                    scale_coord(info.x, size.width, image.width),
                    scale_coord(info.y, size.height, image.height),
                    Target::Scaled(target, plane),
                )
            }
            None => (info.x, info.y, Target::Direct(plane)),
        };

        let (plane_width, plane_height) = (target.plane().width(), target.plane().height());
        let x0 = area.src_x.max(origin_x);
        let x1 = (area.src_x + area.width).min(origin_x + plane_width).min(display.width);
        let y0 = area.src_y.max(origin_y);
        let y1 = (area.src_y + area.height).min(origin_y + plane_height).min(display.height);
        if x0 >= x1 || y0 >= y1 {
            return PaintOutcome::Complete;
        }
        let (tx0, tx1) = ((x0 - origin_x) / TILE_SIZE, (x1 - 1 - origin_x) / TILE_SIZE);
        let (ty0, ty1) = ((y0 - origin_y) / TILE_SIZE, (y1 - 1 - origin_y) / TILE_SIZE);

        let res = &mut ctx.tiles;
        let fallback_row = fallback.premultiplied().repeat(TS);
        let mut painted_any = false;
        let mut unfinished = None;

        for tile_y in ty0..=ty1 {
            for tile_x in tx0..=tx1 {
                let rect = target.plane().tile_rect(tile_x, tile_y);
                let (left, top) = (origin_x + rect.x, origin_y + rect.y);
                let row_bytes = rect.width as usize * 4;

                let out_of_time = painted_any && deadline.is_some_and(|d| Instant::now() >= d);
                if out_of_time {
                    if unfinished.is_none() {
                        tracing::debug!("Image {:?} paint budget exhausted at tile ({}, {})", id, tile_x, tile_y);
                    }
                    merge_range(&mut unfinished, rect.y, rect.y + rect.height - 1);

                    match target.plane().stack(tile_x, tile_y).live_render(&res.render) {
                        Some(render) => {
                            let data = res.render.tile(render).pixmap.data();
                            for r in 0..rect.height {
                                let row = &data[r as usize * row_bytes..][..row_bytes];
                                area.put_row(surface, left, top + r, row, true);
                            }
                        }
                        None => {
                            for r in 0..rect.height {
                                area.put_row(surface, left, top + r, &fallback_row[..row_bytes], false);
                            }
                        }
                    }
                    continue;
                }

                let decoded = target.decoded(res, tile_x, tile_y);
                let plane = target.plane_mut();
                let (stride, depth) = (plane.tile_stride(), plane.depth());
                let stack = plane.stack_mut(tile_x, tile_y);
                let Some(render) = stack.materialize_render(res, rect.width, rect.height) else {
                    continue;
                };

                for r in 0..rect.height as usize {
                    let version = stack.progress()[r];
                    if stack.render_progress()[r] == version {
                        continue;
                    }
                    let src = &res.decoded.tile(decoded).pixels()[r * stride..r * stride + rect.width as usize * depth];
                    let dst = &mut res.render.tile_mut(render).pixmap.data_mut()[r * row_bytes..(r + 1) * row_bytes];
                    info.format.render_row(src, dst);
                    stack.render_progress_mut()[r] = version;
                }

                let data = res.render.tile(render).pixmap.data();
                for r in 0..rect.height {
                    let row = &data[r as usize * row_bytes..][..row_bytes];
                    area.put_row(surface, left, top + r, row, true);
                }
                painted_any = true;
            }
        }

        match unfinished {
            Some((start, end)) => {
                let (source_start, source_end) = (target.source_row(start), target.source_row(end));
                merge_range(damage, source_start, source_end);
                ctx.updater.have_updates(*id);
                PaintOutcome::Partial { unfinished_from: (origin_y + start).max(area.src_y) }
            }
            None => PaintOutcome::Complete,
        }
    }

    fn paint_animated(&mut self, ctx: &mut ImageContext, surface: &mut tiny_skia::Pixmap, area: Area) {
        let display = self.display_size();
        let Image {
            id,
            width,
            height,
            background,
            frames,
            state,
            anim: Some(anim),
            ..
        } = self
        else {
            return;
        };
        let background = *background;

        if anim.backing().is_none() {
            let Some(mut backing) = tiny_skia::Pixmap::new(*width, *height) else {
                return;
            };
            fill(&mut backing, background);
            let shown = anim.frame().min(frames.len() - 1);
            for index in 0..=shown {
                if index > 0 {
                    frames[index - 1].info.disposal.apply(&mut backing, background);
                }
                composite(&mut frames[index], &mut ctx.tiles, &mut backing);
            }
            anim.set_backing(backing);
        }

        if anim.is_switch_pending() {
            let current = anim.frame();
            let following = current + 1;
            let next = if following < frames.len() && (frames[following].complete || *state == LoadState::Done) {
                Some(following)
            } else if following >= frames.len() && *state == LoadState::Done {
                Some(0)
            } else {
                None
            };

            match next {
                Some(next) => {
                    if let Some(backing) = anim.backing_mut() {
                        frames[current].info.disposal.apply(backing, background);
                        composite(&mut frames[next], &mut ctx.tiles, backing);
                    }
                    anim.advance_to(next);
                }
                None => anim.postpone(),
            }
        }

        if let Some(backing) = anim.backing() {
            blit_backing(backing, display, surface, area);
        }

        if !anim.is_armed() && !anim.is_stopped() {
            ctx.anim.schedule(*id, frames[anim.frame()].info.delay_ms);
            anim.set_armed(true);
        }
    }
}

/// Source-over one frame's written rows onto the backing store
fn composite(frame: &mut Frame, res: &mut TileResources, backing: &mut tiny_skia::Pixmap) {
    let Frame { info, plane, .. } = frame;
    let (backing_width, backing_height) = (backing.width(), backing.height());
    let (stride, depth) = (plane.tile_stride(), plane.depth());
    let mut line = vec![0u8; TS * 4];

    for tile_y in 0..plane.tiles_height() {
        for tile_x in 0..plane.tiles_width() {
            let rect = plane.tile_rect(tile_x, tile_y);
            let rows = rect.height as usize;
            if plane.stack(tile_x, tile_y).progress()[..rows].iter().all(|&v| v == 0) {
                continue;
            }

            let id = plane.decoded_tile(res, tile_x, tile_y);
            let width = rect.width as usize;
            for r in 0..rows {
                if plane.stack(tile_x, tile_y).progress()[r] == 0 {
                    continue;
                }
                let y = info.y + rect.y + r as u32;
                if y >= backing_height {
                    continue;
                }

                let src = &res.decoded.tile(id).pixels()[r * stride..r * stride + width * depth];
                info.format.render_row(src, &mut line[..width * 4]);

                let data = backing.data_mut();
                for c in 0..width {
                    let x = info.x + rect.x + c as u32;
                    if x >= backing_width {
                        break;
                    }
                    let at = (y as usize * backing_width as usize + x as usize) * 4;
                    blend_pixel(&mut data[at..at + 4], &line[c * 4..c * 4 + 4]);
                }
            }
        }
    }
}

/// Draw the backing store, nearest-neighbour scaled to the display size
fn blit_backing(backing: &tiny_skia::Pixmap, display: Size, surface: &mut tiny_skia::Pixmap, area: Area) {
    let x_table = ScaleTable::calc(backing.width(), display.width);
    let y_table = ScaleTable::calc(backing.height(), display.height);

    let x0 = area.src_x.min(display.width);
    let x1 = (area.src_x + area.width).min(display.width);
    let y1 = (area.src_y + area.height).min(display.height);
    if x0 >= x1 {
        return;
    }

    let data = backing.data();
    let stride = backing.width() as usize * 4;
    let mut row = vec![0u8; (x1 - x0) as usize * 4];

    for y in area.src_y..y1 {
        let source = &data[y_table.source_pixel(y) as usize * stride..][..stride];
        for x in x0..x1 {
            let sx = x_table.source_pixel(x) as usize * 4;
            let out = (x - x0) as usize * 4;
            row[out..out + 4].copy_from_slice(&source[sx..sx + 4]);
        }
        area.put_row(surface, x0, y, &row, true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blend_pixel() {
        let mut dst = [100, 100, 100, 255];
        blend_pixel(&mut dst, &[0, 0, 0, 0]);
        assert_eq!(dst, [100, 100, 100, 255]);

        blend_pixel(&mut dst, &[50, 0, 0, 128]);
        assert_eq!(dst, [100, 50, 50, 255]);

        blend_pixel(&mut dst, &[1, 2, 3, 255]);
        assert_eq!(dst, [1, 2, 3, 255]);
    }

    #[test]
    fn test_put_row_clips_to_surface() {
        let mut surface = tiny_skia::Pixmap::new(4, 4).unwrap();
        let area = Area { dst_x: -1, dst_y: 0, src_x: 0, src_y: 0, width: 4, height: 4 };
        let row = [9u8, 9, 9, 255].repeat(4);
        area.put_row(&mut surface, 0, 0, &row, false);

        let first_row = &surface.data()[..16];
        assert_eq!(first_row, [[9, 9, 9, 255], [9, 9, 9, 255], [9, 9, 9, 255], [0, 0, 0, 0]].concat());
    }
}
