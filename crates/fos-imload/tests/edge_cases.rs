//! Edge case tests for fos-imload
//!
//! Cache bookkeeping under long operation sequences, tiling and scale table
//! boundaries, swap arenas and configuration parsing.

use fos_imload::*;

// ============================================================================
// CACHE
// ============================================================================

#[derive(Debug)]
struct Tagged(u32);

impl Cacheable for Tagged {
    type Context = Vec<u32>;

    fn discard(self, evicted: &mut Vec<u32>) {
        evicted.push(self.0);
    }
}

/// Small deterministic generator for operation sequences
struct Lcg(u64);

impl Lcg {
    fn next(&mut self, bound: usize) -> usize {
        self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        ((self.0 >> 33) % bound as u64) as usize
    }
}

#[test]
fn test_cache_invariants_under_random_ops() {
    let mut cache = TileCache::new(8);
    let mut evicted = Vec::new();
    let mut live: Vec<(TileId, u32)> = Vec::new();
    let mut rng = Lcg(7);

    for step in 0..2000u32 {
        match rng.next(5) {
            0 | 1 => {
                cache.acquire_spot(&mut evicted);
                let id = cache.add_entry(Tagged(step));
                live.push((id, 0));
            }
            2 if !live.is_empty() => {
                let (id, _) = live[rng.next(live.len())];
                if cache.contains(id) {
                    cache.touch_entry(id);
                }
            }
            3 if !live.is_empty() => {
                let i = rng.next(live.len());
                let (id, pins) = live[i];
                if cache.contains(id) && pins < 3 {
                    cache.lock_entry(id);
                    live[i].1 += 1;
                }
            }
            4 if !live.is_empty() => {
                let i = rng.next(live.len());
                let (id, pins) = live[i];
                if pins > 0 {
                    cache.unlock_entry(id, &mut evicted);
                    live[i].1 -= 1;
                }
            }
            _ => {}
        }

        // Pinned tiles must still be resident.
        for &(id, pins) in &live {
            if pins > 0 {
                assert!(cache.contains(id), "pinned tile {id:?} evicted at step {step}");
                assert_eq!(cache.pin_count(id), Some(pins));
            }
        }
        assert!(cache.size() <= cache.limit());
        assert_eq!(cache.size() + cache.pinned_len(), cache.live());
        live.retain(|&(id, pins)| pins > 0 || cache.contains(id));
    }

    assert_eq!(evicted.len() as u64, cache.stats().evictions);
}

#[test]
fn test_cache_evicts_least_recent_first() {
    let mut cache = TileCache::new(3);
    let mut evicted = Vec::new();
    let ids: Vec<_> = (0..3)
        .map(|tag| {
            cache.acquire_spot(&mut evicted);
            cache.add_entry(Tagged(tag))
        })
        .collect();

    cache.touch_entry(ids[0]);
    assert_eq!(cache.lru_order(), vec![ids[1], ids[2], ids[0]]);

    for tag in 3..5 {
        cache.acquire_spot(&mut evicted);
        cache.add_entry(Tagged(tag));
    }
    assert_eq!(evicted, vec![1, 2]);
    assert!(cache.contains(ids[0]));
}

#[test]
fn test_stale_id_after_slot_reuse() {
    let mut cache = TileCache::new(1);
    let mut evicted = Vec::new();

    cache.acquire_spot(&mut evicted);
    let old = cache.add_entry(Tagged(0));
    cache.acquire_spot(&mut evicted);
    let new = cache.add_entry(Tagged(1));

    assert_eq!(old.index, new.index);
    assert_ne!(old.generation, new.generation);
    assert!(!cache.contains(old));
    assert!(cache.get(old).is_none());
    assert_eq!(cache.get(new).map(|p| p.0), Some(1));
}

#[test]
fn test_hit_rate() {
    let mut cache = TileCache::new(4);
    let mut evicted = Vec::new();
    assert_eq!(cache.stats().hit_rate(), 0.0);

    cache.acquire_spot(&mut evicted);
    let id = cache.add_entry(Tagged(0));
    cache.touch_entry(id);
    cache.touch_entry(id);
    cache.touch_entry(id);
    assert!(cache.stats().hit_rate() > 0.0);
    assert_eq!(cache.stats().hits, 3);
}

// ============================================================================
// TILING
// ============================================================================

#[test]
fn test_tiles_cover_plane_exactly() {
    for (width, height) in [(1, 1), (63, 64), (64, 65), (130, 70), (200, 1)] {
        let plane = Plane::new(width, height, 4);
        let mut covered = vec![0u8; (width * height) as usize];

        for ty in 0..plane.tiles_height() {
            for tx in 0..plane.tiles_width() {
                let rect = plane.tile_rect(tx, ty);
                assert!(rect.width >= 1 && rect.width <= TILE_SIZE);
                assert!(rect.height >= 1 && rect.height <= TILE_SIZE);
                for y in rect.y..rect.y + rect.height {
                    for x in rect.x..rect.x + rect.width {
                        covered[(y * width + x) as usize] += 1;
                    }
                }
            }
        }
        assert!(covered.iter().all(|&c| c == 1), "{width}x{height}");
    }
}

#[test]
fn test_plane_tile_counts() {
    let plane = Plane::new(129, 64, 1);
    assert_eq!(plane.tiles_width(), 3);
    assert_eq!(plane.tiles_height(), 1);
    assert_eq!(plane.tile_width(2), 1);
    assert_eq!(plane.tile_height(0), 64);
    assert_eq!(plane.tile_bytes(), (TILE_SIZE * TILE_SIZE) as usize);
}

// ============================================================================
// SCALE TABLES
// ============================================================================

#[test]
fn test_scale_table_deterministic_and_bounded() {
    for (original, scaled) in [(1, 1), (1, 500), (500, 1), (100, 33), (33, 100), (4096, 4095)] {
        let table = ScaleTable::calc(original, scaled);
        assert_eq!(table, ScaleTable::calc(original, scaled));
        assert_eq!(table.len(), scaled as usize);

        let sources: Vec<u32> = (0..scaled).map(|d| table.source_pixel(d)).collect();
        assert!(sources.iter().all(|&s| s < original));
        assert!(sources.windows(2).all(|w| w[0] <= w[1]), "{original} -> {scaled}");
    }
}

#[test]
fn test_scale_table_entries_split_by_tile() {
    let table = ScaleTable::calc(200, 100);
    let entry = table.entry(40);
    assert_eq!(entry.source(), 81);
    assert_eq!(entry.tile, 1);
    assert_eq!(entry.offset, 17);
}

#[test]
fn test_map_source_range_outside_samples() {
    // Halving samples odd rows only.
    let table = ScaleTable::calc(10, 5);
    assert_eq!(table.map_source_range(2, 2), None);
    assert_eq!(table.map_source_range(2, 3), Some((1, 1)));
    assert_eq!(table.map_source_range(0, 9), Some((0, 4)));
}

// ============================================================================
// SWAP
// ============================================================================

#[test]
fn test_file_backed_swap_roundtrip() {
    let mut swap = SwapManager::new(1024, SwapBacking::File, None);
    let a = swap.alloc(256).unwrap();
    let b = swap.alloc(256).unwrap();
    swap.swap_out(a, &[1; 256]).unwrap();
    swap.swap_out(b, &[2; 256]).unwrap();

    let mut buf = [0u8; 256];
    swap.swap_in(a, &mut buf).unwrap();
    assert_eq!(buf, [1; 256]);
    swap.swap_in(b, &mut buf).unwrap();
    assert_eq!(buf, [2; 256]);

    swap.free(a);
    swap.free(b);
    assert_eq!(swap.total_used(), 0);
    assert_eq!(swap.stats().swap_outs, 2);
}

#[test]
fn test_swap_reuses_freed_space() {
    let mut swap = SwapManager::new(512, SwapBacking::Memory, Some(1));
    let blocks: Vec<_> = (0..4).map(|_| swap.alloc(128).unwrap()).collect();
    assert!(matches!(swap.alloc(1), Err(SwapError::Exhausted { .. })));

    swap.free(blocks[1]);
    let again = swap.alloc(128).unwrap();
    assert_eq!(again.offset, blocks[1].offset);
    assert_eq!(swap.arena_count(), 1);
    assert_eq!(swap.stats().peak_used, 512);
}

// ============================================================================
// CONFIGURATION AND CONTEXT
// ============================================================================

#[test]
fn test_config_from_partial_json() {
    let config: ImageConfig = serde_json::from_str(
        r#"{
            "decoded_cache_tiles": 16,
            "swap_max_arenas": 2,
            "fallback_color": { "r": 0, "g": 0, "b": 0, "a": 255 }
        }"#,
    )
    .unwrap();

    assert_eq!(config.decoded_cache_tiles, 16);
    assert_eq!(config.swap_max_arenas, Some(2));
    assert_eq!(config.fallback_color, Color::BLACK);
    assert_eq!(config.swap_backing, SwapBacking::Memory);
    assert_eq!(config.min_frame_delay_ms, 100);
}

#[test]
fn test_context_clamps_config() {
    let ctx = ImageContext::new(ImageConfig {
        decoded_cache_tiles: 0,
        render_cache_tiles: 0,
        ..ImageConfig::default()
    });
    assert_eq!(ctx.tiles.decoded.limit(), 1);
    assert_eq!(ctx.tiles.render.limit(), 1);
}

#[test]
fn test_discard_cache_keeps_pinned_rows() {
    let mut ctx = ImageContext::new(ImageConfig::minimal());
    let mut plane = Plane::new(128, 128, 1);

    plane.lock_row(&mut ctx.tiles, 0);
    plane.decoded_tile(&mut ctx.tiles, 0, 1);
    assert_eq!(ctx.tiles.decoded.live(), 3);

    ctx.discard_cache();
    assert_eq!(ctx.tiles.decoded.live(), 2);
    assert_eq!(ctx.tiles.decoded.pinned_len(), 2);

    plane.unlock_row(&mut ctx.tiles, 0);
    plane.release(&mut ctx.tiles);
    assert_eq!(ctx.tiles.decoded.live(), 0);
}

#[test]
fn test_buffer_pool_recycles() {
    let mut pool = BufferPool::new(2);
    let buf = pool.checkout(64);
    pool.checkin(buf);
    let again = pool.checkout(32);
    assert_eq!(again.len(), 32);
    assert!(again.iter().all(|&b| b == 0));
    assert_eq!(pool.stats().hits, 1);
}
