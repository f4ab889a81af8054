//! Swap Arenas
//!
//! Parks the pixel bytes of evicted tiles outside the decoded-tile cache.
//! A [`SwapManager`] keeps a list of arenas, each with a soft byte capacity.
//! Blocks are carved first-fit out of freed ranges before the arena grows,
//! so freeing a block makes its capacity available to the next allocation.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::config::SwapBacking;

/// Swap error
#[derive(Debug, thiserror::Error)]
pub enum SwapError {
    #[error("Swap exhausted: no arena can hold {requested} bytes (capacity {capacity})")]
    Exhausted { requested: usize, capacity: u64 },

    #[error("Swap I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Random-access byte storage behind one arena
pub trait BackingStore: std::fmt::Debug {
    fn write_at(&mut self, offset: u64, bytes: &[u8]) -> io::Result<()>;
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()>;
}

/// Heap-backed store
#[derive(Debug, Default)]
pub struct MemoryStore {
    data: Vec<u8>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BackingStore for MemoryStore {
    fn write_at(&mut self, offset: u64, bytes: &[u8]) -> io::Result<()> {
        let start = offset as usize;
        let end = start + bytes.len();
        if self.data.len() < end {
            self.data.resize(end, 0);
        }
        self.data[start..end].copy_from_slice(bytes);
        Ok(())
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let start = offset as usize;
        let end = start + buf.len();
        let src = self
            .data
            .get(start..end)
            .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "read past end of swap store"))?;
        buf.copy_from_slice(src);
        Ok(())
    }
}

/// Temp-file store, removed when the arena is dropped
#[derive(Debug)]
pub struct FileStore {
    file: File,
    path: PathBuf,
}

static NEXT_FILE: AtomicU64 = AtomicU64::new(0);

impl FileStore {
    /// Create a fresh swap file under the system temp directory
    pub fn new() -> io::Result<Self> {
        let n = NEXT_FILE.fetch_add(1, Ordering::Relaxed);
        let path = std::env::temp_dir().join(format!("fos_swap_{}_{}", std::process::id(), n));
        Self::create(path)
    }

    pub fn create(path: PathBuf) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;

        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileStore {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

impl BackingStore for FileStore {
    fn write_at(&mut self, offset: u64, bytes: &[u8]) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(bytes)
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(buf)
    }
}

/// A byte range inside one arena
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapBlock {
    pub arena: u32,
    pub offset: u64,
    pub len: u32,
}

#[derive(Debug, Clone, Copy)]
struct FreeRange {
    offset: u64,
    len: u64,
}

#[derive(Debug)]
struct SwapArena {
    store: Box<dyn BackingStore>,
    /// Bytes held by live blocks
    used: u64,
    /// One past the highest byte ever handed out
    end: u64,
    /// Freed ranges below `end`, sorted by offset
    free: Vec<FreeRange>,
}

impl SwapArena {
    fn new(store: Box<dyn BackingStore>) -> Self {
        Self { store, used: 0, end: 0, free: Vec::new() }
    }

    fn reserve(&mut self, len: u64) -> u64 {
        self.used += len;

        if let Some(pos) = self.free.iter().position(|range| range.len >= len) {
            let range = &mut self.free[pos];
            let offset = range.offset;
            range.offset += len;
            range.len -= len;
            if range.len == 0 {
                self.free.remove(pos);
            }
            return offset;
        }

        let offset = self.end;
        self.end += len;
        offset
    }

    fn release(&mut self, offset: u64, len: u64) {
        self.used -= len;

        let pos = self.free.partition_point(|range| range.offset < offset);
        self.free.insert(pos, FreeRange { offset, len });

        // Coalesce with the following range, then the preceding one.
        if pos + 1 < self.free.len() && self.free[pos].offset + self.free[pos].len == self.free[pos + 1].offset {
            self.free[pos].len += self.free[pos + 1].len;
            self.free.remove(pos + 1);
        }
        if pos > 0 && self.free[pos - 1].offset + self.free[pos - 1].len == self.free[pos].offset {
            self.free[pos - 1].len += self.free[pos].len;
            self.free.remove(pos);
        }

        if let Some(last) = self.free.last() {
            if last.offset + last.len == self.end {
                self.end = last.offset;
                self.free.pop();
            }
        }
    }

    fn holds(&self, block: &SwapBlock) -> bool {
        let start = block.offset;
        let end = start + block.len as u64;
        end <= self.end
            && !self
                .free
                .iter()
                .any(|range| start < range.offset + range.len && range.offset < end)
    }
}

/// Swap statistics
#[derive(Debug, Clone, Copy, Default)]
pub struct SwapStats {
    pub swap_outs: u64,
    pub swap_ins: u64,
    pub bytes_out: u64,
    pub peak_used: u64,
}

/// Set of swap arenas
#[derive(Debug)]
pub struct SwapManager {
    arenas: Vec<SwapArena>,
    capacity: u64,
    backing: SwapBacking,
    max_arenas: Option<usize>,
    stats: SwapStats,
}

impl SwapManager {
    pub fn new(capacity: u64, backing: SwapBacking, max_arenas: Option<usize>) -> Self {
        Self {
            arenas: Vec::new(),
            capacity: capacity.max(1),
            backing,
            max_arenas,
            stats: SwapStats::default(),
        }
    }

    /// Reserve `len` bytes in the first arena with room, creating one if needed
    pub fn alloc(&mut self, len: usize) -> Result<SwapBlock, SwapError> {
        let wanted = len as u64;
        let index = match self.arenas.iter().position(|arena| arena.used + wanted <= self.capacity) {
            Some(index) => index,
            None => self.create_arena(len)?,
        };

        let offset = self.arenas[index].reserve(wanted);
        let total = self.total_used();
        self.stats.peak_used = self.stats.peak_used.max(total);

        Ok(SwapBlock { arena: index as u32, offset, len: len as u32 })
    }

    fn create_arena(&mut self, requested: usize) -> Result<usize, SwapError> {
        if self.max_arenas.is_some_and(|max| self.arenas.len() >= max) {
            return Err(SwapError::Exhausted { requested, capacity: self.capacity });
        }

        let store: Box<dyn BackingStore> = match self.backing {
            SwapBacking::Memory => Box::new(MemoryStore::new()),
            SwapBacking::File => Box::new(FileStore::new()?),
        };
        self.arenas.push(SwapArena::new(store));

        tracing::debug!("Created swap arena {} ({:?})", self.arenas.len() - 1, self.backing);
        Ok(self.arenas.len() - 1)
    }

    /// Return a block's bytes to its arena
    pub fn free(&mut self, block: SwapBlock) {
        let arena = self.arena_mut(&block, "free");
        arena.release(block.offset, block.len as u64);
    }

    /// Copy `bytes` into the block
    pub fn swap_out(&mut self, block: SwapBlock, bytes: &[u8]) -> Result<(), SwapError> {
        assert_eq!(bytes.len(), block.len as usize, "swap_out length mismatch");
        let arena = self.arena_mut(&block, "swap_out");
        arena.store.write_at(block.offset, bytes)?;

        self.stats.swap_outs += 1;
        self.stats.bytes_out += bytes.len() as u64;
        Ok(())
    }

    /// Copy the block's bytes into `buf`
    pub fn swap_in(&mut self, block: SwapBlock, buf: &mut [u8]) -> Result<(), SwapError> {
        assert_eq!(buf.len(), block.len as usize, "swap_in length mismatch");
        let arena = self.arena_mut(&block, "swap_in");
        arena.store.read_at(block.offset, buf)?;

        self.stats.swap_ins += 1;
        Ok(())
    }

    fn arena_mut(&mut self, block: &SwapBlock, op: &str) -> &mut SwapArena {
        match self.arenas.get_mut(block.arena as usize) {
            Some(arena) if arena.holds(block) => arena,
            _ => panic!("{op} on a swap block that does not exist: {block:?}"),
        }
    }

    pub fn arena_count(&self) -> usize {
        self.arenas.len()
    }

    /// Bytes held by live blocks in one arena
    pub fn arena_used(&self, index: usize) -> u64 {
        self.arenas.get(index).map_or(0, |arena| arena.used)
    }

    /// Bytes held by live blocks across every arena
    pub fn total_used(&self) -> u64 {
        self.arenas.iter().map(|arena| arena.used).sum()
    }

    pub fn stats(&self) -> &SwapStats {
        &self.stats
    }
}
