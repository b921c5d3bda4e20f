//! The bounded, preallocated pool of sample chunks that a driver callback fills and a scheduler
//! consumes.
//!
//! Two [`digitizer_sync::spsc_ring`] rings carry chunk indices (not the chunks themselves,
//! which aren't `Copy`) between the two sides: a free ring the driver side drains to claim a
//! chunk to fill, and a filled ring the consumer side drains to take a chunk the driver has
//! published. A single mutex guards both ring halves plus the ready/error signal; contention is
//! negligible since each ring is touched by exactly one thread in steady state, and the
//! bottleneck is the hardware driver, not this bookkeeping.

use std::cell::UnsafeCell;
use std::sync::{Arc, Condvar, Mutex};

use digitizer_sync::spsc_ring::{create_ring, RingReader, RingWriter};

use crate::chunk::{ChunkLayout, DataChunk};
use crate::error::{ErrorKind, Result};

/// Hard upper bound on the number of chunks a pool can hold, matching the original driver's
/// `MAX_NR_BUFFERS`.
pub const MAX_CHUNKS: usize = 8192;

struct PoolState {
    free_reader: RingReader<u32>,
    free_writer: RingWriter<u32>,
    filled_reader: RingReader<u32>,
    filled_writer: RingWriter<u32>,
    error: Option<ErrorKind>,
}

struct Shared {
    storage: Box<[UnsafeCell<DataChunk>]>,
    state: Mutex<PoolState>,
    cv: Condvar,
}

// SAFETY: a given index lives in at most one ring at a time, so the `UnsafeCell<DataChunk>` it
// names is accessed by at most one side (driver or consumer) at any point in time; the rings
// themselves only ever move indices, never chunks.
unsafe impl Sync for Shared {}

/// Creates a pool of `nr_buffers` chunks, each shaped by `layout`, and returns its two halves.
///
/// `nr_buffers` is capped at [`MAX_CHUNKS`]; a request for more is truncated with a logged
/// warning rather than rejected, matching the original's `app_buffer_t::initialize`.
pub fn new_chunk_pool(layout: ChunkLayout, nr_buffers: usize) -> (ChunkWriter, ChunkReader) {
    let nr_buffers = if nr_buffers > MAX_CHUNKS {
        log::warn!("requested {nr_buffers} chunks, capping at {MAX_CHUNKS}");
        MAX_CHUNKS
    } else {
        nr_buffers.max(1)
    };

    let storage: Box<[UnsafeCell<DataChunk>]> = (0..nr_buffers)
        .map(|_| UnsafeCell::new(DataChunk::new(layout)))
        .collect();

    let (free_reader, mut free_writer) = create_ring::<u32>(nr_buffers);
    let (filled_reader, filled_writer) = create_ring::<u32>(nr_buffers);

    for idx in 0..nr_buffers as u32 {
        assert!(free_writer.write_one(idx), "fresh ring must accept its own capacity");
    }

    let shared = Arc::new(Shared {
        storage,
        state: Mutex::new(PoolState {
            free_reader,
            free_writer,
            filled_reader,
            filled_writer,
            error: None,
        }),
        cv: Condvar::new(),
    });

    (
        ChunkWriter {
            shared: shared.clone(),
        },
        ChunkReader { shared },
    )
}

/// The driver-facing side of a chunk pool: claims free chunks, fills them, publishes them.
pub struct ChunkWriter {
    shared: Arc<Shared>,
}

impl ChunkWriter {
    /// Claims a free chunk to fill, or `None` if the pool is exhausted (the consumer side is
    /// falling behind). Callers should bump a loss counter and continue rather than block.
    pub fn take_free(&self) -> Option<FreeChunk> {
        let mut state = self.shared.state.lock().unwrap();
        let idx = state.free_reader.read_one()?;
        Some(FreeChunk {
            shared: self.shared.clone(),
            idx,
            published: false,
        })
    }

    /// Communicates a driver-side error to whatever is waiting on [`ChunkReader::wait_ready`].
    pub fn post_error(&self, err: ErrorKind) {
        let mut state = self.shared.state.lock().unwrap();
        state.error = Some(err);
        self.shared.cv.notify_all();
    }
}

impl Clone for ChunkWriter {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

/// A chunk claimed from the free ring, exclusively owned by the driver side until published or
/// dropped. Owns an `Arc` clone of the pool's shared state (rather than borrowing it) so it can
/// be carried across work-step calls, e.g. while a streaming engine waits on a timing message.
pub struct FreeChunk {
    shared: Arc<Shared>,
    idx: u32,
    published: bool,
}

impl FreeChunk {
    pub fn chunk_mut(&mut self) -> &mut DataChunk {
        // SAFETY: see `Shared`'s `Sync` impl; this index isn't reachable from anywhere else
        // while this `FreeChunk` is alive.
        unsafe { &mut *self.shared.storage[self.idx as usize].get() }
    }

    /// Publishes the filled chunk to the consumer side, waking anyone blocked in
    /// [`ChunkReader::wait_ready`].
    pub fn publish(mut self) {
        let mut state = self.shared.state.lock().unwrap();
        let ok = state.filled_writer.write_one(self.idx);
        debug_assert!(ok, "filled ring has the same capacity as the chunk count");
        drop(state);
        self.shared.cv.notify_all();
        self.published = true;
    }
}

impl Drop for FreeChunk {
    fn drop(&mut self) {
        if self.published {
            return;
        }
        // Not published (e.g. the driver call that would have filled this chunk errored out
        // before producing data): give the slot straight back to the free ring instead of
        // losing it.
        let mut state = self.shared.state.lock().unwrap();
        let ok = state.free_writer.write_one(self.idx);
        debug_assert!(ok, "free ring has the same capacity as the chunk count");
    }
}

/// The consumer-facing side of a chunk pool: waits for filled chunks and processes them.
pub struct ChunkReader {
    shared: Arc<Shared>,
}

impl ChunkReader {
    /// Blocks until a filled chunk is available or the driver side posts an error.
    ///
    /// `Stopped` is sticky: once posted it is never cleared, so every subsequent call keeps
    /// returning it rather than blocking forever on a condvar nothing will ever notify again
    /// (the producer side is already torn down by the time `Stopped` is posted). Other error
    /// kinds (e.g. `Watchdog`) are one-shot and taken on read, since the caller is expected to
    /// handle them and resume normal operation.
    pub fn wait_ready(&self) -> Result<()> {
        let mut state = self.shared.state.lock().unwrap();
        loop {
            match &state.error {
                Some(ErrorKind::Stopped) => return Err(ErrorKind::Stopped),
                Some(_) => return Err(state.error.take().unwrap()),
                None => {}
            }
            if state.filled_reader.available() > 0 {
                return Ok(());
            }
            state = self.shared.cv.wait(state).map_err(|_| ErrorKind::Interrupted)?;
        }
    }

    /// Takes the oldest filled chunk, if one is ready. Does not block; call
    /// [`Self::wait_ready`] first.
    pub fn take_filled(&self) -> Option<ChunkHandle> {
        let mut state = self.shared.state.lock().unwrap();
        let idx = state.filled_reader.read_one()?;
        Some(ChunkHandle {
            shared: self.shared.clone(),
            idx,
        })
    }
}

impl Clone for ChunkReader {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

/// A chunk claimed from the filled ring. Returned to the free ring automatically on drop,
/// mirroring the original's `data_chunk_ptr` custom deleter. Owns an `Arc` clone of the pool's
/// shared state so a work step can carry it across calls (§4.E: "hold the last pending
/// chunk+trigger-offsets across calls") without borrowing from the `ChunkReader`.
pub struct ChunkHandle {
    shared: Arc<Shared>,
    idx: u32,
}

impl ChunkHandle {
    pub fn chunk(&self) -> &DataChunk {
        // SAFETY: see `Shared`'s `Sync` impl.
        unsafe { &*self.shared.storage[self.idx as usize].get() }
    }
}

impl Drop for ChunkHandle {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock().unwrap();
        let ok = state.free_writer.write_one(self.idx);
        debug_assert!(ok, "free ring has the same capacity as the chunk count");
        drop(state);
        self.shared.cv.notify_all();
    }
}
