//! Memory-mapped frame buffers shared between the (simulated) DMA engine and software

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{fence, AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use memmap2::MmapMut;

use crate::error::{Error, Result};

/// One slot of a device buffer pool
#[derive(Debug)]
pub struct VideoBuf {
    index: usize,
    length: usize,
    map: Mutex<MmapMut>,
    bytes_used: AtomicUsize,
    in_flight: AtomicBool,
}

impl VideoBuf {
    /// Map `length` bytes, rounded up to whole pages
    pub fn new(index: usize, length: usize) -> Result<Self> {
        let page = page_size::get();
        let mapped = length.max(1).div_ceil(page) * page;
        let map = MmapMut::map_anon(mapped)?;
        Ok(Self {
            index,
            length,
            map: Mutex::new(map),
            bytes_used: AtomicUsize::new(0),
            in_flight: AtomicBool::new(false),
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn length(&self) -> usize {
        self.length
    }

    pub fn bytes_used(&self) -> usize {
        self.bytes_used.load(Ordering::Acquire)
    }

    pub fn set_bytes_used(&self, n: usize) {
        self.bytes_used.store(n.min(self.length), Ordering::Release);
    }

    /// First `len` bytes of the mapping (clamped to the slot length)
    pub fn pixels(&self, len: usize) -> Pixels<'_> {
        Pixels {
            guard: self.map.lock().unwrap_or_else(PoisonError::into_inner),
            len: len.min(self.length),
        }
    }

    /// Mark the slot as being written by hardware
    pub fn begin_dma(&self) {
        self.in_flight.store(true, Ordering::Release);
    }

    pub fn end_dma(&self) {
        self.in_flight.store(false, Ordering::Release);
    }

    /// Wait until hardware has fully settled the slot contents
    pub fn sync(&self) {
        while self.in_flight.load(Ordering::Acquire) {
            std::thread::yield_now();
        }
        fence(Ordering::Acquire);
    }
}

/// Locked access to a slot's pixel memory
pub struct Pixels<'a> {
    guard: MutexGuard<'a, MmapMut>,
    len: usize,
}

impl Deref for Pixels<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.guard[..self.len]
    }
}

impl DerefMut for Pixels<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.guard[..self.len]
    }
}

/// Fixed set of slots allocated once when a device is configured
#[derive(Debug)]
pub struct VideoBuffers {
    bufs: Vec<Arc<VideoBuf>>,
}

impl VideoBuffers {
    pub fn new(count: usize, length: usize) -> Result<Self> {
        let bufs = (0..count)
            .map(|i| VideoBuf::new(i, length).map(Arc::new))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { bufs })
    }

    pub fn get(&self, index: usize) -> Option<&Arc<VideoBuf>> {
        self.bufs.get(index)
    }

    pub fn len(&self) -> usize {
        self.bufs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bufs.is_empty()
    }
}

/// Slot handoff token carried by device queues
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Descriptor {
    Slot(usize),
    /// Wakes a waiter because the device stopped
    Stop,
}

/// Tracks which slots are currently owned by software
#[derive(Debug)]
pub(crate) struct SlotLedger {
    held: Vec<AtomicBool>,
    count: AtomicUsize,
}

impl SlotLedger {
    pub fn new(slots: usize) -> Self {
        Self {
            held: (0..slots).map(|_| AtomicBool::new(false)).collect(),
            count: AtomicUsize::new(0),
        }
    }

    /// Record that software now owns `index`
    pub fn take(&self, index: usize) -> Result<()> {
        let slot = self
            .held
            .get(index)
            .ok_or(Error::ProtocolViolation("slot index out of range"))?;
        if slot.swap(true, Ordering::AcqRel) {
            return Err(Error::ProtocolViolation("slot issued twice"));
        }
        self.count.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Record that software gave `index` back
    pub fn give(&self, index: usize) -> Result<()> {
        let slot = self
            .held
            .get(index)
            .ok_or(Error::ProtocolViolation("slot index out of range"))?;
        if !slot.swap(false, Ordering::AcqRel) {
            return Err(Error::ProtocolViolation("slot returned but not held"));
        }
        self.count.fetch_sub(1, Ordering::AcqRel);
        Ok(())
    }

    pub fn is_held(&self, index: usize) -> bool {
        self.held
            .get(index)
            .is_some_and(|s| s.load(Ordering::Acquire))
    }

    /// Number of slots currently owned by software
    pub fn held(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }
}
