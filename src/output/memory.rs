//! In-memory output device streaming frames onto a host-link channel

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use bytes::Bytes;
use flume::Sender;
use tracing::{debug, info, instrument, warn};

use super::frame::VideoOutput;
use crate::capture::buffer::{Descriptor, SlotLedger};
use crate::capture::{ImageSpec, RawImage, VideoBuffers};
use crate::error::{Error, Result};
use crate::pipeline::{BlockingBehavior, BoundedQueue};

struct Shared {
    spec: ImageSpec,
    bufs: VideoBuffers,
    /// Blank slots ready for software
    free: BoundedQueue<Descriptor>,
    /// Slots in `free`, not counting the stop token
    free_slots: AtomicUsize,
    /// Filled slots waiting for the transmit thread
    sending: BoundedQueue<Descriptor>,
    ledger: SlotLedger,
    connected: AtomicBool,
    transmitted: AtomicU64,
    link: Option<Sender<Bytes>>,
    idle: (Mutex<()>, Condvar),
}

impl Shared {
    fn recycle(&self, index: usize) -> Result<()> {
        if let Some(buf) = self.bufs.get(index) {
            buf.set_bytes_used(0);
        }
        // Counted first so a racing `get` never takes the count below zero
        self.free_slots.fetch_add(1, Ordering::AcqRel);
        if let Err(e) = self.free.push(Descriptor::Slot(index)) {
            self.free_slots.fetch_sub(1, Ordering::AcqRel);
            return Err(e);
        }
        let _guard = self.idle.0.lock().unwrap_or_else(PoisonError::into_inner);
        self.idle.1.notify_all();
        Ok(())
    }
}

/// Output device whose "host link" is a flume channel of encoded frames.
///
/// A transmit thread drains the send queue, publishes each frame as
/// [`Bytes`] and recycles the slot. The send queue holds at most
/// `send_depth` frames; sending into a full queue is an [`Error::Overflow`].
pub struct MemoryGadget {
    shared: Arc<Shared>,
    tx: Option<JoinHandle<()>>,
}

impl MemoryGadget {
    pub fn new(
        spec: ImageSpec,
        buffer_count: usize,
        send_depth: usize,
        when_empty: BlockingBehavior,
        link: Option<Sender<Bytes>>,
    ) -> Result<Self> {
        info!(
            "Initializing memory gadget: {}x{} {:?} with {} buffers",
            spec.width, spec.height, spec.format, buffer_count
        );
        let bufs = VideoBuffers::new(buffer_count, spec.frame_size())?;
        let free = BoundedQueue::new(buffer_count + 1, BlockingBehavior::Block, when_empty);
        for i in 0..buffer_count {
            free.push(Descriptor::Slot(i))?;
        }

        let shared = Arc::new(Shared {
            spec,
            bufs,
            free,
            free_slots: AtomicUsize::new(buffer_count),
            sending: BoundedQueue::new(
                send_depth.max(1),
                BlockingBehavior::Fail,
                BlockingBehavior::Block,
            ),
            ledger: SlotLedger::new(buffer_count),
            connected: AtomicBool::new(true),
            transmitted: AtomicU64::new(0),
            link,
            idle: (Mutex::new(()), Condvar::new()),
        });

        let tx = {
            let shared = shared.clone();
            std::thread::Builder::new()
                .name("framelink-tx".into())
                .spawn(move || transmit_loop(&shared))?
        };

        Ok(Self {
            shared,
            tx: Some(tx),
        })
    }

    /// Frames handed to the host link so far
    pub fn transmitted(&self) -> u64 {
        self.shared.transmitted.load(Ordering::Relaxed)
    }

    /// Slots currently owned by software
    pub fn held(&self) -> usize {
        self.shared.ledger.held()
    }

    /// Blank slots ready for `get`
    pub fn available(&self) -> usize {
        self.shared.free_slots.load(Ordering::Acquire)
    }

    /// Drop the host link; blocked and future `get` calls fail
    #[instrument(skip(self))]
    pub fn disconnect(&self) {
        if self.shared.connected.swap(false, Ordering::AcqRel) {
            info!("Host link disconnected");
            let _ = self.shared.free.push(Descriptor::Stop);
        }
    }

    /// Wait until every slot is back in the free pool
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let (lock, cvar) = &self.shared.idle;
        let mut guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if self.shared.ledger.held() == 0
                && self.shared.sending.filled_size() == 0
                && self.available() >= self.shared.bufs.len()
            {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            guard = cvar
                .wait_timeout(guard, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }
}

fn transmit_loop(shared: &Shared) {
    loop {
        let index = match shared.sending.pop() {
            Ok(Descriptor::Slot(i)) => i,
            Ok(Descriptor::Stop) | Err(_) => break,
        };

        if shared.connected.load(Ordering::Acquire) {
            if let (Some(link), Some(buf)) = (&shared.link, shared.bufs.get(index)) {
                let frame = Bytes::copy_from_slice(&buf.pixels(buf.bytes_used()));
                if link.send(frame).is_err() {
                    debug!("Host link receiver gone, dropping frame");
                }
            }
            shared.transmitted.fetch_add(1, Ordering::Relaxed);
        }

        if let Err(e) = shared.recycle(index) {
            warn!("Failed to recycle output slot {}: {}", index, e);
        }
    }
    debug!("Transmit thread exiting");
}

impl VideoOutput for MemoryGadget {
    fn spec(&self) -> ImageSpec {
        self.shared.spec
    }

    fn get(&self) -> Result<RawImage> {
        if !self.shared.connected.load(Ordering::Acquire) {
            return Err(Error::ResourceExhausted("host link disconnected".into()));
        }
        let index = match self.shared.free.pop() {
            Ok(Descriptor::Slot(i)) => {
                self.shared.free_slots.fetch_sub(1, Ordering::AcqRel);
                i
            }
            Ok(Descriptor::Stop) => {
                let _ = self.shared.free.push(Descriptor::Stop);
                return Err(Error::ResourceExhausted("host link disconnected".into()));
            }
            Err(Error::QueueStarved) => {
                return Err(Error::ResourceExhausted(
                    "all buffers queued for transmission".into(),
                ))
            }
            Err(e) => return Err(e),
        };
        self.shared.ledger.take(index)?;
        let buf = self
            .shared
            .bufs
            .get(index)
            .ok_or(Error::ProtocolViolation("slot index out of range"))?;
        Ok(RawImage::new(buf.clone(), self.shared.spec))
    }

    fn send(&self, img: &RawImage) -> Result<()> {
        if !self.shared.ledger.is_held(img.index()) {
            return Err(Error::ProtocolViolation("sending a slot that was not issued"));
        }
        // Released before queueing so the transmit thread never recycles a held slot
        self.shared.ledger.give(img.index())?;
        match self.shared.sending.push(Descriptor::Slot(img.index())) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.shared.ledger.take(img.index())?;
                match e {
                    Error::QueueSaturated => Err(Error::Overflow),
                    e => Err(e),
                }
            }
        }
    }

    fn discard(&self, img: &RawImage) -> Result<()> {
        self.shared.ledger.give(img.index())?;
        self.shared.recycle(img.index())
    }
}

impl Drop for MemoryGadget {
    fn drop(&mut self) {
        self.disconnect();
        // Exclusive access here: nothing else can be pushing
        self.shared.sending.clear();
        if self.shared.sending.push(Descriptor::Stop).is_err() {
            warn!("Failed to stop transmit thread");
            return;
        }
        if let Some(tx) = self.tx.take() {
            if tx.join().is_err() {
                warn!("Transmit thread panicked");
            }
        }
    }
}
