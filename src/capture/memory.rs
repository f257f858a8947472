//! In-memory capture device with a simulated DMA engine

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use super::buffer::{Descriptor, SlotLedger, VideoBuffers};
use super::frame::{ImageSpec, RawImage};
use super::input::VideoInput;
use crate::error::{Error, Result};
use crate::pipeline::{BlockingBehavior, BoundedQueue};

struct Shared {
    spec: ImageSpec,
    bufs: VideoBuffers,
    /// Slots written by hardware, tagged with the stream session that wrote them
    filled: BoundedQueue<(u64, Descriptor)>,
    /// Slots given back by software, waiting for hardware
    free: BoundedQueue<Descriptor>,
    ledger: SlotLedger,
    streaming: AtomicBool,
    /// Bumped by every `stream_on`
    session: AtomicU64,
    sequence: AtomicU64,
    frame_interval: Option<Duration>,
}

/// Camera whose "sensor" is a thread writing a test pattern into a fixed pool
/// of memory-mapped slots.
///
/// Written slots reach [`VideoInput::get`] in completion order through a
/// bounded queue; returned slots go back to the DMA thread the same way.
/// Slot ownership changes (`get`, `done`, stream start and stop) are
/// serialized on the DMA handle lock, so a restart never loses or
/// duplicates a slot.
pub struct MemoryCamera {
    shared: Arc<Shared>,
    dma: Mutex<Option<JoinHandle<()>>>,
}

impl MemoryCamera {
    /// `when_empty` selects whether `get` waits for a frame or fails right away
    pub fn new(spec: ImageSpec, buffer_count: usize, when_empty: BlockingBehavior) -> Result<Self> {
        info!(
            "Initializing memory camera: {}x{} {:?} with {} buffers",
            spec.width, spec.height, spec.format, buffer_count
        );
        let bufs = VideoBuffers::new(buffer_count, spec.frame_size())?;
        // One extra place for the stop token
        let depth = buffer_count + 1;
        Ok(Self {
            shared: Arc::new(Shared {
                spec,
                filled: BoundedQueue::new(depth, BlockingBehavior::Block, when_empty),
                free: BoundedQueue::new(depth, BlockingBehavior::Block, BlockingBehavior::Block),
                ledger: SlotLedger::new(buffer_count),
                bufs,
                streaming: AtomicBool::new(false),
                session: AtomicU64::new(0),
                sequence: AtomicU64::new(0),
                frame_interval: None,
            }),
            dma: Mutex::new(None),
        })
    }

    /// Pace the DMA thread at the configured frame rate.
    ///
    /// A rate with no representable period (zero, negative, denormal) leaves
    /// the camera unpaced.
    pub fn paced(mut self) -> Self {
        if let Some(shared) = Arc::get_mut(&mut self.shared) {
            shared.frame_interval = Duration::try_from_secs_f32(1.0 / shared.spec.fps).ok();
            if shared.frame_interval.is_none() {
                warn!("Cannot pace capture at {} fps, running unpaced", shared.spec.fps);
            }
        }
        self
    }

    pub fn is_streaming(&self) -> bool {
        self.shared.streaming.load(Ordering::Acquire)
    }

    /// Slots currently owned by software
    pub fn held(&self) -> usize {
        self.shared.ledger.held()
    }

    /// Frames written so far
    pub fn frames_captured(&self) -> u64 {
        self.shared.sequence.load(Ordering::Relaxed)
    }

    fn lock_dma(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.dma.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start capture: every slot not held by software is queued for DMA
    #[instrument(skip(self))]
    pub fn stream_on(&self) -> Result<()> {
        let mut dma = self.lock_dma();
        if dma.is_some() {
            return Ok(());
        }

        let session = self.shared.session.fetch_add(1, Ordering::AcqRel) + 1;
        self.shared.filled.clear();
        self.shared.free.clear();
        for i in 0..self.shared.bufs.len() {
            if !self.shared.ledger.is_held(i) {
                self.shared.free.push(Descriptor::Slot(i))?;
            }
        }
        self.shared.streaming.store(true, Ordering::Release);

        let shared = self.shared.clone();
        *dma = Some(
            std::thread::Builder::new()
                .name("framelink-dma".into())
                .spawn(move || dma_loop(&shared, session))?,
        );
        info!("Capture stream started with {} buffers", self.shared.bufs.len());
        Ok(())
    }

    /// Stop capture and wake anyone blocked in `get`
    #[instrument(skip(self))]
    pub fn stream_off(&self) -> Result<()> {
        let mut dma = self.lock_dma();
        let Some(handle) = dma.take() else {
            return Ok(());
        };

        self.shared.streaming.store(false, Ordering::Release);
        let session = self.shared.session.load(Ordering::Acquire);
        self.shared.free.push(Descriptor::Stop)?;
        self.shared.filled.push((session, Descriptor::Stop))?;
        // Joined under the lock so a restart never overlaps the old DMA thread
        if handle.join().is_err() {
            warn!("DMA thread panicked");
        }
        info!("Capture stream stopped");
        Ok(())
    }
}

fn dma_loop(shared: &Shared, session: u64) {
    loop {
        let index = match shared.free.pop() {
            Ok(Descriptor::Slot(i)) => i,
            Ok(Descriptor::Stop) | Err(_) => break,
        };
        let Some(buf) = shared.bufs.get(index) else {
            continue;
        };

        let seq = shared.sequence.fetch_add(1, Ordering::Relaxed);
        buf.begin_dma();
        {
            let mut px = buf.pixels(shared.spec.frame_size());
            let width = shared.spec.format.stride(shared.spec.width).max(1);
            for (row, line) in px.chunks_mut(width).enumerate() {
                line.fill((seq as usize + row) as u8);
            }
        }
        buf.set_bytes_used(shared.spec.frame_size());
        buf.end_dma();

        if let Some(interval) = shared.frame_interval {
            std::thread::sleep(interval);
        }
        if shared.filled.push((session, Descriptor::Slot(index))).is_err() {
            break;
        }
    }
    debug!("DMA thread exiting");
}

impl VideoInput for MemoryCamera {
    fn spec(&self) -> ImageSpec {
        self.shared.spec
    }

    fn get(&self) -> Result<RawImage> {
        loop {
            if !self.is_streaming() {
                return Err(Error::DeviceNotStreaming);
            }
            let (session, desc) = self.shared.filled.pop()?;

            let _dma = self.lock_dma();
            if session != self.shared.session.load(Ordering::Acquire) {
                // Popped before a restart, which already requeued the slot
                debug!("Dropping {:?} from stream session {}", desc, session);
                continue;
            }
            match desc {
                Descriptor::Slot(index) => {
                    self.shared.ledger.take(index)?;
                    let buf = self
                        .shared
                        .bufs
                        .get(index)
                        .ok_or(Error::ProtocolViolation("slot index out of range"))?;
                    return Ok(RawImage::new(buf.clone(), self.shared.spec));
                }
                Descriptor::Stop => {
                    // Leave the token for any other waiter
                    let _ = self.shared.filled.push((session, Descriptor::Stop));
                    return Err(Error::DeviceNotStreaming);
                }
            }
        }
    }

    fn done(&self, img: &RawImage) -> Result<()> {
        let _dma = self.lock_dma();
        self.shared.ledger.give(img.index())?;
        img.set_bytes_used(0);
        if self.is_streaming() {
            self.shared.free.push(Descriptor::Slot(img.index()))?;
        }
        Ok(())
    }
}

impl Drop for MemoryCamera {
    fn drop(&mut self) {
        if let Err(e) = self.stream_off() {
            warn!("Failed to stop capture stream: {}", e);
        }
    }
}
