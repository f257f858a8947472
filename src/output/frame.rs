//! Output-side frame handle

use std::sync::Arc;

use tracing::{debug, warn};

use crate::capture::{FrameState, ImageSpec, RawImage};
use crate::error::{Error, Result};

/// An output device that streams filled pool slots to the host
pub trait VideoOutput: Send + Sync {
    /// Format of the images this device sends
    fn spec(&self) -> ImageSpec;

    /// Block until a blank slot is free and return it. Contents are not cleared.
    ///
    /// Fails with [`Error::ResourceExhausted`] when no slot will become free.
    fn get(&self) -> Result<RawImage>;

    /// Queue a filled slot for transmission.
    ///
    /// Fails with [`Error::Overflow`] while the transmission path has not yet
    /// consumed earlier buffers; the slot then stays with the caller.
    fn send(&self, img: &RawImage) -> Result<()>;

    /// Give a slot back without transmitting it
    fn discard(&self, img: &RawImage) -> Result<()>;
}

enum State {
    Idle,
    Fetched(RawImage),
    Released,
}

/// Single-use right to one blank output buffer.
///
/// Every successful `get` must be paired with exactly one `send`. A handle
/// dropped after `get` but before `send` sends on the way out; if even that
/// fails the slot is discarded back into the pool.
pub struct OutputFrame {
    gadget: Arc<dyn VideoOutput>,
    state: State,
}

impl OutputFrame {
    pub fn new(gadget: Arc<dyn VideoOutput>) -> Self {
        Self {
            gadget,
            state: State::Idle,
        }
    }

    pub fn state(&self) -> FrameState {
        match self.state {
            State::Idle => FrameState::Idle,
            State::Fetched(_) => FrameState::Fetched,
            State::Released => FrameState::Released,
        }
    }

    /// Get the blank image to fill, waiting for a free buffer if needed
    pub fn get(&mut self) -> Result<&RawImage> {
        if let State::Idle = self.state {
            let img = self.gadget.get()?;
            self.state = State::Fetched(img);
        }
        match &self.state {
            State::Fetched(img) => Ok(img),
            _ => Err(Error::ProtocolViolation("get() after send()")),
        }
    }

    /// Hand the filled image to the device for transmission
    pub fn send(&mut self) -> Result<()> {
        let img = match &self.state {
            State::Fetched(img) => img,
            State::Idle => return Err(Error::ProtocolViolation("send() without get()")),
            State::Released => return Err(Error::ProtocolViolation("send() called twice")),
        };
        if img.bytes_used() == 0 {
            img.set_bytes_used(img.spec.frame_size());
        }
        self.gadget.send(img)?;
        debug!("Queued output slot {}", img.index());
        self.state = State::Released;
        Ok(())
    }
}

impl Drop for OutputFrame {
    fn drop(&mut self) {
        if !matches!(self.state, State::Fetched(_)) {
            return;
        }
        if let Err(e) = self.send() {
            warn!("Output send on drop failed: {}", e);
            if let State::Fetched(img) = std::mem::replace(&mut self.state, State::Released) {
                if let Err(e) = self.gadget.discard(&img) {
                    warn!("Failed to discard output slot {}: {}", img.index(), e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{PixelFormat, VideoBuffers};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct MockGadget {
        spec: ImageSpec,
        bufs: VideoBuffers,
        gets: AtomicUsize,
        sends: AtomicUsize,
        discards: AtomicUsize,
        congested: AtomicBool,
    }

    impl MockGadget {
        fn new() -> Arc<Self> {
            let spec = ImageSpec {
                width: 4,
                height: 4,
                format: PixelFormat::Grey,
                fps: 10.0,
            };
            Arc::new(Self {
                spec,
                bufs: VideoBuffers::new(1, spec.frame_size()).unwrap(),
                gets: AtomicUsize::new(0),
                sends: AtomicUsize::new(0),
                discards: AtomicUsize::new(0),
                congested: AtomicBool::new(false),
            })
        }

        fn counts(&self) -> (usize, usize, usize) {
            (
                self.gets.load(Ordering::SeqCst),
                self.sends.load(Ordering::SeqCst),
                self.discards.load(Ordering::SeqCst),
            )
        }
    }

    impl VideoOutput for MockGadget {
        fn spec(&self) -> ImageSpec {
            self.spec
        }

        fn get(&self) -> Result<RawImage> {
            self.gets.fetch_add(1, Ordering::SeqCst);
            Ok(RawImage::new(self.bufs.get(0).unwrap().clone(), self.spec))
        }

        fn send(&self, _img: &RawImage) -> Result<()> {
            if self.congested.load(Ordering::SeqCst) {
                return Err(Error::Overflow);
            }
            self.sends.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn discard(&self, _img: &RawImage) -> Result<()> {
            self.discards.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn send_without_get_is_rejected() {
        let gadget = MockGadget::new();
        let mut frame = OutputFrame::new(gadget.clone());
        assert!(matches!(frame.send(), Err(Error::ProtocolViolation(_))));
        drop(frame);
        assert_eq!(gadget.counts(), (0, 0, 0));
    }

    #[test]
    fn second_send_is_rejected() {
        let gadget = MockGadget::new();
        let mut frame = OutputFrame::new(gadget.clone());
        frame.get().unwrap().pixels_mut().fill(9);
        frame.send().unwrap();
        assert!(matches!(frame.send(), Err(Error::ProtocolViolation(_))));
        drop(frame);
        assert_eq!(gadget.counts(), (1, 1, 0));
    }

    #[test]
    fn send_fills_in_bytes_used() {
        let gadget = MockGadget::new();
        let mut frame = OutputFrame::new(gadget.clone());
        let len = frame.get().unwrap().spec.frame_size();
        frame.send().unwrap();
        assert_eq!(gadget.bufs.get(0).unwrap().bytes_used(), len);
    }

    #[test]
    fn get_is_cached_until_send() {
        let gadget = MockGadget::new();
        let mut frame = OutputFrame::new(gadget.clone());
        frame.get().unwrap();
        frame.get().unwrap();
        frame.send().unwrap();
        assert!(matches!(frame.get(), Err(Error::ProtocolViolation(_))));
        assert_eq!(gadget.counts(), (1, 1, 0));
    }

    #[test]
    fn drop_after_get_sends() {
        let gadget = MockGadget::new();
        {
            let mut frame = OutputFrame::new(gadget.clone());
            frame.get().unwrap();
        }
        assert_eq!(gadget.counts(), (1, 1, 0));
    }

    #[test]
    fn overflow_keeps_buffer_and_drop_discards_it() {
        let gadget = MockGadget::new();
        gadget.congested.store(true, Ordering::SeqCst);
        let mut frame = OutputFrame::new(gadget.clone());
        frame.get().unwrap();
        let err = frame.send().unwrap_err();
        assert!(matches!(err, Error::Overflow));
        assert!(err.is_recoverable());
        assert_eq!(frame.state(), FrameState::Fetched);
        drop(frame);
        assert_eq!(gadget.counts(), (1, 0, 1));
    }

    #[test]
    fn overflow_then_retry_succeeds() {
        let gadget = MockGadget::new();
        gadget.congested.store(true, Ordering::SeqCst);
        let mut frame = OutputFrame::new(gadget.clone());
        frame.get().unwrap();
        assert!(frame.send().is_err());
        gadget.congested.store(false, Ordering::SeqCst);
        frame.send().unwrap();
        drop(frame);
        assert_eq!(gadget.counts(), (1, 1, 0));
    }
}
