//! Capture-side frame handle

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::frame::{ImageSpec, RawImage};
use crate::error::{Error, Result};

/// A capture device that fills pool slots by DMA and hands them to software
pub trait VideoInput: Send + Sync {
    /// Format of the images this device produces
    fn spec(&self) -> ImageSpec;

    /// Block until hardware has finished writing a slot and return it.
    ///
    /// Fails with [`Error::DeviceNotStreaming`] when capture is stopped,
    /// including while a caller is waiting.
    fn get(&self) -> Result<RawImage>;

    /// Give a slot obtained from [`VideoInput::get`] back for re-capture
    fn done(&self, img: &RawImage) -> Result<()>;
}

/// How long `InputFrame::get` waits for the slot to settle after DMA
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureSync {
    /// Wait until hardware has fully settled the slot
    #[default]
    Settled,
    /// Return as soon as the slot is nominally ready
    Immediate,
}

/// Where a frame handle is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    Idle,
    Fetched,
    Released,
}

enum State {
    Idle,
    Fetched(RawImage),
    Released,
}

impl State {
    fn kind(&self) -> FrameState {
        match self {
            State::Idle => FrameState::Idle,
            State::Fetched(_) => FrameState::Fetched,
            State::Released => FrameState::Released,
        }
    }

    fn image(&self) -> Option<&RawImage> {
        match self {
            State::Fetched(img) => Some(img),
            _ => None,
        }
    }
}

/// Single-use right to one captured frame.
///
/// `get` blocks until the camera delivers a slot and then keeps returning
/// that same image. `done` hands the slot back for re-capture; if it has not
/// been called when the handle is dropped, the drop does it. A handle whose
/// `get` was never called touches nothing on drop.
pub struct InputFrame {
    camera: Arc<dyn VideoInput>,
    turbo: bool,
    sync_hint: CaptureSync,
    state: State,
}

impl InputFrame {
    /// `turbo` skips the completeness check on delivered slots
    pub fn new(camera: Arc<dyn VideoInput>, turbo: bool) -> Self {
        Self {
            camera,
            turbo,
            sync_hint: CaptureSync::default(),
            state: State::Idle,
        }
    }

    /// Record the pipeline's configured sync mode for modules that defer to it
    pub fn with_sync_hint(mut self, sync: CaptureSync) -> Self {
        self.sync_hint = sync;
        self
    }

    pub fn sync_hint(&self) -> CaptureSync {
        self.sync_hint
    }

    pub fn state(&self) -> FrameState {
        self.state.kind()
    }

    /// Get the captured image, waiting for the camera if needed
    pub fn get(&mut self, sync: CaptureSync) -> Result<&RawImage> {
        match self.state {
            State::Fetched(_) => {}
            State::Released => return Err(Error::ProtocolViolation("get() after done()")),
            State::Idle => {
                let img = self.fetch(sync)?;
                self.state = State::Fetched(img);
            }
        }
        self.state
            .image()
            .ok_or(Error::ProtocolViolation("frame not fetched"))
    }

    fn fetch(&self, sync: CaptureSync) -> Result<RawImage> {
        let img = self.camera.get()?;
        if sync == CaptureSync::Settled {
            img.buf().sync();
        }
        if !self.turbo && !img.is_complete() {
            let err = Error::InvalidFrame {
                index: img.index(),
                reason: format!(
                    "{} bytes captured, expected {}",
                    img.bytes_used(),
                    img.spec.frame_size()
                ),
            };
            // The slot never reached the caller; hand it straight back
            if let Err(e) = self.camera.done(&img) {
                warn!("Failed to return rejected slot {}: {}", img.index(), e);
            }
            return Err(err);
        }
        Ok(img)
    }

    /// Return the slot to the camera. No-op unless `get` succeeded and `done` has not run yet.
    pub fn done(&mut self) -> Result<()> {
        match std::mem::replace(&mut self.state, State::Released) {
            State::Fetched(img) => {
                debug!("Returning capture slot {}", img.index());
                self.camera.done(&img)
            }
            other => {
                self.state = other;
                Ok(())
            }
        }
    }
}

impl Drop for InputFrame {
    fn drop(&mut self) {
        if let Err(e) = self.done() {
            warn!("Capture slot release on drop failed: {}", e);
        }
    }
}
