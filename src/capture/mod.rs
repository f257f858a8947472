pub mod buffer;
pub mod frame;
pub mod input;
pub mod memory;

pub use buffer::{Pixels, VideoBuf, VideoBuffers};
pub use frame::{ImageSpec, PixelFormat, RawImage};
pub use input::{CaptureSync, FrameState, InputFrame, VideoInput};
pub use memory::MemoryCamera;
