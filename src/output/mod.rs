pub mod frame;
pub mod memory;

pub use frame::{OutputFrame, VideoOutput};
pub use memory::MemoryGadget;
