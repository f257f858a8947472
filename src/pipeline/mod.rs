pub mod bounded;

pub use bounded::{BlockingBehavior, BoundedQueue};
