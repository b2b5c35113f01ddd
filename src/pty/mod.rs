pub mod bridge;
pub mod control;
pub mod process;

pub use bridge::PtyBridge;
pub use control::{InboundFrame, OutboundFrame, ResizeMessage};
