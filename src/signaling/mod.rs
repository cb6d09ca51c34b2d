pub mod channel;
pub mod events;

pub use channel::SignalingChannel;
pub use events::{ClientEvent, ServerEvent, SignalingHandle};
