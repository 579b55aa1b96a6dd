pub mod channel;
pub mod conversation;
pub mod message;

pub use channel::*;
pub use conversation::*;
pub use message::*;
