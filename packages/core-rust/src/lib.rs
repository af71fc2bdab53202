//! hostbridge core: the message value type, its wire codec, and the clock
//! used to compute expiration deadlines.

pub mod clock;
pub mod codec;
pub mod message;

pub use clock::{ClockSource, ManualClock, SystemClock};
pub use codec::{CodecError, WireFormat};
pub use message::{Message, MessageHeader, MessageKind};
