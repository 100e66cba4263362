pub mod codec;
pub mod global;

pub use codec::{DecodeError, EncodeError};
pub use global::{BusError, BusResult};
