pub mod event_parsing;
pub mod registry;
pub mod types;

pub use registry::{DecodeError, EventDecoderRegistry, RawLog};
pub use types::{DecodedEvent, DecodedValue};
