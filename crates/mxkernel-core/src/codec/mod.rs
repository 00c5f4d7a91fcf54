//! Wire codecs: tuple-preserving JSON and opaque value payloads.

pub mod payload;
pub mod tuple_json;

pub use payload::Payload;
