// src/core/protocol/mod.rs

pub mod codec;
pub mod record;
pub use codec::{RecordCodec, RecordDecoder, Records};
pub use record::{
    BeginRequestBody, EndRequestBody, ProtocolStatus, Record, RecordKind, Role,
};
