mod messages;

pub use messages::{
    decode_payload, encode_payload, ChunkAck, ClientMessage, ServerMessage, SessionEvent,
};
