use std::io;

use thiserror::Error;

use super::{DecodeError, EncodeError};

pub type BusResult<T> = Result<T, BusError>;

#[derive(Error, Debug)]
pub enum BusError {
    // ==== System / External ====
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),

    // ==== Topic names ====
    #[error("Invalid topic name: {0}")]
    InvalidTopicName(String),

    #[error("Topic name is reserved for internal use: {0}")]
    ReservedTopicName(String),

    // ==== Registry ====
    #[error("Topic '{topic}' already advertised with type '{existing}', got '{requested}'")]
    TypeConflict {
        topic: String,
        existing: String,
        requested: String,
    },

    #[error("Unknown topic: {0}")]
    UnknownTopic(String),

    // ==== Node lifecycle ====
    #[error("Node '{0}' is already finalized")]
    NodeFinished(String),

    // ==== Request/Response ====
    #[error("Request {id} ('{verb}') timed out after {waited_ms} ms")]
    RequestTimeout {
        id: u64,
        verb: String,
        waited_ms: u64,
    },

    // ==== Codec ====
    #[error("Encode error: {0}")]
    Encode(#[from] EncodeError),

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    // ==== General ====
    #[error("Connection layer error: {0}")]
    Connection(String),

    #[error("Internal error: {0}")]
    Internal(String),
}
