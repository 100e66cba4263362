use thiserror::Error;

/// Ошибка кодирования полезной нагрузки сообщения.
#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("Serialization failed for '{type_name}': {reason}")]
    Serialize { type_name: String, reason: String },

    #[error("Payload too large: {size} bytes (limit {limit})")]
    PayloadTooLarge { size: usize, limit: usize },
}

/// Ошибка декодирования полезной нагрузки сообщения.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Deserialization failed for '{type_name}': {reason}")]
    Deserialize { type_name: String, reason: String },

    #[error("Type mismatch: envelope carries '{actual}', handler expects '{expected}'")]
    TypeMismatch { expected: String, actual: String },

    #[error("Empty payload for '{0}'")]
    EmptyPayload(String),
}
