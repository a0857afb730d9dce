use thiserror::Error;

pub type Result<T> = std::result::Result<T, KilatError>;

/// Error kinds surfaced by the store. Reads of absent keys are `Ok(None)`,
/// never errors; a failed mutation leaves slots and journal untouched.
#[derive(Debug, Error)]
pub enum KilatError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Bad magic, incompatible format version, unknown algorithm id, or a
    /// truncated/corrupt serialized payload.
    #[error("invalid format: {0}")]
    InvalidFormat(&'static str),

    #[error("store is read-only")]
    Readonly,

    #[error("value of {0} bytes does not fit a slot")]
    ValueTooLarge(usize),

    /// The probe window was exhausted without a claimable slot.
    #[error("table full")]
    TableFull,

    #[error("key not found")]
    KeyNotFound,

    #[error("slot index {0} out of bounds")]
    OutOfBounds(u64),

    #[error("optimization failed: {0}")]
    OptimizationFailed(&'static str),

    #[error("journal error: {0}")]
    Journal(std::io::Error),
}
