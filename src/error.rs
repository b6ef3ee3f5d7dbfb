/// Error types for the secure aggregation protocol
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum AggError {
    /// A membership set shrank below the reconstruction threshold
    #[error("below threshold: {0}")]
    BelowThreshold(String),

    /// Two peers announced identical public keys
    #[error("public key collision: {0}")]
    KeyCollision(String),

    /// The roster broadcast contained fewer clients than the threshold
    #[error("too few clients: {0}")]
    TooFewClients(String),

    /// A client received fewer ciphertexts than the protocol requires
    #[error("too few ciphertexts: {0}")]
    TooFewCiphertexts(String),

    /// The survivor list is shorter than the threshold
    #[error("too few survivors: {0}")]
    TooFewSurvivors(String),

    /// A membership set referenced a client outside the local view
    #[error("membership violation: {0}")]
    MembershipViolation(String),

    /// Decrypted share material carried mismatched routing metadata
    #[error("misdirected ciphertext: {0}")]
    CiphertextMisdirected(String),

    /// AES-GCM tag verification failed
    #[error("decryption failed: {0}")]
    DecryptionFailed(String),

    /// Shamir recovery produced too few shares or unusable bytes
    #[error("share reconstruction failed: {0}")]
    ReconstructionFailed(String),

    /// Cryptographic operation failed
    #[error("cryptographic error: {0}")]
    CryptoError(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    SerializationError(String),

    /// Invalid parameter provided (e.g., threshold larger than group size)
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// A round method was invoked out of order
    #[error("protocol order violation: {0}")]
    ProtocolViolation(String),
}

// Convert from bincode errors
impl From<bincode::Error> for AggError {
    fn from(err: bincode::Error) -> Self {
        AggError::SerializationError(err.to_string())
    }
}
