//! Verification error types.

/// Why a transaction or block failed structural or signature verification.
///
/// Every variant is recoverable: the offending object is rejected and the
/// reason surfaced, nothing else happens.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VerifyError {
    #[error("counter must be at least 1")]
    ZeroCounter,

    #[error("{0} must have at least 1 output")]
    EmptyOutputs(&'static str),

    #[error("output amount must be at least 1")]
    ZeroOutputAmount,

    #[error("{0} must not be empty")]
    EmptyName(&'static str),

    #[error("{0} must be at least 1")]
    ZeroCost(&'static str),

    #[error("metadata term '{0}' uses the reserved URI prefix")]
    ReservedUriPrefix(String),

    #[error("malformed public key: {0}")]
    BadPublicKey(String),

    #[error("malformed signature: {0}")]
    BadSignature(String),

    #[error("signature doesn't verify against input key")]
    SignatureMismatch,

    #[error("block hash doesn't match its contents")]
    HashMismatch,

    #[error("block hash doesn't satisfy its difficulty")]
    DifficultyNotMet,

    #[error("{0} array is present but empty")]
    EmptyTxArray(&'static str),

    #[error("couldn't verify a {kind}: {source}")]
    Tx {
        kind: &'static str,
        #[source]
        source: Box<VerifyError>,
    },

    #[error("requested {requested} witnesses but only {available} brokers are registered")]
    NotEnoughBrokers { requested: u64, available: u64 },
}

impl VerifyError {
    /// Wrap a member failure with the transaction kind it came from.
    pub fn in_tx(self, kind: &'static str) -> VerifyError {
        VerifyError::Tx {
            kind,
            source: Box::new(self),
        }
    }
}
