use chrono::{DateTime, Utc};
use std::fmt;

/// Status of a threshold signing on BandChain.
///
/// `Waiting` moves to `Success` or `Fallen` exactly once; both are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SigningStatus {
    Unspecified,
    Waiting,
    Success,
    Fallen,
}

impl SigningStatus {
    /// Parse the protobuf enum name used in BandChain JSON responses
    pub fn from_proto_name(name: &str) -> Self {
        match name {
            "SIGNING_STATUS_WAITING" => SigningStatus::Waiting,
            "SIGNING_STATUS_SUCCESS" => SigningStatus::Success,
            "SIGNING_STATUS_FALLEN" => SigningStatus::Fallen,
            _ => SigningStatus::Unspecified,
        }
    }
}

impl fmt::Display for SigningStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SigningStatus::Unspecified => "unspecified",
            SigningStatus::Waiting => "waiting",
            SigningStatus::Success => "success",
            SigningStatus::Fallen => "fallen",
        };
        f.write_str(name)
    }
}

/// Group signature in the form the EVM router verifies
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvmSignature {
    /// 20-byte address derived from the nonce commitment R
    pub r_address: Vec<u8>,
    /// 32-byte Schnorr signature scalar
    pub signature: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signing {
    pub id: u64,
    pub message: Vec<u8>,
    pub evm_signature: Option<EvmSignature>,
    pub status: SigningStatus,
    pub created_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_from_proto_name() {
        assert_eq!(
            SigningStatus::from_proto_name("SIGNING_STATUS_SUCCESS"),
            SigningStatus::Success
        );
        assert_eq!(
            SigningStatus::from_proto_name("SIGNING_STATUS_WAITING"),
            SigningStatus::Waiting
        );
        assert_eq!(
            SigningStatus::from_proto_name("SIGNING_STATUS_FALLEN"),
            SigningStatus::Fallen
        );
        assert_eq!(
            SigningStatus::from_proto_name("SIGNING_STATUS_UNSPECIFIED"),
            SigningStatus::Unspecified
        );
        assert_eq!(SigningStatus::from_proto_name("garbage"), SigningStatus::Unspecified);
    }
}
