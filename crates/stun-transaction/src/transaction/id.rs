use std::fmt;

use rand::RngCore;

use crate::error::{Error, Result};

/// Width of a STUN transaction ID in bytes (96 bits, RFC 5389 Section 6).
pub const TRANSACTION_ID_LEN: usize = 12;

/// Uniquely identifies a STUN transaction.
///
/// A request and every response to it carry the same ID. Two transactions
/// with equal IDs are treated as the same logical exchange, which is what the
/// client registry uses to match responses and what the server registry uses
/// to recognize retransmitted requests.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransactionId([u8; TRANSACTION_ID_LEN]);

impl TransactionId {
    /// Creates an ID from raw bytes.
    pub fn new(bytes: [u8; TRANSACTION_ID_LEN]) -> Self {
        Self(bytes)
    }

    /// Generates a fresh random ID for an outbound request.
    pub fn generate() -> Self {
        let mut bytes = [0u8; TRANSACTION_ID_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Creates an ID from a slice, typically the one the codec extracted
    /// from a parsed header.
    ///
    /// # Errors
    /// Returns [`Error::InvalidTransactionId`] if the slice is not exactly
    /// [`TRANSACTION_ID_LEN`] bytes long.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let array: [u8; TRANSACTION_ID_LEN] = bytes.try_into().map_err(|_| {
            Error::InvalidTransactionId(format!(
                "expected {} bytes, got {}",
                TRANSACTION_ID_LEN,
                bytes.len()
            ))
        })?;
        Ok(Self(array))
    }

    /// Returns a reference to the bytes that represent the identifier.
    pub fn as_bytes(&self) -> &[u8; TRANSACTION_ID_LEN] {
        &self.0
    }
}

impl AsRef<[u8]> for TransactionId {
    fn as_ref(&self) -> &[u8] {
        &self.0[..]
    }
}

impl From<[u8; TRANSACTION_ID_LEN]> for TransactionId {
    fn from(bytes: [u8; TRANSACTION_ID_LEN]) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x")?;
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TransactionId({})", self)
    }
}
