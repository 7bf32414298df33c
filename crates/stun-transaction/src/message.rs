//! The opaque message unit the transaction layer moves around.
//!
//! Attributes are carried as an undecoded block: the transaction layer only
//! ever looks at the message class and the transaction ID. [`Message::encode`]
//! and [`Message::decode`] frame that block with the 20-byte STUN header
//! (RFC 5389 Section 6) so that a datagram transport has something to put on
//! the wire.

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::transaction::{TransactionId, TRANSACTION_ID_LEN};

/// STUN message header size (20 bytes)
pub const STUN_HEADER_SIZE: usize = 20;

/// STUN magic cookie value (RFC 5389)
pub const STUN_MAGIC_COOKIE: u32 = 0x2112A442;

/// The Binding method, the only method defined by RFC 5389 itself.
pub const BINDING_METHOD: u16 = 0x001;

const MAX_METHOD: u16 = 0x0FFF;

/// STUN message classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageClass {
    Request,
    Indication,
    SuccessResponse,
    ErrorResponse,
}

impl MessageClass {
    fn bits(self) -> u16 {
        match self {
            MessageClass::Request => 0b00,
            MessageClass::Indication => 0b01,
            MessageClass::SuccessResponse => 0b10,
            MessageClass::ErrorResponse => 0b11,
        }
    }

    fn from_bits(bits: u16) -> Self {
        match bits & 0b11 {
            0b00 => MessageClass::Request,
            0b01 => MessageClass::Indication,
            0b10 => MessageClass::SuccessResponse,
            _ => MessageClass::ErrorResponse,
        }
    }

    /// Success and error responses both complete a client transaction.
    pub fn is_response(self) -> bool {
        matches!(self, MessageClass::SuccessResponse | MessageClass::ErrorResponse)
    }
}

/// A STUN message with an undecoded attribute block.
#[derive(Clone, PartialEq, Eq)]
pub struct Message {
    class: MessageClass,
    method: u16,
    transaction_id: TransactionId,
    attributes: Bytes,
}

impl Message {
    /// Create a new message
    pub fn new(class: MessageClass, method: u16, transaction_id: TransactionId, attributes: Bytes) -> Self {
        Self {
            class,
            method,
            transaction_id,
            attributes,
        }
    }

    /// Creates a request for `method` with a freshly generated transaction ID.
    pub fn request(method: u16, attributes: Bytes) -> Self {
        Self::new(MessageClass::Request, method, TransactionId::generate(), attributes)
    }

    /// Creates a Binding request with a freshly generated transaction ID.
    pub fn binding_request() -> Self {
        Self::request(BINDING_METHOD, Bytes::new())
    }

    /// Creates a success response to `request`, carrying the same method and ID.
    pub fn success_response_to(request: &Message, attributes: Bytes) -> Self {
        Self::new(MessageClass::SuccessResponse, request.method, request.transaction_id, attributes)
    }

    /// Creates an error response to `request`, carrying the same method and ID.
    pub fn error_response_to(request: &Message, attributes: Bytes) -> Self {
        Self::new(MessageClass::ErrorResponse, request.method, request.transaction_id, attributes)
    }

    pub fn class(&self) -> MessageClass {
        self.class
    }

    pub fn method(&self) -> u16 {
        self.method
    }

    pub fn transaction_id(&self) -> TransactionId {
        self.transaction_id
    }

    /// Overwrites the transaction ID. Transactions use this to make sure
    /// what they send carries their own ID.
    pub fn set_transaction_id(&mut self, transaction_id: TransactionId) {
        self.transaction_id = transaction_id;
    }

    /// The opaque attribute block.
    pub fn attributes(&self) -> &Bytes {
        &self.attributes
    }

    pub fn is_request(&self) -> bool {
        self.class == MessageClass::Request
    }

    pub fn is_indication(&self) -> bool {
        self.class == MessageClass::Indication
    }

    pub fn is_response(&self) -> bool {
        self.class.is_response()
    }

    /// The 14-bit message type field: method bits interleaved with the class
    /// bits C0 (bit 4) and C1 (bit 8).
    fn message_type(&self) -> u16 {
        let m = self.method;
        let c = self.class.bits();
        (m & 0x000F) | ((m & 0x0070) << 1) | ((m & 0x0F80) << 2) | ((c & 0x1) << 4) | ((c & 0x2) << 7)
    }

    fn split_message_type(value: u16) -> (MessageClass, u16) {
        let class = ((value >> 4) & 0x1) | ((value >> 7) & 0x2);
        let method = (value & 0x000F) | ((value & 0x00E0) >> 1) | ((value & 0x3E00) >> 2);
        (MessageClass::from_bits(class), method)
    }

    /// Encode message to bytes
    ///
    /// # Errors
    /// [`Error::Encode`] if the method does not fit in 12 bits, or the
    /// attribute block is not 32-bit aligned or too long for the length field.
    pub fn encode(&self) -> Result<Bytes> {
        if self.method > MAX_METHOD {
            return Err(Error::Encode(format!("method 0x{:x} exceeds 12 bits", self.method)));
        }
        if self.attributes.len() % 4 != 0 {
            return Err(Error::Encode(format!(
                "attribute block of {} bytes is not 32-bit aligned",
                self.attributes.len()
            )));
        }
        let length = u16::try_from(self.attributes.len())
            .map_err(|_| Error::Encode(format!("attribute block of {} bytes is too long", self.attributes.len())))?;

        let mut buf = BytesMut::with_capacity(STUN_HEADER_SIZE + self.attributes.len());
        buf.put_u16(self.message_type());
        buf.put_u16(length);
        buf.put_u32(STUN_MAGIC_COOKIE);
        buf.put_slice(self.transaction_id.as_bytes());
        buf.put_slice(&self.attributes);
        Ok(buf.freeze())
    }

    /// Decode message from bytes
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < STUN_HEADER_SIZE {
            return Err(Error::Decode("Packet too small for STUN header".to_string()));
        }

        // The two most significant bits of every STUN message are zero
        if (bytes[0] & 0xC0) != 0 {
            return Err(Error::Decode("Invalid STUN message".to_string()));
        }

        let mut header = &bytes[..STUN_HEADER_SIZE];
        let (class, method) = Self::split_message_type(header.get_u16());
        let length = header.get_u16() as usize;
        if header.get_u32() != STUN_MAGIC_COOKIE {
            return Err(Error::Decode("Invalid STUN magic cookie".to_string()));
        }
        let transaction_id = TransactionId::from_slice(&header[..TRANSACTION_ID_LEN])?;

        if length % 4 != 0 {
            return Err(Error::Decode(format!("Message length {} is not 32-bit aligned", length)));
        }
        if bytes.len() != STUN_HEADER_SIZE + length {
            return Err(Error::Decode(format!(
                "Message length {} does not match {} bytes of attributes",
                length,
                bytes.len() - STUN_HEADER_SIZE
            )));
        }

        Ok(Self {
            class,
            method,
            transaction_id,
            attributes: Bytes::copy_from_slice(&bytes[STUN_HEADER_SIZE..]),
        })
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("class", &self.class)
            .field("method", &format_args!("0x{:03x}", self.method))
            .field("transaction_id", &self.transaction_id)
            .field("attributes_len", &self.attributes.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binding_types_match_rfc_values() {
        let request = Message::binding_request();
        let encoded = request.encode().unwrap();
        assert_eq!(&encoded[0..2], &[0x00, 0x01]);
        assert_eq!(encoded.len(), STUN_HEADER_SIZE);

        let success = Message::success_response_to(&request, Bytes::new());
        assert_eq!(&success.encode().unwrap()[0..2], &[0x01, 0x01]);

        let error = Message::error_response_to(&request, Bytes::new());
        assert_eq!(&error.encode().unwrap()[0..2], &[0x01, 0x11]);
    }

    #[test]
    fn decode_recovers_class_method_and_id() {
        let request = Message::request(0x0ABC, Bytes::from_static(&[1, 2, 3, 4, 5, 6, 7, 8]));
        let decoded = Message::decode(&request.encode().unwrap()).unwrap();
        assert_eq!(decoded.class(), MessageClass::Request);
        assert_eq!(decoded.method(), 0x0ABC);
        assert_eq!(decoded.transaction_id(), request.transaction_id());
        assert_eq!(decoded.attributes().as_ref(), &[1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn encode_rejects_unaligned_attributes() {
        let request = Message::request(BINDING_METHOD, Bytes::from_static(&[1, 2, 3]));
        assert!(matches!(request.encode(), Err(Error::Encode(_))));
    }

    #[test]
    fn encode_rejects_oversized_method() {
        let request = Message::request(0x1000, Bytes::new());
        assert!(matches!(request.encode(), Err(Error::Encode(_))));
    }

    #[test]
    fn decode_rejects_malformed_datagrams() {
        assert!(matches!(Message::decode(&[0u8; 10]), Err(Error::Decode(_))));

        let mut bad_cookie = Message::binding_request().encode().unwrap().to_vec();
        bad_cookie[4] = 0;
        assert!(matches!(Message::decode(&bad_cookie), Err(Error::Decode(_))));

        let mut truncated = Message::request(BINDING_METHOD, Bytes::from_static(&[0; 8]))
            .encode()
            .unwrap()
            .to_vec();
        truncated.truncate(24);
        assert!(matches!(Message::decode(&truncated), Err(Error::Decode(_))));

        let mut high_bits = Message::binding_request().encode().unwrap().to_vec();
        high_bits[0] |= 0x80;
        assert!(matches!(Message::decode(&high_bits), Err(Error::Decode(_))));
    }
}
