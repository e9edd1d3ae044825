//! HIDP control channel definitions.
//!
//! Every control message starts with a header byte whose high nibble is
//! the transaction type and low nibble its parameter.

/// Transaction type bits of the header byte
pub const HEADER_TRANS_MASK: u8 = 0xf0;

/// Frames sent on the control channel once a session is set up.
pub const HELLO_FRAMES: [[u8; 3]; 2] = [[0xa1, 0x13, 0x03], [0xa1, 0x13, 0x02]];

/// Transaction types the device answers.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::FromRepr, strum::Display)]
pub enum Transaction {
   Handshake = 0x00,
   SetProtocol = 0x60,
   Data = 0xa0,
}

/// Result codes carried in the low nibble of a HANDSHAKE reply.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum HandshakeStatus {
   Successful = 0x00,
   ErrUnknown = 0x0e,
}

impl HandshakeStatus {
   pub const fn reply(self) -> u8 {
      Transaction::Handshake as u8 | self as u8
   }
}

/// Classifies a control message by its header byte.
pub fn classify(header: u8) -> Option<Transaction> {
   Transaction::from_repr(header & HEADER_TRANS_MASK)
}

/// One-byte HANDSHAKE reply owed for a message, if any.
///
/// SET_PROTOCOL is acknowledged, DATA is accepted silently and anything
/// else (including a HANDSHAKE from the host) is answered as unknown.
pub fn respond(header: u8) -> Option<u8> {
   match classify(header) {
      Some(Transaction::SetProtocol) => Some(HandshakeStatus::Successful.reply()),
      Some(Transaction::Data) => None,
      Some(Transaction::Handshake) | None => Some(HandshakeStatus::ErrUnknown.reply()),
   }
}
