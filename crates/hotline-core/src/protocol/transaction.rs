//! Transaction and field codec plus stream framing.
//!
//! Malformed input (truncated buffers, oversize declarations) is
//! reported as [`Error::Malformed`]; the owning connection is expected
//! to close without replying.

use super::{field, tran};
use crate::error::{Error, Result};
use crate::{MAX_FIELD_SIZE, MAX_TRANSACTION_SIZE};

/// Fixed transaction header size: flags, isReply, type, id, errorCode,
/// totalSize, dataSize.
pub const HEADER_SIZE: usize = 20;

/// A single field: a 16-bit tag and an opaque payload.
///
/// Fields are ordered within a transaction and may repeat; lookups
/// return the first match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    /// Field ID from the registry in [`crate::protocol::field`].
    pub id: u16,
    /// Raw payload bytes.
    pub data: Vec<u8>,
}

impl Field {
    /// Create a field from raw bytes.
    pub fn new(id: u16, data: impl Into<Vec<u8>>) -> Self {
        Self { id, data: data.into() }
    }

    /// Create a field holding a big-endian u16.
    pub fn from_u16(id: u16, value: u16) -> Self {
        Self::new(id, value.to_be_bytes().to_vec())
    }

    /// Create a field holding a big-endian u32.
    pub fn from_u32(id: u16, value: u32) -> Self {
        Self::new(id, value.to_be_bytes().to_vec())
    }

    /// Wire length of this field: tag + size + payload.
    pub fn wire_len(&self) -> usize {
        4 + self.data.len()
    }

    /// Append the wire encoding to `out`.
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.id.to_be_bytes());
        out.extend_from_slice(&(self.data.len() as u16).to_be_bytes());
        out.extend_from_slice(&self.data);
    }

    /// Parse one field from the front of `buf`, returning it and the
    /// number of bytes consumed.
    pub fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        if buf.len() < 4 {
            return Err(Error::Malformed("field header truncated".into()));
        }
        let id = u16::from_be_bytes([buf[0], buf[1]]);
        let size = u16::from_be_bytes([buf[2], buf[3]]) as usize;
        if size > MAX_FIELD_SIZE {
            return Err(Error::Malformed(format!("field {} exceeds size cap", id)));
        }
        if buf.len() < 4 + size {
            return Err(Error::Malformed(format!(
                "field {} declares {} bytes, {} remain",
                id,
                size,
                buf.len() - 4
            )));
        }
        let data = buf[4..4 + size].to_vec();
        Ok((Self { id, data }, 4 + size))
    }

    /// Interpret the payload as a big-endian u16 (shorter payloads are
    /// zero-extended, longer ones truncated to their first two bytes).
    pub fn as_u16(&self) -> u16 {
        match self.data.len() {
            0 => 0,
            1 => self.data[0] as u16,
            _ => u16::from_be_bytes([self.data[0], self.data[1]]),
        }
    }

    /// Interpret the payload as a big-endian u32.
    pub fn as_u32(&self) -> u32 {
        let mut buf = [0u8; 4];
        let n = self.data.len().min(4);
        buf[4 - n..].copy_from_slice(&self.data[..n]);
        u32::from_be_bytes(buf)
    }
}

/// Bitwise-complement obfuscation applied to login and password fields
/// on the wire. Involutive: applying it twice restores the input.
pub fn negate(bytes: &[u8]) -> Vec<u8> {
    bytes.iter().map(|b| b ^ 0xff).collect()
}

/// Encode a nested field list: a 2-byte count followed by each field's
/// wire form. Used by the account-admin payloads that tunnel field
/// lists inside a `DATA` field.
pub fn encode_field_list(fields: &[Field]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&(fields.len() as u16).to_be_bytes());
    for f in fields {
        f.encode_into(&mut out);
    }
    out
}

/// Decode a nested field list produced by [`encode_field_list`].
pub fn decode_field_list(buf: &[u8]) -> Result<Vec<Field>> {
    if buf.len() < 2 {
        return Err(Error::Malformed("field list truncated".into()));
    }
    let count = u16::from_be_bytes([buf[0], buf[1]]) as usize;
    let mut fields = Vec::with_capacity(count);
    let mut off = 2;
    for _ in 0..count {
        let (field, used) = Field::decode(&buf[off..])?;
        off += used;
        fields.push(field);
    }
    Ok(fields)
}

/// The atomic protocol unit: a request, reply or notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    /// Reserved; always zero on the wire.
    pub flags: u8,
    /// Replies echo the originating request's ID and set this.
    pub is_reply: bool,
    /// Transaction type code; 0 on error replies.
    pub ty: u16,
    /// Request ID, random for requests and echoed in replies.
    pub id: u32,
    /// 0 on success, 1 on error.
    pub error_code: u32,
    /// Ordered field list; tags may repeat.
    pub fields: Vec<Field>,
    /// Routing only: the connection this transaction is destined for.
    /// Not part of the wire encoding; `None` means "the session that
    /// produced it".
    pub client_id: Option<u16>,
}

impl Transaction {
    /// Build a request with a caller-supplied ID.
    pub fn request(ty: u16, id: u32, fields: Vec<Field>) -> Self {
        Self {
            flags: 0,
            is_reply: false,
            ty,
            id,
            error_code: 0,
            fields,
            client_id: None,
        }
    }

    /// Build a success reply to `req`, echoing its type and ID.
    pub fn reply_to(req: &Transaction, fields: Vec<Field>) -> Self {
        Self {
            flags: 0,
            is_reply: true,
            ty: req.ty,
            id: req.id,
            error_code: 0,
            fields,
            client_id: None,
        }
    }

    /// Build an error reply to `req`: type 0, error code 1, and a
    /// single error field carrying `msg`.
    pub fn error_reply(req: &Transaction, msg: &str) -> Self {
        Self {
            flags: 0,
            is_reply: true,
            ty: tran::ERROR,
            id: req.id,
            error_code: 1,
            fields: vec![Field::new(field::ERROR, msg.as_bytes().to_vec())],
            client_id: None,
        }
    }

    /// First field with the given tag, if present.
    pub fn field(&self, id: u16) -> Option<&Field> {
        self.fields.iter().find(|f| f.id == id)
    }

    /// Payload of the first field with the given tag.
    pub fn field_data(&self, id: u16) -> Option<&[u8]> {
        self.field(id).map(|f| f.data.as_slice())
    }

    /// Set the destination connection, builder-style.
    pub fn to_client(mut self, client_id: u16) -> Self {
        self.client_id = Some(client_id);
        self
    }

    /// Payload length: field count plus every field's wire form.
    fn data_size(&self) -> usize {
        2 + self.fields.iter().map(Field::wire_len).sum::<usize>()
    }

    /// Serialize for transmission.
    pub fn to_bytes(&self) -> Vec<u8> {
        let data_size = self.data_size() as u32;
        let mut out = Vec::with_capacity(HEADER_SIZE + data_size as usize);
        out.push(self.flags);
        out.push(self.is_reply as u8);
        out.extend_from_slice(&self.ty.to_be_bytes());
        out.extend_from_slice(&self.id.to_be_bytes());
        out.extend_from_slice(&self.error_code.to_be_bytes());
        out.extend_from_slice(&data_size.to_be_bytes()); // totalSize
        out.extend_from_slice(&data_size.to_be_bytes()); // dataSize
        out.extend_from_slice(&(self.fields.len() as u16).to_be_bytes());
        for f in &self.fields {
            f.encode_into(&mut out);
        }
        out
    }

    /// Parse one transaction from the front of `buf`, returning it and
    /// the bytes consumed.
    pub fn from_bytes(buf: &[u8]) -> Result<(Self, usize)> {
        if buf.len() < HEADER_SIZE {
            return Err(Error::Malformed("transaction header truncated".into()));
        }
        let flags = buf[0];
        let is_reply = match buf[1] {
            0 => false,
            1 => true,
            other => return Err(Error::Malformed(format!("bad isReply byte {}", other))),
        };
        let ty = u16::from_be_bytes([buf[2], buf[3]]);
        let id = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        let error_code = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]);
        let data_size = u32::from_be_bytes([buf[16], buf[17], buf[18], buf[19]]) as usize;
        if data_size > MAX_TRANSACTION_SIZE {
            return Err(Error::Malformed(format!(
                "transaction payload of {} bytes exceeds cap",
                data_size
            )));
        }
        if data_size < 2 {
            return Err(Error::Malformed("payload too short for field count".into()));
        }
        if buf.len() < HEADER_SIZE + data_size {
            return Err(Error::Malformed("transaction payload truncated".into()));
        }
        let payload = &buf[HEADER_SIZE..HEADER_SIZE + data_size];
        let count = u16::from_be_bytes([payload[0], payload[1]]) as usize;
        let mut fields = Vec::with_capacity(count);
        let mut off = 2;
        for _ in 0..count {
            let (f, used) = Field::decode(&payload[off..])?;
            off += used;
            fields.push(f);
        }
        Ok((
            Self {
                flags,
                is_reply,
                ty,
                id,
                error_code,
                fields,
                client_id: None,
            },
            HEADER_SIZE + data_size,
        ))
    }
}

/// Splits a TCP byte stream into whole transactions.
///
/// Pure with respect to I/O: the read loop appends bytes with
/// [`push`](TransactionReader::push), then drains complete transactions
/// with [`try_read`](TransactionReader::try_read); partial input is
/// retained for the next read.
pub struct TransactionReader {
    buffer: Vec<u8>,
}

impl TransactionReader {
    /// Create an empty reader.
    pub fn new() -> Self {
        Self { buffer: Vec::with_capacity(4096) }
    }

    /// Append received bytes.
    pub fn push(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Try to extract one complete transaction.
    ///
    /// `Ok(Some(_))` yields a transaction, `Ok(None)` means more bytes
    /// are needed. An `Err` means the stream is unrecoverable and the
    /// connection must be closed.
    pub fn try_read(&mut self) -> Result<Option<Transaction>> {
        if self.buffer.len() < HEADER_SIZE {
            return Ok(None);
        }
        let data_size = u32::from_be_bytes([
            self.buffer[16],
            self.buffer[17],
            self.buffer[18],
            self.buffer[19],
        ]) as usize;
        if data_size > MAX_TRANSACTION_SIZE {
            self.buffer.clear();
            return Err(Error::Malformed("declared payload exceeds cap".into()));
        }
        let total = HEADER_SIZE + data_size;
        if self.buffer.len() < total {
            return Ok(None);
        }
        let result = Transaction::from_bytes(&self.buffer[..total]);
        self.buffer.drain(..total);
        match result {
            Ok((t, _)) => Ok(Some(t)),
            Err(e) => {
                self.buffer.clear();
                Err(e)
            }
        }
    }

    /// Drain every complete transaction currently buffered.
    pub fn drain(&mut self) -> Result<Vec<Transaction>> {
        let mut out = Vec::new();
        while let Some(t) = self.try_read()? {
            out.push(t);
        }
        Ok(out)
    }

    /// Bytes currently buffered (the unconsumed residual).
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

impl Default for TransactionReader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_roundtrip() {
        let f = Field::new(101, b"hai".to_vec());
        let mut wire = Vec::new();
        f.encode_into(&mut wire);
        let (parsed, used) = Field::decode(&wire).expect("decode");
        assert_eq!(used, wire.len());
        assert_eq!(parsed, f);
    }

    #[test]
    fn test_field_truncated() {
        assert!(Field::decode(&[0x00]).is_err());
        // Declares 5 bytes of payload but carries none.
        assert!(Field::decode(&[0x00, 0x65, 0x00, 0x05]).is_err());
    }

    #[test]
    fn test_negate_involution() {
        let plain = b"guest";
        let wire = negate(plain);
        assert_eq!(wire, vec![0x98, 0x8a, 0x9a, 0x8c, 0x8b]);
        assert_eq!(negate(&wire), plain.to_vec());
    }

    #[test]
    fn test_int_helpers() {
        assert_eq!(Field::from_u16(103, 2).data, vec![0, 2]);
        assert_eq!(Field::from_u32(204, 0xa5).as_u32(), 0xa5);
        assert_eq!(Field::new(103, vec![0, 2]).as_u16(), 2);
        assert_eq!(Field::new(103, vec![]).as_u16(), 0);
        assert_eq!(Field::new(103, vec![7]).as_u16(), 7);
    }

    #[test]
    fn test_field_list_roundtrip() {
        let fields = vec![
            Field::new(105, negate(b"guest")),
            Field::new(102, b"Guest".to_vec()),
        ];
        let wire = encode_field_list(&fields);
        let parsed = decode_field_list(&wire).expect("decode list");
        assert_eq!(parsed, fields);
    }

    fn sample(ty: u16, id: u32) -> Transaction {
        Transaction::request(
            ty,
            id,
            vec![
                Field::new(field::DATA, b"hai".to_vec()),
                Field::from_u16(field::USER_ID, 2),
            ],
        )
    }

    #[test]
    fn test_transaction_roundtrip() {
        let t = sample(tran::CHAT_SEND, 0x9acb_0442);
        let wire = t.to_bytes();
        let (parsed, used) = Transaction::from_bytes(&wire).expect("decode");
        assert_eq!(used, wire.len());
        assert_eq!(parsed, t);
    }

    #[test]
    fn test_header_layout() {
        let t = sample(tran::CHAT_SEND, 1);
        let wire = t.to_bytes();
        assert_eq!(wire[0], 0); // flags
        assert_eq!(wire[1], 0); // isReply
        assert_eq!(&wire[2..4], &[0x00, 0x69]); // type 105
        assert_eq!(&wire[4..8], &[0, 0, 0, 1]); // id
        assert_eq!(&wire[8..12], &[0, 0, 0, 0]); // errorCode
        assert_eq!(wire[12..16], wire[16..20]); // totalSize == dataSize
        assert_eq!(&wire[20..22], &[0x00, 0x02]); // field count
    }

    #[test]
    fn test_error_reply_shape() {
        let req = sample(tran::CHAT_SEND, 7);
        let err = Transaction::error_reply(&req, "You are not allowed to participate in chat.");
        assert!(err.is_reply);
        assert_eq!(err.ty, tran::ERROR);
        assert_eq!(err.id, 7);
        assert_eq!(err.error_code, 1);
        assert_eq!(
            err.field_data(field::ERROR),
            Some(&b"You are not allowed to participate in chat."[..])
        );
    }

    #[test]
    fn test_reply_echoes_type_and_id() {
        let req = sample(0x0002, 0x1234_5678);
        let reply = Transaction::reply_to(&req, vec![]);
        assert!(reply.is_reply);
        assert_eq!(reply.ty, 0x0002);
        assert_eq!(reply.id, 0x1234_5678);
        assert_eq!(reply.error_code, 0);
    }

    #[test]
    fn test_first_match_lookup() {
        let t = Transaction::request(
            tran::GET_USER_NAME_LIST,
            1,
            vec![
                Field::new(field::USERNAME_WITH_INFO, vec![1]),
                Field::new(field::USERNAME_WITH_INFO, vec![2]),
            ],
        );
        assert_eq!(t.field_data(field::USERNAME_WITH_INFO), Some(&[1u8][..]));
    }

    #[test]
    fn test_reader_streaming_byte_by_byte() {
        let t = sample(tran::CHAT_SEND, 42);
        let wire = t.to_bytes();
        let mut reader = TransactionReader::new();
        for (i, b) in wire.iter().enumerate() {
            reader.push(&[*b]);
            if i < wire.len() - 1 {
                assert!(reader.try_read().expect("no error").is_none());
            }
        }
        let parsed = reader.try_read().expect("no error").expect("complete");
        assert_eq!(parsed, t);
        assert_eq!(reader.buffered(), 0);
    }

    #[test]
    fn test_reader_concatenation_and_residual() {
        let a = sample(tran::CHAT_SEND, 1);
        let b = sample(tran::GET_MSGS, 2);
        let c = sample(tran::KEEP_ALIVE, 3);
        let mut wire = Vec::new();
        wire.extend_from_slice(&a.to_bytes());
        wire.extend_from_slice(&b.to_bytes());
        wire.extend_from_slice(&c.to_bytes());

        // Whole concatenation: all three, empty residual.
        let mut reader = TransactionReader::new();
        reader.push(&wire);
        let all = reader.drain().expect("drain");
        assert_eq!(all, vec![a.clone(), b.clone(), c.clone()]);
        assert_eq!(reader.buffered(), 0);

        // A prefix cut mid-third: maximal whole prefix plus tail kept.
        let cut = a.to_bytes().len() + b.to_bytes().len() + 5;
        let mut reader = TransactionReader::new();
        reader.push(&wire[..cut]);
        let some = reader.drain().expect("drain");
        assert_eq!(some, vec![a, b]);
        assert_eq!(reader.buffered(), 5);
    }

    #[test]
    fn test_oversize_payload_rejected() {
        let mut wire = sample(tran::CHAT_SEND, 1).to_bytes();
        let huge = (MAX_TRANSACTION_SIZE as u32 + 1).to_be_bytes();
        wire[16..20].copy_from_slice(&huge);
        let mut reader = TransactionReader::new();
        reader.push(&wire);
        assert!(reader.try_read().is_err());
    }

    #[test]
    fn test_field_size_beyond_payload_rejected() {
        let t = sample(tran::CHAT_SEND, 1);
        let mut wire = t.to_bytes();
        // Inflate the first field's declared size past the payload end.
        wire[24] = 0xff;
        assert!(Transaction::from_bytes(&wire).is_err());
    }
}
