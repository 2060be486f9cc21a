use std::collections::hash_map::HashMap;

use byteorder::{BigEndian, ByteOrder};
use bytes::{BufMut, BytesMut};
use enum_primitive_derive::Primitive;
use num_traits::{FromPrimitive, ToPrimitive};
use strum_macros::{Display, EnumIter, EnumString};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::{Error, ErrorKind, Result};

const MAGIC_NUMBER: u8 = 0x0B;

/// Upper bound on one frame body; larger lengths are treated as protocol errors.
const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Metadata key carrying the remaining call budget in milliseconds.
pub const METADATA_TIMEOUT_MS: &str = "durpc-timeout-ms";

#[derive(Debug, Clone, Copy, Display, PartialEq, EnumIter, EnumString, Primitive)]
pub enum MessageType {
    Request = 0,
    Response = 1,
}

#[derive(Debug, Clone, Copy, Display, PartialEq, EnumIter, EnumString, Primitive)]
pub enum MessageStatusType {
    Normal = 0,
    Error = 1,
}

#[derive(Debug, Clone, Copy, Display, PartialEq, EnumIter, EnumString, Primitive)]
pub enum SerializeType {
    Json = 0,
    MsgPack = 1,
}

/// Cardinality of messages per direction for one call.
#[derive(Debug, Clone, Copy, Display, PartialEq, EnumIter, EnumString, Primitive)]
pub enum CallShape {
    Unary = 0,
    ServerStreaming = 1,
    ClientStreaming = 2,
    Bidirectional = 3,
}

pub type Metadata = HashMap<String, String>;

/// A common frame for requests and responses.
///
/// Header layout (12 bytes): magic, version, flags (message type at bit 7,
/// end-of-stream at bit 6, status at bits 0-1), serialize type in the high
/// nibble of byte 3 with the call shape in the low nibble, then a big-endian
/// u64 sequence number identifying the call on its connection.
#[derive(Debug, Default, Clone)]
pub struct Message {
    header: [u8; 12],
    pub service_path: String,
    pub service_method: String,
    pub metadata: Metadata,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new() -> Message {
        let mut msg: Message = Default::default();
        msg.header[0] = MAGIC_NUMBER;
        msg
    }

    pub fn check_magic_number(&self) -> bool {
        self.header[0] == MAGIC_NUMBER
    }

    pub fn get_version(&self) -> u8 {
        self.header[1]
    }
    pub fn set_version(&mut self, v: u8) {
        self.header[1] = v;
    }

    pub fn get_message_type(&self) -> Option<MessageType> {
        MessageType::from_u8((self.header[2] & 0x80) >> 7)
    }
    pub fn set_message_type(&mut self, mt: MessageType) {
        self.header[2] = (self.header[2] & !0x80) | (mt.to_u8().unwrap_or(0) << 7);
    }

    pub fn is_end_of_stream(&self) -> bool {
        self.header[2] & 0x40 == 0x40
    }
    pub fn set_end_of_stream(&mut self, b: bool) {
        if b {
            self.header[2] |= 0x40;
        } else {
            self.header[2] &= !0x40;
        }
    }

    pub fn get_message_status_type(&self) -> Option<MessageStatusType> {
        MessageStatusType::from_u8(self.header[2] & 0x03)
    }
    pub fn set_message_status_type(&mut self, mst: MessageStatusType) {
        self.header[2] = (self.header[2] & !0x03) | (mst.to_u8().unwrap_or(0) & 0x03);
    }

    pub fn get_serialize_type(&self) -> Option<SerializeType> {
        SerializeType::from_u8((self.header[3] & 0xF0) >> 4)
    }
    pub fn set_serialize_type(&mut self, st: SerializeType) {
        self.header[3] = (self.header[3] & !0xF0) | (st.to_u8().unwrap_or(0) << 4);
    }

    pub fn get_call_shape(&self) -> Option<CallShape> {
        CallShape::from_u8(self.header[3] & 0x0F)
    }
    pub fn set_call_shape(&mut self, shape: CallShape) {
        self.header[3] = (self.header[3] & !0x0F) | (shape.to_u8().unwrap_or(0) & 0x0F);
    }

    pub fn get_seq(&self) -> u64 {
        BigEndian::read_u64(&self.header[4..])
    }
    pub fn set_seq(&mut self, seq: u64) {
        BigEndian::write_u64(&mut self.header[4..], seq);
    }

    /// Encodes the full frame: header, body length, then the body.
    pub fn encode(&self) -> Vec<u8> {
        let mut meta_len = 0usize;
        for (k, v) in &self.metadata {
            meta_len += 8 + k.len() + v.len();
        }
        let body_len = 4 + self.service_path.len()
            + 4 + self.service_method.len()
            + 4 + meta_len
            + 4 + self.payload.len();

        let mut buf = BytesMut::with_capacity(12 + 4 + body_len);
        buf.put_slice(&self.header);
        buf.put_u32(body_len as u32);
        buf.put_u32(self.service_path.len() as u32);
        buf.put_slice(self.service_path.as_bytes());
        buf.put_u32(self.service_method.len() as u32);
        buf.put_slice(self.service_method.as_bytes());
        buf.put_u32(meta_len as u32);
        for (k, v) in &self.metadata {
            buf.put_u32(k.len() as u32);
            buf.put_slice(k.as_bytes());
            buf.put_u32(v.len() as u32);
            buf.put_slice(v.as_bytes());
        }
        buf.put_u32(self.payload.len() as u32);
        buf.put_slice(&self.payload);
        buf.to_vec()
    }

    /// Parses a frame body into this message.
    pub fn decode_body(&mut self, buf: &[u8]) -> Result<()> {
        let mut start = 0usize;
        self.service_path = read_str(read_chunk(buf, &mut start)?)?;
        self.service_method = read_str(read_chunk(buf, &mut start)?)?;

        let meta = read_chunk(buf, &mut start)?;
        let mut meta_start = 0usize;
        while meta_start < meta.len() {
            let key = read_str(read_chunk(meta, &mut meta_start)?)?;
            let value = read_str(read_chunk(meta, &mut meta_start)?)?;
            self.metadata.insert(key, value);
        }

        self.payload = read_chunk(buf, &mut start)?.to_vec();
        Ok(())
    }

    /// Reads one complete frame from the transport channel.
    pub async fn read_from<R>(r: &mut R) -> Result<Message>
    where
        R: AsyncRead + Unpin,
    {
        let mut msg = Message::new();
        r.read_exact(&mut msg.header).await?;
        if !msg.check_magic_number() {
            return Err(Error::new(ErrorKind::Protocol, "bad magic number"));
        }

        let mut len_buf = [0u8; 4];
        r.read_exact(&mut len_buf).await?;
        let len = BigEndian::read_u32(&len_buf) as usize;
        if len > MAX_FRAME_SIZE {
            return Err(Error::new(
                ErrorKind::Protocol,
                format!("frame body of {len} bytes exceeds the {MAX_FRAME_SIZE} byte limit"),
            ));
        }

        let mut body = vec![0u8; len];
        r.read_exact(&mut body).await?;
        msg.decode_body(&body)?;
        Ok(msg)
    }
}

fn read_chunk<'a>(buf: &'a [u8], start: &mut usize) -> Result<&'a [u8]> {
    let malformed = || Error::new(ErrorKind::Protocol, "truncated frame body");
    let end = start.checked_add(4).ok_or_else(malformed)?;
    if buf.len() < end {
        return Err(malformed());
    }
    let len = BigEndian::read_u32(&buf[*start..end]) as usize;
    let chunk_end = end.checked_add(len).ok_or_else(malformed)?;
    if buf.len() < chunk_end {
        return Err(malformed());
    }
    *start = chunk_end;
    Ok(&buf[end..chunk_end])
}

fn read_str(buf: &[u8]) -> Result<String> {
    let s = std::str::from_utf8(buf)
        .map_err(|err| Error::new(ErrorKind::Protocol, err))?;
    Ok(String::from(s))
}
