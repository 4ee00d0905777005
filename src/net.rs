use crate::message::{EncodableMessage, MalformedBody, NetMessage};
use crate::steam_id::SteamId;
use bytemuck::{cast, Pod, Zeroable};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use bytes::{Buf, BufMut, BytesMut};
use std::fmt;
use std::io::{Cursor, Seek, SeekFrom};
use std::sync::atomic::{AtomicU64, Ordering};
use steam_flue_crypto::CryptError;
use steam_flue_proto::base::CMsgProtoBufHeader;
use steam_flue_proto::prost::Message as _;
use steam_flue_proto::{EMsg, EResult, MsgKind, MsgKindEnum, PROTO_MASK};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("{0}")]
    IO(#[from] std::io::Error),
    #[error("Invalid message header")]
    InvalidHeader,
    #[error("Failed to perform crypto handshake")]
    CryptoHandshakeFailed,
    #[error("Different message expected, expected {0:?}, got {1:?}")]
    DifferentMessage(MsgKind, MsgKind),
    #[error("{0}")]
    MalformedBody(#[from] MalformedBody),
    #[error("Crypto error: {0}")]
    CryptoError(#[from] CryptError),
    #[error("Unexpected end of stream")]
    EOF,
    #[error("Request timed out")]
    Timeout,
    #[error("Connection closed")]
    Disconnected,
    #[error("Websocket error: {0}")]
    Ws(#[from] Box<tokio_tungstenite::tungstenite::Error>),
    #[error("Steam returned an error: {0:?}")]
    Result(EResult),
}

impl From<tokio_tungstenite::tungstenite::Error> for NetworkError {
    fn from(value: tokio_tungstenite::tungstenite::Error) -> Self {
        NetworkError::Ws(Box::new(value))
    }
}

pub type Result<T, E = NetworkError> = std::result::Result<T, E>;

const MAGIC: [u8; 4] = *b"VT01";

/// Correlation id carried in message headers.
///
/// Zero is never allocated and `u64::MAX` is the wire sentinel for "no job".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobId(pub u64);

impl JobId {
    pub const NONE: JobId = JobId(u64::MAX);

    pub fn is_none(&self) -> bool {
        *self == JobId::NONE
    }
}

impl Default for JobId {
    fn default() -> Self {
        JobId::NONE
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Monotonic source-job-id allocator, shared by every sender on a session.
#[derive(Debug)]
pub struct JobIdCounter(AtomicU64);

impl Default for JobIdCounter {
    fn default() -> Self {
        JobIdCounter(AtomicU64::new(1))
    }
}

impl JobIdCounter {
    /// Next source job id; the 64 bit space outlives any session so the
    /// sentinel values are never reached.
    pub fn next(&self) -> JobId {
        JobId(self.0.fetch_add(1, Ordering::Relaxed))
    }
}

#[derive(Debug, Default, Copy, Clone, Zeroable, Pod)]
#[repr(C)]
pub struct Header {
    length: u32,
    magic: [u8; 4],
}

impl Header {
    pub fn validate(&self) -> Result<()> {
        if self.magic != MAGIC {
            Err(NetworkError::InvalidHeader)
        } else {
            Ok(())
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct NetMessageHeader {
    pub source_job_id: JobId,
    pub target_job_id: JobId,
    pub steam_id: SteamId,
    pub session_id: i32,
    pub target_job_name: Option<String>,
    pub eresult: Option<i32>,
}

impl NetMessageHeader {
    pub fn eresult(&self) -> EResult {
        EResult::from(self.eresult.unwrap_or_else(|| i32::from(EResult::Invalid)))
    }

    fn proto_header(&self) -> CMsgProtoBufHeader {
        CMsgProtoBufHeader {
            jobid_target: (!self.target_job_id.is_none()).then_some(self.target_job_id.0),
            jobid_source: (!self.source_job_id.is_none()).then_some(self.source_job_id.0),
            steamid: self.steam_id.is_valid().then(|| self.steam_id.into()),
            client_sessionid: Some(self.session_id),
            target_job_name: self.target_job_name.clone(),
            eresult: self.eresult,
            ..CMsgProtoBufHeader::default()
        }
    }

    /// Read the extended non-protobuf header.
    fn read_extended<R: ReadBytesExt + Seek>(mut reader: R) -> std::io::Result<Self> {
        reader.seek(SeekFrom::Current(3))?; // 1 byte (fixed) header size, 2 bytes (fixed) header version
        let target_job_id = JobId(reader.read_u64::<LittleEndian>()?);
        let source_job_id = JobId(reader.read_u64::<LittleEndian>()?);
        reader.seek(SeekFrom::Current(1))?; // header canary (fixed)
        let steam_id = reader.read_u64::<LittleEndian>()?.into();
        let session_id = reader.read_i32::<LittleEndian>()?;
        Ok(NetMessageHeader {
            source_job_id,
            target_job_id,
            steam_id,
            session_id,
            target_job_name: None,
            eresult: None,
        })
    }

    fn write<W: WriteBytesExt>(
        &self,
        writer: &mut W,
        kind: MsgKind,
        proto: bool,
    ) -> std::io::Result<()> {
        if is_handshake_kind(kind) {
            writer.write_u32::<LittleEndian>(kind.value() as u32)?;
            writer.write_u64::<LittleEndian>(self.target_job_id.0)?;
            writer.write_u64::<LittleEndian>(self.source_job_id.0)?;
        } else if proto {
            trace!(kind = kind.value(), "writing protobuf header");
            let proto_header = self.proto_header();
            writer.write_u32::<LittleEndian>(kind.value() as u32 | PROTO_MASK)?;
            writer.write_u32::<LittleEndian>(proto_header.encoded_len() as u32)?;
            writer.write_all(&proto_header.encode_to_vec())?;
        } else {
            trace!(kind = kind.value(), "writing extended header");
            writer.write_u32::<LittleEndian>(kind.value() as u32)?;
            writer.write_u8(36)?;
            writer.write_u16::<LittleEndian>(2)?;
            writer.write_u64::<LittleEndian>(self.target_job_id.0)?;
            writer.write_u64::<LittleEndian>(self.source_job_id.0)?;
            writer.write_u8(239)?;
            writer.write_u64::<LittleEndian>(self.steam_id.into())?;
            writer.write_i32::<LittleEndian>(self.session_id)?;
        }
        Ok(())
    }

    fn encoded_size(&self, kind: MsgKind, proto: bool) -> usize {
        if is_handshake_kind(kind) {
            4 + 8 + 8
        } else if proto {
            4 + 4 + self.proto_header().encoded_len()
        } else {
            4 + 3 + 8 + 8 + 1 + 8 + 4
        }
    }
}

impl From<CMsgProtoBufHeader> for NetMessageHeader {
    fn from(header: CMsgProtoBufHeader) -> Self {
        NetMessageHeader {
            source_job_id: header.jobid_source.map(JobId).unwrap_or_default(),
            target_job_id: header.jobid_target.map(JobId).unwrap_or_default(),
            steam_id: header.steamid.unwrap_or_default().into(),
            session_id: header.client_sessionid.unwrap_or_default(),
            target_job_name: header.target_job_name,
            eresult: header.eresult,
        }
    }
}

/// The channel-encrypt family keeps the bare legacy header.
fn is_handshake_kind(kind: MsgKind) -> bool {
    kind == EMsg::ChannelEncryptRequest
        || kind == EMsg::ChannelEncryptResponse
        || kind == EMsg::ChannelEncryptResult
}

/// A message as pulled off (or about to go onto) the wire, header decoded,
/// body still raw.
#[derive(Debug, Clone)]
pub struct RawNetMessage {
    pub kind: MsgKind,
    pub is_protobuf: bool,
    pub header: NetMessageHeader,
    pub data: BytesMut,
}

impl TryFrom<BytesMut> for RawNetMessage {
    type Error = NetworkError;

    fn try_from(mut value: BytesMut) -> Result<Self> {
        let mut reader = Cursor::new(&value);
        let raw_kind = reader
            .read_i32::<LittleEndian>()
            .map_err(|_| NetworkError::InvalidHeader)?;

        let is_protobuf = raw_kind < 0;
        let kind = MsgKind(raw_kind & !(PROTO_MASK as i32));

        trace!(kind = kind.value(), is_protobuf, "reading header");

        let (header, body_start) = if is_protobuf {
            let header_length = reader.read_u32::<LittleEndian>()? as usize;
            if value.len() < 8 + header_length {
                return Err(NetworkError::InvalidHeader);
            }
            let header = CMsgProtoBufHeader::decode(&value[8..8 + header_length])
                .map_err(|_| NetworkError::InvalidHeader)?;
            (header.into(), 8 + header_length)
        } else if is_handshake_kind(kind) {
            let target_job_id = JobId(reader.read_u64::<LittleEndian>()?);
            let source_job_id = JobId(reader.read_u64::<LittleEndian>()?);
            (
                NetMessageHeader {
                    target_job_id,
                    source_job_id,
                    ..NetMessageHeader::default()
                },
                4 + 8 + 8,
            )
        } else {
            (
                NetMessageHeader::read_extended(&mut reader)?,
                4 + 3 + 8 + 8 + 1 + 8 + 4,
            )
        };

        if value.len() < body_start {
            return Err(NetworkError::InvalidHeader);
        }
        value.advance(body_start);
        Ok(RawNetMessage {
            kind,
            is_protobuf,
            header,
            data: value,
        })
    }
}

impl RawNetMessage {
    pub fn from_message<Msg: NetMessage>(header: NetMessageHeader, message: Msg) -> Result<Self> {
        Self::from_message_with_kind(header, message, Msg::KIND, Msg::IS_PROTOBUF)
    }

    pub fn from_message_with_kind<Msg: EncodableMessage, K: MsgKindEnum>(
        header: NetMessageHeader,
        message: Msg,
        kind: K,
        is_protobuf: bool,
    ) -> Result<Self> {
        let mut data = BytesMut::with_capacity(message.encode_size());
        message.write_body(&mut (&mut data).writer())?;
        Ok(RawNetMessage {
            kind: kind.into(),
            is_protobuf,
            header,
            data,
        })
    }

    /// Encode header and body into one buffer, ready for the transport.
    pub fn into_bytes(self) -> BytesMut {
        let header_size = self.header.encoded_size(self.kind, self.is_protobuf);
        let mut buf = BytesMut::with_capacity(header_size + self.data.len());
        let mut writer = (&mut buf).writer();
        self.header
            .write(&mut writer, self.kind, self.is_protobuf)
            .expect("writing to a BytesMut never fails");
        buf.extend_from_slice(&self.data);
        buf
    }

    /// Decode the body, checking the wire kind matches.
    pub fn into_message<T: NetMessage>(self) -> Result<T> {
        self.into_header_and_message().map(|(_, msg)| msg)
    }

    pub fn into_header_and_message<T: NetMessage>(self) -> Result<(NetMessageHeader, T)> {
        if self.kind == MsgKind::from(T::KIND) {
            let mut reader = Cursor::new(self.data.as_ref());
            let msg = T::read_body(&mut reader)?;
            Ok((self.header, msg))
        } else {
            Err(NetworkError::DifferentMessage(T::KIND.into(), self.kind))
        }
    }
}

/// Length + `VT01` framing, shared by the plaintext handshake and the
/// encrypted phase.
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = BytesMut;
    type Error = NetworkError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        if src.len() < 8 {
            return Ok(None);
        }

        let header_bytes = src[0..8].try_into().expect("checked length");
        let header = cast::<[u8; 8], Header>(header_bytes);
        header.validate()?;
        trace!("got header for packet of {} bytes", header.length);

        if src.len() < 8 + header.length as usize {
            return Ok(None);
        }

        src.advance(8);
        Ok(Some(src.split_to(header.length as usize)))
    }
}

impl Encoder<BytesMut> for FrameCodec {
    type Error = NetworkError;

    fn encode(&mut self, item: BytesMut, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(8 + item.len());

        dst.extend_from_slice(&u32::to_le_bytes(item.len() as u32));
        dst.extend_from_slice(&MAGIC);
        dst.extend_from_slice(item.as_ref());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use steam_flue_proto::login::CMsgClientHeartBeat;

    #[test]
    fn frame_codec_round_trip() {
        let mut codec = FrameCodec;
        let mut wire = BytesMut::new();
        codec
            .encode(BytesMut::from(&b"hello steam"[..]), &mut wire)
            .unwrap();
        assert_eq!(&wire[4..8], b"VT01");
        let decoded = codec.decode(&mut wire).unwrap().unwrap();
        assert_eq!(decoded.as_ref(), b"hello steam");
        assert!(wire.is_empty());
    }

    #[test]
    fn frame_codec_waits_for_full_frame() {
        let mut codec = FrameCodec;
        let mut wire = BytesMut::new();
        codec
            .encode(BytesMut::from(&[9u8; 32][..]), &mut wire)
            .unwrap();
        let rest = wire.split_off(20);
        let mut partial = wire;
        assert!(codec.decode(&mut partial).unwrap().is_none());
        partial.unsplit(rest);
        assert!(codec.decode(&mut partial).unwrap().is_some());
    }

    #[test]
    fn frame_codec_rejects_bad_magic() {
        let mut codec = FrameCodec;
        let mut wire = BytesMut::new();
        wire.extend_from_slice(&4u32.to_le_bytes());
        wire.extend_from_slice(b"XXXX");
        wire.extend_from_slice(&[0; 4]);
        assert!(matches!(
            codec.decode(&mut wire),
            Err(NetworkError::InvalidHeader)
        ));
    }

    #[test]
    fn proto_message_header_round_trip() {
        let header = NetMessageHeader {
            source_job_id: JobId(17),
            target_job_id: JobId::NONE,
            steam_id: SteamId::from(76561198020145915),
            session_id: 993,
            target_job_name: None,
            eresult: None,
        };
        let msg =
            RawNetMessage::from_message(header, CMsgClientHeartBeat { send_reply: None }).unwrap();
        let decoded = RawNetMessage::try_from(msg.into_bytes()).unwrap();
        assert_eq!(decoded.kind, EMsg::ClientHeartBeat);
        assert!(decoded.is_protobuf);
        assert_eq!(decoded.header.source_job_id, JobId(17));
        assert!(decoded.header.target_job_id.is_none());
        assert_eq!(u64::from(decoded.header.steam_id), 76561198020145915);
        assert_eq!(decoded.header.session_id, 993);
    }

    #[test]
    fn job_id_counter_is_monotonic_and_never_zero() {
        let counter = JobIdCounter::default();
        let first = counter.next();
        assert_ne!(first.0, 0);
        assert!(!first.is_none());
        let second = counter.next();
        assert!(second.0 > first.0);
    }
}
