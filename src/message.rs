use crate::net::{NetworkError, RawNetMessage, Result};
use binread::BinRead;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use bytes::BytesMut;
use flate2::read::GzDecoder;
use futures_util::stream;
use futures_util::StreamExt;
use std::fmt::Debug;
use std::io::{Read, Seek, Write};
use steam_flue_proto::base::CMsgMulti;
use steam_flue_proto::prost;
use steam_flue_proto::prost::Message as _;
use steam_flue_proto::{EMsg, MsgKind, RpcMethod, RpcNotification};
use thiserror::Error;
use tokio_stream::Stream;
use tracing::trace;

#[derive(Debug, Error)]
#[error("Malformed message body for {kind:?}: {error}")]
pub struct MalformedBody {
    kind: MsgKind,
    error: Box<dyn std::error::Error + Send + Sync>,
}

impl MalformedBody {
    pub fn new<K: Into<MsgKind>>(
        kind: K,
        error: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        MalformedBody {
            kind: kind.into(),
            error: error.into(),
        }
    }
}

/// A message body that can be written to the wire.
pub trait EncodableMessage {
    fn write_body<W: Write>(&self, writer: &mut W) -> std::io::Result<()>;

    fn encode_size(&self) -> usize;
}

/// A message body with a fixed wire kind that can also be read back.
pub trait NetMessage: EncodableMessage + Sized + Debug {
    const KIND: EMsg;
    const IS_PROTOBUF: bool = true;

    fn read_body<R: Read + Seek>(reader: &mut R) -> Result<Self, MalformedBody>;
}

/// Implement the codec traits for protobuf-framed message kinds.
macro_rules! proto_message {
    ($($msg:ty),+ $(,)?) => {
        $(
            impl EncodableMessage for $msg {
                fn write_body<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
                    writer.write_all(&prost::Message::encode_to_vec(self))
                }

                fn encode_size(&self) -> usize {
                    prost::Message::encoded_len(self)
                }
            }

            impl NetMessage for $msg {
                const KIND: EMsg = <$msg as steam_flue_proto::ClientMessage>::KIND;

                fn read_body<R: Read + Seek>(reader: &mut R) -> Result<Self, MalformedBody> {
                    let mut buf = Vec::new();
                    reader
                        .read_to_end(&mut buf)
                        .map_err(|e| MalformedBody::new(Self::KIND, e))?;
                    <$msg as prost::Message>::decode(buf.as_slice())
                        .map_err(|e| MalformedBody::new(Self::KIND, e))
                }
            }
        )+
    };
}

proto_message!(
    CMsgMulti,
    steam_flue_proto::base::CMsgClientCMList,
    steam_flue_proto::login::CMsgClientLogon,
    steam_flue_proto::login::CMsgClientLogonResponse,
    steam_flue_proto::login::CMsgClientHeartBeat,
    steam_flue_proto::login::CMsgClientLogOff,
    steam_flue_proto::login::CMsgClientLoggedOff,
    steam_flue_proto::machine_auth::CMsgClientUpdateMachineAuth,
    steam_flue_proto::machine_auth::CMsgClientUpdateMachineAuthResponse,
    steam_flue_proto::web_nonce::CMsgClientRequestWebAPIAuthenticateUserNonce,
    steam_flue_proto::web_nonce::CMsgClientRequestWebAPIAuthenticateUserNonceResponse,
    steam_flue_proto::friends::CMsgClientPersonaState,
    steam_flue_proto::friends::CMsgClientFriendsList,
);

#[derive(Debug, BinRead)]
#[br(little)]
pub struct ChannelEncryptRequest {
    pub protocol: u32,
    pub universe: u32,
    pub nonce: [u8; 16],
}

impl EncodableMessage for ChannelEncryptRequest {
    fn write_body<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        writer.write_u32::<LittleEndian>(self.protocol)?;
        writer.write_u32::<LittleEndian>(self.universe)?;
        writer.write_all(&self.nonce)
    }

    fn encode_size(&self) -> usize {
        4 + 4 + 16
    }
}

impl NetMessage for ChannelEncryptRequest {
    const KIND: EMsg = EMsg::ChannelEncryptRequest;
    const IS_PROTOBUF: bool = false;

    fn read_body<R: Read + Seek>(reader: &mut R) -> Result<Self, MalformedBody> {
        ChannelEncryptRequest::read(reader).map_err(|e| MalformedBody::new(Self::KIND, e))
    }
}

const CRC32: crc::Crc<u32> = crc::Crc::<u32>::new(&crc::CRC_32_ISO_HDLC);

/// Client reply to the encrypt request: the wrapped session key, the HMAC
/// confirmation derived from it and a checksum over the wrapped blob.
#[derive(Debug)]
pub struct ChannelEncryptResponse {
    pub protocol: u32,
    pub encrypted_key: Vec<u8>,
    pub confirmation: [u8; 20],
}

impl EncodableMessage for ChannelEncryptResponse {
    fn write_body<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        writer.write_u32::<LittleEndian>(self.protocol)?;
        writer.write_u32::<LittleEndian>(self.encrypted_key.len() as u32)?;
        writer.write_all(&self.encrypted_key)?;
        writer.write_all(&self.confirmation)?;
        writer.write_u32::<LittleEndian>(CRC32.checksum(&self.encrypted_key))?;
        writer.write_u32::<LittleEndian>(0)?;
        Ok(())
    }

    fn encode_size(&self) -> usize {
        4 + 4 + self.encrypted_key.len() + 20 + 4 + 4
    }
}

impl NetMessage for ChannelEncryptResponse {
    const KIND: EMsg = EMsg::ChannelEncryptResponse;
    const IS_PROTOBUF: bool = false;

    fn read_body<R: Read + Seek>(reader: &mut R) -> Result<Self, MalformedBody> {
        let protocol = reader
            .read_u32::<LittleEndian>()
            .map_err(|e| MalformedBody::new(Self::KIND, e))?;
        let key_len = reader
            .read_u32::<LittleEndian>()
            .map_err(|e| MalformedBody::new(Self::KIND, e))? as usize;
        let mut encrypted_key = vec![0; key_len];
        reader
            .read_exact(&mut encrypted_key)
            .map_err(|e| MalformedBody::new(Self::KIND, e))?;
        let mut confirmation = [0; 20];
        reader
            .read_exact(&mut confirmation)
            .map_err(|e| MalformedBody::new(Self::KIND, e))?;
        let checksum = reader
            .read_u32::<LittleEndian>()
            .map_err(|e| MalformedBody::new(Self::KIND, e))?;
        if checksum != CRC32.checksum(&encrypted_key) {
            return Err(MalformedBody::new(Self::KIND, "key checksum mismatch"));
        }
        Ok(ChannelEncryptResponse {
            protocol,
            encrypted_key,
            confirmation,
        })
    }
}

#[derive(Debug, BinRead)]
#[br(little)]
pub struct ChannelEncryptResult {
    pub result: u32,
}

impl EncodableMessage for ChannelEncryptResult {
    fn write_body<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        writer.write_u32::<LittleEndian>(self.result)
    }

    fn encode_size(&self) -> usize {
        4
    }
}

impl NetMessage for ChannelEncryptResult {
    const KIND: EMsg = EMsg::ChannelEncryptResult;
    const IS_PROTOBUF: bool = false;

    fn read_body<R: Read + Seek>(reader: &mut R) -> Result<Self, MalformedBody> {
        ChannelEncryptResult::read(reader).map_err(|e| MalformedBody::new(Self::KIND, e))
    }
}

/// Outgoing unified-service request; the job name rides in the header.
#[derive(Debug)]
pub struct ServiceMethodMessage<Msg: RpcMethod + Debug>(pub Msg);

impl<Msg: RpcMethod + Debug> EncodableMessage for ServiceMethodMessage<Msg> {
    fn write_body<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        writer.write_all(&self.0.encode_to_vec())
    }

    fn encode_size(&self) -> usize {
        self.0.encoded_len()
    }
}

impl<Msg: RpcMethod + Debug> NetMessage for ServiceMethodMessage<Msg> {
    const KIND: EMsg = EMsg::ServiceMethod;

    fn read_body<R: Read + Seek>(_reader: &mut R) -> Result<Self, MalformedBody> {
        Err(MalformedBody::new(
            Self::KIND,
            "service method requests are write-only",
        ))
    }
}

/// Raw unified-service response, decoded into the concrete response type by
/// the caller that knows the request.
#[derive(Debug)]
pub struct ServiceMethodResponseMessage {
    body: BytesMut,
}

impl ServiceMethodResponseMessage {
    pub fn into_response<Msg: RpcMethod>(self) -> Result<Msg::Response> {
        Ok(Msg::Response::decode(self.body.as_ref())
            .map_err(|e| MalformedBody::new(EMsg::ServiceMethodResponse, e))?)
    }
}

impl EncodableMessage for ServiceMethodResponseMessage {
    fn write_body<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        writer.write_all(&self.body)
    }

    fn encode_size(&self) -> usize {
        self.body.len()
    }
}

impl NetMessage for ServiceMethodResponseMessage {
    const KIND: EMsg = EMsg::ServiceMethodResponse;

    fn read_body<R: Read + Seek>(reader: &mut R) -> Result<Self, MalformedBody> {
        let mut buf = Vec::new();
        reader
            .read_to_end(&mut buf)
            .map_err(|e| MalformedBody::new(Self::KIND, e))?;
        Ok(ServiceMethodResponseMessage {
            body: buf.as_slice().into(),
        })
    }
}

/// Server-initiated unified-service notification, routed by job name.
#[derive(Debug, Clone)]
pub struct ServiceMethodNotification {
    pub job_name: String,
    pub body: BytesMut,
}

impl ServiceMethodNotification {
    pub fn from_raw(raw: RawNetMessage) -> Self {
        ServiceMethodNotification {
            job_name: raw.header.target_job_name.clone().unwrap_or_default(),
            body: raw.data,
        }
    }

    pub fn into_notification<T: RpcNotification>(self) -> Result<T> {
        Ok(T::decode(self.body.as_ref())
            .map_err(|e| MalformedBody::new(EMsg::ServiceMethod, e))?)
    }
}

/// Expand `Multi` bundles into their inner messages, passing everything else
/// through untouched.
pub fn flatten_multi<S: Stream<Item = Result<RawNetMessage>>>(
    source: S,
) -> impl Stream<Item = Result<RawNetMessage>> {
    source.flat_map(|res| {
        let messages = match res {
            Ok(msg) if msg.kind == EMsg::Multi => split_multi(msg),
            other => vec![other],
        };
        stream::iter(messages)
    })
}

fn split_multi(msg: RawNetMessage) -> Vec<Result<RawNetMessage>> {
    let multi = match msg.into_message::<CMsgMulti>() {
        Ok(multi) => multi,
        Err(e) => return vec![Err(e)],
    };
    let body = multi.message_body.unwrap_or_default();
    let body = if multi.size_unzipped.unwrap_or_default() > 0 {
        let mut decoded = Vec::with_capacity(multi.size_unzipped.unwrap_or_default() as usize);
        if let Err(e) = GzDecoder::new(body.as_slice()).read_to_end(&mut decoded) {
            return vec![Err(MalformedBody::new(EMsg::Multi, e).into())];
        }
        decoded
    } else {
        body
    };

    trace!("expanding {} byte multi message", body.len());

    let mut messages = Vec::new();
    let mut rest = body.as_slice();
    while rest.len() >= 4 {
        let len = u32::from_le_bytes(rest[0..4].try_into().expect("checked length")) as usize;
        rest = &rest[4..];
        if rest.len() < len {
            messages.push(Err(NetworkError::InvalidHeader));
            break;
        }
        let (frame, remainder) = rest.split_at(len);
        rest = remainder;
        messages.push(RawNetMessage::try_from(BytesMut::from(frame)));
    }
    messages
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::{JobId, NetMessageHeader};
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use futures_util::stream::iter;
    use steam_flue_proto::login::CMsgClientHeartBeat;

    fn heartbeat_frame(job: u64) -> BytesMut {
        let header = NetMessageHeader {
            source_job_id: JobId(job),
            ..NetMessageHeader::default()
        };
        RawNetMessage::from_message(header, CMsgClientHeartBeat::default())
            .unwrap()
            .into_bytes()
    }

    fn multi_message(frames: &[BytesMut], compress: bool) -> RawNetMessage {
        let mut body = Vec::new();
        for frame in frames {
            body.extend_from_slice(&u32::to_le_bytes(frame.len() as u32));
            body.extend_from_slice(frame);
        }
        let multi = if compress {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(&body).unwrap();
            CMsgMulti {
                size_unzipped: Some(body.len() as u32),
                message_body: Some(encoder.finish().unwrap()),
            }
        } else {
            CMsgMulti {
                size_unzipped: None,
                message_body: Some(body),
            }
        };
        RawNetMessage::from_message(NetMessageHeader::default(), multi).unwrap()
    }

    #[tokio::test]
    async fn multi_passthrough_and_expansion() {
        let frames = vec![heartbeat_frame(1), heartbeat_frame(2)];
        let multi = multi_message(&frames, false);
        let single = RawNetMessage::from_message(
            NetMessageHeader::default(),
            CMsgClientHeartBeat::default(),
        )
        .unwrap();

        let out: Vec<_> = flatten_multi(iter(vec![Ok(multi), Ok(single)]))
            .collect()
            .await;
        assert_eq!(out.len(), 3);
        let jobs: Vec<u64> = out
            .iter()
            .take(2)
            .map(|res| res.as_ref().unwrap().header.source_job_id.0)
            .collect();
        assert_eq!(jobs, vec![1, 2]);
    }

    #[tokio::test]
    async fn multi_gzip_expansion() {
        let frames = vec![heartbeat_frame(7), heartbeat_frame(8), heartbeat_frame(9)];
        let multi = multi_message(&frames, true);
        let out: Vec<_> = flatten_multi(iter(vec![Ok(multi)])).collect().await;
        assert_eq!(out.len(), 3);
        for (i, res) in out.iter().enumerate() {
            assert_eq!(res.as_ref().unwrap().header.source_job_id.0, 7 + i as u64);
        }
    }

    #[test]
    fn channel_encrypt_response_round_trip() {
        let response = ChannelEncryptResponse {
            protocol: 1,
            encrypted_key: vec![0xAB; 128],
            confirmation: [0xCD; 20],
        };
        let mut buf = Vec::new();
        response.write_body(&mut buf).unwrap();
        assert_eq!(buf.len(), response.encode_size());

        let mut cursor = std::io::Cursor::new(buf.as_slice());
        let decoded = ChannelEncryptResponse::read_body(&mut cursor).unwrap();
        assert_eq!(decoded.protocol, 1);
        assert_eq!(decoded.encrypted_key, response.encrypted_key);
        assert_eq!(decoded.confirmation, response.confirmation);
    }

    #[test]
    fn channel_encrypt_response_rejects_bad_checksum() {
        let response = ChannelEncryptResponse {
            protocol: 1,
            encrypted_key: vec![0xAB; 16],
            confirmation: [0; 20],
        };
        let mut buf = Vec::new();
        response.write_body(&mut buf).unwrap();
        buf[8] ^= 0xFF; // corrupt the key, leaving the checksum stale
        let mut cursor = std::io::Cursor::new(buf.as_slice());
        assert!(ChannelEncryptResponse::read_body(&mut cursor).is_err());
    }
}
