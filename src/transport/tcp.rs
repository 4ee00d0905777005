use crate::message::{ChannelEncryptRequest, ChannelEncryptResponse, ChannelEncryptResult};
use crate::net::{FrameCodec, NetMessageHeader, NetworkError, RawNetMessage};
use bytes::{BufMut, BytesMut};
use futures_util::{Sink, SinkExt, StreamExt, TryStreamExt};
use std::fmt::Debug;
use std::future::ready;
use steam_flue_crypto::{generate_session_key, symmetric_decrypt, symmetric_encrypt};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio_stream::Stream;
use tokio_util::codec::{Encoder, FramedRead, FramedWrite};
use tracing::{debug, instrument, trace};

type Result<T, E = NetworkError> = std::result::Result<T, E>;

/// Encrypts whole messages with the session key before framing them.
struct EncryptedMessageEncoder {
    key: [u8; 32],
}

impl Encoder<RawNetMessage> for EncryptedMessageEncoder {
    type Error = NetworkError;

    fn encode(&mut self, item: RawNetMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let plain = item.into_bytes();
        trace!("sending raw message of {} bytes", plain.len());
        let encrypted = symmetric_encrypt(plain, &self.key);

        dst.reserve(8 + encrypted.len());
        dst.put_u32_le(encrypted.len() as u32);
        dst.extend_from_slice(b"VT01");
        dst.extend_from_slice(&encrypted);
        Ok(())
    }
}

/// Connect over TCP and run the channel-encrypt handshake.
///
/// The first frame of every session is the server's `ChannelEncryptRequest`;
/// after the key exchange succeeds every message is AES-CBC encrypted with a
/// per-message IV.
#[instrument]
pub async fn connect<A: ToSocketAddrs + Debug>(
    addr: A,
) -> Result<(
    impl Stream<Item = Result<RawNetMessage>> + Send,
    impl Sink<RawNetMessage, Error = NetworkError> + Send,
)> {
    let stream = TcpStream::connect(addr).await?;
    debug!("connected to server");
    let (read, write) = stream.into_split();
    let mut raw_reader = FramedRead::new(read, FrameCodec);
    let mut raw_writer = FramedWrite::new(write, FrameCodec);

    let encrypt_request = RawNetMessage::try_from(raw_reader.next().await.ok_or(NetworkError::EOF)??)?
        .into_message::<ChannelEncryptRequest>()?;

    trace!("using nonce: {:?}", encrypt_request.nonce);
    let key = generate_session_key(Some(&encrypt_request.nonce));

    let response = ChannelEncryptResponse {
        protocol: encrypt_request.protocol,
        encrypted_key: key.encrypted,
        confirmation: key.confirmation,
    };
    let raw = RawNetMessage::from_message(NetMessageHeader::default(), response)?;
    raw_writer.send(raw.into_bytes()).await?;

    let encrypt_result = RawNetMessage::try_from(raw_reader.next().await.ok_or(NetworkError::EOF)??)?
        .into_message::<ChannelEncryptResult>()?;

    if encrypt_result.result != 1 {
        return Err(NetworkError::CryptoHandshakeFailed);
    }

    debug!("crypt handshake complete");
    let key = key.plain;

    Ok((
        raw_reader
            .and_then(move |encrypted| {
                let decrypted = symmetric_decrypt(encrypted, &key).map_err(Into::into);
                if let Ok(bytes) = decrypted.as_ref() {
                    trace!("decrypted message of {} bytes", bytes.len());
                }
                ready(decrypted)
            })
            .and_then(|raw| ready(RawNetMessage::try_from(raw))),
        FramedWrite::new(raw_writer.into_inner(), EncryptedMessageEncoder { key }),
    ))
}
