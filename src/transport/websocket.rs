use crate::net::{NetworkError, RawNetMessage};
use bytes::BytesMut;
use futures_sink::Sink;
use futures_util::{SinkExt, StreamExt, TryStreamExt};
use std::future::ready;
use tokio_stream::Stream;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, instrument};

type Result<T, E = NetworkError> = std::result::Result<T, E>;

/// Connect to a CM over `wss://`.
///
/// The websocket transport rides on TLS, so messages travel without the
/// channel-encrypt layer and without the `VT01` length framing; each binary
/// websocket message is one header + body.
#[instrument]
pub async fn connect(
    addr: &str,
) -> Result<(
    impl Stream<Item = Result<RawNetMessage>> + Send,
    impl Sink<RawNetMessage, Error = NetworkError> + Send,
)> {
    let (stream, _) = connect_async(addr).await?;
    debug!("connected to websocket server");
    let (raw_write, raw_read) = stream.split();

    Ok((
        raw_read
            .map_err(NetworkError::from)
            .try_filter(|msg| ready(msg.is_binary()))
            .map_ok(|msg| BytesMut::from(msg.into_data().as_slice()))
            .map(|res| res.and_then(RawNetMessage::try_from)),
        raw_write
            .sink_map_err(NetworkError::from)
            .with(|msg: RawNetMessage| {
                ready(Ok::<_, NetworkError>(WsMessage::binary(
                    msg.into_bytes().to_vec(),
                )))
            }),
    ))
}
