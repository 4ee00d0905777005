//! End to end tests against an in-memory transport: the logon exchange, job
//! correlation, transport-loss semantics and the read watchdog.

use futures_util::SinkExt;
use steam_flue::connection::ConnectionSender;
use steam_flue::net::{NetMessageHeader, NetworkError, RawNetMessage};
use steam_flue::proto::login::CMsgClientLogonResponse;
use steam_flue::proto::machine_auth::CMsgClientUpdateMachineAuthResponse;
use steam_flue::proto::web_nonce::{
    CMsgClientRequestWebAPIAuthenticateUserNonce, CMsgClientRequestWebAPIAuthenticateUserNonceResponse,
};
use steam_flue::proto::EMsg;
use steam_flue::{Connection, SteamId, UnAuthenticatedConnection};
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::PollSender;

struct FakeServer {
    /// Messages the client sent.
    from_client: mpsc::Receiver<RawNetMessage>,
    /// Handle for feeding messages to the client.
    to_client: mpsc::Sender<Result<RawNetMessage, NetworkError>>,
}

fn connect_fake() -> (UnAuthenticatedConnection, FakeServer) {
    let (client_tx, from_client) = mpsc::channel::<RawNetMessage>(64);
    let (to_client, client_rx) = mpsc::channel::<Result<RawNetMessage, NetworkError>>(64);

    let sender = PollSender::new(client_tx).sink_map_err(|_| NetworkError::Disconnected);
    let receiver = ReceiverStream::new(client_rx);
    let connection = UnAuthenticatedConnection::from_sender_receiver(sender, receiver)
        .expect("in-memory transport");
    (
        connection,
        FakeServer {
            from_client,
            to_client,
        },
    )
}

impl FakeServer {
    /// Answer the logon with `OK` and the given heartbeat interval.
    async fn accept_logon(&mut self, heartbeat_seconds: i32) -> RawNetMessage {
        let logon = loop {
            let msg = self.from_client.recv().await.expect("client hung up");
            if msg.kind == EMsg::ClientLogOn {
                break msg;
            }
        };

        let header = NetMessageHeader {
            session_id: 7,
            steam_id: SteamId::from(76561198020145915),
            ..NetMessageHeader::default()
        };
        let response = CMsgClientLogonResponse {
            eresult: Some(1),
            out_of_game_heartbeat_seconds: Some(heartbeat_seconds),
            cell_id: Some(15),
            ..CMsgClientLogonResponse::default()
        };
        self.to_client
            .send(Ok(
                RawNetMessage::from_message(header, response).expect("encodable")
            ))
            .await
            .expect("client hung up");
        logon
    }
}

async fn logged_on_pair(heartbeat_seconds: i32) -> (Connection, FakeServer) {
    let (unauth, mut server) = connect_fake();
    let logon = tokio::spawn(async move {
        server.accept_logon(heartbeat_seconds).await;
        server
    });
    let connection = unauth.anonymous().await.expect("logon should succeed");
    let server = logon.await.expect("server task");
    (connection, server)
}

#[tokio::test]
async fn logon_establishes_session() {
    let (connection, _server) = logged_on_pair(9).await;
    assert_eq!(connection.session_id(), 7);
    assert_eq!(u64::from(connection.steam_id()), 76561198020145915);
    assert_eq!(connection.cell_id(), 15);
}

#[tokio::test]
async fn jobs_resolve_with_responses_received_in_reverse_order() {
    let (connection, mut server) = logged_on_pair(9).await;

    const CALLS: usize = 5;

    // each request carries a caller marker in the filename field; the server
    // collects all requests before answering any, then replies newest first,
    // echoing the marker in the nonce
    let server_task = tokio::spawn(async move {
        let mut pending = Vec::new();
        while pending.len() < CALLS {
            let msg = server.from_client.recv().await.expect("client hung up");
            if msg.kind == EMsg::ClientUpdateMachineAuthResponse {
                let job_id = msg.header.source_job_id;
                let body: CMsgClientUpdateMachineAuthResponse =
                    msg.into_message().expect("decodable request");
                pending.push((job_id, body.filename.unwrap_or_default()));
            }
        }
        for (job_id, marker) in pending.iter().rev() {
            let header = NetMessageHeader {
                target_job_id: *job_id,
                ..NetMessageHeader::default()
            };
            let response = CMsgClientRequestWebAPIAuthenticateUserNonceResponse {
                eresult: Some(1),
                webapi_authenticate_user_nonce: Some(marker.clone()),
            };
            server
                .to_client
                .send(Ok(RawNetMessage::from_message(header, response).unwrap()))
                .await
                .expect("client hung up");
        }
        server
    });

    let mut calls = Vec::new();
    for i in 0..CALLS {
        let connection = connection.clone();
        calls.push(tokio::spawn(async move {
            let marker = format!("caller-{i}");
            let request = CMsgClientUpdateMachineAuthResponse {
                filename: Some(marker.clone()),
                ..CMsgClientUpdateMachineAuthResponse::default()
            };
            let response: CMsgClientRequestWebAPIAuthenticateUserNonceResponse =
                connection.job(request).await.expect("job should resolve");
            (marker, response.webapi_authenticate_user_nonce.unwrap())
        }));
    }

    for call in calls {
        let (marker, nonce) = call.await.expect("caller should not panic");
        assert_eq!(nonce, marker, "caller woke with someone else's reply");
    }
    server_task.await.expect("server task");
}

#[tokio::test]
async fn job_round_trip_through_the_sender_trait() {
    let (connection, mut server) = logged_on_pair(9).await;

    let server_task = tokio::spawn(async move {
        let msg = loop {
            let msg = server.from_client.recv().await.expect("client hung up");
            if msg.kind == EMsg::ClientRequestWebAPIAuthenticateUserNonce {
                break msg;
            }
        };
        let header = NetMessageHeader {
            target_job_id: msg.header.source_job_id,
            ..NetMessageHeader::default()
        };
        let response = CMsgClientRequestWebAPIAuthenticateUserNonceResponse {
            eresult: Some(1),
            webapi_authenticate_user_nonce: Some("fresh nonce".into()),
        };
        server
            .to_client
            .send(Ok(RawNetMessage::from_message(header, response).unwrap()))
            .await
            .expect("client hung up");
        server
    });

    let response: CMsgClientRequestWebAPIAuthenticateUserNonceResponse = connection
        .job(CMsgClientRequestWebAPIAuthenticateUserNonce::default())
        .await
        .expect("job should resolve");
    assert_eq!(response.webapi_authenticate_user_nonce.as_deref(), Some("fresh nonce"));
    server_task.await.expect("server task");
}

#[tokio::test]
async fn killing_the_transport_fails_outstanding_rpcs_with_disconnected() {
    let (connection, server) = logged_on_pair(9).await;

    let call = {
        let connection = connection.clone();
        tokio::spawn(async move {
            connection
                .job::<_, CMsgClientRequestWebAPIAuthenticateUserNonceResponse>(
                    CMsgClientRequestWebAPIAuthenticateUserNonce::default(),
                )
                .await
        })
    };

    // let the request hit the wire, then kill the transport
    tokio::time::sleep(Duration::from_millis(50)).await;
    drop(server);

    let result = call.await.expect("caller should not panic");
    assert!(matches!(result, Err(NetworkError::Disconnected)));
    connection.closed().await;
    assert!(connection.is_closed());
}

#[tokio::test(start_paused = true)]
async fn watchdog_closes_a_silent_connection() {
    let (connection, mut server) = logged_on_pair(1).await;

    // drain whatever the client sends so the queue never blocks it
    let drain = tokio::spawn(async move {
        let mut heartbeats = 0usize;
        while let Some(msg) = server.from_client.recv().await {
            if msg.kind == EMsg::ClientHeartBeat {
                heartbeats += 1;
            }
        }
        heartbeats
    });

    // no server frames: after three missed intervals the watchdog gives up
    timeout(Duration::from_secs(60), connection.closed())
        .await
        .expect("watchdog should close the connection");
    assert!(connection.is_closed());

    let heartbeats = drain.await.expect("drain task");
    assert!(heartbeats >= 1, "heartbeats should have been sent while alive");
}

#[tokio::test(start_paused = true)]
async fn slow_rpc_times_out_without_tearing_the_session_down() {
    let (connection, mut server) = logged_on_pair(1_000_000).await;

    // drain outgoing traffic, never answering the rpc; the huge heartbeat
    // interval keeps the watchdog out of the picture
    let silent_server = tokio::spawn(async move {
        while server.from_client.recv().await.is_some() {}
    });

    let result = connection
        .job::<_, CMsgClientRequestWebAPIAuthenticateUserNonceResponse>(
            CMsgClientRequestWebAPIAuthenticateUserNonce::default(),
        )
        .await;
    assert!(matches!(result, Err(NetworkError::Timeout)));
    assert!(!connection.is_closed(), "a timed out rpc is not fatal");

    drop(connection);
    silent_server.abort();
}
