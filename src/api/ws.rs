//! Per-connection WebSocket plumbing: room id validation, frame parsing,
//! response serialization and error-to-close-code mapping. One JSON object
//! per text frame in both directions.

use std::{borrow::Cow, net::SocketAddr, sync::atomic, time::Duration};

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket},
        ConnectInfo, Path, WebSocketUpgrade,
    },
    response::{IntoResponse, Response as HttpResponse},
};
use http::StatusCode;
use futures_util::{
    stream::{BoxStream, SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use rand::Rng;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    close_codes::{
        ERR_INVALID_REQUEST, ERR_INVALID_ROOM, ERR_INVALID_UUID, ERR_ROOM_FULL,
        ERR_TOO_MANY_CONNECTIONS, ERR_TOO_MANY_ROOMS_CREATED,
    },
    protocol::{Request, Response},
};
use crate::{
    rate_limiting::SERVER_LIVENESS_EXPIRATION, services, utils::error::Result, Error,
};

pub async fn ws_handler(
    Path(room_id): Path<String>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> HttpResponse {
    if services()
        .globals
        .shutdown
        .load(atomic::Ordering::Relaxed)
    {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    ws.on_upgrade(move |socket| handle_socket(socket, room_id, remote))
}

#[tracing::instrument(skip(socket))]
async fn handle_socket(socket: WebSocket, room_id: String, remote: SocketAddr) {
    if !is_valid_room_id(&room_id) {
        info!("Invalid room UUID: {room_id}");
        close(socket, ERR_INVALID_UUID, "Invalid room id").await;
        return;
    }

    let client_ip = remote.ip();
    services().globals.register_client(client_ip);

    let (mut sink, stream) = socket.split();
    match services()
        .game
        .handle_connection(room_id.clone(), client_ip, requests(stream))
        .await
    {
        Ok(mut responses) => {
            let mut failure = None;
            while let Some(item) = responses.next().await {
                match item {
                    Ok(response) => {
                        let frame = serde_json::to_string(&response)
                            .expect("responses always serialize");
                        if sink.send(Message::Text(frame)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        failure = Some(e);
                        break;
                    }
                }
            }

            match failure {
                Some(e) => {
                    info!(error = %e, "Closing connection to {client_ip}");
                    close_sink(&mut sink, close_code(&e), &e.to_string()).await;
                }
                // Disconnecting is a perfectly normal thing to happen, so
                // just finish cleanly.
                None => {
                    let _ = sink.close().await;
                }
            }
        }
        Err(e) => {
            info!(error = %e, "Rejecting connection to {client_ip}");
            close_sink(&mut sink, close_code(&e), &e.to_string()).await;
        }
    }

    services().globals.unregister_client(client_ip);
}

/// Turns inbound frames into typed requests. A malformed frame yields an
/// error item, which tears the connection down with `ERR_INVALID_REQUEST`.
fn requests(stream: SplitStream<WebSocket>) -> BoxStream<'static, Result<Request>> {
    stream
        .filter_map(|message| async move {
            match message {
                Ok(Message::Text(raw)) => match serde_json::from_str::<Request>(&raw) {
                    Ok(request) => Some(Ok(request)),
                    Err(e) => {
                        info!(error = %e, "Invalid json received from client");
                        Some(Err(Error::InvalidRequest("Malformed request frame")))
                    }
                },
                Ok(Message::Binary(_)) => {
                    Some(Err(Error::InvalidRequest("Binary frames are not supported")))
                }
                Ok(Message::Ping(_) | Message::Pong(_)) => None,
                // Client closes and transport errors both end the stream.
                Ok(Message::Close(_)) | Err(_) => None,
            }
        })
        .boxed()
}

/// The path must be a canonical hex-and-hyphen UUIDv4.
fn is_valid_room_id(room_id: &str) -> bool {
    let Ok(uuid) = Uuid::parse_str(room_id) else {
        return false;
    };
    uuid.get_version_num() == 4 && uuid.as_simple().to_string() == room_id.replace('-', "")
}

fn close_code(error: &Error) -> u16 {
    match error {
        Error::TooManyConnections => ERR_TOO_MANY_CONNECTIONS,
        Error::RoomFull => ERR_ROOM_FULL,
        Error::TooManyRoomsCreated => ERR_TOO_MANY_ROOMS_CREATED,
        Error::InvalidRequest(_) => ERR_INVALID_REQUEST,
        Error::InvalidConnection { code, .. } => *code,
        // Backend faults kill the room for this client
        _ => ERR_INVALID_ROOM,
    }
}

async fn close(mut socket: WebSocket, code: u16, reason: &str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: Cow::Owned(reason.to_owned()),
        })))
        .await;
}

async fn close_sink(sink: &mut SplitSink<WebSocket, Message>, code: u16, reason: &str) {
    let _ = sink
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: Cow::Owned(reason.to_owned()),
        })))
        .await;
}

/// Periodically re-marks this server (and its connected addresses) as alive
/// so counters we hold aren't reclaimed as stale. Offset by a random amount
/// so a fleet doesn't refresh in lockstep, while staying well under the
/// expiration.
pub async fn maintain_liveness() {
    loop {
        debug!("Refreshing server liveness");
        let ips = services().globals.connected_ips();
        if let Err(e) = services().rate_limiting.refresh_server_liveness(&ips).await {
            warn!(error = %e, "Failed to refresh server liveness");
        }

        let base = SERVER_LIVENESS_EXPIRATION.as_secs_f64() / 3.0;
        let max_offset = SERVER_LIVENESS_EXPIRATION.as_secs_f64() / 16.0;
        let offset = rand::thread_rng().gen_range(-max_offset..max_offset);
        tokio::time::sleep(Duration::from_secs_f64(base + offset)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::is_valid_room_id;

    #[test]
    fn canonical_v4_uuids_are_accepted() {
        assert!(is_valid_room_id("f3b9079e-5516-4b47-aafc-d2d96e84737e"));
        // Hyphens are optional as long as the hex digits survive
        assert!(is_valid_room_id("f3b9079e55164b47aafcd2d96e84737e"));
    }

    #[test]
    fn non_canonical_room_ids_are_rejected() {
        assert!(!is_valid_room_id("lobby"));
        assert!(!is_valid_room_id(""));
        // v1 uuid
        assert!(!is_valid_room_id("8a6e0804-2bd0-11ef-9454-0242ac120002"));
        // Uppercase is not the canonical form
        assert!(!is_valid_room_id("F3B9079E-5516-4B47-AAFC-D2D96E84737E"));
        // urn prefix parses as a uuid but is not a bare id
        assert!(!is_valid_room_id(
            "urn:uuid:f3b9079e-5516-4b47-aafc-d2d96e84737e"
        ));
    }
}
