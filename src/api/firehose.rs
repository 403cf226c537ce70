/// Firehose WebSocket
///
/// Serves the sequencer's stream as DAG-CBOR frames. Clients resume with
/// a `cursor` query parameter; backfill arrives before live events, and
/// a client that cannot drain its channel is disconnected rather than
/// allowed to stall the sequencer.
use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::Response,
};
use futures::{sink::SinkExt, stream::StreamExt};
use serde::Deserialize;
use tokio::time::{interval, Duration};

use crate::context::AppContext;
use crate::sequencer::SeqEvent;

const PING_INTERVAL_SECS: u64 = 30;

#[derive(Debug, Deserialize)]
pub struct SubscribeReposParams {
    /// Resume from this sequence number (exclusive)
    pub cursor: Option<i64>,
}

pub async fn subscribe_repos(
    ws: WebSocketUpgrade,
    Query(params): Query<SubscribeReposParams>,
    State(ctx): State<AppContext>,
) -> Response {
    ws.on_upgrade(move |socket| handle_subscription(socket, params, ctx))
}

async fn handle_subscription(socket: WebSocket, params: SubscribeReposParams, ctx: AppContext) {
    let mut events = match ctx.sequencer.subscribe(params.cursor).await {
        Ok(events) => events,
        Err(e) => {
            tracing::error!(error = %e, "failed to open firehose subscription");
            return;
        }
    };
    let (mut sender, mut receiver) = socket.split();
    let mut ping = interval(Duration::from_secs(PING_INTERVAL_SECS));
    ping.reset();

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else {
                    // Sequencer dropped us (slow consumer) or shut down
                    break;
                };
                match encode_frame(&event) {
                    Ok(frame) => {
                        if sender.send(Message::Binary(frame)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::error!(error = %e, seq = event.seq(), "failed to encode frame");
                    }
                }
            }
            _ = ping.tick() => {
                if sender.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    _ => {}
                }
            }
        }
    }
    tracing::debug!("firehose subscriber disconnected");
}

/// One event as a DAG-CBOR frame
fn encode_frame(event: &SeqEvent) -> Result<Vec<u8>, serde_cbor::Error> {
    serde_cbor::to_vec(event)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sequencer::IdentityEvent;

    #[test]
    fn test_frame_encoding_is_cbor() {
        let event = SeqEvent::Identity {
            seq: 7,
            time: "2026-08-07T00:00:00Z".to_string(),
            evt: IdentityEvent {
                did: "did:plc:frame".to_string(),
                handle: Some("frame.test".to_string()),
            },
        };
        let frame = encode_frame(&event).unwrap();
        let value: serde_cbor::Value = serde_cbor::from_slice(&frame).unwrap();
        match value {
            serde_cbor::Value::Map(map) => {
                let has_type = map.keys().any(|k| {
                    matches!(k, serde_cbor::Value::Text(t) if t == "$type")
                });
                assert!(has_type);
            }
            other => panic!("expected map frame, got {:?}", other),
        }
    }
}
