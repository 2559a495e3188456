//! WebSocket [`Connector`] built on tokio-tungstenite.

use crate::error::{SyncError, SyncResult};
use crate::transport::{Connection, Connector, Inbound, Outbound};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, trace};

/// Dials collectors over `ws://` or `wss://`.
///
/// Each connection is served by two pump tasks: one forwarding queued
/// frames to the socket, one translating socket messages into [`Inbound`]
/// events. Pings and pongs are handled by tungstenite and never surface.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

impl WsConnector {
    /// Creates a WebSocket connector.
    pub fn new() -> Self {
        Self
    }
}

fn connect_error(error: tungstenite::Error) -> SyncError {
    match error {
        tungstenite::Error::Url(e) => SyncError::transport_fatal(format!("invalid url: {e}")),
        tungstenite::Error::HttpFormat(e) => {
            SyncError::transport_fatal(format!("invalid request: {e}"))
        }
        e => SyncError::transport_retryable(format!("websocket connect failed: {e}")),
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &str) -> SyncResult<Connection> {
        let (stream, response) = connect_async(url).await.map_err(connect_error)?;
        debug!(url, status = %response.status(), "websocket handshake complete");

        let (mut sink, mut source) = stream.split();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Outbound>();
        let (events, inbound_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                let result = match frame {
                    Outbound::Text(text) => sink.send(Message::Text(text)).await,
                    Outbound::Close => {
                        let _ = sink.close().await;
                        return;
                    }
                };
                if let Err(e) = result {
                    debug!(error = %e, "websocket write failed");
                    return;
                }
            }
            // Channel dropped: close politely.
            let _ = sink.close().await;
        });

        tokio::spawn(async move {
            while let Some(message) = source.next().await {
                let event = match message {
                    Ok(Message::Text(text)) => Inbound::Text(text),
                    Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                        Ok(text) => Inbound::Text(text),
                        Err(_) => {
                            trace!("ignoring non-utf8 binary frame");
                            continue;
                        }
                    },
                    Ok(Message::Close(frame)) => {
                        let _ = events.send(Inbound::Closed(
                            frame.map(|f| format!("{} {}", f.code, f.reason)),
                        ));
                        return;
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        let _ = events.send(Inbound::Error(e.to_string()));
                        return;
                    }
                };
                if events.send(event).is_err() {
                    return;
                }
            }
            let _ = events.send(Inbound::Closed(None));
        });

        Ok(Connection::new(outbound_tx, inbound_rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sensync_protocol::{AckMessage, BatchMessage};
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    /// Accepts one connection and acks every batch it receives.
    async fn ack_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(tcp).await.unwrap();
            while let Some(Ok(message)) = ws.next().await {
                if let Message::Text(text) = message {
                    let batch = BatchMessage::decode(&text).unwrap();
                    let ack = AckMessage::ok(&batch.table, batch.batch_id);
                    ws.send(Message::Text(ack.encode().unwrap())).await.unwrap();
                }
            }
        });
        format!("ws://{addr}")
    }

    #[tokio::test]
    async fn round_trips_a_batch() {
        let url = ack_server().await;
        let mut connection = WsConnector::new().connect(&url).await.unwrap();

        let batch = BatchMessage::new("ECG_SENSOR", 9, Vec::new(), 0, 0);
        connection
            .outbound
            .send(Outbound::Text(batch.encode().unwrap()))
            .unwrap();

        let Some(Inbound::Text(text)) = connection.inbound.recv().await else {
            panic!("expected an ack frame");
        };
        let ack = AckMessage::decode(&text).unwrap();
        assert!(ack.success);
        assert_eq!(ack.batch_id, 9);

        connection.outbound.send(Outbound::Close).unwrap();
        assert!(matches!(
            connection.inbound.recv().await,
            Some(Inbound::Closed(_)) | Some(Inbound::Error(_)) | None
        ));
    }

    #[tokio::test]
    async fn invalid_url_is_fatal() {
        let err = WsConnector::new().connect("http://collector.local/sync").await.unwrap_err();
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn refused_connection_is_retryable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = WsConnector::new()
            .connect(&format!("ws://{addr}"))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }
}
