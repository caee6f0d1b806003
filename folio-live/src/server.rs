//! Live WebSocket endpoint for browsers.
//!
//! ```text
//! GET ws://live_addr/?userId=<uuid>      (or x-user-id header)
//!   server → client  {"type":"change","entity":..,"op":..,"id":..}
//!   client → server  ping control frames or {"type":"ping"}
//! ```
//!
//! The caller's identity is taken at handshake; a request without one is
//! refused with 401. Each accepted socket is one entry in the
//! [`ConnectionRegistry`]. When the fan-out drops the entry for
//! backpressure, the socket is closed.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::error::BrokerError;
use crate::fanout::ConnectionRegistry;
use crate::protocol::LiveMessage;

pub const USER_ID_PARAM: &str = "userId";
pub const USER_ID_HEADER: &str = "x-user-id";

/// Caller identity from the handshake request.
pub fn caller_from_request(req: &Request) -> Option<Uuid> {
    let from_query = req.uri().query().and_then(|query| {
        query.split('&').find_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            (key == USER_ID_PARAM).then(|| Uuid::parse_str(value).ok())?
        })
    });
    from_query.or_else(|| {
        req.headers()
            .get(USER_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| Uuid::parse_str(v.trim()).ok())
    })
}

pub struct LiveServer {
    bind_addr: String,
    registry: Arc<ConnectionRegistry>,
}

impl LiveServer {
    pub fn new(bind_addr: impl Into<String>, registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            bind_addr: bind_addr.into(),
            registry,
        }
    }

    pub async fn run(&self) -> Result<(), BrokerError> {
        let listener = TcpListener::bind(&self.bind_addr).await?;
        log::info!("Live server listening on {}", self.bind_addr);
        self.serve(listener).await
    }

    pub async fn serve(&self, listener: TcpListener) -> Result<(), BrokerError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            let registry = self.registry.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, registry).await {
                    log::debug!("Live connection from {addr} ended with error: {e}");
                }
            });
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        registry: Arc<ConnectionRegistry>,
    ) -> Result<(), BrokerError> {
        let mut caller = None;
        let callback = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            match caller_from_request(req) {
                Some(user_id) => {
                    caller = Some(user_id);
                    Ok(resp)
                }
                None => {
                    let mut refusal = ErrorResponse::new(Some("missing or invalid userId".into()));
                    *refusal.status_mut() = StatusCode::UNAUTHORIZED;
                    Err(refusal)
                }
            }
        };
        let ws_stream = tokio_tungstenite::accept_hdr_async(stream, callback).await?;
        let Some(user_id) = caller else {
            return Ok(());
        };

        let (conn_id, mut outbound) = registry.register(user_id).await;
        log::info!("Live connection {conn_id} for {user_id} from {addr}");

        let result = Self::pump(ws_stream, &mut outbound).await;

        registry.unregister(user_id, conn_id).await;
        log::info!("Live connection {conn_id} for {user_id} closed");
        result
    }

    async fn pump(
        ws_stream: WebSocketStream<TcpStream>,
        outbound: &mut mpsc::Receiver<Arc<String>>,
    ) -> Result<(), BrokerError> {
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => match LiveMessage::from_json(&text) {
                            Ok(LiveMessage::Ping) => {
                                let pong = LiveMessage::Pong.to_json()?;
                                ws_sender.send(Message::Text(pong.into())).await?;
                            }
                            Ok(_) => {}
                            Err(e) => log::debug!("Ignoring client text frame: {e}"),
                        },
                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Close(_))) | None => return Ok(()),
                        Some(Err(e)) => return Err(e.into()),
                        _ => {}
                    }
                }

                out = outbound.recv() => {
                    match out {
                        Some(text) => {
                            ws_sender.send(Message::Text(text.as_str().to_owned().into())).await?;
                        }
                        None => {
                            // Dropped by the fan-out
                            let _ = ws_sender.send(Message::Close(None)).await;
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn bind_addr(&self) -> &str {
        &self.bind_addr
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;

    async fn start() -> (SocketAddr, Arc<ConnectionRegistry>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let registry = Arc::new(ConnectionRegistry::new(4));
        let server = LiveServer::new(addr.to_string(), registry.clone());
        tokio::spawn(async move {
            let _ = server.serve(listener).await;
        });
        (addr, registry)
    }

    async fn wait_for_connections(registry: &ConnectionRegistry, user: Uuid, n: usize) {
        for _ in 0..100 {
            if registry.connection_count(user).await == n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {n} connections for {user}");
    }

    #[test]
    fn test_caller_from_query_and_header() {
        let user = Uuid::new_v4();
        let req = format!("ws://localhost/?foo=1&userId={user}")
            .into_client_request()
            .unwrap();
        assert_eq!(caller_from_request(&req), Some(user));

        let mut req = "ws://localhost/".into_client_request().unwrap();
        assert_eq!(caller_from_request(&req), None);
        req.headers_mut()
            .insert(USER_ID_HEADER, user.to_string().parse().unwrap());
        assert_eq!(caller_from_request(&req), Some(user));

        let req = "ws://localhost/?userId=nope".into_client_request().unwrap();
        assert_eq!(caller_from_request(&req), None);
    }

    #[tokio::test]
    async fn test_delivery_and_text_ping() {
        let (addr, registry) = start().await;
        let user = Uuid::new_v4();
        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/?userId={user}"))
            .await
            .unwrap();
        wait_for_connections(&registry, user, 1).await;

        registry
            .deliver(user, Arc::new(r#"{"type":"pong"}"#.to_string()))
            .await;
        match ws.next().await.unwrap().unwrap() {
            Message::Text(t) => assert_eq!(t.as_str(), r#"{"type":"pong"}"#),
            other => panic!("unexpected {other:?}"),
        }

        ws.send(Message::Text(r#"{"type":"ping"}"#.into())).await.unwrap();
        match ws.next().await.unwrap().unwrap() {
            Message::Text(t) => {
                assert_eq!(LiveMessage::from_json(&t).unwrap(), LiveMessage::Pong)
            }
            other => panic!("unexpected {other:?}"),
        }

        ws.close(None).await.unwrap();
        wait_for_connections(&registry, user, 0).await;
    }

    #[tokio::test]
    async fn test_missing_identity_refused() {
        let (addr, registry) = start().await;
        assert!(tokio_tungstenite::connect_async(format!("ws://{addr}/"))
            .await
            .is_err());
        assert_eq!(registry.total_connections().await, 0);
    }
}
