// Transport seam between the session engine and the wire.
//
// The engine only ever talks to this trait: open a connection, send stanzas,
// read inbound events off a channel. The production implementation wraps
// tokio-xmpp's AsyncClient; tests plug in an in-memory double at the same
// seam.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex as TokioMutex};
use tokio_xmpp::{AsyncClient as XMPPAsyncClient, BareJid as TokioBareJid, Event as XMPPEvent};
use xmpp_parsers::Element;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const EVENT_CHANNEL_CAPACITY: usize = 100;

#[derive(Debug, Error)]
pub enum TransportError {
    /// The server refused the credentials. Kept distinct so the caller can
    /// say "invalid credentials" instead of "network error".
    #[error("authorization rejected by server: {0}")]
    Auth(String),

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("send failed: {0}")]
    Send(String),

    #[error("connection is closed")]
    Closed,
}

/// Inbound units delivered by an open transport, in receipt order.
#[derive(Debug)]
pub enum TransportEvent {
    Stanza(Element),
    Disconnected(String),
}

/// Contract the engine consumes. `open` resolves once the stream is
/// authenticated and usable; stanzas and lifecycle changes then arrive on
/// the returned receiver, one at a time.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn open(
        &self,
        jid: &str,
        password: &str,
    ) -> Result<mpsc::Receiver<TransportEvent>, TransportError>;

    async fn send(&self, stanza: Element) -> Result<(), TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}

/// Production transport over tokio-xmpp.
pub struct XmppTransport {
    client: TokioMutex<Option<Arc<TokioMutex<XMPPAsyncClient>>>>,
}

impl XmppTransport {
    pub fn new() -> Self {
        XmppTransport {
            client: TokioMutex::new(None),
        }
    }

    /// Drive the client until it reports Online or fails. Distinguishes an
    /// authorization failure from every other way the handshake can go
    /// wrong.
    async fn wait_for_online(
        client: &Arc<TokioMutex<XMPPAsyncClient>>,
    ) -> Result<(), TransportError> {
        loop {
            let event = {
                let mut client_guard = client.lock().await;
                client_guard.next().await
            };
            match event {
                Some(XMPPEvent::Online { bound_jid, .. }) => {
                    info!("XMPP stream online as {}", bound_jid);
                    return Ok(());
                }
                Some(XMPPEvent::Disconnected(e)) => {
                    return Err(match e {
                        tokio_xmpp::Error::Auth(auth) => {
                            error!("Authentication failed: {:?}", auth);
                            TransportError::Auth(format!("{:?}", auth))
                        }
                        tokio_xmpp::Error::Io(io_err) => {
                            error!("Network error during connection: {}", io_err);
                            TransportError::Connection(io_err.to_string())
                        }
                        tokio_xmpp::Error::Tls(err) => {
                            error!("TLS error during connection: {}", err);
                            TransportError::Connection(format!("{:?}", err))
                        }
                        other => TransportError::Connection(format!("{:?}", other)),
                    });
                }
                None => {
                    return Err(TransportError::Connection(
                        "stream ended during connection attempt".to_string(),
                    ));
                }
                _ => {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            }
        }
    }
}

impl Default for XmppTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for XmppTransport {
    async fn open(
        &self,
        jid: &str,
        password: &str,
    ) -> Result<mpsc::Receiver<TransportEvent>, TransportError> {
        let tokio_jid = TokioBareJid::from_str(jid)
            .map_err(|e| TransportError::Connection(format!("invalid JID '{}': {}", jid, e)))?;
        if tokio_jid.node_str().is_none() {
            return Err(TransportError::Connection(format!(
                "invalid JID '{}': missing username part",
                jid
            )));
        }

        let client = XMPPAsyncClient::new(tokio_jid, password);
        let client_arc = Arc::new(TokioMutex::new(client));

        match tokio::time::timeout(CONNECT_TIMEOUT, Self::wait_for_online(&client_arc)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(TransportError::Connection(format!(
                    "timed out after {:?}",
                    CONNECT_TIMEOUT
                )))
            }
        }

        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let pump_client = client_arc.clone();
        tokio::spawn(async move {
            loop {
                // The lock is taken with a timeout so outbound sends get a
                // window at the client between polls.
                let event_result = tokio::time::timeout(Duration::from_secs(2), async {
                    let mut client_guard = pump_client.lock().await;
                    client_guard.next().await
                })
                .await;

                let event = match event_result {
                    Ok(event) => event,
                    Err(_) => {
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        continue;
                    }
                };

                match event {
                    Some(XMPPEvent::Stanza(stanza)) => {
                        if event_tx.send(TransportEvent::Stanza(stanza)).await.is_err() {
                            debug!("Transport event receiver dropped, ending pump");
                            break;
                        }
                    }
                    Some(XMPPEvent::Online { bound_jid, .. }) => {
                        debug!("Stream re-announced online as {}", bound_jid);
                    }
                    Some(XMPPEvent::Disconnected(e)) => {
                        let _ = event_tx
                            .send(TransportEvent::Disconnected(format!("{:?}", e)))
                            .await;
                        break;
                    }
                    None => {
                        let _ = event_tx
                            .send(TransportEvent::Disconnected("stream ended".to_string()))
                            .await;
                        break;
                    }
                }
            }
        });

        *self.client.lock().await = Some(client_arc);
        Ok(event_rx)
    }

    async fn send(&self, stanza: Element) -> Result<(), TransportError> {
        let client = self.client.lock().await;
        match client.as_ref() {
            Some(client_ref) => {
                let mut client_guard = client_ref.lock().await;
                client_guard
                    .send_stanza(stanza)
                    .await
                    .map_err(|e| TransportError::Send(format!("{:?}", e)))
            }
            None => Err(TransportError::Closed),
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        let client = self.client.lock().await.take();
        match client {
            Some(client_ref) => {
                let mut client_guard = client_ref.lock().await;
                match client_guard.close().await {
                    Ok(_) => Ok(()),
                    Err(e) => {
                        warn!("Error closing XMPP stream: {:?}", e);
                        Err(TransportError::Connection(format!("{:?}", e)))
                    }
                }
            }
            None => Ok(()),
        }
    }
}
