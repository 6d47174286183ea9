// Session engine: the single owner of the live XMPP session.
//
// One engine instance per process. It owns the transport handle, the roster
// store, the call state machine and the event bus, and it runs the one task
// that drains inbound stanzas. Inbound processing is strictly sequential:
// classification, store mutation and event emission for a stanza complete
// before the next one is taken, so subscribers never observe interleaved
// state. Outbound queries correlate responses through a pending map instead
// of blocking the dispatch path.

use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex as TokioMutex};
use tokio::task::JoinHandle;
use xmpp_parsers::Element;

pub mod calls;
pub mod connection;
pub mod presence;
pub mod roster;
pub mod transport;
pub mod vcard;

pub use self::connection::ClientState;

use crate::credentials::MeetSettings;
use crate::error::EngineError;
use crate::events::{Event, EventBus, EventKind, SubscriberId};
use crate::models::{Contact, UserProfile};
use crate::roster::RosterStore;
use crate::signaling::{classify_body, CallAttempt, CallMachine, MessageBody};
use self::transport::{Transport, TransportEvent, XmppTransport};

/// Core namespaces used on the stanza path.
pub mod ns {
    pub const JABBER_CLIENT: &str = "jabber:client";
    pub const ROSTER: &str = "jabber:iq:roster";
    pub const VCARD: &str = "vcard-temp";
}

/// How long a correlated query waits for its response.
pub(crate) const IQ_TIMEOUT: Duration = Duration::from_secs(10);

pub(crate) struct SessionState {
    pub(crate) jid: String,
    pub(crate) state: ClientState,
    pub(crate) profile: Option<UserProfile>,
}

pub(crate) struct EngineInner {
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) bus: EventBus,
    pub(crate) roster: TokioMutex<RosterStore>,
    pub(crate) calls: TokioMutex<CallMachine>,
    pub(crate) session: TokioMutex<SessionState>,
    /// Guard against a second transport being created behind an in-flight
    /// connect.
    pub(crate) connecting: AtomicBool,
    pub(crate) pending_iq: TokioMutex<HashMap<String, oneshot::Sender<Element>>>,
    pub(crate) settings: MeetSettings,
    pub(crate) dispatcher: TokioMutex<Option<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct SessionEngine {
    pub(crate) inner: Arc<EngineInner>,
}

impl SessionEngine {
    /// Build an engine over an explicit transport. The engine is inert until
    /// `connect` is called.
    pub fn new(transport: Arc<dyn Transport>, settings: MeetSettings) -> Self {
        SessionEngine {
            inner: Arc::new(EngineInner {
                transport,
                bus: EventBus::new(),
                roster: TokioMutex::new(RosterStore::new()),
                calls: TokioMutex::new(CallMachine::new()),
                session: TokioMutex::new(SessionState {
                    jid: String::new(),
                    state: ClientState::Disconnected,
                    profile: None,
                }),
                connecting: AtomicBool::new(false),
                pending_iq: TokioMutex::new(HashMap::new()),
                settings,
                dispatcher: TokioMutex::new(None),
            }),
        }
    }

    /// Engine over the tokio-xmpp transport.
    pub fn with_default_transport(settings: MeetSettings) -> Self {
        Self::new(Arc::new(XmppTransport::new()), settings)
    }

    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> SubscriberId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.inner.bus.subscribe(kind, handler)
    }

    pub fn unsubscribe(&self, kind: EventKind, id: SubscriberId) -> bool {
        self.inner.bus.unsubscribe(kind, id)
    }

    /// Snapshot of the current contact set.
    pub async fn contacts(&self) -> Vec<Contact> {
        self.inner.roster.lock().await.all()
    }

    pub async fn state(&self) -> ClientState {
        self.inner.session.lock().await.state.clone()
    }

    pub async fn jid(&self) -> String {
        self.inner.session.lock().await.jid.clone()
    }

    /// The local user's profile snapshot, if one has been fetched or set.
    pub async fn profile(&self) -> Option<UserProfile> {
        self.inner.session.lock().await.profile.clone()
    }

    /// The outstanding outbound call attempt, if any.
    pub async fn current_call(&self) -> Option<CallAttempt> {
        self.inner.calls.lock().await.attempt().cloned()
    }

    /// Send a plain chat message.
    pub async fn send_message(&self, to: &str, body: &str) -> Result<(), EngineError> {
        self.ensure_connected().await?;
        let mut body_el = Element::builder("body", ns::JABBER_CLIENT).build();
        body_el.append_text_node(body);
        let message = Element::builder("message", ns::JABBER_CLIENT)
            .attr("type", "chat")
            .attr("to", to)
            .append(body_el)
            .build();
        self.inner
            .transport
            .send(message)
            .await
            .map_err(|e| EngineError::Transport(e.to_string()))
    }

    pub(crate) fn emit(&self, event: Event) {
        self.inner.bus.publish(&event);
    }

    pub(crate) async fn ensure_connected(&self) -> Result<(), EngineError> {
        let session = self.inner.session.lock().await;
        if session.state == ClientState::Connected {
            Ok(())
        } else {
            Err(EngineError::NotConnected)
        }
    }

    /// Send a query and wait for the matching response without blocking the
    /// dispatch path. The dispatch task routes the response through the
    /// pending map.
    pub(crate) async fn send_iq(&self, id: String, iq: Element) -> Result<Element, EngineError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.inner.pending_iq.lock().await.insert(id.clone(), response_tx);

        if let Err(e) = self.inner.transport.send(iq).await {
            self.inner.pending_iq.lock().await.remove(&id);
            return Err(EngineError::Transport(e.to_string()));
        }

        match tokio::time::timeout(IQ_TIMEOUT, response_rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(EngineError::Transport(
                "connection lost while waiting for server response".to_string(),
            )),
            Err(_) => {
                self.inner.pending_iq.lock().await.remove(&id);
                Err(EngineError::Transport(format!(
                    "timed out waiting for response to request {}",
                    id
                )))
            }
        }
    }

    pub(crate) fn spawn_dispatcher(
        &self,
        mut events: mpsc::Receiver<TransportEvent>,
    ) -> JoinHandle<()> {
        let engine = self.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    TransportEvent::Stanza(stanza) => engine.handle_stanza(stanza).await,
                    TransportEvent::Disconnected(reason) => {
                        error!("Transport lost: {}", reason);
                        engine.teardown_after_transport_loss().await;
                        break;
                    }
                }
            }
            debug!("Stanza dispatch loop ended");
        })
    }

    async fn handle_stanza(&self, stanza: Element) {
        match stanza.name() {
            "presence" => self.handle_presence(stanza).await,
            "message" => self.handle_message(stanza).await,
            "iq" => self.handle_iq(stanza).await,
            other => debug!("Ignoring stanza of kind '{}'", other),
        }
    }

    async fn handle_message(&self, stanza: Element) {
        let Some(from) = stanza.attr("from") else {
            warn!("Received message stanza without 'from' attribute");
            return;
        };
        let from = from.to_string();

        let body = stanza
            .get_child("body", ns::JABBER_CLIENT)
            .or_else(|| stanza.get_child("body", ""))
            .map(|b| b.text());
        let Some(content) = body else {
            debug!("Message from {} has no body, dropping", from);
            return;
        };
        if content.is_empty() {
            debug!("Message from {} has an empty body, dropping", from);
            return;
        }

        match classify_body(&content) {
            MessageBody::Call(signal) => self.handle_call_signal(&from, signal).await,
            MessageBody::Meeting(invite) => self.handle_meeting_invite(&from, invite).await,
            MessageBody::Plain(text) => {
                info!("Message received from {}", from);
                self.emit(Event::MessageReceived { from, body: text });
            }
        }
    }

    async fn handle_iq(&self, stanza: Element) {
        if let Some(id) = stanza.attr("id").map(|s| s.to_string()) {
            let waiter = self.inner.pending_iq.lock().await.remove(&id);
            if let Some(response_tx) = waiter {
                if response_tx.send(stanza).is_err() {
                    debug!("Requester for iq {} went away before the response", id);
                }
                return;
            }
        }
        // Roster pushes and other server-initiated queries land here.
        debug!(
            "Ignoring unsolicited iq (type {:?}) from {:?}",
            stanza.attr("type"),
            stanza.attr("from")
        );
    }
}

/// Human-readable condition from an iq error response.
pub(crate) fn iq_error_text(stanza: &Element) -> String {
    let error = stanza
        .get_child("error", ns::JABBER_CLIENT)
        .or_else(|| stanza.get_child("error", ""));
    match error {
        Some(error) => {
            let error_type = error.attr("type").unwrap_or("unknown");
            let condition = error
                .children()
                .next()
                .map(|c| c.name().to_string())
                .unwrap_or_else(|| "unspecified".to_string());
            format!("{} ({})", condition, error_type)
        }
        None => "unspecified server error".to_string(),
    }
}
