// Common test utilities for the integration tests.
//
// The double sits at the Transport seam: the real engine logic runs, stanzas
// it sends are recorded, and tests inject inbound stanzas as if a server had
// delivered them.

#![allow(dead_code)]

use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use async_trait::async_trait;
use log::LevelFilter;
use tokio::sync::mpsc;
use xmpp_parsers::Element;

use colloq::credentials::MeetSettings;
use colloq::signaling::{classify_body, CallSignal, MessageBody};
use colloq::xmpp::ns;
use colloq::{
    Contact, Event, EventKind, Presence, SessionEngine, Transport, TransportError,
    TransportEvent,
};

static INIT_LOGGER: Once = Once::new();

pub fn setup_logging() {
    INIT_LOGGER.call_once(|| {
        let _ = env_logger::Builder::new()
            .filter_level(LevelFilter::Debug)
            .is_test(true)
            .try_init();
    });
}

#[derive(Default)]
pub struct MockConfig {
    pub fail_auth: bool,
    pub open_delay: Option<Duration>,
}

/// In-memory transport. `open` hands out the inbound event receiver; the
/// paired handle keeps the sender plus views on everything the engine sent.
pub struct MockTransport {
    sent: Arc<Mutex<Vec<Element>>>,
    receiver: Mutex<Option<mpsc::Receiver<TransportEvent>>>,
    open_calls: Arc<AtomicUsize>,
    closed: Arc<AtomicBool>,
    config: MockConfig,
}

pub struct MockHandle {
    tx: mpsc::Sender<TransportEvent>,
    pub sent: Arc<Mutex<Vec<Element>>>,
    pub open_calls: Arc<AtomicUsize>,
    pub closed: Arc<AtomicBool>,
    answered: Arc<Mutex<HashSet<String>>>,
}

impl MockTransport {
    pub fn pair() -> (Arc<MockTransport>, MockHandle) {
        Self::pair_with(MockConfig::default())
    }

    pub fn pair_with(config: MockConfig) -> (Arc<MockTransport>, MockHandle) {
        let (tx, rx) = mpsc::channel(100);
        let sent = Arc::new(Mutex::new(Vec::new()));
        let open_calls = Arc::new(AtomicUsize::new(0));
        let closed = Arc::new(AtomicBool::new(false));
        let transport = Arc::new(MockTransport {
            sent: sent.clone(),
            receiver: Mutex::new(Some(rx)),
            open_calls: open_calls.clone(),
            closed: closed.clone(),
            config,
        });
        let handle = MockHandle {
            tx,
            sent,
            open_calls,
            closed,
            answered: Arc::new(Mutex::new(HashSet::new())),
        };
        (transport, handle)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open(
        &self,
        _jid: &str,
        _password: &str,
    ) -> Result<mpsc::Receiver<TransportEvent>, TransportError> {
        self.open_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.config.open_delay {
            tokio::time::sleep(delay).await;
        }
        if self.config.fail_auth {
            return Err(TransportError::Auth("not-authorized".to_string()));
        }
        let receiver = self.receiver.lock().unwrap().take();
        receiver.ok_or_else(|| TransportError::Connection("transport already opened".to_string()))
    }

    async fn send(&self, stanza: Element) -> Result<(), TransportError> {
        self.sent.lock().unwrap().push(stanza);
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

impl MockHandle {
    /// Deliver a stanza to the engine as if the server had sent it.
    pub async fn inject(&self, stanza: Element) {
        self.tx
            .send(TransportEvent::Stanza(stanza))
            .await
            .expect("engine dispatch task is gone");
    }

    pub async fn drop_connection(&self, reason: &str) {
        let _ = self
            .tx
            .send(TransportEvent::Disconnected(reason.to_string()))
            .await;
    }

    pub fn sent_stanzas(&self) -> Vec<Element> {
        self.sent.lock().unwrap().clone()
    }

    /// Bodies of chat messages sent to `to`.
    pub fn messages_to(&self, to: &str) -> Vec<String> {
        self.sent_stanzas()
            .iter()
            .filter(|s| s.name() == "message" && s.attr("to") == Some(to))
            .filter_map(|s| s.get_child("body", ns::JABBER_CLIENT).map(|b| b.text()))
            .collect()
    }

    /// Call signals sent to `to`, in order.
    pub fn signals_to(&self, to: &str) -> Vec<CallSignal> {
        self.messages_to(to)
            .iter()
            .filter_map(|body| match classify_body(body) {
                MessageBody::Call(signal) => Some(signal),
                _ => None,
            })
            .collect()
    }

    /// Addresses probed for presence, in order.
    pub fn probed(&self) -> Vec<String> {
        self.presences_of_type("probe")
    }

    /// Addresses a subscription request was sent to.
    pub fn subscribed_to(&self) -> Vec<String> {
        self.presences_of_type("subscribe")
    }

    /// Addresses whose subscription requests we accepted.
    pub fn accepted_subscriptions(&self) -> Vec<String> {
        self.presences_of_type("subscribed")
    }

    fn presences_of_type(&self, presence_type: &str) -> Vec<String> {
        self.sent_stanzas()
            .iter()
            .filter(|s| s.name() == "presence" && s.attr("type") == Some(presence_type))
            .filter_map(|s| s.attr("to").map(|t| t.to_string()))
            .collect()
    }

    /// True once an availability broadcast (presence without a type) went out.
    pub fn broadcast_presence_sent(&self) -> bool {
        self.sent_stanzas()
            .iter()
            .any(|s| s.name() == "presence" && s.attr("type").is_none())
    }

    pub fn unavailable_presence_sent(&self) -> bool {
        self.sent_stanzas()
            .iter()
            .any(|s| s.name() == "presence" && s.attr("type") == Some("unavailable"))
    }

    fn unanswered_iq(&self, iq_type: &str, child: &str, child_ns: &str) -> Option<String> {
        let sent = self.sent.lock().unwrap();
        let answered = self.answered.lock().unwrap();
        for stanza in sent.iter() {
            if stanza.name() != "iq" || stanza.attr("type") != Some(iq_type) {
                continue;
            }
            if stanza.get_child(child, child_ns).is_none() {
                continue;
            }
            if let Some(id) = stanza.attr("id") {
                if !answered.contains(id) {
                    return Some(id.to_string());
                }
            }
        }
        None
    }

    async fn take_iq(&self, what: &str, iq_type: &str, child: &str, child_ns: &str) -> String {
        let id =
            wait_for_value(what, || self.unanswered_iq(iq_type, child, child_ns)).await;
        self.answered.lock().unwrap().insert(id.clone());
        id
    }

    /// Wait for the next unanswered roster query and reply with the given
    /// items (jid, name, subscription).
    pub async fn answer_roster(&self, items: &[(&str, &str, &str)]) {
        let id = self
            .take_iq("a roster query", "get", "query", ns::ROSTER)
            .await;
        self.inject(roster_result(&id, items)).await;
    }

    /// Wait for the next unanswered roster query and reject it.
    pub async fn reject_roster(&self, condition: &str) {
        let id = self
            .take_iq("a roster query", "get", "query", ns::ROSTER)
            .await;
        self.inject(iq_error(&id, condition)).await;
    }

    /// Acknowledge the next roster mutation (add/remove).
    pub async fn ack_roster_set(&self) {
        let id = self
            .take_iq("a roster mutation", "set", "query", ns::ROSTER)
            .await;
        self.inject(iq_result(&id)).await;
    }

    /// Reject the next roster mutation.
    pub async fn reject_roster_set(&self, condition: &str) {
        let id = self
            .take_iq("a roster mutation", "set", "query", ns::ROSTER)
            .await;
        self.inject(iq_error(&id, condition)).await;
    }

    /// Wait for the next unanswered vCard query and reply with the payload.
    pub async fn answer_vcard(&self, vcard: Element) {
        let id = self.take_iq("a vCard query", "get", "vCard", ns::VCARD).await;
        let iq = Element::builder("iq", ns::JABBER_CLIENT)
            .attr("type", "result")
            .attr("id", &id)
            .append(vcard)
            .build();
        self.inject(iq).await;
    }

    /// Reject the next vCard query.
    pub async fn reject_vcard(&self, condition: &str) {
        let id = self.take_iq("a vCard query", "get", "vCard", ns::VCARD).await;
        self.inject(iq_error(&id, condition)).await;
    }

    /// Acknowledge the next vCard publish.
    pub async fn ack_vcard_set(&self) {
        let id = self
            .take_iq("a vCard publish", "set", "vCard", ns::VCARD)
            .await;
        self.inject(iq_result(&id)).await;
    }
}

// ---------------------------------------------------------------------------
// Stanza builders
// ---------------------------------------------------------------------------

pub fn presence_stanza(from: &str, presence_type: Option<&str>, show: Option<&str>) -> Element {
    let mut builder = Element::builder("presence", ns::JABBER_CLIENT).attr("from", from);
    if let Some(t) = presence_type {
        builder = builder.attr("type", t);
    }
    let mut presence = builder.build();
    if let Some(value) = show {
        let mut show_el = Element::builder("show", "").build();
        show_el.append_text_node(value);
        presence.append_child(show_el);
    }
    presence
}

pub fn message_stanza(from: &str, body: &str) -> Element {
    let mut body_el = Element::builder("body", ns::JABBER_CLIENT).build();
    body_el.append_text_node(body);
    Element::builder("message", ns::JABBER_CLIENT)
        .attr("from", from)
        .attr("type", "chat")
        .append(body_el)
        .build()
}

pub fn signal_message(from: &str, signal: &CallSignal) -> Element {
    message_stanza(from, &serde_json::to_string(signal).unwrap())
}

pub fn roster_result(id: &str, items: &[(&str, &str, &str)]) -> Element {
    let mut query = Element::builder("query", ns::ROSTER).build();
    for (jid, name, subscription) in items {
        let item = Element::builder("item", ns::ROSTER)
            .attr("jid", *jid)
            .attr("name", *name)
            .attr("subscription", *subscription)
            .build();
        query.append_child(item);
    }
    Element::builder("iq", ns::JABBER_CLIENT)
        .attr("type", "result")
        .attr("id", id)
        .append(query)
        .build()
}

pub fn iq_result(id: &str) -> Element {
    Element::builder("iq", ns::JABBER_CLIENT)
        .attr("type", "result")
        .attr("id", id)
        .build()
}

pub fn iq_error(id: &str, condition: &str) -> Element {
    let mut error = Element::builder("error", ns::JABBER_CLIENT)
        .attr("type", "cancel")
        .build();
    error.append_child(
        Element::builder(condition, "urn:ietf:params:xml:ns:xmpp-stanzas").build(),
    );
    Element::builder("iq", ns::JABBER_CLIENT)
        .attr("type", "error")
        .attr("id", id)
        .append(error)
        .build()
}

// ---------------------------------------------------------------------------
// Event capture
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct EventRecorder {
    events: Arc<Mutex<Vec<Event>>>,
}

impl EventRecorder {
    pub fn attach(engine: &SessionEngine) -> Self {
        let recorder = EventRecorder {
            events: Arc::new(Mutex::new(Vec::new())),
        };
        let kinds = [
            EventKind::Roster,
            EventKind::Message,
            EventKind::CallInvite,
            EventKind::CallReady,
            EventKind::CallEnded,
            EventKind::MeetingInvite,
        ];
        for kind in kinds {
            let events = recorder.events.clone();
            engine.subscribe(kind, move |event| {
                events.lock().unwrap().push(event.clone());
            });
        }
        recorder
    }

    pub fn all(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, kind: EventKind) -> usize {
        self.all().iter().filter(|e| e.kind() == kind).count()
    }

    pub fn last_roster(&self) -> Option<Vec<Contact>> {
        self.all()
            .iter()
            .rev()
            .find_map(|event| match event {
                Event::RosterChanged(contacts) => Some(contacts.clone()),
                _ => None,
            })
    }
}

// ---------------------------------------------------------------------------
// Waiting helpers
// ---------------------------------------------------------------------------

const WAIT_ROUNDS: usize = 1000;
const WAIT_STEP: Duration = Duration::from_millis(2);

pub async fn wait_for_value<T, F>(what: &str, mut probe: F) -> T
where
    F: FnMut() -> Option<T>,
{
    for _ in 0..WAIT_ROUNDS {
        if let Some(value) = probe() {
            return value;
        }
        tokio::time::sleep(WAIT_STEP).await;
    }
    panic!("timed out waiting for {}", what);
}

pub async fn wait_until<F, Fut>(what: &str, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..WAIT_ROUNDS {
        if condition().await {
            return;
        }
        tokio::time::sleep(WAIT_STEP).await;
    }
    panic!("timed out waiting for {}", what);
}

// ---------------------------------------------------------------------------
// Engine setup
// ---------------------------------------------------------------------------

pub fn test_settings() -> MeetSettings {
    MeetSettings::new("meet.example.com", "8443")
}

/// Engine connected through a mock transport, with the given contacts in the
/// roster at the given presence.
pub async fn connected_engine(
    contacts: &[(&str, Presence)],
) -> (SessionEngine, MockHandle, EventRecorder) {
    setup_logging();
    let (transport, handle) = MockTransport::pair();
    let engine = SessionEngine::new(transport, test_settings());
    let recorder = EventRecorder::attach(&engine);

    engine
        .connect("example.com", "alice", "secret")
        .await
        .expect("connect through mock transport failed");

    // Answer the roster fetch that connect kicks off.
    let items: Vec<(&str, &str, &str)> =
        contacts.iter().map(|(jid, _)| (*jid, *jid, "both")).collect();
    handle.answer_roster(&items).await;

    let expected_len = contacts.len();
    {
        let engine = engine.clone();
        wait_until("the roster to be populated", move || {
            let engine = engine.clone();
            async move { engine.contacts().await.len() == expected_len }
        })
        .await;
    }

    // Drive each contact to its requested presence.
    for (jid, presence) in contacts {
        let stanza = match presence {
            Presence::Online => presence_stanza(&format!("{}/desk", jid), None, None),
            Presence::Away => presence_stanza(jid, None, Some("away")),
            Presence::Busy => presence_stanza(jid, None, Some("dnd")),
            Presence::AwayForLong => presence_stanza(jid, None, Some("xa")),
            Presence::Offline => presence_stanza(jid, Some("unavailable"), None),
            Presence::Unknown => continue,
        };
        handle.inject(stanza).await;
    }

    let expected: Vec<(String, Presence)> = contacts
        .iter()
        .map(|(jid, presence)| (jid.to_string(), *presence))
        .collect();
    {
        let engine = engine.clone();
        wait_until("presence to settle", move || {
            let engine = engine.clone();
            let expected = expected.clone();
            async move {
                let roster = engine.contacts().await;
                expected.iter().all(|(jid, presence)| {
                    roster
                        .iter()
                        .any(|c| &c.jid == jid && c.presence == *presence)
                })
            }
        })
        .await;
    }

    (engine, handle, recorder)
}
