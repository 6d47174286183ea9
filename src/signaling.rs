// Call signaling carried inside chat-message bodies.
//
// Call setup is not a native protocol feature here: invitations travel as
// JSON payloads in ordinary `<message/>` bodies with an explicit status
// field. The decode happens exactly once, at the message boundary, into a
// tagged variant; downstream code never re-sniffs payload shapes.

use std::fmt;
use std::time::Duration;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

/// How long an outbound attempt rings before it resolves to `missed`.
pub const CALL_TIMEOUT: Duration = Duration::from_secs(120);

const ROOM_ID_LEN: usize = 10;
const ROOM_ID_ALPHABET: &[u8] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

/// Peers send the port as either a JSON string or a number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Port {
    Number(u16),
    Text(String),
}

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Port::Number(n) => write!(f, "{}", n),
            Port::Text(s) => f.write_str(s),
        }
    }
}

/// The `type` field of a call-control payload. A single-variant enum so that
/// deserialization itself rejects bodies whose `type` is anything but
/// `"call"`; a chat message that merely mentions a `status` field will not
/// decode as a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallKind {
    #[serde(rename = "call")]
    Call,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    Calling,
    Accepted,
    Canceled,
    Missed,
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            CallStatus::Calling => "calling",
            CallStatus::Accepted => "accepted",
            CallStatus::Canceled => "canceled",
            CallStatus::Missed => "missed",
        };
        f.write_str(text)
    }
}

/// A call-control message: one of calling/accepted/canceled/missed, tied to
/// a room on the meeting host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallSignal {
    pub domain: String,
    pub port: Port,
    pub token: String,
    #[serde(rename = "roomId")]
    pub room_id: String,
    #[serde(rename = "type")]
    pub kind: CallKind,
    pub status: CallStatus,
    pub jid: String,
}

impl CallSignal {
    pub fn join_url(&self) -> String {
        format!("https://{}:{}/{}", self.domain, self.port, self.room_id)
    }
}

/// A status-less invitation: the four bare fields interpreted as a direct
/// join URL, outside the negotiated call flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeetingInvite {
    pub domain: String,
    pub port: Port,
    pub token: String,
    #[serde(rename = "roomId")]
    pub room_id: String,
}

impl MeetingInvite {
    pub fn join_url(&self) -> String {
        format!("https://{}:{}/{}", self.domain, self.port, self.room_id)
    }
}

/// What a message body turned out to be.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageBody {
    Call(CallSignal),
    Meeting(MeetingInvite),
    Plain(String),
}

/// Decode a message body once. Call signals are tried before meeting
/// invitations because every signal also carries the invitation's four
/// fields; anything that is not JSON with the expected shape is plain chat.
pub fn classify_body(body: &str) -> MessageBody {
    if !body.trim_start().starts_with('{') {
        return MessageBody::Plain(body.to_string());
    }
    if let Ok(signal) = serde_json::from_str::<CallSignal>(body) {
        return MessageBody::Call(signal);
    }
    if let Ok(invite) = serde_json::from_str::<MeetingInvite>(body) {
        return MessageBody::Meeting(invite);
    }
    MessageBody::Plain(body.to_string())
}

/// Random 10-letter room identifier, [A-Za-z] only.
pub fn generate_room_id() -> String {
    let mut rng = rand::thread_rng();
    (0..ROOM_ID_LEN)
        .map(|_| ROOM_ID_ALPHABET[rng.gen_range(0..ROOM_ID_ALPHABET.len())] as char)
        .collect()
}

/// Opaque room token. The meeting host treats it as a bearer secret, so it
/// only has to be unguessable.
pub fn generate_token() -> String {
    let mut bytes = [0u8; 24];
    rand::thread_rng().fill(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// One outbound call invitation awaiting acceptance.
#[derive(Debug, Clone, PartialEq)]
pub struct CallAttempt {
    /// Bare address of the callee.
    pub target: String,
    pub room_id: String,
    pub token: String,
    pub status: CallStatus,
    /// Unix timestamp of when the attempt was placed.
    pub started_at: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CallState {
    Idle,
    Calling(CallAttempt),
}

/// Holds the current call state plus the expiry timer for the outstanding
/// attempt. At most one attempt is ever in flight; the timer is disarmed on
/// every transition out of `Calling`.
pub(crate) struct CallMachine {
    state: CallState,
    timer: Option<JoinHandle<()>>,
}

impl CallMachine {
    pub(crate) fn new() -> Self {
        CallMachine {
            state: CallState::Idle,
            timer: None,
        }
    }

    pub(crate) fn attempt(&self) -> Option<&CallAttempt> {
        match &self.state {
            CallState::Calling(attempt) => Some(attempt),
            CallState::Idle => None,
        }
    }

    pub(crate) fn begin(&mut self, attempt: CallAttempt, timer: JoinHandle<()>) {
        self.disarm();
        self.state = CallState::Calling(attempt);
        self.timer = Some(timer);
    }

    /// Leave `Calling`, returning the attempt stamped with its resolution.
    pub(crate) fn resolve(&mut self, status: CallStatus) -> Option<CallAttempt> {
        self.disarm();
        match std::mem::replace(&mut self.state, CallState::Idle) {
            CallState::Calling(mut attempt) => {
                attempt.status = status;
                Some(attempt)
            }
            CallState::Idle => None,
        }
    }

    /// Drop any state without signaling the peer, as on disconnect.
    pub(crate) fn reset(&mut self) {
        self.disarm();
        self.state = CallState::Idle;
    }

    fn disarm(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}
