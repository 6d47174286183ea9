// colloq: presence-aware XMPP session engine with ad-hoc call signaling.
//
// The engine owns the single live connection, keeps the roster and its
// presence in sync, classifies every inbound stanza, and drives the
// call-invitation state machine. A presentation layer embeds it by calling
// the operations on SessionEngine and subscribing to the events it emits.

pub mod credentials;
pub mod error;
pub mod events;
pub mod models;
pub mod roster;
pub mod signaling;
pub mod utils;
pub mod xmpp;

// Re-export the types collaborators actually touch.
pub use error::EngineError;
pub use events::{Event, EventBus, EventKind, SubscriberId};
pub use models::{Contact, Presence, Subscription, UserProfile};
pub use signaling::{CallAttempt, CallSignal, CallState, CallStatus, MeetingInvite};
pub use xmpp::transport::{Transport, TransportError, TransportEvent, XmppTransport};
pub use xmpp::{ClientState, SessionEngine};
