// Domain models shared across the engine: contacts, presence, profiles.

use std::fmt;

/// Availability of a contact as published over presence stanzas.
///
/// `Unknown` is the state of every contact between a roster refresh and the
/// first presence stanza or probe response for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presence {
    Online,
    Away,
    Busy,
    AwayForLong,
    Offline,
    Unknown,
}

impl Presence {
    /// Map the text of a presence `<show/>` element to a status.
    ///
    /// An unrecognized value means the contact is available but advertises
    /// something we don't model, so it collapses to `Online`.
    pub fn from_show(show: &str) -> Self {
        match show {
            "away" => Presence::Away,
            "dnd" => Presence::Busy,
            "xa" => Presence::AwayForLong,
            _ => Presence::Online,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Presence::Online => "online",
            Presence::Away => "away",
            Presence::Busy => "busy",
            Presence::AwayForLong => "away for long",
            Presence::Offline => "offline",
            Presence::Unknown => "unknown",
        }
    }
}

impl fmt::Display for Presence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Roster subscription state as reported by the server (RFC 6121 §2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subscription {
    None,
    To,
    From,
    Both,
    Remove,
}

impl Subscription {
    /// Parse the `subscription` attribute of a roster item. Anything the
    /// server sends that we don't recognize is treated as `none`.
    pub fn parse(value: &str) -> Self {
        match value {
            "to" => Subscription::To,
            "from" => Subscription::From,
            "both" => Subscription::Both,
            "remove" => Subscription::Remove,
            _ => Subscription::None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Subscription::None => "none",
            Subscription::To => "to",
            Subscription::From => "from",
            Subscription::Both => "both",
            Subscription::Remove => "remove",
        }
    }
}

impl fmt::Display for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A roster entry. The bare JID is the unique key; the store never holds two
/// contacts with the same address.
#[derive(Debug, Clone, PartialEq)]
pub struct Contact {
    pub jid: String,
    pub name: String,
    pub subscription: Subscription,
    pub presence: Presence,
    pub profile: Option<UserProfile>,
}

impl Contact {
    /// A fresh roster entry as returned by a roster query: presence starts
    /// out unknown until a probe response or presence stanza arrives.
    pub fn new(jid: &str, name: &str, subscription: Subscription) -> Self {
        Contact {
            jid: jid.to_string(),
            name: name.to_string(),
            subscription,
            presence: Presence::Unknown,
            profile: None,
        }
    }
}

/// Structured profile data parsed from a vCard.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UserProfile {
    pub full_name: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub organization: Option<String>,
    pub country: Option<String>,
    pub note: Option<String>,
    /// Base64 photo payload as carried in the vCard, if any.
    pub photo: Option<String>,
}

impl UserProfile {
    pub fn is_empty(&self) -> bool {
        self.full_name.is_none()
            && self.first_name.is_none()
            && self.last_name.is_none()
            && self.organization.is_none()
            && self.country.is_none()
            && self.note.is_none()
            && self.photo.is_none()
    }
}
