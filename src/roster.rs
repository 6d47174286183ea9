// The roster store: the authoritative contact list and its presence.
//
// Pure state container. All mutation flows through the session engine, which
// emits a RosterChanged snapshot after each change; nothing here touches the
// network.

use log::debug;

use crate::models::{Contact, Presence};
use crate::utils::bare_jid;

#[derive(Debug, Default)]
pub struct RosterStore {
    contacts: Vec<Contact>,
}

impl RosterStore {
    pub fn new() -> Self {
        RosterStore { contacts: Vec::new() }
    }

    /// Replace the whole contact set, as after a roster query. Duplicate
    /// addresses in the input collapse to the first occurrence so the
    /// one-contact-per-address invariant holds.
    pub fn replace_all(&mut self, contacts: Vec<Contact>) {
        let mut deduped: Vec<Contact> = Vec::with_capacity(contacts.len());
        for contact in contacts {
            if deduped.iter().any(|existing| existing.jid == contact.jid) {
                debug!("Dropping duplicate roster entry for {}", contact.jid);
                continue;
            }
            deduped.push(contact);
        }
        self.contacts = deduped;
    }

    /// Patch the presence of a known contact. Returns false when no contact
    /// with that address exists; the caller decides whether to log and drop.
    pub fn upsert_presence(&mut self, jid: &str, presence: Presence) -> bool {
        let bare = bare_jid(jid);
        match self.contacts.iter_mut().find(|c| c.jid == bare) {
            Some(contact) => {
                contact.presence = presence;
                true
            }
            None => false,
        }
    }

    /// Attach a fetched profile to a known contact.
    pub fn upsert_profile(&mut self, jid: &str, profile: crate::models::UserProfile) -> bool {
        let bare = bare_jid(jid);
        match self.contacts.iter_mut().find(|c| c.jid == bare) {
            Some(contact) => {
                contact.profile = Some(profile);
                true
            }
            None => false,
        }
    }

    pub fn find(&self, jid: &str) -> Option<&Contact> {
        let bare = bare_jid(jid);
        self.contacts.iter().find(|c| c.jid == bare)
    }

    /// Cloned snapshot of the current contact set, in roster order.
    pub fn all(&self) -> Vec<Contact> {
        self.contacts.clone()
    }

    pub fn len(&self) -> usize {
        self.contacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contacts.is_empty()
    }
}
