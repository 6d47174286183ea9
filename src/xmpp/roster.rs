// Roster operations over IQ: fetch, add, remove.

use log::{debug, info, warn};
use once_cell::sync::Lazy;
use regex::Regex;
use uuid::Uuid;
use xmpp_parsers::Element;

use crate::error::EngineError;
use crate::events::Event;
use crate::models::{Contact, Subscription};
use crate::utils::bare_jid;
use crate::xmpp::{iq_error_text, ns, SessionEngine};

static JID_REGEX: Lazy<Regex> = Lazy::new(|| {
    // localpart@domainpart, resource already stripped by the callers
    Regex::new(r"^[^@/\s]+@[^@/\s]+\.[^@/\s.]+$").expect("JID pattern is valid")
});

/// Check that an address looks like `user@domain.tld` before we hand it to
/// the server.
pub fn validate_jid(jid: &str) -> bool {
    if !JID_REGEX.is_match(jid) {
        return false;
    }
    // The domain must not have empty labels.
    match jid.split('@').nth(1) {
        Some(domain) => !domain.contains("..") && !domain.starts_with('.'),
        None => false,
    }
}

impl SessionEngine {
    /// Fetch the contact list and replace the store wholesale. Presence of
    /// every returned contact starts out `unknown`; a probe sweep is kicked
    /// off in the background and fills presence in as answers arrive.
    pub async fn fetch_roster(&self) -> Result<Vec<Contact>, EngineError> {
        self.ensure_connected().await?;

        let id = Uuid::new_v4().to_string();
        let query = Element::builder("query", ns::ROSTER).build();
        let iq = Element::builder("iq", ns::JABBER_CLIENT)
            .attr("type", "get")
            .attr("id", &id)
            .append(query)
            .build();
        debug!("Requesting roster with id {}", id);

        let response = self.send_iq(id, iq).await?;
        match response.attr("type") {
            Some("result") => {}
            Some("error") => {
                return Err(EngineError::RosterOperation(iq_error_text(&response)))
            }
            other => {
                return Err(EngineError::RosterOperation(format!(
                    "unexpected roster response type {:?}",
                    other
                )))
            }
        }

        let mut contacts = Vec::new();
        if let Some(query) = response.get_child("query", ns::ROSTER) {
            for item in query.children() {
                if item.name() != "item" {
                    continue;
                }
                let Some(jid) = item.attr("jid") else {
                    continue;
                };
                let name = item.attr("name").unwrap_or(jid);
                let subscription =
                    Subscription::parse(item.attr("subscription").unwrap_or("none"));
                contacts.push(Contact::new(bare_jid(jid), name, subscription));
            }
        }
        info!("Roster fetched: {} contacts", contacts.len());

        let snapshot = {
            let mut roster = self.inner.roster.lock().await;
            roster.replace_all(contacts);
            roster.all()
        };
        self.emit(Event::RosterChanged(snapshot.clone()));

        // Probing is fire-and-forget relative to the refresh: the fetch is
        // complete once the listing itself is in.
        self.spawn_presence_probes(snapshot.iter().map(|c| c.jid.clone()).collect());

        Ok(snapshot)
    }

    /// Add a roster item, refresh the roster, then ask the contact for a
    /// presence subscription.
    pub async fn add_user(&self, jid: &str, name: &str) -> Result<(), EngineError> {
        self.ensure_connected().await?;
        let bare = bare_jid(jid).to_string();
        if !validate_jid(&bare) {
            return Err(EngineError::RosterOperation(format!(
                "invalid address: {}",
                jid
            )));
        }
        let display_name = if name.is_empty() { bare.as_str() } else { name };

        let id = Uuid::new_v4().to_string();
        let item = Element::builder("item", ns::ROSTER)
            .attr("jid", &bare)
            .attr("name", display_name)
            .build();
        let query = Element::builder("query", ns::ROSTER).append(item).build();
        let iq = Element::builder("iq", ns::JABBER_CLIENT)
            .attr("type", "set")
            .attr("id", &id)
            .append(query)
            .build();
        debug!("Adding {} to roster (request {})", bare, id);

        let response = self.send_iq(id, iq).await?;
        if response.attr("type") == Some("error") {
            return Err(EngineError::RosterOperation(iq_error_text(&response)));
        }

        if let Err(e) = self.fetch_roster().await {
            warn!("Roster refresh after adding {} failed: {}", bare, e);
        }

        let subscribe = Element::builder("presence", ns::JABBER_CLIENT)
            .attr("to", &bare)
            .attr("type", "subscribe")
            .build();
        self.inner
            .transport
            .send(subscribe)
            .await
            .map_err(|e| EngineError::Transport(e.to_string()))?;

        info!("Added {} to roster and sent subscription request", bare);
        Ok(())
    }

    /// Remove a roster item and refresh.
    pub async fn remove_user(&self, jid: &str) -> Result<(), EngineError> {
        self.ensure_connected().await?;
        let bare = bare_jid(jid).to_string();

        let id = Uuid::new_v4().to_string();
        let item = Element::builder("item", ns::ROSTER)
            .attr("jid", &bare)
            .attr("subscription", "remove")
            .build();
        let query = Element::builder("query", ns::ROSTER).append(item).build();
        let iq = Element::builder("iq", ns::JABBER_CLIENT)
            .attr("type", "set")
            .attr("id", &id)
            .append(query)
            .build();
        debug!("Removing {} from roster (request {})", bare, id);

        let response = self.send_iq(id, iq).await?;
        if response.attr("type") == Some("error") {
            return Err(EngineError::RosterOperation(iq_error_text(&response)));
        }

        if let Err(e) = self.fetch_roster().await {
            warn!("Roster refresh after removing {} failed: {}", bare, e);
        }

        info!("Removed {} from roster", bare);
        Ok(())
    }
}
