// Presence handling (RFC 6121): mapping inbound presence onto the roster,
// probing, and the outbound presence broadcasts.

use log::{error, info, warn};
use xmpp_parsers::Element;

use crate::error::EngineError;
use crate::events::Event;
use crate::models::Presence;
use crate::utils::bare_jid;
use crate::xmpp::{ns, SessionEngine};

impl SessionEngine {
    /// Classify an inbound presence stanza and patch the roster.
    ///
    /// The roster is the source of truth for membership: presence from an
    /// address we don't know is logged and dropped, never turned into a new
    /// contact.
    pub(crate) async fn handle_presence(&self, stanza: Element) {
        let Some(from) = stanza.attr("from") else {
            warn!("Received presence stanza without 'from' attribute");
            return;
        };
        let bare = bare_jid(from).to_string();

        let presence_type = stanza.attr("type").unwrap_or("available");
        let status = match presence_type {
            "unavailable" => Presence::Offline,
            "available" | "" => show_status(&stanza),
            "subscribe" => {
                self.accept_subscription(from).await;
                return;
            }
            "subscribed" => {
                info!("Our subscription to {} was accepted", bare);
                return;
            }
            "unsubscribe" => {
                info!("{} unsubscribed from our presence", bare);
                return;
            }
            "unsubscribed" => {
                info!("Our subscription to {}'s presence was canceled", bare);
                return;
            }
            "probe" => {
                // Probes are answered by the server on our behalf.
                return;
            }
            "error" => {
                warn!("Presence error from {}", bare);
                return;
            }
            other => {
                warn!("Unknown presence type '{}' from {}", other, bare);
                return;
            }
        };

        let snapshot = {
            let mut roster = self.inner.roster.lock().await;
            if !roster.upsert_presence(&bare, status) {
                warn!("Received presence for unknown contact: {}", bare);
                return;
            }
            roster.all()
        };
        info!("Presence updated for {}: {}", bare, status);
        self.emit(Event::RosterChanged(snapshot));
    }

    /// Announce availability after connecting.
    pub(crate) async fn send_initial_presence(&self) -> Result<(), EngineError> {
        let mut presence = Element::builder("presence", ns::JABBER_CLIENT).build();

        let mut show = Element::builder("show", "").build();
        show.append_text_node("chat");
        presence.append_child(show);

        let mut status = Element::builder("status", "").build();
        status.append_text_node("Online");
        presence.append_child(status);

        self.inner
            .transport
            .send(presence)
            .await
            .map_err(|e| EngineError::Transport(e.to_string()))
    }

    /// Ask the server for a contact's current presence.
    pub(crate) async fn probe_presence(&self, jid: &str) -> Result<(), EngineError> {
        let probe = Element::builder("presence", ns::JABBER_CLIENT)
            .attr("to", jid)
            .attr("type", "probe")
            .build();
        self.inner
            .transport
            .send(probe)
            .await
            .map_err(|e| EngineError::Transport(e.to_string()))
    }

    /// Probe every given contact in a detached task. A failed probe is
    /// logged and the rest keep going; a single degraded contact must not
    /// abort the sweep.
    pub(crate) fn spawn_presence_probes(&self, jids: Vec<String>) {
        let engine = self.clone();
        tokio::spawn(async move {
            for jid in jids {
                if let Err(e) = engine.probe_presence(&jid).await {
                    warn!("Failed to probe presence for {}: {}", jid, e);
                }
            }
        });
    }

    /// Auto-accept an inbound subscription request and subscribe back.
    async fn accept_subscription(&self, from: &str) {
        info!("Received presence subscription request from {}", from);

        let accept = Element::builder("presence", ns::JABBER_CLIENT)
            .attr("to", from)
            .attr("type", "subscribed")
            .build();
        if let Err(e) = self.inner.transport.send(accept).await {
            error!("Failed to accept subscription from {}: {}", from, e);
            return;
        }

        let subscribe_back = Element::builder("presence", ns::JABBER_CLIENT)
            .attr("to", from)
            .attr("type", "subscribe")
            .build();
        if let Err(e) = self.inner.transport.send(subscribe_back).await {
            warn!("Failed to subscribe back to {}: {}", from, e);
        } else {
            info!("Subscribed back to {}", from);
        }
    }
}

fn show_status(stanza: &Element) -> Presence {
    let show = stanza
        .get_child("show", ns::JABBER_CLIENT)
        .or_else(|| stanza.get_child("show", ""));
    match show {
        Some(show) => Presence::from_show(show.text().as_str()),
        None => Presence::Online,
    }
}
