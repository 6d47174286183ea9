// Call-attempt transitions driven by the engine.
//
// At most one outbound attempt exists at a time. While it is pending, the
// only inbound signaling that means anything is an `accepted` matching the
// attempt's target and room; everything else is dropped on the floor, which
// is what keeps the negotiation race-free without a server-side registry.

use log::{debug, info, warn};
use xmpp_parsers::Element;

use crate::error::EngineError;
use crate::events::Event;
use crate::models::Presence;
use crate::signaling::{
    generate_room_id, generate_token, CallAttempt, CallKind, CallSignal, CallStatus,
    MeetingInvite, Port, CALL_TIMEOUT,
};
use crate::utils::bare_jid;
use crate::xmpp::{ns, SessionEngine};

impl SessionEngine {
    /// Invite a contact to a call. The contact must be in the roster and
    /// online; calling anyone else is a policy rejection, not a fault.
    pub async fn place_call(&self, jid: &str) -> Result<CallAttempt, EngineError> {
        self.ensure_connected().await?;
        let target = bare_jid(jid).to_string();

        {
            let roster = self.inner.roster.lock().await;
            match roster.find(&target) {
                Some(contact) if contact.presence == Presence::Online => {}
                _ => return Err(EngineError::ContactUnavailable(target)),
            }
        }

        let own_jid = self.inner.session.lock().await.jid.clone();

        let mut calls = self.inner.calls.lock().await;
        if calls.attempt().is_some() {
            return Err(EngineError::CallInProgress);
        }

        let attempt = CallAttempt {
            target: target.clone(),
            room_id: generate_room_id(),
            token: generate_token(),
            status: CallStatus::Calling,
            started_at: chrono::Utc::now().timestamp(),
        };

        let signal = self.signal_for(&attempt, CallStatus::Calling, &own_jid);
        self.send_signal(&target, &signal).await?;

        // The expiry timer is armed the instant we enter Calling and
        // disarmed on every other way out of it.
        let engine = self.clone();
        let room_id = attempt.room_id.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(CALL_TIMEOUT).await;
            engine.expire_call(&room_id).await;
        });
        calls.begin(attempt.clone(), timer);

        info!("Calling {} (room {})", target, attempt.room_id);
        Ok(attempt)
    }

    /// Withdraw the outstanding attempt and tell the peer.
    pub async fn cancel_call(&self) -> Result<(), EngineError> {
        let own_jid = self.inner.session.lock().await.jid.clone();

        let resolved = self.inner.calls.lock().await.resolve(CallStatus::Canceled);
        let Some(attempt) = resolved else {
            return Err(EngineError::NoActiveCall);
        };

        let signal = self.signal_for(&attempt, CallStatus::Canceled, &own_jid);
        if let Err(e) = self.send_signal(&attempt.target, &signal).await {
            warn!(
                "Failed to notify {} of the canceled call: {}",
                attempt.target, e
            );
        }

        info!("Canceled call to {} (room {})", attempt.target, attempt.room_id);
        self.emit(Event::CallEnded {
            with: attempt.target,
            reason: CallStatus::Canceled,
        });
        Ok(())
    }

    /// Expiry path, run by the timer task. A no-op unless the attempt it was
    /// armed for is still the outstanding one, so the `missed` notification
    /// goes out at most once.
    pub(crate) async fn expire_call(&self, room_id: &str) {
        let own_jid = self.inner.session.lock().await.jid.clone();

        let resolved = {
            let mut calls = self.inner.calls.lock().await;
            let still_pending = calls
                .attempt()
                .map(|attempt| attempt.room_id == room_id)
                .unwrap_or(false);
            if still_pending {
                calls.resolve(CallStatus::Missed)
            } else {
                None
            }
        };
        let Some(attempt) = resolved else {
            return;
        };

        info!(
            "Call to {} timed out after {:?} (room {})",
            attempt.target, CALL_TIMEOUT, attempt.room_id
        );
        let signal = self.signal_for(&attempt, CallStatus::Missed, &own_jid);
        if let Err(e) = self.send_signal(&attempt.target, &signal).await {
            warn!(
                "Failed to notify {} of the missed call: {}",
                attempt.target, e
            );
        }
        self.emit(Event::CallEnded {
            with: attempt.target,
            reason: CallStatus::Missed,
        });
    }

    /// Route an inbound call-control payload.
    pub(crate) async fn handle_call_signal(&self, from: &str, signal: CallSignal) {
        let bare = bare_jid(from).to_string();

        let mut calls = self.inner.calls.lock().await;
        let pending = calls
            .attempt()
            .map(|attempt| (attempt.room_id.clone(), attempt.target.clone()));

        match pending {
            None => {
                drop(calls);
                if signal.status == CallStatus::Calling {
                    info!(
                        "Incoming call invitation from {} (room {})",
                        bare, signal.room_id
                    );
                    self.emit(Event::CallInviteReceived { from: bare, signal });
                } else {
                    debug!("Ignoring stray '{}' signal from {}", signal.status, bare);
                }
            }
            Some((room_id, target)) => {
                let accepted = signal.status == CallStatus::Accepted
                    && room_id == signal.room_id
                    && target == bare;
                if !accepted {
                    debug!(
                        "Ignoring '{}' signal from {} while a call is pending",
                        signal.status, bare
                    );
                    return;
                }
                let resolved = calls.resolve(CallStatus::Accepted);
                drop(calls);
                if let Some(attempt) = resolved {
                    let url = signal.join_url();
                    info!("Call to {} accepted, meeting ready at {}", attempt.target, url);
                    self.emit(Event::CallReady {
                        with: attempt.target,
                        url,
                    });
                }
            }
        }
    }

    /// Route a status-less meeting invitation. Surfaced directly while idle;
    /// dropped while a negotiated attempt is pending.
    pub(crate) async fn handle_meeting_invite(&self, from: &str, invite: MeetingInvite) {
        let bare = bare_jid(from).to_string();

        if self.inner.calls.lock().await.attempt().is_some() {
            debug!(
                "Ignoring meeting invitation from {} while a call is pending",
                bare
            );
            return;
        }

        let url = invite.join_url();
        info!("Meeting invitation from {}: {}", bare, url);
        self.emit(Event::MeetingInvite { from: bare, url });
    }

    fn signal_for(&self, attempt: &CallAttempt, status: CallStatus, own_jid: &str) -> CallSignal {
        CallSignal {
            domain: self.inner.settings.domain.clone(),
            port: Port::Text(self.inner.settings.port.clone()),
            token: attempt.token.clone(),
            room_id: attempt.room_id.clone(),
            kind: CallKind::Call,
            status,
            jid: own_jid.to_string(),
        }
    }

    async fn send_signal(&self, to: &str, signal: &CallSignal) -> Result<(), EngineError> {
        let body_text = serde_json::to_string(signal)
            .map_err(|e| EngineError::ProtocolParse(e.to_string()))?;

        let mut body = Element::builder("body", ns::JABBER_CLIENT).build();
        body.append_text_node(body_text);
        let message = Element::builder("message", ns::JABBER_CLIENT)
            .attr("type", "chat")
            .attr("to", to)
            .append(body)
            .build();

        self.inner
            .transport
            .send(message)
            .await
            .map_err(|e| EngineError::Transport(e.to_string()))
    }
}
