// Connection lifecycle: connect, disconnect, and session teardown.

use log::{debug, error, info, warn};
use std::sync::atomic::Ordering;
use xmpp_parsers::Element;

use crate::error::EngineError;
use crate::xmpp::transport::TransportError;
use crate::xmpp::{ns, SessionEngine};

#[derive(Debug, Clone, PartialEq)]
pub enum ClientState {
    Disconnected,
    Connecting,
    Connected,
}

impl SessionEngine {
    /// Open the session: authenticate, start the dispatch task, broadcast
    /// initial presence and kick off the first roster fetch.
    ///
    /// Re-entry is guarded: a second call while one is in flight (or while a
    /// session is live) gets `AlreadyConnected` before any transport is
    /// created. Reconnecting after a failure reuses this same engine.
    pub async fn connect(
        &self,
        server: &str,
        username: &str,
        password: &str,
    ) -> Result<(), EngineError> {
        if self
            .inner
            .connecting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!("Rejected connect: another attempt is already in flight");
            return Err(EngineError::AlreadyConnected);
        }

        let result = self.connect_inner(server, username, password).await;
        self.inner.connecting.store(false, Ordering::SeqCst);
        result
    }

    async fn connect_inner(
        &self,
        server: &str,
        username: &str,
        password: &str,
    ) -> Result<(), EngineError> {
        {
            let mut session = self.inner.session.lock().await;
            if session.state == ClientState::Connected {
                return Err(EngineError::AlreadyConnected);
            }
            session.state = ClientState::Connecting;
        }

        let full_jid = if username.contains('@') {
            username.to_string()
        } else {
            format!("{}@{}", username, server)
        };
        info!("Connecting to XMPP server as {}", full_jid);

        let events = match self.inner.transport.open(&full_jid, password).await {
            Ok(events) => events,
            Err(TransportError::Auth(reason)) => {
                self.inner.session.lock().await.state = ClientState::Disconnected;
                error!("Authentication failed for {}: {}", full_jid, reason);
                return Err(EngineError::Authentication(reason));
            }
            Err(other) => {
                self.inner.session.lock().await.state = ClientState::Disconnected;
                error!("Failed to connect: {}", other);
                return Err(EngineError::Transport(other.to_string()));
            }
        };

        {
            let mut session = self.inner.session.lock().await;
            session.jid = full_jid.clone();
            session.state = ClientState::Connected;
        }

        let dispatcher = self.spawn_dispatcher(events);
        *self.inner.dispatcher.lock().await = Some(dispatcher);

        if let Err(e) = self.send_initial_presence().await {
            warn!("Failed to send initial presence: {}", e);
        }

        // The session is usable as soon as presence is out; the roster fetch
        // runs detached and reports through RosterChanged.
        let engine = self.clone();
        tokio::spawn(async move {
            if let Err(e) = engine.fetch_roster().await {
                warn!("Roster fetch after connect failed: {}", e);
            }
        });

        info!("Connected to XMPP server as {}", full_jid);
        Ok(())
    }

    /// Close the session. Calling this with no active session is a no-op.
    pub async fn disconnect(&self) -> Result<(), EngineError> {
        {
            let session = self.inner.session.lock().await;
            if session.state != ClientState::Connected {
                debug!("No active session to disconnect");
                return Ok(());
            }
        }

        info!("Disconnecting from XMPP server");
        let unavailable = Element::builder("presence", ns::JABBER_CLIENT)
            .attr("type", "unavailable")
            .build();
        if let Err(e) = self.inner.transport.send(unavailable).await {
            warn!("Failed to send unavailable presence: {}", e);
        }

        let close_result = self.inner.transport.close().await;

        if let Some(dispatcher) = self.inner.dispatcher.lock().await.take() {
            dispatcher.abort();
        }
        self.reset_session_state().await;

        match close_result {
            Ok(()) => Ok(()),
            Err(e) => Err(EngineError::Transport(e.to_string())),
        }
    }

    /// Invoked from the dispatch task when the transport reports an
    /// unrecoverable loss. The session is torn down and never auto-recreated;
    /// the caller decides whether to connect again.
    pub(crate) async fn teardown_after_transport_loss(&self) {
        self.inner.dispatcher.lock().await.take();
        self.reset_session_state().await;
    }

    async fn reset_session_state(&self) {
        // Dropping the pending senders fails any in-flight query with a
        // closed-channel error rather than leaving it to time out.
        self.inner.pending_iq.lock().await.clear();
        // An outstanding attempt dies with the session; the peer learns
        // nothing because there is no transport left to tell it on.
        self.inner.calls.lock().await.reset();
        let mut session = self.inner.session.lock().await;
        session.state = ClientState::Disconnected;
    }
}
