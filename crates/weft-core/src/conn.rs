//! Connection surface consumed by the application layer.
//!
//! A [`Conn`] is a cheap handle onto one session: push plaintext in, pull
//! decrypted plaintext out, read the negotiated MTU, close. Inbound sessions
//! are delivered through a [`SessionListener`].

use std::sync::Arc;

use weft_crypto::BoxPublicKey;

use crate::error::{Result, SessionError};
use crate::session::{FlowKeyMessage, SessionInfo, SessionSnapshot};

/// Handle onto one established (or establishing) session.
pub struct Conn {
    session: Arc<SessionInfo>,
}

impl Conn {
    pub(crate) fn new(session: Arc<SessionInfo>) -> Self {
        Self { session }
    }

    pub(crate) fn session(&self) -> &Arc<SessionInfo> {
        &self.session
    }

    /// The peer's permanent public key.
    #[must_use]
    pub fn peer(&self) -> &BoxPublicKey {
        self.session.their_perm_pub()
    }

    /// Effective MTU of the session: the smaller of both endpoints' MTUs,
    /// or 0 while either side is still unknown.
    #[must_use]
    pub fn mtu(&self) -> u16 {
        self.session.mtu()
    }

    /// Queue `message` for encryption and sending.
    ///
    /// A non-zero `flow_key` steers the packet into its own queue at the
    /// next hop. Suspends while the send queue is full.
    ///
    /// # Errors
    ///
    /// [`SessionError::Cancelled`] if the session closes first.
    pub async fn send(&self, flow_key: u64, message: Vec<u8>) -> Result<()> {
        let msg = FlowKeyMessage { flow_key, message };
        tokio::select! {
            biased;
            _ = self.session.cancel().wait() => Err(SessionError::Cancelled),
            sent = self.session.send_queue().send(msg) => {
                sent.map_err(|_| SessionError::Cancelled)
            }
        }
    }

    /// Receive the next decrypted message.
    ///
    /// # Errors
    ///
    /// [`SessionError::Cancelled`] once the session closes and the delivery
    /// queue drains.
    pub async fn recv(&self) -> Result<Vec<u8>> {
        let mut queue = self.session.recv_rx.lock().await;
        tokio::select! {
            biased;
            _ = self.session.cancel().wait() => Err(SessionError::Cancelled),
            message = queue.recv() => message.ok_or(SessionError::Cancelled),
        }
    }

    /// Close the session. Idempotent; in-flight work is discarded.
    pub fn close(&self) {
        self.session.close();
    }

    /// Whether the session has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.session.is_closed()
    }

    /// Point-in-time counters and metadata for this session.
    #[must_use]
    pub fn snapshot(&self) -> SessionSnapshot {
        self.session.snapshot()
    }
}

impl std::fmt::Debug for Conn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conn")
            .field("peer", self.peer())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Stream of inbound sessions created by allowed peers' pings.
pub struct SessionListener {
    rx: tokio::sync::mpsc::Receiver<Conn>,
}

impl SessionListener {
    pub(crate) fn new(rx: tokio::sync::mpsc::Receiver<Conn>) -> Self {
        Self { rx }
    }

    /// Wait for the next inbound session.
    ///
    /// Returns `None` if this listener has been replaced by a newer call to
    /// `listen` and the table dropped its sender.
    pub async fn accept(&mut self) -> Option<Conn> {
        self.rx.recv().await
    }
}
