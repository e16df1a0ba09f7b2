//! Per-session state and the handshake update rules.
//!
//! A [`SessionInfo`] holds everything known about one authenticated channel:
//! permanent and ephemeral keys, handles, the nonce discipline, MTU, timing,
//! and the queues wired into its worker tasks. The mutable portion sits
//! behind a single mutex taken only for short critical sections; it is never
//! held across an await point or a crypto operation.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use weft_crypto::{BoxNonce, BoxPublicKey, BoxSecretKey, Handle, SharedKey};

use crate::error::{Result, SessionError};
use crate::latch::Latch;
use crate::window::NonceWindow;
use crate::wire::{COORDS_SLACK, SessionPing, TrafficPacket};

/// Lowest MTU a peer may advertise; lower values are treated as unspecified.
pub const MIN_SESSION_MTU: u16 = 1280;

/// Depth of the plaintext send queue
pub(crate) const SEND_QUEUE_DEPTH: usize = 32;

/// Depth of the decrypted delivery queue
pub(crate) const RECV_QUEUE_DEPTH: usize = 32;

/// A plaintext message with an optional flow key.
///
/// A non-zero flow key is appended to the packet's coords so the next hop can
/// steer the flow into its own queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowKeyMessage {
    /// Opaque 64-bit flow identifier; zero means "no flow key"
    pub flow_key: u64,
    /// The payload to encrypt and send
    pub message: Vec<u8>,
}

/// Mutable session state, guarded by the session mutex.
pub(crate) struct State {
    pub(crate) their_ses_pub: BoxPublicKey,
    pub(crate) their_handle: Handle,
    pub(crate) shared_key: SharedKey,
    pub(crate) window: NonceWindow,
    pub(crate) my_nonce: BoxNonce,
    pub(crate) their_mtu: u16,
    pub(crate) my_mtu: u16,
    pub(crate) was_mtu_fixed: bool,
    pub(crate) coords: Vec<u8>,
    pub(crate) tstamp: i64,
    /// Time of the last received packet
    pub(crate) time: Instant,
    pub(crate) mtu_time: Instant,
    /// Time the first ping was sent since the last received packet
    pub(crate) ping_time: Instant,
    /// Time the last ping was sent
    pub(crate) ping_send: Instant,
    pub(crate) bytes_sent: u64,
    pub(crate) bytes_recvd: u64,
    /// Set when coords are suspected stale; cleared by the next accepted ping
    pub(crate) reset: bool,
}

/// Worker-side channel ends, consumed when the session's tasks are spawned.
pub(crate) struct SessionChannels {
    pub(crate) from_router_rx: mpsc::Receiver<TrafficPacket>,
    pub(crate) send_rx: mpsc::Receiver<FlowKeyMessage>,
}

/// Point-in-time view of a session for the admin layer.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    /// Peer's permanent public key
    pub peer: BoxPublicKey,
    /// Our handle for this session
    pub handle: Handle,
    /// Effective MTU (0 until both sides are known)
    pub mtu: u16,
    /// Bytes of traffic sent
    pub bytes_sent: u64,
    /// Bytes of traffic received
    pub bytes_recvd: u64,
    /// Time since the session was opened
    pub uptime: Duration,
    /// Time since the last received packet
    pub idle: Duration,
    /// Current coords of the peer
    pub coords: Vec<u8>,
    /// Whether the local MTU was pinned after a receive error
    pub was_mtu_fixed: bool,
}

/// All the information we know about one active session.
pub struct SessionInfo {
    their_perm_pub: BoxPublicKey,
    my_handle: Handle,
    my_ses_pub: BoxPublicKey,
    my_ses_sec: BoxSecretKey,
    time_opened: Instant,
    state: Mutex<State>,
    /// Fires when the first handshake completes
    init: Latch,
    /// Fires when the session starts shutting down
    cancel: Latch,
    from_router_tx: mpsc::Sender<TrafficPacket>,
    send_tx: mpsc::Sender<FlowKeyMessage>,
    pub(crate) recv_tx: mpsc::Sender<Vec<u8>>,
    pub(crate) recv_rx: tokio::sync::Mutex<mpsc::Receiver<Vec<u8>>>,
}

impl SessionInfo {
    /// Create a session toward `their_perm_pub` with fresh ephemeral keys.
    ///
    /// The nonce parity is fixed here: the endpoint whose permanent key is
    /// byte-lexicographically higher takes the odd nonce stream, so the two
    /// directions never collide under the shared key.
    ///
    /// # Errors
    ///
    /// Returns a [`SessionError::Crypto`] if the OS CSPRNG fails.
    pub(crate) fn new(
        my_perm_pub: &BoxPublicKey,
        their_perm_pub: BoxPublicKey,
        interface_mtu: u16,
    ) -> Result<(Arc<Self>, SessionChannels)> {
        let my_ses_sec = BoxSecretKey::generate(&mut rand_core::OsRng);
        let my_ses_pub = my_ses_sec.public_key();
        let my_handle = Handle::random()?;

        let mut my_nonce = BoxNonce::random()?;
        my_nonce.set_parity(my_perm_pub.as_bytes() > their_perm_pub.as_bytes());

        let now = Instant::now();
        let state = State {
            their_ses_pub: BoxPublicKey::from_bytes([0u8; 32]),
            their_handle: Handle::from_bytes([0u8; 8]),
            // Placeholder until the first accepted handshake derives the real key
            shared_key: SharedKey::from_bytes([0u8; 32]),
            window: NonceWindow::new(),
            my_nonce,
            their_mtu: MIN_SESSION_MTU,
            my_mtu: interface_mtu,
            was_mtu_fixed: false,
            coords: Vec::new(),
            tstamp: 0,
            time: now,
            mtu_time: now,
            ping_time: now,
            ping_send: now,
            bytes_sent: 0,
            bytes_recvd: 0,
            reset: false,
        };

        let (from_router_tx, from_router_rx) = mpsc::channel(1);
        let (send_tx, send_rx) = mpsc::channel(SEND_QUEUE_DEPTH);
        let (recv_tx, recv_rx) = mpsc::channel(RECV_QUEUE_DEPTH);

        let info = Arc::new(Self {
            their_perm_pub,
            my_handle,
            my_ses_pub,
            my_ses_sec,
            time_opened: now,
            state: Mutex::new(state),
            init: Latch::new(),
            cancel: Latch::new(),
            from_router_tx,
            send_tx,
            recv_tx,
            recv_rx: tokio::sync::Mutex::new(recv_rx),
        });
        let channels = SessionChannels {
            from_router_rx,
            send_rx,
        };
        Ok((info, channels))
    }

    /// Peer's permanent public key.
    #[must_use]
    pub fn their_perm_pub(&self) -> &BoxPublicKey {
        &self.their_perm_pub
    }

    /// Our handle for this session.
    #[must_use]
    pub fn handle(&self) -> Handle {
        self.my_handle
    }

    /// Our ephemeral public key.
    #[must_use]
    pub fn my_ses_pub(&self) -> &BoxPublicKey {
        &self.my_ses_pub
    }

    /// The latch that fires after the first accepted handshake.
    pub(crate) fn init(&self) -> &Latch {
        &self.init
    }

    /// The cancellation latch. Observing it is the exit condition for every
    /// worker and blocking queue operation on this session.
    pub(crate) fn cancel(&self) -> &Latch {
        &self.cancel
    }

    /// Queue of inbound encrypted packets, fed by the router.
    pub(crate) fn from_router(&self) -> &mpsc::Sender<TrafficPacket> {
        &self.from_router_tx
    }

    /// Queue of outbound plaintext, drained by the send worker.
    pub(crate) fn send_queue(&self) -> &mpsc::Sender<FlowKeyMessage> {
        &self.send_tx
    }

    /// Run `f` under the session mutex.
    ///
    /// Critical sections must stay short and must not block; in particular
    /// they never perform crypto or touch a channel.
    pub(crate) fn with_state<R>(&self, f: impl FnOnce(&mut State) -> R) -> R {
        let mut state = self.state.lock().expect("session mutex poisoned");
        f(&mut state)
    }

    /// Apply a handshake packet to this session.
    ///
    /// Implements the update rule: replayed timestamps and foreign permanent
    /// keys are rejected; a new ephemeral key rotates the shared key and
    /// clears the nonce window; MTU and coords are refreshed; the `init`
    /// latch fires.
    ///
    /// # Errors
    ///
    /// [`SessionError::ReplayTimestamp`] if `ping.tstamp` is not strictly
    /// newer, [`SessionError::HandleCollision`] if the sender's permanent key
    /// does not match this session, [`SessionError::LowOrderKey`] if the
    /// offered ephemeral key is a low-order point. All are expected
    /// conditions for the caller to log and drop; the session state is left
    /// untouched.
    pub fn update(&self, ping: &SessionPing) -> Result<()> {
        self.with_state(|st| {
            if ping.tstamp <= st.tstamp {
                return Err(SessionError::ReplayTimestamp);
            }
            if ping.send_perm_pub != self.their_perm_pub {
                // Two sessions landed on the same handle; let the stale one
                // time out rather than hijack this one.
                return Err(SessionError::HandleCollision);
            }
            if ping.send_ses_pub == BoxPublicKey::from_bytes([0u8; 32]) {
                // The zero key is low order, and it would collide with the
                // pre-handshake placeholder and skip rotation entirely.
                return Err(SessionError::LowOrderKey);
            }
            if ping.send_ses_pub != st.their_ses_pub {
                let Some(shared) = self.my_ses_sec.shared_key(&ping.send_ses_pub) else {
                    return Err(SessionError::LowOrderKey);
                };
                st.their_ses_pub = ping.send_ses_pub;
                st.their_handle = ping.handle;
                st.shared_key = shared;
                st.window = NonceWindow::new();
            }
            if ping.mtu >= MIN_SESSION_MTU || ping.mtu == 0 {
                st.their_mtu = ping.mtu;
            }
            if st.coords != ping.coords {
                let mut coords = Vec::with_capacity(ping.coords.len() + COORDS_SLACK);
                coords.extend_from_slice(&ping.coords);
                st.coords = coords;
            }
            st.time = Instant::now();
            st.tstamp = ping.tstamp;
            st.reset = false;
            Ok(())
        })?;
        self.init.fire();
        Ok(())
    }

    /// Effective MTU: the smaller of ours and theirs, or 0 while unknown.
    #[must_use]
    pub fn mtu(&self) -> u16 {
        self.with_state(|st| {
            if st.their_mtu == 0 || st.my_mtu == 0 {
                0
            } else {
                st.their_mtu.min(st.my_mtu)
            }
        })
    }

    /// Pin the local MTU after a receive error from the datagram adaptation.
    pub fn fix_mtu(&self, mtu: u16) {
        self.with_state(|st| {
            st.my_mtu = mtu.max(MIN_SESSION_MTU);
            st.was_mtu_fixed = true;
            st.mtu_time = Instant::now();
        });
    }

    /// Mark the session's coords as suspect; the next use triggers a ping.
    pub fn mark_reset(&self) {
        self.with_state(|st| st.reset = true);
    }

    /// Begin shutting the session down. Idempotent.
    pub fn close(&self) {
        self.cancel.fire();
    }

    /// Whether the session is shutting down.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.cancel.fired()
    }

    /// Take an atomic snapshot for the admin layer.
    #[must_use]
    pub fn snapshot(&self) -> SessionSnapshot {
        self.with_state(|st| SessionSnapshot {
            peer: self.their_perm_pub,
            handle: self.my_handle,
            mtu: if st.their_mtu == 0 || st.my_mtu == 0 {
                0
            } else {
                st.their_mtu.min(st.my_mtu)
            },
            bytes_sent: st.bytes_sent,
            bytes_recvd: st.bytes_recvd,
            uptime: self.time_opened.elapsed(),
            idle: st.time.elapsed(),
            coords: st.coords.clone(),
            was_mtu_fixed: st.was_mtu_fixed,
        })
    }
}

impl std::fmt::Debug for SessionInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionInfo")
            .field("peer", &self.their_perm_pub)
            .field("handle", &self.my_handle)
            .field("init", &self.init.fired())
            .field("cancelled", &self.cancel.fired())
            .finish_non_exhaustive()
    }
}
