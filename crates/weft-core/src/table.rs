//! The session table: indexes, admission policy, and handshake handling.
//!
//! Sessions are owned by the table and indexed by handle, with a reverse
//! index from the peer's permanent key. Both indexes live under one lock so
//! the handle/key bijection is maintained atomically. The table also owns the
//! shared crypto pool, the protocol shared-key cache, and the pluggable
//! admission policy.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use weft_crypto::{BoxNonce, BoxPublicKey, BoxSecretKey, Handle, SharedKey};

use crate::config::{PoolConfig, SessionConfig};
use crate::conn::{Conn, SessionListener};
use crate::error::{Result, SessionError};
use crate::pipeline;
use crate::pool::CryptoPool;
use crate::session::{SessionInfo, SessionSnapshot};
use crate::wire::{ProtocolPacket, SessionPing, TrafficPacket};

/// Bound on the protocol shared-key cache
const MAX_CACHED_KEYS: usize = 1024;

/// Backlog of inbound sessions waiting on [`SessionTable::listen`]
const LISTEN_BACKLOG: usize = 32;

/// Admission predicate: `(peer, initiator)` where `initiator` is true when
/// this node is opening the session.
pub type AllowPolicy = Box<dyn Fn(&BoxPublicKey, bool) -> bool + Send + Sync>;

struct Indexes {
    sinfos: HashMap<Handle, Arc<SessionInfo>>,
    by_their_perm: HashMap<BoxPublicKey, Handle>,
    last_cleanup: Instant,
}

/// All active sessions of one node.
pub struct SessionTable {
    my_perm_pub: BoxPublicKey,
    my_perm_sec: BoxSecretKey,
    config: RwLock<SessionConfig>,
    local_coords: RwLock<Vec<u8>>,
    indexes: Mutex<Indexes>,
    allow: RwLock<Option<AllowPolicy>>,
    listener: Mutex<Option<mpsc::Sender<Conn>>>,
    perm_shared: DashMap<BoxPublicKey, SharedKey>,
    pool: Arc<CryptoPool>,
    router_out: mpsc::Sender<Vec<u8>>,
}

impl SessionTable {
    /// Create a session table for the node identified by `my_perm_sec`.
    ///
    /// Encoded outbound packets (traffic and protocol) are handed to
    /// `router_out`.
    #[must_use]
    pub fn new(
        my_perm_sec: BoxSecretKey,
        config: SessionConfig,
        pool_config: &PoolConfig,
        router_out: mpsc::Sender<Vec<u8>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            my_perm_pub: my_perm_sec.public_key(),
            my_perm_sec,
            config: RwLock::new(config),
            local_coords: RwLock::new(Vec::new()),
            indexes: Mutex::new(Indexes {
                sinfos: HashMap::new(),
                by_their_perm: HashMap::new(),
                last_cleanup: Instant::now(),
            }),
            allow: RwLock::new(None),
            listener: Mutex::new(None),
            perm_shared: DashMap::new(),
            pool: Arc::new(CryptoPool::new(pool_config)),
            router_out,
        })
    }

    /// This node's permanent public key.
    #[must_use]
    pub fn public_key(&self) -> &BoxPublicKey {
        &self.my_perm_pub
    }

    /// Install or clear the admission policy. Applies to future decisions.
    pub fn set_allow_policy(&self, policy: Option<AllowPolicy>) {
        *self.allow.write().expect("policy lock poisoned") = policy;
    }

    /// Whether a session with `peer` is allowed. `initiator` is true when
    /// this node is the one opening the session. No policy allows everyone.
    #[must_use]
    pub fn is_allowed(&self, peer: &BoxPublicKey, initiator: bool) -> bool {
        match &*self.allow.read().expect("policy lock poisoned") {
            Some(policy) => policy(peer, initiator),
            None => true,
        }
    }

    /// Update the local coords advertised in outbound pings.
    pub fn set_local_coords(&self, coords: Vec<u8>) {
        *self.local_coords.write().expect("coords lock poisoned") = coords;
    }

    /// Subscribe to inbound sessions. The previous listener, if any, stops
    /// receiving new sessions.
    #[must_use]
    pub fn listen(&self) -> SessionListener {
        let (tx, rx) = mpsc::channel(LISTEN_BACKLOG);
        *self.listener.lock().expect("listener lock poisoned") = Some(tx);
        SessionListener::new(rx)
    }

    /// Look up a session by our handle for it.
    #[must_use]
    pub fn session_for_handle(&self, handle: &Handle) -> Option<Arc<SessionInfo>> {
        self.indexes
            .lock()
            .expect("index lock poisoned")
            .sinfos
            .get(handle)
            .cloned()
    }

    /// Look up a session by the peer's permanent key.
    #[must_use]
    pub fn session_for_perm(&self, peer: &BoxPublicKey) -> Option<Arc<SessionInfo>> {
        let indexes = self.indexes.lock().expect("index lock poisoned");
        let handle = indexes.by_their_perm.get(peer)?;
        indexes.sinfos.get(handle).cloned()
    }

    /// Open a session to `peer`, reusing a live one if it exists.
    ///
    /// A ping goes out immediately for a fresh session; traffic flows once
    /// the peer's pong completes the handshake.
    ///
    /// # Errors
    ///
    /// [`SessionError::PolicyDenied`] if the admission policy rejects the
    /// peer, or a crypto error if key material cannot be generated.
    pub async fn open(self: &Arc<Self>, peer: BoxPublicKey) -> Result<Conn> {
        if !self.is_allowed(&peer, true) {
            return Err(SessionError::PolicyDenied);
        }
        if let Some(existing) = self.session_for_perm(&peer) {
            if !existing.is_closed() {
                return Ok(Conn::new(existing));
            }
        }
        let session = self.create_session(peer)?;
        self.send_ping_pong(&session, false).await?;
        Ok(Conn::new(session))
    }

    /// Create a session toward `peer` and start its workers.
    ///
    /// Callers are responsible for the admission decision.
    fn create_session(self: &Arc<Self>, peer: BoxPublicKey) -> Result<Arc<SessionInfo>> {
        self.cleanup();
        let interface_mtu = self.config.read().expect("config lock poisoned").interface_mtu;
        let (session, channels) = SessionInfo::new(&self.my_perm_pub, peer, interface_mtu)?;

        {
            let mut indexes = self.indexes.lock().expect("index lock poisoned");
            if let Some(handle) = indexes.by_their_perm.get(&peer).copied() {
                if let Some(existing) = indexes.sinfos.get(&handle).cloned() {
                    if !existing.is_closed() {
                        // Lost a race with a concurrent open or inbound ping.
                        return Ok(existing);
                    }
                    indexes.sinfos.remove(&handle);
                    indexes.by_their_perm.remove(&peer);
                }
            }
            indexes.sinfos.insert(session.handle(), session.clone());
            indexes.by_their_perm.insert(peer, session.handle());
        }

        pipeline::spawn_workers(
            session.clone(),
            channels,
            self.pool.clone(),
            self.router_out.clone(),
        );

        // Remove the index entries once the session cancels, whatever fired
        // the cancellation.
        let table = Arc::downgrade(self);
        let cleanup_session = session.clone();
        tokio::spawn(async move {
            cleanup_session.cancel().wait().await;
            if let Some(table) = table.upgrade() {
                table.remove_session(&cleanup_session);
            }
        });

        info!(
            peer = %hex::encode(&peer.as_bytes()[..8]),
            handle = ?session.handle(),
            "session created"
        );
        Ok(session)
    }

    /// Drop the index entries for `session` if they still point at it.
    fn remove_session(&self, session: &Arc<SessionInfo>) {
        let mut indexes = self.indexes.lock().expect("index lock poisoned");
        let current = indexes.sinfos.get(&session.handle());
        if current.is_some_and(|s| Arc::ptr_eq(s, session)) {
            indexes.sinfos.remove(&session.handle());
            indexes.by_their_perm.remove(session.their_perm_pub());
            info!(
                peer = %hex::encode(&session.their_perm_pub().as_bytes()[..8]),
                "session closed"
            );
        }
    }

    /// Compact the index maps, reclaiming space left by removed entries.
    ///
    /// Runs at most once per `cleanup_interval` and never blocks traffic;
    /// workers hold their own `Arc`s and only lookups contend on the lock.
    fn cleanup(&self) {
        let interval = self.config.read().expect("config lock poisoned").cleanup_interval;
        let mut indexes = self.indexes.lock().expect("index lock poisoned");
        if indexes.last_cleanup.elapsed() < interval {
            return;
        }
        let mut sinfos = HashMap::with_capacity(indexes.sinfos.len());
        sinfos.extend(indexes.sinfos.drain());
        indexes.sinfos = sinfos;
        let mut by_their_perm = HashMap::with_capacity(indexes.by_their_perm.len());
        by_their_perm.extend(indexes.by_their_perm.drain());
        indexes.by_their_perm = by_their_perm;
        indexes.last_cleanup = Instant::now();
        drop(indexes);
        self.perm_shared.shrink_to_fit();
    }

    /// Shared key for protocol traffic with `peer`, derived from the
    /// permanent keys.
    ///
    /// Results are cached (bounded, arbitrary eviction); correctness does not
    /// depend on hits, the cache only saves the key agreement.
    ///
    /// # Errors
    ///
    /// [`SessionError::LowOrderKey`] if `peer` is a low-order point.
    pub fn shared_key_for(&self, peer: &BoxPublicKey) -> Result<SharedKey> {
        if let Some(key) = self.perm_shared.get(peer) {
            return Ok(key.clone());
        }
        let Some(key) = self.my_perm_sec.shared_key(peer) else {
            return Err(SessionError::LowOrderKey);
        };
        while self.perm_shared.len() >= MAX_CACHED_KEYS {
            let Some(victim) = self.perm_shared.iter().next().map(|e| *e.key()) else {
                break;
            };
            self.perm_shared.remove(&victim);
        }
        self.perm_shared.insert(*peer, key.clone());
        Ok(key)
    }

    fn unix_now() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0)
    }

    /// Build a ping for `session` from current state, advancing `my_nonce`.
    fn get_ping(&self, session: &Arc<SessionInfo>, is_pong: bool) -> SessionPing {
        let coords = self.local_coords.read().expect("coords lock poisoned").clone();
        session.with_state(|st| {
            st.my_nonce.increment();
            SessionPing {
                send_perm_pub: self.my_perm_pub,
                handle: session.handle(),
                send_ses_pub: *session.my_ses_pub(),
                coords,
                tstamp: Self::unix_now(),
                is_pong,
                mtu: st.my_mtu,
            }
        })
    }

    /// Encode, seal, and emit a ping or pong for `session`.
    ///
    /// # Errors
    ///
    /// A crypto error if sealing fails, [`SessionError::LowOrderKey`] if the
    /// peer's permanent key yields no usable shared key, or
    /// [`SessionError::Cancelled`] if the router output has shut down.
    pub async fn send_ping_pong(&self, session: &Arc<SessionInfo>, is_pong: bool) -> Result<()> {
        let ping = self.get_ping(session, is_pong);
        let body = ping.encode();
        let shared = self.shared_key_for(session.their_perm_pub())?;
        let nonce = BoxNonce::random()?;
        let payload = shared.seal(&nonce, &body)?;
        let packet = ProtocolPacket {
            coords: session.with_state(|st| st.coords.clone()),
            to_key: *session.their_perm_pub(),
            from_key: self.my_perm_pub,
            nonce,
            payload,
        };
        self.router_out
            .send(packet.encode())
            .await
            .map_err(|_| SessionError::Cancelled)?;
        session.with_state(|st| {
            let now = Instant::now();
            if st.ping_time < st.time {
                st.ping_time = now;
            }
            st.ping_send = now;
        });
        Ok(())
    }

    /// Handle a decoded session ping or pong.
    ///
    /// An unknown peer only gets a session if the policy admits it, the
    /// packet is an initial ping (pongs cannot open sessions), and a listener
    /// is armed; the new [`Conn`] is published to the listener before the
    /// handshake is applied. Rejected handshakes are logged and dropped,
    /// never surfaced to the remote.
    pub async fn handle_ping(self: &Arc<Self>, ping: &SessionPing) {
        let mut session = self.session_for_perm(&ping.send_perm_pub);
        if session.is_none() {
            if !self.is_allowed(&ping.send_perm_pub, false) {
                debug!(
                    peer = %hex::encode(&ping.send_perm_pub.as_bytes()[..8]),
                    "inbound session denied by policy"
                );
                return;
            }
            if ping.is_pong {
                debug!("ignoring pong for unknown session");
                return;
            }
            let listener = self
                .listener
                .lock()
                .expect("listener lock poisoned")
                .clone();
            let Some(listener) = listener else {
                debug!("no listener armed, ignoring session ping");
                return;
            };
            match self.create_session(ping.send_perm_pub) {
                Ok(created) => {
                    if listener.send(Conn::new(created.clone())).await.is_err() {
                        debug!("listener dropped, closing inbound session");
                        created.close();
                        return;
                    }
                    session = Some(created);
                }
                Err(e) => {
                    warn!(error = %e, "failed to create inbound session");
                    return;
                }
            }
        }
        let Some(session) = session else { return };
        match session.update(ping) {
            Ok(()) => {
                if !ping.is_pong {
                    if let Err(e) = self.send_ping_pong(&session, true).await {
                        debug!(error = %e, "failed to send pong");
                    }
                }
            }
            Err(e) => debug!(error = %e, "ignoring handshake packet"),
        }
    }

    /// Open a sealed protocol packet from the router and dispatch the ping.
    ///
    /// # Errors
    ///
    /// [`SessionError::NotForUs`] if addressed to another node,
    /// [`SessionError::LowOrderKey`] for a low-order source key, a crypto
    /// error if the seal does not open, or a wire error for malformed bytes.
    pub async fn handle_protocol_packet(self: &Arc<Self>, bytes: &[u8]) -> Result<()> {
        let packet = ProtocolPacket::decode(bytes)?;
        if packet.to_key != self.my_perm_pub {
            return Err(SessionError::NotForUs);
        }
        let shared = self.shared_key_for(&packet.from_key)?;
        let body = shared.open(&packet.nonce, &packet.payload)?;
        let ping = SessionPing::decode(&body)?;
        if ping.send_perm_pub != packet.from_key {
            debug!("handshake sender key mismatches packet source, dropping");
            return Ok(());
        }
        self.handle_ping(&ping).await;
        Ok(())
    }

    /// Route an inbound traffic packet to the session that owns its handle.
    ///
    /// # Errors
    ///
    /// [`SessionError::UnknownHandle`] if no session matches, or
    /// [`SessionError::Cancelled`] if the session is shutting down.
    pub async fn handle_traffic(&self, packet: TrafficPacket) -> Result<()> {
        let Some(session) = self.session_for_handle(&packet.handle) else {
            return Err(SessionError::UnknownHandle);
        };
        tokio::select! {
            biased;
            _ = session.cancel().wait() => Err(SessionError::Cancelled),
            sent = session.from_router().send(packet) => {
                sent.map_err(|_| SessionError::Cancelled)
            }
        }
    }

    /// Mark every session's coords as suspect after a topology change.
    ///
    /// The next use of each session triggers a ping exchange that refreshes
    /// coords and notifies the peer.
    pub fn reset(&self) {
        for session in self.all_sessions() {
            session.mark_reset();
        }
    }

    /// Snapshots of every live session, for the admin layer.
    #[must_use]
    pub fn sessions(&self) -> Vec<SessionSnapshot> {
        self.all_sessions().iter().map(|s| s.snapshot()).collect()
    }

    /// Swap the configuration used for new sessions and maintenance.
    pub fn reconfigure(&self, config: SessionConfig) {
        *self.config.write().expect("config lock poisoned") = config;
    }

    /// One liveness pass: cancel idle sessions, ping quiet or reset ones.
    ///
    /// Intended to be driven periodically by the node's maintenance task.
    pub async fn maintain(self: &Arc<Self>) {
        let (idle_timeout, ping_interval) = {
            let config = self.config.read().expect("config lock poisoned");
            (config.idle_timeout, config.ping_interval)
        };
        for session in self.all_sessions() {
            if session.is_closed() {
                continue;
            }
            let (idle, reset, since_ping) =
                session.with_state(|st| (st.time.elapsed(), st.reset, st.ping_send.elapsed()));
            if idle > idle_timeout {
                info!(
                    peer = %hex::encode(&session.their_perm_pub().as_bytes()[..8]),
                    "closing idle session"
                );
                session.close();
            } else if reset || since_ping > ping_interval {
                if let Err(e) = self.send_ping_pong(&session, false).await {
                    debug!(error = %e, "maintenance ping failed");
                }
            }
        }
    }

    /// Cancel every session. Used at node shutdown.
    pub fn close_all(&self) {
        for session in self.all_sessions() {
            session.close();
        }
    }

    fn all_sessions(&self) -> Vec<Arc<SessionInfo>> {
        self.indexes
            .lock()
            .expect("index lock poisoned")
            .sinfos
            .values()
            .cloned()
            .collect()
    }
}
