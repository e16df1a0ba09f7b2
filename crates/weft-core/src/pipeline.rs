//! Per-session send and receive workers.
//!
//! Each session owns two long-lived tasks plus a small staging task in front
//! of the decrypt stage. Crypto runs on the shared [`CryptoPool`]; each
//! worker keeps the completion channels of its in-flight jobs in submission
//! order and commits results head-of-line, so per-session ordering survives
//! arbitrary pool scheduling.
//!
//! Both workers hold the session mutex only to snapshot state before a job
//! and to validate/commit after it, never across the crypto operation itself.
//! The cancellation latch is the universal exit condition.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};
use weft_crypto::{BoxNonce, SharedKey};

use crate::error::SessionError;
use crate::pool::{CryptoPool, CryptoResult};
use crate::session::{FlowKeyMessage, SessionChannels, SessionInfo};
use crate::wire::TrafficPacket;

/// Packets buffered between the router and the decrypt stage. Matches the
/// nonce window capacity; anything deeper would be rejected as stale anyway.
pub(crate) const STAGING_DEPTH: usize = 64;

/// In-flight crypto jobs per worker before intake pauses
const MAX_IN_FLIGHT: usize = 64;

/// Spawn the session's staging, receive, and send tasks.
pub(crate) fn spawn_workers(
    session: Arc<SessionInfo>,
    channels: SessionChannels,
    pool: Arc<CryptoPool>,
    router_out: mpsc::Sender<Vec<u8>>,
) {
    let (staged_tx, staged_rx) = mpsc::channel(1);
    tokio::spawn(stage_worker(
        session.clone(),
        channels.from_router_rx,
        staged_tx,
    ));
    tokio::spawn(recv_worker(session.clone(), staged_rx, pool.clone()));
    tokio::spawn(send_worker(session, channels.send_rx, pool, router_out));
}

/// Buffers inbound packets ahead of the decrypt stage, dropping the oldest
/// on overflow. This bounds memory under adversarial input and holds early
/// packets while the handshake completes.
async fn stage_worker(
    session: Arc<SessionInfo>,
    mut from_router: mpsc::Receiver<TrafficPacket>,
    staged: mpsc::Sender<TrafficPacket>,
) {
    let mut buf: VecDeque<TrafficPacket> = VecDeque::new();
    loop {
        if buf.is_empty() {
            tokio::select! {
                _ = session.cancel().wait() => return,
                packet = from_router.recv() => match packet {
                    Some(p) => buf.push_back(p),
                    None => return,
                },
            }
        } else {
            tokio::select! {
                _ = session.cancel().wait() => return,
                packet = from_router.recv() => match packet {
                    Some(p) => {
                        buf.push_back(p);
                        while buf.len() > STAGING_DEPTH {
                            buf.pop_front();
                            trace!("staging queue overflow, dropping oldest packet");
                        }
                    }
                    None => return,
                },
                permit = staged.reserve() => match permit {
                    Ok(permit) => permit.send(buf.pop_front().expect("buffer non-empty")),
                    Err(_) => return,
                },
            }
        }
    }
}

struct PendingRecv {
    result: oneshot::Receiver<CryptoResult>,
    nonce: BoxNonce,
    key: SharedKey,
}

async fn recv_worker(
    session: Arc<SessionInfo>,
    mut staged: mpsc::Receiver<TrafficPacket>,
    pool: Arc<CryptoPool>,
) {
    // Hold off until the first handshake completes.
    tokio::select! {
        _ = session.cancel().wait() => return,
        _ = session.init().wait() => {}
    }
    let mut pending: VecDeque<PendingRecv> = VecDeque::new();
    loop {
        let has_pending = !pending.is_empty();
        let can_intake = pending.len() < MAX_IN_FLIGHT;
        tokio::select! {
            _ = session.cancel().wait() => return,
            result = async {
                let head = pending.front_mut().expect("pending non-empty");
                (&mut head.result).await
            }, if has_pending => {
                let head = pending.pop_front().expect("pending non-empty");
                let Ok(Ok(plaintext)) = result else {
                    debug!("packet failed authentication, dropping");
                    continue;
                };
                if !commit_inbound(&session, &head.key, &head.nonce, plaintext.len()) {
                    debug!(error = %SessionError::UpdatedDuringCrypto, "dropping packet");
                    continue;
                }
                tokio::select! {
                    _ = session.cancel().wait() => return,
                    sent = session.recv_tx.send(plaintext) => if sent.is_err() {
                        return;
                    },
                }
            }
            packet = staged.recv(), if can_intake => {
                let Some(packet) = packet else { return };
                if let Some(job) = submit_recv(&session, &pool, packet).await {
                    pending.push_back(job);
                }
            }
        }
    }
}

/// Post-crypto validation and commit for one inbound packet.
///
/// The session may have re-keyed while the job ran; a nonce checked under a
/// defunct key must not be committed, and the nonce must still be acceptable
/// (an in-flight duplicate may have committed first). On success the nonce is
/// recorded and the traffic counters advance.
fn commit_inbound(
    session: &SessionInfo,
    key_snapshot: &SharedKey,
    nonce: &BoxNonce,
    plaintext_len: usize,
) -> bool {
    session.with_state(|st| {
        if *key_snapshot != st.shared_key || !st.window.accepts(nonce) {
            return false;
        }
        st.window.record(*nonce, Instant::now());
        st.time = Instant::now();
        st.bytes_recvd += plaintext_len as u64;
        true
    })
}

async fn submit_recv(
    session: &SessionInfo,
    pool: &CryptoPool,
    packet: TrafficPacket,
) -> Option<PendingRecv> {
    let key = session.with_state(|st| {
        st.window
            .accepts(&packet.nonce)
            .then(|| st.shared_key.clone())
    });
    let Some(key) = key else {
        debug!(error = %SessionError::InvalidNonce, "dropping inbound packet");
        return None;
    };
    let result = pool.open(key.clone(), packet.nonce, packet.payload).await;
    Some(PendingRecv {
        result,
        nonce: packet.nonce,
        key,
    })
}

struct PendingSend {
    result: oneshot::Receiver<CryptoResult>,
    packet: TrafficPacket,
}

async fn send_worker(
    session: Arc<SessionInfo>,
    mut send_rx: mpsc::Receiver<FlowKeyMessage>,
    pool: Arc<CryptoPool>,
    router_out: mpsc::Sender<Vec<u8>>,
) {
    tokio::select! {
        _ = session.cancel().wait() => return,
        _ = session.init().wait() => {}
    }
    let mut pending: VecDeque<PendingSend> = VecDeque::new();
    loop {
        let has_pending = !pending.is_empty();
        let can_intake = pending.len() < MAX_IN_FLIGHT;
        tokio::select! {
            _ = session.cancel().wait() => return,
            result = async {
                let head = pending.front_mut().expect("pending non-empty");
                (&mut head.result).await
            }, if has_pending => {
                let head = pending.pop_front().expect("pending non-empty");
                let Ok(Ok(payload)) = result else {
                    debug!("sealing did not complete, dropping outbound packet");
                    continue;
                };
                let mut packet = head.packet;
                packet.payload = payload;
                let bytes = packet.encode();
                tokio::select! {
                    _ = session.cancel().wait() => return,
                    sent = router_out.send(bytes) => if sent.is_err() {
                        return;
                    },
                }
            }
            msg = send_rx.recv(), if can_intake => {
                let Some(msg) = msg else { return };
                let job = submit_send(&session, &pool, msg).await;
                pending.push_back(job);
            }
        }
    }
}

async fn submit_send(
    session: &SessionInfo,
    pool: &CryptoPool,
    msg: FlowKeyMessage,
) -> PendingSend {
    let (key, packet) = session.with_state(|st| {
        st.bytes_sent += msg.message.len() as u64;
        let mut coords = st.coords.clone();
        if msg.flow_key != 0 {
            // The zero byte relies on the self-peer always sitting on port 0,
            // so the suffix reads as a port-0 hop plus the flow identifier.
            coords.push(0);
            coords.extend_from_slice(&msg.flow_key.to_be_bytes());
        }
        let packet = TrafficPacket {
            coords,
            handle: st.their_handle,
            nonce: st.my_nonce,
            payload: Vec::new(),
        };
        st.my_nonce.increment();
        (st.shared_key.clone(), packet)
    });
    let result = pool.seal(key, packet.nonce, msg.message).await;
    PendingSend { result, packet }
}
