//! Shared worker pool for sealing and opening traffic payloads.
//!
//! Cryptographic work is CPU-bound, so it runs on dedicated OS threads rather
//! than the async runtime. Each job carries a one-shot completion channel;
//! session pipelines keep those channels in submission order and drain them
//! head-of-line, which preserves per-session ordering without serializing the
//! crypto itself.
//!
//! Capacity is enforced with a semaphore: submission suspends when the pool
//! has `queue_capacity` jobs in flight, and the permit rides along with the
//! job until its result has been delivered.

use std::sync::Arc;
use std::thread::JoinHandle;

use tokio::sync::{OwnedSemaphorePermit, Semaphore, oneshot};
use tracing::debug;
use weft_crypto::{BoxNonce, CryptoError, SharedKey};

use crate::config::PoolConfig;

/// Result of a single seal or open job.
pub type CryptoResult = Result<Vec<u8>, CryptoError>;

enum Job {
    Seal {
        key: SharedKey,
        nonce: BoxNonce,
        plaintext: Vec<u8>,
        done: oneshot::Sender<CryptoResult>,
        _permit: OwnedSemaphorePermit,
    },
    Open {
        key: SharedKey,
        nonce: BoxNonce,
        ciphertext: Vec<u8>,
        done: oneshot::Sender<CryptoResult>,
        _permit: OwnedSemaphorePermit,
    },
}

/// Bounded pool of crypto worker threads shared by every session.
pub struct CryptoPool {
    jobs: crossbeam_channel::Sender<Job>,
    limit: Arc<Semaphore>,
    workers: Vec<JoinHandle<()>>,
}

impl CryptoPool {
    /// Spawn the worker threads.
    #[must_use]
    pub fn new(config: &PoolConfig) -> Self {
        let num_workers = config.workers.unwrap_or_else(num_cpus::get).max(1);
        debug!(workers = num_workers, capacity = config.queue_capacity, "starting crypto pool");

        // The channel itself is unbounded; the semaphore is the bound.
        let (tx, rx) = crossbeam_channel::unbounded::<Job>();
        let workers = (0..num_workers)
            .map(|id| {
                let rx = rx.clone();
                std::thread::Builder::new()
                    .name(format!("weft-crypto-{id}"))
                    .spawn(move || {
                        for job in rx.iter() {
                            run_job(job);
                        }
                    })
                    .expect("failed to spawn crypto worker thread")
            })
            .collect();

        Self {
            jobs: tx,
            limit: Arc::new(Semaphore::new(config.queue_capacity.max(1))),
            workers,
        }
    }

    /// Submit a seal job. The returned channel yields the ciphertext.
    ///
    /// Suspends while the pool is at capacity. If the pool is shutting down
    /// the returned channel reports closure instead of a result.
    pub async fn seal(
        &self,
        key: SharedKey,
        nonce: BoxNonce,
        plaintext: Vec<u8>,
    ) -> oneshot::Receiver<CryptoResult> {
        let (done, result) = oneshot::channel();
        if let Ok(permit) = self.limit.clone().acquire_owned().await {
            let _ = self.jobs.send(Job::Seal {
                key,
                nonce,
                plaintext,
                done,
                _permit: permit,
            });
        }
        result
    }

    /// Submit an open job. The returned channel yields the plaintext, or a
    /// [`CryptoError::DecryptionFailed`] if authentication fails.
    pub async fn open(
        &self,
        key: SharedKey,
        nonce: BoxNonce,
        ciphertext: Vec<u8>,
    ) -> oneshot::Receiver<CryptoResult> {
        let (done, result) = oneshot::channel();
        if let Ok(permit) = self.limit.clone().acquire_owned().await {
            let _ = self.jobs.send(Job::Open {
                key,
                nonce,
                ciphertext,
                done,
                _permit: permit,
            });
        }
        result
    }

    /// Number of worker threads.
    #[must_use]
    pub fn num_workers(&self) -> usize {
        self.workers.len()
    }

    /// Stop accepting jobs and join the worker threads.
    ///
    /// In-flight jobs still complete and deliver their results.
    pub fn shutdown(self) {
        drop(self.jobs);
        for worker in self.workers {
            if worker.join().is_err() {
                debug!("crypto worker panicked during shutdown");
            }
        }
    }
}

fn run_job(job: Job) {
    match job {
        Job::Seal {
            key,
            nonce,
            plaintext,
            done,
            _permit,
        } => {
            let _ = done.send(key.seal(&nonce, &plaintext));
        }
        Job::Open {
            key,
            nonce,
            ciphertext,
            done,
            _permit,
        } => {
            let _ = done.send(key.open(&nonce, &ciphertext));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key(seed: u8) -> SharedKey {
        SharedKey::from_bytes([seed; 32])
    }

    #[tokio::test]
    async fn test_seal_open_through_pool() {
        let pool = CryptoPool::new(&PoolConfig {
            workers: Some(2),
            queue_capacity: 16,
        });
        let key = test_key(1);
        let nonce = BoxNonce::from_bytes([2; 24]);

        let sealed = pool
            .seal(key.clone(), nonce, b"across the pool".to_vec())
            .await
            .await
            .unwrap()
            .unwrap();
        let opened = pool.open(key, nonce, sealed).await.await.unwrap().unwrap();
        assert_eq!(opened, b"across the pool");
    }

    #[tokio::test]
    async fn test_open_reports_auth_failure() {
        let pool = CryptoPool::new(&PoolConfig {
            workers: Some(1),
            queue_capacity: 4,
        });
        let result = pool
            .open(test_key(3), BoxNonce::default(), vec![0u8; 32])
            .await
            .await
            .unwrap();
        assert!(matches!(result, Err(CryptoError::DecryptionFailed)));
    }

    #[tokio::test]
    async fn test_results_arrive_per_job() {
        let pool = CryptoPool::new(&PoolConfig {
            workers: Some(4),
            queue_capacity: 64,
        });
        let key = test_key(7);
        let mut receivers = Vec::new();
        for i in 0..32u8 {
            let mut nonce = BoxNonce::default();
            nonce.set_parity(i % 2 == 1);
            receivers.push((i, pool.seal(key.clone(), nonce, vec![i; 100]).await));
        }
        for (i, rx) in receivers {
            let sealed = rx.await.unwrap().unwrap();
            let mut nonce = BoxNonce::default();
            nonce.set_parity(i % 2 == 1);
            assert_eq!(key.open(&nonce, &sealed).unwrap(), vec![i; 100]);
        }
    }

    #[tokio::test]
    async fn test_shutdown_joins_workers() {
        let pool = CryptoPool::new(&PoolConfig {
            workers: Some(2),
            queue_capacity: 4,
        });
        assert_eq!(pool.num_workers(), 2);
        pool.shutdown();
    }
}
