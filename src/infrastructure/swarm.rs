//! In-process swarm client: nodes sharing a [`SwarmHub`] can seed and fetch
//! files by magnet descriptor without any network.
//!
//! Downloads progress one piece per `stats` poll, and the seeder's upload
//! counter follows what its downloaders have fetched.

use async_trait::async_trait;
use ring::digest;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};

use crate::core::domain::{SourceFile, TransferId};
use crate::core::error::SwarmError;
use crate::core::traits::{SwarmClient, SwarmStats};

pub const DEFAULT_PIECE_SIZE: u64 = 1024 * 1024;

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Torrent {
    data: Arc<[u8]>,
    uploaded: u64,
}

/// Shared registry of seeded content, keyed by magnet URI
#[derive(Clone, Default)]
pub struct SwarmHub {
    torrents: Arc<Mutex<HashMap<String, Torrent>>>,
}

impl SwarmHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of torrents currently seeded
    pub fn torrent_count(&self) -> usize {
        locked(&self.torrents).len()
    }

    fn publish(&self, magnet_uri: &str, data: Arc<[u8]>) {
        locked(&self.torrents).insert(magnet_uri.to_string(), Torrent { data, uploaded: 0 });
    }

    fn fetch(&self, magnet_uri: &str) -> Option<Arc<[u8]>> {
        locked(&self.torrents).get(magnet_uri).map(|t| t.data.clone())
    }

    fn record_upload(&self, magnet_uri: &str, bytes: u64) {
        if let Some(torrent) = locked(&self.torrents).get_mut(magnet_uri) {
            torrent.uploaded += bytes;
        }
    }

    fn uploaded(&self, magnet_uri: &str) -> Option<u64> {
        locked(&self.torrents).get(magnet_uri).map(|t| t.uploaded)
    }

    fn unpublish(&self, magnet_uri: &str) {
        locked(&self.torrents).remove(magnet_uri);
    }
}

/// `magnet:?xt=urn:btih:<40 hex>&dn=<name>` for `data`
pub fn magnet_uri(name: &str, data: &[u8]) -> String {
    let hash = digest::digest(&digest::SHA256, data);
    let info_hash = hex::encode(&hash.as_ref()[..20]);
    let display: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || "-_.".contains(c) { c } else { '_' })
        .collect();
    format!("magnet:?xt=urn:btih:{}&dn={}", info_hash, display)
}

enum Session {
    Seed { magnet_uri: String, total: u64 },
    Download { magnet_uri: String, data: Arc<[u8]>, downloaded: u64 },
}

/// One node's swarm client
pub struct InMemorySwarm {
    hub: SwarmHub,
    piece_size: u64,
    sessions: Mutex<HashMap<TransferId, Session>>,
    fail_seed: AtomicBool,
    fail_join: AtomicBool,
    withhold_files: AtomicBool,
    corrupt_files: AtomicBool,
}

impl InMemorySwarm {
    pub fn new(hub: SwarmHub) -> Self {
        Self::with_piece_size(hub, DEFAULT_PIECE_SIZE)
    }

    pub fn with_piece_size(hub: SwarmHub, piece_size: u64) -> Self {
        Self {
            hub,
            piece_size: piece_size.max(1),
            sessions: Mutex::new(HashMap::new()),
            fail_seed: AtomicBool::new(false),
            fail_join: AtomicBool::new(false),
            withhold_files: AtomicBool::new(false),
            corrupt_files: AtomicBool::new(false),
        }
    }

    pub fn fail_seed(&self, fail: bool) {
        self.fail_seed.store(fail, Ordering::SeqCst);
    }

    pub fn fail_join(&self, fail: bool) {
        self.fail_join.store(fail, Ordering::SeqCst);
    }

    /// Finished downloads report no files
    pub fn withhold_files(&self, withhold: bool) {
        self.withhold_files.store(withhold, Ordering::SeqCst);
    }

    /// Finished downloads hand out altered bytes
    pub fn corrupt_files(&self, corrupt: bool) {
        self.corrupt_files.store(corrupt, Ordering::SeqCst);
    }

    pub fn is_active(&self, transfer_id: &TransferId) -> bool {
        locked(&self.sessions).contains_key(transfer_id)
    }

    pub fn session_count(&self) -> usize {
        locked(&self.sessions).len()
    }
}

#[async_trait]
impl SwarmClient for InMemorySwarm {
    async fn seed(&self, transfer_id: &TransferId, file: &SourceFile) -> Result<String, SwarmError> {
        tokio::task::yield_now().await;
        if self.fail_seed.load(Ordering::SeqCst) {
            return Err(SwarmError::Seed("seeding disabled".to_string()));
        }
        let magnet_uri = magnet_uri(&file.name, &file.bytes);
        self.hub.publish(&magnet_uri, file.bytes.clone());
        locked(&self.sessions).insert(
            transfer_id.clone(),
            Session::Seed {
                magnet_uri: magnet_uri.clone(),
                total: file.size(),
            },
        );
        info!(%transfer_id, %magnet_uri, "Seeding");
        Ok(magnet_uri)
    }

    async fn join(&self, transfer_id: &TransferId, magnet_uri: &str) -> Result<(), SwarmError> {
        tokio::task::yield_now().await;
        if self.fail_join.load(Ordering::SeqCst) {
            return Err(SwarmError::Join("joining disabled".to_string()));
        }
        let data = self
            .hub
            .fetch(magnet_uri)
            .ok_or_else(|| SwarmError::Join(format!("no seeders for {}", magnet_uri)))?;
        locked(&self.sessions).insert(
            transfer_id.clone(),
            Session::Download {
                magnet_uri: magnet_uri.to_string(),
                data,
                downloaded: 0,
            },
        );
        debug!(%transfer_id, "Joined swarm");
        Ok(())
    }

    fn stats(&self, transfer_id: &TransferId) -> Option<SwarmStats> {
        let mut sessions = locked(&self.sessions);
        match sessions.get_mut(transfer_id)? {
            Session::Seed { magnet_uri, total } => Some(SwarmStats {
                downloaded: *total,
                uploaded: self.hub.uploaded(magnet_uri).unwrap_or(0),
                total: *total,
                done: true,
            }),
            Session::Download {
                magnet_uri,
                data,
                downloaded,
            } => {
                let total = data.len() as u64;
                let step = self.piece_size.min(total - *downloaded);
                *downloaded += step;
                self.hub.record_upload(magnet_uri, step);
                Some(SwarmStats {
                    downloaded: *downloaded,
                    uploaded: 0,
                    total,
                    done: *downloaded == total,
                })
            }
        }
    }

    fn files(&self, transfer_id: &TransferId) -> Result<Vec<Vec<u8>>, SwarmError> {
        let sessions = locked(&self.sessions);
        match sessions.get(transfer_id) {
            Some(Session::Download { data, downloaded, .. }) if *downloaded == data.len() as u64 => {
                if self.withhold_files.load(Ordering::SeqCst) {
                    return Ok(Vec::new());
                }
                let mut bytes = data.to_vec();
                if self.corrupt_files.load(Ordering::SeqCst) {
                    if let Some(first) = bytes.first_mut() {
                        *first ^= 0xff;
                    }
                }
                Ok(vec![bytes])
            }
            Some(Session::Download { .. }) => Err(SwarmError::NoFiles),
            Some(Session::Seed { .. }) | None => Err(SwarmError::UnknownSession(transfer_id.clone())),
        }
    }

    fn destroy(&self, transfer_id: &TransferId) {
        let session = locked(&self.sessions).remove(transfer_id);
        if let Some(Session::Seed { magnet_uri, .. }) = session {
            self.hub.unpublish(&magnet_uri);
            debug!(%transfer_id, "Stopped seeding");
        }
    }
}
