//! Per-peer ban scoring. Behavioral score records provable misbehavior
//! and sticks for the session; transient score covers borderline races
//! honest peers can hit, and decays back to zero. Crossing the threshold
//! bans the peer and persists across restarts via the ban list file.

use std::collections::HashMap;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use umbrad_consensus::Policy;

#[derive(Clone, Debug)]
pub struct BannedPeerInfo {
    pub addr: SocketAddr,
    pub banned_until: SystemTime,
}

#[derive(Debug, Deserialize, Serialize)]
struct BanListFile {
    version: u32,
    banned: Vec<BanListEntry>,
}

#[derive(Debug, Deserialize, Serialize)]
struct BanListEntry {
    addr: SocketAddr,
    banned_until: u64,
}

const BANLIST_VERSION: u32 = 1;

#[derive(Clone, Copy, Debug)]
struct ScoreEntry {
    behavioral: u32,
    transient: f64,
    last_update: Instant,
}

pub struct PeerBook {
    max_banscore: u32,
    ban_duration: Duration,
    transient_decay: Duration,
    scores: Mutex<HashMap<SocketAddr, ScoreEntry>>,
    banned: Mutex<HashMap<SocketAddr, SystemTime>>,
}

impl PeerBook {
    pub fn new(policy: &Policy) -> Self {
        Self {
            max_banscore: policy.max_banscore,
            ban_duration: Duration::from_secs(policy.ban_duration_secs),
            transient_decay: Duration::from_secs(policy.transient_decay_secs.max(1)),
            scores: Mutex::new(HashMap::new()),
            banned: Mutex::new(HashMap::new()),
        }
    }

    /// Apply a score delta. Returns true if this crossed the ban
    /// threshold and the peer is now banned.
    pub fn increase_banscore(&self, addr: SocketAddr, behavioral: u32, transient: u32) -> bool {
        let combined = {
            let mut scores = self.scores.lock().expect("peer score lock");
            let now = Instant::now();
            let entry = scores.entry(addr).or_insert(ScoreEntry {
                behavioral: 0,
                transient: 0.0,
                last_update: now,
            });
            let elapsed = now.duration_since(entry.last_update);
            // Ten transient points drain per decay window.
            let drained = elapsed.as_secs_f64() / self.transient_decay.as_secs_f64() * 10.0;
            entry.transient = (entry.transient - drained).max(0.0);
            entry.last_update = now;
            entry.behavioral = entry.behavioral.saturating_add(behavioral);
            entry.transient += f64::from(transient);
            entry
                .behavioral
                .saturating_add(entry.transient.round() as u32)
        };

        if combined > self.max_banscore {
            self.ban_for(addr, self.ban_duration);
            return true;
        }
        false
    }

    /// Current (behavioral, transient) score, with decay applied.
    pub fn banscore(&self, addr: SocketAddr) -> (u32, u32) {
        let scores = self.scores.lock().expect("peer score lock");
        match scores.get(&addr) {
            Some(entry) => {
                let elapsed = entry.last_update.elapsed();
                let drained = elapsed.as_secs_f64() / self.transient_decay.as_secs_f64() * 10.0;
                (
                    entry.behavioral,
                    (entry.transient - drained).max(0.0).round() as u32,
                )
            }
            None => (0, 0),
        }
    }

    pub fn is_banned(&self, addr: SocketAddr) -> bool {
        let now = SystemTime::now();
        let mut banned = self.banned.lock().expect("ban list lock");
        if let Some(until) = banned.get(&addr).copied() {
            if until > now {
                return true;
            }
            banned.remove(&addr);
        }
        false
    }

    pub fn ban_for(&self, addr: SocketAddr, duration: Duration) {
        let mut banned = self.banned.lock().expect("ban list lock");
        banned.insert(addr, SystemTime::now() + duration);
    }

    pub fn unban(&self, addr: SocketAddr) -> bool {
        let mut banned = self.banned.lock().expect("ban list lock");
        banned.remove(&addr).is_some()
    }

    pub fn banned_peers(&self) -> Vec<BannedPeerInfo> {
        let now = SystemTime::now();
        let mut banned = self.banned.lock().expect("ban list lock");
        let mut expired = Vec::new();
        let mut out = Vec::new();
        for (addr, until) in banned.iter() {
            if *until <= now {
                expired.push(*addr);
                continue;
            }
            out.push(BannedPeerInfo {
                addr: *addr,
                banned_until: *until,
            });
        }
        for addr in expired {
            banned.remove(&addr);
        }
        out
    }

    pub fn load_banlist(&self, path: &Path) -> Result<usize, String> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(err.to_string()),
        };
        let file: BanListFile =
            serde_json::from_slice(&bytes).map_err(|err| format!("invalid banlist: {err}"))?;
        if file.version != BANLIST_VERSION {
            return Err(format!(
                "unsupported banlist version {} (expected {})",
                file.version, BANLIST_VERSION
            ));
        }
        let now = SystemTime::now();
        let mut inserted = 0usize;
        let mut banned = self.banned.lock().expect("ban list lock");
        for entry in file.banned {
            let until = UNIX_EPOCH + Duration::from_secs(entry.banned_until);
            if until <= now {
                continue;
            }
            banned.insert(entry.addr, until);
            inserted += 1;
        }
        Ok(inserted)
    }

    pub fn save_banlist(&self, path: &Path) -> Result<(), String> {
        let mut entries = Vec::new();
        for info in self.banned_peers() {
            let secs = info
                .banned_until
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs();
            entries.push(BanListEntry {
                addr: info.addr,
                banned_until: secs,
            });
        }
        entries.sort_by_key(|entry| entry.addr.to_string());
        let file = BanListFile {
            version: BANLIST_VERSION,
            banned: entries,
        };
        let json = serde_json::to_vec_pretty(&file).map_err(|err| err.to_string())?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| err.to_string())?;
        }
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, json).map_err(|err| err.to_string())?;
        if fs::rename(&tmp, path).is_err() {
            let _ = fs::remove_file(path);
            fs::rename(&tmp, path).map_err(|err| err.to_string())?;
        }
        Ok(())
    }
}
