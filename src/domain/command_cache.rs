//! Command Cache
//!
//! Process-safe on-disk cache of vetted commands, keyed by the SHA-256 of
//! the sanitized request. Each entry is a pair of files named by the key:
//!
//! - `<key>.cmd`: the command text
//! - `<key>.meta`: `created_at`, `ttl`, `sha256` of the payload, `pid`
//!
//! Every read and write of a key happens while holding `<key>.lock`, and
//! both files are replaced atomically. An entry is served only while it is
//! fresh and its payload still matches the recorded digest; anything else
//! is deleted on sight.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::error::{GuardError, Result};
use crate::storage::{
    self, Fields, LockGuard, ensure_private_dir, epoch_secs, remove_if_exists, write_private_atomic,
};

/// Largest payload the cache stores, in characters
pub const MAX_PAYLOAD_CHARS: usize = 1000;

const EXPORT_HEADER: &str = "# nlsh-guard cache export v1";
const EXPORT_SEPARATOR: &str = "---";
const PAYLOAD_EXT: &str = "cmd";
const META_EXT: &str = "meta";
const LOCK_EXT: &str = "lock";

/// SHA-256 of `text` as lowercase hex
#[must_use]
pub fn sha256_hex(text: &str) -> String {
    const_hex::encode(Sha256::digest(text.as_bytes()))
}

fn is_valid_key(key: &str) -> bool {
    key.len() == 64 && key.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

fn check_key(key: &str) -> Result<()> {
    if is_valid_key(key) {
        Ok(())
    } else {
        Err(GuardError::InvalidInput {
            reason: "cache key must be a 64-character lowercase hex digest".to_string(),
        })
    }
}

fn check_payload(payload: &str) -> std::result::Result<(), String> {
    if payload.chars().count() > MAX_PAYLOAD_CHARS {
        return Err(format!("payload exceeds {MAX_PAYLOAD_CHARS} characters"));
    }
    if payload.contains(['\n', '\r']) {
        return Err("payload must be a single line".to_string());
    }
    Ok(())
}

/// Metadata stored next to a payload
#[derive(Debug, Clone, PartialEq)]
struct EntryMeta {
    created_at: f64,
    ttl: u64,
    digest: String,
}

impl EntryMeta {
    fn from_fields(fields: &Fields) -> Option<Self> {
        Some(Self {
            created_at: fields.parse_field("created_at")?,
            ttl: fields.parse_field("ttl")?,
            digest: fields.get("sha256")?.to_string(),
        })
    }

    fn to_fields(&self) -> Fields {
        Fields::new()
            .with("created_at", self.created_at)
            .with("ttl", self.ttl)
            .with("sha256", &self.digest)
            .with("pid", std::process::id())
    }

    #[expect(clippy::cast_precision_loss)]
    fn is_fresh(&self, now: f64) -> bool {
        now < self.created_at + self.ttl as f64
    }
}

/// A decoded export blob
#[derive(Debug, Clone, PartialEq)]
pub struct ExportedEntry {
    pub key: String,
    pub created_at: f64,
    pub ttl: u64,
    pub payload: String,
}

impl ExportedEntry {
    /// Render as a portable text blob.
    #[must_use]
    pub fn render(&self) -> String {
        let header = Fields::new()
            .with("key", &self.key)
            .with("created_at", self.created_at)
            .with("ttl", self.ttl)
            .with("sha256", sha256_hex(&self.payload));
        format!(
            "{EXPORT_HEADER}\n{}{EXPORT_SEPARATOR}\n{}\n",
            header.render(),
            self.payload
        )
    }

    /// Decode and verify a blob produced by [`render`](Self::render).
    ///
    /// # Errors
    ///
    /// Returns [`GuardError::CacheImport`] if the key marker or separator is
    /// missing, the key is not a hex digest, a header field is malformed, or
    /// the payload fails its digest or size checks.
    pub fn parse(blob: &str) -> Result<Self> {
        let reject = |reason: &str| GuardError::CacheImport {
            reason: reason.to_string(),
        };

        let blob = blob.replace("\r\n", "\n");
        let (header, body) = blob
            .split_once(&format!("\n{EXPORT_SEPARATOR}\n"))
            .ok_or_else(|| reject("missing '---' separator"))?;
        let fields = Fields::parse(header);

        let key = fields.get("key").ok_or_else(|| reject("missing key marker"))?;
        if !is_valid_key(key) {
            return Err(reject("key is not a 64-character lowercase hex digest"));
        }
        let created_at: f64 = fields
            .parse_field("created_at")
            .filter(|t: &f64| t.is_finite() && *t >= 0.0)
            .ok_or_else(|| reject("missing or invalid created_at"))?;
        let ttl = fields
            .parse_field("ttl")
            .ok_or_else(|| reject("missing or invalid ttl"))?;
        let digest = fields
            .get("sha256")
            .ok_or_else(|| reject("missing sha256"))?;

        let payload = body.strip_suffix('\n').unwrap_or(body);
        check_payload(payload).map_err(|r| reject(&r))?;
        if sha256_hex(payload) != digest {
            return Err(reject("payload digest mismatch"));
        }

        Ok(Self {
            key: key.to_string(),
            created_at,
            ttl,
            payload: payload.to_string(),
        })
    }
}

/// Entry count and payload size
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub payload_bytes: u64,
}

/// Result of a lookup that keeps expired entries
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheLookup {
    Fresh(String),
    /// Intact but past its TTL; left on disk
    Expired(String),
    Miss,
}

/// How strictly a read checks an entry
#[derive(Clone, Copy)]
enum Freshness {
    Required,
    Ignored,
}

pub struct CommandCache {
    dir: PathBuf,
    lock_timeout: Duration,
}

impl CommandCache {
    #[must_use]
    pub fn new(dir: &Path, lock_timeout: Duration) -> Self {
        Self {
            dir: dir.to_path_buf(),
            lock_timeout,
        }
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Cache key for a sanitized request
    #[must_use]
    pub fn key_for(sanitized_input: &str) -> String {
        sha256_hex(sanitized_input)
    }

    fn path(&self, key: &str, ext: &str) -> PathBuf {
        self.dir.join(format!("{key}.{ext}"))
    }

    fn lock(&self, key: &str) -> Result<LockGuard> {
        ensure_private_dir(&self.dir)?;
        storage::lock::acquire(&self.path(key, LOCK_EXT), self.lock_timeout)
    }

    fn delete_entry(&self, key: &str) -> Result<()> {
        remove_if_exists(&self.path(key, PAYLOAD_EXT))?;
        remove_if_exists(&self.path(key, META_EXT))
    }

    /// Read a verified entry; the caller holds the key's lock.
    fn read_verified(
        &self,
        key: &str,
        freshness: Freshness,
        now: f64,
    ) -> Result<Option<(EntryMeta, String)>> {
        let meta = Fields::read(&self.path(key, META_EXT))?;
        let payload = match std::fs::read_to_string(self.path(key, PAYLOAD_EXT)) {
            Ok(payload) => Some(payload),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) if e.kind() == std::io::ErrorKind::InvalidData => {
                warn!(key = %key, "Cache payload is not valid UTF-8, discarding entry");
                self.delete_entry(key)?;
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let (meta, payload) = match (meta, payload) {
            (None, None) => return Ok(None),
            (Some(fields), Some(payload)) => match EntryMeta::from_fields(&fields) {
                Some(meta) => (meta, payload),
                None => {
                    warn!(key = %key, "Malformed cache metadata, discarding entry");
                    self.delete_entry(key)?;
                    return Ok(None);
                }
            },
            _ => {
                debug!(key = %key, "Incomplete cache entry, discarding");
                self.delete_entry(key)?;
                return Ok(None);
            }
        };

        if sha256_hex(&payload) != meta.digest {
            warn!(key = %key, "Cache integrity check failed, discarding entry");
            self.delete_entry(key)?;
            return Ok(None);
        }

        if matches!(freshness, Freshness::Required) && !meta.is_fresh(now) {
            debug!(key = %key, "Cache entry expired");
            self.delete_entry(key)?;
            return Ok(None);
        }

        Ok(Some((meta, payload)))
    }

    fn read_locked(&self, key: &str, freshness: Freshness, now: f64) -> Result<Option<String>> {
        check_key(key)?;
        if !self.dir.exists() {
            return Ok(None);
        }
        let _guard = self.lock(key)?;
        Ok(self
            .read_verified(key, freshness, now)?
            .map(|(_, payload)| payload))
    }

    /// Fresh, intact payload for `key`.
    ///
    /// # Errors
    ///
    /// Returns an error for an invalid key, a lock timeout or an I/O failure.
    /// Callers treat any error as a miss.
    pub fn get(&self, key: &str) -> Result<Option<String>> {
        self.get_at(key, epoch_secs())
    }

    /// [`get`](Self::get) with an explicit clock.
    ///
    /// # Errors
    ///
    /// See [`get`](Self::get).
    pub fn get_at(&self, key: &str, now: f64) -> Result<Option<String>> {
        self.read_locked(key, Freshness::Required, now)
    }

    /// Intact payload for `key` regardless of its age.
    ///
    /// # Errors
    ///
    /// See [`get`](Self::get).
    pub fn get_stale(&self, key: &str) -> Result<Option<String>> {
        self.read_locked(key, Freshness::Ignored, epoch_secs())
    }

    /// Like [`get`](Self::get), but an intact expired entry is returned as
    /// [`CacheLookup::Expired`] and kept for a later stale fallback.
    ///
    /// # Errors
    ///
    /// See [`get`](Self::get).
    pub fn lookup(&self, key: &str) -> Result<CacheLookup> {
        self.lookup_at(key, epoch_secs())
    }

    /// [`lookup`](Self::lookup) with an explicit clock.
    ///
    /// # Errors
    ///
    /// See [`get`](Self::get).
    pub fn lookup_at(&self, key: &str, now: f64) -> Result<CacheLookup> {
        check_key(key)?;
        if !self.dir.exists() {
            return Ok(CacheLookup::Miss);
        }
        let _guard = self.lock(key)?;
        Ok(match self.read_verified(key, Freshness::Ignored, now)? {
            Some((meta, payload)) if meta.is_fresh(now) => CacheLookup::Fresh(payload),
            Some((_, payload)) => CacheLookup::Expired(payload),
            None => CacheLookup::Miss,
        })
    }

    /// Store `payload` under `key` for `ttl` seconds (`0` stores nothing
    /// that will ever be served fresh).
    ///
    /// # Errors
    ///
    /// Returns an error for an invalid key or payload, a lock timeout or an
    /// I/O failure. A failed write never leaves a partial entry visible.
    pub fn put(&self, key: &str, payload: &str, ttl: u64) -> Result<()> {
        self.put_at(key, payload, ttl, epoch_secs())
    }

    /// [`put`](Self::put) with an explicit creation time.
    ///
    /// # Errors
    ///
    /// See [`put`](Self::put).
    pub fn put_at(&self, key: &str, payload: &str, ttl: u64, now: f64) -> Result<()> {
        check_key(key)?;
        check_payload(payload).map_err(|reason| GuardError::InvalidInput { reason })?;

        let _guard = self.lock(key)?;
        self.write_entry(
            key,
            payload,
            &EntryMeta {
                created_at: now,
                ttl,
                digest: sha256_hex(payload),
            },
        )
    }

    fn write_entry(&self, key: &str, payload: &str, meta: &EntryMeta) -> Result<()> {
        write_private_atomic(&self.path(key, PAYLOAD_EXT), payload.as_bytes())?;
        write_private_atomic(
            &self.path(key, META_EXT),
            meta.to_fields().render().as_bytes(),
        )?;
        debug!(key = %key, ttl = meta.ttl, "Cached command");
        Ok(())
    }

    /// Remove one entry, returning whether it existed.
    ///
    /// # Errors
    ///
    /// Returns an error for an invalid key, a lock timeout or an I/O failure.
    pub fn remove(&self, key: &str) -> Result<bool> {
        check_key(key)?;
        if !self.dir.exists() {
            return Ok(false);
        }
        let _guard = self.lock(key)?;
        let existed = self.path(key, PAYLOAD_EXT).exists() || self.path(key, META_EXT).exists();
        self.delete_entry(key)?;
        Ok(existed)
    }

    /// Keys with a payload or metadata file on disk.
    fn keys(&self) -> Result<BTreeSet<String>> {
        let mut keys = BTreeSet::new();
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(keys),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some((stem, ext)) = name.rsplit_once('.')
                && (ext == PAYLOAD_EXT || ext == META_EXT)
                && is_valid_key(stem)
            {
                keys.insert(stem.to_string());
            }
        }
        Ok(keys)
    }

    /// Remove every entry, returning how many were removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be listed or an entry cannot
    /// be locked or removed.
    pub fn clear_all(&self) -> Result<usize> {
        let mut removed = 0;
        for key in self.keys()? {
            let _guard = self.lock(&key)?;
            self.delete_entry(&key)?;
            removed += 1;
        }
        self.remove_abandoned_temp_files()?;
        Ok(removed)
    }

    /// Remove entries created more than `max_age_secs` ago.
    ///
    /// Housekeeping only: expired entries are also dropped lazily on read.
    ///
    /// # Errors
    ///
    /// See [`clear_all`](Self::clear_all).
    pub fn clear_older_than(&self, max_age_secs: u64) -> Result<usize> {
        self.clear_older_than_at(max_age_secs, epoch_secs())
    }

    /// [`clear_older_than`](Self::clear_older_than) with an explicit clock.
    ///
    /// # Errors
    ///
    /// See [`clear_all`](Self::clear_all).
    #[expect(clippy::cast_precision_loss)]
    pub fn clear_older_than_at(&self, max_age_secs: u64, now: f64) -> Result<usize> {
        let mut removed = 0;
        for key in self.keys()? {
            let _guard = self.lock(&key)?;
            let meta = Fields::read(&self.path(&key, META_EXT))?
                .as_ref()
                .and_then(EntryMeta::from_fields);
            let too_old = meta.is_none_or(|m| now - m.created_at > max_age_secs as f64);
            if too_old {
                self.delete_entry(&key)?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn remove_abandoned_temp_files(&self) -> Result<()> {
        if !self.dir.exists() {
            return Ok(());
        }
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            if entry
                .file_name()
                .to_str()
                .is_some_and(storage::atomic::is_temp_file)
            {
                remove_if_exists(&entry.path())?;
            }
        }
        Ok(())
    }

    /// Count entries and payload bytes without verifying them.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be listed.
    pub fn stats(&self) -> Result<CacheStats> {
        let mut stats = CacheStats::default();
        for key in self.keys()? {
            if let Ok(metadata) = std::fs::metadata(self.path(&key, PAYLOAD_EXT)) {
                stats.entries += 1;
                stats.payload_bytes += metadata.len();
            }
        }
        Ok(stats)
    }

    /// Export an intact entry (fresh or not) as a text blob.
    ///
    /// # Errors
    ///
    /// Returns an error for an invalid key, a lock timeout or an I/O failure.
    pub fn export(&self, key: &str) -> Result<Option<String>> {
        check_key(key)?;
        if !self.dir.exists() {
            return Ok(None);
        }
        let _guard = self.lock(key)?;
        Ok(self
            .read_verified(key, Freshness::Ignored, epoch_secs())?
            .map(|(meta, payload)| {
                ExportedEntry {
                    key: key.to_string(),
                    created_at: meta.created_at,
                    ttl: meta.ttl,
                    payload,
                }
                .render()
            }))
    }

    /// Ingest a blob produced by [`export`](Self::export) through the normal
    /// write path, keeping its creation time and TTL. Returns the key.
    ///
    /// # Errors
    ///
    /// Returns [`GuardError::CacheImport`] for a malformed blob, or a
    /// storage error if the entry cannot be written.
    pub fn import(&self, blob: &str) -> Result<String> {
        let entry = ExportedEntry::parse(blob)?;
        let _guard = self.lock(&entry.key)?;
        self.write_entry(
            &entry.key,
            &entry.payload,
            &EntryMeta {
                created_at: entry.created_at,
                ttl: entry.ttl,
                digest: sha256_hex(&entry.payload),
            },
        )?;
        Ok(entry.key)
    }
}
