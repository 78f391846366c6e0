//! Hash-chained audit log.
//!
//! One JSON object per line. Every entry carries the SHA-256 of its own
//! canonical fields plus the previous entry's hash, so any byte flipped
//! anywhere breaks verification at that index. Writes are serialized and
//! fsynced before acknowledging. Entries never mutate.
//!
//! Rotation starts a new file with a `genesis` entry citing the previous
//! file and its final hash; the first real entry of the new file chains
//! from that final hash, so the chain spans files.
//!
//! Canonical JSON for the hash input relies on `serde_json`'s default map
//! representation (BTreeMap): keys are emitted sorted with no insignificant
//! whitespace.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Instant;

use argon2::Argon2;
use chrono::{DateTime, SecondsFormat, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::AuditConfig;
use crate::error::AuditError;

/// Fixed salt for deriving the signing key from the shared secret. The
/// secret provides the entropy; the salt only domain-separates this use.
const KDF_SALT: &[u8] = b"mailsentinel-audit-chain";

/// Audit event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Genesis,
    Classified,
    ActionApplied,
    ProfileLoaded,
    ConfigChanged,
    SecurityViolation,
    SystemStart,
    SystemStop,
    Error,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Genesis => "genesis",
            Self::Classified => "classified",
            Self::ActionApplied => "action_applied",
            Self::ProfileLoaded => "profile_loaded",
            Self::ConfigChanged => "config_changed",
            Self::SecurityViolation => "security_violation",
            Self::SystemStart => "system_start",
            Self::SystemStop => "system_stop",
            Self::Error => "error",
        }
    }
}

/// A single chain entry as persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: String,
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub event_type: EventType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub prev_hash: String,
    pub hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

/// What callers supply; the chain fills id, seq, timestamps, and hashes.
#[derive(Debug, Clone, Default)]
pub struct EventRecord {
    pub event_type: Option<EventType>,
    pub message_id: Option<String>,
    pub profile_id: Option<String>,
    pub action: Option<String>,
    pub confidence: Option<f64>,
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl EventRecord {
    pub fn new(event_type: EventType) -> Self {
        Self {
            event_type: Some(event_type),
            ..Default::default()
        }
    }

    pub fn message(mut self, id: impl Into<String>) -> Self {
        self.message_id = Some(id.into());
        self
    }

    pub fn profile(mut self, id: impl Into<String>) -> Self {
        self.profile_id = Some(id.into());
        self
    }

    pub fn action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    pub fn confidence(mut self, confidence: f64) -> Self {
        self.confidence = Some(confidence);
        self
    }

    pub fn meta(mut self, key: &str, value: serde_json::Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }
}

struct Signer {
    key: [u8; 32],
}

impl Signer {
    fn derive(secret: &str) -> Result<Signer, AuditError> {
        let mut key = [0u8; 32];
        Argon2::default()
            .hash_password_into(secret.as_bytes(), KDF_SALT, &mut key)
            .map_err(|e| AuditError::Integrity {
                index: 0,
                reason: format!("key derivation failed: {e}"),
            })?;
        Ok(Signer { key })
    }

    fn sign(&self, hash: &str) -> String {
        let mut mac =
            Hmac::<Sha256>::new_from_slice(&self.key).expect("hmac accepts any key length");
        mac.update(hash.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }
}

struct ChainInner {
    file: File,
    path: PathBuf,
    seq: u64,
    last_hash: String,
    bytes_written: u64,
    opened_at: Instant,
}

/// The append-only chain writer. Owns its file handle exclusively.
pub struct AuditChain {
    config: AuditConfig,
    signer: Option<Signer>,
    inner: Mutex<Option<ChainInner>>,
}

impl AuditChain {
    /// Open (or create) the chain under the configured directory. A
    /// disabled config yields an inert chain whose appends are no-ops.
    pub fn open(config: AuditConfig) -> Result<AuditChain, AuditError> {
        let signer = config.secret.as_deref().map(Signer::derive).transpose()?;
        if !config.enabled {
            return Ok(AuditChain {
                config,
                signer,
                inner: Mutex::new(None),
            });
        }

        std::fs::create_dir_all(&config.directory)?;
        let path = latest_chain_file(Path::new(&config.directory))?
            .unwrap_or_else(|| chain_file_name(Path::new(&config.directory)));

        let (seq, last_hash) = read_tail_state(&path)?;
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let bytes_written = file.metadata()?.len();

        let chain = AuditChain {
            config,
            signer,
            inner: Mutex::new(Some(ChainInner {
                file,
                path,
                seq,
                last_hash,
                bytes_written,
                opened_at: Instant::now(),
            })),
        };

        if seq == 0 {
            chain.write_genesis()?;
        }
        Ok(chain)
    }

    /// Append one entry. Serialized; fsyncs before returning.
    pub fn append(&self, record: EventRecord) -> Result<Option<AuditEntry>, AuditError> {
        let mut guard = self.inner.lock().expect("audit lock poisoned");
        let Some(inner) = guard.as_mut() else {
            return Ok(None);
        };

        if inner.bytes_written >= self.config.max_file_bytes
            || inner.opened_at.elapsed().as_secs() >= self.config.max_file_age_secs
        {
            rotate(inner, &self.config, self.signer.as_ref())?;
        }

        let entry = build_entry(record, inner.seq + 1, &inner.last_hash, self.signer.as_ref());
        write_entry(inner, &entry)?;
        Ok(Some(entry))
    }

    /// Verify the current file front to back.
    pub fn verify(&self) -> Result<usize, AuditError> {
        self.verify_range(..)
    }

    /// Verify a sub-range of the current file's entries. Hashes are always
    /// recomputed; chain links are checked against each entry's actual
    /// predecessor, so a range can start anywhere.
    pub fn verify_range(
        &self,
        range: impl std::ops::RangeBounds<usize>,
    ) -> Result<usize, AuditError> {
        let guard = self.inner.lock().expect("audit lock poisoned");
        match guard.as_ref() {
            Some(inner) => {
                let entries = read_entries(&inner.path)?;
                verify_entries(&entries, self.signer.as_ref(), range)
            }
            None => Ok(0),
        }
    }

    /// Verify every chain file in a directory, oldest first, checking that
    /// rotation genesis entries cite their predecessor's final hash.
    pub fn verify_dir(dir: &Path, secret: Option<&str>) -> Result<usize, AuditError> {
        let signer = secret.map(Signer::derive).transpose()?;
        let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with("audit_") && n.ends_with(".log"))
            })
            .collect();
        files.sort();

        let mut total = 0;
        let mut prev_final: Option<String> = None;
        for file in files {
            if let Some(expected) = &prev_final {
                check_rotation_link(&file, expected)?;
            }
            total += verify_file(&file, signer.as_ref())?;
            prev_final = last_hash_of(&file)?;
        }
        Ok(total)
    }

    fn write_genesis(&self) -> Result<(), AuditError> {
        let record = EventRecord::new(EventType::Genesis).meta(
            "system",
            serde_json::Value::String("mailsentinel".to_string()),
        );

        let mut guard = self.inner.lock().expect("audit lock poisoned");
        let Some(inner) = guard.as_mut() else {
            return Ok(());
        };
        let entry = build_entry(record, inner.seq + 1, "", self.signer.as_ref());
        write_entry(inner, &entry)?;
        Ok(())
    }
}

// ── Entry construction and hashing ──────────────────────────────────

fn build_entry(
    record: EventRecord,
    seq: u64,
    prev_hash: &str,
    signer: Option<&Signer>,
) -> AuditEntry {
    let mut entry = AuditEntry {
        id: Uuid::new_v4().to_string(),
        seq,
        timestamp: Utc::now(),
        event_type: record.event_type.unwrap_or(EventType::Error),
        message_id: record.message_id,
        profile_id: record.profile_id,
        action: record.action,
        confidence: record.confidence,
        metadata: record.metadata,
        prev_hash: prev_hash.to_string(),
        hash: String::new(),
        signature: None,
    };
    entry.hash = compute_hash(&entry);
    entry.signature = signer.map(|s| s.sign(&entry.hash));
    entry
}

/// SHA-256 over the entry's identifying fields, pipe-delimited, with the
/// canonical (sorted-key, compact) JSON of the metadata last.
fn compute_hash(entry: &AuditEntry) -> String {
    let metadata_json = serde_json::to_string(&entry.metadata).unwrap_or_else(|_| "{}".into());
    let input = format!(
        "{}|{}|{}|{}|{}|{}|{}|{}|{}",
        entry.id,
        entry.timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true),
        entry.event_type.as_str(),
        entry.message_id.as_deref().unwrap_or(""),
        entry.profile_id.as_deref().unwrap_or(""),
        entry.action.as_deref().unwrap_or(""),
        entry
            .confidence
            .map(|c| format!("{c:.6}"))
            .unwrap_or_default(),
        entry.prev_hash,
        metadata_json,
    );
    hex::encode(Sha256::digest(input.as_bytes()))
}

fn write_entry(inner: &mut ChainInner, entry: &AuditEntry) -> Result<(), AuditError> {
    let mut line = serde_json::to_string(entry)?;
    line.push('\n');
    inner.file.write_all(line.as_bytes())?;
    inner.file.sync_all()?;
    inner.bytes_written += line.len() as u64;
    inner.seq = entry.seq;
    inner.last_hash = entry.hash.clone();
    Ok(())
}

// ── Rotation ────────────────────────────────────────────────────────

fn chain_file_name(dir: &Path) -> PathBuf {
    dir.join(format!(
        "audit_{}.log",
        Utc::now().format("%Y%m%dT%H%M%S%.9f")
    ))
}

fn latest_chain_file(dir: &Path) -> Result<Option<PathBuf>, AuditError> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("audit_") && n.ends_with(".log"))
        })
        .collect();
    files.sort();
    Ok(files.pop())
}

fn rotate(
    inner: &mut ChainInner,
    config: &AuditConfig,
    signer: Option<&Signer>,
) -> Result<(), AuditError> {
    let previous_file = inner
        .path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default()
        .to_string();
    let previous_hash = inner.last_hash.clone();
    info!(file = %previous_file, "Rotating audit chain file");

    let path = chain_file_name(Path::new(&config.directory));
    let file = OpenOptions::new().create(true).append(true).open(&path)?;

    inner.file = file;
    inner.path = path;
    inner.bytes_written = 0;
    inner.opened_at = Instant::now();

    // Genesis cites the predecessor; the next real entry keeps chaining
    // from the old file's final hash (inner.last_hash is left untouched).
    let record = EventRecord::new(EventType::Genesis)
        .meta("system", serde_json::Value::String("mailsentinel".into()))
        .meta("previous_file", serde_json::Value::String(previous_file))
        .meta("previous_hash", serde_json::Value::String(previous_hash));
    let genesis = build_entry(record, inner.seq + 1, "", signer);

    let mut line = serde_json::to_string(&genesis)?;
    line.push('\n');
    inner.file.write_all(line.as_bytes())?;
    inner.file.sync_all()?;
    inner.bytes_written += line.len() as u64;
    inner.seq = genesis.seq;
    // last_hash deliberately not updated: the chain continues across files.
    Ok(())
}

// ── Verification ────────────────────────────────────────────────────

fn read_entries(path: &Path) -> Result<Vec<AuditEntry>, AuditError> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let reader = BufReader::new(File::open(path)?);
    let mut entries = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        entries.push(serde_json::from_str(&line)?);
    }
    Ok(entries)
}

/// Recompute every hash and chain link; signatures are checked where both a
/// signer and a signature are present. Returns the number of entries
/// verified; the error names the first bad index.
fn verify_file(path: &Path, signer: Option<&Signer>) -> Result<usize, AuditError> {
    let entries = read_entries(path)?;
    verify_entries(&entries, signer, ..)
}

fn verify_entries(
    entries: &[AuditEntry],
    signer: Option<&Signer>,
    range: impl std::ops::RangeBounds<usize>,
) -> Result<usize, AuditError> {
    let mut prev_hash: Option<String> = None;
    let mut verified = 0;

    for (index, entry) in entries.iter().enumerate() {
        if range.contains(&index) {
            let expected = compute_hash(entry);
            if entry.hash != expected {
                return Err(AuditError::Integrity {
                    index,
                    reason: format!(
                        "hash mismatch (stored {}, computed {expected})",
                        entry.hash
                    ),
                });
            }

            let expected_prev = match (&prev_hash, entry.event_type) {
                // Any genesis anchors with an empty prev_hash.
                (_, EventType::Genesis) => String::new(),
                (Some(prev), _) => prev.clone(),
                (None, _) => String::new(),
            };
            if entry.prev_hash != expected_prev {
                return Err(AuditError::Integrity {
                    index,
                    reason: format!(
                        "chain break (prev_hash {}, expected {expected_prev})",
                        entry.prev_hash
                    ),
                });
            }

            if let (Some(signer), Some(signature)) = (signer, &entry.signature) {
                if signer.sign(&entry.hash) != *signature {
                    return Err(AuditError::Integrity {
                        index,
                        reason: "signature mismatch".to_string(),
                    });
                }
            }
            verified += 1;
        }

        // Track the chain state from stored values so a range can begin
        // mid-file. A rotation genesis carries the cross-file hash forward;
        // a plain genesis starts the chain at its own hash.
        let is_rotation_genesis = entry.event_type == EventType::Genesis
            && entry.metadata.contains_key("previous_hash");
        prev_hash = if is_rotation_genesis {
            entry
                .metadata
                .get("previous_hash")
                .and_then(|v| v.as_str())
                .map(String::from)
        } else {
            Some(entry.hash.clone())
        };
    }
    Ok(verified)
}

fn check_rotation_link(file: &Path, expected_prev: &str) -> Result<(), AuditError> {
    let entries = read_entries(file)?;
    let Some(first) = entries.first() else {
        return Ok(());
    };
    let cited = first
        .metadata
        .get("previous_hash")
        .and_then(|v| v.as_str())
        .unwrap_or("");
    if first.event_type != EventType::Genesis || cited != expected_prev {
        return Err(AuditError::Integrity {
            index: 0,
            reason: format!(
                "rotated file {} does not cite predecessor hash",
                file.display()
            ),
        });
    }
    Ok(())
}

/// The hash the next entry must chain from. Rotation genesis anchors are
/// skipped: they carry the predecessor file's final hash in metadata.
fn last_hash_of(path: &Path) -> Result<Option<String>, AuditError> {
    let entries = read_entries(path)?;
    for entry in entries.iter().rev() {
        if entry.event_type != EventType::Genesis {
            return Ok(Some(entry.hash.clone()));
        }
        if let Some(prev) = entry.metadata.get("previous_hash").and_then(|v| v.as_str()) {
            return Ok(Some(prev.to_string()));
        }
    }
    Ok(entries.last().map(|e| e.hash.clone()))
}

fn read_tail_state(path: &Path) -> Result<(u64, String), AuditError> {
    let entries = read_entries(path)?;
    match entries.last() {
        Some(last) => {
            let hash = match last_hash_of(path)? {
                Some(h) => h,
                None => last.hash.clone(),
            };
            Ok((last.seq, hash))
        }
        None => Ok((0, String::new())),
    }
}

impl Drop for AuditChain {
    fn drop(&mut self) {
        if self.config.integrity_check {
            if let Ok(guard) = self.inner.lock() {
                if let Some(inner) = guard.as_ref() {
                    if let Err(e) = verify_file(&inner.path, self.signer.as_ref()) {
                        warn!(error = %e, "Audit chain failed final verification");
                    }
                }
            }
        }
    }
}
