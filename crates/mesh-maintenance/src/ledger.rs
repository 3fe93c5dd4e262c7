//! Append-only checksum ledger. Writes JSON Lines (one entry per line).
//! Optional hash chain: each entry can include hash_prev + hash_self, so
//! tampering with a recorded checksum breaks the chain from that point on.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use mesh_schemas::VisibilityToken;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub entry_id: Uuid,
    pub tenant_id: String,
    pub ts_utc: DateTime<Utc>,
    pub snapshot_token: VisibilityToken,
    /// table_id -> sha256 over the table's canonical row encoding.
    pub table_checksums: BTreeMap<String, String>,
    pub hash_prev: Option<String>,
    pub hash_self: Option<String>,
}

pub struct ChecksumLedger {
    path: PathBuf,
    hash_chain: bool,
    last_hash: Option<String>,
    seq: u64,
}

impl ChecksumLedger {
    /// Creates the ledger writer and ensures parent dirs exist. Resumes the
    /// hash chain and sequence from the existing file if there is one.
    pub fn open(path: impl AsRef<Path>, hash_chain: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| format!("create_dir_all {:?}", parent))?;
        }

        let mut last_hash = None;
        let mut seq = 0u64;
        if path.exists() {
            let content =
                fs::read_to_string(&path).with_context(|| format!("read ledger {:?}", path))?;
            for line in content.lines().filter(|l| !l.trim().is_empty()) {
                let entry: LedgerEntry = serde_json::from_str(line)
                    .with_context(|| format!("parse ledger line {}", seq + 1))?;
                last_hash = entry.hash_self;
                seq += 1;
            }
        }

        Ok(Self {
            path,
            hash_chain,
            last_hash,
            seq,
        })
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one entry.
    pub fn append(
        &mut self,
        tenant_id: &str,
        snapshot_token: VisibilityToken,
        table_checksums: BTreeMap<String, String>,
    ) -> Result<LedgerEntry> {
        let ts_utc = Utc::now();
        let entry_id = derive_entry_id(self.last_hash.as_deref(), tenant_id, self.seq);
        self.seq += 1;

        let mut entry = LedgerEntry {
            entry_id,
            tenant_id: tenant_id.to_string(),
            ts_utc,
            snapshot_token,
            table_checksums,
            hash_prev: None,
            hash_self: None,
        };

        if self.hash_chain {
            entry.hash_prev = self.last_hash.clone();
            let self_hash = compute_entry_hash(&entry)?;
            entry.hash_self = Some(self_hash.clone());
            self.last_hash = Some(self_hash);
        }

        let line = serde_json::to_string(&entry).context("serialize ledger entry")?;
        append_line(&self.path, &line)?;

        Ok(entry)
    }

    /// Latest recorded entry for a tenant, scanning the file.
    pub fn latest_for(path: impl AsRef<Path>, tenant_id: &str) -> Result<Option<LedgerEntry>> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(None);
        }
        let content =
            fs::read_to_string(path).with_context(|| format!("read ledger {:?}", path))?;
        let mut latest = None;
        for line in content.lines().filter(|l| !l.trim().is_empty()) {
            let entry: LedgerEntry = serde_json::from_str(line).context("parse ledger line")?;
            if entry.tenant_id == tenant_id {
                latest = Some(entry);
            }
        }
        Ok(latest)
    }

    /// Walk the chain and verify every hash link. Returns the entry count.
    pub fn verify_chain(path: impl AsRef<Path>) -> Result<u64> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(0);
        }
        let content =
            fs::read_to_string(path).with_context(|| format!("read ledger {:?}", path))?;
        let mut prev: Option<String> = None;
        let mut count = 0u64;
        for line in content.lines().filter(|l| !l.trim().is_empty()) {
            let entry: LedgerEntry = serde_json::from_str(line).context("parse ledger line")?;
            if entry.hash_prev != prev {
                return Err(anyhow!("ledger chain broken at entry {}", count + 1));
            }
            let mut unhashed = entry.clone();
            unhashed.hash_self = None;
            let expected = compute_entry_hash(&unhashed)?;
            if entry.hash_self.as_deref() != Some(expected.as_str()) {
                return Err(anyhow!("ledger entry {} hash mismatch", count + 1));
            }
            prev = entry.hash_self;
            count += 1;
        }
        Ok(count)
    }
}

/// Entry id derived deterministically from chain state + tenant + seq.
fn derive_entry_id(last_hash: Option<&str>, tenant_id: &str, seq: u64) -> Uuid {
    let mut hasher = Sha256::new();
    hasher.update(last_hash.unwrap_or("genesis").as_bytes());
    hasher.update(tenant_id.as_bytes());
    hasher.update(seq.to_be_bytes());
    let digest = hasher.finalize();
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    Uuid::from_bytes(bytes)
}

/// Hash over the entry with `hash_self` cleared.
fn compute_entry_hash(entry: &LedgerEntry) -> Result<String> {
    let mut unhashed = entry.clone();
    unhashed.hash_self = None;
    let bytes = serde_json::to_vec(&unhashed).context("serialize entry for hashing")?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(hex::encode(hasher.finalize()))
}

fn append_line(path: &Path, line: &str) -> Result<()> {
    let mut f = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open ledger {:?}", path))?;
    writeln!(f, "{line}").with_context(|| format!("append ledger {:?}", path))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sums(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn chain_survives_reopen_and_verifies() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.jsonl");

        let mut ledger = ChecksumLedger::open(&path, true).unwrap();
        ledger.append("t1", 3, sums(&[("trades", "aa")])).unwrap();
        drop(ledger);

        let mut ledger = ChecksumLedger::open(&path, true).unwrap();
        assert_eq!(ledger.seq(), 1);
        ledger.append("t1", 7, sums(&[("trades", "bb")])).unwrap();

        assert_eq!(ChecksumLedger::verify_chain(&path).unwrap(), 2);

        let latest = ChecksumLedger::latest_for(&path, "t1").unwrap().unwrap();
        assert_eq!(latest.snapshot_token, 7);
        assert_eq!(latest.table_checksums["trades"], "bb");
    }

    #[test]
    fn tampering_breaks_the_chain() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.jsonl");

        let mut ledger = ChecksumLedger::open(&path, true).unwrap();
        ledger.append("t1", 1, sums(&[("trades", "aa")])).unwrap();
        ledger.append("t1", 2, sums(&[("trades", "bb")])).unwrap();

        let content = fs::read_to_string(&path).unwrap().replace("\"aa\"", "\"zz\"");
        fs::write(&path, content).unwrap();

        assert!(ChecksumLedger::verify_chain(&path).is_err());
    }
}
