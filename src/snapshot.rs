//! Heap snapshots.
//!
//! The engine's startup blob is opaque to us and only valid for the engine build that wrote it.
//! V8 aborts the process on a malformed blob, so every snapshot travels in an envelope that is
//! checked before the payload is handed over:
//!
//! `JSBSNAP1 | version len (u16 LE) | engine version | xxh3-64 of payload (u64 LE) | payload`

use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use xxhash_rust::xxh3::xxh3_64;

use crate::error::{Error, ErrorKind, Result};

const MAGIC: &[u8; 8] = b"JSBSNAP1";

#[derive(Clone, PartialEq, Eq)]
pub struct Snapshot {
    engine_version: String,
    payload: Arc<[u8]>,
}

fn invalid<M: Into<String>>(message: M) -> Error {
    Error::new(ErrorKind::SnapshotFailed, message)
}

impl Snapshot {
    pub fn new(engine_version: &str, payload: &[u8]) -> Self {
        Snapshot {
            engine_version: engine_version.to_owned(),
            payload: Arc::from(payload),
        }
    }

    pub fn engine_version(&self) -> &str {
        &self.engine_version
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let version = self.engine_version.as_bytes();
        let mut out = Vec::with_capacity(MAGIC.len() + 2 + version.len() + 8 + self.payload.len());
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&(version.len() as u16).to_le_bytes());
        out.extend_from_slice(version);
        out.extend_from_slice(&xxh3_64(&self.payload).to_le_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    /// Parses an envelope. Does not check the engine version; see `check_engine`.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let rest = bytes.strip_prefix(&MAGIC[..])
            .ok_or_else(|| invalid("not a snapshot: bad magic"))?;

        if rest.len() < 2 {
            return Err(invalid("truncated snapshot header"));
        }
        let version_len = u16::from_le_bytes([rest[0], rest[1]]) as usize;
        let rest = &rest[2..];

        if rest.len() < version_len + 8 {
            return Err(invalid("truncated snapshot header"));
        }
        let version = std::str::from_utf8(&rest[..version_len])
            .map_err(|_| invalid("snapshot engine version is not utf-8"))?;
        let rest = &rest[version_len..];

        let mut sum = [0u8; 8];
        sum.copy_from_slice(&rest[..8]);
        let payload = &rest[8..];

        if payload.is_empty() {
            return Err(invalid("empty snapshot payload"));
        }
        if xxh3_64(payload) != u64::from_le_bytes(sum) {
            return Err(invalid("snapshot checksum mismatch"));
        }

        Ok(Snapshot::new(version, payload))
    }

    /// Fails unless this snapshot was written by `engine_version`.
    pub fn check_engine(&self, engine_version: &str) -> Result<()> {
        if self.engine_version == engine_version {
            Ok(())
        } else {
            Err(invalid(format!("snapshot was written by engine {}, running {}",
                self.engine_version, engine_version)))
        }
    }

    pub fn read_from<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let bytes = fs::read(path)
            .map_err(|e| invalid(format!("could not read {}: {}", path.display(), e)))?;
        Snapshot::from_bytes(&bytes)
    }

    pub fn write_to<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        fs::write(path, self.to_bytes())
            .map_err(|e| invalid(format!("could not write {}: {}", path.display(), e)))
    }
}

impl fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Snapshot")
            .field("engine_version", &self.engine_version)
            .field("len", &self.payload.len())
            .finish()
    }
}
