//! LMDB-backed persistent mirror.
//!
//! Uses the heed crate (Rust bindings for LMDB) so the persistent tier
//! survives a process restart. Keys and values are stored as UTF-8 strings
//! in a single unnamed database; the LMDB map size doubles as the byte
//! budget, and a full map surfaces as [`MirrorError::QuotaExceeded`].

use std::path::Path;

use clinic_core::MirrorError;
use heed::types::Str;
use heed::{Database, Env, EnvOpenOptions, MdbError};

use crate::mirror::PersistentMirror;

/// Map sizes are rounded up to this granularity, a multiple of every common
/// OS page size.
const MAP_GRANULARITY: usize = 64 * 1024;

/// Smallest map LMDB is opened with, regardless of budget.
const MIN_MAP_SIZE: usize = 1024 * 1024;

fn backend(e: impl ToString) -> MirrorError {
    MirrorError::Backend {
        reason: e.to_string(),
    }
}

fn write_error(key: &str, bytes: usize, e: heed::Error) -> MirrorError {
    match e {
        heed::Error::Mdb(MdbError::MapFull) => MirrorError::QuotaExceeded {
            key: key.to_string(),
            bytes,
        },
        other => backend(other),
    }
}

/// Persistent mirror stored in an LMDB environment.
pub struct LmdbMirror {
    env: Env,
    db: Database<Str, Str>,
}

impl LmdbMirror {
    /// Open (or create) a mirror under `path` with roughly `budget_bytes` of
    /// storage.
    ///
    /// # Errors
    ///
    /// Returns [`MirrorError::Backend`] if the directory cannot be created
    /// or the environment cannot be opened.
    pub fn open<P: AsRef<Path>>(path: P, budget_bytes: usize) -> Result<Self, MirrorError> {
        std::fs::create_dir_all(&path).map_err(backend)?;

        let map_size = budget_bytes
            .max(MIN_MAP_SIZE)
            .div_ceil(MAP_GRANULARITY)
            * MAP_GRANULARITY;

        // SAFETY: the environment is opened once per path by this process and
        // the memory map is only accessed through heed transactions.
        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(map_size)
                .max_dbs(1)
                .open(path.as_ref())
        }
        .map_err(backend)?;

        let mut wtxn = env.write_txn().map_err(backend)?;
        let db: Database<Str, Str> = env.create_database(&mut wtxn, None).map_err(backend)?;
        wtxn.commit().map_err(backend)?;

        tracing::debug!(
            path = %path.as_ref().display(),
            map_size,
            "Opened LMDB persistent mirror"
        );

        Ok(Self { env, db })
    }
}

impl std::fmt::Debug for LmdbMirror {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LmdbMirror")
            .field("path", &self.env.path())
            .finish()
    }
}

impl PersistentMirror for LmdbMirror {
    fn get_item(&self, key: &str) -> Result<Option<String>, MirrorError> {
        let rtxn = self.env.read_txn().map_err(backend)?;
        let value = self.db.get(&rtxn, key).map_err(backend)?;
        Ok(value.map(str::to_string))
    }

    fn set_item(&self, key: &str, value: &str) -> Result<(), MirrorError> {
        let bytes = key.len() + value.len();
        let mut wtxn = self.env.write_txn().map_err(backend)?;
        self.db
            .put(&mut wtxn, key, value)
            .map_err(|e| write_error(key, bytes, e))?;
        wtxn.commit().map_err(|e| write_error(key, bytes, e))
    }

    fn remove_item(&self, key: &str) -> Result<bool, MirrorError> {
        let mut wtxn = self.env.write_txn().map_err(backend)?;
        let deleted = self.db.delete(&mut wtxn, key).map_err(backend)?;
        wtxn.commit().map_err(backend)?;
        Ok(deleted)
    }

    fn key(&self, index: usize) -> Result<Option<String>, MirrorError> {
        let rtxn = self.env.read_txn().map_err(backend)?;
        let mut iter = self.db.iter(&rtxn).map_err(backend)?;
        match iter.nth(index) {
            Some(Ok((key, _))) => Ok(Some(key.to_string())),
            Some(Err(e)) => Err(backend(e)),
            None => Ok(None),
        }
    }

    fn len(&self) -> Result<usize, MirrorError> {
        let rtxn = self.env.read_txn().map_err(backend)?;
        let len = self.db.len(&rtxn).map_err(backend)?;
        Ok(len as usize)
    }

    fn keys(&self) -> Result<Vec<String>, MirrorError> {
        let rtxn = self.env.read_txn().map_err(backend)?;
        let iter = self.db.iter(&rtxn).map_err(backend)?;

        let mut keys = Vec::new();
        for result in iter {
            let (key, _) = result.map_err(backend)?;
            keys.push(key.to_string());
        }
        Ok(keys)
    }
}
