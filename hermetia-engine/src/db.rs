// SPDX-FileCopyrightText: 2026 Jörg Thalheim
// SPDX-License-Identifier: MIT

//! The metadata database: one row per valid store path plus a reference
//! edge table.
//!
//! Registration of a batch of paths is a single transaction so that
//! multi-output derivations become valid atomically, and references are
//! enforced at the SQL level: a path cannot be registered before its
//! references (closure invariant), and a referenced path cannot be
//! invalidated while referrers remain.

use std::collections::BTreeSet;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::{Connection, OptionalExtension, params};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("cannot register '{path}': missing reference '{reference}'")]
    MissingReference { path: String, reference: String },

    #[error("cannot invalidate '{0}': still referenced")]
    StillReferenced(String),

    #[error("path '{0}' is already registered with different contents")]
    Conflict(String),
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS ValidPaths (
    id               INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
    path             TEXT UNIQUE NOT NULL,
    hash             TEXT NOT NULL,
    registrationTime INTEGER NOT NULL,
    deriver          TEXT,
    narSize          INTEGER,
    ultimate         INTEGER,
    sigs             TEXT,
    ca               TEXT
);
CREATE TABLE IF NOT EXISTS Refs (
    referrer  INTEGER NOT NULL,
    reference INTEGER NOT NULL,
    PRIMARY KEY (referrer, reference),
    FOREIGN KEY (referrer)  REFERENCES ValidPaths(id) ON DELETE CASCADE,
    FOREIGN KEY (reference) REFERENCES ValidPaths(id) ON DELETE RESTRICT
);
CREATE INDEX IF NOT EXISTS IndexReferrer  ON Refs(referrer);
CREATE INDEX IF NOT EXISTS IndexReference ON Refs(reference);
";

/// Everything the database records about one valid path. Paths are stored
/// as full path strings; the store layer converts to typed values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPathInfo {
    pub path: String,
    pub hash: String,
    pub registration_time: i64,
    pub deriver: Option<String>,
    pub nar_size: u64,
    pub ultimate: bool,
    pub sigs: Vec<String>,
    pub ca: Option<String>,
    pub references: BTreeSet<String>,
}

/// Parameters for registering one path.
#[derive(Debug, Clone)]
pub struct RegisterPathParams {
    pub path: String,
    pub hash: String,
    pub deriver: Option<String>,
    pub nar_size: u64,
    pub ultimate: bool,
    pub sigs: Vec<String>,
    pub ca: Option<String>,
    pub references: BTreeSet<String>,
}

pub struct StoreDb {
    conn: Connection,
}

impl StoreDb {
    pub fn open(db_path: &Path) -> Result<Self, DbError> {
        if let Some(parent) = db_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let conn = Connection::open(db_path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;",
        )?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    /// In-memory database with the full schema, for tests.
    pub fn open_memory() -> Result<Self, DbError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    pub fn is_valid_path(&self, path: &str) -> Result<bool, DbError> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT 1 FROM ValidPaths WHERE path = ?1 LIMIT 1")?;
        Ok(stmt.exists(params![path])?)
    }

    pub fn query_path_info(&self, path: &str) -> Result<Option<RawPathInfo>, DbError> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT id, hash, registrationTime, deriver, narSize, ultimate, sigs, ca
             FROM ValidPaths WHERE path = ?1",
        )?;

        let row = stmt
            .query_row(params![path], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, Option<i64>>(4)?,
                    row.get::<_, Option<i64>>(5)?,
                    row.get::<_, Option<String>>(6)?,
                    row.get::<_, Option<String>>(7)?,
                ))
            })
            .optional()?;

        let Some((id, hash, registration_time, deriver, nar_size, ultimate, sigs, ca)) = row
        else {
            return Ok(None);
        };

        let mut ref_stmt = self.conn.prepare_cached(
            "SELECT path FROM ValidPaths
             JOIN Refs ON ValidPaths.id = Refs.reference
             WHERE Refs.referrer = ?1",
        )?;
        let references = ref_stmt
            .query_map(params![id], |row| row.get::<_, String>(0))?
            .collect::<Result<BTreeSet<_>, _>>()?;

        Ok(Some(RawPathInfo {
            path: path.to_string(),
            hash,
            registration_time,
            deriver,
            nar_size: nar_size.unwrap_or(0) as u64,
            ultimate: ultimate.unwrap_or(0) != 0,
            sigs: sigs
                .map(|s| s.split_whitespace().map(String::from).collect())
                .unwrap_or_default(),
            ca,
            references,
        }))
    }

    /// Register a batch of paths atomically. Either all become valid or
    /// none. References may point at other batch members (including a path
    /// itself); everything else must already be valid.
    pub fn register_valid_paths(&mut self, batch: &[RegisterPathParams]) -> Result<(), DbError> {
        let tx = self.conn.transaction()?;
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64;

        // First pass: insert all path rows so in-batch references resolve.
        for p in batch {
            let existing: Option<String> = tx
                .prepare_cached("SELECT hash FROM ValidPaths WHERE path = ?1")?
                .query_row(params![p.path], |row| row.get(0))
                .optional()?;
            if let Some(hash) = existing {
                if hash != p.hash {
                    return Err(DbError::Conflict(p.path.clone()));
                }
                continue;
            }
            tx.prepare_cached(
                "INSERT INTO ValidPaths
                 (path, hash, registrationTime, deriver, narSize, ultimate, sigs, ca)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            )?
            .execute(params![
                p.path,
                p.hash,
                now,
                p.deriver,
                p.nar_size as i64,
                p.ultimate as i64,
                if p.sigs.is_empty() {
                    None
                } else {
                    Some(p.sigs.join(" "))
                },
                p.ca,
            ])?;
        }

        // Second pass: reference edges.
        for p in batch {
            let referrer = path_id(&tx, &p.path)?.ok_or_else(|| DbError::MissingReference {
                path: p.path.clone(),
                reference: p.path.clone(),
            })?;
            for reference in &p.references {
                let reference_id =
                    path_id(&tx, reference)?.ok_or_else(|| DbError::MissingReference {
                        path: p.path.clone(),
                        reference: reference.clone(),
                    })?;
                tx.prepare_cached(
                    "INSERT OR IGNORE INTO Refs (referrer, reference) VALUES (?1, ?2)",
                )?
                .execute(params![referrer, reference_id])?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    /// Remove a path's validity record. Fails while other valid paths
    /// still reference it.
    pub fn invalidate_path(&mut self, path: &str) -> Result<(), DbError> {
        let tx = self.conn.transaction()?;
        let Some(id) = path_id(&tx, path)? else {
            tx.commit()?;
            return Ok(());
        };
        let referrers: i64 = tx.prepare_cached(
            "SELECT COUNT(*) FROM Refs WHERE reference = ?1 AND referrer != ?1",
        )?
        .query_row(params![id], |row| row.get(0))?;
        if referrers > 0 {
            return Err(DbError::StillReferenced(path.to_string()));
        }
        tx.prepare_cached("DELETE FROM Refs WHERE referrer = ?1 OR reference = ?1")?
            .execute(params![id])?;
        tx.prepare_cached("DELETE FROM ValidPaths WHERE id = ?1")?
            .execute(params![id])?;
        tx.commit()?;
        Ok(())
    }

    /// All registered paths, for the garbage collector's sweep.
    pub fn all_valid_paths(&self) -> Result<Vec<String>, DbError> {
        let mut stmt = self.conn.prepare_cached("SELECT path FROM ValidPaths")?;
        let paths = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(paths)
    }

    /// Paths that reference `path`.
    pub fn query_referrers(&self, path: &str) -> Result<BTreeSet<String>, DbError> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT referrer_paths.path FROM ValidPaths AS referrer_paths
             JOIN Refs ON referrer_paths.id = Refs.referrer
             JOIN ValidPaths AS target ON target.id = Refs.reference
             WHERE target.path = ?1",
        )?;
        let referrers = stmt
            .query_map(params![path], |row| row.get::<_, String>(0))?
            .collect::<Result<BTreeSet<_>, _>>()?;
        Ok(referrers)
    }
}

fn path_id(conn: &Connection, path: &str) -> Result<Option<i64>, DbError> {
    Ok(conn
        .prepare_cached("SELECT id FROM ValidPaths WHERE path = ?1")?
        .query_row(params![path], |row| row.get(0))
        .optional()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn register_one(db: &mut StoreDb, path: &str, refs: &[&str]) -> Result<(), DbError> {
        db.register_valid_paths(&[RegisterPathParams {
            path: path.to_string(),
            hash: "sha256:0000000000000000000000000000000000000000000000000000000000000000"
                .to_string(),
            deriver: None,
            nar_size: 100,
            ultimate: true,
            sigs: vec![],
            ca: None,
            references: refs.iter().map(|s| s.to_string()).collect(),
        }])
    }

    #[test]
    fn test_register_and_query() {
        let mut db = StoreDb::open_memory().unwrap();
        register_one(&mut db, "/store/aaa-x", &[]).unwrap();

        assert!(db.is_valid_path("/store/aaa-x").unwrap());
        assert!(!db.is_valid_path("/store/bbb-y").unwrap());

        let info = db.query_path_info("/store/aaa-x").unwrap().unwrap();
        assert_eq!(info.nar_size, 100);
        assert!(info.ultimate);
        assert!(info.references.is_empty());
    }

    #[test]
    fn test_missing_reference_rejected() {
        let mut db = StoreDb::open_memory().unwrap();
        let err = register_one(&mut db, "/store/aaa-x", &["/store/bbb-missing"]).unwrap_err();
        assert!(matches!(err, DbError::MissingReference { .. }));
        // The transaction rolled back: nothing registered.
        assert!(!db.is_valid_path("/store/aaa-x").unwrap());
    }

    #[test]
    fn test_batch_is_atomic_and_closure_closed() {
        let mut db = StoreDb::open_memory().unwrap();
        // b references a, both registered in one batch; a self-reference on b.
        db.register_valid_paths(&[
            RegisterPathParams {
                path: "/store/aaa-a".into(),
                hash: "sha256:00".into(),
                deriver: None,
                nar_size: 1,
                ultimate: true,
                sigs: vec![],
                ca: None,
                references: BTreeSet::new(),
            },
            RegisterPathParams {
                path: "/store/bbb-b".into(),
                hash: "sha256:01".into(),
                deriver: None,
                nar_size: 1,
                ultimate: true,
                sigs: vec![],
                ca: None,
                references: ["/store/aaa-a", "/store/bbb-b"]
                    .iter()
                    .map(|s| s.to_string())
                    .collect(),
            },
        ])
        .unwrap();

        let info = db.query_path_info("/store/bbb-b").unwrap().unwrap();
        assert_eq!(info.references.len(), 2);
        assert_eq!(db.query_referrers("/store/aaa-a").unwrap().len(), 1);
    }

    #[test]
    fn test_invalidate_respects_referrers() {
        let mut db = StoreDb::open_memory().unwrap();
        register_one(&mut db, "/store/aaa-a", &[]).unwrap();
        register_one(&mut db, "/store/bbb-b", &["/store/aaa-a"]).unwrap();

        assert!(matches!(
            db.invalidate_path("/store/aaa-a"),
            Err(DbError::StillReferenced(_))
        ));

        db.invalidate_path("/store/bbb-b").unwrap();
        db.invalidate_path("/store/aaa-a").unwrap();
        assert!(!db.is_valid_path("/store/aaa-a").unwrap());
    }

    #[test]
    fn test_reregister_same_hash_is_idempotent() {
        let mut db = StoreDb::open_memory().unwrap();
        register_one(&mut db, "/store/aaa-a", &[]).unwrap();
        register_one(&mut db, "/store/aaa-a", &[]).unwrap();

        let mut conflicting = StoreDb::open_memory().unwrap();
        register_one(&mut conflicting, "/store/aaa-a", &[]).unwrap();
        let err = conflicting
            .register_valid_paths(&[RegisterPathParams {
                path: "/store/aaa-a".into(),
                hash: "sha256:1111111111111111111111111111111111111111111111111111111111111111"
                    .into(),
                deriver: None,
                nar_size: 1,
                ultimate: true,
                sigs: vec![],
                ca: None,
                references: BTreeSet::new(),
            }])
            .unwrap_err();
        assert!(matches!(err, DbError::Conflict(_)));
    }
}
