use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{EngineError, EngineResult};
use crate::model::{OutcomeRecord, Side};

/// Serialize `value` to a sibling temp file, fsync it, then rename over `path`.
/// Readers see either the previous file or the complete new one.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let json = serde_json::to_string_pretty(value)
        .with_context(|| format!("failed to serialize {}", path.display()))?;

    let tmp = temp_path_for(path);
    {
        let mut file = std::fs::File::create(&tmp)
            .with_context(|| format!("failed to create {}", tmp.display()))?;
        file.write_all(json.as_bytes())
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        file.sync_all()
            .with_context(|| format!("failed to sync {}", tmp.display()))?;
    }
    std::fs::rename(&tmp, path)
        .with_context(|| format!("failed to replace {}", path.display()))?;
    Ok(())
}

/// `Ok(None)` when the file does not exist.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let payload = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let value = serde_json::from_str(&payload)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    Ok(Some(value))
}

fn temp_path_for(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "state".to_string());
    path.with_file_name(format!(".{}.{}.tmp", name, std::process::id()))
}

/// Append-only settlement log. Rows are never updated or deleted; triggers
/// reject any attempt to do so.
pub struct OutcomeLog {
    conn: Connection,
}

impl OutcomeLog {
    pub fn open(path: &Path) -> EngineResult<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> EngineResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> EngineResult<Self> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS outcomes (
                record_id TEXT PRIMARY KEY,
                contract_id TEXT NOT NULL,
                segment_id TEXT NOT NULL,
                side TEXT NOT NULL,
                entry_price_cents INTEGER NOT NULL,
                contracts INTEGER NOT NULL,
                settlement_value_cents INTEGER NOT NULL,
                pnl REAL NOT NULL,
                model_probability REAL NOT NULL,
                settled_at_ms INTEGER NOT NULL,
                inserted_at_ms INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_outcomes_segment ON outcomes(segment_id);

            CREATE TRIGGER IF NOT EXISTS outcomes_no_update
            BEFORE UPDATE ON outcomes
            BEGIN
                SELECT RAISE(ABORT, 'outcomes are append-only');
            END;

            CREATE TRIGGER IF NOT EXISTS outcomes_no_delete
            BEFORE DELETE ON outcomes
            BEGIN
                SELECT RAISE(ABORT, 'outcomes are append-only');
            END;
            "#,
        )?;
        Ok(Self { conn })
    }

    /// Insert a settlement row. Returns `false` if the record id is already logged.
    pub fn append(&self, record: &OutcomeRecord) -> EngineResult<bool> {
        let inserted = self.conn.execute(
            r#"
            INSERT OR IGNORE INTO outcomes (
                record_id, contract_id, segment_id, side, entry_price_cents, contracts,
                settlement_value_cents, pnl, model_probability, settled_at_ms, inserted_at_ms
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
            params![
                record.record_id,
                record.contract_id,
                record.segment_id,
                record.side.as_str(),
                record.entry_price_cents,
                record.contracts,
                record.settlement_value_cents,
                record.pnl,
                record.model_probability_at_entry,
                record.settled_at.timestamp_millis(),
                Utc::now().timestamp_millis(),
            ],
        )?;
        Ok(inserted == 1)
    }

    pub fn contains(&self, record_id: &str) -> EngineResult<bool> {
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM outcomes WHERE record_id = ?1",
                params![record_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn count(&self) -> EngineResult<u64> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM outcomes", [], |row| row.get(0))?;
        Ok(n.max(0) as u64)
    }

    pub fn all(&self) -> EngineResult<Vec<OutcomeRecord>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT record_id, contract_id, segment_id, side, entry_price_cents, contracts,
                   settlement_value_cents, pnl, model_probability, settled_at_ms
            FROM outcomes
            ORDER BY settled_at_ms ASC, record_id ASC
            "#,
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, u32>(4)?,
                row.get::<_, u32>(5)?,
                row.get::<_, u32>(6)?,
                row.get::<_, f64>(7)?,
                row.get::<_, f64>(8)?,
                row.get::<_, i64>(9)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (record_id, contract_id, segment_id, side, entry, n, settle, pnl, prob, ts) =
                row?;
            let side = match side.as_str() {
                "yes" => Side::Yes,
                "no" => Side::No,
                other => {
                    return Err(EngineError::inconsistent(
                        "outcome_log",
                        format!("unknown side '{other}' for {record_id}"),
                    ))
                }
            };
            let settled_at = Utc.timestamp_millis_opt(ts).single().ok_or_else(|| {
                EngineError::inconsistent("outcome_log", format!("bad timestamp for {record_id}"))
            })?;
            out.push(OutcomeRecord {
                record_id,
                contract_id,
                segment_id,
                side,
                entry_price_cents: entry,
                contracts: n,
                settlement_value_cents: settle,
                pnl,
                model_probability_at_entry: prob,
                settled_at,
            });
        }
        Ok(out)
    }

    #[cfg(test)]
    fn raw_conn(&self) -> &Connection {
        &self.conn
    }
}
