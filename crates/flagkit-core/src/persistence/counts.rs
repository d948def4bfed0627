//! Counter statements. Callers run these inside the same transaction as the
//! ledger row change they account for.

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{FlagError, Result};
use crate::flagging::{FlagCount, TargetRef};

pub(crate) fn increment(conn: &Connection, flag_id: &str, target: &TargetRef, now_ms: i64) -> Result<()> {
    conn.execute(
        "INSERT INTO flag_counts (flag_id, entity_type, entity_id, count, last_updated)
         VALUES (?1, ?2, ?3, 1, ?4)
         ON CONFLICT(flag_id, entity_type, entity_id)
         DO UPDATE SET count = count + 1, last_updated = excluded.last_updated",
        params![flag_id, target.entity_type, target.entity_id, now_ms],
    )?;
    Ok(())
}

/// Take `n` off a count. Fails without clamping if the count is too small.
pub(crate) fn decrement(
    conn: &Connection,
    flag_id: &str,
    target: &TargetRef,
    n: u64,
    now_ms: i64,
) -> Result<()> {
    let n = n as i64;
    let changed = conn.execute(
        "UPDATE flag_counts SET count = count - ?4, last_updated = ?5
         WHERE flag_id = ?1 AND entity_type = ?2 AND entity_id = ?3 AND count >= ?4",
        params![flag_id, target.entity_type, target.entity_id, n, now_ms],
    )?;
    if changed == 0 {
        let current = get(conn, flag_id, target)?;
        return Err(FlagError::InvariantViolation {
            flag_id: flag_id.to_string(),
            detail: format!(
                "count for {} is {} but {} flagging(s) are being removed",
                target, current, n
            ),
        });
    }
    conn.execute(
        "DELETE FROM flag_counts
         WHERE flag_id = ?1 AND entity_type = ?2 AND entity_id = ?3 AND count = 0",
        params![flag_id, target.entity_type, target.entity_id],
    )?;
    Ok(())
}

pub(crate) fn get(conn: &Connection, flag_id: &str, target: &TargetRef) -> Result<u64> {
    let count: Option<i64> = conn
        .query_row(
            "SELECT count FROM flag_counts WHERE flag_id = ?1 AND entity_type = ?2 AND entity_id = ?3",
            params![flag_id, target.entity_type, target.entity_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(count.unwrap_or(0).max(0) as u64)
}

pub(crate) fn for_flag(conn: &Connection, flag_id: &str) -> Result<Vec<FlagCount>> {
    let mut stmt = conn.prepare(
        "SELECT entity_type, entity_id, count FROM flag_counts
         WHERE flag_id = ?1 AND count > 0
         ORDER BY entity_type, entity_id",
    )?;
    let counts = stmt
        .query_map(params![flag_id], |row| {
            let entity_type: String = row.get(0)?;
            let entity_id: String = row.get(1)?;
            let count: i64 = row.get(2)?;
            Ok(FlagCount {
                flag_id: flag_id.to_string(),
                target: TargetRef::new(entity_type, entity_id),
                count: count as u64,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(counts)
}

/// Replace all counts of a flag with a fresh aggregate of its rows.
pub(crate) fn rebuild(conn: &Connection, flag_id: &str, now_ms: i64) -> Result<usize> {
    conn.execute("DELETE FROM flag_counts WHERE flag_id = ?1", params![flag_id])?;
    let written = conn.execute(
        "INSERT INTO flag_counts (flag_id, entity_type, entity_id, count, last_updated)
         SELECT flag_id, entity_type, entity_id, COUNT(*), ?2
         FROM flaggings WHERE flag_id = ?1
         GROUP BY flag_id, entity_type, entity_id",
        params![flag_id, now_ms],
    )?;
    Ok(written)
}
