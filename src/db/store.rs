//! SQLite database store implementation.

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Result as SqlResult, Row};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use super::models::*;
use super::{CheckStore, DbError, IncidentStore, TargetRegistry};

mod embedded {
    refinery::embed_migrations!("migrations");
}

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.9f";

const TARGET_COLUMNS: &str = "id, name, protocol, address, interval_secs, timeout_secs, \
     expected_status, keyword, port, http_method, headers, body, follow_redirects, cert_check, \
     ws_handshake, paused, status, last_checked, response_time_ms, total_checks, \
     successful_checks, failed_checks, uptime, created_at";

const INCIDENT_COLUMNS: &str =
    "id, target_id, kind, started_at, ended_at, duration_secs, resolved, detail, notifications_sent";

const LOG_COLUMNS: &str = "id, target_id, status, response_time_ms, status_code, error, checked_at";

/// Thread-safe database store.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Create a new store with the given database path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init()?;
        Ok(store)
    }

    /// Enable foreign keys and run embedded migrations.
    fn init(&self) -> Result<(), DbError> {
        let mut conn = self.conn()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        embedded::migrations::runner()
            .run(&mut *conn)
            .map_err(|e| DbError::Migration(e.to_string()))?;
        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, DbError> {
        self.conn.lock().map_err(|_| DbError::Poisoned)
    }
}

// --- Target Registry ---

impl TargetRegistry for Store {
    fn list_targets(&self) -> Result<Vec<Target>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!("SELECT {} FROM targets ORDER BY id", TARGET_COLUMNS))?;
        let rows = stmt
            .query_map([], read_target_row)?
            .collect::<SqlResult<Vec<_>>>()?;
        rows.into_iter().collect()
    }

    fn list_active_targets(&self) -> Result<Vec<Target>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM targets WHERE paused = 0 ORDER BY id",
            TARGET_COLUMNS
        ))?;
        let rows = stmt
            .query_map([], read_target_row)?
            .collect::<SqlResult<Vec<_>>>()?;
        rows.into_iter().collect()
    }

    fn get_target(&self, id: TargetId) -> Result<Target, DbError> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                &format!("SELECT {} FROM targets WHERE id = ?1", TARGET_COLUMNS),
                params![id],
                read_target_row,
            )
            .optional()?;
        row.ok_or(DbError::NotFound)?
    }

    fn add_target(&self, config: &TargetConfig) -> Result<Target, DbError> {
        let created_at = Utc::now();
        let headers = encode_headers(&config.headers)?;
        let stats = TargetStats::default();

        let id = {
            let conn = self.conn()?;
            conn.execute(
                "INSERT INTO targets (name, protocol, address, interval_secs, timeout_secs, \
                 expected_status, keyword, port, http_method, headers, body, follow_redirects, \
                 cert_check, ws_handshake, paused, status, uptime, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
                params![
                    config.name,
                    config.protocol.as_str(),
                    config.address,
                    config.interval_secs as i64,
                    config.timeout_secs as i64,
                    config.expected_status,
                    config.keyword,
                    config.port,
                    config.method.to_uppercase(),
                    headers,
                    config.body,
                    config.follow_redirects,
                    config.cert_check,
                    config.ws_handshake,
                    config.paused,
                    stats.status.as_str(),
                    stats.uptime,
                    format_db_time(created_at),
                ],
            )?;
            conn.last_insert_rowid()
        };

        Ok(Target {
            id,
            config: TargetConfig {
                method: config.method.to_uppercase(),
                ..config.clone()
            },
            stats,
            created_at,
        })
    }

    fn update_target(&self, id: TargetId, config: &TargetConfig) -> Result<(), DbError> {
        let headers = encode_headers(&config.headers)?;
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE targets SET name=?1, protocol=?2, address=?3, interval_secs=?4, timeout_secs=?5, \
             expected_status=?6, keyword=?7, port=?8, http_method=?9, headers=?10, body=?11, \
             follow_redirects=?12, cert_check=?13, ws_handshake=?14, paused=?15 WHERE id=?16",
            params![
                config.name,
                config.protocol.as_str(),
                config.address,
                config.interval_secs as i64,
                config.timeout_secs as i64,
                config.expected_status,
                config.keyword,
                config.port,
                config.method.to_uppercase(),
                headers,
                config.body,
                config.follow_redirects,
                config.cert_check,
                config.ws_handshake,
                config.paused,
                id,
            ],
        )?;
        if changed == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    fn delete_target(&self, id: TargetId) -> Result<(), DbError> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;
        tx.execute("DELETE FROM check_logs WHERE target_id = ?1", params![id])?;
        tx.execute("DELETE FROM incidents WHERE target_id = ?1", params![id])?;
        let removed = tx.execute("DELETE FROM targets WHERE id = ?1", params![id])?;
        tx.commit()?;
        if removed == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }
}

// --- Check Logs & Statistics ---

impl CheckStore for Store {
    fn append_check_log(&self, entry: &CheckLogEntry) -> Result<i64, DbError> {
        let conn = self.conn()?;
        insert_check_log(&conn, entry)
    }

    fn update_target_stats(&self, id: TargetId, stats: &TargetStats) -> Result<(), DbError> {
        let conn = self.conn()?;
        update_stats(&conn, id, stats)
    }

    fn read_stats(&self, id: TargetId) -> Result<TargetStats, DbError> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT status, last_checked, response_time_ms, total_checks, successful_checks, \
                 failed_checks, uptime FROM targets WHERE id = ?1",
                params![id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, Option<i64>>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, i64>(4)?,
                        row.get::<_, i64>(5)?,
                        row.get::<_, f64>(6)?,
                    ))
                },
            )
            .optional()?
            .ok_or(DbError::NotFound)?;

        let (status, last_checked, response_time_ms, total, successful, failed, uptime) = row;
        Ok(TargetStats {
            status: Status::parse(&status)
                .ok_or_else(|| DbError::Corrupt(format!("target status {:?}", status)))?,
            last_checked: last_checked.as_deref().and_then(parse_db_time),
            response_time_ms: response_time_ms.map(|ms| ms.max(0) as u64),
            total_checks: total.max(0) as u64,
            successful_checks: successful.max(0) as u64,
            failed_checks: failed.max(0) as u64,
            uptime,
        })
    }

    fn commit_check(&self, entry: &CheckLogEntry, stats: &TargetStats) -> Result<(), DbError> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;
        update_stats(&tx, entry.target_id, stats)?;
        insert_check_log(&tx, entry)?;
        tx.commit()?;
        Ok(())
    }

    fn list_check_logs(
        &self,
        id: TargetId,
        since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<CheckLogEntry>, DbError> {
        let conn = self.conn()?;
        let since = since.map(format_db_time).unwrap_or_default();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM check_logs WHERE target_id = ?1 AND checked_at >= ?2 \
             ORDER BY checked_at DESC, id DESC LIMIT ?3",
            LOG_COLUMNS
        ))?;
        let rows = stmt
            .query_map(params![id, since, limit.min(i64::MAX as usize) as i64], read_log_row)?
            .collect::<SqlResult<Vec<_>>>()?;
        rows.into_iter().collect()
    }

    fn purge_check_logs_before(&self, cutoff: DateTime<Utc>) -> Result<usize, DbError> {
        let conn = self.conn()?;
        let removed = conn.execute(
            "DELETE FROM check_logs WHERE checked_at < ?1",
            params![format_db_time(cutoff)],
        )?;
        Ok(removed)
    }
}

// --- Incidents ---

impl IncidentStore for Store {
    fn get_open_incident(
        &self,
        target_id: TargetId,
        kind: IncidentKind,
    ) -> Result<Option<Incident>, DbError> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                &format!(
                    "SELECT {} FROM incidents WHERE target_id = ?1 AND kind = ?2 AND resolved = 0 \
                     ORDER BY started_at DESC LIMIT 1",
                    INCIDENT_COLUMNS
                ),
                params![target_id, kind.as_str()],
                read_incident_row,
            )
            .optional()?;
        row.transpose()
    }

    fn create_incident(&self, incident: &NewIncident) -> Result<Incident, DbError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO incidents (target_id, kind, started_at, resolved, detail, notifications_sent) \
             VALUES (?1, ?2, ?3, 0, ?4, '[]')",
            params![
                incident.target_id,
                incident.kind.as_str(),
                format_db_time(incident.started_at),
                incident.detail,
            ],
        )?;
        Ok(Incident {
            id: conn.last_insert_rowid(),
            target_id: incident.target_id,
            kind: incident.kind,
            started_at: incident.started_at,
            ended_at: None,
            duration_secs: None,
            resolved: false,
            detail: incident.detail.clone(),
            notifications_sent: Vec::new(),
        })
    }

    fn close_incident(&self, id: i64, ended_at: DateTime<Utc>) -> Result<Incident, DbError> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;
        let mut incident = tx
            .query_row(
                &format!("SELECT {} FROM incidents WHERE id = ?1", INCIDENT_COLUMNS),
                params![id],
                read_incident_row,
            )
            .optional()?
            .ok_or(DbError::NotFound)??;

        let duration = (ended_at - incident.started_at).num_seconds().max(0);
        tx.execute(
            "UPDATE incidents SET resolved = 1, ended_at = ?1, duration_secs = ?2 WHERE id = ?3",
            params![format_db_time(ended_at), duration, id],
        )?;
        tx.commit()?;

        incident.resolved = true;
        incident.ended_at = Some(ended_at);
        incident.duration_secs = Some(duration);
        Ok(incident)
    }

    fn mark_notified(&self, id: i64, channels: &[String]) -> Result<(), DbError> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;
        let current: String = tx
            .query_row(
                "SELECT notifications_sent FROM incidents WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or(DbError::NotFound)?;

        let mut sent = decode_channels(&current)?;
        sent.extend(channels.iter().cloned());
        let encoded =
            serde_json::to_string(&sent).map_err(|e| DbError::Corrupt(e.to_string()))?;
        tx.execute(
            "UPDATE incidents SET notifications_sent = ?1 WHERE id = ?2",
            params![encoded, id],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn list_incidents(
        &self,
        target_id: Option<TargetId>,
        limit: usize,
    ) -> Result<Vec<Incident>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM incidents WHERE (?1 IS NULL OR target_id = ?1) \
             ORDER BY started_at DESC, id DESC LIMIT ?2",
            INCIDENT_COLUMNS
        ))?;
        let rows = stmt
            .query_map(params![target_id, limit.min(i64::MAX as usize) as i64], read_incident_row)?
            .collect::<SqlResult<Vec<_>>>()?;
        rows.into_iter().collect()
    }
}

// --- Row helpers ---

fn insert_check_log(conn: &Connection, entry: &CheckLogEntry) -> Result<i64, DbError> {
    conn.execute(
        "INSERT INTO check_logs (target_id, status, response_time_ms, status_code, error, checked_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            entry.target_id,
            entry.status.as_str(),
            entry.response_time_ms as i64,
            entry.status_code,
            entry.error,
            format_db_time(entry.checked_at),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

fn update_stats(conn: &Connection, id: TargetId, stats: &TargetStats) -> Result<(), DbError> {
    let changed = conn.execute(
        "UPDATE targets SET status=?1, last_checked=?2, response_time_ms=?3, total_checks=?4, \
         successful_checks=?5, failed_checks=?6, uptime=?7 WHERE id=?8",
        params![
            stats.status.as_str(),
            stats.last_checked.map(format_db_time),
            stats.response_time_ms.map(|ms| ms as i64),
            stats.total_checks as i64,
            stats.successful_checks as i64,
            stats.failed_checks as i64,
            stats.uptime,
            id,
        ],
    )?;
    if changed == 0 {
        return Err(DbError::NotFound);
    }
    Ok(())
}

/// Rows are read in two steps: SQLite errors surface from `query_map`,
/// value decoding errors from the inner result.
fn read_target_row(row: &Row<'_>) -> SqlResult<Result<Target, DbError>> {
    let protocol: String = row.get(2)?;
    let headers: String = row.get(10)?;
    let status: String = row.get(16)?;
    let last_checked: Option<String> = row.get(17)?;
    let created_at: String = row.get(23)?;

    let config = (|| -> Result<TargetConfig, DbError> {
        Ok(TargetConfig {
            name: row.get(1)?,
            protocol: protocol
                .parse()
                .map_err(|_| DbError::Corrupt(format!("protocol {:?}", protocol)))?,
            address: row.get(3)?,
            interval_secs: row.get::<_, i64>(4)?.max(0) as u64,
            timeout_secs: row.get::<_, i64>(5)?.max(0) as u64,
            expected_status: row.get(6)?,
            keyword: row.get(7)?,
            port: row.get(8)?,
            method: row.get(9)?,
            headers: decode_headers(&headers)?,
            body: row.get(11)?,
            follow_redirects: row.get(12)?,
            cert_check: row.get(13)?,
            ws_handshake: row.get(14)?,
            paused: row.get(15)?,
        })
    })();

    let config = match config {
        Ok(c) => c,
        Err(e) => return Ok(Err(e)),
    };

    let Some(status) = Status::parse(&status) else {
        return Ok(Err(DbError::Corrupt(format!("target status {:?}", status))));
    };

    Ok(Ok(Target {
        id: row.get(0)?,
        config,
        stats: TargetStats {
            status,
            last_checked: last_checked.as_deref().and_then(parse_db_time),
            response_time_ms: row.get::<_, Option<i64>>(18)?.map(|ms| ms.max(0) as u64),
            total_checks: row.get::<_, i64>(19)?.max(0) as u64,
            successful_checks: row.get::<_, i64>(20)?.max(0) as u64,
            failed_checks: row.get::<_, i64>(21)?.max(0) as u64,
            uptime: row.get(22)?,
        },
        created_at: parse_db_time(&created_at).unwrap_or_else(Utc::now),
    }))
}

fn read_log_row(row: &Row<'_>) -> SqlResult<Result<CheckLogEntry, DbError>> {
    let status: String = row.get(2)?;
    let checked_at: String = row.get(6)?;
    let Some(status) = CheckStatus::parse(&status) else {
        return Ok(Err(DbError::Corrupt(format!("check status {:?}", status))));
    };
    Ok(Ok(CheckLogEntry {
        id: row.get(0)?,
        target_id: row.get(1)?,
        status,
        response_time_ms: row.get::<_, i64>(3)?.max(0) as u64,
        status_code: row.get(4)?,
        error: row.get(5)?,
        checked_at: parse_db_time(&checked_at).unwrap_or_else(Utc::now),
    }))
}

fn read_incident_row(row: &Row<'_>) -> SqlResult<Result<Incident, DbError>> {
    let kind: String = row.get(2)?;
    let started_at: String = row.get(3)?;
    let ended_at: Option<String> = row.get(4)?;
    let sent: String = row.get(8)?;

    let Some(kind) = IncidentKind::parse(&kind) else {
        return Ok(Err(DbError::Corrupt(format!("incident kind {:?}", kind))));
    };
    let notifications_sent = match decode_channels(&sent) {
        Ok(s) => s,
        Err(e) => return Ok(Err(e)),
    };

    Ok(Ok(Incident {
        id: row.get(0)?,
        target_id: row.get(1)?,
        kind,
        started_at: parse_db_time(&started_at).unwrap_or_else(Utc::now),
        ended_at: ended_at.as_deref().and_then(parse_db_time),
        duration_secs: row.get(5)?,
        resolved: row.get(6)?,
        detail: row.get(7)?,
        notifications_sent,
    }))
}

fn encode_headers(headers: &BTreeMap<String, String>) -> Result<String, DbError> {
    serde_json::to_string(headers).map_err(|e| DbError::Corrupt(e.to_string()))
}

fn decode_headers(raw: &str) -> Result<BTreeMap<String, String>, DbError> {
    if raw.is_empty() {
        return Ok(BTreeMap::new());
    }
    serde_json::from_str(raw).map_err(|e| DbError::Corrupt(format!("headers: {}", e)))
}

fn decode_channels(raw: &str) -> Result<Vec<String>, DbError> {
    if raw.is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(raw).map_err(|e| DbError::Corrupt(format!("notifications: {}", e)))
}

/// Format a timestamp the way it is stored; the fixed width keeps text
/// comparison in chronological order.
pub fn format_db_time(t: DateTime<Utc>) -> String {
    t.format(TIME_FORMAT).to_string()
}

/// Parse a datetime string from the database.
pub fn parse_db_time(s: &str) -> Option<DateTime<Utc>> {
    let formats = [
        TIME_FORMAT,
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M:%S%.9fZ",
        "%Y-%m-%dT%H:%M:%SZ",
    ];

    for fmt in &formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
        }
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }

    None
}
