use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::interval;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolStats {
    pub symbol: String,
    pub hits: u64,
    pub first_hit: Option<DateTime<Utc>>,
    pub last_hit: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanStats {
    pub total_scans: u64,
    pub actions: HashMap<String, u64>,
    pub total_scan_time_ms: u64,
    pub start_time: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum StatEvent {
    SymbolHit { symbol: String },
    ScanCompleted { action: String, scan_time_ms: u64 },
}

/// Buffers scan statistics over a channel and flushes them to SQLite on an
/// interval, so the scan path never blocks on disk.
pub struct StatisticsCollector {
    db_path: String,
    sender: mpsc::UnboundedSender<StatEvent>,
    _handle: tokio::task::JoinHandle<()>,
}

impl StatisticsCollector {
    pub fn new(db_path: String, flush_interval_seconds: u64) -> Result<Self> {
        if let Some(parent) = Path::new(&db_path).parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create stats directory: {}", parent.display())
            })?;
        }

        let (sender, receiver) = mpsc::unbounded_channel();

        let db_path_clone = db_path.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) =
                Self::stats_worker(db_path_clone, receiver, flush_interval_seconds).await
            {
                log::error!("Statistics worker error: {e}");
            }
        });

        Ok(Self {
            db_path,
            sender,
            _handle: handle,
        })
    }

    pub fn record_event(&self, event: StatEvent) {
        if let Err(e) = self.sender.send(event) {
            log::warn!("Failed to send statistics event: {e}");
        }
    }

    async fn stats_worker(
        db_path: String,
        mut receiver: mpsc::UnboundedReceiver<StatEvent>,
        flush_interval_seconds: u64,
    ) -> Result<()> {
        let conn = Self::init_database(&db_path)?;
        let mut symbol_buffer: HashMap<String, SymbolStats> = HashMap::new();
        let mut scan_stats = Self::load_scan_stats(&conn)?;

        let mut flush_timer = interval(Duration::from_secs(flush_interval_seconds));
        let mut last_flush = Instant::now();

        loop {
            tokio::select! {
                event = receiver.recv() => {
                    match event {
                        Some(event) => {
                            Self::process_event(event, &mut symbol_buffer, &mut scan_stats);
                        }
                        None => {
                            Self::flush_to_database(&conn, &symbol_buffer, &scan_stats)?;
                            break;
                        }
                    }
                }
                _ = flush_timer.tick() => {
                    if last_flush.elapsed() >= Duration::from_secs(flush_interval_seconds) {
                        if let Err(e) = Self::flush_to_database(&conn, &symbol_buffer, &scan_stats) {
                            log::error!("Failed to flush statistics: {e}");
                        } else {
                            symbol_buffer.clear();
                            last_flush = Instant::now();
                        }
                    }
                }
            }
        }

        Ok(())
    }

    fn process_event(
        event: StatEvent,
        symbol_buffer: &mut HashMap<String, SymbolStats>,
        scan_stats: &mut ScanStats,
    ) {
        let now = Utc::now();
        scan_stats.last_updated = now;

        match event {
            StatEvent::SymbolHit { symbol } => {
                let stats = symbol_buffer
                    .entry(symbol.clone())
                    .or_insert_with(|| SymbolStats {
                        symbol,
                        hits: 0,
                        first_hit: Some(now),
                        last_hit: Some(now),
                    });
                stats.hits += 1;
                stats.last_hit = Some(now);
            }
            StatEvent::ScanCompleted {
                action,
                scan_time_ms,
            } => {
                scan_stats.total_scans += 1;
                scan_stats.total_scan_time_ms += scan_time_ms;
                *scan_stats.actions.entry(action).or_insert(0) += 1;
            }
        }
    }

    fn init_database(db_path: &str) -> Result<Connection> {
        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open statistics database: {db_path}"))?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS symbol_stats (
                symbol TEXT PRIMARY KEY,
                hits INTEGER NOT NULL DEFAULT 0,
                first_hit TEXT,
                last_hit TEXT
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS scan_stats (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                total_scans INTEGER NOT NULL DEFAULT 0,
                total_scan_time_ms INTEGER NOT NULL DEFAULT 0,
                start_time TEXT NOT NULL,
                last_updated TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS action_stats (
                action TEXT PRIMARY KEY,
                count INTEGER NOT NULL DEFAULT 0
            )",
            [],
        )?;

        conn.execute(
            "INSERT OR IGNORE INTO scan_stats (id, start_time, last_updated) VALUES (1, ?, ?)",
            params![Utc::now().to_rfc3339(), Utc::now().to_rfc3339()],
        )?;

        Ok(conn)
    }

    fn load_scan_stats(conn: &Connection) -> Result<ScanStats> {
        let mut stmt = conn.prepare(
            "SELECT total_scans, total_scan_time_ms, start_time, last_updated
             FROM scan_stats WHERE id = 1",
        )?;

        let mut stats = stmt.query_row([], |row| {
            Ok(ScanStats {
                total_scans: row.get(0)?,
                actions: HashMap::new(),
                total_scan_time_ms: row.get(1)?,
                start_time: DateTime::parse_from_rfc3339(&row.get::<_, String>(2)?)
                    .unwrap()
                    .with_timezone(&Utc),
                last_updated: DateTime::parse_from_rfc3339(&row.get::<_, String>(3)?)
                    .unwrap()
                    .with_timezone(&Utc),
            })
        })?;

        let mut stmt = conn.prepare("SELECT action, count FROM action_stats")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, u64>(1)?))
        })?;
        for row in rows {
            let (action, count) = row?;
            stats.actions.insert(action, count);
        }

        Ok(stats)
    }

    fn flush_to_database(
        conn: &Connection,
        symbol_buffer: &HashMap<String, SymbolStats>,
        scan_stats: &ScanStats,
    ) -> Result<()> {
        let tx = conn.unchecked_transaction()?;

        tx.execute(
            "UPDATE scan_stats SET
                total_scans = ?, total_scan_time_ms = ?, last_updated = ?
             WHERE id = 1",
            params![
                scan_stats.total_scans,
                scan_stats.total_scan_time_ms,
                scan_stats.last_updated.to_rfc3339()
            ],
        )?;

        for (action, count) in &scan_stats.actions {
            tx.execute(
                "INSERT OR REPLACE INTO action_stats (action, count) VALUES (?, ?)",
                params![action, count],
            )?;
        }

        for stats in symbol_buffer.values() {
            tx.execute(
                "INSERT OR REPLACE INTO symbol_stats (symbol, hits, first_hit, last_hit)
                 VALUES (?,
                         COALESCE((SELECT hits FROM symbol_stats WHERE symbol = ?), 0) + ?,
                         COALESCE((SELECT first_hit FROM symbol_stats WHERE symbol = ?), ?),
                         ?)",
                params![
                    stats.symbol,
                    stats.symbol,
                    stats.hits,
                    stats.symbol,
                    stats.first_hit.map(|t| t.to_rfc3339()),
                    stats.last_hit.map(|t| t.to_rfc3339()),
                ],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    pub fn get_stats(&self) -> Result<(ScanStats, Vec<SymbolStats>)> {
        let conn = Self::init_database(&self.db_path)?;
        let scan_stats = Self::load_scan_stats(&conn)?;

        let mut stmt = conn.prepare(
            "SELECT symbol, hits, first_hit, last_hit
             FROM symbol_stats ORDER BY hits DESC",
        )?;

        let symbol_stats = stmt
            .query_map([], |row| {
                Ok(SymbolStats {
                    symbol: row.get(0)?,
                    hits: row.get(1)?,
                    first_hit: row.get::<_, Option<String>>(2)?.map(|s| {
                        DateTime::parse_from_rfc3339(&s)
                            .unwrap()
                            .with_timezone(&Utc)
                    }),
                    last_hit: row.get::<_, Option<String>>(3)?.map(|s| {
                        DateTime::parse_from_rfc3339(&s)
                            .unwrap()
                            .with_timezone(&Utc)
                    }),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok((scan_stats, symbol_stats))
    }

    pub fn reset_stats(&self) -> Result<()> {
        let conn = Self::init_database(&self.db_path)?;
        conn.execute("DELETE FROM symbol_stats", [])?;
        conn.execute("DELETE FROM action_stats", [])?;
        conn.execute(
            "UPDATE scan_stats SET
                total_scans = 0, total_scan_time_ms = 0, start_time = ?, last_updated = ?
             WHERE id = 1",
            params![Utc::now().to_rfc3339(), Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }
}
