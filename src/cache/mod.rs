//! Persistent result cache.
//!
//! One SQLite database per project with two logical tables: `query_cache`
//! for engine/structural answers and `ai_summaries` for enrichment output.
//! Every row remembers the content hash of the file it was computed from;
//! a row is served only while that hash still matches the file on disk.
//!
//! Storage failures never surface to callers. They are logged and the
//! operation behaves as a miss (or a no-op for writes).

pub mod fingerprint;

pub use fingerprint::Fingerprint;

use log::{debug, info, warn};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;

use crate::config::{AnalysisDepth, ContextDepth};
use crate::workspace::{file_hash, normalize_path};

pub const SCHEMA_MAJOR: u32 = 1;
pub const SCHEMA_MINOR: u32 = 0;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("payload encoding: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("integrity check failed: {0}")]
    Corrupt(String),
    #[error("schema {found} is incompatible with {expected}")]
    Schema { found: String, expected: String },
    #[error("cache lock poisoned")]
    Poisoned,
}

/// Key of one cached AI summary; a symbol may have one per depth pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SummaryKey {
    pub fingerprint: Fingerprint,
    pub analysis_depth: AnalysisDepth,
    pub context_depth: ContextDepth,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CachedSummary {
    pub text: String,
    pub tokens_used: u64,
    pub provider: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub enabled: bool,
    pub path: Option<PathBuf>,
    pub query_entries: u64,
    pub summary_entries: u64,
    pub db_bytes: u64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

pub struct QueryCache {
    conn: Option<Mutex<Connection>>,
    path: Option<PathBuf>,
    ttl: Duration,
    summary_ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl QueryCache {
    /// Open (or create) the cache at `path`. A database that fails its
    /// integrity or version check is moved aside and recreated; if that also
    /// fails the cache runs disabled.
    pub fn open(path: &Path, ttl: Duration, summary_ttl: Duration) -> Self {
        let conn = match connect(path) {
            Ok(conn) => Some(conn),
            Err(err) => {
                warn!("cache database {} unusable: {err}; recreating", path.display());
                discard_database(path);
                match connect(path) {
                    Ok(conn) => Some(conn),
                    Err(err) => {
                        warn!("cache disabled: {err}");
                        None
                    }
                }
            }
        };
        Self::with_connection(conn, Some(path.to_path_buf()), ttl, summary_ttl)
    }

    pub fn in_memory(ttl: Duration, summary_ttl: Duration) -> Self {
        let conn = Connection::open_in_memory()
            .map_err(CacheError::from)
            .and_then(|conn| init_schema(&conn).map(|_| conn));
        let conn = match conn {
            Ok(conn) => Some(conn),
            Err(err) => {
                warn!("in-memory cache unavailable: {err}");
                None
            }
        };
        Self::with_connection(conn, None, ttl, summary_ttl)
    }

    /// A cache that stores nothing.
    pub fn disabled() -> Self {
        Self::with_connection(None, None, Duration::ZERO, Duration::ZERO)
    }

    fn with_connection(
        conn: Option<Connection>,
        path: Option<PathBuf>,
        ttl: Duration,
        summary_ttl: Duration,
    ) -> Self {
        Self {
            conn: conn.map(Mutex::new),
            path,
            ttl,
            summary_ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.conn.is_some()
    }

    fn with_conn<T>(
        &self,
        op: &str,
        f: impl FnOnce(&Connection) -> Result<T, CacheError>,
    ) -> Option<T> {
        let conn = self.conn.as_ref()?;
        let result = conn
            .lock()
            .map_err(|_| CacheError::Poisoned)
            .and_then(|conn| f(&conn));
        match result {
            Ok(value) => Some(value),
            Err(err) => {
                warn!("cache {op} failed: {err}");
                None
            }
        }
    }

    fn miss(&self) -> Option<Value> {
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    // ==================== Query results ====================

    /// Cached payload for `fingerprint`, if fresh and its file is unchanged.
    pub fn get(&self, fingerprint: &Fingerprint) -> Option<Value> {
        let row = self.with_conn("lookup", |conn| {
            conn.query_row(
                "SELECT payload, source_file, file_hash, created_at, ttl_secs
                 FROM query_cache WHERE fingerprint = ?1",
                params![fingerprint.as_str()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, i64>(4)?,
                    ))
                },
            )
            .optional()
            .map_err(CacheError::from)
        });
        let Some(Some((payload, source, stored_hash, created_at, ttl_secs))) = row else {
            return self.miss();
        };

        if now_unix() - created_at >= ttl_secs {
            debug!("cache entry {fingerprint} expired");
            self.evict("query_cache", fingerprint);
            return self.miss();
        }
        match file_hash(Path::new(&source)) {
            Ok(current) if current == stored_hash => {}
            _ => {
                debug!("cache entry {fingerprint} is stale ({source} changed)");
                self.evict("query_cache", fingerprint);
                return self.miss();
            }
        }

        match serde_json::from_str(&payload) {
            Ok(value) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(value)
            }
            Err(err) => {
                warn!("dropping undecodable cache entry {fingerprint}: {err}");
                self.evict("query_cache", fingerprint);
                self.miss()
            }
        }
    }

    /// Store `payload`; last write wins.
    pub fn put(
        &self,
        fingerprint: &Fingerprint,
        tool: &str,
        payload: &Value,
        source: &Path,
        source_hash: &str,
    ) {
        let ttl = self.ttl.as_secs() as i64;
        self.with_conn("store", |conn| {
            let payload = serde_json::to_string(payload)?;
            conn.execute(
                "INSERT INTO query_cache
                    (fingerprint, tool, payload, source_file, file_hash, created_at, ttl_secs)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(fingerprint) DO UPDATE SET
                    tool = excluded.tool, payload = excluded.payload,
                    source_file = excluded.source_file, file_hash = excluded.file_hash,
                    created_at = excluded.created_at, ttl_secs = excluded.ttl_secs",
                params![
                    fingerprint.as_str(),
                    tool,
                    payload,
                    normalize_path(source),
                    source_hash,
                    now_unix(),
                    ttl
                ],
            )?;
            Ok(())
        });
    }

    fn evict(&self, table: &str, fingerprint: &Fingerprint) {
        let sql = format!("DELETE FROM {table} WHERE fingerprint = ?1");
        if let Some(n) = self.with_conn("evict", |conn| {
            Ok(conn.execute(&sql, params![fingerprint.as_str()])?)
        }) {
            self.evictions.fetch_add(n as u64, Ordering::Relaxed);
        }
    }

    // ==================== Invalidation ====================

    /// Evict every entry derived from `path` whose stored hash no longer
    /// matches the file's current content. Returns the number evicted.
    pub fn invalidate_file(&self, path: &Path) -> usize {
        let source = normalize_path(path);
        let current = file_hash(path).ok();
        let removed = self
            .with_conn("invalidate", |conn| {
                let mut removed = 0;
                for table in ["query_cache", "ai_summaries"] {
                    removed += match &current {
                        Some(hash) => conn.execute(
                            &format!(
                                "DELETE FROM {table} WHERE source_file = ?1 AND file_hash != ?2"
                            ),
                            params![source, hash],
                        )?,
                        None => conn.execute(
                            &format!("DELETE FROM {table} WHERE source_file = ?1"),
                            params![source],
                        )?,
                    };
                }
                Ok(removed)
            })
            .unwrap_or(0);
        if removed > 0 {
            debug!("invalidated {removed} cache entries for {source}");
            self.evictions.fetch_add(removed as u64, Ordering::Relaxed);
        }
        removed
    }

    /// Sweep all tracked files for content changes.
    pub fn invalidate_stale(&self) -> usize {
        let sources: Vec<String> = self
            .with_conn("list sources", |conn| {
                let mut stmt = conn.prepare(
                    "SELECT source_file FROM query_cache
                     UNION SELECT source_file FROM ai_summaries",
                )?;
                let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .unwrap_or_default();
        sources
            .iter()
            .map(|source| self.invalidate_file(Path::new(source)))
            .sum()
    }

    /// Drop rows past their TTL.
    pub fn purge_expired(&self) -> usize {
        let now = now_unix();
        let removed = self
            .with_conn("purge", |conn| {
                let mut removed = 0;
                for table in ["query_cache", "ai_summaries"] {
                    removed += conn.execute(
                        &format!("DELETE FROM {table} WHERE ?1 - created_at >= ttl_secs"),
                        params![now],
                    )?;
                }
                Ok(removed)
            })
            .unwrap_or(0);
        if removed > 0 {
            info!("purged {removed} expired cache entries");
        }
        removed
    }

    pub fn clear(&self) -> usize {
        self.with_conn("clear", |conn| {
            let mut removed = 0;
            for table in ["query_cache", "ai_summaries", "ai_spend"] {
                removed += conn.execute(&format!("DELETE FROM {table}"), [])?;
            }
            Ok(removed)
        })
        .unwrap_or(0)
    }

    pub fn stats(&self) -> CacheStats {
        let counts = self.with_conn("stats", |conn| {
            let queries: i64 = conn.query_row("SELECT COUNT(*) FROM query_cache", [], |r| r.get(0))?;
            let summaries: i64 =
                conn.query_row("SELECT COUNT(*) FROM ai_summaries", [], |r| r.get(0))?;
            Ok((queries as u64, summaries as u64))
        });
        let (query_entries, summary_entries) = counts.unwrap_or_default();
        CacheStats {
            enabled: self.is_enabled(),
            path: self.path.clone(),
            query_entries,
            summary_entries,
            db_bytes: self
                .path
                .as_ref()
                .and_then(|p| fs::metadata(p).ok())
                .map(|m| m.len())
                .unwrap_or(0),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }

    // ==================== AI summaries ====================

    pub fn get_summary(&self, key: &SummaryKey) -> Option<CachedSummary> {
        let row = self.with_conn("summary lookup", |conn| {
            conn.query_row(
                "SELECT summary, tokens_used, provider, source_file, file_hash, created_at, ttl_secs
                 FROM ai_summaries
                 WHERE fingerprint = ?1 AND analysis_depth = ?2 AND context_depth = ?3",
                params![
                    key.fingerprint.as_str(),
                    key.analysis_depth.as_str(),
                    key.context_depth.as_str()
                ],
                |row| {
                    Ok((
                        CachedSummary {
                            text: row.get(0)?,
                            tokens_used: row.get::<_, i64>(1)? as u64,
                            provider: row.get(2)?,
                        },
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, i64>(5)?,
                        row.get::<_, i64>(6)?,
                    ))
                },
            )
            .optional()
            .map_err(CacheError::from)
        });
        let Some(Some((summary, source, stored_hash, created_at, ttl_secs))) = row else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        };
        let fresh = now_unix() - created_at < ttl_secs
            && file_hash(Path::new(&source)).ok().as_deref() == Some(stored_hash.as_str());
        if !fresh {
            self.with_conn("summary evict", |conn| {
                Ok(conn.execute(
                    "DELETE FROM ai_summaries
                     WHERE fingerprint = ?1 AND analysis_depth = ?2 AND context_depth = ?3",
                    params![
                        key.fingerprint.as_str(),
                        key.analysis_depth.as_str(),
                        key.context_depth.as_str()
                    ],
                )?)
            });
            self.evictions.fetch_add(1, Ordering::Relaxed);
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        self.hits.fetch_add(1, Ordering::Relaxed);
        Some(summary)
    }

    pub fn put_summary(
        &self,
        key: &SummaryKey,
        summary: &CachedSummary,
        source: &Path,
        source_hash: &str,
    ) {
        let ttl = self.summary_ttl.as_secs() as i64;
        self.with_conn("summary store", |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO ai_summaries
                    (fingerprint, analysis_depth, context_depth, summary, tokens_used, provider,
                     source_file, file_hash, created_at, ttl_secs)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    key.fingerprint.as_str(),
                    key.analysis_depth.as_str(),
                    key.context_depth.as_str(),
                    summary.text,
                    summary.tokens_used as i64,
                    summary.provider,
                    normalize_path(source),
                    source_hash,
                    now_unix(),
                    ttl
                ],
            )?;
            Ok(())
        });
    }

    // ==================== AI spend ====================

    /// Recorded spend for a `YYYY-MM` month, `None` when storage is unavailable.
    pub fn monthly_spend(&self, month: &str) -> Option<f64> {
        self.with_conn("spend lookup", |conn| {
            Ok(conn
                .query_row(
                    "SELECT cost_usd FROM ai_spend WHERE month = ?1",
                    params![month],
                    |row| row.get::<_, f64>(0),
                )
                .optional()?
                .unwrap_or(0.0))
        })
    }

    pub fn add_spend(&self, month: &str, cost_usd: f64) {
        self.with_conn("spend record", |conn| {
            conn.execute(
                "INSERT INTO ai_spend (month, cost_usd, calls) VALUES (?1, ?2, 1)
                 ON CONFLICT(month) DO UPDATE SET
                    cost_usd = cost_usd + excluded.cost_usd, calls = calls + 1",
                params![month, cost_usd],
            )?;
            Ok(())
        });
    }
}

fn connect(path: &Path) -> Result<Connection, CacheError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let conn = Connection::open(path)?;
    conn.busy_timeout(Duration::from_millis(250))?;

    let check: String = conn.query_row("PRAGMA quick_check", [], |row| row.get(0))?;
    if check != "ok" {
        return Err(CacheError::Corrupt(check));
    }

    let has_meta: bool = conn.query_row(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type = 'table' AND name = 'schema_meta'",
        [],
        |row| row.get(0),
    )?;
    if has_meta {
        let version: Option<String> = conn
            .query_row(
                "SELECT value FROM schema_meta WHERE key = 'schema_version'",
                [],
                |row| row.get(0),
            )
            .optional()?;
        let major = version
            .as_deref()
            .and_then(|v| v.split('.').next())
            .and_then(|m| m.parse::<u32>().ok());
        if major != Some(SCHEMA_MAJOR) {
            return Err(CacheError::Schema {
                found: version.unwrap_or_else(|| "unknown".into()),
                expected: format!("{SCHEMA_MAJOR}.{SCHEMA_MINOR}"),
            });
        }
    }

    init_schema(&conn)?;
    Ok(conn)
}

fn init_schema(conn: &Connection) -> Result<(), CacheError> {
    conn.execute_batch(
        r#"
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        PRAGMA temp_store = MEMORY;
        CREATE TABLE IF NOT EXISTS schema_meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS query_cache (
            fingerprint TEXT PRIMARY KEY,
            tool TEXT NOT NULL,
            payload TEXT NOT NULL,
            source_file TEXT NOT NULL,
            file_hash TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            ttl_secs INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_query_cache_source ON query_cache(source_file);
        CREATE TABLE IF NOT EXISTS ai_summaries (
            fingerprint TEXT NOT NULL,
            analysis_depth TEXT NOT NULL,
            context_depth TEXT NOT NULL,
            summary TEXT NOT NULL,
            tokens_used INTEGER NOT NULL DEFAULT 0,
            provider TEXT NOT NULL,
            source_file TEXT NOT NULL,
            file_hash TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            ttl_secs INTEGER NOT NULL,
            PRIMARY KEY (fingerprint, analysis_depth, context_depth)
        );
        CREATE INDEX IF NOT EXISTS idx_ai_summaries_source ON ai_summaries(source_file);
        CREATE TABLE IF NOT EXISTS ai_spend (
            month TEXT PRIMARY KEY,
            cost_usd REAL NOT NULL,
            calls INTEGER NOT NULL
        );
        "#,
    )?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_meta (key, value) VALUES ('schema_version', ?1)",
        params![format!("{SCHEMA_MAJOR}.{SCHEMA_MINOR}")],
    )?;
    Ok(())
}

/// Move an unusable database (and its WAL side files) out of the way.
fn discard_database(path: &Path) {
    let aside = path.with_extension("db.corrupt");
    if let Err(err) = fs::rename(path, &aside) {
        debug!("could not move {} aside: {err}", path.display());
        let _ = fs::remove_file(path);
    }
    for suffix in ["-wal", "-shm"] {
        let mut side = path.as_os_str().to_owned();
        side.push(suffix);
        let _ = fs::remove_file(PathBuf::from(side));
    }
}

pub fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}
