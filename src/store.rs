//! SQLite-backed persistence for requests, responses, provider status,
//! metrics, cached responses, API keys, and token costs.
//!
//! The store is the single writer domain: one connection behind a mutex,
//! WAL journalling with `synchronous=NORMAL` so external readers stay
//! unblocked. Every public operation is one transaction.

use crate::cache::CacheEntry;
use crate::error::Result;
use crate::types::{
    now, BackendKind, GatewayRequest, GatewayResponse, ProviderInfo, ProviderStatus, RequestStatus,
};
use rusqlite::{params, Connection, OptionalExtension, Row};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

/// Aggregated request metrics for one provider over a time window.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ProviderMetrics {
    pub provider: String,
    pub total_requests: i64,
    pub successful_requests: i64,
    pub success_rate: f64,
    pub avg_latency_ms: f64,
    pub max_latency_ms: f64,
    pub min_latency_ms: f64,
}

/// A stored API key. The raw key is only returned at creation time; the
/// table holds its SHA-256 hash.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ApiKey {
    pub key_id: String,
    #[serde(skip)]
    pub key_hash: String,
    pub name: String,
    pub created_at: f64,
    pub last_used_at: Option<f64>,
    pub rate_limit_rpm: Option<i64>,
    pub enabled: bool,
}

/// One row of the per-provider token cost summary.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CostSummary {
    pub provider: String,
    pub requests: i64,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cost_usd: f64,
}

/// Hash a raw API key for storage and lookup.
pub fn hash_api_key(raw: &str) -> String {
    let digest = Sha256::digest(raw.as_bytes());
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (or create) the database at `path` and run the schema.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "busy_timeout", 30_000)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS requests (
                id TEXT PRIMARY KEY,
                provider TEXT NOT NULL,
                message TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'queued',
                priority INTEGER NOT NULL DEFAULT 50,
                timeout_s REAL NOT NULL DEFAULT 300.0,
                created_at REAL NOT NULL,
                updated_at REAL NOT NULL,
                backend_type TEXT,
                started_at REAL,
                completed_at REAL,
                metadata TEXT
            );

            CREATE TABLE IF NOT EXISTS responses (
                request_id TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                response TEXT,
                error TEXT,
                provider TEXT,
                latency_ms REAL,
                tokens_used INTEGER,
                created_at REAL NOT NULL,
                metadata TEXT,
                thinking TEXT,
                raw_output TEXT,
                FOREIGN KEY (request_id) REFERENCES requests(id)
            );

            CREATE TABLE IF NOT EXISTS provider_status (
                name TEXT PRIMARY KEY,
                backend_type TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'unknown',
                queue_depth INTEGER DEFAULT 0,
                avg_latency_ms REAL DEFAULT 0.0,
                success_rate REAL DEFAULT 1.0,
                last_check REAL,
                error TEXT,
                enabled INTEGER DEFAULT 1,
                priority INTEGER DEFAULT 50,
                rate_limit_rpm INTEGER,
                timeout_s REAL DEFAULT 300.0,
                updated_at REAL NOT NULL
            );

            CREATE TABLE IF NOT EXISTS metrics (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                provider TEXT NOT NULL,
                request_id TEXT,
                event_type TEXT NOT NULL,
                latency_ms REAL,
                success INTEGER,
                error TEXT,
                timestamp REAL NOT NULL
            );

            CREATE TABLE IF NOT EXISTS response_cache (
                cache_key TEXT PRIMARY KEY,
                provider TEXT NOT NULL,
                message_hash TEXT NOT NULL,
                response TEXT NOT NULL,
                tokens_used INTEGER,
                created_at REAL NOT NULL,
                expires_at REAL NOT NULL,
                hit_count INTEGER DEFAULT 0,
                last_hit_at REAL
            );

            CREATE TABLE IF NOT EXISTS api_keys (
                key_id TEXT PRIMARY KEY,
                key_hash TEXT NOT NULL UNIQUE,
                name TEXT NOT NULL,
                created_at REAL NOT NULL,
                last_used_at REAL,
                rate_limit_rpm INTEGER,
                enabled INTEGER DEFAULT 1
            );

            CREATE TABLE IF NOT EXISTS token_costs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                provider TEXT NOT NULL,
                request_id TEXT,
                input_tokens INTEGER,
                output_tokens INTEGER,
                cost_usd REAL,
                model TEXT,
                timestamp REAL NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_requests_status ON requests(status);
            CREATE INDEX IF NOT EXISTS idx_requests_provider ON requests(provider);
            CREATE INDEX IF NOT EXISTS idx_requests_priority
                ON requests(priority DESC, created_at ASC);
            CREATE INDEX IF NOT EXISTS idx_metrics_provider ON metrics(provider);
            CREATE INDEX IF NOT EXISTS idx_metrics_timestamp ON metrics(timestamp);
            CREATE INDEX IF NOT EXISTS idx_cache_provider ON response_cache(provider);
            CREATE INDEX IF NOT EXISTS idx_cache_expires ON response_cache(expires_at);
            CREATE INDEX IF NOT EXISTS idx_api_keys_hash ON api_keys(key_hash);
            CREATE INDEX IF NOT EXISTS idx_token_costs_timestamp ON token_costs(timestamp);
            "#,
        )?;
        Ok(())
    }

    // ---- requests ----

    pub fn create_request(&self, request: &GatewayRequest) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO requests (
                id, provider, message, status, priority, timeout_s,
                created_at, updated_at, backend_type, started_at,
                completed_at, metadata
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                request.id,
                request.provider,
                request.message,
                request.status.as_str(),
                request.priority,
                request.timeout_s,
                request.created_at,
                request.updated_at,
                request.backend_kind.map(|k| k.as_str()),
                request.started_at,
                request.completed_at,
                metadata_to_json(&request.metadata)?,
            ],
        )?;
        Ok(())
    }

    pub fn get_request(&self, request_id: &str) -> Result<Option<GatewayRequest>> {
        let conn = self.conn.lock().unwrap();
        let request = conn
            .query_row(
                "SELECT id, provider, message, status, priority, timeout_s,
                        created_at, updated_at, backend_type, started_at,
                        completed_at, metadata
                 FROM requests WHERE id = ?1",
                params![request_id],
                row_to_request,
            )
            .optional()?;
        Ok(request)
    }

    /// Update a request's status, stamping `started_at` on the transition to
    /// processing and `completed_at` on any terminal transition.
    pub fn update_status(
        &self,
        request_id: &str,
        status: RequestStatus,
        backend_kind: Option<BackendKind>,
    ) -> Result<bool> {
        let ts = now();
        let conn = self.conn.lock().unwrap();

        let mut sets = vec!["status = ?1", "updated_at = ?2"];
        if backend_kind.is_some() {
            sets.push("backend_type = ?4");
        }
        if status == RequestStatus::Processing {
            sets.push("started_at = ?2");
        } else if status.is_terminal() {
            sets.push("completed_at = ?2");
        }
        let sql = format!("UPDATE requests SET {} WHERE id = ?3", sets.join(", "));

        let changed = match backend_kind {
            Some(kind) => conn.execute(
                &sql,
                params![status.as_str(), ts, request_id, kind.as_str()],
            )?,
            None => conn.execute(&sql, params![status.as_str(), ts, request_id])?,
        };
        Ok(changed > 0)
    }

    /// List requests with optional status/provider filters. `order_by` is
    /// whitelisted to `created_at`, `updated_at`, `priority`.
    pub fn list_requests(
        &self,
        status: Option<RequestStatus>,
        provider: Option<&str>,
        limit: i64,
        offset: i64,
        order_by: &str,
        descending: bool,
    ) -> Result<Vec<GatewayRequest>> {
        let order_by = match order_by {
            "updated_at" | "priority" => order_by,
            _ => "created_at",
        };
        let direction = if descending { "DESC" } else { "ASC" };

        let mut sql = String::from(
            "SELECT id, provider, message, status, priority, timeout_s,
                    created_at, updated_at, backend_type, started_at,
                    completed_at, metadata
             FROM requests WHERE 1=1",
        );
        let mut args: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();
        if let Some(status) = status {
            sql.push_str(&format!(" AND status = ?{}", args.len() + 1));
            args.push(Box::new(status.as_str().to_string()));
        }
        if let Some(provider) = provider {
            sql.push_str(&format!(" AND provider = ?{}", args.len() + 1));
            args.push(Box::new(provider.to_string()));
        }
        sql.push_str(&format!(
            " ORDER BY {} {} LIMIT ?{} OFFSET ?{}",
            order_by,
            direction,
            args.len() + 1,
            args.len() + 2
        ));
        args.push(Box::new(limit));
        args.push(Box::new(offset));

        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&sql)?;
        let params_refs: Vec<&dyn rusqlite::types::ToSql> =
            args.iter().map(|a| a.as_ref()).collect();
        let rows = stmt.query_map(params_refs.as_slice(), row_to_request)?;
        let mut requests = Vec::new();
        for row in rows {
            requests.push(row?);
        }
        Ok(requests)
    }

    /// Queued requests in priority order, for startup replay.
    pub fn get_pending(&self, limit: i64) -> Result<Vec<GatewayRequest>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, provider, message, status, priority, timeout_s,
                    created_at, updated_at, backend_type, started_at,
                    completed_at, metadata
             FROM requests WHERE status = 'queued'
             ORDER BY priority DESC, created_at ASC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit], row_to_request)?;
        let mut requests = Vec::new();
        for row in rows {
            requests.push(row?);
        }
        Ok(requests)
    }

    /// Cancel a request; only queued and processing requests may be
    /// cancelled. Returns `false` when the guard rejected the transition.
    pub fn cancel_request(&self, request_id: &str) -> Result<bool> {
        let ts = now();
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE requests
             SET status = 'cancelled', updated_at = ?1, completed_at = ?1
             WHERE id = ?2 AND status IN ('queued', 'processing')",
            params![ts, request_id],
        )?;
        Ok(changed > 0)
    }

    /// Delete requests older than `max_age_hours`, cascading their responses.
    pub fn cleanup_old_requests(&self, max_age_hours: i64) -> Result<usize> {
        let cutoff = now() - (max_age_hours as f64) * 3600.0;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM responses WHERE request_id IN
             (SELECT id FROM requests WHERE created_at < ?1)",
            params![cutoff],
        )?;
        let removed = conn.execute(
            "DELETE FROM requests WHERE created_at < ?1",
            params![cutoff],
        )?;
        Ok(removed)
    }

    // ---- responses ----

    pub fn save_response(&self, response: &GatewayResponse) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO responses (
                request_id, status, response, error, provider,
                latency_ms, tokens_used, created_at, metadata,
                thinking, raw_output
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                response.request_id,
                response.status.as_str(),
                response.response,
                response.error,
                response.provider,
                response.latency_ms,
                response.tokens_used,
                now(),
                metadata_to_json(&response.metadata)?,
                response.thinking,
                response.raw_output,
            ],
        )?;
        Ok(())
    }

    pub fn get_response(&self, request_id: &str) -> Result<Option<GatewayResponse>> {
        let conn = self.conn.lock().unwrap();
        let response = conn
            .query_row(
                "SELECT request_id, status, response, error, provider,
                        latency_ms, tokens_used, metadata, thinking, raw_output
                 FROM responses WHERE request_id = ?1",
                params![request_id],
                row_to_response,
            )
            .optional()?;
        Ok(response)
    }

    // ---- provider status ----

    pub fn update_provider_status(&self, info: &ProviderInfo) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO provider_status (
                name, backend_type, status, queue_depth, avg_latency_ms,
                success_rate, last_check, error, enabled, priority,
                rate_limit_rpm, timeout_s, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                info.name,
                info.backend_kind.as_str(),
                info.status.as_str(),
                info.queue_depth,
                info.avg_latency_ms,
                info.success_rate,
                info.last_check,
                info.error,
                info.enabled as i64,
                info.priority,
                info.rate_limit_rpm,
                info.timeout_s,
                now(),
            ],
        )?;
        Ok(())
    }

    pub fn get_provider_status(&self, name: &str) -> Result<Option<ProviderInfo>> {
        let conn = self.conn.lock().unwrap();
        let info = conn
            .query_row(
                "SELECT name, backend_type, status, queue_depth, avg_latency_ms,
                        success_rate, last_check, error, enabled, priority,
                        rate_limit_rpm, timeout_s
                 FROM provider_status WHERE name = ?1",
                params![name],
                row_to_provider_info,
            )
            .optional()?;
        Ok(info)
    }

    pub fn list_provider_statuses(&self) -> Result<Vec<ProviderInfo>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT name, backend_type, status, queue_depth, avg_latency_ms,
                    success_rate, last_check, error, enabled, priority,
                    rate_limit_rpm, timeout_s
             FROM provider_status ORDER BY priority DESC, name",
        )?;
        let rows = stmt.query_map([], row_to_provider_info)?;
        let mut infos = Vec::new();
        for row in rows {
            infos.push(row?);
        }
        Ok(infos)
    }

    // ---- metrics ----

    pub fn record_metric(
        &self,
        provider: &str,
        event_type: &str,
        request_id: Option<&str>,
        latency_ms: Option<f64>,
        success: bool,
        error: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO metrics (
                provider, request_id, event_type, latency_ms, success, error, timestamp
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                provider,
                request_id,
                event_type,
                latency_ms,
                success as i64,
                error,
                now(),
            ],
        )?;
        Ok(())
    }

    pub fn get_provider_metrics(&self, provider: &str, hours: i64) -> Result<ProviderMetrics> {
        let cutoff = now() - (hours as f64) * 3600.0;
        let conn = self.conn.lock().unwrap();
        let (total, successes, avg, max, min) = conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(success), 0),
                    COALESCE(AVG(latency_ms), 0.0),
                    COALESCE(MAX(latency_ms), 0.0),
                    COALESCE(MIN(latency_ms), 0.0)
             FROM metrics WHERE provider = ?1 AND timestamp > ?2",
            params![provider, cutoff],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, f64>(2)?,
                    row.get::<_, f64>(3)?,
                    row.get::<_, f64>(4)?,
                ))
            },
        )?;
        Ok(ProviderMetrics {
            provider: provider.to_string(),
            total_requests: total,
            successful_requests: successes,
            success_rate: if total > 0 {
                successes as f64 / total as f64
            } else {
                1.0
            },
            avg_latency_ms: avg,
            max_latency_ms: max,
            min_latency_ms: min,
        })
    }

    pub fn cleanup_old_metrics(&self, max_age_hours: i64) -> Result<usize> {
        let cutoff = now() - (max_age_hours as f64) * 3600.0;
        let conn = self.conn.lock().unwrap();
        let removed = conn.execute("DELETE FROM metrics WHERE timestamp < ?1", params![cutoff])?;
        Ok(removed)
    }

    // ---- response cache rows ----

    pub fn cache_get(&self, cache_key: &str) -> Result<Option<CacheEntry>> {
        let conn = self.conn.lock().unwrap();
        let entry = conn
            .query_row(
                "SELECT cache_key, provider, message_hash, response, tokens_used,
                        created_at, expires_at, hit_count, last_hit_at
                 FROM response_cache WHERE cache_key = ?1",
                params![cache_key],
                row_to_cache_entry,
            )
            .optional()?;
        Ok(entry)
    }

    pub fn cache_put(&self, entry: &CacheEntry) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO response_cache (
                cache_key, provider, message_hash, response, tokens_used,
                created_at, expires_at, hit_count, last_hit_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                entry.cache_key,
                entry.provider,
                entry.message_hash,
                entry.response,
                entry.tokens_used,
                entry.created_at,
                entry.expires_at,
                entry.hit_count,
                entry.last_hit_at,
            ],
        )?;
        Ok(())
    }

    pub fn cache_record_hit(&self, cache_key: &str, at: f64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE response_cache
             SET hit_count = hit_count + 1, last_hit_at = ?1
             WHERE cache_key = ?2",
            params![at, cache_key],
        )?;
        Ok(())
    }

    pub fn cache_delete(&self, cache_key: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let removed = conn.execute(
            "DELETE FROM response_cache WHERE cache_key = ?1",
            params![cache_key],
        )?;
        Ok(removed > 0)
    }

    pub fn cache_clear(&self, provider: Option<&str>) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let removed = match provider {
            Some(p) => conn.execute("DELETE FROM response_cache WHERE provider = ?1", params![p])?,
            None => conn.execute("DELETE FROM response_cache", [])?,
        };
        Ok(removed)
    }

    pub fn cache_cleanup_expired(&self) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let removed = conn.execute(
            "DELETE FROM response_cache WHERE expires_at < ?1",
            params![now()],
        )?;
        Ok(removed)
    }

    /// Evict the oldest entries (by `created_at`) down to `max_entries`.
    pub fn cache_enforce_max_entries(&self, max_entries: i64) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM response_cache", [], |row| row.get(0))?;
        if count <= max_entries {
            return Ok(0);
        }
        let excess = count - max_entries;
        let removed = conn.execute(
            "DELETE FROM response_cache WHERE cache_key IN (
                SELECT cache_key FROM response_cache ORDER BY created_at ASC LIMIT ?1
            )",
            params![excess],
        )?;
        Ok(removed)
    }

    /// (entry count, total bytes, oldest created, newest created, average
    /// remaining TTL of unexpired entries).
    pub fn cache_stats(&self) -> Result<(i64, i64, Option<f64>, Option<f64>, Option<f64>)> {
        let conn = self.conn.lock().unwrap();
        let (count, bytes, oldest, newest) = conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(LENGTH(response)), 0),
                    MIN(created_at), MAX(created_at)
             FROM response_cache",
            [],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, Option<f64>>(2)?,
                    row.get::<_, Option<f64>>(3)?,
                ))
            },
        )?;
        let avg_remaining: Option<f64> = conn.query_row(
            "SELECT AVG(expires_at - ?1) FROM response_cache WHERE expires_at > ?1",
            params![now()],
            |row| row.get(0),
        )?;
        Ok((count, bytes, oldest, newest, avg_remaining))
    }

    // ---- api keys ----

    /// Create a new API key. Returns the stored record plus the raw key,
    /// which is never persisted and cannot be recovered later.
    pub fn create_api_key(
        &self,
        name: &str,
        rate_limit_rpm: Option<i64>,
    ) -> Result<(ApiKey, String)> {
        let raw = format!(
            "{}{}",
            uuid::Uuid::new_v4().simple(),
            uuid::Uuid::new_v4().simple()
        );
        let key = ApiKey {
            key_id: uuid::Uuid::new_v4().simple().to_string()[..16].to_string(),
            key_hash: hash_api_key(&raw),
            name: name.to_string(),
            created_at: now(),
            last_used_at: None,
            rate_limit_rpm,
            enabled: true,
        };
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO api_keys (
                key_id, key_hash, name, created_at, last_used_at,
                rate_limit_rpm, enabled
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1)",
            params![
                key.key_id,
                key.key_hash,
                key.name,
                key.created_at,
                key.last_used_at,
                key.rate_limit_rpm,
            ],
        )?;
        Ok((key, raw))
    }

    /// Verify a raw key against the stored hashes; bumps `last_used_at`.
    pub fn verify_api_key(&self, raw: &str) -> Result<Option<ApiKey>> {
        let hash = hash_api_key(raw);
        let conn = self.conn.lock().unwrap();
        let key = conn
            .query_row(
                "SELECT key_id, key_hash, name, created_at, last_used_at,
                        rate_limit_rpm, enabled
                 FROM api_keys WHERE key_hash = ?1 AND enabled = 1",
                params![hash],
                row_to_api_key,
            )
            .optional()?;
        if let Some(ref key) = key {
            conn.execute(
                "UPDATE api_keys SET last_used_at = ?1 WHERE key_id = ?2",
                params![now(), key.key_id],
            )?;
        }
        Ok(key)
    }

    pub fn revoke_api_key(&self, key_id: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE api_keys SET enabled = 0 WHERE key_id = ?1",
            params![key_id],
        )?;
        Ok(changed > 0)
    }

    // ---- token costs ----

    pub fn record_token_cost(
        &self,
        provider: &str,
        request_id: Option<&str>,
        input_tokens: i64,
        output_tokens: i64,
        cost_usd: Option<f64>,
        model: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO token_costs (
                provider, request_id, input_tokens, output_tokens,
                cost_usd, model, timestamp
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                provider,
                request_id,
                input_tokens,
                output_tokens,
                cost_usd,
                model,
                now(),
            ],
        )?;
        Ok(())
    }

    pub fn get_cost_summary(&self, hours: i64) -> Result<Vec<CostSummary>> {
        let cutoff = now() - (hours as f64) * 3600.0;
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT provider, COUNT(*),
                    COALESCE(SUM(input_tokens), 0),
                    COALESCE(SUM(output_tokens), 0),
                    COALESCE(SUM(cost_usd), 0.0)
             FROM token_costs WHERE timestamp > ?1
             GROUP BY provider ORDER BY provider",
        )?;
        let rows = stmt.query_map(params![cutoff], |row| {
            Ok(CostSummary {
                provider: row.get(0)?,
                requests: row.get(1)?,
                input_tokens: row.get(2)?,
                output_tokens: row.get(3)?,
                cost_usd: row.get(4)?,
            })
        })?;
        let mut summaries = Vec::new();
        for row in rows {
            summaries.push(row?);
        }
        Ok(summaries)
    }
}

fn metadata_to_json(
    metadata: &Option<HashMap<String, serde_json::Value>>,
) -> Result<Option<String>> {
    match metadata {
        Some(m) => Ok(Some(serde_json::to_string(m)?)),
        None => Ok(None),
    }
}

fn json_to_metadata(text: Option<String>) -> Option<HashMap<String, serde_json::Value>> {
    text.and_then(|t| serde_json::from_str(&t).ok())
}

fn row_to_request(row: &Row<'_>) -> rusqlite::Result<GatewayRequest> {
    let status: String = row.get(3)?;
    let backend: Option<String> = row.get(8)?;
    Ok(GatewayRequest {
        id: row.get(0)?,
        provider: row.get(1)?,
        message: row.get(2)?,
        status: RequestStatus::parse(&status).unwrap_or(RequestStatus::Queued),
        priority: row.get(4)?,
        timeout_s: row.get(5)?,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
        backend_kind: backend.as_deref().and_then(BackendKind::parse),
        started_at: row.get(9)?,
        completed_at: row.get(10)?,
        metadata: json_to_metadata(row.get(11)?),
    })
}

fn row_to_response(row: &Row<'_>) -> rusqlite::Result<GatewayResponse> {
    let status: String = row.get(1)?;
    Ok(GatewayResponse {
        request_id: row.get(0)?,
        status: RequestStatus::parse(&status).unwrap_or(RequestStatus::Failed),
        response: row.get(2)?,
        error: row.get(3)?,
        provider: row.get(4)?,
        latency_ms: row.get(5)?,
        tokens_used: row.get(6)?,
        metadata: json_to_metadata(row.get(7)?),
        thinking: row.get(8)?,
        raw_output: row.get(9)?,
    })
}

fn row_to_provider_info(row: &Row<'_>) -> rusqlite::Result<ProviderInfo> {
    let backend: String = row.get(1)?;
    let status: String = row.get(2)?;
    Ok(ProviderInfo {
        name: row.get(0)?,
        backend_kind: BackendKind::parse(&backend).unwrap_or(BackendKind::CliExec),
        status: ProviderStatus::parse(&status).unwrap_or(ProviderStatus::Unknown),
        queue_depth: row.get(3)?,
        avg_latency_ms: row.get(4)?,
        success_rate: row.get(5)?,
        last_check: row.get(6)?,
        error: row.get(7)?,
        enabled: row.get::<_, i64>(8)? != 0,
        priority: row.get(9)?,
        rate_limit_rpm: row.get(10)?,
        timeout_s: row.get(11)?,
    })
}

fn row_to_cache_entry(row: &Row<'_>) -> rusqlite::Result<CacheEntry> {
    Ok(CacheEntry {
        cache_key: row.get(0)?,
        provider: row.get(1)?,
        message_hash: row.get(2)?,
        response: row.get(3)?,
        tokens_used: row.get(4)?,
        created_at: row.get(5)?,
        expires_at: row.get(6)?,
        hit_count: row.get(7)?,
        last_hit_at: row.get(8)?,
    })
}

fn row_to_api_key(row: &Row<'_>) -> rusqlite::Result<ApiKey> {
    Ok(ApiKey {
        key_id: row.get(0)?,
        key_hash: row.get(1)?,
        name: row.get(2)?,
        created_at: row.get(3)?,
        last_used_at: row.get(4)?,
        rate_limit_rpm: row.get(5)?,
        enabled: row.get::<_, i64>(6)? != 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_store(dir: &tempfile::TempDir) -> Store {
        Store::open(&dir.path().join("gateway.db")).unwrap()
    }

    #[test]
    fn test_request_round_trip() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);

        let mut request = GatewayRequest::new("alpha", "hello world").with_priority(80);
        request.metadata = Some(
            [("caller".to_string(), serde_json::json!("test"))]
                .into_iter()
                .collect(),
        );
        store.create_request(&request).unwrap();

        let loaded = store.get_request(&request.id).unwrap().unwrap();
        assert_eq!(loaded.provider, "alpha");
        assert_eq!(loaded.message, "hello world");
        assert_eq!(loaded.priority, 80);
        assert_eq!(loaded.status, RequestStatus::Queued);
        assert_eq!(
            loaded.metadata.unwrap()["caller"],
            serde_json::json!("test")
        );
    }

    #[test]
    fn test_missing_request() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        assert!(store.get_request("nope").unwrap().is_none());
    }

    #[test]
    fn test_status_transitions_stamp_timestamps() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);

        let request = GatewayRequest::new("alpha", "hi");
        store.create_request(&request).unwrap();

        store
            .update_status(&request.id, RequestStatus::Processing, Some(BackendKind::HttpApi))
            .unwrap();
        let processing = store.get_request(&request.id).unwrap().unwrap();
        assert_eq!(processing.status, RequestStatus::Processing);
        assert!(processing.started_at.is_some());
        assert!(processing.completed_at.is_none());
        assert_eq!(processing.backend_kind, Some(BackendKind::HttpApi));

        store
            .update_status(&request.id, RequestStatus::Completed, None)
            .unwrap();
        let done = store.get_request(&request.id).unwrap().unwrap();
        assert_eq!(done.status, RequestStatus::Completed);
        let started = done.started_at.unwrap();
        let completed = done.completed_at.unwrap();
        assert!(started <= completed);
    }

    #[test]
    fn test_cancel_guard() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);

        let request = GatewayRequest::new("alpha", "hi");
        store.create_request(&request).unwrap();

        assert!(store.cancel_request(&request.id).unwrap());
        let cancelled = store.get_request(&request.id).unwrap().unwrap();
        assert_eq!(cancelled.status, RequestStatus::Cancelled);
        assert!(cancelled.completed_at.is_some());

        // Terminal requests may not be cancelled again.
        assert!(!store.cancel_request(&request.id).unwrap());
    }

    #[test]
    fn test_pending_replay_order() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);

        let mut low = GatewayRequest::new("alpha", "low").with_priority(10);
        low.created_at = 100.0;
        let mut high = GatewayRequest::new("alpha", "high").with_priority(90);
        high.created_at = 200.0;
        let mut high_earlier = GatewayRequest::new("alpha", "high-earlier").with_priority(90);
        high_earlier.created_at = 150.0;

        store.create_request(&low).unwrap();
        store.create_request(&high).unwrap();
        store.create_request(&high_earlier).unwrap();

        let pending = store.get_pending(10).unwrap();
        assert_eq!(pending.len(), 3);
        assert_eq!(pending[0].message, "high-earlier");
        assert_eq!(pending[1].message, "high");
        assert_eq!(pending[2].message, "low");
    }

    #[test]
    fn test_list_requests_filters() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);

        store
            .create_request(&GatewayRequest::new("alpha", "a"))
            .unwrap();
        store
            .create_request(&GatewayRequest::new("beta", "b"))
            .unwrap();

        let alphas = store
            .list_requests(None, Some("alpha"), 50, 0, "created_at", true)
            .unwrap();
        assert_eq!(alphas.len(), 1);
        assert_eq!(alphas[0].provider, "alpha");

        let queued = store
            .list_requests(Some(RequestStatus::Queued), None, 50, 0, "created_at", true)
            .unwrap();
        assert_eq!(queued.len(), 2);
    }

    #[test]
    fn test_response_round_trip_and_durability() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("gateway.db");

        let request = GatewayRequest::new("alpha", "hi");
        {
            let store = Store::open(&db_path).unwrap();
            store.create_request(&request).unwrap();
            store
                .update_status(&request.id, RequestStatus::Completed, None)
                .unwrap();

            let mut response = GatewayResponse::new(&request.id, RequestStatus::Completed);
            response.response = Some("world".to_string());
            response.provider = Some("alpha".to_string());
            response.latency_ms = Some(52.0);
            response.tokens_used = Some(7);
            response.thinking = Some("hmm".to_string());
            store.save_response(&response).unwrap();
        }

        // Reopen: the terminal state and response survive the restart.
        let store = Store::open(&db_path).unwrap();
        let loaded = store.get_request(&request.id).unwrap().unwrap();
        assert_eq!(loaded.status, RequestStatus::Completed);
        let response = store.get_response(&request.id).unwrap().unwrap();
        assert_eq!(response.response.as_deref(), Some("world"));
        assert_eq!(response.provider.as_deref(), Some("alpha"));
        assert_eq!(response.tokens_used, Some(7));
        assert_eq!(response.thinking.as_deref(), Some("hmm"));
    }

    #[test]
    fn test_cleanup_cascades_responses() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);

        let mut old = GatewayRequest::new("alpha", "old");
        old.created_at = now() - 100.0 * 3600.0;
        store.create_request(&old).unwrap();
        store
            .save_response(&GatewayResponse::new(&old.id, RequestStatus::Completed))
            .unwrap();

        let fresh = GatewayRequest::new("alpha", "fresh");
        store.create_request(&fresh).unwrap();

        let removed = store.cleanup_old_requests(24).unwrap();
        assert_eq!(removed, 1);
        assert!(store.get_request(&old.id).unwrap().is_none());
        assert!(store.get_response(&old.id).unwrap().is_none());
        assert!(store.get_request(&fresh.id).unwrap().is_some());
    }

    #[test]
    fn test_provider_status_round_trip() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);

        let mut info = ProviderInfo::new("alpha", BackendKind::HttpApi);
        info.status = ProviderStatus::Healthy;
        info.avg_latency_ms = 120.5;
        info.success_rate = 0.98;
        store.update_provider_status(&info).unwrap();

        let loaded = store.get_provider_status("alpha").unwrap().unwrap();
        assert_eq!(loaded.status, ProviderStatus::Healthy);
        assert_eq!(loaded.avg_latency_ms, 120.5);

        let all = store.list_provider_statuses().unwrap();
        assert_eq!(all.len(), 1);
    }

    #[test]
    fn test_metrics_aggregation() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);

        store
            .record_metric("alpha", "completed", None, Some(100.0), true, None)
            .unwrap();
        store
            .record_metric("alpha", "completed", None, Some(300.0), true, None)
            .unwrap();
        store
            .record_metric("alpha", "failed", None, Some(50.0), false, Some("boom"))
            .unwrap();

        let metrics = store.get_provider_metrics("alpha", 24).unwrap();
        assert_eq!(metrics.total_requests, 3);
        assert_eq!(metrics.successful_requests, 2);
        assert!((metrics.success_rate - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(metrics.avg_latency_ms, 150.0);
        assert_eq!(metrics.max_latency_ms, 300.0);

        let empty = store.get_provider_metrics("beta", 24).unwrap();
        assert_eq!(empty.total_requests, 0);
        assert_eq!(empty.success_rate, 1.0);
    }

    #[test]
    fn test_api_key_verify_and_revoke() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);

        let (key, raw) = store.create_api_key("ci", Some(120)).unwrap();
        assert_eq!(key.rate_limit_rpm, Some(120));

        let verified = store.verify_api_key(&raw).unwrap().unwrap();
        assert_eq!(verified.key_id, key.key_id);
        assert!(store.verify_api_key("wrong-key").unwrap().is_none());

        assert!(store.revoke_api_key(&key.key_id).unwrap());
        assert!(store.verify_api_key(&raw).unwrap().is_none());
    }

    #[test]
    fn test_token_cost_summary() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);

        store
            .record_token_cost("alpha", None, 100, 200, Some(0.01), Some("alpha-large"))
            .unwrap();
        store
            .record_token_cost("alpha", None, 50, 60, None, None)
            .unwrap();

        let summary = store.get_cost_summary(24).unwrap();
        assert_eq!(summary.len(), 1);
        assert_eq!(summary[0].requests, 2);
        assert_eq!(summary[0].input_tokens, 150);
        assert_eq!(summary[0].output_tokens, 260);
    }
}
