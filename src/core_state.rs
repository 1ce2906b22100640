//! Application state shared by every request handler.
//!
//! `CoreState` is built once at startup, wrapped in `Arc`, and handed to the
//! axum router. It owns no connection: handlers open one per request with
//! [`CoreState::open_db`] so concurrent requests never share a `Connection`.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::config::{self, AppConfig};
use crate::db;
use crate::db::sqlite::encode_ts;
use crate::gateway::{GatewayClient, GatewayError, HttpGatewayClient, MerchantCredentials, SandboxGateway};
use crate::models::enums::Role;
use crate::notification::{Notifier, StoredNotifier};

/// Maximum audit buffer size before flush.
const AUDIT_BUFFER_CAPACITY: usize = 100;

// ═══════════════════════════════════════════════════════════
// CoreState
// ═══════════════════════════════════════════════════════════

pub struct CoreState {
    config: AppConfig,
    gateway: Arc<dyn GatewayClient>,
    notifier: Arc<dyn Notifier>,
    /// Audit log for all API access events.
    audit: AuditLogger,
}

impl CoreState {
    /// Build state from configuration: create the data directory, apply
    /// migrations, and pick the gateway implementation.
    ///
    /// Must not be called from inside an async context: the HTTP gateway
    /// holds a blocking client.
    pub fn new(config: AppConfig) -> Result<Self, CoreError> {
        prepare_database(&config.db_path)?;

        let gateway: Arc<dyn GatewayClient> = match config.gateway_url.as_deref() {
            Some(url) => {
                tracing::info!(url, "Using HTTP payment gateway");
                Arc::new(HttpGatewayClient::new(
                    url,
                    MerchantCredentials {
                        merchant_id: config.gateway_merchant_id.clone(),
                        store_id: config.gateway_store_id.clone(),
                    },
                    config.gateway_timeout_secs,
                )?)
            }
            None => {
                tracing::warn!("No gateway URL configured, payments run against the sandbox");
                Arc::new(SandboxGateway::new())
            }
        };
        let notifier = Arc::new(StoredNotifier::new(config.db_path.clone()));

        Ok(Self::with_collaborators(config, gateway, notifier))
    }

    /// Build state around explicit collaborators. The database must already
    /// be reachable at `config.db_path`.
    pub fn with_collaborators(
        config: AppConfig,
        gateway: Arc<dyn GatewayClient>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            config,
            gateway,
            notifier,
            audit: AuditLogger::new(),
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn gateway(&self) -> &dyn GatewayClient {
        self.gateway.as_ref()
    }

    pub fn notifier(&self) -> &dyn Notifier {
        self.notifier.as_ref()
    }

    /// Open a fresh connection to the service database.
    pub fn open_db(&self) -> Result<rusqlite::Connection, CoreError> {
        db::open_database(&self.config.db_path).map_err(CoreError::Database)
    }

    // ── Audit logging ───────────────────────────────────────

    /// Log an access event. Auto-flushes to DB when buffer is full.
    pub fn log_access(&self, source: AccessSource, action: &str, entity: &str) {
        let needs_flush = self.audit.log(source, action, entity);
        if needs_flush {
            if let Err(e) = self.flush_and_prune_audit() {
                tracing::warn!("Auto-flush audit failed: {e}");
            }
        }
    }

    /// Get the current audit buffer contents.
    pub fn audit_entries(&self) -> Vec<AuditEntry> {
        self.audit.entries()
    }

    /// Flush audit buffer to DB and prune entries past retention.
    pub fn flush_and_prune_audit(&self) -> Result<(), CoreError> {
        let conn = self.open_db()?;
        self.audit.flush_to_db(&conn)?;
        if let Err(e) = db::repository::prune_audit_log(
            &conn,
            &chrono::Utc::now(),
            config::AUDIT_RETENTION_DAYS,
        ) {
            tracing::warn!("Failed to prune audit log: {e}");
        }
        Ok(())
    }
}

fn prepare_database(path: &Path) -> Result<(), CoreError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| CoreError::DataDir {
            path: parent.to_path_buf(),
            reason: e.to_string(),
        })?;
    }
    let conn = db::open_database(path)?;
    tracing::info!(
        path = %path.display(),
        tables = db::count_tables(&conn)?,
        "Database ready"
    );
    Ok(())
}

// ═══════════════════════════════════════════════════════════
// Error types
// ═══════════════════════════════════════════════════════════

/// Errors from CoreState operations.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Database error: {0}")]
    Database(#[from] db::DatabaseError),
    #[error("Cannot create data directory {path}: {reason}")]
    DataDir { path: PathBuf, reason: String },
    #[error("Gateway setup failed: {0}")]
    Gateway(#[from] GatewayError),
}

// ═══════════════════════════════════════════════════════════
// Access source tracking
// ═══════════════════════════════════════════════════════════

/// Identifies the source of a data access for audit logging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessSource {
    /// A request carrying actor headers.
    Api { actor_id: String, role: Role },
    /// Gateway webhook call.
    Webhook,
    /// A request without a resolvable actor.
    Anonymous,
}

impl std::fmt::Display for AccessSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Api { actor_id, role } => write!(f, "api:{role}:{actor_id}"),
            Self::Webhook => write!(f, "webhook"),
            Self::Anonymous => write!(f, "anonymous"),
        }
    }
}

// ═══════════════════════════════════════════════════════════
// Audit logger
// ═══════════════════════════════════════════════════════════

/// In-memory audit log buffer. Entries are flushed to SQLite
/// when the buffer reaches capacity or on explicit flush.
pub struct AuditLogger {
    buffer: Mutex<Vec<AuditEntry>>,
}

/// A single audit log entry.
#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub source: AccessSource,
    pub action: String,
    pub entity: String,
}

impl AuditLogger {
    pub fn new() -> Self {
        Self {
            buffer: Mutex::new(Vec::with_capacity(AUDIT_BUFFER_CAPACITY)),
        }
    }

    /// Log an access event to the in-memory buffer.
    /// Returns `true` if the buffer has reached flush threshold.
    pub fn log(&self, source: AccessSource, action: &str, entity: &str) -> bool {
        if let Ok(mut buf) = self.buffer.lock() {
            buf.push(AuditEntry {
                timestamp: chrono::Utc::now(),
                source,
                action: action.to_string(),
                entity: entity.to_string(),
            });
            buf.len() >= AUDIT_BUFFER_CAPACITY
        } else {
            false
        }
    }

    pub fn entries(&self) -> Vec<AuditEntry> {
        self.buffer
            .lock()
            .map(|buf| buf.clone())
            .unwrap_or_default()
    }

    pub fn drain(&self) -> Vec<AuditEntry> {
        self.buffer
            .lock()
            .map(|mut buf| buf.drain(..).collect())
            .unwrap_or_default()
    }

    pub fn buffer_len(&self) -> usize {
        self.buffer.lock().map(|buf| buf.len()).unwrap_or(0)
    }

    /// Write buffered entries to SQLite.
    pub fn flush_to_db(&self, conn: &rusqlite::Connection) -> Result<usize, CoreError> {
        let entries = self.drain();
        if entries.is_empty() {
            return Ok(0);
        }

        let rows: Vec<db::repository::AuditRow> = entries
            .iter()
            .map(|e| {
                (
                    encode_ts(&e.timestamp),
                    e.source.to_string(),
                    e.action.clone(),
                    e.entity.clone(),
                )
            })
            .collect();

        let count = rows.len();
        db::repository::insert_audit_entries(conn, &rows)?;

        tracing::debug!(count, "Flushed audit entries to database");
        Ok(count)
    }
}

impl Default for AuditLogger {
    fn default() -> Self {
        Self::new()
    }
}

// ═══════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notification::LogNotifier;

    fn test_state(dir: &Path) -> CoreState {
        let config = AppConfig::for_db(dir.join("nested").join("state.db"));
        CoreState::new(config).unwrap()
    }

    #[test]
    fn new_creates_data_dir_and_schema() {
        let tmp = tempfile::tempdir().unwrap();
        let state = test_state(tmp.path());
        assert!(tmp.path().join("nested").is_dir());
        let conn = state.open_db().unwrap();
        assert!(db::count_tables(&conn).unwrap() > 5);
    }

    #[test]
    fn access_source_display() {
        let api = AccessSource::Api {
            actor_id: "u-7".into(),
            role: Role::Receptionist,
        };
        assert_eq!(api.to_string(), "api:receptionist:u-7");
        assert_eq!(AccessSource::Webhook.to_string(), "webhook");
    }

    #[test]
    fn audit_buffer_reports_capacity() {
        let logger = AuditLogger::new();
        for i in 0..AUDIT_BUFFER_CAPACITY - 1 {
            assert!(!logger.log(AccessSource::Anonymous, "GET /x", &format!("status:{i}")));
        }
        assert!(logger.log(AccessSource::Anonymous, "GET /x", "status:200"));
        assert_eq!(logger.buffer_len(), AUDIT_BUFFER_CAPACITY);
        assert_eq!(logger.drain().len(), AUDIT_BUFFER_CAPACITY);
        assert_eq!(logger.buffer_len(), 0);
    }

    #[test]
    fn flush_writes_rows_and_empties_buffer() {
        let tmp = tempfile::tempdir().unwrap();
        let state = test_state(tmp.path());
        state.log_access(AccessSource::Webhook, "POST /api/payments/verify", "status:200");
        assert_eq!(state.audit_entries().len(), 1);

        state.flush_and_prune_audit().unwrap();
        assert!(state.audit_entries().is_empty());

        let conn = state.open_db().unwrap();
        let rows = db::repository::query_audit_by_entity(&conn, "status:200", 10).unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn collaborators_are_injectable() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("c.db");
        db::open_database(&path).unwrap();
        let gateway = Arc::new(SandboxGateway::new());
        let state = CoreState::with_collaborators(
            AppConfig::for_db(path),
            gateway.clone(),
            Arc::new(LogNotifier),
        );
        state.gateway().initiate(100, "TXN1", "x").unwrap();
        assert_eq!(gateway.initiate_calls(), 1);
    }
}
