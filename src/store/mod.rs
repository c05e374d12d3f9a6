//! Canonical store: the only shared mutable state (§5), guarded by a
//! single connection behind an async mutex so handlers never hold a
//! transaction across an outbound HTTP call.

pub mod accounts;
pub mod jobs;
pub mod orders;
pub mod portfolio;

use crate::error::AppError;
use rusqlite::Connection;
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    pub fn open(db_path: &str) -> Result<Self, AppError> {
        let conn = Connection::open(db_path).map_err(AppError::from)?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        conn.pragma_update(None, "foreign_keys", "ON").ok();
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Trivial reachability probe for the detailed health endpoint (§6).
    pub async fn ping(&self) -> Result<(), AppError> {
        let conn = self.conn.lock().await;
        conn.query_row("SELECT 1", [], |_| Ok(())).map_err(AppError::from)
    }

    /// Lazily mirrors an authenticated user into the local `users` stub so
    /// `accounts`/`orders` foreign keys resolve. Auth owns its own SQLite
    /// file (§6), so this store never sees a user row until one of its
    /// authenticated endpoints is actually hit.
    pub async fn ensure_user(&self, id: uuid::Uuid, username: &str) -> Result<(), AppError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR IGNORE INTO users (id, username) VALUES (?1, ?2)",
            rusqlite::params![id.to_string(), username],
        )
        .map_err(AppError::from)?;
        Ok(())
    }

    fn init_schema(conn: &Connection) -> Result<(), AppError> {
        conn.execute_batch(
            "
            -- Minimal fallback shape; when auth::UserStore runs its own
            -- migration against the same file first (main.rs does this),
            -- its richer users table wins and this is a no-op.
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                username TEXT UNIQUE NOT NULL
            );

            CREATE TABLE IF NOT EXISTS custodians (
                id TEXT PRIMARY KEY,
                name TEXT UNIQUE NOT NULL,
                read_balance INTEGER NOT NULL,
                read_holdings INTEGER NOT NULL,
                read_transactions INTEGER NOT NULL,
                trade INTEGER NOT NULL,
                healthy INTEGER NOT NULL DEFAULT 1
            );

            CREATE TABLE IF NOT EXISTS portfolios (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                name TEXT NOT NULL,
                is_primary INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS accounts (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                portfolio_id TEXT REFERENCES portfolios(id) ON DELETE SET NULL,
                custodian_id TEXT REFERENCES custodians(id),
                kind TEXT NOT NULL,
                external_id TEXT,
                access_token_handle TEXT,
                current_balance TEXT NOT NULL,
                available_balance TEXT NOT NULL,
                currency TEXT NOT NULL,
                is_manual INTEGER NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 1,
                last_synced_at TEXT,
                last_sync_status TEXT
            );

            CREATE TABLE IF NOT EXISTS holdings (
                account_id TEXT NOT NULL REFERENCES accounts(id) ON DELETE CASCADE,
                symbol TEXT NOT NULL,
                quantity TEXT NOT NULL,
                unit_price TEXT NOT NULL,
                cost_basis TEXT NOT NULL,
                last_updated TEXT NOT NULL,
                PRIMARY KEY (account_id, symbol)
            );

            CREATE TABLE IF NOT EXISTS transactions (
                id TEXT PRIMARY KEY,
                account_id TEXT NOT NULL REFERENCES accounts(id) ON DELETE CASCADE,
                user_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                amount TEXT NOT NULL,
                date TEXT NOT NULL,
                symbol TEXT,
                quantity TEXT,
                unit_price TEXT,
                fee TEXT,
                external_id TEXT,
                content_hash TEXT,
                pending INTEGER NOT NULL DEFAULT 0
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_tx_external_id
                ON transactions(account_id, external_id) WHERE external_id IS NOT NULL;
            CREATE UNIQUE INDEX IF NOT EXISTS idx_tx_content_hash
                ON transactions(account_id, content_hash) WHERE content_hash IS NOT NULL;

            CREATE TABLE IF NOT EXISTS orders (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                account_id TEXT NOT NULL REFERENCES accounts(id),
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                quantity TEXT NOT NULL,
                order_type TEXT NOT NULL,
                limit_price TEXT,
                stop_price TEXT,
                time_in_force TEXT NOT NULL,
                state TEXT NOT NULL,
                broker_id TEXT,
                client_idempotency_key TEXT UNIQUE NOT NULL,
                filled_quantity TEXT NOT NULL,
                avg_fill_price TEXT,
                submitted_at TEXT,
                last_updated_at TEXT NOT NULL,
                retry_count INTEGER NOT NULL DEFAULT 0,
                last_error TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_orders_account_symbol ON orders(account_id, symbol);
            CREATE INDEX IF NOT EXISTS idx_orders_user ON orders(user_id);

            CREATE TABLE IF NOT EXISTS strategies (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                name TEXT NOT NULL,
                drift_threshold_pct TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS strategy_holdings (
                strategy_id TEXT NOT NULL REFERENCES strategies(id) ON DELETE CASCADE,
                symbol TEXT NOT NULL,
                target_weight TEXT NOT NULL,
                PRIMARY KEY (strategy_id, symbol)
            );

            CREATE TABLE IF NOT EXISTS job_runs (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                state TEXT NOT NULL,
                started_at TEXT NOT NULL,
                ended_at TEXT,
                result TEXT,
                last_error TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_job_runs_started ON job_runs(started_at DESC);
            ",
        )
        .map_err(AppError::from)?;
        Ok(())
    }
}

pub(crate) fn dec_to_sql(d: rust_decimal::Decimal) -> String {
    d.to_string()
}

pub(crate) fn dec_from_sql(s: &str) -> Result<rust_decimal::Decimal, AppError> {
    s.parse()
        .map_err(|e| AppError::Database(format!("bad decimal '{s}': {e}")))
}

pub(crate) fn opt_dec_to_sql(d: Option<rust_decimal::Decimal>) -> Option<String> {
    d.map(dec_to_sql)
}

pub(crate) fn opt_dec_from_sql(s: Option<String>) -> Result<Option<rust_decimal::Decimal>, AppError> {
    s.map(|s| dec_from_sql(&s)).transpose()
}
