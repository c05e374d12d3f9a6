//! Account and custodian repository methods.

use super::{dec_from_sql, dec_to_sql, Store};
use crate::domain::{Account, AccountKind, Custodian, CustodianCapabilities, SyncStatus};
use crate::error::AppError;
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use uuid::Uuid;

fn account_kind_to_sql(kind: AccountKind) -> &'static str {
    match kind {
        AccountKind::Checking => "checking",
        AccountKind::Savings => "savings",
        AccountKind::Investment => "investment",
        AccountKind::Credit => "credit",
        AccountKind::Loan => "loan",
        AccountKind::Mortgage => "mortgage",
        AccountKind::Retirement => "retirement",
    }
}

fn account_kind_from_sql(s: &str) -> Result<AccountKind, AppError> {
    Ok(match s {
        "checking" => AccountKind::Checking,
        "savings" => AccountKind::Savings,
        "investment" => AccountKind::Investment,
        "credit" => AccountKind::Credit,
        "loan" => AccountKind::Loan,
        "mortgage" => AccountKind::Mortgage,
        "retirement" => AccountKind::Retirement,
        other => return Err(AppError::Database(format!("bad account kind '{other}'"))),
    })
}

fn sync_status_to_sql(s: SyncStatus) -> &'static str {
    match s {
        SyncStatus::Ok => "ok",
        SyncStatus::Partial => "partial",
        SyncStatus::Failed => "failed",
    }
}

fn sync_status_from_sql(s: &str) -> Result<SyncStatus, AppError> {
    Ok(match s {
        "ok" => SyncStatus::Ok,
        "partial" => SyncStatus::Partial,
        "failed" => SyncStatus::Failed,
        other => return Err(AppError::Database(format!("bad sync status '{other}'"))),
    })
}

fn row_to_account(row: &rusqlite::Row) -> rusqlite::Result<AccountRow> {
    Ok(AccountRow {
        id: row.get(0)?,
        user_id: row.get(1)?,
        portfolio_id: row.get(2)?,
        custodian_id: row.get(3)?,
        kind: row.get(4)?,
        external_id: row.get(5)?,
        access_token_handle: row.get(6)?,
        current_balance: row.get(7)?,
        available_balance: row.get(8)?,
        currency: row.get(9)?,
        is_manual: row.get(10)?,
        is_active: row.get(11)?,
        last_synced_at: row.get(12)?,
        last_sync_status: row.get(13)?,
    })
}

struct AccountRow {
    id: String,
    user_id: String,
    portfolio_id: Option<String>,
    custodian_id: Option<String>,
    kind: String,
    external_id: Option<String>,
    access_token_handle: Option<String>,
    current_balance: String,
    available_balance: String,
    currency: String,
    is_manual: bool,
    is_active: bool,
    last_synced_at: Option<String>,
    last_sync_status: Option<String>,
}

impl AccountRow {
    fn into_account(self) -> Result<Account, AppError> {
        Ok(Account {
            id: Uuid::parse_str(&self.id).map_err(|e| AppError::Database(e.to_string()))?,
            user_id: Uuid::parse_str(&self.user_id).map_err(|e| AppError::Database(e.to_string()))?,
            portfolio_id: self
                .portfolio_id
                .map(|s| Uuid::parse_str(&s))
                .transpose()
                .map_err(|e| AppError::Database(e.to_string()))?,
            custodian_id: self
                .custodian_id
                .map(|s| Uuid::parse_str(&s))
                .transpose()
                .map_err(|e| AppError::Database(e.to_string()))?,
            kind: account_kind_from_sql(&self.kind)?,
            external_id: self.external_id,
            access_token_handle: self.access_token_handle,
            current_balance: dec_from_sql(&self.current_balance)?,
            available_balance: dec_from_sql(&self.available_balance)?,
            currency: self.currency,
            is_manual: self.is_manual,
            is_active: self.is_active,
            last_synced_at: self
                .last_synced_at
                .map(|s| DateTime::parse_from_rfc3339(&s).map(|d| d.with_timezone(&Utc)))
                .transpose()
                .map_err(|e| AppError::Database(e.to_string()))?,
            last_sync_status: self.last_sync_status.map(|s| sync_status_from_sql(&s)).transpose()?,
        })
    }
}

impl Store {
    pub async fn create_account(&self, account: &Account) -> Result<(), AppError> {
        account
            .validate_invariants()
            .map_err(AppError::Validation)?;
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO accounts (id, user_id, portfolio_id, custodian_id, kind, external_id,
                access_token_handle, current_balance, available_balance, currency, is_manual,
                is_active, last_synced_at, last_sync_status)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14)",
            params![
                account.id.to_string(),
                account.user_id.to_string(),
                account.portfolio_id.map(|i| i.to_string()),
                account.custodian_id.map(|i| i.to_string()),
                account_kind_to_sql(account.kind),
                account.external_id,
                account.access_token_handle,
                dec_to_sql(account.current_balance),
                dec_to_sql(account.available_balance),
                account.currency,
                account.is_manual,
                account.is_active,
                account.last_synced_at.map(|d| d.to_rfc3339()),
                account.last_sync_status.map(sync_status_to_sql),
            ],
        )?;
        Ok(())
    }

    pub async fn get_account(&self, id: Uuid) -> Result<Option<Account>, AppError> {
        let conn = self.conn.lock().await;
        let row = conn
            .query_row(
                "SELECT id,user_id,portfolio_id,custodian_id,kind,external_id,access_token_handle,
                    current_balance,available_balance,currency,is_manual,is_active,last_synced_at,
                    last_sync_status FROM accounts WHERE id = ?1",
                params![id.to_string()],
                row_to_account,
            )
            .optional()?;
        row.map(AccountRow::into_account).transpose()
    }

    pub async fn list_accounts_for_user(&self, user_id: Uuid) -> Result<Vec<Account>, AppError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id,user_id,portfolio_id,custodian_id,kind,external_id,access_token_handle,
                current_balance,available_balance,currency,is_manual,is_active,last_synced_at,
                last_sync_status FROM accounts WHERE user_id = ?1",
        )?;
        let rows = stmt
            .query_map(params![user_id.to_string()], row_to_account)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(AccountRow::into_account).collect()
    }

    pub async fn list_active_non_manual_accounts(&self) -> Result<Vec<Account>, AppError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id,user_id,portfolio_id,custodian_id,kind,external_id,access_token_handle,
                current_balance,available_balance,currency,is_manual,is_active,last_synced_at,
                last_sync_status FROM accounts WHERE is_active = 1 AND is_manual = 0",
        )?;
        let rows = stmt
            .query_map([], row_to_account)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(AccountRow::into_account).collect()
    }

    /// Updates balances and sync bookkeeping after a successful (or
    /// partial/failed) custodian sync. `refresh_balance` gates whether
    /// `current_balance`/`available_balance` are overwritten, per §9 open
    /// question (a): only investment-kind accounts get this treatment.
    pub async fn apply_sync_result(
        &self,
        account_id: Uuid,
        refresh_balance: Option<(rust_decimal::Decimal, rust_decimal::Decimal)>,
        status: SyncStatus,
        synced_at: DateTime<Utc>,
    ) -> Result<(), AppError> {
        let conn = self.conn.lock().await;
        if let Some((current, available)) = refresh_balance {
            conn.execute(
                "UPDATE accounts SET current_balance=?1, available_balance=?2,
                    last_synced_at=?3, last_sync_status=?4 WHERE id=?5",
                params![
                    dec_to_sql(current),
                    dec_to_sql(available),
                    synced_at.to_rfc3339(),
                    sync_status_to_sql(status),
                    account_id.to_string(),
                ],
            )?;
        } else {
            conn.execute(
                "UPDATE accounts SET last_synced_at=?1, last_sync_status=?2 WHERE id=?3",
                params![
                    synced_at.to_rfc3339(),
                    sync_status_to_sql(status),
                    account_id.to_string(),
                ],
            )?;
        }
        Ok(())
    }

    /// Adjusts available balance by a signed delta (credits increase it).
    /// Used by the order engine when a fill is ingested.
    pub async fn adjust_available_balance(
        &self,
        account_id: Uuid,
        delta: rust_decimal::Decimal,
    ) -> Result<(), AppError> {
        let conn = self.conn.lock().await;
        let current: String = conn.query_row(
            "SELECT available_balance FROM accounts WHERE id=?1",
            params![account_id.to_string()],
            |r| r.get(0),
        )?;
        let new_balance = dec_from_sql(&current)? + delta;
        conn.execute(
            "UPDATE accounts SET available_balance=?1 WHERE id=?2",
            params![dec_to_sql(new_balance), account_id.to_string()],
        )?;
        Ok(())
    }

    pub async fn create_custodian(&self, custodian: &Custodian) -> Result<(), AppError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO custodians (id,name,read_balance,read_holdings,read_transactions,trade,healthy)
             VALUES (?1,?2,?3,?4,?5,?6,?7)",
            params![
                custodian.id.to_string(),
                custodian.name,
                custodian.capabilities.read_balance,
                custodian.capabilities.read_holdings,
                custodian.capabilities.read_transactions,
                custodian.capabilities.trade,
                custodian.healthy,
            ],
        )?;
        Ok(())
    }

    pub async fn get_custodian_by_name(&self, name: &str) -> Result<Option<Custodian>, AppError> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT id,name,read_balance,read_holdings,read_transactions,trade,healthy
             FROM custodians WHERE name=?1",
            params![name],
            |row| {
                Ok(Custodian {
                    id: Uuid::parse_str(&row.get::<_, String>(0)?).unwrap(),
                    name: row.get(1)?,
                    capabilities: CustodianCapabilities {
                        read_balance: row.get(2)?,
                        read_holdings: row.get(3)?,
                        read_transactions: row.get(4)?,
                        trade: row.get(5)?,
                    },
                    healthy: row.get(6)?,
                })
            },
        )
        .optional()
        .map_err(AppError::from)
    }

    pub async fn get_custodian(&self, id: Uuid) -> Result<Option<Custodian>, AppError> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT id,name,read_balance,read_holdings,read_transactions,trade,healthy
             FROM custodians WHERE id=?1",
            params![id.to_string()],
            |row| {
                Ok(Custodian {
                    id: Uuid::parse_str(&row.get::<_, String>(0)?).unwrap(),
                    name: row.get(1)?,
                    capabilities: CustodianCapabilities {
                        read_balance: row.get(2)?,
                        read_holdings: row.get(3)?,
                        read_transactions: row.get(4)?,
                        trade: row.get(5)?,
                    },
                    healthy: row.get(6)?,
                })
            },
        )
        .optional()
        .map_err(AppError::from)
    }
}
