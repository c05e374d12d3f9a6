//! Portfolio, holding, transaction, and strategy repository methods.

use super::{dec_from_sql, dec_to_sql, opt_dec_from_sql, opt_dec_to_sql, Store};
use crate::domain::{
    Holding, Portfolio, Strategy, StrategyHolding, Transaction, TransactionKind,
};
use crate::error::AppError;
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use sha2::{Digest, Sha256};
use uuid::Uuid;

fn tx_kind_to_sql(k: TransactionKind) -> &'static str {
    match k {
        TransactionKind::Deposit => "deposit",
        TransactionKind::Withdrawal => "withdrawal",
        TransactionKind::Transfer => "transfer",
        TransactionKind::Purchase => "purchase",
        TransactionKind::Sale => "sale",
        TransactionKind::Dividend => "dividend",
        TransactionKind::Interest => "interest",
        TransactionKind::Fee => "fee",
    }
}

fn tx_kind_from_sql(s: &str) -> Result<TransactionKind, AppError> {
    Ok(match s {
        "deposit" => TransactionKind::Deposit,
        "withdrawal" => TransactionKind::Withdrawal,
        "transfer" => TransactionKind::Transfer,
        "purchase" => TransactionKind::Purchase,
        "sale" => TransactionKind::Sale,
        "dividend" => TransactionKind::Dividend,
        "interest" => TransactionKind::Interest,
        "fee" => TransactionKind::Fee,
        other => return Err(AppError::Database(format!("bad transaction kind '{other}'"))),
    })
}

/// Content-hash dedup key used when a custodian transaction has no
/// `external_id` (§4.2 step 3).
pub fn transaction_content_hash(
    account_id: Uuid,
    date: DateTime<Utc>,
    amount: rust_decimal::Decimal,
    description: &str,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(account_id.as_bytes());
    hasher.update(date.to_rfc3339().as_bytes());
    hasher.update(amount.to_string().as_bytes());
    hasher.update(description.as_bytes());
    hex::encode(hasher.finalize())
}

impl Store {
    pub async fn create_portfolio(&self, portfolio: &Portfolio) -> Result<(), AppError> {
        let conn = self.conn.lock().await;
        if portfolio.is_primary {
            conn.execute(
                "UPDATE portfolios SET is_primary = 0 WHERE user_id = ?1",
                params![portfolio.user_id.to_string()],
            )?;
        }
        conn.execute(
            "INSERT INTO portfolios (id,user_id,name,is_primary) VALUES (?1,?2,?3,?4)",
            params![
                portfolio.id.to_string(),
                portfolio.user_id.to_string(),
                portfolio.name,
                portfolio.is_primary,
            ],
        )?;
        Ok(())
    }

    pub async fn list_portfolios_for_user(&self, user_id: Uuid) -> Result<Vec<Portfolio>, AppError> {
        let conn = self.conn.lock().await;
        let mut stmt =
            conn.prepare("SELECT id,user_id,name,is_primary FROM portfolios WHERE user_id=?1")?;
        let rows = stmt
            .query_map(params![user_id.to_string()], |row| {
                Ok(Portfolio {
                    id: Uuid::parse_str(&row.get::<_, String>(0)?).unwrap(),
                    user_id: Uuid::parse_str(&row.get::<_, String>(1)?).unwrap(),
                    name: row.get(2)?,
                    is_primary: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Upserts a holding snapshot; callers decide create/update/delete at
    /// the sync-diff level (§4.2 step 2) and call this per surviving row.
    pub async fn upsert_holding(&self, holding: &Holding) -> Result<(), AppError> {
        let symbol = Holding::normalize_symbol(&holding.symbol);
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO holdings (account_id,symbol,quantity,unit_price,cost_basis,last_updated)
             VALUES (?1,?2,?3,?4,?5,?6)
             ON CONFLICT(account_id,symbol) DO UPDATE SET
                quantity=excluded.quantity, unit_price=excluded.unit_price,
                cost_basis=excluded.cost_basis, last_updated=excluded.last_updated",
            params![
                holding.account_id.to_string(),
                symbol,
                dec_to_sql(holding.quantity),
                dec_to_sql(holding.unit_price),
                dec_to_sql(holding.cost_basis),
                holding.last_updated.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub async fn delete_holding(&self, account_id: Uuid, symbol: &str) -> Result<(), AppError> {
        let symbol = Holding::normalize_symbol(symbol);
        let conn = self.conn.lock().await;
        conn.execute(
            "DELETE FROM holdings WHERE account_id=?1 AND symbol=?2",
            params![account_id.to_string(), symbol],
        )?;
        Ok(())
    }

    pub async fn list_holdings_for_account(&self, account_id: Uuid) -> Result<Vec<Holding>, AppError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT account_id,symbol,quantity,unit_price,cost_basis,last_updated
             FROM holdings WHERE account_id=?1",
        )?;
        let rows = stmt.query_map(params![account_id.to_string()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (account_id, symbol, qty, price, cost, updated) = row?;
            out.push(Holding {
                account_id: Uuid::parse_str(&account_id).unwrap(),
                symbol,
                quantity: dec_from_sql(&qty)?,
                unit_price: dec_from_sql(&price)?,
                cost_basis: dec_from_sql(&cost)?,
                last_updated: DateTime::parse_from_rfc3339(&updated)
                    .map_err(|e| AppError::Database(e.to_string()))?
                    .with_timezone(&Utc),
            });
        }
        Ok(out)
    }

    pub async fn list_holdings_for_user(&self, user_id: Uuid) -> Result<Vec<Holding>, AppError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT h.account_id,h.symbol,h.quantity,h.unit_price,h.cost_basis,h.last_updated
             FROM holdings h JOIN accounts a ON a.id = h.account_id
             WHERE a.user_id = ?1",
        )?;
        let rows = stmt.query_map(params![user_id.to_string()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (account_id, symbol, qty, price, cost, updated) = row?;
            out.push(Holding {
                account_id: Uuid::parse_str(&account_id).unwrap(),
                symbol,
                quantity: dec_from_sql(&qty)?,
                unit_price: dec_from_sql(&price)?,
                cost_basis: dec_from_sql(&cost)?,
                last_updated: DateTime::parse_from_rfc3339(&updated)
                    .map_err(|e| AppError::Database(e.to_string()))?
                    .with_timezone(&Utc),
            });
        }
        Ok(out)
    }

    /// Idempotent insert per §4.2 step 3 / §8 law: re-ingesting the same
    /// `external_id` (or content hash, when absent) is a no-op.
    pub async fn upsert_transaction(&self, tx: &Transaction) -> Result<bool, AppError> {
        let conn = self.conn.lock().await;
        if let Some(external_id) = &tx.external_id {
            let exists: Option<String> = conn
                .query_row(
                    "SELECT id FROM transactions WHERE account_id=?1 AND external_id=?2",
                    params![tx.account_id.to_string(), external_id],
                    |r| r.get(0),
                )
                .optional()?;
            if exists.is_some() {
                return Ok(false);
            }
        } else if let Some(hash) = &tx.content_hash {
            let exists: Option<String> = conn
                .query_row(
                    "SELECT id FROM transactions WHERE account_id=?1 AND content_hash=?2",
                    params![tx.account_id.to_string(), hash],
                    |r| r.get(0),
                )
                .optional()?;
            if exists.is_some() {
                return Ok(false);
            }
        }

        conn.execute(
            "INSERT INTO transactions (id,account_id,user_id,kind,amount,date,symbol,quantity,
                unit_price,fee,external_id,content_hash,pending)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13)",
            params![
                tx.id.to_string(),
                tx.account_id.to_string(),
                tx.user_id.to_string(),
                tx_kind_to_sql(tx.kind),
                dec_to_sql(tx.amount),
                tx.date.to_rfc3339(),
                tx.symbol,
                opt_dec_to_sql(tx.quantity),
                opt_dec_to_sql(tx.unit_price),
                opt_dec_to_sql(tx.fee),
                tx.external_id,
                tx.content_hash,
                tx.pending,
            ],
        )?;
        Ok(true)
    }

    pub async fn list_transactions_for_account(
        &self,
        account_id: Uuid,
    ) -> Result<Vec<Transaction>, AppError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id,account_id,user_id,kind,amount,date,symbol,quantity,unit_price,fee,
                external_id,content_hash,pending FROM transactions WHERE account_id=?1
             ORDER BY date DESC",
        )?;
        let rows = stmt.query_map(params![account_id.to_string()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, Option<String>>(6)?,
                row.get::<_, Option<String>>(7)?,
                row.get::<_, Option<String>>(8)?,
                row.get::<_, Option<String>>(9)?,
                row.get::<_, Option<String>>(10)?,
                row.get::<_, Option<String>>(11)?,
                row.get::<_, bool>(12)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (id, account_id, user_id, kind, amount, date, symbol, qty, price, fee, ext, hash, pending) =
                row?;
            out.push(Transaction {
                id: Uuid::parse_str(&id).unwrap(),
                account_id: Uuid::parse_str(&account_id).unwrap(),
                user_id: Uuid::parse_str(&user_id).unwrap(),
                kind: tx_kind_from_sql(&kind)?,
                amount: dec_from_sql(&amount)?,
                date: DateTime::parse_from_rfc3339(&date)
                    .map_err(|e| AppError::Database(e.to_string()))?
                    .with_timezone(&Utc),
                symbol,
                quantity: opt_dec_from_sql(qty)?,
                unit_price: opt_dec_from_sql(price)?,
                fee: opt_dec_from_sql(fee)?,
                external_id: ext,
                content_hash: hash,
                pending,
            });
        }
        Ok(out)
    }

    pub async fn create_strategy(&self, strategy: &Strategy) -> Result<(), AppError> {
        let total: rust_decimal::Decimal = strategy.holdings.iter().map(|h| h.target_weight).sum();
        if total > rust_decimal::Decimal::ONE {
            return Err(AppError::Validation(
                "strategy target weights must sum to <= 1".to_string(),
            ));
        }
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO strategies (id,user_id,name,drift_threshold_pct) VALUES (?1,?2,?3,?4)",
            params![
                strategy.id.to_string(),
                strategy.user_id.to_string(),
                strategy.name,
                dec_to_sql(strategy.drift_threshold_pct),
            ],
        )?;
        for h in &strategy.holdings {
            conn.execute(
                "INSERT INTO strategy_holdings (strategy_id,symbol,target_weight) VALUES (?1,?2,?3)",
                params![
                    strategy.id.to_string(),
                    Holding::normalize_symbol(&h.symbol),
                    dec_to_sql(h.target_weight),
                ],
            )?;
        }
        Ok(())
    }

    pub async fn get_strategy(&self, id: Uuid) -> Result<Option<Strategy>, AppError> {
        let conn = self.conn.lock().await;
        let head = conn
            .query_row(
                "SELECT id,user_id,name,drift_threshold_pct FROM strategies WHERE id=?1",
                params![id.to_string()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()?;
        let Some((id_s, user_id, name, threshold)) = head else {
            return Ok(None);
        };
        let mut stmt = conn
            .prepare("SELECT symbol,target_weight FROM strategy_holdings WHERE strategy_id=?1")?;
        let holdings = stmt
            .query_map(params![id_s], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        let holdings = holdings
            .into_iter()
            .map(|(symbol, w)| -> Result<StrategyHolding, AppError> {
                Ok(StrategyHolding {
                    symbol,
                    target_weight: dec_from_sql(&w)?,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Some(Strategy {
            id,
            user_id: Uuid::parse_str(&user_id).map_err(|e| AppError::Database(e.to_string()))?,
            name,
            holdings,
            drift_threshold_pct: dec_from_sql(&threshold)?,
        }))
    }
}
