//! Order repository methods.

use super::{dec_from_sql, dec_to_sql, opt_dec_from_sql, opt_dec_to_sql, Store};
use crate::domain::{Order, OrderSide, OrderState, OrderType, TimeInForce};
use crate::error::AppError;
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use uuid::Uuid;

fn side_to_sql(s: OrderSide) -> &'static str {
    match s {
        OrderSide::Buy => "BUY",
        OrderSide::Sell => "SELL",
    }
}
fn side_from_sql(s: &str) -> Result<OrderSide, AppError> {
    Ok(match s {
        "BUY" => OrderSide::Buy,
        "SELL" => OrderSide::Sell,
        other => return Err(AppError::Database(format!("bad order side '{other}'"))),
    })
}
fn type_to_sql(t: OrderType) -> &'static str {
    match t {
        OrderType::Market => "MARKET",
        OrderType::Limit => "LIMIT",
        OrderType::Stop => "STOP",
        OrderType::StopLimit => "STOP_LIMIT",
    }
}
fn type_from_sql(s: &str) -> Result<OrderType, AppError> {
    Ok(match s {
        "MARKET" => OrderType::Market,
        "LIMIT" => OrderType::Limit,
        "STOP" => OrderType::Stop,
        "STOP_LIMIT" => OrderType::StopLimit,
        other => return Err(AppError::Database(format!("bad order type '{other}'"))),
    })
}
fn tif_to_sql(t: TimeInForce) -> &'static str {
    match t {
        TimeInForce::Day => "DAY",
        TimeInForce::Gtc => "GTC",
        TimeInForce::Ioc => "IOC",
        TimeInForce::Fok => "FOK",
    }
}
fn tif_from_sql(s: &str) -> Result<TimeInForce, AppError> {
    Ok(match s {
        "DAY" => TimeInForce::Day,
        "GTC" => TimeInForce::Gtc,
        "IOC" => TimeInForce::Ioc,
        "FOK" => TimeInForce::Fok,
        other => return Err(AppError::Database(format!("bad time-in-force '{other}'"))),
    })
}
pub(crate) fn state_to_sql(s: OrderState) -> &'static str {
    match s {
        OrderState::Pending => "PENDING",
        OrderState::Submitted => "SUBMITTED",
        OrderState::PartiallyFilled => "PARTIALLY_FILLED",
        OrderState::Filled => "FILLED",
        OrderState::Cancelled => "CANCELLED",
        OrderState::Rejected => "REJECTED",
        OrderState::Expired => "EXPIRED",
    }
}
fn state_from_sql(s: &str) -> Result<OrderState, AppError> {
    Ok(match s {
        "PENDING" => OrderState::Pending,
        "SUBMITTED" => OrderState::Submitted,
        "PARTIALLY_FILLED" => OrderState::PartiallyFilled,
        "FILLED" => OrderState::Filled,
        "CANCELLED" => OrderState::Cancelled,
        "REJECTED" => OrderState::Rejected,
        "EXPIRED" => OrderState::Expired,
        other => return Err(AppError::Database(format!("bad order state '{other}'"))),
    })
}

const ORDER_COLUMNS: &str = "id,user_id,account_id,symbol,side,quantity,order_type,limit_price,
    stop_price,time_in_force,state,broker_id,client_idempotency_key,filled_quantity,
    avg_fill_price,submitted_at,last_updated_at,retry_count,last_error";

fn row_to_order(row: &Row) -> rusqlite::Result<RawOrder> {
    Ok(RawOrder {
        id: row.get(0)?,
        user_id: row.get(1)?,
        account_id: row.get(2)?,
        symbol: row.get(3)?,
        side: row.get(4)?,
        quantity: row.get(5)?,
        order_type: row.get(6)?,
        limit_price: row.get(7)?,
        stop_price: row.get(8)?,
        time_in_force: row.get(9)?,
        state: row.get(10)?,
        broker_id: row.get(11)?,
        client_idempotency_key: row.get(12)?,
        filled_quantity: row.get(13)?,
        avg_fill_price: row.get(14)?,
        submitted_at: row.get(15)?,
        last_updated_at: row.get(16)?,
        retry_count: row.get(17)?,
        last_error: row.get(18)?,
    })
}

struct RawOrder {
    id: String,
    user_id: String,
    account_id: String,
    symbol: String,
    side: String,
    quantity: String,
    order_type: String,
    limit_price: Option<String>,
    stop_price: Option<String>,
    time_in_force: String,
    state: String,
    broker_id: Option<String>,
    client_idempotency_key: String,
    filled_quantity: String,
    avg_fill_price: Option<String>,
    submitted_at: Option<String>,
    last_updated_at: String,
    retry_count: u32,
    last_error: Option<String>,
}

impl RawOrder {
    fn into_order(self) -> Result<Order, AppError> {
        Ok(Order {
            id: Uuid::parse_str(&self.id).map_err(|e| AppError::Database(e.to_string()))?,
            user_id: Uuid::parse_str(&self.user_id).map_err(|e| AppError::Database(e.to_string()))?,
            account_id: Uuid::parse_str(&self.account_id)
                .map_err(|e| AppError::Database(e.to_string()))?,
            symbol: self.symbol,
            side: side_from_sql(&self.side)?,
            quantity: dec_from_sql(&self.quantity)?,
            order_type: type_from_sql(&self.order_type)?,
            limit_price: opt_dec_from_sql(self.limit_price)?,
            stop_price: opt_dec_from_sql(self.stop_price)?,
            time_in_force: tif_from_sql(&self.time_in_force)?,
            state: state_from_sql(&self.state)?,
            broker_id: self.broker_id,
            client_idempotency_key: self.client_idempotency_key,
            filled_quantity: dec_from_sql(&self.filled_quantity)?,
            avg_fill_price: opt_dec_from_sql(self.avg_fill_price)?,
            submitted_at: self
                .submitted_at
                .map(|s| DateTime::parse_from_rfc3339(&s).map(|d| d.with_timezone(&Utc)))
                .transpose()
                .map_err(|e| AppError::Database(e.to_string()))?,
            last_updated_at: DateTime::parse_from_rfc3339(&self.last_updated_at)
                .map_err(|e| AppError::Database(e.to_string()))?
                .with_timezone(&Utc),
            retry_count: self.retry_count,
            last_error: self.last_error,
        })
    }
}

#[derive(Debug, Default)]
pub struct OrderFilters {
    pub user_id: Option<Uuid>,
    pub account_id: Option<Uuid>,
    pub state: Option<OrderState>,
    pub symbol: Option<String>,
}

impl Store {
    pub async fn insert_order(&self, order: &Order) -> Result<(), AppError> {
        let conn = self.conn.lock().await;
        conn.execute(
            &format!("INSERT INTO orders ({ORDER_COLUMNS}) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19)"),
            params![
                order.id.to_string(),
                order.user_id.to_string(),
                order.account_id.to_string(),
                order.symbol,
                side_to_sql(order.side),
                dec_to_sql(order.quantity),
                type_to_sql(order.order_type),
                opt_dec_to_sql(order.limit_price),
                opt_dec_to_sql(order.stop_price),
                tif_to_sql(order.time_in_force),
                state_to_sql(order.state),
                order.broker_id,
                order.client_idempotency_key,
                dec_to_sql(order.filled_quantity),
                opt_dec_to_sql(order.avg_fill_price),
                order.submitted_at.map(|d| d.to_rfc3339()),
                order.last_updated_at.to_rfc3339(),
                order.retry_count,
                order.last_error,
            ],
        )?;
        Ok(())
    }

    pub async fn get_order(&self, id: Uuid) -> Result<Option<Order>, AppError> {
        let conn = self.conn.lock().await;
        let row = conn
            .query_row(
                &format!("SELECT {ORDER_COLUMNS} FROM orders WHERE id=?1"),
                params![id.to_string()],
                row_to_order,
            )
            .optional()?;
        row.map(RawOrder::into_order).transpose()
    }

    pub async fn get_order_by_idempotency_key(
        &self,
        key: &str,
    ) -> Result<Option<Order>, AppError> {
        let conn = self.conn.lock().await;
        let row = conn
            .query_row(
                &format!("SELECT {ORDER_COLUMNS} FROM orders WHERE client_idempotency_key=?1"),
                params![key],
                row_to_order,
            )
            .optional()?;
        row.map(RawOrder::into_order).transpose()
    }

    /// Adoption lookup for the partial-failure contract (§4.1): find an
    /// order the broker may already know about by (account, symbol) among
    /// orders not yet carrying a broker id.
    pub async fn find_orphaned_order(
        &self,
        account_id: Uuid,
        symbol: &str,
    ) -> Result<Option<Order>, AppError> {
        let conn = self.conn.lock().await;
        let row = conn
            .query_row(
                &format!(
                    "SELECT {ORDER_COLUMNS} FROM orders WHERE account_id=?1 AND symbol=?2
                     AND broker_id IS NULL AND state='PENDING' ORDER BY last_updated_at ASC LIMIT 1"
                ),
                params![account_id.to_string(), symbol],
                row_to_order,
            )
            .optional()?;
        row.map(RawOrder::into_order).transpose()
    }

    pub async fn list_orders(&self, filters: &OrderFilters) -> Result<Vec<Order>, AppError> {
        let conn = self.conn.lock().await;
        let mut sql = format!("SELECT {ORDER_COLUMNS} FROM orders WHERE 1=1");
        let mut binds: Vec<String> = Vec::new();
        if let Some(u) = filters.user_id {
            sql.push_str(" AND user_id = ?");
            binds.push(u.to_string());
        }
        if let Some(a) = filters.account_id {
            sql.push_str(" AND account_id = ?");
            binds.push(a.to_string());
        }
        if let Some(st) = filters.state {
            sql.push_str(" AND state = ?");
            binds.push(state_to_sql(st).to_string());
        }
        if let Some(sym) = &filters.symbol {
            sql.push_str(" AND symbol = ?");
            binds.push(sym.clone());
        }
        sql.push_str(" ORDER BY last_updated_at DESC");

        let mut stmt = conn.prepare(&sql)?;
        let params_dyn: Vec<&dyn rusqlite::ToSql> =
            binds.iter().map(|b| b as &dyn rusqlite::ToSql).collect();
        let rows = stmt
            .query_map(params_dyn.as_slice(), row_to_order)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(RawOrder::into_order).collect()
    }

    /// Persists the full mutable surface of an order in one statement,
    /// so the per-order lock (§5) that guards state transitions has a
    /// single write to commit under.
    pub async fn save_order(&self, order: &Order) -> Result<(), AppError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE orders SET state=?1, broker_id=?2, filled_quantity=?3, avg_fill_price=?4,
                submitted_at=?5, last_updated_at=?6, retry_count=?7, last_error=?8
             WHERE id=?9",
            params![
                state_to_sql(order.state),
                order.broker_id,
                dec_to_sql(order.filled_quantity),
                opt_dec_to_sql(order.avg_fill_price),
                order.submitted_at.map(|d| d.to_rfc3339()),
                order.last_updated_at.to_rfc3339(),
                order.retry_count,
                order.last_error,
                order.id.to_string(),
            ],
        )?;
        Ok(())
    }

    /// Sum of quantities reserved by the user's other open SELL orders on
    /// this symbol/account, used by SELL validation (§4.1 rule 6).
    pub async fn reserved_sell_quantity(
        &self,
        account_id: Uuid,
        symbol: &str,
        exclude_order_id: Option<Uuid>,
    ) -> Result<rust_decimal::Decimal, AppError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT quantity, filled_quantity FROM orders WHERE account_id=?1 AND symbol=?2
             AND side='SELL' AND state IN ('PENDING','SUBMITTED','PARTIALLY_FILLED')
             AND (?3 IS NULL OR id != ?3)",
        )?;
        let rows = stmt.query_map(
            params![
                account_id.to_string(),
                symbol,
                exclude_order_id.map(|i| i.to_string())
            ],
            |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
        )?;
        let mut total = rust_decimal::Decimal::ZERO;
        for row in rows {
            let (qty, filled) = row?;
            total += dec_from_sql(&qty)? - dec_from_sql(&filled)?;
        }
        Ok(total)
    }
}
