//! Credit reservations.
//!
//! A deduction is a `pending` row in `reservations`, written in the same
//! transaction that takes the credits off the balance. It ends either
//! `committed` (the work was delivered) or `refunded` (credits returned).
//! Rows still pending after the configured TTL are refunded by
//! [`reconcile_forever`], so a crash between deduction and settlement cannot
//! strand credits.

use std::time::{Duration, SystemTime};

use crate::data::{unix_secs, Storage, Tx};

#[derive(sqlx::Type, serde::Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ReservationState {
    Pending,
    Committed,
    Refunded,
}

#[derive(sqlx::FromRow, Debug, Clone, PartialEq)]
pub struct Reservation {
    pub id: String,
    pub uid: String,
    pub api_key_id: Option<String>,
    pub idempotency_key: Option<String>,
    pub amount: i64,
    pub purpose: String,
    pub state: ReservationState,
    pub created_at: i64,
    pub settled_at: Option<i64>,
    /// Set when an existing reservation was returned for a repeated
    /// idempotency key instead of a new deduction.
    #[sqlx(skip)]
    pub replayed: bool,
}

#[derive(Debug, Clone)]
pub struct ReserveRequest<'a> {
    pub uid: &'a str,
    pub api_key_id: Option<&'a str>,
    pub amount: i64,
    pub purpose: &'a str,
    pub idempotency_key: Option<&'a str>,
}

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("amount must be positive, got {0}")]
    InvalidAmount(i64),

    #[error("unknown account: {0}")]
    UnknownAccount(String),

    #[error("insufficient credits: required {required}, available {available}")]
    InsufficientCredits { required: i64, available: i64 },

    #[error("api key {key_id} would exceed its credit limit of {limit}")]
    KeyBudgetExceeded { key_id: String, limit: i64 },

    #[error("reservation not found: {0}")]
    NotFound(String),

    #[error("reservation {id} is already {state:?}")]
    NotPending { id: String, state: ReservationState },

    #[error(transparent)]
    Storage(#[from] sqlx::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, LedgerError>;

impl Storage {
    /// Takes `amount` credits off the user's balance, only if the balance
    /// covers it, and records the pending reservation.
    pub async fn reserve(
        &self,
        req: &ReserveRequest<'_>,
    ) -> Result<Reservation> {
        let now = SystemTime::now();
        let tx = self.pool.begin().await?;
        match reserve(tx, req, now).await? {
            (tx, Reserved::New(reservation)) => {
                tx.commit().await?;
                tracing::info!(
                    id = reservation.id,
                    uid = reservation.uid,
                    amount = reservation.amount,
                    purpose = reservation.purpose,
                    "Reserved credits."
                );
                Ok(reservation)
            }
            (tx, Reserved::Replayed(reservation)) => {
                tx.rollback().await?;
                tracing::info!(
                    id = reservation.id,
                    state = ?reservation.state,
                    "Idempotency key replayed."
                );
                Ok(reservation)
            }
            (tx, Reserved::Rejected(error)) => {
                tx.rollback().await?;
                Err(error)
            }
        }
    }

    /// Settles a pending reservation as spent. Idempotent.
    pub async fn commit(&self, id: &str) -> Result<Reservation> {
        let now = SystemTime::now();
        let tx = self.pool.begin().await?;
        let (tx, reservation) = commit(tx, id, now).await?;
        tx.commit().await?;
        tracing::info!(id, amount = reservation.amount, "Committed credits.");
        Ok(reservation)
    }

    /// Returns a pending reservation's credits. Idempotent: a second refund
    /// credits nothing.
    pub async fn refund(&self, id: &str) -> Result<Reservation> {
        let now = SystemTime::now();
        let tx = self.pool.begin().await?;
        let (tx, reservation) = refund(tx, id, now).await?;
        tx.commit().await?;
        tracing::info!(id, amount = reservation.amount, "Refunded credits.");
        Ok(reservation)
    }

    pub async fn reservation(&self, id: &str) -> Result<Option<Reservation>> {
        let row = sqlx::query_as("SELECT * FROM reservations WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    /// Refunds every reservation still pending that was created before
    /// `cutoff`.
    pub async fn recover_stale(
        &self,
        cutoff: SystemTime,
    ) -> Result<Vec<Reservation>> {
        let stale: Vec<(String,)> = sqlx::query_as(
            "SELECT id FROM reservations
                WHERE state = 'pending' AND created_at < ?
                ORDER BY created_at",
        )
        .bind(unix_secs(cutoff)?)
        .fetch_all(&self.pool)
        .await?;
        let mut refunded = Vec::with_capacity(stale.len());
        for (id,) in stale {
            match self.refund(&id).await {
                Ok(reservation) => {
                    tracing::warn!(
                        id,
                        uid = reservation.uid,
                        amount = reservation.amount,
                        "Refunded stale reservation."
                    );
                    refunded.push(reservation);
                }
                // Settled concurrently.
                Err(LedgerError::NotPending { .. }) => {}
                Err(error) => return Err(error),
            }
        }
        Ok(refunded)
    }
}

/// Periodically refunds reservations left pending for longer than `ttl`.
pub async fn reconcile_forever(
    storage: Storage,
    ttl: Duration,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let cutoff = SystemTime::now()
            .checked_sub(ttl)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        match storage.recover_stale(cutoff).await {
            Ok(refunded) if refunded.is_empty() => {
                tracing::debug!("No stale reservations.");
            }
            Ok(refunded) => {
                tracing::warn!(count = refunded.len(), "Reconciled.");
            }
            Err(error) => {
                tracing::error!(?error, "Reconciliation failed.");
            }
        }
    }
}

enum Reserved {
    New(Reservation),
    Replayed(Reservation),
    Rejected(LedgerError),
}

async fn reserve<'a>(
    mut tx: Tx<'a>,
    req: &ReserveRequest<'_>,
    now: SystemTime,
) -> Result<(Tx<'a>, Reserved)> {
    if req.amount <= 0 {
        return Ok((tx, Reserved::Rejected(LedgerError::InvalidAmount(req.amount))));
    }
    let now = unix_secs(now)?;

    // Write first, so the transaction holds the write lock from here on.
    let deducted = sqlx::query(
        "UPDATE users SET credits = credits - ?
            WHERE uid = ? AND credits >= ?",
    )
    .bind(req.amount)
    .bind(req.uid)
    .bind(req.amount)
    .execute(&mut *tx)
    .await?
    .rows_affected()
        > 0;

    if let Some(key) = req.idempotency_key {
        let existing: Option<Reservation> = sqlx::query_as(
            "SELECT * FROM reservations
                WHERE uid = ? AND idempotency_key = ?",
        )
        .bind(req.uid)
        .bind(key)
        .fetch_optional(&mut *tx)
        .await?;
        if let Some(mut existing) = existing {
            existing.replayed = true;
            return Ok((tx, Reserved::Replayed(existing)));
        }
    }

    if !deducted {
        let balance: Option<(i64,)> =
            sqlx::query_as("SELECT credits FROM users WHERE uid = ?")
                .bind(req.uid)
                .fetch_optional(&mut *tx)
                .await?;
        let error = match balance {
            None => LedgerError::UnknownAccount(req.uid.to_string()),
            Some((available,)) => LedgerError::InsufficientCredits {
                required: req.amount,
                available,
            },
        };
        return Ok((tx, Reserved::Rejected(error)));
    }

    if let Some(key_id) = req.api_key_id {
        let within_limit = sqlx::query(
            "UPDATE api_keys SET credits_spent = credits_spent + ?
                WHERE id = ?
                AND (credit_limit IS NULL OR credits_spent + ? <= credit_limit)",
        )
        .bind(req.amount)
        .bind(key_id)
        .bind(req.amount)
        .execute(&mut *tx)
        .await?
        .rows_affected()
            > 0;
        if !within_limit {
            let limit: Option<(Option<i64>,)> =
                sqlx::query_as("SELECT credit_limit FROM api_keys WHERE id = ?")
                    .bind(key_id)
                    .fetch_optional(&mut *tx)
                    .await?;
            let error = match limit {
                Some((Some(limit),)) => LedgerError::KeyBudgetExceeded {
                    key_id: key_id.to_string(),
                    limit,
                },
                _ => LedgerError::UnknownAccount(key_id.to_string()),
            };
            return Ok((tx, Reserved::Rejected(error)));
        }
    }

    let reservation: Reservation = sqlx::query_as(
        "INSERT INTO reservations
            (id, uid, api_key_id, idempotency_key, amount,
             purpose, state, created_at)
            VALUES (?, ?, ?, ?, ?, ?, 'pending', ?)
            RETURNING *",
    )
    .bind(cuid2::create_id())
    .bind(req.uid)
    .bind(req.api_key_id)
    .bind(req.idempotency_key)
    .bind(req.amount)
    .bind(req.purpose)
    .bind(now)
    .fetch_one(&mut *tx)
    .await?;
    Ok((tx, Reserved::New(reservation)))
}

/// Moves a reservation out of `pending`. Returns the reservation and whether
/// this call did the transition.
async fn settle<'a>(
    mut tx: Tx<'a>,
    id: &str,
    to: ReservationState,
    now: SystemTime,
) -> Result<(Tx<'a>, Reservation, bool)> {
    let now = unix_secs(now)?;
    let updated: Option<Reservation> = sqlx::query_as(
        "UPDATE reservations SET state = ?, settled_at = ?
            WHERE id = ? AND state = 'pending'
            RETURNING *",
    )
    .bind(to)
    .bind(now)
    .bind(id)
    .fetch_optional(&mut *tx)
    .await?;
    if let Some(reservation) = updated {
        return Ok((tx, reservation, true));
    }
    let current: Option<Reservation> =
        sqlx::query_as("SELECT * FROM reservations WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;
    match current {
        None => Err(LedgerError::NotFound(id.to_string())),
        Some(reservation) if reservation.state == to => {
            Ok((tx, reservation, false))
        }
        Some(reservation) => Err(LedgerError::NotPending {
            id: id.to_string(),
            state: reservation.state,
        }),
    }
}

async fn commit<'a>(
    tx: Tx<'a>,
    id: &str,
    now: SystemTime,
) -> Result<(Tx<'a>, Reservation)> {
    let (mut tx, reservation, transitioned) =
        settle(tx, id, ReservationState::Committed, now).await?;
    if transitioned {
        sqlx::query(
            "UPDATE users SET total_credits_spent = total_credits_spent + ?
                WHERE uid = ?",
        )
        .bind(reservation.amount)
        .bind(&reservation.uid)
        .execute(&mut *tx)
        .await?;
    }
    Ok((tx, reservation))
}

async fn refund<'a>(
    tx: Tx<'a>,
    id: &str,
    now: SystemTime,
) -> Result<(Tx<'a>, Reservation)> {
    let (mut tx, reservation, transitioned) =
        settle(tx, id, ReservationState::Refunded, now).await?;
    if transitioned {
        sqlx::query("UPDATE users SET credits = credits + ? WHERE uid = ?")
            .bind(reservation.amount)
            .bind(&reservation.uid)
            .execute(&mut *tx)
            .await?;
        if let Some(key_id) = &reservation.api_key_id {
            sqlx::query(
                "UPDATE api_keys SET credits_spent = MAX(0, credits_spent - ?)
                    WHERE id = ?",
            )
            .bind(reservation.amount)
            .bind(key_id)
            .execute(&mut *tx)
            .await?;
        }
    }
    Ok((tx, reservation))
}
