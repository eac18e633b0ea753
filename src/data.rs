use std::{
    fs,
    path::Path,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use anyhow::Context;
use sqlx::Executor;

use crate::conf::Conf;

const MIGRATIONS: [&str; 1] = [include_str!("../migrations/0_data.sql")];

pub(crate) type Tx<'a> = sqlx::Transaction<'a, sqlx::Sqlite>;

#[derive(sqlx::FromRow, Debug, Clone, PartialEq)]
pub struct UserRow {
    pub uid: String,
    pub email: Option<String>,
    pub wallet_address: Option<String>,
    pub credits: i64,
    pub total_credits_earned: i64,
    pub total_credits_spent: i64,
    pub created_at: i64,
}

#[derive(sqlx::Type, serde::Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum GenerationStatus {
    Completed,
    Failed,
    TimedOut,
}

#[derive(sqlx::FromRow, Debug, Clone)]
pub struct GenerationRow {
    pub id: i64,
    pub uid: String,
    pub reservation_id: String,
    pub tool_id: String,
    pub request_id: Option<String>,
    pub credits: i64,
    pub status: GenerationStatus,
    pub output: Option<String>,
    pub created_at: i64,
}

#[derive(Debug, Clone)]
pub struct NewGeneration<'a> {
    pub uid: &'a str,
    pub reservation_id: &'a str,
    pub tool_id: &'a str,
    pub request_id: Option<&'a str>,
    pub credits: i64,
    pub status: GenerationStatus,
    pub output: Option<&'a serde_json::Value>,
}

#[derive(sqlx::FromRow, Debug, Clone)]
pub struct ApiKeyRow {
    pub id: String,
    pub uid: String,
    pub name: String,
    pub key_hash: String,
    pub prefix: String,
    /// JSON array of tool ids.
    pub allowed_tools: String,
    pub credit_limit: Option<i64>,
    pub credits_spent: i64,
    pub revoked: bool,
    pub created_at: i64,
    pub last_used_at: Option<i64>,
}

impl ApiKeyRow {
    pub fn allowed_tools(&self) -> anyhow::Result<Vec<String>> {
        serde_json::from_str(&self.allowed_tools).context(format!(
            "Malformed allowed_tools for api key {:?}",
            self.id
        ))
    }
}

#[derive(Debug, Clone)]
pub struct PaymentCredit<'a> {
    pub payment_id: &'a str,
    pub uid: &'a str,
    pub source: &'a str,
    pub credits: i64,
    pub amount_cents: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentOutcome {
    Credited { balance: i64 },
    Duplicate,
}

#[derive(Clone)]
pub struct Storage {
    pub(crate) pool: sqlx::Pool<sqlx::Sqlite>,
}

impl Storage {
    pub async fn connect(conf: &Conf) -> anyhow::Result<Self> {
        let busy_timeout = Duration::from_secs_f32(conf.sqlite_busy_timeout);
        Self::open(&conf.db_file, busy_timeout).await
    }

    pub async fn open(
        file_path: &Path,
        busy_timeout: Duration,
    ) -> anyhow::Result<Self> {
        if let Some(parent) = file_path.parent() {
            let ctx = format!(
                "Failed to create parent directory \
                for database file: {file_path:?}"
            );
            fs::create_dir_all(parent).context(ctx)?;
        }
        let options = sqlx::sqlite::SqliteConnectOptions::new()
            .filename(file_path)
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .busy_timeout(busy_timeout);
        let pool = sqlx::SqlitePool::connect_with(options).await?;
        let selph = Self { pool };
        for migration in MIGRATIONS {
            selph.pool.execute(migration).await?;
        }
        Ok(selph)
    }

    /// Lazily creates the user. Returns `true` if the user is new.
    pub async fn ensure_user(
        &self,
        uid: &str,
        signup_credits: i64,
    ) -> anyhow::Result<bool> {
        let now = unix_secs(SystemTime::now())?;
        let signup_credits = signup_credits.max(0);
        let created = sqlx::query(
            "INSERT INTO users
                (uid, credits, total_credits_earned, created_at)
                VALUES (?, ?, ?, ?)
                ON CONFLICT(uid) DO NOTHING",
        )
        .bind(uid)
        .bind(signup_credits)
        .bind(signup_credits)
        .bind(now)
        .execute(&self.pool)
        .await?
        .rows_affected()
            > 0;
        if created {
            tracing::info!(uid, signup_credits, "New user.");
        }
        Ok(created)
    }

    pub async fn user(&self, uid: &str) -> anyhow::Result<Option<UserRow>> {
        let row = sqlx::query_as("SELECT * FROM users WHERE uid = ?")
            .bind(uid)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    /// Grants credits for an external payment at most once per payment id.
    pub async fn credit_payment(
        &self,
        payment: &PaymentCredit<'_>,
    ) -> anyhow::Result<PaymentOutcome> {
        anyhow::ensure!(
            payment.credits > 0,
            "Payment must grant a positive amount of credits: {payment:?}"
        );
        let now = SystemTime::now();
        let tx = self.pool.begin().await?;
        let (tx, outcome) = credit_payment(tx, payment, now).await?;
        tx.commit().await?;
        Ok(outcome)
    }

    /// Records an invocation and drops the caller's oldest records beyond
    /// `limit`.
    pub async fn record_generation(
        &self,
        generation: &NewGeneration<'_>,
        limit: u32,
    ) -> anyhow::Result<()> {
        let now = unix_secs(SystemTime::now())?;
        let output = generation.output.map(ToString::to_string);
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO generations
                (uid, reservation_id, tool_id, request_id,
                 credits, status, output, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(generation.uid)
        .bind(generation.reservation_id)
        .bind(generation.tool_id)
        .bind(generation.request_id)
        .bind(generation.credits)
        .bind(generation.status)
        .bind(output)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "DELETE FROM generations
                WHERE uid = ?
                AND id NOT IN (
                    SELECT id FROM generations
                    WHERE uid = ?
                    ORDER BY id DESC
                    LIMIT ?
                )",
        )
        .bind(generation.uid)
        .bind(generation.uid)
        .bind(i64::from(limit))
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Newest first.
    pub async fn history(
        &self,
        uid: &str,
        limit: u32,
    ) -> anyhow::Result<Vec<GenerationRow>> {
        let rows = sqlx::query_as(
            "SELECT * FROM generations
                WHERE uid = ?
                ORDER BY id DESC
                LIMIT ?",
        )
        .bind(uid)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn generation_by_reservation(
        &self,
        reservation_id: &str,
    ) -> anyhow::Result<Option<GenerationRow>> {
        let row = sqlx::query_as(
            "SELECT * FROM generations
                WHERE reservation_id = ?
                ORDER BY id DESC
                LIMIT 1",
        )
        .bind(reservation_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn insert_api_key(&self, key: &ApiKeyRow) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO api_keys
                (id, uid, name, key_hash, prefix, allowed_tools,
                 credit_limit, credits_spent, revoked, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, 0, 0, ?)",
        )
        .bind(&key.id)
        .bind(&key.uid)
        .bind(&key.name)
        .bind(&key.key_hash)
        .bind(&key.prefix)
        .bind(&key.allowed_tools)
        .bind(key.credit_limit)
        .bind(key.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Finds a live key by hash and stamps its last use.
    pub async fn api_key_by_hash(
        &self,
        key_hash: &str,
    ) -> anyhow::Result<Option<ApiKeyRow>> {
        let now = unix_secs(SystemTime::now())?;
        let row = sqlx::query_as(
            "UPDATE api_keys SET last_used_at = ?
                WHERE key_hash = ? AND revoked = 0
                RETURNING *",
        )
        .bind(now)
        .bind(key_hash)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn api_key(&self, id: &str) -> anyhow::Result<Option<ApiKeyRow>> {
        let row = sqlx::query_as("SELECT * FROM api_keys WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    pub async fn api_keys(&self, uid: &str) -> anyhow::Result<Vec<ApiKeyRow>> {
        let rows = sqlx::query_as(
            "SELECT * FROM api_keys WHERE uid = ? ORDER BY created_at, id",
        )
        .bind(uid)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Returns `false` if the user has no such live key.
    pub async fn revoke_api_key(
        &self,
        uid: &str,
        key_id: &str,
    ) -> anyhow::Result<bool> {
        let revoked = sqlx::query(
            "UPDATE api_keys SET revoked = 1
                WHERE id = ? AND uid = ? AND revoked = 0",
        )
        .bind(key_id)
        .bind(uid)
        .execute(&self.pool)
        .await?
        .rows_affected()
            > 0;
        Ok(revoked)
    }
}

pub fn unix_secs(t: SystemTime) -> anyhow::Result<i64> {
    let secs = t.duration_since(UNIX_EPOCH)?.as_secs();
    Ok(i64::try_from(secs)?)
}

async fn credit_payment<'a>(
    mut tx: Tx<'a>,
    payment: &PaymentCredit<'_>,
    now: SystemTime,
) -> anyhow::Result<(Tx<'a>, PaymentOutcome)> {
    let now = unix_secs(now)?;
    let inserted = sqlx::query(
        "INSERT INTO payments
            (payment_id, uid, source, credits, amount_cents, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(payment_id) DO NOTHING",
    )
    .bind(payment.payment_id)
    .bind(payment.uid)
    .bind(payment.source)
    .bind(payment.credits)
    .bind(payment.amount_cents)
    .bind(now)
    .execute(&mut *tx)
    .await?
    .rows_affected()
        > 0;
    if !inserted {
        return Ok((tx, PaymentOutcome::Duplicate));
    }
    let (balance,): (i64,) = sqlx::query_as(
        "INSERT INTO users
            (uid, credits, total_credits_earned, created_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(uid) DO UPDATE SET
            credits = credits + excluded.credits,
            total_credits_earned =
                total_credits_earned + excluded.total_credits_earned
            RETURNING credits",
    )
    .bind(payment.uid)
    .bind(payment.credits)
    .bind(payment.credits)
    .bind(now)
    .fetch_one(&mut *tx)
    .await?;
    Ok((tx, PaymentOutcome::Credited { balance }))
}

#[cfg(test)]
pub(crate) mod tests {
    use std::time::Duration;

    use super::*;

    /// Keeps the directory alive for as long as the storage is in use.
    pub(crate) async fn storage() -> (tempfile::TempDir, Storage) {
        let dir = tempfile::tempdir().unwrap();
        let storage =
            Storage::open(&dir.path().join("data.db"), Duration::from_secs(5))
                .await
                .unwrap();
        (dir, storage)
    }

    #[tokio::test]
    async fn ensure_user_is_lazy_and_grants_signup_credits_once() {
        let (_dir, storage) = storage().await;
        assert!(storage.user("alice").await.unwrap().is_none());

        assert!(storage.ensure_user("alice", 25).await.unwrap());
        assert!(!storage.ensure_user("alice", 25).await.unwrap());

        let user = storage.user("alice").await.unwrap().unwrap();
        assert_eq!(user.credits, 25);
        assert_eq!(user.total_credits_earned, 25);
        assert_eq!(user.total_credits_spent, 0);
    }

    #[tokio::test]
    async fn payment_is_credited_once() {
        let (_dir, storage) = storage().await;
        let payment = PaymentCredit {
            payment_id: "pi_123",
            uid: "bob",
            source: "stripe",
            credits: 500,
            amount_cents: Some(500),
        };

        let first = storage.credit_payment(&payment).await.unwrap();
        assert_eq!(first, PaymentOutcome::Credited { balance: 500 });

        let second = storage.credit_payment(&payment).await.unwrap();
        assert_eq!(second, PaymentOutcome::Duplicate);

        let user = storage.user("bob").await.unwrap().unwrap();
        assert_eq!(user.credits, 500);
        assert_eq!(user.total_credits_earned, 500);
    }

    #[tokio::test]
    async fn payment_must_be_positive() {
        let (_dir, storage) = storage().await;
        let payment = PaymentCredit {
            payment_id: "pi_0",
            uid: "bob",
            source: "stripe",
            credits: 0,
            amount_cents: None,
        };
        assert!(storage.credit_payment(&payment).await.is_err());
        assert!(storage.user("bob").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn history_is_bounded_per_user() {
        let (_dir, storage) = storage().await;
        let output = serde_json::json!({"images": [{"url": "https://x/1.png"}]});
        for i in 0..5 {
            let reservation_id = format!("r{i}");
            for uid in ["carol", "dave"] {
                let generation = NewGeneration {
                    uid,
                    reservation_id: &reservation_id,
                    tool_id: "flux-schnell",
                    request_id: Some("req"),
                    credits: 1,
                    status: GenerationStatus::Completed,
                    output: Some(&output),
                };
                storage.record_generation(&generation, 3).await.unwrap();
            }
        }

        let carol = storage.history("carol", 100).await.unwrap();
        let ids: Vec<&str> =
            carol.iter().map(|g| g.reservation_id.as_str()).collect();
        assert_eq!(ids, ["r4", "r3", "r2"]);
        assert_eq!(storage.history("dave", 100).await.unwrap().len(), 3);

        let found = storage.generation_by_reservation("r4").await.unwrap();
        let found = found.unwrap();
        assert_eq!(found.status, GenerationStatus::Completed);
        let parsed: serde_json::Value =
            serde_json::from_str(found.output.as_deref().unwrap()).unwrap();
        assert_eq!(parsed, output);
    }
}
