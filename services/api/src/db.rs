//! Data Access Layer
//!
//! SQLite persistence for sessions and user profiles. `Db` implements both
//! [`SessionStore`] and [`ProfileStore`], so the orchestrator can be pointed
//! at it directly. Each write replaces its row; the last write wins.

use anyhow::{Context, Result};
use assessor_core::session::{ProfileStore, ProgressRecord, ProgressStatus, Session, SessionStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;

/// A wrapper around the `SqlitePool` to provide a clear data access interface.
#[derive(Clone)]
pub struct Db {
    pool: SqlitePool,
}

#[derive(sqlx::FromRow)]
struct ProgressRow {
    skill: String,
    module_id: String,
    status: String,
    updated_at: DateTime<Utc>,
}

impl Db {
    /// Creates a new `Db` instance.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Opens a pool for `database_url`.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .with_context(|| format!("Failed to connect to database at {database_url}"))?;
        Ok(Self::new(pool))
    }

    /// Runs all pending `sqlx` migrations.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl SessionStore for Db {
    async fn load(&self, key: &str) -> Result<Option<Session>> {
        let state_json: Option<String> =
            sqlx::query_scalar("SELECT state_json FROM sessions WHERE session_key = ?")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;

        state_json
            .map(|json| {
                serde_json::from_str::<Session>(&json)
                    .with_context(|| format!("Stored state for session '{key}' is not readable"))
            })
            .transpose()
    }

    async fn save(&self, session: &Session) -> Result<()> {
        let state_json = serde_json::to_string(session)?;
        sqlx::query(
            r#"
            INSERT INTO sessions (session_key, user_id, state_json, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (session_key) DO UPDATE
            SET user_id = excluded.user_id,
                state_json = excluded.state_json,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&session.key)
        .bind(&session.user_id)
        .bind(state_json)
        .bind(session.created_at)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl ProfileStore for Db {
    async fn load_role(&self, user_id: &str) -> Result<Option<String>> {
        let role: Option<Option<String>> =
            sqlx::query_scalar("SELECT role FROM users WHERE user_id = ?")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(role.flatten())
    }

    async fn save_role(&self, user_id: &str, role: &str) -> Result<()> {
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO users (user_id, role, created_at, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (user_id) DO UPDATE
            SET role = excluded.role, updated_at = excluded.updated_at
            "#,
        )
        .bind(user_id)
        .bind(role)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_progress(&self, user_id: &str) -> Result<Vec<ProgressRecord>> {
        let rows = sqlx::query_as::<_, ProgressRow>(
            r#"
            SELECT skill, module_id, status, updated_at
            FROM user_progress
            WHERE user_id = ?
            ORDER BY updated_at ASC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let status = row
                    .status
                    .parse::<ProgressStatus>()
                    .with_context(|| format!("Bad progress status for '{}'", row.skill))?;
                Ok(ProgressRecord {
                    skill: row.skill,
                    module_id: row.module_id,
                    status,
                    updated_at: row.updated_at,
                })
            })
            .collect()
    }

    async fn save_progress(&self, user_id: &str, record: &ProgressRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO user_progress (user_id, skill, module_id, status, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (user_id, skill, module_id) DO UPDATE
            SET status = excluded.status, updated_at = excluded.updated_at
            "#,
        )
        .bind(user_id)
        .bind(&record.skill)
        .bind(&record.module_id)
        .bind(record.status.as_str())
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
