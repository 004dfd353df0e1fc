//! The `users` record store backing the cache demo.
//!
//! Reads and writes go through a `deadpool-postgres` pool. The table and its
//! change trigger live in `sql/users.sql`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use pgmux_cache::{BoxError, Keyer, Loader};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_postgres::{NoTls, Row};
use tracing::debug;
use uuid::Uuid;

const COLUMNS: &str = "id, first_name, last_name, email, created_at, updated_at";

/// Errors from the record store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The connection string could not be parsed.
    #[error("invalid connection string: {0}")]
    Config(#[source] tokio_postgres::Error),

    /// The pool could not be created.
    #[error("pool creation failed: {0}")]
    Build(#[from] deadpool_postgres::BuildError),

    /// No connection could be checked out.
    #[error("pool get failed: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),

    /// Query failure.
    #[error("query failed: {0}")]
    Query(#[from] tokio_postgres::Error),

    /// No row with that id.
    #[error("user {0} not found")]
    NotFound(Uuid),
}

/// One row of `users`.
///
/// Missing fields take their defaults so that DELETE envelopes, which carry
/// only the key, still decode.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct User {
    /// Primary key.
    pub id: Uuid,
    /// Given name.
    pub first_name: String,
    /// Family name.
    pub last_name: String,
    /// Contact address.
    pub email: String,
    /// Insertion time.
    pub created_at: DateTime<Utc>,
    /// Last update, if any.
    pub updated_at: Option<DateTime<Utc>>,
}

impl Keyer for User {
    type Key = Uuid;

    fn key(&self) -> Uuid {
        self.id
    }
}

impl TryFrom<&Row> for User {
    type Error = tokio_postgres::Error;

    fn try_from(row: &Row) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            first_name: row.try_get("first_name")?,
            last_name: row.try_get("last_name")?,
            email: row.try_get("email")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

/// Fields for a new user.
#[derive(Clone, Debug)]
pub struct NewUser {
    /// Given name.
    pub first_name: String,
    /// Family name.
    pub last_name: String,
    /// Contact address.
    pub email: String,
}

/// Pooled access to `users`.
#[derive(Clone)]
pub struct UserStore {
    pool: Pool,
}

impl UserStore {
    /// Build a pool for `url`. No connection is made until first use.
    pub fn connect(url: &str, max_pool_size: usize) -> Result<Self, StoreError> {
        let pg_config: tokio_postgres::Config = url.parse().map_err(StoreError::Config)?;
        let mgr_config = ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        };
        let mgr = Manager::from_config(pg_config, NoTls, mgr_config);
        let pool = Pool::builder(mgr).max_size(max_pool_size).build()?;
        Ok(Self { pool })
    }

    /// Fetch one user.
    pub async fn by_id(&self, id: Uuid) -> Result<User, StoreError> {
        debug!(%id, "fetching user from database");
        let client = self.pool.get().await?;
        let sql = format!("SELECT {COLUMNS} FROM users WHERE id = $1");
        let row = client
            .query_opt(&sql, &[&id])
            .await?
            .ok_or(StoreError::NotFound(id))?;
        Ok(User::try_from(&row)?)
    }

    /// Insert a user and return the stored row.
    pub async fn create(&self, user: &NewUser) -> Result<User, StoreError> {
        let client = self.pool.get().await?;
        let sql = format!(
            "INSERT INTO users (first_name, last_name, email, updated_at) \
             VALUES ($1, $2, $3, CURRENT_TIMESTAMP) RETURNING {COLUMNS}"
        );
        let row = client
            .query_one(&sql, &[&user.first_name, &user.last_name, &user.email])
            .await?;
        Ok(User::try_from(&row)?)
    }

    /// Change a user's email and return the updated row.
    pub async fn update_email(&self, id: Uuid, email: &str) -> Result<User, StoreError> {
        let client = self.pool.get().await?;
        let sql = format!(
            "UPDATE users SET email = $1, updated_at = CURRENT_TIMESTAMP \
             WHERE id = $2 RETURNING {COLUMNS}"
        );
        let row = client
            .query_opt(&sql, &[&email, &id])
            .await?
            .ok_or(StoreError::NotFound(id))?;
        Ok(User::try_from(&row)?)
    }
}

#[async_trait]
impl Loader<User> for UserStore {
    async fn load(&self, key: &Uuid) -> Result<User, BoxError> {
        Ok(self.by_id(*key).await?)
    }
}

#[cfg(test)]
mod tests {
    use pgmux_cache::{ChangeAction, ChangeEnvelope};

    use super::*;

    const ID: &str = "011bf3b5-7496-4e46-a93a-339781b12a94";

    #[test]
    fn key_is_id() {
        let user = User {
            id: Uuid::parse_str(ID).unwrap(),
            ..User::default()
        };
        assert_eq!(user.key().to_string(), ID);
    }

    #[test]
    fn decodes_trigger_update() {
        let payload = format!(
            r#"{{"table":"users","action":"UPDATE","data":{{"id":"{ID}","first_name":"Ada",
            "last_name":"Lovelace","email":"ada@example.com",
            "created_at":"2024-03-01T10:00:00.123456+00:00",
            "updated_at":"2024-03-02T11:30:00+00:00"}}}}"#
        );
        let env: ChangeEnvelope<User> = serde_json::from_str(&payload).unwrap();
        assert_eq!(env.action, ChangeAction::Update);
        assert_eq!(env.data.email, "ada@example.com");
        assert!(env.data.updated_at.is_some());
    }

    #[test]
    fn decodes_delete_with_only_id() {
        let payload = format!(r#"{{"table":"users","action":"DELETE","data":{{"id":"{ID}"}}}}"#);
        let env: ChangeEnvelope<User> = serde_json::from_str(&payload).unwrap();
        assert_eq!(env.action, ChangeAction::Delete);
        assert_eq!(env.data.key().to_string(), ID);
        assert!(env.data.email.is_empty());
    }

    #[test]
    fn serializes_snake_case_fields() {
        let value = serde_json::to_value(User::default()).unwrap();
        assert!(value.get("first_name").is_some());
        assert!(value.get("updated_at").is_some());
    }

    #[test]
    fn connect_rejects_bad_url() {
        assert!(matches!(
            UserStore::connect("host=localhost port=notaport", 4),
            Err(StoreError::Config(_))
        ));
    }

    #[tokio::test]
    async fn connect_is_lazy() {
        let store = UserStore::connect("postgres://app@localhost:1/app", 1).unwrap();
        assert_eq!(store.pool.status().size, 0);
    }
}
