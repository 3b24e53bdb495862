use async_trait::async_trait;
use sqlx::PgPool;
use tracing::debug;
use uuid::Uuid;

use crate::{
    auth::repo_types::{NewUserRecord, User, UserChanges},
    error::{AppError, AppResult},
    state::AppState,
};

/// Persistence for user records. Implementations enforce uniqueness of
/// `username` and `email` and report a violation as [`AppError::Conflict`].
#[async_trait]
pub trait UserStore: Send + Sync {
    /// Insert and return the stored row in one step.
    async fn insert(&self, user: NewUserRecord) -> AppResult<User>;
    async fn find_by_username_or_email(&self, username: &str, email: &str)
        -> AppResult<Option<User>>;
    async fn find_by_id(&self, id: Uuid) -> AppResult<Option<User>>;
    /// Apply `changes`, bump `updated_at` and return the updated row.
    async fn update(&self, id: Uuid, changes: UserChanges) -> AppResult<Option<User>>;
}

/// Lowercased, trimmed form used for usernames and emails.
pub fn normalize_identity(value: &str) -> String {
    value.trim().to_lowercase()
}

/// Input for account creation. `password` is plaintext; it is hashed here and nowhere else.
#[derive(Debug, Clone)]
pub struct NewUser {
    pub full_name: String,
    pub username: String,
    pub email: String,
    pub password: String,
    pub avatar_url: String,
    pub cover_image_url: Option<String>,
}

/// A mutation of an existing user. The hash is recomputed only when `password` is set.
#[derive(Debug, Clone, Default)]
pub struct UserUpdate {
    pub full_name: Option<String>,
    pub password: Option<String>,
    pub refresh_token: Option<Option<String>>,
}

pub async fn create_user(st: &AppState, new: NewUser) -> AppResult<User> {
    let password_hash = st.hasher.hash(&new.password)?;
    let record = NewUserRecord {
        id: Uuid::new_v4(),
        username: normalize_identity(&new.username),
        email: normalize_identity(&new.email),
        full_name: new.full_name.trim().to_string(),
        password_hash,
        avatar_url: new.avatar_url,
        cover_image_url: new.cover_image_url,
    };
    st.users.insert(record).await
}

pub async fn save_user(st: &AppState, id: Uuid, update: UserUpdate) -> AppResult<User> {
    let password_hash = match update.password.as_deref() {
        Some(plain) => {
            debug!(user_id = %id, "password changed; rehashing");
            Some(st.hasher.hash(plain)?)
        }
        None => None,
    };
    let changes = UserChanges {
        full_name: update.full_name.map(|n| n.trim().to_string()),
        password_hash,
        refresh_token: update.refresh_token,
    };
    st.users
        .update(id, changes)
        .await?
        .ok_or_else(|| AppError::NotFound("user not found".into()))
}

#[derive(Clone)]
pub struct PgUserStore {
    db: PgPool,
}

impl PgUserStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

fn map_insert_error(e: sqlx::Error) -> AppError {
    match e {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            AppError::Conflict("User already exists".into())
        }
        other => AppError::Database(other),
    }
}

#[async_trait]
impl UserStore for PgUserStore {
    async fn insert(&self, user: NewUserRecord) -> AppResult<User> {
        let row = sqlx::query_as::<_, User>(
            r#"
            INSERT INTO users (id, username, email, full_name, password_hash, avatar_url, cover_image_url)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING id, username, email, full_name, password_hash, avatar_url,
                      cover_image_url, refresh_token, watch_history, created_at, updated_at
            "#,
        )
        .bind(user.id)
        .bind(&user.username)
        .bind(&user.email)
        .bind(&user.full_name)
        .bind(&user.password_hash)
        .bind(&user.avatar_url)
        .bind(&user.cover_image_url)
        .fetch_one(&self.db)
        .await
        .map_err(map_insert_error)?;
        Ok(row)
    }

    async fn find_by_username_or_email(
        &self,
        username: &str,
        email: &str,
    ) -> AppResult<Option<User>> {
        let row = sqlx::query_as::<_, User>(
            r#"
            SELECT id, username, email, full_name, password_hash, avatar_url,
                   cover_image_url, refresh_token, watch_history, created_at, updated_at
            FROM users
            WHERE username = $1 OR email = $2
            LIMIT 1
            "#,
        )
        .bind(username)
        .bind(email)
        .fetch_optional(&self.db)
        .await?;
        Ok(row)
    }

    async fn find_by_id(&self, id: Uuid) -> AppResult<Option<User>> {
        let row = sqlx::query_as::<_, User>(
            r#"
            SELECT id, username, email, full_name, password_hash, avatar_url,
                   cover_image_url, refresh_token, watch_history, created_at, updated_at
            FROM users
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.db)
        .await?;
        Ok(row)
    }

    async fn update(&self, id: Uuid, changes: UserChanges) -> AppResult<Option<User>> {
        let (set_token, token) = match changes.refresh_token {
            Some(t) => (true, t),
            None => (false, None),
        };
        let row = sqlx::query_as::<_, User>(
            r#"
            UPDATE users
            SET full_name     = COALESCE($2, full_name),
                password_hash = COALESCE($3, password_hash),
                refresh_token = CASE WHEN $4 THEN $5 ELSE refresh_token END,
                updated_at    = now()
            WHERE id = $1
            RETURNING id, username, email, full_name, password_hash, avatar_url,
                      cover_image_url, refresh_token, watch_history, created_at, updated_at
            "#,
        )
        .bind(id)
        .bind(changes.full_name)
        .bind(changes.password_hash)
        .bind(set_token)
        .bind(token)
        .fetch_optional(&self.db)
        .await?;
        Ok(row)
    }
}
