use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

/// User record in the database.
#[derive(Debug, Clone, FromRow)]
pub struct User {
    pub id: Uuid,
    pub username: String,             // unique, lowercase
    pub email: String,                // unique, lowercase
    pub full_name: String,
    pub password_hash: String,        // Argon2 PHC string, never sent to clients
    pub avatar_url: String,
    pub cover_image_url: Option<String>,
    pub refresh_token: Option<String>, // latest issued refresh token
    pub watch_history: Vec<Uuid>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

/// Row handed to a [`UserStore`](super::repo::UserStore) for insertion; the password is already hashed.
#[derive(Debug, Clone)]
pub struct NewUserRecord {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    pub full_name: String,
    pub password_hash: String,
    pub avatar_url: String,
    pub cover_image_url: Option<String>,
}

/// Column-level changes for an update. `None` leaves the column as is.
#[derive(Debug, Clone, Default)]
pub struct UserChanges {
    pub full_name: Option<String>,
    pub password_hash: Option<String>,
    /// `Some(None)` clears the stored token.
    pub refresh_token: Option<Option<String>>,
}

#[cfg(test)]
impl User {
    pub fn sample(username: &str, email: &str) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            id: Uuid::new_v4(),
            username: username.into(),
            email: email.into(),
            full_name: "Sample User".into(),
            password_hash: "$argon2id$placeholder".into(),
            avatar_url: "https://fake.local/avatars/a.png".into(),
            cover_image_url: None,
            refresh_token: None,
            watch_history: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }
}
