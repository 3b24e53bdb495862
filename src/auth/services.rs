use lazy_static::lazy_static;
use regex::Regex;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::{
    auth::{
        dto::{LoginRequest, PublicUser},
        repo::{create_user, normalize_identity, save_user, NewUser, UserUpdate},
        repo_types::User,
    },
    error::{AppError, AppResult},
    media::services::{remove_stored, upload_optional, upload_staged, StagedFile},
    state::AppState,
};

pub(crate) fn is_valid_email(email: &str) -> bool {
    lazy_static! {
        static ref EMAIL_RE: Regex =
            Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("email regex is valid");
    }
    EMAIL_RE.is_match(email)
}

/// Registration form after multipart parsing. Text fields are raw; files are already staged locally.
#[derive(Debug, Default)]
pub struct RegisterInput {
    pub full_name: Option<String>,
    pub username: Option<String>,
    pub email: Option<String>,
    pub password: Option<String>,
    pub avatar: Option<StagedFile>,
    pub cover_image: Option<StagedFile>,
}

impl RegisterInput {
    pub async fn discard_files(self) {
        discard(self.avatar).await;
        discard(self.cover_image).await;
    }
}

/// Tokens plus the sanitized user, produced by login and refresh.
#[derive(Debug)]
pub struct Session {
    pub user: PublicUser,
    pub access_token: String,
    pub refresh_token: String,
}

struct AccountFields {
    full_name: String,
    username: String,
    email: String,
    password: String,
}

async fn discard(file: Option<StagedFile>) {
    if let Some(file) = file {
        file.discard().await;
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

async fn check_new_account(
    st: &AppState,
    full_name: Option<String>,
    username: Option<String>,
    email: Option<String>,
    password: Option<String>,
) -> AppResult<AccountFields> {
    let (Some(full_name), Some(username), Some(email), Some(password)) = (
        non_empty(full_name),
        non_empty(username),
        non_empty(email),
        non_empty(password),
    ) else {
        warn!("registration with missing fields");
        return Err(AppError::Validation("All fields are required".into()));
    };

    let username = normalize_identity(&username);
    let email = normalize_identity(&email);
    if !is_valid_email(&email) {
        warn!(email = %email, "invalid email");
        return Err(AppError::Validation("Invalid email".into()));
    }

    if st
        .users
        .find_by_username_or_email(&username, &email)
        .await?
        .is_some()
    {
        warn!(username = %username, email = %email, "user already exists");
        return Err(AppError::Conflict("User already exists".into()));
    }

    Ok(AccountFields {
        full_name,
        username,
        email,
        password,
    })
}

/// Validate, upload media and create the account. Staged files are removed on every path.
pub async fn register_user(st: &AppState, input: RegisterInput) -> AppResult<PublicUser> {
    let RegisterInput {
        full_name,
        username,
        email,
        password,
        avatar,
        cover_image,
    } = input;

    let fields = match check_new_account(st, full_name, username, email, password).await {
        Ok(fields) => fields,
        Err(e) => {
            discard(avatar).await;
            discard(cover_image).await;
            return Err(e);
        }
    };

    let Some(avatar) = avatar else {
        warn!(username = %fields.username, "avatar missing");
        discard(cover_image).await;
        return Err(AppError::Validation("Avatar file is required".into()));
    };

    let avatar = match upload_staged(st, "avatars", avatar).await {
        Ok(obj) => obj,
        Err(e) => {
            error!(error = ?e, username = %fields.username, "avatar upload failed");
            discard(cover_image).await;
            return Err(AppError::Upload("Error uploading avatar".into()));
        }
    };

    let cover = upload_optional(st, "covers", cover_image).await;

    let created = create_user(
        st,
        NewUser {
            full_name: fields.full_name,
            username: fields.username,
            email: fields.email,
            password: fields.password,
            avatar_url: avatar.url.clone(),
            cover_image_url: cover.url(),
        },
    )
    .await;

    // Nothing references the uploads if the insert lost a race or failed.
    let user = match created {
        Ok(user) => user,
        Err(e) => {
            remove_stored(st, std::iter::once(avatar).chain(cover.into_object())).await;
            return Err(e);
        }
    };

    info!(user_id = %user.id, username = %user.username, "user registered");
    Ok(user.into())
}

pub async fn login_user(st: &AppState, req: LoginRequest) -> AppResult<Session> {
    let (Some(email), Some(username)) = (non_empty(req.email), non_empty(req.username)) else {
        warn!("login without username or email");
        return Err(AppError::Validation("username and email are required".into()));
    };
    let email = normalize_identity(&email);
    let username = normalize_identity(&username);

    let user = st
        .users
        .find_by_username_or_email(&username, &email)
        .await?
        .ok_or_else(|| {
            warn!(username = %username, email = %email, "login unknown user");
            AppError::NotFound("User not found".into())
        })?;

    let password = req.password.unwrap_or_default();
    if !st.hasher.verify(&password, &user.password_hash)? {
        warn!(user_id = %user.id, "login invalid password");
        return Err(AppError::Unauthorized("Invalid credentials".into()));
    }

    let session = issue_session(st, &user).await?;
    info!(user_id = %user.id, "user logged in");
    Ok(session)
}

/// Sign a fresh token pair and make the refresh token the only one tracked for `user`.
async fn issue_session(st: &AppState, user: &User) -> AppResult<Session> {
    let access_token = st.jwt.sign_access(user).map_err(|e| {
        error!(error = %e, user_id = %user.id, "jwt sign access failed");
        AppError::Internal(e.context("generating access token"))
    })?;
    let refresh_token = st.jwt.sign_refresh(user.id).map_err(|e| {
        error!(error = %e, user_id = %user.id, "jwt sign refresh failed");
        AppError::Internal(e.context("generating refresh token"))
    })?;

    let saved = save_user(
        st,
        user.id,
        UserUpdate {
            refresh_token: Some(Some(refresh_token.clone())),
            ..Default::default()
        },
    )
    .await?;

    Ok(Session {
        user: saved.into(),
        access_token,
        refresh_token,
    })
}

pub async fn logout_user(st: &AppState, user_id: Uuid) -> AppResult<()> {
    save_user(
        st,
        user_id,
        UserUpdate {
            refresh_token: Some(None),
            ..Default::default()
        },
    )
    .await?;
    info!(user_id = %user_id, "user logged out");
    Ok(())
}

/// Rotate a refresh token. Only the most recently issued token is accepted.
pub async fn refresh_session(st: &AppState, token: Option<String>) -> AppResult<Session> {
    let token = non_empty(token).ok_or_else(|| AppError::Unauthorized("Unauthorized request".into()))?;

    let claims = st.jwt.verify_refresh(&token).map_err(|e| {
        warn!(error = %e, "invalid refresh token");
        AppError::Unauthorized("Invalid refresh token".into())
    })?;

    let user = st
        .users
        .find_by_id(claims.sub)
        .await?
        .ok_or_else(|| AppError::Unauthorized("Invalid refresh token".into()))?;

    if user.refresh_token.as_deref() != Some(token.as_str()) {
        warn!(user_id = %user.id, "stale refresh token presented");
        return Err(AppError::Unauthorized("Refresh token is expired or used".into()));
    }

    issue_session(st, &user).await
}

pub async fn current_user(st: &AppState, user_id: Uuid) -> AppResult<PublicUser> {
    st.users
        .find_by_id(user_id)
        .await?
        .map(PublicUser::from)
        .ok_or_else(|| AppError::NotFound("User not found".into()))
}
