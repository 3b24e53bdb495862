use std::time::Duration;

use axum::{
    extract::{
        multipart::{MultipartError, MultipartRejection},
        rejection::JsonRejection,
        DefaultBodyLimit, Multipart, State,
    },
    http::{header, HeaderMap, StatusCode},
    response::{AppendHeaders, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use cookie::{time::Duration as MaxAge, Cookie, SameSite};
use tracing::{instrument, warn};

use crate::{
    auth::{
        dto::{AuthResponse, LoginRequest, MessageResponse, PublicUser, RefreshRequest, RegisterResponse},
        extractors::{cookie_value, AuthUser, ACCESS_COOKIE, REFRESH_COOKIE},
        services::{
            current_user, login_user, logout_user, refresh_session, register_user, RegisterInput,
            Session,
        },
    },
    error::{AppError, AppResult},
    media::services::{stage_file, StagedFile},
    state::AppState,
};

pub fn auth_routes() -> Router<AppState> {
    Router::new()
        .route("/register", post(register))
        .layer(DefaultBodyLimit::max(20 * 1024 * 1024)) // 20MB
        .route("/login", post(login))
        .route("/logout", post(logout))
        .route("/refresh-token", post(refresh))
}

pub fn me_routes() -> Router<AppState> {
    Router::new().route("/me", get(get_me))
}

fn auth_cookie(name: &str, value: &str, max_age: MaxAge) -> String {
    Cookie::build((name, value))
        .path("/")
        .http_only(true)
        .secure(true)
        .same_site(SameSite::Lax)
        .max_age(max_age)
        .build()
        .to_string()
}

fn ttl_cookie(name: &str, value: &str, ttl: Duration) -> String {
    auth_cookie(name, value, MaxAge::seconds(ttl.as_secs() as i64))
}

fn expired_cookie(name: &str) -> String {
    auth_cookie(name, "", MaxAge::ZERO)
}

fn session_response(state: &AppState, session: Session) -> Response {
    let cookies = AppendHeaders([
        (
            header::SET_COOKIE,
            ttl_cookie(ACCESS_COOKIE, &session.access_token, state.jwt.access_ttl),
        ),
        (
            header::SET_COOKIE,
            ttl_cookie(REFRESH_COOKIE, &session.refresh_token, state.jwt.refresh_ttl),
        ),
    ]);
    (
        StatusCode::OK,
        cookies,
        Json(AuthResponse {
            user: session.user,
            access_token: session.access_token,
            refresh_token: session.refresh_token,
        }),
    )
        .into_response()
}

fn bad_multipart(e: MultipartError) -> AppError {
    warn!(error = %e, "malformed multipart body");
    AppError::Validation(format!("Invalid multipart body: {e}"))
}

async fn keep_latest(slot: &mut Option<StagedFile>, file: StagedFile) {
    if let Some(old) = slot.replace(file) {
        old.discard().await;
    }
}

async fn read_register_form(
    state: &AppState,
    mp: &mut Multipart,
    form: &mut RegisterInput,
) -> AppResult<()> {
    while let Some(field) = mp.next_field().await.map_err(bad_multipart)? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "fullName" => form.full_name = Some(field.text().await.map_err(bad_multipart)?),
            "username" => form.username = Some(field.text().await.map_err(bad_multipart)?),
            "email" => form.email = Some(field.text().await.map_err(bad_multipart)?),
            "password" => form.password = Some(field.text().await.map_err(bad_multipart)?),
            "avatar" | "coverImage" => {
                let content_type = field
                    .content_type()
                    .unwrap_or("application/octet-stream")
                    .to_string();
                let data = field.bytes().await.map_err(bad_multipart)?;
                if data.is_empty() {
                    continue;
                }
                let staged = stage_file(&state.upload_dir(), data, &content_type).await?;
                if name == "avatar" {
                    keep_latest(&mut form.avatar, staged).await;
                } else {
                    keep_latest(&mut form.cover_image, staged).await;
                }
            }
            _ => {}
        }
    }
    Ok(())
}

/// POST /register (multipart: fullName, username, email, password, avatar, coverImage?)
#[instrument(skip(state, mp))]
pub async fn register(
    State(state): State<AppState>,
    mp: Result<Multipart, MultipartRejection>,
) -> AppResult<(StatusCode, Json<RegisterResponse>)> {
    let mut mp = mp.map_err(|e| {
        warn!(error = %e, "register body is not multipart");
        AppError::Validation(e.body_text())
    })?;
    let mut form = RegisterInput::default();
    if let Err(e) = read_register_form(&state, &mut mp, &mut form).await {
        form.discard_files().await;
        return Err(e);
    }

    let user = register_user(&state, form).await?;
    Ok((StatusCode::CREATED, Json(RegisterResponse { user })))
}

#[instrument(skip(state, payload))]
pub async fn login(
    State(state): State<AppState>,
    payload: Result<Json<LoginRequest>, JsonRejection>,
) -> AppResult<Response> {
    let Json(payload) = payload.map_err(|e| {
        warn!(error = %e, "login body rejected");
        AppError::Validation(e.body_text())
    })?;
    let session = login_user(&state, payload).await?;
    Ok(session_response(&state, session))
}

#[instrument(skip(state))]
pub async fn logout(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
) -> AppResult<impl IntoResponse> {
    logout_user(&state, user_id).await?;
    Ok((
        StatusCode::OK,
        AppendHeaders([
            (header::SET_COOKIE, expired_cookie(ACCESS_COOKIE)),
            (header::SET_COOKIE, expired_cookie(REFRESH_COOKIE)),
        ]),
        Json(MessageResponse {
            message: "User logged out",
        }),
    ))
}

/// POST /refresh-token: token from the `refreshToken` cookie, else from `{"refreshToken": ...}`.
#[instrument(skip(state, headers, body))]
pub async fn refresh(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<Response> {
    let token = match cookie_value(&headers, REFRESH_COOKIE) {
        Some(token) => Some(token),
        None if !body.is_empty() => {
            serde_json::from_slice::<RefreshRequest>(&body)
                .map_err(|_| AppError::Validation("Invalid request body".into()))?
                .refresh_token
        }
        None => None,
    };

    let session = refresh_session(&state, token).await?;
    Ok(session_response(&state, session))
}

#[instrument(skip(state))]
pub async fn get_me(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
) -> AppResult<Json<PublicUser>> {
    Ok(Json(current_user(&state, user_id).await?))
}

#[cfg(test)]
mod http_tests {
    use std::sync::Arc;

    use axum::{body::Body, http::Request};
    use http_body_util::BodyExt;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use super::*;
    use crate::{app::build_app, storage::fake::FakeStorage};

    const BOUNDARY: &str = "accounts-test-boundary";

    fn multipart(fields: &[(&str, &str)], files: &[(&str, &str)]) -> Request<Body> {
        let mut body = Vec::new();
        for (name, value) in fields {
            body.extend_from_slice(
                format!(
                    "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
                )
                .as_bytes(),
            );
        }
        for (name, content_type) in files {
            body.extend_from_slice(
                format!(
                    "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"; filename=\"{name}.png\"\r\nContent-Type: {content_type}\r\n\r\n"
                )
                .as_bytes(),
            );
            body.extend_from_slice(b"\x89PNG fake image bytes");
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());

        Request::builder()
            .method("POST")
            .uri("/register")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .unwrap()
    }

    fn ada_fields<'a>(username: &'a str, email: &'a str) -> Vec<(&'a str, &'a str)> {
        vec![
            ("fullName", "Ada Lovelace"),
            ("username", username),
            ("email", email),
            ("password", "s3cret"),
        ]
    }

    fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn send(app: &Router, req: Request<Body>) -> (StatusCode, HeaderMap, Value) {
        let res = app.clone().oneshot(req).await.unwrap();
        let status = res.status();
        let headers = res.headers().clone();
        let bytes = res.into_body().collect().await.unwrap().to_bytes();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, headers, body)
    }

    fn set_cookies(headers: &HeaderMap) -> Vec<String> {
        headers
            .get_all(header::SET_COOKIE)
            .iter()
            .map(|v| v.to_str().unwrap().to_string())
            .collect()
    }

    fn test_app() -> Router {
        build_app(AppState::fake())
    }

    async fn register_ada(app: &Router) -> Value {
        let (status, _, body) = send(
            app,
            multipart(&ada_fields("ada", "ada@x.com"), &[("avatar", "image/png")]),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED, "{body}");
        body
    }

    #[tokio::test]
    async fn register_returns_created_without_secrets() {
        let app = test_app();
        let body = register_ada(&app).await;
        assert_eq!(body["user"]["username"], "ada");
        assert_eq!(body["user"]["fullName"], "Ada Lovelace");
        let raw = body.to_string();
        assert!(!raw.contains("passwordHash"));
        assert!(!raw.contains("refreshToken"));
        assert!(!raw.contains("s3cret"));
    }

    #[tokio::test]
    async fn register_duplicate_username_conflicts() {
        let app = test_app();
        register_ada(&app).await;
        let (status, _, body) = send(
            &app,
            multipart(&ada_fields("ada", "other@x.com"), &[("avatar", "image/png")]),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["status"], 409);
    }

    #[tokio::test]
    async fn register_without_avatar_is_bad_request() {
        let app = test_app();
        let (status, _, body) = send(&app, multipart(&ada_fields("ada", "ada@x.com"), &[])).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Avatar file is required");
    }

    #[tokio::test]
    async fn register_with_missing_field_is_bad_request() {
        let app = test_app();
        let fields = vec![("fullName", "Ada Lovelace"), ("username", "ada"), ("email", "ada@x.com")];
        let (status, _, body) = send(&app, multipart(&fields, &[("avatar", "image/png")])).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "All fields are required");
    }

    #[tokio::test]
    async fn register_avatar_upload_failure_is_bad_request() {
        let app = build_app(AppState::fake_with_storage(Arc::new(FakeStorage::failing())));
        let (status, _, _) = send(
            &app,
            multipart(&ada_fields("ada", "ada@x.com"), &[("avatar", "image/png")]),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn login_sets_cookies_and_returns_tokens() {
        let app = test_app();
        register_ada(&app).await;

        let (status, headers, body) = send(
            &app,
            json_request(
                "POST",
                "/login",
                json!({"username": "ada", "email": "ada@x.com", "password": "s3cret"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let access = body["accessToken"].as_str().unwrap();
        let refresh = body["refreshToken"].as_str().unwrap();
        assert!(!access.is_empty());
        assert!(!refresh.is_empty());
        assert_ne!(access, refresh);
        assert_eq!(body["user"]["username"], "ada");
        assert!(body["user"].get("refreshToken").is_none());

        let cookies = set_cookies(&headers);
        assert_eq!(cookies.len(), 2);
        assert!(cookies.iter().any(|c| c.starts_with(&format!("accessToken={access};"))));
        assert!(cookies.iter().any(|c| c.starts_with(&format!("refreshToken={refresh};"))));
        assert!(cookies.iter().all(|c| c.contains("HttpOnly") && c.contains("Secure")));
    }

    #[tokio::test]
    async fn login_wrong_password_sets_no_cookies() {
        let app = test_app();
        register_ada(&app).await;
        let (status, headers, body) = send(
            &app,
            json_request(
                "POST",
                "/login",
                json!({"username": "ada", "email": "ada@x.com", "password": "wrong"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(set_cookies(&headers).is_empty());
        assert!(body.get("accessToken").is_none());
    }

    #[tokio::test]
    async fn login_unknown_user_is_not_found() {
        let app = test_app();
        let (status, _, _) = send(
            &app,
            json_request(
                "POST",
                "/login",
                json!({"username": "ghost", "email": "ghost@x.com", "password": "x"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn me_refresh_and_logout_round() {
        let app = test_app();
        register_ada(&app).await;
        let (_, _, login) = send(
            &app,
            json_request(
                "POST",
                "/login",
                json!({"username": "ada", "email": "ada@x.com", "password": "s3cret"}),
            ),
        )
        .await;
        let access = login["accessToken"].as_str().unwrap().to_string();
        let refresh = login["refreshToken"].as_str().unwrap().to_string();

        let me = Request::builder()
            .uri("/me")
            .header(header::COOKIE, format!("accessToken={access}"))
            .body(Body::empty())
            .unwrap();
        let (status, _, body) = send(&app, me).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["email"], "ada@x.com");

        let rotate = Request::builder()
            .method("POST")
            .uri("/refresh-token")
            .header(header::COOKIE, format!("refreshToken={refresh}"))
            .body(Body::empty())
            .unwrap();
        let (status, headers, rotated) = send(&app, rotate).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(set_cookies(&headers).len(), 2);
        let new_access = rotated["accessToken"].as_str().unwrap().to_string();
        assert_ne!(rotated["refreshToken"].as_str().unwrap(), refresh);

        let logout = Request::builder()
            .method("POST")
            .uri("/logout")
            .header(header::AUTHORIZATION, format!("Bearer {new_access}"))
            .body(Body::empty())
            .unwrap();
        let (status, headers, body) = send(&app, logout).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["message"], "User logged out");
        let cookies = set_cookies(&headers);
        assert_eq!(cookies.len(), 2);
        assert!(cookies.iter().all(|c| c.contains("Max-Age=0")));

        let replay = json_request(
            "POST",
            "/refresh-token",
            json!({"refreshToken": rotated["refreshToken"].clone()}),
        );
        let (status, _, _) = send(&app, replay).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn logout_requires_authentication() {
        let app = test_app();
        let req = Request::builder()
            .method("POST")
            .uri("/logout")
            .body(Body::empty())
            .unwrap();
        let (status, _, _) = send(&app, req).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn register_cover_failure_still_creates_user() {
        let storage = Arc::new(FakeStorage::failing_under("covers/"));
        let app = build_app(AppState::fake_with_storage(storage));
        let (status, _, body) = send(
            &app,
            multipart(
                &ada_fields("ada", "ada@x.com"),
                &[("avatar", "image/png"), ("coverImage", "image/png")],
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED, "{body}");
        assert!(body["user"]["avatarUrl"].as_str().is_some());
        assert!(body["user"].get("coverImageUrl").is_none());
    }

    #[tokio::test]
    async fn register_non_multipart_body_is_structured_error() {
        let app = test_app();
        let (status, _, body) = send(
            &app,
            json_request("POST", "/register", json!({"username": "ada"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["status"], 400);
        assert!(body["error"].as_str().is_some_and(|e| !e.is_empty()));
    }

    #[tokio::test]
    async fn login_malformed_json_is_structured_error() {
        let app = test_app();
        let req = Request::builder()
            .method("POST")
            .uri("/login")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from("{not json"))
            .unwrap();
        let (status, headers, body) = send(&app, req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["status"], 400);
        assert!(body["error"].as_str().is_some_and(|e| !e.is_empty()));
        assert!(set_cookies(&headers).is_empty());
    }

    #[tokio::test]
    async fn login_without_content_type_is_structured_error() {
        let app = test_app();
        let req = Request::builder()
            .method("POST")
            .uri("/login")
            .body(Body::from(r#"{"username":"ada"}"#))
            .unwrap();
        let (status, _, body) = send(&app, req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["status"], 400);
    }

    #[test]
    fn cookies_carry_security_attributes() {
        let cookie = ttl_cookie(ACCESS_COOKIE, "abc", Duration::from_secs(300));
        assert!(cookie.starts_with("accessToken=abc;"));
        for attr in ["HttpOnly", "Secure", "SameSite=Lax", "Path=/", "Max-Age=300"] {
            assert!(cookie.contains(attr), "{cookie} lacks {attr}");
        }
        let expired = expired_cookie(REFRESH_COOKIE);
        assert!(expired.starts_with("refreshToken=;"));
        assert!(expired.contains("Max-Age=0"));
    }
}
