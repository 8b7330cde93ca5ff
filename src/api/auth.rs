use crate::api::error::ApiError;
use crate::schema::users;
use crate::tables::{NewUser, RevokedToken, User};
use crate::AUTH_API;
use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::SaltString;
use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier};
use axum::async_trait;
use axum::extract::{FromRequestParts, State};
use axum::http::request::Parts;
use axum::http::{header, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use chrono::{Duration, Utc};
use diesel::prelude::*;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::state::AppState;
use super::AppJson;

pub const ACCESS_COOKIE: &str = "access_token";
pub const REFRESH_COOKIE: &str = "refresh_token";

const TOKEN_ACCESS: &str = "access";
const TOKEN_REFRESH: &str = "refresh";

/// JWT signing material plus token lifetimes, shared through `AppState`.
pub struct AuthKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
    pub access_ttl: Duration,
    pub refresh_ttl: Duration,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: i32,
    pub username: String,
    pub token_type: String,
    pub jti: String,
    pub iat: usize,
    pub exp: usize,
}

#[derive(Debug, Serialize)]
pub struct TokenPair {
    pub access: String,
    pub refresh: String,
}

impl AuthKeys {
    pub fn new(secret: &str, access_ttl: Duration, refresh_ttl: Duration) -> AuthKeys {
        AuthKeys {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            access_ttl,
            refresh_ttl,
        }
    }

    pub fn issue_pair(&self, user: &User) -> Result<TokenPair, ApiError> {
        Ok(TokenPair {
            access: self.sign(user, TOKEN_ACCESS, self.access_ttl)?,
            refresh: self.sign(user, TOKEN_REFRESH, self.refresh_ttl)?,
        })
    }

    pub fn issue_access(&self, user: &User) -> Result<String, ApiError> {
        self.sign(user, TOKEN_ACCESS, self.access_ttl)
    }

    fn sign(&self, user: &User, kind: &str, ttl: Duration) -> Result<String, ApiError> {
        let now = Utc::now();
        let claims = Claims {
            sub: user.id,
            username: user.username.clone(),
            token_type: kind.to_string(),
            jti: Uuid::new_v4().to_string(),
            iat: now.timestamp() as usize,
            exp: (now + ttl).timestamp() as usize,
        };
        encode(&Header::default(), &claims, &self.encoding).map_err(|_| ApiError::Internal)
    }

    /// Checks signature and expiry, then that the token is of the expected
    /// kind so an access token cannot be replayed as a refresh token.
    pub fn verify(&self, token: &str, kind: &str) -> Result<Claims, ApiError> {
        let data = decode::<Claims>(token, &self.decoding, &Validation::default())
            .map_err(|_| ApiError::unauthorized("Given token not valid for any token type"))?;
        if data.claims.token_type != kind {
            return Err(ApiError::unauthorized("Token has wrong type"));
        }
        Ok(data.claims)
    }
}

pub fn hash_password(password: &str) -> Result<String, ApiError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|_| ApiError::Internal)
}

pub fn verify_password(password: &str, hash: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(hash) else {
        return false;
    };
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok()
}

/// Minimum length, not all digits, and not too similar to the username or
/// the local part of the email address.
pub fn validate_password_strength(
    password: &str,
    username: &str,
    email: &str,
) -> Result<(), ApiError> {
    if password.chars().count() < 8 {
        return Err(ApiError::field(
            "password",
            "This password is too short. It must contain at least 8 characters.",
        ));
    }
    if password.chars().all(|c| c.is_ascii_digit()) {
        return Err(ApiError::field(
            "password",
            "This password is entirely numeric.",
        ));
    }
    let lowered = password.to_lowercase();
    let local_part = email.split('@').next().unwrap_or("");
    for (candidate, label) in [(username, "username"), (local_part, "email")] {
        let candidate = candidate.to_lowercase();
        if candidate.chars().count() >= 4
            && (lowered.contains(&candidate) || candidate.contains(&lowered))
        {
            return Err(ApiError::field(
                "password",
                format!("The password is too similar to the {label}."),
            ));
        }
    }
    Ok(())
}

fn well_formed_email(value: &str) -> bool {
    let Some((local, domain)) = value.rsplit_once('@') else {
        return false;
    };
    !local.is_empty()
        && !domain.is_empty()
        && domain.contains('.')
        && !domain.starts_with('.')
        && !domain.ends_with('.')
}

/// Validates and stores a new account. Shared by the register endpoint and
/// the `create-user` CLI command.
pub fn create_user(
    conn: &mut PgConnection,
    username: &str,
    email: &str,
    password: &str,
    first_name: &str,
    last_name: &str,
    is_staff: bool,
) -> Result<User, ApiError> {
    let username = username.trim();
    let email = email.trim();

    if username.is_empty() {
        return Err(ApiError::field("username", "This field may not be blank."));
    }
    if username.chars().count() > 150 {
        return Err(ApiError::field(
            "username",
            "Ensure this field has no more than 150 characters.",
        ));
    }
    if !username
        .chars()
        .all(|c| c.is_alphanumeric() || "@.+-_".contains(c))
    {
        return Err(ApiError::field(
            "username",
            "Enter a valid username. This value may contain only letters, numbers, and @/./+/-/_ characters.",
        ));
    }
    if email.is_empty() {
        return Err(ApiError::field("email", "This field may not be blank."));
    }
    if email.chars().count() > 254 || !well_formed_email(email) {
        return Err(ApiError::field("email", "Enter a valid email address."));
    }
    validate_password_strength(password, username, email)?;

    // Friendly duplicate checks; the unique indexes stay authoritative
    // for concurrent registrations.
    if User::username_taken(conn, username)? {
        return Err(ApiError::field(
            "username",
            "A user with that username already exists.",
        ));
    }
    if User::email_taken(conn, email)? {
        return Err(ApiError::field(
            "email",
            "A user with this email already exists.",
        ));
    }

    let password_hash = hash_password(password)?;
    let user = diesel::insert_into(users::table)
        .values(&NewUser {
            username,
            email,
            password_hash: &password_hash,
            first_name: first_name.trim(),
            last_name: last_name.trim(),
            is_staff,
            date_joined: Utc::now().naive_utc(),
        })
        .returning(User::as_select())
        .get_result::<User>(conn)?;

    Ok(user)
}

// Request/Response types

#[derive(Deserialize)]
pub struct RegisterRequest {
    pub username: String,
    pub email: String,
    pub password: String,
    pub password_confirm: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
}

#[derive(Debug, Serialize)]
pub struct UserResponse {
    pub id: i32,
    pub username: String,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub is_staff: bool,
    pub date_joined: chrono::NaiveDateTime,
}

impl From<User> for UserResponse {
    fn from(user: User) -> Self {
        UserResponse {
            id: user.id,
            username: user.username,
            email: user.email,
            first_name: user.first_name,
            last_name: user.last_name,
            is_staff: user.is_staff,
            date_joined: user.date_joined,
        }
    }
}

#[derive(Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Default, Deserialize)]
pub struct RefreshRequest {
    #[serde(default)]
    pub refresh: Option<String>,
}

#[derive(Serialize)]
pub struct AccessToken {
    pub access: String,
}

fn bad_credentials() -> ApiError {
    ApiError::unauthorized("No active account found with the given credentials")
}

/// HTTP-only cookie whose lifetime matches the token it carries.
fn auth_cookie(name: &'static str, value: &str, ttl: Duration) -> Cookie<'static> {
    Cookie::build((name, value.to_string()))
        .path("/")
        .http_only(true)
        .same_site(SameSite::Lax)
        .max_age(time::Duration::seconds(ttl.num_seconds()))
        .build()
}

fn removal_cookie(name: &'static str) -> Cookie<'static> {
    Cookie::build(name).path("/").build()
}

pub fn create_router() -> Router<AppState> {
    Router::new()
        .route(format!("/{AUTH_API}/register/").as_str(), post(register))
        .route(format!("/{AUTH_API}/login/").as_str(), post(login))
        .route(format!("/{AUTH_API}/refresh/").as_str(), post(refresh))
        .route(format!("/{AUTH_API}/logout/").as_str(), post(logout))
        .route(format!("/{AUTH_API}/me/").as_str(), get(me))
}

async fn register(
    State(state): State<AppState>,
    AppJson(payload): AppJson<RegisterRequest>,
) -> Result<(StatusCode, Json<UserResponse>), ApiError> {
    if payload.password != payload.password_confirm {
        return Err(ApiError::field(
            "password_confirm",
            "Password fields didn't match.",
        ));
    }

    let mut conn = state.pool.get().map_err(|_| ApiError::Internal)?;
    let user = create_user(
        &mut conn,
        &payload.username,
        &payload.email,
        &payload.password,
        &payload.first_name,
        &payload.last_name,
        false,
    )?;

    Ok((StatusCode::CREATED, Json(user.into())))
}

async fn login(
    State(state): State<AppState>,
    jar: CookieJar,
    AppJson(payload): AppJson<LoginRequest>,
) -> Result<(CookieJar, Json<TokenPair>), ApiError> {
    let mut conn = state.pool.get().map_err(|_| ApiError::Internal)?;

    let user = User::find_by_username(&mut conn, payload.username.trim())?
        .ok_or_else(bad_credentials)?;
    if !verify_password(&payload.password, &user.password_hash) {
        return Err(bad_credentials());
    }

    let pair = state.auth.issue_pair(&user)?;
    let jar = jar
        .add(auth_cookie(ACCESS_COOKIE, &pair.access, state.auth.access_ttl))
        .add(auth_cookie(
            REFRESH_COOKIE,
            &pair.refresh,
            state.auth.refresh_ttl,
        ));

    Ok((jar, Json(pair)))
}

/// Issues a fresh access token. The refresh token is taken from the body
/// when present, otherwise from the refresh cookie set at login.
async fn refresh(
    State(state): State<AppState>,
    jar: CookieJar,
    payload: Option<Json<RefreshRequest>>,
) -> Result<(CookieJar, Json<AccessToken>), ApiError> {
    let token = payload
        .as_ref()
        .and_then(|body| body.refresh.clone())
        .or_else(|| jar.get(REFRESH_COOKIE).map(|c| c.value().to_string()))
        .ok_or_else(|| ApiError::field("refresh", "This field is required."))?;

    let claims = state.auth.verify(&token, TOKEN_REFRESH)?;

    let mut conn = state.pool.get().map_err(|_| ApiError::Internal)?;
    if RevokedToken::is_revoked(&mut conn, &claims.jti)? {
        return Err(ApiError::unauthorized("Token is blacklisted"));
    }

    let user = users::table
        .find(claims.sub)
        .select(User::as_select())
        .first::<User>(&mut conn)
        .optional()?
        .ok_or_else(bad_credentials)?;

    let access = state.auth.issue_access(&user)?;
    let jar = jar.add(auth_cookie(ACCESS_COOKIE, &access, state.auth.access_ttl));

    Ok((jar, Json(AccessToken { access })))
}

/// Blacklists the refresh token and clears both cookies. Logging out twice
/// is fine: an already revoked or missing token still returns 205.
async fn logout(
    State(state): State<AppState>,
    _user: AuthUser,
    jar: CookieJar,
    payload: Option<Json<RefreshRequest>>,
) -> Result<(StatusCode, CookieJar), ApiError> {
    let token = payload
        .as_ref()
        .and_then(|body| body.refresh.clone())
        .or_else(|| jar.get(REFRESH_COOKIE).map(|c| c.value().to_string()));

    if let Some(token) = token {
        if let Ok(claims) = state.auth.verify(&token, TOKEN_REFRESH) {
            let mut conn = state.pool.get().map_err(|_| ApiError::Internal)?;
            RevokedToken::revoke(&mut conn, &claims.jti)?;
        }
    }

    let jar = jar
        .remove(removal_cookie(ACCESS_COOKIE))
        .remove(removal_cookie(REFRESH_COOKIE));

    Ok((StatusCode::RESET_CONTENT, jar))
}

async fn me(AuthUser(user): AuthUser) -> Json<UserResponse> {
    Json(user.into())
}

/// The authenticated requester. Handlers take this extractor to require a
/// valid access token, supplied either as `Authorization: Bearer <token>`
/// or through the access cookie set at login.
pub struct AuthUser(pub User);

#[async_trait]
impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let bearer = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(str::to_owned);

        let token = match bearer {
            Some(token) => token,
            None => CookieJar::from_headers(&parts.headers)
                .get(ACCESS_COOKIE)
                .map(|cookie| cookie.value().to_string())
                .ok_or_else(|| {
                    ApiError::unauthorized("Authentication credentials were not provided.")
                })?,
        };

        let claims = state.auth.verify(&token, TOKEN_ACCESS)?;

        let mut conn = state.pool.get().map_err(|_| ApiError::Internal)?;
        let user = users::table
            .find(claims.sub)
            .select(User::as_select())
            .first::<User>(&mut conn)
            .optional()
            .map_err(ApiError::from)?
            .ok_or_else(|| ApiError::unauthorized("User not found"))?;

        Ok(AuthUser(user))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderMap;

    fn sample_user(id: i32) -> User {
        User {
            id,
            username: format!("sample{id}"),
            email: format!("sample{id}@example.com"),
            password_hash: String::new(),
            first_name: String::new(),
            last_name: String::new(),
            is_staff: false,
            date_joined: Utc::now().naive_utc(),
        }
    }

    fn keys() -> AuthKeys {
        AuthKeys::new("unit-test-secret", Duration::minutes(15), Duration::days(7))
    }

    #[test]
    fn test_token_pair_round_trip() {
        let keys = keys();
        let user = sample_user(11);
        let pair = keys.issue_pair(&user).expect("issue tokens");

        let access = keys.verify(&pair.access, "access").expect("valid access");
        assert_eq!(access.sub, 11);
        assert_eq!(access.username, "sample11");

        let refresh = keys.verify(&pair.refresh, "refresh").expect("valid refresh");
        assert_ne!(access.jti, refresh.jti);

        // Kind confusion is rejected
        assert!(keys.verify(&pair.access, "refresh").is_err());
        assert!(keys.verify(&pair.refresh, "access").is_err());
    }

    #[test]
    fn test_tampered_and_expired_tokens_rejected() {
        let keys = keys();
        let user = sample_user(3);
        let pair = keys.issue_pair(&user).expect("issue tokens");

        let mut tampered = pair.access.clone();
        tampered.push('x');
        assert!(keys.verify(&tampered, "access").is_err());

        let other = AuthKeys::new("another-secret", Duration::minutes(15), Duration::days(7));
        assert!(other.verify(&pair.access, "access").is_err());

        // Well past the decoder's leeway
        let stale = AuthKeys::new("unit-test-secret", Duration::minutes(-10), Duration::days(7));
        let expired = stale.issue_pair(&user).expect("issue tokens").access;
        assert!(keys.verify(&expired, "access").is_err());
    }

    #[test]
    fn test_password_hash_round_trip() {
        let hash = hash_password("correct horse battery").expect("hash");
        assert!(hash.starts_with("$argon2"));
        assert!(verify_password("correct horse battery", &hash));
        assert!(!verify_password("wrong horse", &hash));
        assert!(!verify_password("anything", "not-a-phc-string"));
    }

    #[test]
    fn test_password_strength_rules() {
        let err = validate_password_strength("short", "carol", "carol@example.com").unwrap_err();
        let ApiError::Validation(fields) = err else {
            panic!("expected validation error")
        };
        assert!(fields["password"][0].contains("too short"));

        let err =
            validate_password_strength("129384756102", "carol", "carol@example.com").unwrap_err();
        let ApiError::Validation(fields) = err else {
            panic!("expected validation error")
        };
        assert!(fields["password"][0].contains("entirely numeric"));

        let err =
            validate_password_strength("carolcarol", "carol", "carol@example.com").unwrap_err();
        let ApiError::Validation(fields) = err else {
            panic!("expected validation error")
        };
        assert!(fields["password"][0].contains("too similar"));

        assert!(
            validate_password_strength("plum-orchard-9", "carol", "carol@example.com").is_ok()
        );
    }

    #[test]
    fn test_well_formed_email() {
        assert!(well_formed_email("dev@example.com"));
        assert!(well_formed_email("first.last@sub.example.org"));
        assert!(!well_formed_email("no-at-sign"));
        assert!(!well_formed_email("@example.com"));
        assert!(!well_formed_email("dev@nodot"));
        assert!(!well_formed_email("dev@.leading"));
    }

    #[test]
    fn test_auth_cookie_attributes() {
        let cookie = auth_cookie(ACCESS_COOKIE, "tok", Duration::minutes(15));
        assert_eq!(cookie.name(), "access_token");
        assert_eq!(cookie.path(), Some("/"));
        assert_eq!(cookie.http_only(), Some(true));
        assert_eq!(cookie.same_site(), Some(SameSite::Lax));
        assert_eq!(cookie.max_age(), Some(time::Duration::seconds(900)));
    }

    #[tokio::test]
    async fn test_register_login_refresh_logout_flow() {
        let Some(state) = crate::test_utils::try_state() else {
            eprintln!("DATABASE_URL not set, skipping");
            return;
        };

        let suffix = Uuid::new_v4().simple().to_string();
        let username = format!("auth_flow_{suffix}");
        let email = format!("auth_flow_{suffix}@example.com");

        let (status, body) = register(
            State(state.clone()),
            AppJson(RegisterRequest {
                username: username.clone(),
                email: email.clone(),
                password: "plum-orchard-9".to_string(),
                password_confirm: "plum-orchard-9".to_string(),
                first_name: "Auth".to_string(),
                last_name: "Flow".to_string(),
            }),
        )
        .await
        .expect("register should succeed");
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body.0.username, username);
        assert!(!body.0.is_staff);
        let user_id = body.0.id;

        // Same username again is a field error
        let duplicate = register(
            State(state.clone()),
            AppJson(RegisterRequest {
                username: username.clone(),
                email: format!("other_{suffix}@example.com"),
                password: "plum-orchard-9".to_string(),
                password_confirm: "plum-orchard-9".to_string(),
                first_name: String::new(),
                last_name: String::new(),
            }),
        )
        .await;
        assert!(matches!(duplicate, Err(ApiError::Validation(_))));

        // Wrong password is rejected without leaking which part was wrong
        let empty_jar = CookieJar::from_headers(&HeaderMap::new());
        let failed = login(
            State(state.clone()),
            empty_jar.clone(),
            AppJson(LoginRequest {
                username: username.clone(),
                password: "not-the-password".to_string(),
            }),
        )
        .await;
        assert!(matches!(failed, Err(ApiError::Unauthorized(_))));

        let (jar, pair) = login(
            State(state.clone()),
            empty_jar.clone(),
            AppJson(LoginRequest {
                username: username.clone(),
                password: "plum-orchard-9".to_string(),
            }),
        )
        .await
        .expect("login should succeed");
        assert!(jar.get(ACCESS_COOKIE).is_some());
        assert!(jar.get(REFRESH_COOKIE).is_some());

        let refresh_token = pair.0.refresh.clone();
        let (_, refreshed) = refresh(
            State(state.clone()),
            empty_jar.clone(),
            Some(Json(RefreshRequest {
                refresh: Some(refresh_token.clone()),
            })),
        )
        .await
        .expect("refresh should succeed");
        assert!(state.auth.verify(&refreshed.0.access, "access").is_ok());

        // Logout blacklists the refresh token and clears the cookies
        let mut conn = state.pool.get().expect("pool");
        let user = users::table
            .find(user_id)
            .select(User::as_select())
            .first::<User>(&mut conn)
            .expect("user exists");

        let (status, _) = logout(
            State(state.clone()),
            AuthUser(user),
            empty_jar.clone(),
            Some(Json(RefreshRequest {
                refresh: Some(refresh_token.clone()),
            })),
        )
        .await
        .expect("logout should succeed");
        assert_eq!(status, StatusCode::RESET_CONTENT);

        let replayed = refresh(
            State(state.clone()),
            empty_jar,
            Some(Json(RefreshRequest {
                refresh: Some(refresh_token.clone()),
            })),
        )
        .await;
        assert!(matches!(replayed, Err(ApiError::Unauthorized(_))));

        let revoked_jti = state
            .auth
            .verify(&refresh_token, "refresh")
            .expect("still decodable")
            .jti;
        diesel::delete(
            crate::schema::revoked_tokens::table
                .filter(crate::schema::revoked_tokens::jti.eq(revoked_jti)),
        )
        .execute(&mut conn)
        .expect("cleanup revoked token");
        diesel::delete(users::table.find(user_id))
            .execute(&mut conn)
            .expect("cleanup user");
    }
}
