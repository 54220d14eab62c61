use chrono::{Duration, Utc};
use sqlx::PgPool;

use crate::spotify::SpotifyAccess;
use crate::{crypto, models, utils, AppError, CONFIG, LOG};

pub const MAX_FAILED_LOGINS: i32 = 5;
pub const LOCKOUT_SECONDS: i64 = 300;

const MIN_PASSWORD_LENGTH: usize = 8;

fn validate_email(email: &str) -> Result<(), AppError> {
    let valid = match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty() && domain.contains('.') && !email.contains(char::is_whitespace)
        }
        None => false,
    };
    if !valid {
        return Err(AppError::Validation("a valid email address is required".into()));
    }
    Ok(())
}

fn validate_password(password: &str) -> Result<(), AppError> {
    if password.chars().count() < MIN_PASSWORD_LENGTH {
        return Err(AppError::Validation(format!(
            "password must be at least {} characters",
            MIN_PASSWORD_LENGTH
        )));
    }
    Ok(())
}

pub async fn create_local(
    pool: &PgPool,
    email: &str,
    password: &str,
) -> Result<models::User, AppError> {
    let email = email.trim().to_lowercase();
    validate_email(&email)?;
    validate_password(password)?;
    let (salt, hash) = crypto::hash_password(password)?;
    let user = sqlx::query_as::<_, models::User>(
        "insert into resonate.users (username, email, password_hash, password_salt)
         values ($1, $1, $2, $3)
         returning *",
    )
    .bind(&email)
    .bind(&hash)
    .bind(&salt)
    .fetch_one(pool)
    .await
    .map_err(|e| {
        if let sqlx::Error::Database(db) = &e {
            if db.code().as_deref() == Some("23505") {
                return AppError::Validation("an account with that email already exists".into());
            }
        }
        AppError::from(e)
    })?;
    slog::info!(LOG, "registered local user"; "user_id" => user.id);
    Ok(user)
}

pub async fn find_by_email(pool: &PgPool, email: &str) -> Result<Option<models::User>, AppError> {
    Ok(
        sqlx::query_as::<_, models::User>("select * from resonate.users where email = $1")
            .bind(email)
            .fetch_optional(pool)
            .await?,
    )
}

pub async fn find_by_spotify_id(
    pool: &PgPool,
    spotify_id: &str,
) -> Result<Option<models::User>, AppError> {
    Ok(
        sqlx::query_as::<_, models::User>("select * from resonate.users where spotify_id = $1")
            .bind(spotify_id)
            .fetch_optional(pool)
            .await?,
    )
}

async fn find_by_id(pool: &PgPool, id: i64) -> Result<models::User, AppError> {
    sqlx::query_as::<_, models::User>("select * from resonate.users where id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or(AppError::NotFound)
}

pub async fn verify_local(
    pool: &PgPool,
    email: &str,
    password: &str,
) -> Result<models::User, AppError> {
    let email = email.trim().to_lowercase();
    let user = match find_by_email(pool, &email).await? {
        Some(u) => u,
        None => return Err(AppError::InvalidCredentials),
    };
    if let Some(until) = user.locked_until {
        if until > Utc::now() {
            return Err(AppError::LockedOut);
        }
    }
    let (salt, hash) = match (&user.password_salt, &user.password_hash) {
        (Some(s), Some(h)) => (s, h),
        // spotify-only account, there's no local credential to check
        _ => return Err(AppError::InvalidCredentials),
    };
    if !crypto::verify_password(password, salt, hash) {
        return Err(record_failed_login(pool, &user).await?);
    }
    if user.failed_logins > 0 || user.locked_until.is_some() {
        sqlx::query(
            "update resonate.users set failed_logins = 0, locked_until = null, modified = now()
             where id = $1",
        )
        .bind(user.id)
        .execute(pool)
        .await?;
    }
    Ok(user)
}

/// Bump the failure counter, locking the account once it hits
/// the limit. Returns the error the caller should surface.
async fn record_failed_login(pool: &PgPool, user: &models::User) -> Result<AppError, AppError> {
    let failed = user.failed_logins + 1;
    if failed >= MAX_FAILED_LOGINS {
        let until = Utc::now()
            .checked_add_signed(Duration::seconds(LOCKOUT_SECONDS))
            .ok_or_else(|| AppError::Internal("error creating lockout timestamp".into()))?;
        sqlx::query(
            "update resonate.users set failed_logins = 0, locked_until = $2, modified = now()
             where id = $1",
        )
        .bind(user.id)
        .bind(until)
        .execute(pool)
        .await?;
        slog::warn!(LOG, "account locked after repeated failures"; "user_id" => user.id);
        Ok(AppError::LockedOut)
    } else {
        sqlx::query(
            "update resonate.users set failed_logins = $2, modified = now() where id = $1",
        )
        .bind(user.id)
        .bind(failed)
        .execute(pool)
        .await?;
        Ok(AppError::InvalidCredentials)
    }
}

struct EncryptedAccess {
    access_value: String,
    access_nonce: String,
    refresh_value: Option<String>,
    refresh_nonce: Option<String>,
    access_expires: i64,
}

fn encrypt_access(access: &SpotifyAccess) -> Result<EncryptedAccess, AppError> {
    let enc_access = crypto::encrypt(&access.access_token)?;
    let enc_refresh = match &access.refresh_token {
        Some(rt) => Some(crypto::encrypt(rt)?),
        None => None,
    };
    Ok(EncryptedAccess {
        access_value: enc_access.value,
        access_nonce: enc_access.nonce,
        refresh_value: enc_refresh.as_ref().map(|e| e.value.clone()),
        refresh_nonce: enc_refresh.map(|e| e.nonce),
        access_expires: utils::epoch_expiration(access.expires_in)?,
    })
}

/// Persist a fresh token set on the user row. The refresh token
/// is only replaced when the provider issued a new one.
pub async fn update_spotify_tokens(
    pool: &PgPool,
    user_id: i64,
    access: &SpotifyAccess,
) -> Result<(), AppError> {
    let enc = encrypt_access(access)?;
    sqlx::query(
        "update resonate.users set
            access_token = $2, access_nonce = $3, access_expires = $4,
            refresh_token = coalesce($5, refresh_token),
            refresh_nonce = coalesce($6, refresh_nonce),
            modified = now()
         where id = $1",
    )
    .bind(user_id)
    .bind(&enc.access_value)
    .bind(&enc.access_nonce)
    .bind(enc.access_expires)
    .bind(&enc.refresh_value)
    .bind(&enc.refresh_nonce)
    .execute(pool)
    .await?;
    Ok(())
}

/// Attach a spotify identity to an existing account: provider id,
/// display name, fresh tokens, and a confirmed email (it arrived
/// verified from the provider).
async fn link_spotify(
    pool: &PgPool,
    user_id: i64,
    profile: &models::SpotifyProfile,
    access: &SpotifyAccess,
) -> Result<(), AppError> {
    let enc = encrypt_access(access)?;
    sqlx::query(
        "update resonate.users set
            spotify_id = $2, spotify_display_name = $3, email_confirmed = true,
            access_token = $4, access_nonce = $5, access_expires = $6,
            refresh_token = coalesce($7, refresh_token),
            refresh_nonce = coalesce($8, refresh_nonce),
            modified = now()
         where id = $1",
    )
    .bind(user_id)
    .bind(&profile.id)
    .bind(&profile.display_name)
    .bind(&enc.access_value)
    .bind(&enc.access_nonce)
    .bind(enc.access_expires)
    .bind(&enc.refresh_value)
    .bind(&enc.refresh_nonce)
    .execute(pool)
    .await?;
    Ok(())
}

async fn provision_spotify(
    pool: &PgPool,
    email: &str,
    profile: &models::SpotifyProfile,
    access: &SpotifyAccess,
) -> Result<models::User, AppError> {
    let enc = encrypt_access(access)?;
    let user = sqlx::query_as::<_, models::User>(
        "insert into resonate.users
            (username, email, email_confirmed, spotify_id, spotify_display_name,
             access_token, access_nonce, access_expires, refresh_token, refresh_nonce)
         values ($1, $1, true, $2, $3, $4, $5, $6, $7, $8)
         returning *",
    )
    .bind(email)
    .bind(&profile.id)
    .bind(&profile.display_name)
    .bind(&enc.access_value)
    .bind(&enc.access_nonce)
    .bind(enc.access_expires)
    .bind(&enc.refresh_value)
    .bind(&enc.refresh_nonce)
    .fetch_one(pool)
    .await?;
    slog::info!(LOG, "provisioned new user from spotify sign-in"; "user_id" => user.id);
    Ok(user)
}

/// Resolve a completed provider handshake to a signed-in user:
/// an already-linked account signs straight in, an email match
/// links the login to that account, anything else provisions a
/// new account. Every branch stores the fresh token set.
pub async fn complete_external_login(
    pool: &PgPool,
    profile: &models::SpotifyProfile,
    access: &SpotifyAccess,
) -> Result<models::User, AppError> {
    let email = match &profile.email {
        Some(e) if !e.trim().is_empty() => e.trim().to_lowercase(),
        _ => return Err(AppError::NoVerifiedEmail),
    };

    if let Some(user) = find_by_spotify_id(pool, &profile.id).await? {
        update_spotify_tokens(pool, user.id, access).await?;
        slog::info!(LOG, "spotify sign-in for linked user"; "user_id" => user.id);
        return find_by_id(pool, user.id).await;
    }

    if let Some(user) = find_by_email(pool, &email).await? {
        link_spotify(pool, user.id, profile, access).await?;
        slog::info!(LOG, "linked spotify login to existing account"; "user_id" => user.id);
        return find_by_id(pool, user.id).await;
    }

    provision_spotify(pool, &email, profile, access).await
}

fn new_session_token(email: &str) -> String {
    let s = uuid::Uuid::new_v4().simple().to_string();
    let s = format!("{}:{}", email, s);
    let b = crypto::hash(s.as_bytes());
    hex::encode(&b)
}

/// Issue a new session for the user, returning the raw cookie
/// token. Only the hmac of the token is stored.
pub async fn issue_session(pool: &PgPool, user: &models::User) -> Result<String, AppError> {
    let token = new_session_token(&user.email);
    let hash = crypto::hmac_sign(&token);
    let expires = Utc::now()
        .checked_add_signed(Duration::seconds(CONFIG.auth_expiration_seconds as i64))
        .ok_or_else(|| AppError::Internal("error creating session expiration".into()))?;
    sqlx::query("insert into resonate.auth_tokens (hash, user_id, expires) values ($1, $2, $3)")
        .bind(&hash)
        .bind(user.id)
        .bind(expires)
        .execute(pool)
        .await?;
    Ok(token)
}

pub async fn session_user(pool: &PgPool, token: &str) -> Option<models::User> {
    let hash = crypto::hmac_sign(token);
    let u = sqlx::query_as::<_, models::User>(
        "select u.*
         from resonate.users u
            inner join resonate.auth_tokens at
            on u.id = at.user_id
         where at.hash = $1 and at.expires > now()",
    )
    .bind(&hash)
    .fetch_optional(pool)
    .await
    .map_err(|e| slog::error!(LOG, "error looking up session {}", e))
    .ok()
    .flatten();
    if let Some(ref u) = u {
        sqlx::query("delete from resonate.auth_tokens where user_id = $1 and expires <= now()")
            .bind(u.id)
            .execute(pool)
            .await
            .map_err(|e| {
                slog::error!(
                    LOG,
                    "error deleting expired auth tokens, continuing {}", e;
                    "user_id" => u.id,
                )
            })
            .ok();
    }
    u
}

pub async fn revoke_session(pool: &PgPool, token: &str) -> Result<(), AppError> {
    let hash = crypto::hmac_sign(token);
    sqlx::query("delete from resonate.auth_tokens where hash = $1")
        .bind(&hash)
        .execute(pool)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn email_validation() {
        assert!(validate_email("listener@example.com").is_ok());
        assert!(validate_email("").is_err());
        assert!(validate_email("not-an-email").is_err());
        assert!(validate_email("@example.com").is_err());
        assert!(validate_email("user@nodot").is_err());
        assert!(validate_email("spaced out@example.com").is_err());
    }

    #[test]
    fn password_validation() {
        assert!(validate_password("longenough").is_ok());
        assert!(validate_password("short").is_err());
        assert!(validate_password("").is_err());
    }

    #[test]
    fn session_tokens_are_unique_per_issue() {
        let a = new_session_token("u@example.com");
        let b = new_session_token("u@example.com");
        assert_ne!(a, b);
        // sha256, hex encoded
        assert_eq!(a.len(), 64);
    }
}
