//! Database-backed identity and session tests. These need a
//! reachable postgres at DATABASE_URL, so they're ignored by
//! default:
//!
//!     cargo test -- --ignored

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use resonate::models::SpotifyProfile;
use resonate::spotify::{self, SpotifyAccess};
use resonate::users;
use resonate::AppError;

async fn test_pool() -> PgPool {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for db tests");
    let pool = PgPoolOptions::new()
        .max_connections(2)
        .connect(&url)
        .await
        .expect("db connect error");
    sqlx::migrate!().run(&pool).await.expect("migration error");
    pool
}

fn unique_email() -> String {
    format!("{}@users-db-test.example.com", uuid::Uuid::new_v4().simple())
}

fn access(suffix: &str) -> SpotifyAccess {
    SpotifyAccess {
        access_token: format!("access-{}", suffix),
        token_type: "Bearer".to_string(),
        scope: "user-read-email user-read-private".to_string(),
        expires_in: 3600,
        refresh_token: Some(format!("refresh-{}", suffix)),
    }
}

#[async_std::test]
#[ignore]
async fn register_then_sign_in() {
    let pool = test_pool().await;
    let email = unique_email();

    let user = users::create_local(&pool, &email, "a-long-password")
        .await
        .expect("register error");
    assert_eq!(user.username, email);
    assert!(!user.email_confirmed);

    let signed_in = users::verify_local(&pool, &email, "a-long-password")
        .await
        .expect("sign-in error");
    assert_eq!(signed_in.id, user.id);

    assert!(matches!(
        users::verify_local(&pool, &email, "the-wrong-password").await,
        Err(AppError::InvalidCredentials)
    ));
    // a second registration on the same email is rejected
    assert!(matches!(
        users::create_local(&pool, &email, "a-long-password").await,
        Err(AppError::Validation(_))
    ));
}

#[async_std::test]
#[ignore]
async fn repeated_failures_lock_the_account() {
    let pool = test_pool().await;
    let email = unique_email();
    users::create_local(&pool, &email, "a-long-password")
        .await
        .expect("register error");

    for _ in 0..users::MAX_FAILED_LOGINS - 1 {
        assert!(matches!(
            users::verify_local(&pool, &email, "nope-nope-nope").await,
            Err(AppError::InvalidCredentials)
        ));
    }
    // the attempt that hits the limit locks the account
    assert!(matches!(
        users::verify_local(&pool, &email, "nope-nope-nope").await,
        Err(AppError::LockedOut)
    ));
    // even the right password is refused while locked
    assert!(matches!(
        users::verify_local(&pool, &email, "a-long-password").await,
        Err(AppError::LockedOut)
    ));
}

#[async_std::test]
#[ignore]
async fn external_login_provisions_a_new_account() {
    let pool = test_pool().await;
    let email = unique_email();
    let profile = SpotifyProfile {
        id: format!("spotify-{}", uuid::Uuid::new_v4().simple()),
        display_name: Some("Listener".to_string()),
        email: Some(email.clone()),
    };

    let user = users::complete_external_login(&pool, &profile, &access("1"))
        .await
        .expect("external login error");
    assert_eq!(user.username, email);
    assert!(user.email_confirmed);
    assert_eq!(user.spotify_id.as_deref(), Some(profile.id.as_str()));
    assert!(spotify::has_valid_connection(&user));
    assert!(user.access_expires.is_some());

    // the same provider identity signs back into the same account
    let again = users::complete_external_login(&pool, &profile, &access("2"))
        .await
        .expect("external login error");
    assert_eq!(again.id, user.id);
}

#[async_std::test]
#[ignore]
async fn external_login_links_to_an_existing_email_match() {
    let pool = test_pool().await;
    let email = unique_email();
    let local = users::create_local(&pool, &email, "a-long-password")
        .await
        .expect("register error");
    assert!(!local.email_confirmed);

    let profile = SpotifyProfile {
        id: format!("spotify-{}", uuid::Uuid::new_v4().simple()),
        display_name: Some("Listener".to_string()),
        email: Some(email.clone()),
    };
    let linked = users::complete_external_login(&pool, &profile, &access("1"))
        .await
        .expect("external login error");
    assert_eq!(linked.id, local.id);
    assert!(linked.email_confirmed);
    assert_eq!(linked.spotify_id.as_deref(), Some(profile.id.as_str()));
    assert!(spotify::has_valid_connection(&linked));
}

#[async_std::test]
#[ignore]
async fn external_login_without_an_email_is_rejected() {
    let pool = test_pool().await;
    let profile = SpotifyProfile {
        id: format!("spotify-{}", uuid::Uuid::new_v4().simple()),
        display_name: None,
        email: None,
    };
    assert!(matches!(
        users::complete_external_login(&pool, &profile, &access("1")).await,
        Err(AppError::NoVerifiedEmail)
    ));
}

#[async_std::test]
#[ignore]
async fn sessions_issue_resolve_and_revoke() {
    let pool = test_pool().await;
    let email = unique_email();
    let user = users::create_local(&pool, &email, "a-long-password")
        .await
        .expect("register error");

    let token = users::issue_session(&pool, &user)
        .await
        .expect("session error");
    let resolved = users::session_user(&pool, &token)
        .await
        .expect("session should resolve");
    assert_eq!(resolved.id, user.id);

    users::revoke_session(&pool, &token)
        .await
        .expect("revoke error");
    assert!(users::session_user(&pool, &token).await.is_none());
}
