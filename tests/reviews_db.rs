//! Database-backed review CRUD tests. These need a reachable
//! postgres at DATABASE_URL, so they're ignored by default:
//!
//!     cargo test -- --ignored

use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use resonate::reviews::{self, NewReview, ReviewUpdate};
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

async fn test_user(pool: &PgPool) -> resonate::models::User {
    let email = format!("{}@reviews-db-test.example.com", uuid::Uuid::new_v4().simple());
    users::create_local(pool, &email, "correct-horse-battery")
        .await
        .expect("user create error")
}

fn review(track_id: &str, rating: i32) -> NewReview {
    NewReview {
        spotify_track_id: track_id.to_string(),
        track_name: "Only Shallow".to_string(),
        artist_name: "My Bloody Valentine".to_string(),
        album_name: Some("Loveless".to_string()),
        album_image_url: None,
        rating,
    }
}

#[async_std::test]
#[ignore]
async fn create_get_update_delete_cycle() {
    let pool = test_pool().await;
    let owner = test_user(&pool).await;

    let id = reviews::create(&pool, owner.id, &review("track-1", 4))
        .await
        .expect("create error");

    let fetched = reviews::get_owned(&pool, owner.id, id)
        .await
        .expect("get error");
    assert_eq!(fetched.rating, 4);
    assert_eq!(fetched.spotify_track_id, "track-1");
    assert!(fetched.updated.is_none());

    reviews::update(
        &pool,
        owner.id,
        id,
        &ReviewUpdate {
            rating: Some(2),
            ..ReviewUpdate::default()
        },
    )
    .await
    .expect("update error");

    let fetched = reviews::get_owned(&pool, owner.id, id)
        .await
        .expect("get error");
    assert_eq!(fetched.rating, 2);
    assert!(fetched.updated.is_some());

    reviews::delete(&pool, owner.id, id).await.expect("delete error");
    // the second delete has nothing left to remove
    assert_eq!(
        reviews::delete(&pool, owner.id, id).await,
        Err(AppError::NotFound)
    );
    assert_eq!(
        reviews::get_owned(&pool, owner.id, id).await,
        Err(AppError::NotFound)
    );
}

#[async_std::test]
#[ignore]
async fn partial_update_leaves_unnamed_fields_alone() {
    let pool = test_pool().await;
    let owner = test_user(&pool).await;

    let id = reviews::create(&pool, owner.id, &review("track-2", 5))
        .await
        .expect("create error");
    reviews::update(
        &pool,
        owner.id,
        id,
        &ReviewUpdate {
            rating: Some(1),
            ..ReviewUpdate::default()
        },
    )
    .await
    .expect("update error");

    let fetched = reviews::get_owned(&pool, owner.id, id)
        .await
        .expect("get error");
    assert_eq!(fetched.rating, 1);
    assert_eq!(fetched.track_name, "Only Shallow");
    assert_eq!(fetched.album_name.as_deref(), Some("Loveless"));
}

#[async_std::test]
#[ignore]
async fn mutations_by_another_user_are_not_found() {
    let pool = test_pool().await;
    let owner = test_user(&pool).await;
    let other = test_user(&pool).await;

    let id = reviews::create(&pool, owner.id, &review("track-3", 3))
        .await
        .expect("create error");

    assert_eq!(
        reviews::get_owned(&pool, other.id, id).await,
        Err(AppError::NotFound)
    );
    assert_eq!(
        reviews::update(
            &pool,
            other.id,
            id,
            &ReviewUpdate {
                rating: Some(1),
                ..ReviewUpdate::default()
            }
        )
        .await,
        Err(AppError::NotFound)
    );
    assert_eq!(
        reviews::delete(&pool, other.id, id).await,
        Err(AppError::NotFound)
    );

    // untouched by all of the above
    let fetched = reviews::get_owned(&pool, owner.id, id)
        .await
        .expect("get error");
    assert_eq!(fetched.rating, 3);
    reviews::delete(&pool, owner.id, id).await.expect("delete error");
}

#[async_std::test]
#[ignore]
async fn feed_is_newest_first_with_reviewer_identity() {
    let pool = test_pool().await;
    let owner = test_user(&pool).await;

    let mut ids = Vec::new();
    for track in &["track-a", "track-b", "track-c"] {
        ids.push(
            reviews::create(&pool, owner.id, &review(track, 5))
                .await
                .expect("create error"),
        );
        // keep created timestamps strictly ordered
        async_std::task::sleep(Duration::from_millis(20)).await;
    }

    let feed = reviews::list_all(&pool).await.expect("feed error");
    let ours: Vec<_> = feed.iter().filter(|r| r.user_id == owner.id).collect();
    assert_eq!(ours.len(), 3);
    // newest first
    assert_eq!(ours[0].id, ids[2]);
    assert_eq!(ours[1].id, ids[1]);
    assert_eq!(ours[2].id, ids[0]);
    for r in ours {
        assert_eq!(r.reviewed_by, owner.username);
    }
}
