use sqlx::PgPool;

use crate::{models, AppError, LOG};

pub const MIN_RATING: i32 = 1;
pub const MAX_RATING: i32 = 5;

fn validate_rating(rating: i32) -> Result<(), AppError> {
    if rating < MIN_RATING || rating > MAX_RATING {
        return Err(AppError::Validation(format!(
            "rating must be between {} and {}",
            MIN_RATING, MAX_RATING
        )));
    }
    Ok(())
}

fn validate_track_id(spotify_track_id: &str) -> Result<(), AppError> {
    if spotify_track_id.trim().is_empty() {
        return Err(AppError::Validation("a track must be selected".into()));
    }
    Ok(())
}

#[derive(Debug, serde::Deserialize)]
pub struct NewReview {
    pub spotify_track_id: String,
    pub track_name: String,
    pub artist_name: String,
    pub album_name: Option<String>,
    pub album_image_url: Option<String>,
    pub rating: i32,
}

impl NewReview {
    pub fn validate(&self) -> Result<(), AppError> {
        validate_track_id(&self.spotify_track_id)?;
        validate_rating(self.rating)?;
        Ok(())
    }
}

/// Partial update: absent fields are left unchanged.
#[derive(Debug, Default, serde::Deserialize)]
pub struct ReviewUpdate {
    pub spotify_track_id: Option<String>,
    pub track_name: Option<String>,
    pub artist_name: Option<String>,
    pub album_name: Option<String>,
    pub album_image_url: Option<String>,
    pub rating: Option<i32>,
}

impl ReviewUpdate {
    pub fn validate(&self) -> Result<(), AppError> {
        if let Some(track_id) = &self.spotify_track_id {
            validate_track_id(track_id)?;
        }
        if let Some(rating) = self.rating {
            validate_rating(rating)?;
        }
        Ok(())
    }
}

pub async fn create(pool: &PgPool, owner_id: i64, review: &NewReview) -> Result<i64, AppError> {
    review.validate()?;
    let id: i64 = sqlx::query_scalar(
        "insert into resonate.reviews
            (user_id, spotify_track_id, track_name, artist_name,
             album_name, album_image_url, rating)
         values ($1, $2, $3, $4, $5, $6, $7)
         returning id",
    )
    .bind(owner_id)
    .bind(&review.spotify_track_id)
    .bind(&review.track_name)
    .bind(&review.artist_name)
    .bind(&review.album_name)
    .bind(&review.album_image_url)
    .bind(review.rating)
    .fetch_one(pool)
    .await?;
    slog::info!(LOG, "created review"; "review_id" => id, "user_id" => owner_id);
    Ok(id)
}

pub async fn update(
    pool: &PgPool,
    owner_id: i64,
    review_id: i64,
    changes: &ReviewUpdate,
) -> Result<(), AppError> {
    changes.validate()?;
    let result = sqlx::query(
        "update resonate.reviews set
            spotify_track_id = coalesce($3, spotify_track_id),
            track_name = coalesce($4, track_name),
            artist_name = coalesce($5, artist_name),
            album_name = coalesce($6, album_name),
            album_image_url = coalesce($7, album_image_url),
            rating = coalesce($8, rating),
            updated = now()
         where id = $1 and user_id = $2",
    )
    .bind(review_id)
    .bind(owner_id)
    .bind(&changes.spotify_track_id)
    .bind(&changes.track_name)
    .bind(&changes.artist_name)
    .bind(&changes.album_name)
    .bind(&changes.album_image_url)
    .bind(changes.rating)
    .execute(pool)
    .await?;
    if result.rows_affected() == 0 {
        return Err(AppError::NotFound);
    }
    Ok(())
}

pub async fn delete(pool: &PgPool, owner_id: i64, review_id: i64) -> Result<(), AppError> {
    let result = sqlx::query("delete from resonate.reviews where id = $1 and user_id = $2")
        .bind(review_id)
        .bind(owner_id)
        .execute(pool)
        .await?;
    if result.rows_affected() == 0 {
        return Err(AppError::NotFound);
    }
    slog::info!(LOG, "deleted review"; "review_id" => review_id, "user_id" => owner_id);
    Ok(())
}

pub async fn get_owned(
    pool: &PgPool,
    owner_id: i64,
    review_id: i64,
) -> Result<models::Review, AppError> {
    sqlx::query_as::<_, models::Review>(
        "select * from resonate.reviews where id = $1 and user_id = $2",
    )
    .bind(review_id)
    .bind(owner_id)
    .fetch_optional(pool)
    .await?
    .ok_or(AppError::NotFound)
}

/// The public feed: every user's reviews, newest first, with the
/// reviewer's display identity attached. Not owner-scoped.
pub async fn list_all(pool: &PgPool) -> Result<Vec<models::FeedReview>, AppError> {
    Ok(sqlx::query_as::<_, models::FeedReview>(
        "select
            r.id, r.user_id, r.spotify_track_id, r.track_name, r.artist_name,
            r.album_name, r.album_image_url, r.rating, r.created, r.updated,
            coalesce(u.spotify_display_name, u.username) as reviewed_by
         from resonate.reviews r
            inner join resonate.users u on u.id = r.user_id
         order by r.created desc",
    )
    .fetch_all(pool)
    .await?)
}
