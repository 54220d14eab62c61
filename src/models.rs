#[derive(sqlx::FromRow, Debug, Clone, serde::Serialize)]
pub struct User {
    pub id: i64,
    // defaults to the email at registration/provisioning
    pub username: String,
    pub email: String,
    // set when the email arrives verified from the provider
    pub email_confirmed: bool,
    // PBKDF2 hash + per-user salt, hex encoded. Null for
    // accounts that only ever signed in through spotify.
    #[serde(skip_serializing)]
    pub password_hash: Option<String>,
    #[serde(skip_serializing)]
    pub password_salt: Option<String>,
    pub failed_logins: i32,
    pub locked_until: Option<chrono::DateTime<chrono::Utc>>,
    // spotify account id and display name reported by spotify
    pub spotify_id: Option<String>,
    pub spotify_display_name: Option<String>,
    // a spotify access token that can be used to access
    // the spotify user's info. This value is AES_256_GCM
    // encrypted using the application secret set in the
    // current environment and the `access_nonce` generated
    // when the value was originally encrypted.
    #[serde(skip_serializing)]
    pub access_token: Option<String>,
    #[serde(skip_serializing)]
    pub access_nonce: Option<String>,
    // a spotify token that can be used to refresh the spotify
    // user's access_token. This is encrypted and stored the
    // same way as the actual access_token.
    #[serde(skip_serializing)]
    pub refresh_token: Option<String>,
    #[serde(skip_serializing)]
    pub refresh_nonce: Option<String>,
    // timestamp in seconds from epoch when the current
    // spotify access_token expires
    pub access_expires: Option<i64>,
    pub created: chrono::DateTime<chrono::Utc>,
    pub modified: chrono::DateTime<chrono::Utc>,
}

#[derive(sqlx::FromRow, Debug, Clone, PartialEq, serde::Serialize)]
pub struct Review {
    pub id: i64,
    pub user_id: i64,
    pub spotify_track_id: String,
    pub track_name: String,
    pub artist_name: String,
    pub album_name: Option<String>,
    pub album_image_url: Option<String>,
    // 1 through 5 stars, enforced on create/update
    pub rating: i32,
    pub created: chrono::DateTime<chrono::Utc>,
    pub updated: Option<chrono::DateTime<chrono::Utc>>,
}

/// A review joined with the reviewer's display identity,
/// as shown on the public feed.
#[derive(sqlx::FromRow, Debug, Clone, PartialEq, serde::Serialize)]
pub struct FeedReview {
    pub id: i64,
    pub user_id: i64,
    pub spotify_track_id: String,
    pub track_name: String,
    pub artist_name: String,
    pub album_name: Option<String>,
    pub album_image_url: Option<String>,
    pub rating: i32,
    pub created: chrono::DateTime<chrono::Utc>,
    pub updated: Option<chrono::DateTime<chrono::Utc>>,
    pub reviewed_by: String,
}

/// A track as returned from live catalog responses.
/// Never persisted.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct Track {
    pub spotify_id: String,
    pub name: String,
    pub artist: String,
    pub album: String,
    pub duration_ms: u64,
    pub image_url: Option<String>,
}

/// An artist as returned from live catalog responses.
/// Never persisted.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct Artist {
    pub spotify_id: String,
    pub name: String,
    pub genres: Vec<String>,
    pub image_url: Option<String>,
}

/// The signed-in spotify account's own profile
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SpotifyProfile {
    pub id: String,
    pub display_name: Option<String>,
    pub email: Option<String>,
}
