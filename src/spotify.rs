use std::sync::Arc;

use sqlx::PgPool;

use crate::{crypto, models, se, users, utils, AppError, Result, CONFIG, LOG};

/// Lead time before the stored expiration at which we refresh
/// proactively instead of racing the token to the provider.
pub const TOKEN_EXPIRY_SKEW_SECONDS: i64 = 300;

const ACCOUNTS_TOKEN_URL: &str = "https://accounts.spotify.com/api/token";
const API_BASE: &str = "https://api.spotify.com/v1";

#[derive(serde::Deserialize, Debug, Clone)]
pub struct SpotifyAccess {
    pub access_token: String,
    pub token_type: String,
    pub scope: String,
    pub expires_in: u64,
    pub refresh_token: Option<String>,
}

#[derive(serde::Serialize)]
struct AccessParams {
    grant_type: String,
    code: String,
    redirect_uri: String,
}

impl AccessParams {
    fn from_code(code: &str) -> Self {
        AccessParams {
            grant_type: "authorization_code".to_string(),
            code: code.to_string(),
            redirect_uri: CONFIG.spotify_redirect_url(),
        }
    }
}

#[derive(serde::Serialize)]
struct RefreshParams {
    grant_type: String,
    refresh_token: String,
}

impl RefreshParams {
    fn from_token(token: &str) -> Self {
        RefreshParams {
            grant_type: "refresh_token".to_string(),
            refresh_token: token.to_string(),
        }
    }
}

// -- wire shapes, private to this module --

#[derive(serde::Deserialize)]
struct SearchResponse {
    tracks: Option<Paging<TrackObject>>,
}

#[derive(serde::Deserialize)]
struct Paging<T> {
    items: Vec<T>,
}

#[derive(serde::Deserialize)]
struct TrackObject {
    // null for local tracks
    id: Option<String>,
    name: String,
    duration_ms: Option<u64>,
    #[serde(default)]
    artists: Vec<ArtistRef>,
    album: Option<AlbumRef>,
}

#[derive(serde::Deserialize)]
struct ArtistRef {
    name: String,
}

#[derive(serde::Deserialize)]
struct AlbumRef {
    name: String,
    #[serde(default)]
    images: Vec<ImageRef>,
}

#[derive(serde::Deserialize)]
struct ImageRef {
    url: String,
}

#[derive(serde::Deserialize)]
struct ArtistObject {
    id: String,
    name: String,
    #[serde(default)]
    genres: Vec<String>,
    #[serde(default)]
    images: Vec<ImageRef>,
}

#[derive(serde::Deserialize)]
struct PlayHistoryResponse {
    items: Vec<PlayHistoryItem>,
}

#[derive(serde::Deserialize)]
struct PlayHistoryItem {
    track: TrackObject,
}

impl TrackObject {
    fn into_track(self) -> Option<models::Track> {
        let spotify_id = self.id?;
        let artist = self
            .artists
            .iter()
            .map(|a| a.name.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        let (album, image_url) = match self.album {
            Some(a) => (a.name, a.images.into_iter().next().map(|i| i.url)),
            None => (String::new(), None),
        };
        Some(models::Track {
            spotify_id,
            name: self.name,
            artist,
            album,
            duration_ms: self.duration_ms.unwrap_or(0),
            image_url,
        })
    }
}

impl ArtistObject {
    fn into_artist(self) -> models::Artist {
        models::Artist {
            spotify_id: self.id,
            name: self.name,
            genres: self.genres,
            image_url: self.images.into_iter().next().map(|i| i.url),
        }
    }
}

/// The narrow capability surface we need from the spotify web
/// api, so the concrete http client stays swappable and the
/// token-lifecycle logic is testable against a mock.
#[async_trait::async_trait]
pub trait SpotifyApi: Send + Sync {
    async fn exchange_code(&self, code: &str) -> Result<SpotifyAccess>;
    async fn refresh_token(&self, refresh_token: &str) -> Result<SpotifyAccess>;
    async fn current_profile(&self, bearer: &str) -> Result<models::SpotifyProfile>;
    async fn search_tracks(
        &self,
        bearer: &str,
        query: &str,
        limit: usize,
    ) -> Result<Vec<models::Track>>;
    async fn get_track(&self, bearer: &str, track_id: &str) -> Result<Option<models::Track>>;
    async fn top_tracks(&self, bearer: &str, limit: usize) -> Result<Vec<models::Track>>;
    async fn top_artists(&self, bearer: &str, limit: usize) -> Result<Vec<models::Artist>>;
    async fn recently_played(&self, bearer: &str, limit: usize) -> Result<Vec<models::Track>>;
}

/// `SpotifyApi` over the real spotify web api via `surf`
pub struct SpotifyWeb;

fn basic_auth() -> String {
    base64::encode(
        format!("{}:{}", CONFIG.spotify_client_id, CONFIG.spotify_secret_id).as_bytes(),
    )
}

async fn token_request<P: serde::Serialize + Sync>(params: &P) -> Result<SpotifyAccess> {
    let body = surf::Body::from_form(params).map_err(|e| se!("form encode error {:?}", e))?;
    let mut resp = surf::post(ACCOUNTS_TOKEN_URL)
        .body(body)
        .header("authorization", format!("Basic {}", basic_auth()))
        .send()
        .await
        .map_err(|e| se!("token endpoint request error {:?}", e))?;
    if !resp.status().is_success() {
        return Err(se!("token endpoint responded {}", resp.status()).into());
    }
    Ok(resp
        .body_json()
        .await
        .map_err(|e| se!("token endpoint json error {:?}", e))?)
}

async fn get_json<T: serde::de::DeserializeOwned>(url: surf::Url, bearer: &str) -> Result<T> {
    let mut resp = surf::get(url)
        .header("authorization", format!("Bearer {}", bearer))
        .send()
        .await
        .map_err(|e| se!("spotify request error {:?}", e))?;
    if !resp.status().is_success() {
        return Err(se!("spotify responded {}", resp.status()).into());
    }
    Ok(resp
        .body_json()
        .await
        .map_err(|e| se!("spotify json error {:?}", e))?)
}

fn api_url(path: &str, params: &[(&str, &str)]) -> Result<surf::Url> {
    Ok(
        surf::Url::parse_with_params(&format!("{}{}", API_BASE, path), params)
            .map_err(|e| se!("url build error {}", e))?,
    )
}

#[async_trait::async_trait]
impl SpotifyApi for SpotifyWeb {
    async fn exchange_code(&self, code: &str) -> Result<SpotifyAccess> {
        token_request(&AccessParams::from_code(code)).await
    }

    async fn refresh_token(&self, refresh_token: &str) -> Result<SpotifyAccess> {
        token_request(&RefreshParams::from_token(refresh_token)).await
    }

    async fn current_profile(&self, bearer: &str) -> Result<models::SpotifyProfile> {
        get_json(api_url("/me", &[])?, bearer).await
    }

    async fn search_tracks(
        &self,
        bearer: &str,
        query: &str,
        limit: usize,
    ) -> Result<Vec<models::Track>> {
        let limit = limit.min(50).to_string();
        let url = api_url("/search", &[("q", query), ("type", "track"), ("limit", &limit)])?;
        let resp: SearchResponse = get_json(url, bearer).await?;
        Ok(resp
            .tracks
            .map(|t| t.items.into_iter().filter_map(TrackObject::into_track).collect())
            .unwrap_or_default())
    }

    async fn get_track(&self, bearer: &str, track_id: &str) -> Result<Option<models::Track>> {
        if track_id.trim().is_empty() {
            return Ok(None);
        }
        let url = api_url(&format!("/tracks/{}", track_id), &[])?;
        let mut resp = surf::get(url)
            .header("authorization", format!("Bearer {}", bearer))
            .send()
            .await
            .map_err(|e| se!("spotify request error {:?}", e))?;
        // an unknown or malformed id is a missing track, not a fault
        if resp.status() == surf::StatusCode::NotFound
            || resp.status() == surf::StatusCode::BadRequest
        {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(se!("spotify responded {}", resp.status()).into());
        }
        let track: TrackObject = resp
            .body_json()
            .await
            .map_err(|e| se!("spotify json error {:?}", e))?;
        Ok(track.into_track())
    }

    async fn top_tracks(&self, bearer: &str, limit: usize) -> Result<Vec<models::Track>> {
        let limit = limit.min(50).to_string();
        let url = api_url(
            "/me/top/tracks",
            &[("time_range", "medium_term"), ("limit", &limit)],
        )?;
        let resp: Paging<TrackObject> = get_json(url, bearer).await?;
        Ok(resp
            .items
            .into_iter()
            .filter_map(TrackObject::into_track)
            .collect())
    }

    async fn top_artists(&self, bearer: &str, limit: usize) -> Result<Vec<models::Artist>> {
        let limit = limit.min(50).to_string();
        let url = api_url(
            "/me/top/artists",
            &[("time_range", "medium_term"), ("limit", &limit)],
        )?;
        let resp: Paging<ArtistObject> = get_json(url, bearer).await?;
        Ok(resp.items.into_iter().map(ArtistObject::into_artist).collect())
    }

    async fn recently_played(&self, bearer: &str, limit: usize) -> Result<Vec<models::Track>> {
        let limit = limit.min(50).to_string();
        let url = api_url("/me/player/recently-played", &[("limit", &limit)])?;
        let resp: PlayHistoryResponse = get_json(url, bearer).await?;
        Ok(resp
            .items
            .into_iter()
            .filter_map(|i| i.track.into_track())
            .collect())
    }
}

/// A user's stored spotify credentials, decrypted
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoredTokens {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub access_expires: Option<i64>,
}

/// Where a user's spotify credentials live. Split out from the
/// catalog logic so refresh behavior is testable without a db.
#[async_trait::async_trait]
pub trait TokenStore: Send + Sync {
    async fn spotify_tokens(&self, user_id: i64) -> Result<StoredTokens>;
    async fn store_refreshed(&self, user_id: i64, access: &SpotifyAccess) -> Result<()>;
}

pub struct PgTokenStore {
    pool: PgPool,
}

#[derive(sqlx::FromRow)]
struct TokenRow {
    access_token: Option<String>,
    access_nonce: Option<String>,
    refresh_token: Option<String>,
    refresh_nonce: Option<String>,
    access_expires: Option<i64>,
}

fn decrypt_pair(value: &Option<String>, nonce: &Option<String>) -> Result<Option<String>> {
    match (value, nonce) {
        (Some(v), Some(n)) if !v.is_empty() => Ok(Some(crypto::decrypt(&crypto::Enc {
            value: v.clone(),
            nonce: n.clone(),
        })?)),
        _ => Ok(None),
    }
}

#[async_trait::async_trait]
impl TokenStore for PgTokenStore {
    async fn spotify_tokens(&self, user_id: i64) -> Result<StoredTokens> {
        let row = sqlx::query_as::<_, TokenRow>(
            "select access_token, access_nonce, refresh_token, refresh_nonce, access_expires
             from resonate.users where id = $1",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| se!("error loading tokens for user {} {}", user_id, e))?;
        Ok(StoredTokens {
            access_token: decrypt_pair(&row.access_token, &row.access_nonce)?,
            refresh_token: decrypt_pair(&row.refresh_token, &row.refresh_nonce)?,
            access_expires: row.access_expires,
        })
    }

    async fn store_refreshed(&self, user_id: i64, access: &SpotifyAccess) -> Result<()> {
        users::update_spotify_tokens(&self.pool, user_id, access)
            .await
            .map_err(|e| se!("error storing refreshed tokens for user {} {}", user_id, e))?;
        Ok(())
    }
}

/// `true` when the stored expiration is close enough to now
/// that the token should be refreshed before use.
pub fn is_expiring(access_expires: Option<i64>, now: i64) -> bool {
    match access_expires {
        Some(expires) => now >= expires - TOKEN_EXPIRY_SKEW_SECONDS,
        None => false,
    }
}

/// Presence-only connection check: both tokens stored. Expiry
/// intentionally doesn't factor in, the catalog layer refreshes
/// an expired-but-present token on its own.
pub fn has_valid_connection(user: &models::User) -> bool {
    let present = |t: &Option<String>| t.as_deref().map(|s| !s.is_empty()).unwrap_or(false);
    present(&user.access_token) && present(&user.refresh_token)
}

/// Read access to the catalog on behalf of a user. Produces a
/// usable bearer token (refreshing when expiring) and performs
/// the requested operation. Provider faults degrade to empty
/// results, they never fail the surrounding request.
pub struct Catalog {
    api: Arc<dyn SpotifyApi>,
    tokens: Arc<dyn TokenStore>,
}

impl Catalog {
    pub fn new(api: Arc<dyn SpotifyApi>, tokens: Arc<dyn TokenStore>) -> Self {
        Self { api, tokens }
    }

    pub fn for_pool(pool: PgPool) -> Self {
        Self::new(Arc::new(SpotifyWeb), Arc::new(PgTokenStore { pool }))
    }

    pub async fn exchange_code(&self, code: &str) -> Result<SpotifyAccess> {
        self.api.exchange_code(code).await
    }

    pub async fn profile_for_access(&self, access: &SpotifyAccess) -> Result<models::SpotifyProfile> {
        self.api.current_profile(&access.access_token).await
    }

    async fn bearer_for(&self, user_id: i64) -> std::result::Result<String, AppError> {
        let stored = self.tokens.spotify_tokens(user_id).await?;
        let access = match stored.access_token {
            Some(t) if !t.is_empty() => t,
            _ => return Err(AppError::Unauthenticated),
        };
        let now = utils::now_seconds()?;
        if !is_expiring(stored.access_expires, now) {
            return Ok(access);
        }
        let refresh = match stored.refresh_token {
            Some(t) if !t.is_empty() => t,
            _ => return Err(AppError::Unauthenticated),
        };
        slog::info!(LOG, "refreshing expiring access token"; "user_id" => user_id);
        let refreshed = match self.api.refresh_token(&refresh).await {
            Ok(a) => a,
            Err(e) => {
                slog::warn!(LOG, "token refresh rejected {}", e; "user_id" => user_id);
                return Err(AppError::RefreshFailed);
            }
        };
        self.tokens.store_refreshed(user_id, &refreshed).await?;
        Ok(refreshed.access_token)
    }

    pub async fn search(
        &self,
        user: &models::User,
        query: &str,
        limit: usize,
    ) -> Vec<models::Track> {
        if query.trim().is_empty() {
            return Vec::new();
        }
        let bearer = match self.bearer_for(user.id).await {
            Ok(b) => b,
            Err(e) => {
                slog::info!(LOG, "search unavailable: {}", e; "user_id" => user.id);
                return Vec::new();
            }
        };
        match self.api.search_tracks(&bearer, query, limit).await {
            Ok(mut tracks) => {
                tracks.truncate(limit);
                tracks
            }
            Err(e) => {
                slog::error!(LOG, "track search failed {}", e; "user_id" => user.id);
                Vec::new()
            }
        }
    }

    pub async fn track(&self, user: &models::User, track_id: &str) -> Option<models::Track> {
        let bearer = match self.bearer_for(user.id).await {
            Ok(b) => b,
            Err(e) => {
                slog::info!(LOG, "track lookup unavailable: {}", e; "user_id" => user.id);
                return None;
            }
        };
        match self.api.get_track(&bearer, track_id).await {
            Ok(track) => track,
            Err(e) => {
                slog::error!(LOG, "track lookup failed {}", e; "user_id" => user.id);
                None
            }
        }
    }

    pub async fn top_tracks(&self, user: &models::User, limit: usize) -> Vec<models::Track> {
        let bearer = match self.bearer_for(user.id).await {
            Ok(b) => b,
            Err(e) => {
                slog::info!(LOG, "top tracks unavailable: {}", e; "user_id" => user.id);
                return Vec::new();
            }
        };
        match self.api.top_tracks(&bearer, limit).await {
            Ok(tracks) => tracks,
            Err(e) => {
                slog::error!(LOG, "top tracks failed {}", e; "user_id" => user.id);
                Vec::new()
            }
        }
    }

    pub async fn top_artists(&self, user: &models::User, limit: usize) -> Vec<models::Artist> {
        let bearer = match self.bearer_for(user.id).await {
            Ok(b) => b,
            Err(e) => {
                slog::info!(LOG, "top artists unavailable: {}", e; "user_id" => user.id);
                return Vec::new();
            }
        };
        match self.api.top_artists(&bearer, limit).await {
            Ok(artists) => artists,
            Err(e) => {
                slog::error!(LOG, "top artists failed {}", e; "user_id" => user.id);
                Vec::new()
            }
        }
    }

    pub async fn recently_played(&self, user: &models::User, limit: usize) -> Vec<models::Track> {
        let bearer = match self.bearer_for(user.id).await {
            Ok(b) => b,
            Err(e) => {
                slog::info!(LOG, "recently played unavailable: {}", e; "user_id" => user.id);
                return Vec::new();
            }
        };
        match self.api.recently_played(&bearer, limit).await {
            Ok(tracks) => tracks,
            Err(e) => {
                slog::error!(LOG, "recently played failed {}", e; "user_id" => user.id);
                Vec::new()
            }
        }
    }

    pub async fn current_profile(&self, user: &models::User) -> Option<models::SpotifyProfile> {
        let bearer = match self.bearer_for(user.id).await {
            Ok(b) => b,
            Err(e) => {
                slog::info!(LOG, "profile unavailable: {}", e; "user_id" => user.id);
                return None;
            }
        };
        match self.api.current_profile(&bearer).await {
            Ok(profile) => Some(profile),
            Err(e) => {
                slog::error!(LOG, "profile lookup failed {}", e; "user_id" => user.id);
                None
            }
        }
    }
}
