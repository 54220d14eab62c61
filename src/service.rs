use std::sync::Arc;

use cached::Cached;

use crate::{models, resp, reviews, se, spotify, users, AppError, Result, CONFIG, LOG};

#[derive(Clone)]
struct Context {
    pool: sqlx::PgPool,
    catalog: Arc<spotify::Catalog>,
}

pub async fn start(pool: sqlx::PgPool) -> Result<()> {
    let catalog = Arc::new(spotify::Catalog::for_pool(pool.clone()));
    let ctx = Context { pool, catalog };
    let mut app = tide::with_state(ctx);
    app.at("/").get(index);
    app.at("/status").get(status);
    app.at("/register").post(register);
    app.at("/login").post(login);
    app.at("/login/spotify").get(spotify_login);
    app.at("/auth").get(auth_callback);
    app.at("/logout").get(logout);
    app.at("/reviews").get(review_feed).post(create_review);
    app.at("/reviews/:id").get(get_review).post(update_review);
    app.at("/reviews/:id/delete").post(delete_review);
    app.at("/profile").get(profile);
    app.at("/api/search").get(search_tracks);
    app.at("/api/recent").get(recently_played);
    app.with(crate::logging::LogMiddleware::new());

    slog::info!(LOG, "running at {}", CONFIG.host());
    app.listen(CONFIG.host()).await?;
    Ok(())
}

fn error_resp(err: AppError) -> tide::Result {
    if let AppError::Internal(msg) = &err {
        // logged, not echoed
        slog::error!(LOG, "internal error {}", msg);
        return Ok(resp!(status => 500, message => "internal error"));
    }
    Ok(resp!(status => err.status(), message => err.to_string()))
}

fn auth_cookie(token: &str) -> String {
    let secure = if CONFIG.ssl { "; Secure" } else { "" };
    format!(
        "auth_token={token}; Domain={domain}; Path=/; HttpOnly; SameSite=Lax; Max-Age={max_age}{secure}",
        token = token,
        domain = CONFIG.domain(),
        max_age = CONFIG.auth_expiration_seconds,
        secure = secure,
    )
}

fn clear_auth_cookie() -> String {
    format!(
        "auth_token=; Domain={}; Path=/; HttpOnly; Max-Age=0",
        CONFIG.domain()
    )
}

async fn get_session_user(req: &tide::Request<Context>) -> Option<models::User> {
    let ctx = req.state();
    match req.cookie("auth_token") {
        None => {
            slog::debug!(LOG, "no auth token cookie found");
            None
        }
        Some(cookie) => users::session_user(&ctx.pool, cookie.value()).await,
    }
}

/// Browser-facing routes bounce anonymous visitors through the
/// spotify sign-in and back to where they were headed.
macro_rules! user_or_redirect {
    ($req:expr) => {{
        match get_session_user(&$req).await {
            Some(user) => user,
            None => {
                let path = $req.url().path();
                return Ok(tide::Redirect::new(format!(
                    "{}/login/spotify?redirect={}",
                    CONFIG.redirect_host(),
                    path
                ))
                .into());
            }
        }
    }};
}

/// Api-style routes answer anonymous requests with a 401 instead.
macro_rules! user_or_unauthorized {
    ($req:expr) => {{
        match get_session_user(&$req).await {
            Some(user) => user,
            None => return error_resp(AppError::Unauthenticated),
        }
    }};
}

macro_rules! query_or_error {
    ($req:expr) => {{
        match $req.query() {
            Err(e) => {
                slog::info!(LOG, "invalid query parameters {:?}", e);
                return Ok(resp!(status => 400, message => "invalid query parameters"));
            }
            Ok(params) => params,
        }
    }};
}

macro_rules! body_or_error {
    ($req:expr) => {{
        match $req.body_json().await {
            Err(e) => {
                slog::info!(LOG, "invalid request body {:?}", e);
                return Ok(resp!(status => 400, message => "invalid request body"));
            }
            Ok(body) => body,
        }
    }};
}

macro_rules! id_param_or_error {
    ($req:expr) => {{
        match $req.param("id").ok().and_then(|s| s.parse::<i64>().ok()) {
            Some(id) => id,
            None => return Ok(resp!(status => 400, message => "invalid review id")),
        }
    }};
}

async fn index(_req: tide::Request<Context>) -> tide::Result {
    Ok(tide::Redirect::new(format!("{}/reviews", CONFIG.redirect_host())).into())
}

#[derive(serde::Serialize)]
struct Status<'a> {
    ok: &'a str,
    version: &'a str,
}

async fn status(_req: tide::Request<Context>) -> tide::Result {
    Ok(resp!(json => Status {
        ok: "ok",
        version: &CONFIG.version
    }))
}

#[derive(serde::Deserialize)]
struct CredentialsInput {
    email: String,
    password: String,
}

async fn register(mut req: tide::Request<Context>) -> tide::Result {
    let input: CredentialsInput = body_or_error!(req);
    let ctx = req.state();
    match users::create_local(&ctx.pool, &input.email, &input.password).await {
        Ok(user) => Ok(resp!(json => serde_json::json!({
            "ok": "ok",
            "user_id": user.id,
        }))),
        Err(e) => error_resp(e),
    }
}

async fn login(mut req: tide::Request<Context>) -> tide::Result {
    let input: CredentialsInput = body_or_error!(req);
    let ctx = req.state();
    let user = match users::verify_local(&ctx.pool, &input.email, &input.password).await {
        Ok(user) => user,
        Err(e) => return error_resp(e),
    };
    let token = match users::issue_session(&ctx.pool, &user).await {
        Ok(token) => token,
        Err(e) => return error_resp(e),
    };
    slog::info!(LOG, "local sign-in for {}", user.email; "user_id" => user.id);
    let mut resp = resp!(json => serde_json::json!({
        "ok": "ok",
        "user_id": user.id,
        "username": &user.username,
    }));
    resp.insert_header("set-cookie", auth_cookie(&token));
    Ok(resp)
}

async fn logout(req: tide::Request<Context>) -> tide::Result {
    if let Some(cookie) = req.cookie("auth_token") {
        let ctx = req.state();
        if let Err(e) = users::revoke_session(&ctx.pool, cookie.value()).await {
            slog::error!(LOG, "error revoking session {}", e);
        }
    }
    let mut resp: tide::Response =
        tide::Redirect::new(format!("{}/reviews", CONFIG.redirect_host())).into();
    resp.insert_header("set-cookie", clear_auth_cookie());
    Ok(resp)
}

#[derive(Debug, serde::Deserialize)]
struct SpotifyAuthCallback {
    code: String,
    state: String,
}

#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct OneTimeLoginToken {
    token: String,
    redirect: Option<String>,
}

async fn new_one_time_login_token(redirect: Option<String>) -> Result<String> {
    let s = uuid::Uuid::new_v4().simple().to_string();
    let s = serde_json::to_string(&OneTimeLoginToken { token: s, redirect })
        .map_err(|e| se!("token json error {}", e))?;
    let s = base64::encode_config(&s, base64::URL_SAFE);
    let mut lock = crate::ONE_TIME_TOKENS.lock().await;
    lock.cache_set(s.clone(), ());
    Ok(s)
}

async fn is_valid_one_time_login_token(auth: &SpotifyAuthCallback) -> bool {
    let mut lock = crate::ONE_TIME_TOKENS.lock().await;
    lock.cache_remove(&auth.state).is_some()
}

#[derive(serde::Deserialize)]
struct MaybeRedirect {
    redirect: Option<String>,
}

/// The login process uses spotify to authenticate the current user
/// which then redirects back to our callback url with a code we
/// can use to generate reusable access and refresh API tokens.
async fn spotify_login(req: tide::Request<Context>) -> tide::Result {
    let maybe_redirect: MaybeRedirect = req.query().map_err(|e| se!("query parse error {}", e))?;
    let token = new_one_time_login_token(maybe_redirect.redirect.clone())
        .await
        .map_err(|e| se!("error generating new one time login token {}", e))?;
    slog::info!(
        LOG,
        "redirecting to spotify-auth with state token {}, post-redirect-redirect {:?}",
        token,
        maybe_redirect.redirect,
    );
    Ok(tide::Redirect::new(
        format!("https://accounts.spotify.com/authorize?client_id={id}&response_type=code&redirect_uri={redirect}&scope={scope}&state={state}",
                id = CONFIG.spotify_client_id,
                redirect = CONFIG.spotify_redirect_url(),
                scope = "user-read-email user-read-private user-top-read user-read-recently-played user-library-read playlist-read-private",
                state = token)
    ).into())
}

/// After we redirect users to spotify to login, spotify sends
/// them back here with `code` and `state` query parameters.
/// `code` is a single-use token exchanged for a new pair of
/// spotify API access and refresh tokens. `state` is the
/// one-time-token we minted when sending the user over, asserted
/// so each login attempt only happens once.
async fn auth_callback(req: tide::Request<Context>) -> tide::Result {
    slog::info!(LOG, "got spotify login callback");
    let ctx = req.state();
    let spotify_auth: SpotifyAuthCallback =
        req.query().map_err(|e| se!("query parse error: {:?}", e))?;
    if !is_valid_one_time_login_token(&spotify_auth).await {
        return Ok(
            resp!(status => 400, message => format!("invalid one-time login token {}", spotify_auth.state)),
        );
    }
    let token_bytes = base64::decode_config(&spotify_auth.state, base64::URL_SAFE)
        .map_err(|e| se!("state decode error {}", e))?;
    let token_str = String::from_utf8(token_bytes).map_err(|e| se!("state utf8 error {}", e))?;
    let login_token: OneTimeLoginToken =
        serde_json::from_str(&token_str).map_err(|e| se!("state deserialize error {}", e))?;

    let access = ctx
        .catalog
        .exchange_code(&spotify_auth.code)
        .await
        .map_err(|e| se!("spotify access error {}", e))?;
    let spotify_profile = ctx
        .catalog
        .profile_for_access(&access)
        .await
        .map_err(|e| se!("error getting spotify profile {}", e))?;

    let user = match users::complete_external_login(&ctx.pool, &spotify_profile, &access).await {
        Ok(user) => user,
        Err(e) => return error_resp(e),
    };
    let session = match users::issue_session(&ctx.pool, &user).await {
        Ok(token) => token,
        Err(e) => return error_resp(e),
    };
    let is_new = user.created == user.modified;
    slog::info!(LOG, "completing spotify login for {}", user.email; "user_id" => user.id, "is_new" => is_new);

    let cookie_str = auth_cookie(&session);
    if let Some(redirect) = login_token.redirect {
        // the one time login token we sent to spotify may carry
        // the url the user was originally trying to reach when we
        // noticed they weren't signed in. Send them back there
        // unless it was the login url itself.
        if !redirect.contains("login") {
            slog::info!(LOG, "found login redirect {:?}", redirect);
            let mut resp: tide::Response =
                tide::Redirect::new(format!("{}{}", CONFIG.redirect_host(), redirect)).into();
            resp.insert_header("set-cookie", cookie_str);
            return Ok(resp);
        }
    }
    Ok(tide::Response::builder(200)
        .header("set-cookie", cookie_str)
        .body(serde_json::json!({
            "ok": "ok",
            "user.id": user.id,
            "user.username": &user.username,
            "user.email": &user.email,
        }))
        .build())
}

#[derive(serde::Serialize)]
struct FeedResponse {
    count: usize,
    reviews: Vec<models::FeedReview>,
}

async fn review_feed(req: tide::Request<Context>) -> tide::Result {
    let ctx = req.state();
    match reviews::list_all(&ctx.pool).await {
        Ok(feed) => Ok(resp!(json => FeedResponse {
            count: feed.len(),
            reviews: feed,
        })),
        Err(e) => error_resp(e),
    }
}

async fn create_review(mut req: tide::Request<Context>) -> tide::Result {
    let user = user_or_unauthorized!(req);
    let input: reviews::NewReview = body_or_error!(req);
    let ctx = req.state();
    match reviews::create(&ctx.pool, user.id, &input).await {
        Ok(id) => Ok(resp!(json => serde_json::json!({
            "ok": "ok",
            "review_id": id,
        }))),
        Err(e) => error_resp(e),
    }
}

async fn get_review(req: tide::Request<Context>) -> tide::Result {
    let id = id_param_or_error!(req);
    let user = user_or_unauthorized!(req);
    let ctx = req.state();
    match reviews::get_owned(&ctx.pool, user.id, id).await {
        Ok(review) => Ok(resp!(json => review)),
        Err(e) => error_resp(e),
    }
}

async fn update_review(mut req: tide::Request<Context>) -> tide::Result {
    let id = id_param_or_error!(req);
    let user = user_or_unauthorized!(req);
    let changes: reviews::ReviewUpdate = body_or_error!(req);
    let ctx = req.state();
    match reviews::update(&ctx.pool, user.id, id, &changes).await {
        Ok(()) => Ok(resp!(json => serde_json::json!({ "ok": "ok" }))),
        Err(e) => error_resp(e),
    }
}

async fn delete_review(req: tide::Request<Context>) -> tide::Result {
    let id = id_param_or_error!(req);
    let user = user_or_unauthorized!(req);
    let ctx = req.state();
    match reviews::delete(&ctx.pool, user.id, id).await {
        Ok(()) => Ok(resp!(json => serde_json::json!({ "ok": "ok" }))),
        Err(e) => error_resp(e),
    }
}

#[derive(serde::Serialize)]
struct ProfileResponse {
    connected: bool,
    spotify_id: Option<String>,
    display_name: Option<String>,
    profile: Option<models::SpotifyProfile>,
    top_tracks: Vec<models::Track>,
    top_artists: Vec<models::Artist>,
    error: Option<&'static str>,
}

async fn profile(req: tide::Request<Context>) -> tide::Result {
    let user = user_or_redirect!(req);
    let ctx = req.state();
    if !spotify::has_valid_connection(&user) {
        return Ok(resp!(json => ProfileResponse {
            connected: false,
            spotify_id: None,
            display_name: None,
            profile: None,
            top_tracks: Vec::new(),
            top_artists: Vec::new(),
            error: Some("no spotify account linked"),
        }));
    }
    let spotify_profile = ctx.catalog.current_profile(&user).await;
    let top_tracks = ctx.catalog.top_tracks(&user, 10).await;
    let top_artists = ctx.catalog.top_artists(&user, 10).await;
    Ok(resp!(json => ProfileResponse {
        connected: true,
        spotify_id: user.spotify_id.clone(),
        display_name: user.spotify_display_name.clone(),
        profile: spotify_profile,
        top_tracks,
        top_artists,
        error: None,
    }))
}

#[derive(serde::Serialize)]
struct TrackListResponse {
    count: usize,
    tracks: Vec<models::Track>,
}

#[derive(serde::Deserialize)]
struct SearchParams {
    q: Option<String>,
    limit: Option<usize>,
}

/// Json endpoint backing incremental search-as-you-type.
/// A blank query is answered directly, without touching spotify.
async fn search_tracks(req: tide::Request<Context>) -> tide::Result {
    let params: SearchParams = query_or_error!(req);
    let query = params.q.unwrap_or_default();
    if query.trim().is_empty() {
        return Ok(resp!(json => TrackListResponse {
            count: 0,
            tracks: Vec::new(),
        }));
    }
    let user = user_or_unauthorized!(req);
    let ctx = req.state();
    let limit = params.limit.unwrap_or(20).min(50);
    let tracks = ctx.catalog.search(&user, &query, limit).await;
    Ok(resp!(json => TrackListResponse {
        count: tracks.len(),
        tracks,
    }))
}

#[derive(serde::Deserialize)]
struct ListParams {
    limit: Option<usize>,
}

async fn recently_played(req: tide::Request<Context>) -> tide::Result {
    let params: ListParams = query_or_error!(req);
    let user = user_or_unauthorized!(req);
    let ctx = req.state();
    let limit = params.limit.unwrap_or(20).min(50);
    let tracks = dedup_by_track_id(ctx.catalog.recently_played(&user, limit).await);
    Ok(resp!(json => TrackListResponse {
        count: tracks.len(),
        tracks,
    }))
}

/// Repeat plays of the same track collapse to one entry for
/// display, first occurrence (most recent play) wins.
fn dedup_by_track_id(tracks: Vec<models::Track>) -> Vec<models::Track> {
    let mut seen = std::collections::HashSet::new();
    tracks
        .into_iter()
        .filter(|t| seen.insert(t.spotify_id.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn track(id: &str, name: &str) -> models::Track {
        models::Track {
            spotify_id: id.to_string(),
            name: name.to_string(),
            artist: "Artist".to_string(),
            album: "Album".to_string(),
            duration_ms: 1,
            image_url: None,
        }
    }

    #[test]
    fn repeat_plays_collapse_first_occurrence_wins() {
        let deduped = dedup_by_track_id(vec![
            track("a", "latest play of a"),
            track("b", "b"),
            track("a", "older play of a"),
            track("c", "c"),
            track("b", "older play of b"),
        ]);
        assert_eq!(deduped.len(), 3);
        assert_eq!(deduped[0].spotify_id, "a");
        assert_eq!(deduped[0].name, "latest play of a");
        assert_eq!(deduped[1].spotify_id, "b");
        assert_eq!(deduped[2].spotify_id, "c");
    }

    #[test]
    fn auth_cookie_shape() {
        let cookie = auth_cookie("tok-123");
        assert!(cookie.starts_with("auth_token=tok-123;"));
        assert!(cookie.contains("HttpOnly"));
        assert!(cookie.contains("SameSite=Lax"));
        let cleared = clear_auth_cookie();
        assert!(cleared.contains("Max-Age=0"));
    }
}
