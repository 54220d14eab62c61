use async_mutex::Mutex;
use cached::stores::TimedCache;
use slog::o;
use slog::Drain;
use std::io::Read;
use std::sync::Arc;
use std::{env, fs};

pub mod crypto;
pub mod logging;
pub mod models;
pub mod reviews;
pub mod service;
pub mod spotify;
pub mod users;
pub mod utils;

pub type Error = Box<dyn std::error::Error + Send + Sync>;
pub type Result<T> = std::result::Result<T, Error>;

/// String-backed error for ad-hoc wrapping, see the `se!` macro.
#[derive(Debug)]
pub struct StringError(pub String);

impl std::fmt::Display for StringError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
impl std::error::Error for StringError {}

/// Build a `StringError` from format args
#[macro_export]
macro_rules! se {
    ($($arg:tt)*) => { $crate::StringError(format!($($arg)*)) };
}

/// Build a json `tide::Response`, either from a serializable
/// body or from a status code and an error message.
#[macro_export]
macro_rules! resp {
    (json => $body:expr) => {
        tide::Response::builder(200)
            .content_type(tide::http::mime::JSON)
            .body(tide::Body::from_json(&$body)?)
            .build()
    };
    (status => $status:expr, message => $msg:expr) => {
        tide::Response::builder($status)
            .content_type(tide::http::mime::JSON)
            .body(tide::Body::from_json(&serde_json::json!({ "error": $msg }))?)
            .build()
    };
}

/// Application error taxonomy. Everything here resolves to a
/// response status, never a crashed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppError {
    Validation(String),
    InvalidCredentials,
    LockedOut,
    NoVerifiedEmail,
    Unauthenticated,
    NotFound,
    RefreshFailed,
    Provider(String),
    Internal(String),
}

impl AppError {
    pub fn status(&self) -> u16 {
        use AppError::*;
        match self {
            Validation(_) | NoVerifiedEmail => 400,
            InvalidCredentials | Unauthenticated | RefreshFailed => 401,
            LockedOut => 403,
            NotFound => 404,
            Provider(_) => 502,
            Internal(_) => 500,
        }
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        use AppError::*;
        match self {
            Validation(msg) => write!(f, "{}", msg),
            InvalidCredentials => write!(f, "invalid email or password"),
            LockedOut => write!(f, "account temporarily locked"),
            NoVerifiedEmail => write!(f, "no verified email available from the provider"),
            Unauthenticated => write!(f, "authentication required"),
            NotFound => write!(f, "not found"),
            RefreshFailed => write!(f, "provider rejected the token refresh"),
            Provider(msg) => write!(f, "provider call failed: {}", msg),
            Internal(msg) => write!(f, "{}", msg),
        }
    }
}
impl std::error::Error for AppError {}

impl From<sqlx::Error> for AppError {
    fn from(e: sqlx::Error) -> Self {
        AppError::Internal(format!("database error {}", e))
    }
}

impl From<crate::Error> for AppError {
    fn from(e: crate::Error) -> Self {
        AppError::Internal(e.to_string())
    }
}

fn env_or(k: &str, default: &str) -> String {
    env::var(k).unwrap_or_else(|_| default.to_string())
}

lazy_static::lazy_static! {
    pub static ref CONFIG: Config = Config::load();

    // The "base" logger that everything should branch off of
    pub static ref BASE_LOG: slog::Logger = {
        let level: slog::Level = CONFIG.log_level
                .parse()
                .expect("invalid log_level");
        if CONFIG.log_format == "pretty" {
            let decorator = slog_term::TermDecorator::new().build();
            let drain = slog_term::CompactFormat::new(decorator).build().fuse();
            let drain = slog_async::Async::new(drain).build().fuse();
            let drain = slog::LevelFilter::new(drain, level).fuse();
            slog::Logger::root(drain, o!())
        } else {
            let drain = slog_json::Json::default(std::io::stderr()).fuse();
            let drain = slog_async::Async::new(drain).build().fuse();
            let drain = slog::LevelFilter::new(drain, level).fuse();
            slog::Logger::root(drain, o!())
        }
    };

    // Base logger
    pub static ref LOG: slog::Logger = BASE_LOG.new(slog::o!("app" => "resonate"));

    // one-time spotify login state tokens
    pub static ref ONE_TIME_TOKENS: Arc<Mutex<TimedCache<String, ()>>> =
        Arc::new(Mutex::new(TimedCache::with_lifespan(300)));
}

#[derive(serde::Deserialize)]
pub struct Config {
    pub version: String,
    pub ssl: bool,
    pub host: String,
    pub real_hostname: Option<String>,
    pub port: u16,
    pub log_format: String,
    pub log_level: String,
    pub spotify_client_id: String,
    pub spotify_secret_id: String,
    pub db_url: String,
    pub enc_key: String,
    pub auth_expiration_seconds: u64,
}
impl Config {
    pub fn load() -> Self {
        let version = fs::File::open("commit_hash.txt")
            .map(|mut f| {
                let mut s = String::new();
                f.read_to_string(&mut s).expect("Error reading commit_hash");
                s.trim().to_string()
            })
            .unwrap_or_else(|_| "unknown".to_string());
        Self {
            version,
            ssl: env_or("SSL", "false") == "true",
            host: env_or("HOST", "localhost"),
            real_hostname: env::var("REAL_HOSTNAME").ok(),
            port: env_or("PORT", "3030").parse().expect("invalid port"),
            log_format: env_or("LOG_FORMAT", "json")
                .to_lowercase()
                .trim()
                .to_string(),
            log_level: env_or("LOG_LEVEL", "INFO"),
            spotify_client_id: env_or("SPOTIFY_CLIENT_ID", "fake"),
            spotify_secret_id: env_or("SPOTIFY_SECRET_ID", "fake"),
            db_url: env_or("DATABASE_URL", "error"),
            enc_key: env_or("ENC_KEY", "01234567890123456789012345678901"),
            auth_expiration_seconds: env_or("AUTH_EXPIRATION_SECONDS", "2592000")
                .parse()
                .expect("invalid auth_expiration_seconds"),
        }
    }
    pub fn initialize(&self) -> anyhow::Result<()> {
        slog::info!(
            LOG, "initialized config";
            "version" => &CONFIG.version,
            "ssl" => &CONFIG.ssl,
            "host" => &CONFIG.host,
            "port" => &CONFIG.port,
            "log_format" => &CONFIG.log_format,
            "log_level" => &CONFIG.log_level,
        );
        Ok(())
    }
    pub fn host(&self) -> String {
        let p = if self.ssl { "https" } else { "http" };
        format!("{}://{}:{}", p, self.host, self.port)
    }
    /// The host we're reachable on from the outside, used for
    /// redirects and the advertised spotify callback url.
    pub fn redirect_host(&self) -> String {
        self.real_hostname.clone().unwrap_or_else(|| self.host())
    }
    pub fn spotify_redirect_url(&self) -> String {
        format!("{}/auth", self.redirect_host())
    }
    pub fn domain(&self) -> String {
        self.host.clone()
    }
}
