use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub general: GeneralConfig,
    pub http: HttpConfig,
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub categories: CategoriesConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct GeneralConfig {
    /// Sliding interval (seconds) that active queries are spread across (§4.4).
    #[serde(default = "default_interval_seconds")]
    pub interval_seconds: u64,
    /// How many of the newest listings per query get the secondary
    /// enrichment fetch (§4.5, `K`).
    #[serde(default = "default_enrich_count")]
    pub enrich_count: usize,
    /// Idle sleep when there are no active queries at all (§4.4).
    #[serde(default = "default_poll_idle_seconds")]
    pub poll_idle_seconds: u64,
    /// Tick interval of the scheduler loop (§4.4 `sleep 10s`).
    #[serde(default = "default_tick_seconds")]
    pub tick_seconds: u64,
}

fn default_interval_seconds() -> u64 {
    120
}
fn default_enrich_count() -> usize {
    5
}
fn default_poll_idle_seconds() -> u64 {
    10
}
fn default_tick_seconds() -> u64 {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct HttpConfig {
    /// Overrides the default desktop Chrome user agent (§6.1) when set.
    #[serde(default)]
    pub user_agent: Option<String>,
    #[serde(default = "default_attempts")]
    pub attempts: u32,
    #[serde(default = "default_start_timeout_seconds")]
    pub start_timeout_seconds: f64,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

fn default_attempts() -> u32 {
    4
}
fn default_start_timeout_seconds() -> f64 {
    3.0
}
fn default_max_body_bytes() -> usize {
    10 * 1024 * 1024
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub postgres_url: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RedisConfig {
    pub url: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CategoriesConfig {
    pub l1_path: String,
    pub l2_path: String,
}
