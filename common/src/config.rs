//! Configuración por variables de entorno, con defaults para correr local.

use std::env;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8080";
pub const DEFAULT_DRIVER_URL: &str = "http://localhost:8080";
pub const DEFAULT_GROUP_ID: &str = "demo";
pub const MAX_TASK_ATTEMPTS: u32 = 3;
pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(20);
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(5);
pub const OPERATOR_TIMEOUT: Duration = Duration::from_millis(30_000);
pub const POLL_INTERVAL: Duration = Duration::from_millis(200);
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// Lee `key` y la parsea; si falta o no parsea usa `default`.
fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.trim().parse::<T>().ok())
        .unwrap_or(default)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverConfig {
    pub listen_addr: String,
    /// Registros permitidos por task antes de declarar el grupo irrecuperable.
    pub max_task_attempts: u32,
    pub heartbeat_timeout: Duration,
    pub sweep_interval: Duration,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
            max_task_attempts: MAX_TASK_ATTEMPTS,
            heartbeat_timeout: HEARTBEAT_TIMEOUT,
            sweep_interval: SWEEP_INTERVAL,
        }
    }
}

impl DriverConfig {
    /// - `GC_LISTEN_ADDR`
    /// - `GC_MAX_TASK_ATTEMPTS`
    /// - `GC_HEARTBEAT_TIMEOUT_SECS`
    /// - `GC_SWEEP_INTERVAL_SECS`
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            listen_addr: env_or("GC_LISTEN_ADDR", d.listen_addr),
            max_task_attempts: env_or("GC_MAX_TASK_ATTEMPTS", d.max_task_attempts).max(1),
            heartbeat_timeout: Duration::from_secs(env_or(
                "GC_HEARTBEAT_TIMEOUT_SECS",
                d.heartbeat_timeout.as_secs(),
            )),
            sweep_interval: Duration::from_secs(
                env_or("GC_SWEEP_INTERVAL_SECS", d.sweep_interval.as_secs()).max(1),
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskConfig {
    pub driver_url: String,
    pub task_id: String,
    pub group_id: String,
    pub operator_timeout: Duration,
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
}

/// `hostname-xxxxxxxx`, único aunque haya varios tasks en el mismo host.
pub fn default_task_id() -> String {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "task".to_string());
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", host, &suffix[..8])
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            driver_url: DEFAULT_DRIVER_URL.to_string(),
            task_id: default_task_id(),
            group_id: DEFAULT_GROUP_ID.to_string(),
            operator_timeout: OPERATOR_TIMEOUT,
            poll_interval: POLL_INTERVAL,
            heartbeat_interval: HEARTBEAT_INTERVAL,
        }
    }
}

impl TaskConfig {
    /// - `DRIVER_URL` (en Docker: http://driver:8080)
    /// - `TASK_ID`, `GROUP_ID`
    /// - `GC_OPERATOR_TIMEOUT_MS`, `GC_POLL_INTERVAL_MS`, `GC_HEARTBEAT_INTERVAL_SECS`
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            driver_url: env_or("DRIVER_URL", d.driver_url)
                .trim_end_matches('/')
                .to_string(),
            task_id: env_or("TASK_ID", d.task_id),
            group_id: env_or("GROUP_ID", d.group_id),
            operator_timeout: Duration::from_millis(env_or(
                "GC_OPERATOR_TIMEOUT_MS",
                d.operator_timeout.as_millis() as u64,
            )),
            poll_interval: Duration::from_millis(env_or(
                "GC_POLL_INTERVAL_MS",
                d.poll_interval.as_millis() as u64,
            )),
            heartbeat_interval: Duration::from_secs(env_or(
                "GC_HEARTBEAT_INTERVAL_SECS",
                d.heartbeat_interval.as_secs(),
            )),
        }
    }
}
