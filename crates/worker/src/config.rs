//! Worker configuration

use std::env;

use anyhow::Context;

/// Every 30 minutes, on the minute
pub const DEFAULT_RECONCILE_CRON: &str = "0 */30 * * * *";

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub database_url: String,
    pub database_max_connections: u32,
    pub supabase_url: String,
    pub supabase_service_role_key: String,
    /// Six-field cron expression (seconds first)
    pub reconcile_cron: String,
    /// Run one sweep immediately at startup
    pub reconcile_on_start: bool,
}

fn required(name: &str) -> anyhow::Result<String> {
    env::var(name)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .with_context(|| format!("Missing required environment variable: {}", name))
}

impl WorkerConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            database_url: required("DATABASE_URL")?,
            database_max_connections: env::var("DATABASE_MAX_CONNECTIONS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(5),
            supabase_url: required("SUPABASE_URL")?,
            supabase_service_role_key: required("SUPABASE_SERVICE_ROLE_KEY")?,
            reconcile_cron: env::var("RECONCILE_CRON")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_RECONCILE_CRON.to_string()),
            reconcile_on_start: env::var("RECONCILE_ON_START")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
        })
    }
}
