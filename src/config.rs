use std::env;
use std::time::Duration;

use crate::engine::EngineSettings;
use crate::error::AppError;

#[derive(Debug, Clone)]
pub struct Config {
    pub http_port: u16,
    pub log_level: String,
    pub event_buffer_size: usize,
    pub sweep_interval_secs: u64,
    pub sweep_batch_size: usize,
    pub sweep_min_age_mins: i64,
    pub otp_ttl_mins: i64,
    pub assign_max_attempts: u32,
    pub store_timeout_ms: u64,
    pub courier_timeout_ms: u64,
    pub notify_timeout_ms: u64,
    pub courier_base_url: Option<String>,
    pub courier_api_key: Option<String>,
    pub courier_webhook_token: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        let _ = dotenvy::dotenv();

        Ok(Self {
            http_port: parse_or_default("HTTP_PORT", 3000)?,
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            event_buffer_size: parse_or_default("EVENT_BUFFER_SIZE", 1024)?,
            sweep_interval_secs: parse_or_default("SWEEP_INTERVAL_SECS", 300)?,
            sweep_batch_size: parse_or_default("SWEEP_BATCH_SIZE", 10)?,
            sweep_min_age_mins: parse_or_default("SWEEP_MIN_AGE_MINS", 10)?,
            otp_ttl_mins: parse_or_default("OTP_TTL_MINS", 30)?,
            assign_max_attempts: parse_or_default("ASSIGN_MAX_ATTEMPTS", 5)?,
            store_timeout_ms: parse_or_default("STORE_TIMEOUT_MS", 2_000)?,
            courier_timeout_ms: parse_or_default("COURIER_TIMEOUT_MS", 5_000)?,
            notify_timeout_ms: parse_or_default("NOTIFY_TIMEOUT_MS", 3_000)?,
            courier_base_url: optional("COURIER_BASE_URL"),
            courier_api_key: optional("COURIER_API_KEY"),
            courier_webhook_token: optional("COURIER_WEBHOOK_TOKEN"),
        })
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            sweep_batch_size: self.sweep_batch_size,
            sweep_min_age: chrono::Duration::minutes(self.sweep_min_age_mins),
            otp_ttl: chrono::Duration::minutes(self.otp_ttl_mins),
            assign_max_attempts: self.assign_max_attempts.max(1),
            store_timeout: Duration::from_millis(self.store_timeout_ms),
            courier_timeout: Duration::from_millis(self.courier_timeout_ms),
            notify_timeout: Duration::from_millis(self.notify_timeout_ms),
        }
    }
}

fn parse_or_default<T>(key: &str, default: T) -> Result<T, AppError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|err| AppError::Internal(format!("invalid {key}: {err}"))),
        Err(_) => Ok(default),
    }
}

fn optional(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}
