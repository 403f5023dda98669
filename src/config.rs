use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Local;
use rand::Rng;

/// Items shown per listing page. The site renders 120 per page; there is no
/// reliable element to read it from, so it stays fixed.
pub const ITEMS_PER_PAGE: u64 = 120;

const SETTINGS_FILE: &str = "settings.txt";

/// Full runtime configuration, loaded once from the settings file plus the
/// environment. Cloned into every worker.
#[derive(Debug, Clone)]
pub struct Config {
    pub headless: bool,
    pub user_id: String,
    pub password: String,
    pub start_page: u64,
    pub end_page: u64,
    pub target_organizations: Vec<String>,
    pub min_sleep: f64,
    pub max_sleep: f64,
    pub max_retries: u32,
    pub save_interval: usize,
    pub worker_count: usize,
    pub login_settle: Duration,
    pub error_cooldown: Duration,
    pub maintenance_cooldown: Duration,
    pub retention_days: u64,
    pub input_file: PathBuf,
    pub output_dir: PathBuf,
    pub tmp_csv_dir: PathBuf,
    pub tmp_log_dir: PathBuf,
    pub auth_state_path: PathBuf,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        // The settings file is optional; a plain environment works too.
        let _ = dotenvy::from_path(SETTINGS_FILE);

        let user_id = env::var("USER_ID").context("USER_ID is not set")?;
        let password = env::var("PASSWORD").context("PASSWORD is not set")?;

        Ok(Self {
            headless: env::var("HEADLESS")
                .map(|v| Self::headless_from(&v))
                .unwrap_or(true),
            user_id,
            password,
            start_page: env_or("START_PAGE", 1)?,
            end_page: env_or("END_PAGE", 10)?,
            target_organizations: parse_target_list(
                &env::var("TARGET_COMPANIES").unwrap_or_default(),
            ),
            min_sleep: env_or("MIN_SLEEP", 2.0)?,
            max_sleep: env_or("MAX_SLEEP", 4.0)?,
            max_retries: env_or("MAX_RETRIES", 3)?,
            save_interval: env_or("SAVE_INTERVAL", 100)?,
            worker_count: env_or("WORKER_COUNT", 1)?,
            login_settle: Duration::from_secs_f64(env_or("WAIT_TIME_LOGIN", 5.0)?),
            error_cooldown: Duration::from_secs_f64(env_or("WAIT_TIME_ERROR", 10.0)?),
            maintenance_cooldown: Duration::from_secs_f64(env_or("WAIT_TIME_MAINTENANCE", 20.0)?),
            retention_days: env_or("LOG_RETENTION_DAYS", 10)?,
            input_file: PathBuf::from(env::var("INPUT_FILE").unwrap_or_else(|_| "input.csv".into())),
            output_dir: PathBuf::from("output"),
            tmp_csv_dir: PathBuf::from("tmp").join("csv"),
            tmp_log_dir: PathBuf::from("tmp").join("log"),
            auth_state_path: PathBuf::from("auth_state.json"),
        })
    }

    pub fn output_file(&self) -> PathBuf {
        self.output_dir
            .join(format!("{}.xlsx", Local::now().format("%Y%m%d")))
    }

    /// Randomized inter-request delay within the configured window.
    pub fn request_delay(&self) -> Duration {
        let secs = if self.max_sleep > self.min_sleep {
            rand::thread_rng().gen_range(self.min_sleep..self.max_sleep)
        } else {
            self.min_sleep
        };
        Duration::from_secs_f64(secs)
    }

    /// Empty allow-list means no filtering.
    pub fn is_targeted(&self, organization: &str) -> bool {
        self.target_organizations.is_empty()
            || self.target_organizations.iter().any(|t| t == organization)
    }

    /// Parse "true"/"false" style flags the way the settings file writes them.
    pub fn headless_from(raw: &str) -> bool {
        raw.trim().eq_ignore_ascii_case("true")
    }
}

fn env_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("invalid value for {key}: {raw:?}")),
        Err(_) => Ok(default),
    }
}

fn parse_target_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_list_splits_and_trims() {
        let list = parse_target_list(" Acme Co, , Beta 商事 ,");
        assert_eq!(list, vec!["Acme Co".to_string(), "Beta 商事".to_string()]);
    }

    #[test]
    fn empty_target_list_filters_nothing() {
        assert!(parse_target_list("").is_empty());
        assert!(parse_target_list(" , ,").is_empty());
    }

    #[test]
    fn headless_flag_is_case_insensitive() {
        assert!(Config::headless_from("TRUE"));
        assert!(Config::headless_from(" true "));
        assert!(!Config::headless_from("false"));
        assert!(!Config::headless_from("yes"));
    }
}
