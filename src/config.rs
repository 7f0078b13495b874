use std::env;

/// Runtime settings, read from the environment once at startup.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Optional full database URL; when absent the local file store is used.
    pub database_url: Option<String>,
    pub db_path: String,
    pub port: u16,
    pub host: String,
    pub log_level: String,
}

impl Settings {
    pub fn from_env() -> Self {
        Self {
            database_url: env::var("DATABASE_URL").ok().filter(|v| !v.is_empty()),
            db_path: env::var("DB_PATH").unwrap_or_else(|_| "data/trading_lab.db".to_string()),
            port: env::var("PORT").ok().and_then(|v| v.parse().ok()).unwrap_or(8000),
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        }
    }

    /// Connection string handed to the pool.
    pub fn effective_database_url(&self) -> String {
        match &self.database_url {
            Some(url) => url.clone(),
            None => format!("sqlite://{}", self.db_path),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_url: None,
            db_path: "data/trading_lab.db".to_string(),
            port: 8000,
            host: "0.0.0.0".to_string(),
            log_level: "info".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effective_url_falls_back_to_file() {
        let settings = Settings::default();
        assert_eq!(settings.effective_database_url(), "sqlite://data/trading_lab.db");
    }

    #[test]
    fn test_explicit_url_wins() {
        let settings = Settings {
            database_url: Some("sqlite::memory:".to_string()),
            ..Settings::default()
        };
        assert_eq!(settings.effective_database_url(), "sqlite::memory:");
    }
}
