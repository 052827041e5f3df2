//! Runtime configuration: defaults, `<serverDir>/../.env` (literal
//! `KEY=VALUE`, no `$VAR` expansion — see Open Question 3), then the
//! process environment, in that precedence order (existing env vars win).

use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,
    pub logs_dir: PathBuf,
    pub vault_secret: String,
    pub oauth_base_url: String,
    pub oauth_github_client_id: Option<String>,
    pub oauth_github_client_secret: Option<String>,
    pub oauth_google_client_id: Option<String>,
    pub oauth_google_client_secret: Option<String>,
    pub openai_api_key: Option<String>,
    pub vite_dev: bool,
}

impl Config {
    /// Load from the process environment, after applying a `.env` file
    /// found next to the server binary's working directory (if any).
    pub fn load() -> Self {
        load_dot_env();

        let host = env_or("HOST", "127.0.0.1");
        let port: u16 = std::env::var("PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(8787);

        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        let db_path = std::env::var("DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| cwd.join("climpire.sqlite"));
        let logs_dir = std::env::var("LOGS_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| cwd.join("logs"));

        let vault_secret = std::env::var("OAUTH_ENCRYPTION_SECRET")
            .or_else(|_| std::env::var("SESSION_SECRET"))
            .unwrap_or_else(|_| {
                tracing::warn!(
                    "neither OAUTH_ENCRYPTION_SECRET nor SESSION_SECRET set; \
                     using an ephemeral vault key, tokens will not survive a restart"
                );
                uuid::Uuid::new_v4().to_string()
            });

        let oauth_base_url =
            std::env::var("OAUTH_BASE_URL").unwrap_or_else(|_| format!("http://{host}:{port}"));

        Config {
            host,
            port,
            db_path,
            logs_dir,
            vault_secret,
            oauth_base_url,
            oauth_github_client_id: std::env::var("OAUTH_GITHUB_CLIENT_ID").ok(),
            oauth_github_client_secret: std::env::var("OAUTH_GITHUB_CLIENT_SECRET").ok(),
            oauth_google_client_id: std::env::var("OAUTH_GOOGLE_CLIENT_ID").ok(),
            oauth_google_client_secret: std::env::var("OAUTH_GOOGLE_CLIENT_SECRET").ok(),
            openai_api_key: std::env::var("OPENAI_API_KEY").ok(),
            vite_dev: std::env::var("VITE_DEV").is_ok(),
        }
    }

    pub fn log_filter_default() -> &'static str {
        "climpire=info,tower_http=warn"
    }
}

/// Reads `<cwd>/../.env` (mirroring `<serverDir>/../.env`) and sets any
/// variable not already present in the process environment. Lines are
/// `KEY=VALUE`; blank lines and lines starting with `#` are skipped.
/// Deliberately does not expand `$VAR` references in values — the right-hand
/// side is stored literally, byte for byte after trimming.
fn load_dot_env() {
    let cwd = match std::env::current_dir() {
        Ok(p) => p,
        Err(_) => return,
    };
    let candidate = cwd.join("..").join(".env");
    let contents = match std::fs::read_to_string(&candidate) {
        Ok(c) => c,
        Err(_) => return,
    };

    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        let mut value = value.trim();
        if (value.starts_with('"') && value.ends_with('"') && value.len() >= 2)
            || (value.starts_with('\'') && value.ends_with('\'') && value.len() >= 2)
        {
            value = &value[1..value.len() - 1];
        }
        if std::env::var(key).is_err() {
            // SAFETY: single-threaded at startup, before any config reader runs.
            unsafe {
                std::env::set_var(key, value);
            }
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_or_falls_back_to_default_when_unset() {
        std::env::remove_var("CLIMPIRE_TEST_UNSET_VAR");
        assert_eq!(env_or("CLIMPIRE_TEST_UNSET_VAR", "fallback"), "fallback");
    }

    #[test]
    fn log_filter_default_matches_spec() {
        assert_eq!(Config::log_filter_default(), "climpire=info,tower_http=warn");
    }
}
