use std::path::Path;

/// Deployment environment, read from `APP_ENV`
#[derive(Debug, Clone, PartialEq)]
pub enum Environment {
    Local,
    Development,
    Staging,
    Production,
    Testing,
    Custom(String),
}

impl Environment {
    /// Detect environment from APP_ENV or default to Local
    pub fn detect() -> Self {
        Self::parse(std::env::var("APP_ENV").ok().as_deref())
    }

    fn parse(value: Option<&str>) -> Self {
        match value {
            Some("production") => Self::Production,
            Some("staging") => Self::Staging,
            Some("development") => Self::Development,
            Some("testing") => Self::Testing,
            Some("local") | None => Self::Local,
            Some(other) => Self::Custom(other.to_string()),
        }
    }

    /// The `.env.{suffix}` this environment loads
    pub fn env_file_suffix(&self) -> &str {
        match self {
            Self::Local => "local",
            Self::Production => "production",
            Self::Staging => "staging",
            Self::Development => "development",
            Self::Testing => "testing",
            Self::Custom(name) => name.as_str(),
        }
    }

    pub fn is_production(&self) -> bool {
        matches!(self, Self::Production)
    }
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.env_file_suffix())
    }
}

/// Load environment variables from .env files
///
/// Precedence (later wins):
/// 1. .env
/// 2. .env.local
/// 3. .env.{environment}
/// 4. .env.{environment}.local
/// 5. the real process environment
pub fn load_dotenv(project_root: &Path) -> Environment {
    let env = Environment::detect();
    let suffix = env.env_file_suffix();

    // dotenvy never overwrites a variable that is already set, so the most
    // specific file has to be loaded first.
    for file in [
        format!(".env.{}.local", suffix),
        format!(".env.{}", suffix),
        ".env.local".to_string(),
        ".env".to_string(),
    ] {
        let _ = dotenvy::from_path(project_root.join(file));
    }

    env
}

/// Read an environment variable, falling back to `default` when unset or unparsable
///
/// ```
/// use cadence::config::env;
///
/// let port: u16 = env("SERVER_PORT", 8000);
/// ```
pub fn env<T: std::str::FromStr>(key: &str, default: T) -> T {
    env_optional(key).unwrap_or(default)
}

/// Read an optional environment variable
pub fn env_optional<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_known_and_custom_environments() {
        assert_eq!(Environment::parse(None), Environment::Local);
        assert_eq!(Environment::parse(Some("production")), Environment::Production);
        assert_eq!(
            Environment::parse(Some("qa")),
            Environment::Custom("qa".to_string())
        );
        assert_eq!(Environment::parse(Some("qa")).to_string(), "qa");
    }

    #[test]
    fn env_falls_back_on_garbage() {
        std::env::set_var("CADENCE_TEST_GARBAGE_PORT", "not-a-port");
        let port: u16 = env("CADENCE_TEST_GARBAGE_PORT", 8000);
        assert_eq!(port, 8000);

        std::env::set_var("CADENCE_TEST_BLANK", "  ");
        let blank: Option<String> = env_optional("CADENCE_TEST_BLANK");
        assert_eq!(blank, None);
    }
}
