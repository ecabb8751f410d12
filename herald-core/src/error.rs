use thiserror::Error;

#[derive(Error, Debug)]
pub enum HeraldError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Invalid configuration:\n  - {}", problems.join("\n  - "))]
    InvalidConfig { problems: Vec<String> },
}
