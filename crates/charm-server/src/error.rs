use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required environment variable: {env_var}")]
    MissingEnvVar { env_var: String },
    #[error("Configuration error: {0}")]
    Other(#[from] config::ConfigError),
}

/// Map a dotted config path to the environment variable that sets it
pub fn to_env_var(field_path: &str) -> String {
    let path = field_path
        .split('.')
        .map(|part| part.to_uppercase())
        .collect::<Vec<_>>()
        .join("__");
    format!("CHARM_{}", path)
}
