use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error(
        "Config file not found. Checked:\n\
        - $VPCFLOW_CONFIG_PATH\n\
        - ./vpcflow.yaml\n\
        - ./.vpcflow/vpcflow.yaml\n\
        - ~/.config/vpcflow/config.yaml"
    )]
    ConfigFileNotFound,

    #[error("Invalid config: {0}")]
    Invalid(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

pub type Result<T> = std::result::Result<T, ConfigError>;
