mod policy;
mod types;

pub use policy::{
    ConfigError, ExponentialPacerConfig, LinearPacerConfig, PacerConfig,
    PolicyConfig, PolicyFile, build_classifier,
};
pub use types::{Cli, Commands, ServiceArgs};
