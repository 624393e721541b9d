use std::path::Path;

use anyhow::{Context, Result};

use crate::config::AppConfig;

pub mod height;
pub mod init_config;
pub mod run;

fn load_config(path: Option<&Path>) -> Result<AppConfig> {
    match path {
        Some(path) => AppConfig::from_file(path)
            .with_context(|| format!("failed to load config from {}", path.display())),
        None => Ok(AppConfig::default()),
    }
}
