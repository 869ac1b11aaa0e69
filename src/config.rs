use anyhow::Result;
use clap::Parser;
use serde::Deserialize;
use serde_yaml;
use std::env;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::sanitize::SanitizeOptions;

#[derive(Parser, Debug)]
#[command(name = "maskdeck")]
#[command(about = "Runs the maskdeck service", long_about = None)]
pub struct Cli {
    #[arg(short = 'c', long = "config")]
    pub config_path: Option<String>,
}

pub fn default_config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".maskdeck")
}

pub fn default_config_path() -> PathBuf {
    default_config_dir().join("config.yaml")
}

#[derive(Debug, Deserialize, Clone)]
pub struct App {
    #[serde(default = "default_database")]
    database: String,
    #[serde(default = "default_port")]
    port: i32,
}

fn default_database() -> String {
    "maskdeck.db".to_string()
}

fn default_port() -> i32 {
    8420
}

impl Default for App {
    fn default() -> Self {
        App {
            database: default_database(),
            port: default_port(),
        }
    }
}

impl App {
    pub fn get_db(&self) -> &str {
        return &self.database;
    }

    pub fn get_port(&self) -> i32 {
        return self.port;
    }
}

/// Tunables for cleaning up suggested masks. The thresholds are empirical.
#[derive(Debug, Deserialize, Clone)]
pub struct MaskSettings {
    #[serde(default = "default_max_suggestions")]
    pub max_suggestions: usize,
    #[serde(default = "default_iou_threshold")]
    pub iou_threshold: f64,
    #[serde(default = "default_min_area")]
    pub min_area: f64,
    #[serde(default = "default_label_max_chars")]
    pub label_max_chars: usize,
    #[serde(default = "default_suggest_timeout")]
    pub suggest_timeout_secs: u64,
}

fn default_max_suggestions() -> usize {
    24
}

fn default_iou_threshold() -> f64 {
    0.70
}

fn default_min_area() -> f64 {
    0.0004
}

fn default_label_max_chars() -> usize {
    crate::model::LABEL_MAX_CHARS
}

fn default_suggest_timeout() -> u64 {
    45
}

impl Default for MaskSettings {
    fn default() -> Self {
        MaskSettings {
            max_suggestions: default_max_suggestions(),
            iou_threshold: default_iou_threshold(),
            min_area: default_min_area(),
            label_max_chars: default_label_max_chars(),
            suggest_timeout_secs: default_suggest_timeout(),
        }
    }
}

impl MaskSettings {
    pub fn suggest_timeout(&self) -> Duration {
        Duration::from_secs(self.suggest_timeout_secs)
    }

    pub fn sanitize_options(&self) -> SanitizeOptions {
        SanitizeOptions {
            max_n: self.max_suggestions,
            iou_threshold: self.iou_threshold,
            min_area: self.min_area,
            label_max_chars: self.label_max_chars,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct NoteSettings {
    #[serde(default = "default_image_class")]
    pub image_class: String,
}

fn default_image_class() -> String {
    "aioe-img".to_string()
}

impl Default for NoteSettings {
    fn default() -> Self {
        NoteSettings {
            image_class: default_image_class(),
        }
    }
}

#[derive(Debug, Deserialize, Default, Clone)]
pub struct Config {
    #[serde(default)]
    pub app: App,
    #[serde(default)]
    pub masks: MaskSettings,
    #[serde(default)]
    pub notes: NoteSettings,
}

impl Config {
    pub fn new(path: &str) -> Result<Self> {
        let cfg = Config::load_config(path)?;
        Ok(cfg)
    }

    pub fn from_yaml(yaml_str: &str) -> Result<Config> {
        let yaml_with_env = Config::substitute_env_vars(yaml_str)?;
        let config: Config = serde_yaml::from_str(&yaml_with_env)?;
        config.validate()?;
        Ok(config)
    }

    fn load_config(path: &str) -> Result<Config> {
        let yaml_str = fs::read_to_string(path)?;
        Config::from_yaml(&yaml_str)
    }

    fn validate(&self) -> Result<()> {
        let m = &self.masks;
        if !(m.iou_threshold > 0.0 && m.iou_threshold <= 1.0) {
            anyhow::bail!("masks.iou_threshold must be in (0, 1], got {}", m.iou_threshold);
        }
        if !(m.min_area >= 0.0 && m.min_area < 1.0) {
            anyhow::bail!("masks.min_area must be in [0, 1), got {}", m.min_area);
        }
        if m.max_suggestions == 0 {
            anyhow::bail!("masks.max_suggestions must be at least 1");
        }
        Ok(())
    }

    fn substitute_env_vars(yaml_str: &str) -> Result<String> {
        let mut result = yaml_str.to_string();
        let mut offset = 0;

        while let Some(start) = result[offset..].find("${") {
            let actual_start = offset + start;
            if let Some(end) = result[actual_start..].find("}") {
                let var_name = &result[actual_start + 2..actual_start + end];

                // ${VAR:-default}
                let env_value = if let Some(default_start) = var_name.find(":-") {
                    let actual_var = &var_name[..default_start];
                    let default_val = &var_name[default_start + 2..];
                    env::var(actual_var).unwrap_or_else(|_| default_val.to_string())
                } else {
                    env::var(var_name).unwrap_or_else(|_| {
                        tracing::warn!("environment variable '{}' not found", var_name);
                        String::new()
                    })
                };

                result.replace_range(actual_start..actual_start + end + 1, &env_value);
                offset = actual_start + env_value.len();
            } else {
                break;
            }
        }

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_falls_back_to_defaults() {
        let cfg = Config::from_yaml("{}").unwrap();
        assert_eq!(cfg.app.get_port(), 8420);
        assert_eq!(cfg.masks.max_suggestions, 24);
        assert_eq!(cfg.masks.iou_threshold, 0.70);
        assert_eq!(cfg.masks.min_area, 0.0004);
        assert_eq!(cfg.notes.image_class, "aioe-img");
    }

    #[test]
    fn substitutes_env_defaults() {
        let yaml = "app:\n  database: ${MASKDECK_TEST_UNSET_DB:-fallback.db}\n  port: 9000\n";
        let cfg = Config::from_yaml(yaml).unwrap();
        assert_eq!(cfg.app.get_db(), "fallback.db");
        assert_eq!(cfg.app.get_port(), 9000);
    }

    #[test]
    fn rejects_out_of_range_threshold() {
        let yaml = "masks:\n  iou_threshold: 1.5\n";
        assert!(Config::from_yaml(yaml).is_err());
    }

    #[test]
    fn sanitize_options_follow_mask_settings() {
        let yaml = "masks:\n  max_suggestions: 5\n  iou_threshold: 0.5\n";
        let opts = Config::from_yaml(yaml).unwrap().masks.sanitize_options();
        assert_eq!(opts.max_n, 5);
        assert_eq!(opts.iou_threshold, 0.5);
        assert_eq!(opts.min_area, 0.0004);
    }
}
