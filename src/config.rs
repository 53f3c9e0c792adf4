use anyhow::Result;
use clap::Parser;
use serde::Deserialize;
use serde_yaml;
use std::env;
use std::fs;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "adipura")]
#[command(about = "Runs the Bumi Adipura resident service", long_about = None)]
pub struct Cli {
    #[arg(short = 'c', long = "config")]
    pub config_path: Option<String>,
}

pub fn default_config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".adipura")
}

pub fn default_config_path() -> PathBuf {
    default_config_dir().join("config.yaml")
}

#[derive(Debug, Deserialize, Clone)]
pub struct App {
    app_id: String,
    database: String,
    port: i32,
    #[serde(default)]
    pub turso_url: Option<String>,
    #[serde(default)]
    pub turso_auth_token: Option<String>,
    #[serde(default = "default_sync_interval")]
    pub sync_interval_seconds: u64,
}

fn default_sync_interval() -> u64 {
    60
}

impl Default for App {
    fn default() -> Self {
        App {
            app_id: "bumi-adipura".to_string(),
            database: "adipura.db".to_string(),
            port: 8080,
            turso_url: None,
            turso_auth_token: None,
            sync_interval_seconds: default_sync_interval(),
        }
    }
}

impl App {
    pub fn get_app_id(&self) -> &str {
        &self.app_id
    }

    pub fn get_db(&self) -> &str {
        &self.database
    }

    pub fn get_port(&self) -> i32 {
        self.port
    }
}

#[derive(Debug, Deserialize, Clone, Copy)]
pub struct Compression {
    #[serde(default = "default_max_width")]
    pub max_width: u32,
    #[serde(default = "default_quality")]
    pub quality: f32,
}

fn default_max_width() -> u32 {
    800
}

fn default_quality() -> f32 {
    0.7
}

impl Default for Compression {
    fn default() -> Self {
        Compression {
            max_width: default_max_width(),
            quality: default_quality(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Weather {
    #[serde(default = "default_weather_url")]
    pub url: String,
    pub latitude: f64,
    pub longitude: f64,
}

fn default_weather_url() -> String {
    "https://api.open-meteo.com/v1/forecast".to_string()
}

impl Default for Weather {
    fn default() -> Self {
        // Bumi Adipura, Bandung
        Weather {
            url: default_weather_url(),
            latitude: -6.9389,
            longitude: 107.7166,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Assistant {
    #[serde(default = "default_assistant_url")]
    pub url: String,
    #[serde(default = "default_assistant_model")]
    pub model: String,
    #[serde(default)]
    pub api_key: String,
}

fn default_assistant_url() -> String {
    "https://generativelanguage.googleapis.com/v1beta/models".to_string()
}

fn default_assistant_model() -> String {
    "gemini-2.5-flash".to_string()
}

impl Default for Assistant {
    fn default() -> Self {
        Assistant {
            url: default_assistant_url(),
            model: default_assistant_model(),
            api_key: String::new(),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct Config {
    pub app: App,
    #[serde(default)]
    pub compression: Compression,
    #[serde(default)]
    pub weather: Weather,
    #[serde(default)]
    pub assistant: Assistant,
}

impl Config {
    pub fn new(path: &str) -> Result<Self> {
        let cfg = Config::load_config(path)?;
        Ok(cfg)
    }

    fn load_config(path: &str) -> Result<Config> {
        let yaml_str = fs::read_to_string(path)?;
        Config::from_yaml(&yaml_str)
    }

    pub fn from_yaml(yaml_str: &str) -> Result<Config> {
        let yaml_with_env = Config::substitute_env_vars(yaml_str)?;
        let config: Config = serde_yaml::from_str(&yaml_with_env)?;
        if !(0.0..=1.0).contains(&config.compression.quality) {
            anyhow::bail!(
                "compression.quality must be within 0.0..=1.0, got {}",
                config.compression.quality
            );
        }
        Ok(config)
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
