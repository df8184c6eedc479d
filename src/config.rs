use serde::{Deserialize, Serialize};
use std::{env, fs, path::PathBuf};
use tracing::{debug, error};

/// Persisted defaults for `multicam-tally run`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct Config {
    pub cameras: Vec<u32>,
    pub allow_list: PathBuf,
    pub frames_dir: PathBuf,
    pub refresh_ms: u64,
    pub display_tick_ms: u64,
    pub read_retry_ms: u64,
    pub model: String,
    pub model_repo: String,
    pub confidence: f32,
    pub iou: f32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cameras: vec![0, 2],
            allow_list: PathBuf::from("allowed_objects.txt"),
            frames_dir: PathBuf::from("frames"),
            refresh_ms: 500,
            display_tick_ms: 10,
            read_retry_ms: 10,
            model: "yolov8n-onnx-web/yolov8n.onnx".to_string(),
            model_repo: "salim4n/yolov8n-detect-onnx".to_string(),
            confidence: 0.25,
            iou: 0.45,
        }
    }
}

pub fn config_path() -> PathBuf {
    env::var_os("MULTICAM_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("multicam.json"))
}

/// Loads the config file, falling back to defaults if it is missing or invalid.
pub fn load_config() -> Config {
    let path = config_path();
    if let Ok(data) = fs::read(&path) {
        match serde_json::from_slice(&data) {
            Ok(cfg) => return cfg,
            Err(e) => error!(path = %path.display(), "ignoring invalid config: {e}"),
        }
    }
    debug!(path = %path.display(), "using default config");
    Config::default()
}

pub fn save_config(cfg: &Config) {
    let path = config_path();
    if let Some(parent) = path.parent() {
        let _ = fs::create_dir_all(parent);
    }
    match serde_json::to_vec_pretty(cfg) {
        Ok(data) => {
            if let Err(e) = fs::write(&path, data) {
                error!("failed to write config: {e}");
            }
        }
        Err(e) => error!("failed to encode config: {e}"),
    }
}
