use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::builder::DEFAULT_BATCH_SIZE;
use crate::face::FaceSelection;
use crate::matcher::{DEFAULT_THRESHOLD, DEFAULT_TOP_K};

/// Engine configuration, persisted as `config.yaml` under the data
/// directory. Absent fields fall back to their defaults, and the file is
/// created on first load so the knobs are discoverable.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// Calibration threshold `T` for similarity scoring. A squared distance
    /// of `T` or more scores 0%.
    #[serde(default = "default_threshold")]
    pub threshold: f32,

    /// Default number of results per search.
    #[serde(default = "default_top_k")]
    pub default_top_k: usize,

    /// Rows read from the store per batch during rebuild.
    #[serde(default = "default_batch_size")]
    pub rebuild_batch_size: usize,

    /// When true, a misaligned index/identifier pair fails the load instead
    /// of being served with an error logged.
    #[serde(default)]
    pub strict_consistency: bool,

    /// Multi-face tie-break: "first" or "largest".
    #[serde(default = "default_face_selection")]
    pub face_selection: String,

    #[serde(skip_serializing, skip_deserializing)]
    base_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            default_top_k: DEFAULT_TOP_K,
            rebuild_batch_size: DEFAULT_BATCH_SIZE,
            strict_consistency: false,
            face_selection: "first".to_string(),
            base_path: PathBuf::new(),
        }
    }
}

fn default_threshold() -> f32 {
    DEFAULT_THRESHOLD
}

fn default_top_k() -> usize {
    DEFAULT_TOP_K
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

fn default_face_selection() -> String {
    "first".to_string()
}

/// Data directory used when none is given: `~/.facedex`.
pub fn default_data_dir() -> PathBuf {
    homedir::my_home()
        .ok()
        .flatten()
        .map(|home| home.join(".facedex"))
        .unwrap_or_else(|| PathBuf::from(".facedex"))
}

impl Config {
    fn validate(&self) {
        if !self.threshold.is_finite() || self.threshold <= 0.0 {
            panic!("threshold must be greater than 0, got {}", self.threshold);
        }

        if self.default_top_k == 0 {
            panic!("default_top_k must be greater than 0");
        }

        if self.rebuild_batch_size == 0 {
            panic!("rebuild_batch_size must be greater than 0");
        }

        match self.face_selection.as_str() {
            "first" | "largest" => {}
            other => panic!("face_selection must be 'first' or 'largest', got '{other}'"),
        }
    }

    pub fn load_with(base_path: &Path) -> Self {
        std::fs::create_dir_all(base_path).expect("cannot create data directory");
        let config_path = base_path.join("config.yaml");

        // create new if does not exist
        if !config_path.exists() {
            std::fs::write(
                &config_path,
                serde_yml::to_string(&Self::default()).unwrap(),
            )
            .expect("cannot write default config");
        }

        let config_str =
            std::fs::read_to_string(&config_path).expect("config file is not readable");
        let mut config: Self = serde_yml::from_str(&config_str).expect("config is malformed");

        config.base_path = base_path.to_path_buf();
        config.validate();

        // resave in case config version needs an upgrade
        let resaved = serde_yml::to_string(&config).unwrap();
        if config_str != resaved {
            std::fs::write(&config_path, resaved).expect("cannot rewrite config");
        }

        config
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn selection(&self) -> FaceSelection {
        match self.face_selection.as_str() {
            "largest" => FaceSelection::Largest,
            _ => FaceSelection::First,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.threshold, 0.6);
        assert_eq!(config.default_top_k, 50);
        assert_eq!(config.rebuild_batch_size, 1000);
        assert!(!config.strict_consistency);
        assert_eq!(config.selection(), FaceSelection::First);
    }

    #[test]
    fn test_load_creates_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_with(dir.path());

        assert!(dir.path().join("config.yaml").exists());
        assert_eq!(config.threshold, 0.6);
        assert_eq!(config.base_path(), dir.path());
    }

    #[test]
    fn test_load_partial_config_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("config.yaml"),
            "threshold: 0.45\nface_selection: largest\n",
        )
        .unwrap();

        let config = Config::load_with(dir.path());
        assert_eq!(config.threshold, 0.45);
        assert_eq!(config.selection(), FaceSelection::Largest);
        assert_eq!(config.default_top_k, 50);
    }

    #[test]
    #[should_panic(expected = "face_selection")]
    fn test_invalid_selection_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.yaml"), "face_selection: biggest\n").unwrap();
        Config::load_with(dir.path());
    }

    #[test]
    #[should_panic(expected = "threshold")]
    fn test_zero_threshold_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.yaml"), "threshold: 0.0\n").unwrap();
        Config::load_with(dir.path());
    }
}
