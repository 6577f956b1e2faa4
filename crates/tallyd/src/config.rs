use crate::routing::RoutingPolicy;
use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tally_camera::alarm::DEFAULT_END_MARKER;
use tally_camera::{CaptureLimits, ListenerConfig, RtspSource};
use tally_core::{MatchThresholds, Metric};

/// Which [`tally_core::FaceProvider`] the daemon runs with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Fixed embedding, one face per image. For wiring tests without models.
    #[default]
    Mock,
    Onnx,
}

impl FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mock" => Ok(Self::Mock),
            "onnx" => Ok(Self::Onnx),
            other => Err(format!("unknown provider: {other}")),
        }
    }
}

/// Daemon configuration: an optional TOML file plus `TALLY_*` overrides.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub recognition: RecognitionConfig,
    pub attendance: AttendanceConfig,
    pub dispatcher: DispatcherConfig,
    pub storage: StorageConfig,
    pub camera: CameraConfig,
    pub routing: RoutingPolicy,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RecognitionConfig {
    pub provider: ProviderKind,
    /// Directory containing `det_10g.onnx` and `w600k_r50.onnx`.
    pub model_dir: PathBuf,
    pub metric: Metric,
    pub match_distance: f32,
    pub low_confidence_distance: f32,
}

impl Default for RecognitionConfig {
    fn default() -> Self {
        let thresholds = MatchThresholds::default();
        Self {
            provider: ProviderKind::default(),
            model_dir: data_dir().join("models"),
            metric: Metric::default(),
            match_distance: thresholds.match_distance,
            low_confidence_distance: thresholds.low_confidence_distance,
        }
    }
}

impl RecognitionConfig {
    pub fn thresholds(&self) -> MatchThresholds {
        MatchThresholds {
            match_distance: self.match_distance,
            low_confidence_distance: self.low_confidence_distance,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AttendanceConfig {
    /// Minimum seconds between two accepted entries of one employee.
    pub cooldown_secs: u64,
}

impl Default for AttendanceConfig {
    fn default() -> Self {
        Self { cooldown_secs: 300 }
    }
}

impl AttendanceConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    pub max_concurrent: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self { max_concurrent: 5 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub db_path: PathBuf,
    /// Archive root for routed snapshots.
    pub recognized_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        let data = data_dir();
        Self {
            db_path: data.join("attendance.db"),
            recognized_dir: data.join("recognized"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    pub enabled: bool,
    pub host: String,
    pub event_port: u16,
    pub rtsp_port: u16,
    pub user: String,
    pub password: String,
    pub stream_path: String,
    pub snapshot_dir: PathBuf,
    pub reconnect_base_secs: u64,
    pub reconnect_max_secs: u64,
    pub connect_timeout_secs: u64,
    pub capture_timeout_secs: u64,
    /// Silence on the event channel longer than this is logged, not fatal.
    pub idle_timeout_secs: u64,
    /// `Alarm_flag` value that triggers a capture.
    pub alarm_flag: String,
    pub min_snapshot_bytes: u64,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: String::new(),
            event_port: 15002,
            rtsp_port: 554,
            user: "admin".to_string(),
            password: String::new(),
            stream_path: "stream1".to_string(),
            snapshot_dir: data_dir().join("snapshots"),
            reconnect_base_secs: 5,
            reconnect_max_secs: 60,
            connect_timeout_secs: 10,
            capture_timeout_secs: 10,
            idle_timeout_secs: 60,
            alarm_flag: "1".to_string(),
            min_snapshot_bytes: 1000,
        }
    }
}

impl CameraConfig {
    pub fn listener_config(&self) -> ListenerConfig {
        ListenerConfig {
            enabled: self.enabled,
            reconnect_base: Duration::from_secs(self.reconnect_base_secs),
            reconnect_max: Duration::from_secs(self.reconnect_max_secs),
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
            alarm_flag: self.alarm_flag.clone(),
            end_marker: DEFAULT_END_MARKER.to_vec(),
            capture: CaptureLimits {
                timeout: Duration::from_secs(self.capture_timeout_secs),
                min_bytes: self.min_snapshot_bytes,
            },
        }
    }

    pub fn rtsp_source(&self) -> RtspSource {
        RtspSource {
            host: self.host.clone(),
            port: self.rtsp_port,
            user: self.user.clone(),
            password: self.password.clone(),
            stream_path: self.stream_path.clone(),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl Config {
    /// Load `$TALLY_CONFIG` (if set), apply environment overrides, validate.
    pub fn load() -> Result<Self> {
        let mut config = match std::env::var_os("TALLY_CONFIG") {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("invalid config {}", path.display()))
    }

    /// Apply `TALLY_*` overrides; unparsable values are ignored with a warning.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let env = Env { lookup: &lookup };

        env.parse("TALLY_PROVIDER", &mut self.recognition.provider);
        env.path("TALLY_MODEL_DIR", &mut self.recognition.model_dir);
        env.parse("TALLY_METRIC", &mut self.recognition.metric);
        env.parse("TALLY_MATCH_DISTANCE", &mut self.recognition.match_distance);
        env.parse(
            "TALLY_LOW_CONFIDENCE_DISTANCE",
            &mut self.recognition.low_confidence_distance,
        );
        env.parse("TALLY_COOLDOWN_SECS", &mut self.attendance.cooldown_secs);
        env.parse("TALLY_MAX_CONCURRENT", &mut self.dispatcher.max_concurrent);
        env.path("TALLY_DB_PATH", &mut self.storage.db_path);
        env.path("TALLY_RECOGNIZED_DIR", &mut self.storage.recognized_dir);

        if let Some(v) = (env.lookup)("TALLY_CAMERA_ENABLED") {
            self.camera.enabled = v != "0" && !v.eq_ignore_ascii_case("false");
        }
        env.string("TALLY_CAMERA_HOST", &mut self.camera.host);
        env.parse("TALLY_CAMERA_EVENT_PORT", &mut self.camera.event_port);
        env.parse("TALLY_CAMERA_RTSP_PORT", &mut self.camera.rtsp_port);
        env.string("TALLY_CAMERA_USER", &mut self.camera.user);
        env.string("TALLY_CAMERA_PASSWORD", &mut self.camera.password);
        env.string("TALLY_CAMERA_STREAM_PATH", &mut self.camera.stream_path);
        env.path("TALLY_SNAPSHOT_DIR", &mut self.camera.snapshot_dir);
    }

    pub fn validate(&self) -> Result<()> {
        if let Err(e) = self.recognition.thresholds().validate() {
            bail!("recognition thresholds: {e}");
        }
        if self.dispatcher.max_concurrent == 0 {
            bail!("dispatcher.max_concurrent must be at least 1");
        }
        let camera = &self.camera;
        if camera.reconnect_base_secs > camera.reconnect_max_secs {
            bail!(
                "camera.reconnect_base_secs ({}) exceeds reconnect_max_secs ({})",
                camera.reconnect_base_secs,
                camera.reconnect_max_secs
            );
        }
        if camera.enabled && camera.host.is_empty() {
            bail!("camera.enabled requires camera.host");
        }
        Ok(())
    }
}

struct Env<'a> {
    lookup: &'a dyn Fn(&str) -> Option<String>,
}

impl Env<'_> {
    fn parse<T: FromStr>(&self, key: &str, slot: &mut T)
    where
        T::Err: std::fmt::Display,
    {
        if let Some(v) = (self.lookup)(key) {
            match v.parse() {
                Ok(parsed) => *slot = parsed,
                Err(e) => tracing::warn!(key, value = %v, error = %e, "ignoring invalid override"),
            }
        }
    }

    fn string(&self, key: &str, slot: &mut String) {
        if let Some(v) = (self.lookup)(key) {
            *slot = v;
        }
    }

    fn path(&self, key: &str, slot: &mut PathBuf) {
        if let Some(v) = (self.lookup)(key) {
            *slot = PathBuf::from(v);
        }
    }
}

/// `$XDG_DATA_HOME/tally`, falling back to `~/.local/share/tally`.
pub fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("tally")
}
