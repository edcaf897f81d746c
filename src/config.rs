use crate::compare::{ClockComparator, TimeBase};
use crate::extract::{KeyPaths, PageSelector};
use crate::poll::PollSettings;
use anyhow::{anyhow, bail, Context, Result};
use log::warn;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const MIN_POLL_INTERVAL_SEC: f64 = 0.2;
const MIN_NTP_REFRESH_SEC: f64 = 5.0;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    pub source: SourceConfig,
    pub keys: KeyConfig,
    pub time: TimeConfig,
    pub poll: PollConfig,
    pub reference: ReferenceConfig,
    pub dashboard: DashboardConfig,
    pub runtime_file: RuntimeFileConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub target_url: String,
    pub css_selector: String,
    pub request_timeout_sec: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyConfig {
    pub latitude: String,
    pub longitude: String,
    pub altitude: String,
    pub gps_time: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GpsTimeBase {
    Unix,
    Gps,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeConfig {
    pub gps_time_base: GpsTimeBase,
    pub gps_leap_seconds: i32, // GPS - UTC
    pub drift_tolerance_sec: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    pub interval_sec: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReferenceConfig {
    pub ntp_server: String,
    pub timeout_sec: f64,
    pub refresh_sec: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DashboardConfig {
    pub enabled: bool,
    pub bind_host: String,
    pub bind_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeFileConfig {
    pub enabled: bool,
    /// Blank means the per-user runtime directory.
    pub path: String,
}

impl Default for SourceConfig {
    fn default() -> Self {
        SourceConfig {
            target_url: "http://127.0.0.1:8000/".to_string(),
            css_selector: "div.Json-Text".to_string(),
            request_timeout_sec: 5.0,
        }
    }
}

impl Default for KeyConfig {
    fn default() -> Self {
        KeyConfig {
            latitude: "location.latitude".to_string(),
            longitude: "location.longitude".to_string(),
            altitude: "location.altitudeMeters".to_string(),
            gps_time: "location.gpsTimeS".to_string(),
        }
    }
}

impl Default for TimeConfig {
    fn default() -> Self {
        TimeConfig {
            gps_time_base: GpsTimeBase::Unix,
            gps_leap_seconds: 18,
            drift_tolerance_sec: 1.0,
        }
    }
}

impl Default for PollConfig {
    fn default() -> Self {
        PollConfig { interval_sec: 1.0 }
    }
}

impl Default for ReferenceConfig {
    fn default() -> Self {
        ReferenceConfig {
            ntp_server: "time.nist.gov".to_string(),
            timeout_sec: 3.0,
            refresh_sec: 30.0,
        }
    }
}

impl Default for DashboardConfig {
    fn default() -> Self {
        DashboardConfig {
            enabled: true,
            bind_host: "127.0.0.1".to_string(),
            bind_port: 5000,
        }
    }
}

impl Default for RuntimeFileConfig {
    fn default() -> Self {
        RuntimeFileConfig {
            enabled: true,
            path: String::new(),
        }
    }
}

impl SystemConfig {
    /// Load YAML from `path`. A missing file gives the defaults only when `required` is false.
    pub fn load(path: &Path, required: bool) -> Result<Self> {
        let text = match fs::read_to_string(path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && !required => {
                return Ok(SystemConfig::default());
            }
            Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
        };
        Self::from_yaml(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        if text.trim().is_empty() {
            return Ok(SystemConfig::default());
        }
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn poll_interval(&self) -> Duration {
        let secs = if self.poll.interval_sec.is_finite() {
            self.poll.interval_sec.max(MIN_POLL_INTERVAL_SEC)
        } else {
            MIN_POLL_INTERVAL_SEC
        };
        Duration::from_secs_f64(secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.source.request_timeout_sec)
    }

    pub fn ntp_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.reference.timeout_sec)
    }

    pub fn ntp_refresh(&self) -> Duration {
        let secs = if self.reference.refresh_sec.is_finite() {
            self.reference.refresh_sec.max(MIN_NTP_REFRESH_SEC)
        } else {
            MIN_NTP_REFRESH_SEC
        };
        Duration::from_secs_f64(secs)
    }

    pub fn time_base(&self) -> TimeBase {
        match self.time.gps_time_base {
            GpsTimeBase::Unix => TimeBase::Unix,
            GpsTimeBase::Gps => TimeBase::Gps {
                leap_seconds: self.time.gps_leap_seconds,
            },
        }
    }

    /// Where the snapshot is persisted, if persistence is enabled.
    pub fn runtime_file_path(&self) -> Option<PathBuf> {
        if !self.runtime_file.enabled {
            return None;
        }
        if !self.runtime_file.path.trim().is_empty() {
            return Some(PathBuf::from(self.runtime_file.path.trim()));
        }
        Some(default_runtime_dir().join("current_location.json"))
    }

    /// Check everything the poll loop depends on and build its settings. Any error here
    /// is fatal at startup.
    pub fn validate(&self) -> Result<PollSettings> {
        if self.source.target_url.trim().is_empty() {
            bail!("source.target_url must not be empty");
        }
        positive("source.request_timeout_sec", self.source.request_timeout_sec)?;
        positive("reference.timeout_sec", self.reference.timeout_sec)?;
        positive("time.drift_tolerance_sec", self.time.drift_tolerance_sec)?;
        if self.reference.ntp_server.trim().is_empty() {
            bail!("reference.ntp_server must not be empty");
        }
        if self.poll.interval_sec < MIN_POLL_INTERVAL_SEC {
            warn!(
                "[Config] poll.interval_sec {} raised to {}",
                self.poll.interval_sec, MIN_POLL_INTERVAL_SEC
            );
        }
        if self.reference.refresh_sec < MIN_NTP_REFRESH_SEC {
            warn!(
                "[Config] reference.refresh_sec {} raised to {}",
                self.reference.refresh_sec, MIN_NTP_REFRESH_SEC
            );
        }

        let selector = PageSelector::parse(&self.source.css_selector)?;
        let keys = KeyPaths::parse(
            &self.keys.latitude,
            &self.keys.longitude,
            &self.keys.altitude,
            &self.keys.gps_time,
        )
        .map_err(|e| anyhow!("keys: {}", e))?;

        Ok(PollSettings {
            selector,
            keys,
            interval: self.poll_interval(),
            time_base: self.time_base(),
            comparator: ClockComparator::new(self.time.drift_tolerance_sec),
        })
    }
}

fn positive(name: &str, value: f64) -> Result<()> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(anyhow!("{} must be a positive number of seconds, got {}", name, value))
    }
}

#[cfg(unix)]
fn default_runtime_dir() -> PathBuf {
    let uid = unsafe { libc::getuid() };
    PathBuf::from(format!("/run/user/{}", uid))
}

#[cfg(not(unix))]
fn default_runtime_dir() -> PathBuf {
    std::env::temp_dir()
}
