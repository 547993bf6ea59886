// Per-widget persistence: one configuration record and one render-state
// record per widget instance, stored as JSON files. The render state is the
// only thing the rendering layer ever reads.

use chrono::{TimeZone, Utc};
use chrono_tz::America::Argentina::Cordoba;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

use crate::tubondi_api_models::{Result, StopArrivals, StopSelection, TuBondiError};

// ============================================================================
// Records
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WidgetConfiguration {
    pub app_widget_id: i32,
    pub selections: Vec<StopSelection>,
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_minutes: u32,
    #[serde(default = "default_true")]
    pub notifications_enabled: bool,
    #[serde(default = "default_near_threshold")]
    pub near_threshold_minutes: i32,
    #[serde(default)]
    pub high_contrast: bool,
    #[serde(default = "default_conf")]
    pub conf: String,
}

fn default_refresh_interval() -> u32 {
    5
}

fn default_true() -> bool {
    true
}

fn default_near_threshold() -> i32 {
    5
}

fn default_conf() -> String {
    "cbaciudad".to_string()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WidgetRenderState {
    #[serde(default)]
    pub arrivals: Vec<StopArrivals>,
    #[serde(default)]
    pub last_updated_epoch_millis: i64,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub high_contrast: bool,
}

// ============================================================================
// Store
// ============================================================================

#[derive(Debug, Clone)]
pub struct WidgetStore {
    dir: PathBuf,
}

impl WidgetStore {
    const CONFIG_PREFIX: &'static str = "widget_config_";
    const STATE_PREFIX: &'static str = "widget_state_";

    pub fn new(dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&dir)
            .map_err(|e| TuBondiError::FileError(format!("Failed to create store dir: {}", e)))?;
        Ok(WidgetStore { dir })
    }

    pub fn open_default() -> Result<Self> {
        let mut dir = dirs::data_local_dir().unwrap_or_else(|| PathBuf::from("."));
        dir.push("tubondi_widget");
        Self::new(dir)
    }

    pub fn dir(&self) -> &std::path::Path {
        &self.dir
    }

    pub fn save_configuration(&self, config: &WidgetConfiguration) -> Result<()> {
        let json = serde_json::to_string_pretty(config)
            .map_err(|e| TuBondiError::FileError(format!("Failed to serialize configuration: {}", e)))?;
        fs::write(self.config_path(config.app_widget_id), json)
            .map_err(|e| TuBondiError::FileError(format!("Failed to write configuration: {}", e)))
    }

    pub fn read_configuration(&self, app_widget_id: i32) -> Result<Option<WidgetConfiguration>> {
        let path = self.config_path(app_widget_id);
        if !path.exists() {
            return Ok(None);
        }
        let contents = fs::read_to_string(&path)
            .map_err(|e| TuBondiError::FileError(format!("Failed to read configuration: {}", e)))?;
        match serde_json::from_str(&contents) {
            Ok(config) => Ok(Some(config)),
            Err(e) => {
                eprintln!("⚠️  Ignoring corrupt configuration {:?} ({})", path, e);
                Ok(None)
            }
        }
    }

    pub fn remove_configuration(&self, app_widget_id: i32) -> Result<()> {
        for path in [self.config_path(app_widget_id), self.state_path(app_widget_id)] {
            if path.exists() {
                fs::remove_file(&path)
                    .map_err(|e| TuBondiError::FileError(format!("Failed to remove {:?}: {}", path, e)))?;
            }
        }
        Ok(())
    }

    /// Every persisted configuration, ascending widget id. This is the
    /// iteration order the refresh pipeline promises.
    pub fn all_configurations(&self) -> Result<Vec<WidgetConfiguration>> {
        let entries = fs::read_dir(&self.dir)
            .map_err(|e| TuBondiError::FileError(format!("Failed to read store dir: {}", e)))?;

        let mut ids: Vec<i32> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let name = entry.file_name().to_string_lossy().into_owned();
                name.strip_prefix(Self::CONFIG_PREFIX)?
                    .strip_suffix(".json")?
                    .parse::<i32>()
                    .ok()
            })
            .collect();
        ids.sort_unstable();

        let mut configs = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(config) = self.read_configuration(id)? {
                configs.push(config);
            }
        }
        Ok(configs)
    }

    pub fn write_state(&self, app_widget_id: i32, state: &WidgetRenderState) -> Result<()> {
        let json = serde_json::to_string_pretty(state)
            .map_err(|e| TuBondiError::FileError(format!("Failed to serialize render state: {}", e)))?;
        fs::write(self.state_path(app_widget_id), json)
            .map_err(|e| TuBondiError::FileError(format!("Failed to write render state: {}", e)))
    }

    /// Absent or unreadable state reads as the default record, matching what
    /// a freshly placed widget shows before its first refresh.
    pub fn read_state(&self, app_widget_id: i32) -> WidgetRenderState {
        let path = self.state_path(app_widget_id);
        if !path.exists() {
            return WidgetRenderState::default();
        }
        fs::read_to_string(&path)
            .ok()
            .and_then(|contents| serde_json::from_str(&contents).ok())
            .unwrap_or_default()
    }

    pub fn stats_summary(&self) -> String {
        let configs = self.all_configurations().unwrap_or_default();
        let now = now_millis();
        let mut lines = vec![format!("📊 {} widget(s) configured", configs.len())];
        for config in &configs {
            let state = self.read_state(config.app_widget_id);
            let age_secs = if state.last_updated_epoch_millis > 0 {
                (now - state.last_updated_epoch_millis) / 1000
            } else {
                -1
            };
            lines.push(format!(
                "• Widget {}: {} stop(s), refresh {}min, last update {} ({}s ago){}",
                config.app_widget_id,
                config.selections.len(),
                config.refresh_interval_minutes,
                if state.last_updated_epoch_millis > 0 {
                    format_timestamp_full(state.last_updated_epoch_millis / 1000)
                } else {
                    "never".to_string()
                },
                age_secs,
                state
                    .error_message
                    .as_ref()
                    .map(|e| format!(" | last error: {}", e))
                    .unwrap_or_default()
            ));
        }
        lines.join("\n")
    }

    fn config_path(&self, app_widget_id: i32) -> PathBuf {
        self.dir
            .join(format!("{}{}.json", Self::CONFIG_PREFIX, app_widget_id))
    }

    fn state_path(&self, app_widget_id: i32) -> PathBuf {
        self.dir
            .join(format!("{}{}.json", Self::STATE_PREFIX, app_widget_id))
    }
}

// ============================================================================
// Time helpers
// ============================================================================

pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

pub fn format_timestamp_full(timestamp_secs: i64) -> String {
    match Utc.timestamp_opt(timestamp_secs, 0).single() {
        Some(dt) => {
            let local_time = dt.with_timezone(&Cordoba);
            local_time.format("%Y-%m-%d %H:%M:%S").to_string()
        }
        None => format!("Invalid timestamp: {}", timestamp_secs),
    }
}

// ============================================================================
// Tests
// ============================================================================
