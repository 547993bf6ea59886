// Near-arrival alerting with dedup and a temporary global mute. The ledger
// (last-notified timestamp per widget/stop/line, plus the mute deadline)
// lives in one JSON file and starts out empty with no mute set. Delivery
// terminates at the NotificationSink boundary; the OS notification channel
// sits behind it.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};

use crate::tubondi_api_models::{Result, StopArrivals, TuBondiError};
use crate::widget_store::{now_millis, WidgetConfiguration};

const DEDUP_WINDOW_MS: i64 = 10 * 60 * 1000;
const ONE_HOUR_MS: i64 = 60 * 60 * 1000;

// ============================================================================
// Delivery boundary
// ============================================================================

pub trait NotificationSink: Send + Sync {
    fn notify(&self, key: &str, title: &str, body: &str);
}

/// Default sink: logs the alert. Deployments wire a real delivery channel in
/// its place.
pub struct ConsoleNotificationSink;

impl NotificationSink for ConsoleNotificationSink {
    fn notify(&self, key: &str, title: &str, body: &str) {
        println!("🔔 [{}] {}: {}", key, title, body);
    }
}

// ============================================================================
// Ledger
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct NotifierLedger {
    // "{widget_id}-{stop_code}-{line_name}" -> last-notified epoch millis
    #[serde(default)]
    recents: HashMap<String, i64>,
    #[serde(default)]
    muted_until_epoch_millis: i64,
}

pub struct ArrivalNotifier {
    path: PathBuf,
    sink: Box<dyn NotificationSink>,
    ledger: Mutex<NotifierLedger>,
}

impl ArrivalNotifier {
    pub fn new(path: PathBuf, sink: Box<dyn NotificationSink>) -> Self {
        let ledger = Self::load_ledger(&path);
        ArrivalNotifier {
            path,
            sink,
            ledger: Mutex::new(ledger),
        }
    }

    /// One alert per near arrival, at most once per dedup window per
    /// widget/stop/line. No-op while muted or when the configuration has
    /// notifications off.
    pub fn dispatch(&self, config: &WidgetConfiguration, arrivals: &[StopArrivals]) -> Result<()> {
        if !config.notifications_enabled {
            return Ok(());
        }

        let now = now_millis();
        let mut ledger = self.ledger_guard()?;
        if now < ledger.muted_until_epoch_millis {
            return Ok(());
        }

        let threshold = config.near_threshold_minutes;
        for stop_arrivals in arrivals {
            for arrival in stop_arrivals
                .arrivals
                .iter()
                .filter(|a| a.eta_minutes <= threshold)
            {
                let key = format!(
                    "{}-{}-{}",
                    config.app_widget_id, arrival.stop_code, arrival.line_name
                );
                let last_time = ledger.recents.get(&key).copied().unwrap_or(0);
                if now - last_time < DEDUP_WINDOW_MS {
                    continue;
                }
                ledger.recents.insert(key.clone(), now);
                let body = format!(
                    "Línea {} llega en {} min a {}",
                    arrival.line_name, arrival.eta_minutes, stop_arrivals.stop.name
                );
                self.sink.notify(&key, "TuBondi", &body);
            }
        }

        self.persist(&mut ledger)
    }

    /// Mute everything for the next hour, replacing any earlier deadline.
    pub fn silence_one_hour(&self) -> Result<()> {
        let mut ledger = self.ledger_guard()?;
        ledger.muted_until_epoch_millis = now_millis() + ONE_HOUR_MS;
        println!("🔕 Notifications silenced for one hour");
        self.persist(&mut ledger)
    }

    pub fn is_muted(&self) -> bool {
        self.ledger
            .lock()
            .map(|ledger| now_millis() < ledger.muted_until_epoch_millis)
            .unwrap_or(false)
    }

    fn load_ledger(path: &PathBuf) -> NotifierLedger {
        if !path.exists() {
            return NotifierLedger::default();
        }
        match fs::read_to_string(path) {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(ledger) => ledger,
                Err(e) => {
                    eprintln!("⚠️  Ignoring corrupt notification ledger ({})", e);
                    NotifierLedger::default()
                }
            },
            Err(e) => {
                eprintln!("⚠️  Failed to read notification ledger ({})", e);
                NotifierLedger::default()
            }
        }
    }

    // Every persist drops entries that fell out of the dedup window.
    fn persist(&self, ledger: &mut MutexGuard<'_, NotifierLedger>) -> Result<()> {
        let now = now_millis();
        ledger.recents.retain(|_, stamped| now - *stamped < DEDUP_WINDOW_MS);

        let json = serde_json::to_string_pretty(&**ledger)
            .map_err(|e| TuBondiError::FileError(format!("Failed to serialize ledger: {}", e)))?;
        fs::write(&self.path, json)
            .map_err(|e| TuBondiError::FileError(format!("Failed to write ledger: {}", e)))
    }

    fn ledger_guard(&self) -> Result<MutexGuard<'_, NotifierLedger>> {
        self.ledger
            .lock()
            .map_err(|e| TuBondiError::FileError(format!("Ledger lock poisoned: {}", e)))
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tubondi_api_models::{Arrival, Stop};
    use std::sync::Arc;

    #[derive(Clone, Default)]
    struct RecordingSink {
        events: Arc<Mutex<Vec<(String, String)>>>,
    }

    impl NotificationSink for RecordingSink {
        fn notify(&self, key: &str, _title: &str, body: &str) {
            self.events
                .lock()
                .unwrap()
                .push((key.to_string(), body.to_string()));
        }
    }

    fn test_notifier() -> (tempfile::TempDir, ArrivalNotifier, RecordingSink) {
        let dir = tempfile::tempdir().unwrap();
        let sink = RecordingSink::default();
        let notifier = ArrivalNotifier::new(dir.path().join("ledger.json"), Box::new(sink.clone()));
        (dir, notifier, sink)
    }

    fn config(id: i32, enabled: bool) -> WidgetConfiguration {
        WidgetConfiguration {
            app_widget_id: id,
            selections: Vec::new(),
            refresh_interval_minutes: 15,
            notifications_enabled: enabled,
            near_threshold_minutes: 5,
            high_contrast: false,
            conf: "cbaciudad".to_string(),
        }
    }

    fn arrival(line: &str, eta: i32) -> Arrival {
        Arrival {
            stop_code: "0001".to_string(),
            line_name: line.to_string(),
            eta_minutes: eta,
            distance_meters: Some(100),
            direction: None,
            vehicle_id: None,
            operator: None,
            color: None,
        }
    }

    fn stop_arrivals(arrivals: Vec<Arrival>) -> Vec<StopArrivals> {
        vec![StopArrivals {
            stop: Stop {
                code: "0001".to_string(),
                name: "Colón y General Paz".to_string(),
                latitude: None,
                longitude: None,
                lines: Vec::new(),
            },
            arrivals,
            backend_message: None,
        }]
    }

    #[test]
    fn notifies_only_near_arrivals_and_dedups() {
        let (_dir, notifier, sink) = test_notifier();
        let arrivals = stop_arrivals(vec![arrival("1", 4), arrival("2", 9)]);

        notifier.dispatch(&config(99, true), &arrivals).unwrap();
        assert_eq!(sink.events.lock().unwrap().len(), 1);
        assert_eq!(sink.events.lock().unwrap()[0].0, "99-0001-1");

        // Same arrivals again, still inside the dedup window
        notifier.dispatch(&config(99, true), &arrivals).unwrap();
        assert_eq!(sink.events.lock().unwrap().len(), 1);
    }

    #[test]
    fn distinct_lines_notify_independently() {
        let (_dir, notifier, sink) = test_notifier();
        let arrivals = stop_arrivals(vec![arrival("1", 4), arrival("2", 3)]);
        notifier.dispatch(&config(1, true), &arrivals).unwrap();
        assert_eq!(sink.events.lock().unwrap().len(), 2);
    }

    #[test]
    fn disabled_configuration_is_a_noop() {
        let (_dir, notifier, sink) = test_notifier();
        let arrivals = stop_arrivals(vec![arrival("1", 2)]);
        notifier.dispatch(&config(1, false), &arrivals).unwrap();
        assert!(sink.events.lock().unwrap().is_empty());
    }

    #[test]
    fn silence_suppresses_everything() {
        let (_dir, notifier, sink) = test_notifier();
        notifier.silence_one_hour().unwrap();
        assert!(notifier.is_muted());

        let arrivals = stop_arrivals(vec![arrival("1", 0), arrival("2", 1)]);
        notifier.dispatch(&config(1, true), &arrivals).unwrap();
        assert!(sink.events.lock().unwrap().is_empty());
    }

    #[test]
    fn mute_deadline_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.json");
        let first = ArrivalNotifier::new(path.clone(), Box::new(ConsoleNotificationSink));
        first.silence_one_hour().unwrap();

        let second = ArrivalNotifier::new(path, Box::new(ConsoleNotificationSink));
        assert!(second.is_muted());
    }

    #[test]
    fn stale_ledger_entries_are_pruned_on_persist() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.json");
        let stale = now_millis() - DEDUP_WINDOW_MS - 1000;
        fs::write(
            &path,
            format!(
                r#"{{"recents": {{"1-0001-1": {}, "1-9999-7": {}}}, "muted_until_epoch_millis": 0}}"#,
                stale, stale
            ),
        )
        .unwrap();

        let sink = RecordingSink::default();
        let notifier = ArrivalNotifier::new(path.clone(), Box::new(sink.clone()));
        let arrivals = stop_arrivals(vec![arrival("1", 2)]);

        // Stale entry for this key is outside the window, so it fires again
        notifier.dispatch(&config(1, true), &arrivals).unwrap();
        assert_eq!(sink.events.lock().unwrap().len(), 1);

        // The untouched stale key is gone from the persisted ledger
        let persisted: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert!(persisted["recents"].get("1-9999-7").is_none());
        assert!(persisted["recents"].get("1-0001-1").is_some());
    }

    #[test]
    fn same_line_different_widgets_notify_separately() {
        let (_dir, notifier, sink) = test_notifier();
        let arrivals = stop_arrivals(vec![arrival("1", 2)]);
        notifier.dispatch(&config(1, true), &arrivals).unwrap();
        notifier.dispatch(&config(2, true), &arrivals).unwrap();
        assert_eq!(sink.events.lock().unwrap().len(), 2);
    }
}
