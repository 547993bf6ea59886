// Per-widget refresh cycle: fetch arrivals, persist the render state the
// widget surface reads, then hand the result to the notifier. One widget's
// failure never touches the others, and a batch always completes; errors
// travel inside the render state, not up to the scheduler.

use std::sync::Arc;

use crate::arrival_notifier::ArrivalNotifier;
use crate::tubondi_api_models::{Result, TuBondiClient};
use crate::widget_store::{now_millis, WidgetConfiguration, WidgetRenderState, WidgetStore};

// Floor for the per-widget refresh interval. Shorter configured intervals
// are clamped, never rejected.
pub const MIN_REFRESH_INTERVAL_MINUTES: u32 = 15;

pub struct RefreshPipeline {
    client: Arc<TuBondiClient>,
    store: WidgetStore,
    notifier: Arc<ArrivalNotifier>,
}

impl RefreshPipeline {
    pub fn new(client: Arc<TuBondiClient>, store: WidgetStore, notifier: Arc<ArrivalNotifier>) -> Self {
        RefreshPipeline {
            client,
            store,
            notifier,
        }
    }

    /// Refresh a single widget. A widget without a persisted configuration is
    /// a no-op, not a failure.
    pub fn refresh_widget(&self, app_widget_id: i32) -> Result<()> {
        match self.store.read_configuration(app_widget_id)? {
            Some(config) => {
                self.run_cycle(&config);
                Ok(())
            }
            None => {
                println!("ℹ️  No configuration for widget {}, skipping", app_widget_id);
                Ok(())
            }
        }
    }

    /// Refresh every persisted configuration in id order. Per-widget failures
    /// are contained in their render state; the batch itself always succeeds.
    pub fn refresh_all(&self) -> Result<usize> {
        let configs = self.store.all_configurations()?;
        for config in &configs {
            self.run_cycle(config);
        }
        Ok(configs.len())
    }

    /// Periodic entry point: refresh only the widgets whose render state has
    /// outlived their (clamped) interval. Returns how many were refreshed.
    pub fn refresh_due(&self) -> Result<usize> {
        let configs = self.store.all_configurations()?;
        let now = now_millis();
        let mut refreshed = 0;
        for config in &configs {
            let state = self.store.read_state(config.app_widget_id);
            if is_due(state.last_updated_epoch_millis, effective_interval_minutes(config), now) {
                self.run_cycle(config);
                refreshed += 1;
            }
        }
        Ok(refreshed)
    }

    fn run_cycle(&self, config: &WidgetConfiguration) {
        match self.client.fetch_arrivals_for_config(config) {
            Ok(arrivals) => {
                let state = WidgetRenderState {
                    arrivals: arrivals.clone(),
                    last_updated_epoch_millis: now_millis(),
                    error_message: None,
                    high_contrast: config.high_contrast,
                };
                if let Err(e) = self.store.write_state(config.app_widget_id, &state) {
                    eprintln!("❌ Failed to persist render state for widget {}: {}", config.app_widget_id, e);
                }
                if let Err(e) = self.notifier.dispatch(config, &arrivals) {
                    eprintln!("⚠️  Notification dispatch failed for widget {}: {}", config.app_widget_id, e);
                }
                println!(
                    "✓ Widget {} refreshed: {} stop(s)",
                    config.app_widget_id,
                    arrivals.len()
                );
            }
            Err(e) => {
                eprintln!("⚠️  Widget {} refresh failed: {}", config.app_widget_id, e);
                let state = WidgetRenderState {
                    arrivals: Vec::new(),
                    last_updated_epoch_millis: now_millis(),
                    error_message: Some(e.to_string()),
                    high_contrast: config.high_contrast,
                };
                if let Err(write_err) = self.store.write_state(config.app_widget_id, &state) {
                    eprintln!(
                        "❌ Failed to persist error state for widget {}: {}",
                        config.app_widget_id, write_err
                    );
                }
                // No notifications off an error cycle
            }
        }
    }
}

pub fn effective_interval_minutes(config: &WidgetConfiguration) -> u32 {
    config.refresh_interval_minutes.max(MIN_REFRESH_INTERVAL_MINUTES)
}

fn is_due(last_updated_epoch_millis: i64, interval_minutes: u32, now: i64) -> bool {
    if last_updated_epoch_millis <= 0 {
        return true;
    }
    now - last_updated_epoch_millis >= interval_minutes as i64 * 60 * 1000
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_interval(minutes: u32) -> WidgetConfiguration {
        WidgetConfiguration {
            app_widget_id: 1,
            selections: Vec::new(),
            refresh_interval_minutes: minutes,
            notifications_enabled: true,
            near_threshold_minutes: 5,
            high_contrast: false,
            conf: "cbaciudad".to_string(),
        }
    }

    #[test]
    fn intervals_below_the_floor_are_clamped() {
        assert_eq!(effective_interval_minutes(&config_with_interval(5)), 15);
        assert_eq!(effective_interval_minutes(&config_with_interval(15)), 15);
        assert_eq!(effective_interval_minutes(&config_with_interval(30)), 30);
    }

    #[test]
    fn never_refreshed_widgets_are_always_due() {
        assert!(is_due(0, 15, now_millis()));
    }

    #[test]
    fn due_only_after_the_interval_elapses() {
        let now = now_millis();
        let fourteen_minutes_ago = now - 14 * 60 * 1000;
        let sixteen_minutes_ago = now - 16 * 60 * 1000;
        assert!(!is_due(fourteen_minutes_ago, 15, now));
        assert!(is_due(sixteen_minutes_ago, 15, now));
    }
}
