//! Alarm dispatch — hands each resolved alarm to the notification side.
//! Supports: HTTP webhook, the local fire schedule, and ordered fan-out.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use eruna_core::{Alarm, DispatchConfig, ErunaError, GroupRef, Result};

use crate::schedule::{FireSchedule, ScheduledFire};

/// Notification dispatch collaborator. Not idempotent: every call may notify someone.
#[async_trait]
pub trait AlarmDispatcher: Send + Sync {
    /// `date` is the calendar date the alarm rings on for this run.
    async fn dispatch(&self, alarm: &Alarm, group: &GroupRef, date: NaiveDate) -> Result<()>;

    /// Short name used in logs.
    fn name(&self) -> &str;
}

/// Ring time of `alarm` on `date`.
pub fn fire_time(alarm: &Alarm, date: NaiveDate) -> NaiveDateTime {
    date.and_time(alarm.alarm_time)
}

/// JSON body sent to webhooks.
pub fn webhook_payload(alarm: &Alarm, group: &GroupRef, fire_at: NaiveDateTime) -> serde_json::Value {
    serde_json::json!({
        "alarm_id": alarm.id,
        "label": alarm.label,
        "alarm_time": alarm.alarm_time.format("%H:%M:%S").to_string(),
        "days": alarm.days,
        "group_id": group.id,
        "group_code": group.code,
        "fire_at": fire_at.format("%Y-%m-%dT%H:%M:%S").to_string(),
    })
}

/// Generic HTTP webhook — POST with JSON body.
pub struct WebhookDispatcher {
    client: reqwest::Client,
    url: String,
    headers: Vec<(String, String)>,
    timeout: Duration,
}

impl WebhookDispatcher {
    pub fn new(url: &str, headers: Vec<(String, String)>, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.to_string(),
            headers,
            timeout,
        }
    }
}

#[async_trait]
impl AlarmDispatcher for WebhookDispatcher {
    async fn dispatch(&self, alarm: &Alarm, group: &GroupRef, date: NaiveDate) -> Result<()> {
        let body = webhook_payload(alarm, group, fire_time(alarm, date));
        let mut req = self.client.post(&self.url).json(&body).timeout(self.timeout);

        for (key, value) in &self.headers {
            req = req.header(key.as_str(), value.as_str());
        }

        let resp = req
            .send()
            .await
            .map_err(|e| ErunaError::Dispatch(format!("Webhook send failed: {e}")))?;

        if resp.status().is_success() {
            tracing::debug!(alarm_id = alarm.id, url = %self.url, "webhook accepted");
            Ok(())
        } else {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            Err(ErunaError::Dispatch(format!("Webhook error {status}: {body}")))
        }
    }

    fn name(&self) -> &str {
        "webhook"
    }
}

/// Plans the run's ring of each alarm in the fire schedule under `scope`.
pub struct FireScheduleDispatcher {
    schedule: Arc<FireSchedule>,
    scope: String,
}

impl FireScheduleDispatcher {
    pub fn new(schedule: Arc<FireSchedule>, scope: &str) -> Self {
        Self {
            schedule,
            scope: scope.to_string(),
        }
    }
}

#[async_trait]
impl AlarmDispatcher for FireScheduleDispatcher {
    async fn dispatch(&self, alarm: &Alarm, group: &GroupRef, date: NaiveDate) -> Result<()> {
        let fire = ScheduledFire {
            scope: self.scope.clone(),
            alarm_id: alarm.id,
            group_id: group.id,
            fire_at: fire_time(alarm, date),
        };
        if !self.schedule.schedule(&fire)? {
            tracing::debug!(alarm_id = alarm.id, fire_at = %fire.fire_at, "ring already planned");
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "fire_schedule"
    }
}

/// Sends to each target in order; the first failure stops the fan-out.
pub struct FanoutDispatcher {
    targets: Vec<Arc<dyn AlarmDispatcher>>,
}

impl FanoutDispatcher {
    pub fn new(targets: Vec<Arc<dyn AlarmDispatcher>>) -> Self {
        Self { targets }
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

#[async_trait]
impl AlarmDispatcher for FanoutDispatcher {
    async fn dispatch(&self, alarm: &Alarm, group: &GroupRef, date: NaiveDate) -> Result<()> {
        for target in &self.targets {
            target.dispatch(alarm, group, date).await.map_err(|e| {
                ErunaError::Dispatch(format!("{}: {e}", target.name()))
            })?;
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "fanout"
    }
}

/// Build the dispatch chain from config.
pub fn dispatcher_from_config(
    config: &DispatchConfig,
    schedule: Arc<FireSchedule>,
    scope: &str,
) -> FanoutDispatcher {
    let mut targets: Vec<Arc<dyn AlarmDispatcher>> = Vec::new();

    if config.schedule_fires {
        targets.push(Arc::new(FireScheduleDispatcher::new(schedule, scope)));
    }

    if let Some(url) = config.webhook_url.as_deref().filter(|u| !u.is_empty()) {
        targets.push(Arc::new(WebhookDispatcher::new(
            url,
            config.webhook_headers.clone(),
            Duration::from_secs(config.timeout_secs),
        )));
    }

    if targets.is_empty() {
        tracing::warn!("no dispatch targets configured; alarms will only be grouped");
    }
    FanoutDispatcher::new(targets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveTime;
    use eruna_core::Week;

    fn alarm() -> Alarm {
        Alarm::new(7, "wake", NaiveTime::from_hms_opt(6, 45, 0).unwrap(), &[Week::Mon])
    }

    fn group() -> GroupRef {
        GroupRef {
            id: 3,
            code: "ABCD1234".into(),
            alarm_id: 7,
        }
    }

    fn monday() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 10, 19).unwrap()
    }

    #[test]
    fn test_webhook_payload_shape() {
        let body = webhook_payload(&alarm(), &group(), fire_time(&alarm(), monday()));
        assert_eq!(body["alarm_id"], 7);
        assert_eq!(body["group_code"], "ABCD1234");
        assert_eq!(body["days"], serde_json::json!(["MON"]));
        assert_eq!(body["fire_at"], "2026-10-19T06:45:00");
    }

    #[tokio::test]
    async fn test_fire_schedule_dispatcher_plans_ring() {
        let schedule = Arc::new(FireSchedule::open_in_memory().unwrap());
        let dispatcher = FireScheduleDispatcher::new(schedule.clone(), "readAlarmsJob");
        dispatcher.dispatch(&alarm(), &group(), monday()).await.unwrap();
        dispatcher.dispatch(&alarm(), &group(), monday()).await.unwrap();

        let pending = schedule.pending("readAlarmsJob").unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].group_id, 3);
        assert_eq!(pending[0].fire_at, monday().and_hms_opt(6, 45, 0).unwrap());
    }

    #[tokio::test]
    async fn test_ring_lands_on_the_given_date() {
        let schedule = Arc::new(FireSchedule::open_in_memory().unwrap());
        let dispatcher = FireScheduleDispatcher::new(schedule.clone(), "readAlarmsJob");
        let wednesday = NaiveDate::from_ymd_opt(2026, 10, 21).unwrap();
        dispatcher.dispatch(&alarm(), &group(), wednesday).await.unwrap();

        let pending = schedule.pending("readAlarmsJob").unwrap();
        assert_eq!(pending[0].fire_at.date(), wednesday);
    }

    #[tokio::test]
    async fn test_webhook_unreachable_is_dispatch_error() {
        let dispatcher = WebhookDispatcher::new(
            "http://127.0.0.1:9/hook",
            vec![],
            Duration::from_secs(2),
        );
        let err = dispatcher.dispatch(&alarm(), &group(), monday()).await.unwrap_err();
        assert!(matches!(err, ErunaError::Dispatch(_)));
    }

    #[test]
    fn test_config_builds_targets() {
        let schedule = Arc::new(FireSchedule::open_in_memory().unwrap());
        let mut config = DispatchConfig::default();
        let fanout = dispatcher_from_config(&config, schedule.clone(), "job");
        assert_eq!(fanout.len(), 1);

        config.webhook_url = Some("http://localhost:9000/hook".into());
        let fanout = dispatcher_from_config(&config, schedule.clone(), "job");
        assert_eq!(fanout.len(), 2);

        config.schedule_fires = false;
        config.webhook_url = None;
        assert!(dispatcher_from_config(&config, schedule, "job").is_empty());
    }
}
