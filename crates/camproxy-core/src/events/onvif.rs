//! ONVIF pull-point poller.
//!
//! Subscribes once, then pulls on a fixed interval. Pull failures are logged
//! and retried on the next cycle; after `resubscribe_after` consecutive
//! failures the subscription is torn down and recreated with backoff.

use std::time::Duration;

use camproxy_api::onvif::{Notification, OnvifClient, PullPoint};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use super::{EventSource, RawSignal, SignalSender, TopicFilter};
use crate::backoff::BackoffPolicy;
use crate::config::EventConfig;
use crate::error::CoreError;

/// Notifications requested per pull.
const MESSAGE_LIMIT: u32 = 32;
/// Bound on the best-effort unsubscribe during shutdown.
const UNSUBSCRIBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Translate notifications into raw signals using the configured topics.
/// Notifications without a matching topic or a readable boolean are dropped.
pub fn signals_from(notifications: &[Notification], topics: &[TopicFilter]) -> Vec<RawSignal> {
    notifications
        .iter()
        .filter_map(|note| {
            let filter = topics.iter().find(|f| f.matches_topic(&note.topic))?;
            let active = parse_flag(note.data_value(&filter.key)?)?;
            Some(RawSignal::new(EventSource::Onvif, filter.kind, active))
        })
        .collect()
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim() {
        v if v.eq_ignore_ascii_case("true") || v == "1" => Some(true),
        v if v.eq_ignore_ascii_case("false") || v == "0" => Some(false),
        _ => None,
    }
}

pub struct OnvifPoller {
    client: OnvifClient,
    topics: Vec<TopicFilter>,
    poll_interval: Duration,
    pull_timeout: Duration,
    subscription_ttl: Duration,
    resubscribe_after: u32,
    backoff: BackoffPolicy,
    signals: SignalSender,
}

impl OnvifPoller {
    pub fn new(client: OnvifClient, config: &EventConfig, signals: SignalSender) -> Self {
        Self {
            client,
            topics: config.onvif_topics.clone(),
            poll_interval: config.poll_interval,
            pull_timeout: config.pull_timeout,
            subscription_ttl: config.subscription_ttl,
            resubscribe_after: config.resubscribe_after.max(1),
            backoff: config.resubscribe_backoff,
            signals,
        }
    }

    pub async fn run(self, cancel: CancellationToken) {
        info!(device = %self.client.device_url(), "ONVIF poller started");
        let mut attempt = 0u32;

        while !cancel.is_cancelled() {
            let pull_point = match self.subscribe().await {
                Ok(pp) => {
                    attempt = 0;
                    pp
                }
                Err(e) => {
                    attempt = attempt.saturating_add(1);
                    let delay = self.backoff.delay(attempt);
                    warn!(error = %e, attempt, delay_ms = delay.as_millis(), "ONVIF subscription failed");
                    if sleep_or_cancel(delay, &cancel).await {
                        break;
                    }
                    continue;
                }
            };

            let outcome = self.poll(&pull_point, &cancel).await;
            let cleanup = tokio::time::timeout(
                UNSUBSCRIBE_TIMEOUT,
                self.client.unsubscribe(&pull_point),
            )
            .await;
            if let Ok(Err(e)) = cleanup {
                debug!(error = %e, "ONVIF unsubscribe failed");
            }
            match outcome {
                PollOutcome::Cancelled | PollOutcome::EngineGone => break,
                PollOutcome::Resubscribe => {
                    info!("recreating ONVIF subscription");
                }
            }
        }
        info!("ONVIF poller stopped");
    }

    async fn subscribe(&self) -> Result<PullPoint, CoreError> {
        let capabilities = self
            .client
            .capabilities()
            .await
            .map_err(|e| self.timeout_err(&e))?;
        let events_url = capabilities
            .events
            .unwrap_or_else(|| default_events_url(self.client.device_url()));
        let pull_point = self
            .client
            .create_pull_point(&events_url, self.subscription_ttl)
            .await
            .map_err(|e| self.timeout_err(&e))?;
        info!(address = %pull_point.address, "ONVIF pull point subscribed");
        Ok(pull_point)
    }

    async fn poll(&self, pull_point: &PullPoint, cancel: &CancellationToken) -> PollOutcome {
        let renew_every = self.subscription_ttl / 2;
        let mut renew_at = Instant::now() + renew_every;
        let mut failures = 0u32;

        loop {
            let pulled = tokio::select! {
                () = cancel.cancelled() => return PollOutcome::Cancelled,
                pulled = self.client.pull_messages(pull_point, self.pull_timeout, MESSAGE_LIMIT) => pulled,
            };

            match pulled {
                Ok(notifications) => {
                    failures = 0;
                    for signal in signals_from(&notifications, &self.topics) {
                        if self.signals.send(signal).await.is_err() {
                            return PollOutcome::EngineGone;
                        }
                    }
                }
                Err(e) => {
                    failures += 1;
                    let err = self.timeout_err(&e);
                    warn!(error = %err, failures, "ONVIF pull failed");
                    if failures >= self.resubscribe_after {
                        return PollOutcome::Resubscribe;
                    }
                }
            }

            if Instant::now() >= renew_at {
                match self.client.renew(pull_point, self.subscription_ttl).await {
                    Ok(()) => debug!("ONVIF subscription renewed"),
                    Err(e) => warn!(error = %e, "ONVIF renew failed"),
                }
                renew_at = Instant::now() + renew_every;
            }

            if sleep_or_cancel(self.poll_interval, cancel).await {
                return PollOutcome::Cancelled;
            }
        }
    }

    fn timeout_err(&self, e: &camproxy_api::Error) -> CoreError {
        CoreError::EventSourceTimeout {
            source_name: format!("onvif {}", self.client.device_url()),
            reason: e.to_string(),
        }
    }
}

enum PollOutcome {
    Cancelled,
    EngineGone,
    Resubscribe,
}

fn default_events_url(device_url: &Url) -> Url {
    let mut url = device_url.clone();
    url.set_path("/onvif/event_service");
    url
}

/// Returns `true` when cancelled before `delay` elapsed.
async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        () = cancel.cancelled() => true,
        () = tokio::time::sleep(delay) => false,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use camproxy_api::onvif::SimpleItem;

    use super::*;
    use crate::events::EventKind;

    fn note(topic: &str, key: &str, value: &str) -> Notification {
        Notification {
            topic: topic.into(),
            utc_time: None,
            property_operation: Some("Changed".into()),
            source: Vec::new(),
            data: vec![SimpleItem {
                name: key.into(),
                value: value.into(),
            }],
        }
    }

    fn topics() -> Vec<TopicFilter> {
        crate::config::EventConfig::default().onvif_topics
    }

    #[test]
    fn maps_motion_and_people_topics() {
        let signals = signals_from(
            &[
                note("tns1:RuleEngine/CellMotionDetector/Motion", "IsMotion", "true"),
                note("tns1:RuleEngine/PeopleDetector/People", "IsPeople", "false"),
            ],
            &topics(),
        );
        assert_eq!(
            signals,
            vec![
                RawSignal::new(EventSource::Onvif, EventKind::Motion, true),
                RawSignal::new(EventSource::Onvif, EventKind::Person, false),
            ]
        );
    }

    #[test]
    fn drops_unknown_topics_and_keys() {
        let signals = signals_from(
            &[
                note("tns1:VideoSource/ImageTooDark", "State", "true"),
                note("tns1:RuleEngine/CellMotionDetector/Motion", "State", "true"),
                note("tns1:RuleEngine/CellMotionDetector/Motion", "IsMotion", "maybe"),
            ],
            &topics(),
        );
        assert!(signals.is_empty());
    }

    #[test]
    fn events_url_falls_back_to_conventional_path() {
        let device = Url::parse("http://10.0.0.7:2020/onvif/device_service").unwrap();
        assert_eq!(
            default_events_url(&device).as_str(),
            "http://10.0.0.7:2020/onvif/event_service"
        );
    }
}
