#![allow(clippy::unwrap_used)]
// Pull-point poller loop against a wiremock camera.

use std::time::Duration;

use secrecy::SecretString;
use url::Url;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use camproxy_api::onvif::OnvifClient;
use camproxy_core::config::EventConfig;
use camproxy_core::events::onvif::OnvifPoller;
use camproxy_core::events::signal_channel;
use camproxy_core::{BackoffPolicy, EventKind, EventSource, RawSignal};
use tokio_util::sync::CancellationToken;

// ── Helpers ─────────────────────────────────────────────────────────

fn soap(body: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?><env:Envelope xmlns:env="http://www.w3.org/2003/05/soap-envelope"><env:Body>{body}</env:Body></env:Envelope>"#
    )
}

fn client(server: &MockServer) -> OnvifClient {
    let device = Url::parse(&format!("{}/onvif/device_service", server.uri())).unwrap();
    OnvifClient::new(
        reqwest::Client::new(),
        device,
        "admin",
        SecretString::from("secret"),
    )
}

fn fast_events() -> EventConfig {
    EventConfig {
        poll_interval: Duration::from_millis(10),
        pull_timeout: Duration::from_millis(100),
        resubscribe_after: 2,
        resubscribe_backoff: BackoffPolicy::new(Duration::from_millis(10), Duration::from_millis(40)),
        ..EventConfig::default()
    }
}

fn capabilities_ok(server: &MockServer) -> Mock {
    let events = format!("{}/onvif/event_service", server.uri());
    Mock::given(method("POST"))
        .and(path("/onvif/device_service"))
        .and(body_string_contains("GetCapabilities"))
        .respond_with(ResponseTemplate::new(200).set_body_string(soap(&format!(
            "<tds:GetCapabilitiesResponse><tds:Capabilities>\
             <tt:Events><tt:XAddr>{events}</tt:XAddr></tt:Events>\
             </tds:Capabilities></tds:GetCapabilitiesResponse>"
        ))))
}

async fn mount_subscription(server: &MockServer) {
    let sub_addr = format!("{}/onvif/subscription?idx=1", server.uri());
    Mock::given(method("POST"))
        .and(path("/onvif/event_service"))
        .and(body_string_contains("CreatePullPointSubscription"))
        .respond_with(ResponseTemplate::new(200).set_body_string(soap(&format!(
            "<tev:CreatePullPointSubscriptionResponse><tev:SubscriptionReference>\
             <wsa5:Address>{sub_addr}</wsa5:Address>\
             </tev:SubscriptionReference></tev:CreatePullPointSubscriptionResponse>"
        ))))
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path("/onvif/subscription"))
        .and(body_string_contains("RenewRequest"))
        .respond_with(ResponseTemplate::new(200).set_body_string(soap("<wsnt:RenewResponse/>")))
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path("/onvif/subscription"))
        .and(body_string_contains("UnsubscribeRequest"))
        .respond_with(
            ResponseTemplate::new(200).set_body_string(soap("<wsnt:UnsubscribeResponse/>")),
        )
        .mount(server)
        .await;
}

fn motion_pull() -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_string(soap(
        "<tev:PullMessagesResponse><wsnt:NotificationMessage>\
         <wsnt:Topic>tns1:RuleEngine/CellMotionDetector/Motion</wsnt:Topic>\
         <wsnt:Message><tt:Message UtcTime=\"2024-05-01T10:00:00Z\">\
         <tt:Data><tt:SimpleItem Name=\"IsMotion\" Value=\"true\"/></tt:Data>\
         </tt:Message></wsnt:Message></wsnt:NotificationMessage></tev:PullMessagesResponse>",
    ))
}

/// Requests received so far whose body contains `needle`.
async fn count(server: &MockServer, needle: &str) -> usize {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter(|r| String::from_utf8_lossy(&r.body).contains(needle))
        .count()
}

async fn wait_for(server: &MockServer, needle: &str, at_least: usize) {
    let waited = tokio::time::timeout(Duration::from_secs(5), async {
        while count(server, needle).await < at_least {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "never saw {at_least} x {needle}");
}

// ── Tests ───────────────────────────────────────────────────────────

#[tokio::test]
async fn repeated_pull_failures_recreate_the_subscription() {
    let server = MockServer::start().await;
    capabilities_ok(&server).mount(&server).await;
    mount_subscription(&server).await;
    Mock::given(method("POST"))
        .and(path("/onvif/subscription"))
        .and(body_string_contains("PullMessagesRequest"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let (signals, _rx) = signal_channel();
    let cancel = CancellationToken::new();
    let poller = OnvifPoller::new(client(&server), &fast_events(), signals);
    let task = tokio::spawn(poller.run(cancel.clone()));

    wait_for(&server, "CreatePullPointSubscription", 2).await;
    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .unwrap()
        .unwrap();

    // Two failed pulls per subscription before it is torn down.
    assert!(count(&server, "PullMessagesRequest").await >= 2);
    // The abandoned subscription and the last one are both released.
    assert!(count(&server, "UnsubscribeRequest").await >= 2);
}

#[tokio::test]
async fn pulled_notifications_become_signals_and_subscription_is_renewed() {
    let server = MockServer::start().await;
    capabilities_ok(&server).mount(&server).await;
    mount_subscription(&server).await;
    Mock::given(method("POST"))
        .and(path("/onvif/subscription"))
        .and(body_string_contains("PullMessagesRequest"))
        .respond_with(motion_pull())
        .mount(&server)
        .await;

    let events = EventConfig {
        subscription_ttl: Duration::from_millis(200),
        ..fast_events()
    };
    let (signals, mut rx) = signal_channel();
    let cancel = CancellationToken::new();
    let poller = OnvifPoller::new(client(&server), &events, signals);
    let task = tokio::spawn(poller.run(cancel.clone()));

    let signal = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        signal,
        RawSignal::new(EventSource::Onvif, EventKind::Motion, true)
    );

    // Renewal happens at half the subscription lifetime.
    wait_for(&server, "RenewRequest", 1).await;

    cancel.cancel();
    rx.close();
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(count(&server, "CreatePullPointSubscription").await, 1);
    assert_eq!(count(&server, "UnsubscribeRequest").await, 1);
}

#[tokio::test]
async fn failed_subscription_is_retried_with_backoff() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/onvif/device_service"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(2)
        .with_priority(1)
        .mount(&server)
        .await;
    capabilities_ok(&server).mount(&server).await;
    mount_subscription(&server).await;
    Mock::given(method("POST"))
        .and(path("/onvif/subscription"))
        .and(body_string_contains("PullMessagesRequest"))
        .respond_with(ResponseTemplate::new(200).set_body_string(soap(
            "<tev:PullMessagesResponse/>",
        )))
        .mount(&server)
        .await;

    let (signals, _rx) = signal_channel();
    let cancel = CancellationToken::new();
    let poller = OnvifPoller::new(client(&server), &fast_events(), signals);
    let task = tokio::spawn(poller.run(cancel.clone()));

    wait_for(&server, "CreatePullPointSubscription", 1).await;
    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(count(&server, "GetCapabilities").await, 3);
}
