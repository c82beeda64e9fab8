use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use url::Url;

use super::soap::{self, NS_DEVICE, NS_EVENTS, NS_MEDIA, NS_WSNT};
use super::{Capabilities, MediaProfile, Notification, PullPoint, xml};
use crate::error::Error;
use crate::http::map_send_error;

const ACTION_PULL: &str =
    "http://www.onvif.org/ver10/events/wsdl/PullPointSubscription/PullMessagesRequest";
const ACTION_RENEW: &str = "http://docs.oasis-open.org/wsn/bw-2/SubscriptionManager/RenewRequest";
const ACTION_UNSUBSCRIBE: &str =
    "http://docs.oasis-open.org/wsn/bw-2/SubscriptionManager/UnsubscribeRequest";

/// Headroom added to the HTTP timeout of a long-poll over its ONVIF timeout.
const PULL_HTTP_SLACK: Duration = Duration::from_secs(5);

/// ONVIF client for a single camera.
///
/// Every call is authenticated with a fresh WS-Security UsernameToken.
#[derive(Clone)]
pub struct OnvifClient {
    http: reqwest::Client,
    device_url: Url,
    username: String,
    password: SecretString,
}

impl std::fmt::Debug for OnvifClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OnvifClient")
            .field("device_url", &self.device_url.as_str())
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

impl OnvifClient {
    pub fn new(
        http: reqwest::Client,
        device_url: Url,
        username: impl Into<String>,
        password: SecretString,
    ) -> Self {
        Self {
            http,
            device_url,
            username: username.into(),
            password,
        }
    }

    /// Conventional device service URL for `host:port`.
    pub fn device_service_url(host: &str, port: u16) -> Result<Url, Error> {
        Ok(Url::parse(&format!("http://{host}:{port}/onvif/device_service"))?)
    }

    pub fn device_url(&self) -> &Url {
        &self.device_url
    }

    // ── Device ───────────────────────────────────────────────────────

    pub async fn capabilities(&self) -> Result<Capabilities, Error> {
        let body = format!(
            r#"<tds:GetCapabilities xmlns:tds="{NS_DEVICE}"><tds:Category>All</tds:Category></tds:GetCapabilities>"#
        );
        let response = self.call(&self.device_url, None, &body, None).await?;

        let xaddr = |section: &str| {
            xml::nested_text(&response, section, "XAddr").and_then(|s| Url::parse(&s).ok())
        };
        Ok(Capabilities {
            events: xaddr("Events"),
            media: xaddr("Media"),
        })
    }

    // ── Events ───────────────────────────────────────────────────────

    pub async fn create_pull_point(
        &self,
        events_url: &Url,
        termination: Duration,
    ) -> Result<PullPoint, Error> {
        let body = format!(
            r#"<tev:CreatePullPointSubscription xmlns:tev="{NS_EVENTS}"><tev:InitialTerminationTime>{}</tev:InitialTerminationTime></tev:CreatePullPointSubscription>"#,
            soap::iso_duration(termination)
        );
        let response = self.call(events_url, None, &body, None).await?;

        let address = xml::nested_text(&response, "SubscriptionReference", "Address")
            .ok_or(Error::MissingElement {
                element: "SubscriptionReference/Address",
            })?;
        let address = Url::parse(&address)?;
        tracing::debug!(address = %address, "created ONVIF pull point");
        Ok(PullPoint { address })
    }

    /// Long-poll for notifications. Returns an empty list when the camera's
    /// timeout elapses without events.
    pub async fn pull_messages(
        &self,
        pull_point: &PullPoint,
        timeout: Duration,
        limit: u32,
    ) -> Result<Vec<Notification>, Error> {
        let body = format!(
            r#"<tev:PullMessages xmlns:tev="{NS_EVENTS}"><tev:Timeout>{}</tev:Timeout><tev:MessageLimit>{limit}</tev:MessageLimit></tev:PullMessages>"#,
            soap::iso_duration(timeout)
        );
        let response = self
            .call(
                &pull_point.address,
                Some(ACTION_PULL),
                &body,
                Some(timeout + PULL_HTTP_SLACK),
            )
            .await?;
        Ok(super::parse_notifications(&response))
    }

    pub async fn renew(&self, pull_point: &PullPoint, termination: Duration) -> Result<(), Error> {
        let body = format!(
            r#"<wsnt:Renew xmlns:wsnt="{NS_WSNT}"><wsnt:TerminationTime>{}</wsnt:TerminationTime></wsnt:Renew>"#,
            soap::iso_duration(termination)
        );
        self.call(&pull_point.address, Some(ACTION_RENEW), &body, None)
            .await
            .map(drop)
    }

    pub async fn unsubscribe(&self, pull_point: &PullPoint) -> Result<(), Error> {
        let body = format!(r#"<wsnt:Unsubscribe xmlns:wsnt="{NS_WSNT}"/>"#);
        self.call(&pull_point.address, Some(ACTION_UNSUBSCRIBE), &body, None)
            .await
            .map(drop)
    }

    // ── Media ────────────────────────────────────────────────────────

    pub async fn profiles(&self, media_url: &Url) -> Result<Vec<MediaProfile>, Error> {
        let body = format!(r#"<trt:GetProfiles xmlns:trt="{NS_MEDIA}"/>"#);
        let response = self.call(media_url, None, &body, None).await?;
        Ok(super::parse_profiles(&response))
    }

    pub async fn snapshot_uri(&self, media_url: &Url, profile_token: &str) -> Result<Url, Error> {
        let body = format!(
            r#"<trt:GetSnapshotUri xmlns:trt="{NS_MEDIA}"><trt:ProfileToken>{}</trt:ProfileToken></trt:GetSnapshotUri>"#,
            xml::escape(profile_token)
        );
        let response = self.call(media_url, None, &body, None).await?;
        let uri = xml::nested_text(&response, "MediaUri", "Uri")
            .ok_or(Error::MissingElement { element: "MediaUri/Uri" })?;
        Ok(Url::parse(&uri)?)
    }

    // ── Transport ────────────────────────────────────────────────────

    async fn call(
        &self,
        url: &Url,
        action: Option<&str>,
        body: &str,
        timeout: Option<Duration>,
    ) -> Result<String, Error> {
        let mut header = soap::security_header(&self.username, self.password.expose_secret());
        if let Some(action) = action {
            header.push_str(&soap::addressing_header(action, url.as_str()));
        }
        let envelope = soap::envelope(&header, body);

        let mut request = self
            .http
            .post(url.clone())
            .header(
                reqwest::header::CONTENT_TYPE,
                "application/soap+xml; charset=utf-8",
            )
            .body(envelope);
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }

        let response = request
            .send()
            .await
            .map_err(|e| map_send_error(e, timeout))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| map_send_error(e, timeout))?;

        soap::check_fault(&text)?;
        if !status.is_success() {
            return Err(Error::Status {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }
        Ok(text)
    }
}
