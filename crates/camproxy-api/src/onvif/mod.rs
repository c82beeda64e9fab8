//! Minimal ONVIF client: device capabilities, PullPoint event
//! subscriptions, and media snapshot URIs.

mod client;
pub mod soap;
pub mod xml;

use chrono::{DateTime, Utc};
use url::Url;

pub use client::OnvifClient;

/// Service endpoints advertised by `GetCapabilities`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub events: Option<Url>,
    pub media: Option<Url>,
}

/// An active PullPoint subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullPoint {
    pub address: Url,
}

/// A `Name`/`Value` pair from a notification's `Source` or `Data` block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimpleItem {
    pub name: String,
    pub value: String,
}

/// One `NotificationMessage` from a PullMessages response.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub topic: String,
    pub utc_time: Option<DateTime<Utc>>,
    /// `Initialized`, `Changed` or `Deleted`.
    pub property_operation: Option<String>,
    pub source: Vec<SimpleItem>,
    pub data: Vec<SimpleItem>,
}

impl Notification {
    pub fn data_value(&self, name: &str) -> Option<&str> {
        self.data
            .iter()
            .find(|item| item.name == name)
            .map(|item| item.value.as_str())
    }

    /// Boolean state carried by the first data item (`IsMotion`,
    /// `IsPeople`, `State`...).
    pub fn state(&self) -> Option<bool> {
        let value = self.data.first()?.value.trim();
        if value.eq_ignore_ascii_case("true") || value == "1" {
            Some(true)
        } else if value.eq_ignore_ascii_case("false") || value == "0" {
            Some(false)
        } else {
            None
        }
    }
}

/// A media profile from `GetProfiles`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaProfile {
    pub token: String,
    pub name: Option<String>,
}

pub(crate) fn parse_notifications(body: &str) -> Vec<Notification> {
    xml::elements(body, "NotificationMessage")
        .into_iter()
        .filter_map(|nm| {
            let topic = xml::text(nm.content, "Topic")?;
            let wrapper = xml::element(nm.content, "Message")?;
            let inner = xml::element(wrapper.content, "Message").unwrap_or(wrapper);

            let utc_time = inner
                .attr("UtcTime")
                .and_then(|t| DateTime::parse_from_rfc3339(&t).ok())
                .map(|t| t.with_timezone(&Utc));

            Some(Notification {
                topic,
                utc_time,
                property_operation: inner.attr("PropertyOperation"),
                source: simple_items(inner.content, "Source"),
                data: simple_items(inner.content, "Data"),
            })
        })
        .collect()
}

fn simple_items(xml_text: &str, section: &str) -> Vec<SimpleItem> {
    let Some(block) = xml::element(xml_text, section) else {
        return Vec::new();
    };
    xml::elements(block.content, "SimpleItem")
        .into_iter()
        .filter_map(|item| {
            Some(SimpleItem {
                name: item.attr("Name")?,
                value: item.attr("Value")?,
            })
        })
        .collect()
}

pub(crate) fn parse_profiles(body: &str) -> Vec<MediaProfile> {
    xml::elements(body, "Profiles")
        .into_iter()
        .filter_map(|p| {
            Some(MediaProfile {
                token: p.attr("token")?,
                name: xml::text(p.content, "Name"),
            })
        })
        .collect()
}
