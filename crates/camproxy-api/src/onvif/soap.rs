//! SOAP 1.2 envelopes with WS-Security UsernameToken digest auth.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use rand::Rng;
use sha1::{Digest, Sha1};

use super::xml;
use crate::error::Error;

pub const NS_DEVICE: &str = "http://www.onvif.org/ver10/device/wsdl";
pub const NS_EVENTS: &str = "http://www.onvif.org/ver10/events/wsdl";
pub const NS_MEDIA: &str = "http://www.onvif.org/ver10/media/wsdl";
pub const NS_WSNT: &str = "http://docs.oasis-open.org/wsn/b-2";

const NS_SOAP: &str = "http://www.w3.org/2003/05/soap-envelope";
const NS_WSA: &str = "http://www.w3.org/2005/08/addressing";
const NS_WSSE: &str =
    "http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-wssecurity-secext-1.0.xsd";
const NS_WSU: &str =
    "http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-wssecurity-utility-1.0.xsd";
const PASSWORD_DIGEST: &str =
    "http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-username-token-profile-1.0#PasswordDigest";
const BASE64_BINARY: &str =
    "http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-soap-message-security-1.0#Base64Binary";

/// `Base64(SHA1(nonce + created + password))`
pub fn password_digest(nonce: &[u8], created: &str, password: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(nonce);
    hasher.update(created.as_bytes());
    hasher.update(password.as_bytes());
    STANDARD.encode(hasher.finalize())
}

/// WS-Security header with a fresh nonce and the current time.
pub fn security_header(username: &str, password: &str) -> String {
    let nonce: [u8; 16] = rand::thread_rng().r#gen();
    let created = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string();
    security_header_with(username, password, &nonce, &created)
}

fn security_header_with(username: &str, password: &str, nonce: &[u8], created: &str) -> String {
    let digest = password_digest(nonce, created, password);
    let nonce = STANDARD.encode(nonce);
    let username = xml::escape(username);
    format!(
        r#"<wsse:Security s:mustUnderstand="1" xmlns:wsse="{NS_WSSE}" xmlns:wsu="{NS_WSU}"><wsse:UsernameToken><wsse:Username>{username}</wsse:Username><wsse:Password Type="{PASSWORD_DIGEST}">{digest}</wsse:Password><wsse:Nonce EncodingType="{BASE64_BINARY}">{nonce}</wsse:Nonce><wsu:Created>{created}</wsu:Created></wsse:UsernameToken></wsse:Security>"#
    )
}

/// WS-Addressing headers some event services insist on.
pub fn addressing_header(action: &str, to: &str) -> String {
    let to = xml::escape(to);
    format!(
        r#"<wsa:Action xmlns:wsa="{NS_WSA}">{action}</wsa:Action><wsa:To xmlns:wsa="{NS_WSA}">{to}</wsa:To>"#
    )
}

/// Wrap header blocks and a body into a SOAP 1.2 envelope.
pub fn envelope(header: &str, body: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?><s:Envelope xmlns:s="{NS_SOAP}"><s:Header>{header}</s:Header><s:Body>{body}</s:Body></s:Envelope>"#
    )
}

/// Turn a SOAP fault in `body` into [`Error::SoapFault`].
pub fn check_fault(body: &str) -> Result<(), Error> {
    let Some(fault) = xml::element(body, "Fault") else {
        return Ok(());
    };

    let subcode = xml::element(fault.content, "Subcode").and_then(|s| xml::text(s.content, "Value"));
    let code = xml::nested_text(fault.content, "Code", "Value");
    let reason = xml::nested_text(fault.content, "Reason", "Text")
        .or_else(|| xml::text(fault.content, "faultstring"));

    let reason = [subcode.or(code), reason]
        .into_iter()
        .flatten()
        .collect::<Vec<_>>()
        .join(": ");

    Err(Error::SoapFault {
        reason: if reason.is_empty() {
            "unspecified fault".into()
        } else {
            reason
        },
    })
}

/// ISO 8601 duration for whole seconds, e.g. `PT60S`.
pub fn iso_duration(d: std::time::Duration) -> String {
    format!("PT{}S", d.as_secs().max(1))
}
