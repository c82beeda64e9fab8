// UniFi Protect adoption token fetch.
//
// Logs in to the console with a local account, then reads the camera
// management payload whose `mgmt.token` is the adoption token the control
// channel expects. The session cookie lives in the client's jar, so the
// client must be built with cookies enabled.

use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;
use url::Url;

use crate::error::Error;

const LOGIN_PATH: &str = "/api/auth/login";
const MANAGE_PAYLOAD_PATH: &str = "/proxy/protect/api/cameras/manage-payload";

#[derive(Debug, Deserialize)]
struct ManagePayload {
    mgmt: Mgmt,
}

#[derive(Debug, Deserialize)]
struct Mgmt {
    token: String,
}

/// Fetch an adoption token from the Protect console at `base_url`.
pub async fn fetch_adoption_token(
    http: &reqwest::Client,
    base_url: &Url,
    username: &str,
    password: &SecretString,
) -> Result<SecretString, Error> {
    let login_url = base_url.join(LOGIN_PATH)?;
    debug!("logging in at {}", login_url);

    let body = json!({
        "username": username,
        "password": password.expose_secret(),
        "rememberMe": false,
    });

    let resp = http.post(login_url).json(&body).send().await?;
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(Error::Authentication {
            message: format!("login failed (HTTP {status}): {body}"),
        });
    }

    let csrf = resp
        .headers()
        .get("x-csrf-token")
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);

    let payload_url = base_url.join(MANAGE_PAYLOAD_PATH)?;
    debug!("requesting manage payload at {}", payload_url);

    let mut request = http.get(payload_url.clone());
    if let Some(token) = csrf {
        request = request.header("X-CSRF-Token", token);
    }

    let resp = request.send().await?;
    let status = resp.status();
    if !status.is_success() {
        return Err(Error::Status {
            status: status.as_u16(),
            url: payload_url.to_string(),
        });
    }

    let text = resp.text().await?;
    let payload: ManagePayload =
        serde_json::from_str(&text).map_err(|e| Error::Deserialization {
            message: e.to_string(),
            body: text,
        })?;

    debug!("adoption token fetched");
    Ok(SecretString::from(payload.mgmt.token))
}
