#![allow(clippy::unwrap_used)]
// Snapshot fallback chain against wiremock cameras.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use secrecy::SecretString;
use url::Url;
use wiremock::matchers::{body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use camproxy_api::onvif::OnvifClient;
use camproxy_core::capability::{CameraCapability, Vendor};
use camproxy_core::config::AdapterConfig;
use camproxy_core::supervisor::{ExitOutcome, LaunchSpec, RelayLauncher, RelayProcess};
use camproxy_core::{CoreError, SnapshotResolver};

// ── Helpers ─────────────────────────────────────────────────────────

fn config(server: &MockServer, capability: CameraCapability, custom: Option<&str>) -> AdapterConfig {
    let mut config = AdapterConfig::default();
    config.camera.host = server.address().to_string();
    config.camera.capability = capability;
    config.camera.snapshot_url = custom.map(|p| Url::parse(&format!("{}{p}", server.uri())).unwrap());
    config.snapshot.step_timeout = Duration::from_millis(500);
    config
}

fn soap(body: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?><env:Envelope xmlns:env="http://www.w3.org/2003/05/soap-envelope"><env:Body>{body}</env:Body></env:Envelope>"#
    )
}

fn jpeg(bytes: &'static [u8]) -> ResponseTemplate {
    ResponseTemplate::new(200)
        .insert_header("content-type", "image/jpeg")
        .set_body_bytes(bytes)
}

async fn mount_onvif(server: &MockServer) {
    let media = format!("{}/onvif/media_service", server.uri());
    Mock::given(method("POST"))
        .and(body_string_contains("GetCapabilities"))
        .respond_with(ResponseTemplate::new(200).set_body_string(soap(&format!(
            "<tds:GetCapabilitiesResponse><tds:Capabilities>\
             <tt:Media><tt:XAddr>{media}</tt:XAddr></tt:Media>\
             </tds:Capabilities></tds:GetCapabilitiesResponse>"
        ))))
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(body_string_contains("GetProfiles"))
        .respond_with(ResponseTemplate::new(200).set_body_string(soap(
            "<trt:GetProfilesResponse>\
             <trt:Profiles token=\"profile_1\"><tt:Name>main</tt:Name></trt:Profiles>\
             <trt:Profiles token=\"profile_2\"><tt:Name>sub</tt:Name></trt:Profiles>\
             </trt:GetProfilesResponse>",
        )))
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(body_string_contains("<trt:ProfileToken>profile_2</trt:ProfileToken>"))
        .respond_with(ResponseTemplate::new(200).set_body_string(soap(&format!(
            "<trt:GetSnapshotUriResponse><trt:MediaUri>\
             <tt:Uri>{}/onvif-snap.jpg</tt:Uri>\
             </trt:MediaUri></trt:GetSnapshotUriResponse>",
            server.uri()
        ))))
        .mount(server)
        .await;
}

/// Stands in for the relay program: writes `image` to the output path (the
/// last argument) and exits with `code`.
struct FrameWriter {
    image: &'static [u8],
    code: i32,
    launched: Mutex<Vec<LaunchSpec>>,
}

impl FrameWriter {
    fn new(image: &'static [u8], code: i32) -> Arc<Self> {
        Arc::new(Self {
            image,
            code,
            launched: Mutex::new(Vec::new()),
        })
    }
}

struct Finished(i32);

#[async_trait]
impl RelayLauncher for FrameWriter {
    async fn launch(&self, spec: &LaunchSpec) -> Result<Box<dyn RelayProcess>, CoreError> {
        self.launched.lock().unwrap().push(spec.clone());
        std::fs::write(spec.args.last().unwrap(), self.image).unwrap();
        Ok(Box::new(Finished(self.code)))
    }
}

#[async_trait]
impl RelayProcess for Finished {
    fn id(&self) -> Option<u32> {
        None
    }
    async fn wait(&mut self) -> ExitOutcome {
        ExitOutcome::Exited(self.0)
    }
    async fn terminate(&mut self, _grace: Duration) -> ExitOutcome {
        ExitOutcome::Exited(self.0)
    }
}

fn restreamed(server: &MockServer) -> AdapterConfig {
    let mut config = config(server, CameraCapability::RtspHttpSnapshot, None);
    config.streams = Vendor::Yi.preset("10.0.0.2", None, None).streams;
    config
}

fn onvif_client(server: &MockServer) -> OnvifClient {
    OnvifClient::new(
        reqwest::Client::new(),
        Url::parse(&format!("{}/onvif/device_service", server.uri())).unwrap(),
        "admin",
        SecretString::from("secret"),
    )
}

// ── Tests ───────────────────────────────────────────────────────────

#[tokio::test]
async fn test_custom_url_wins() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/custom.jpg"))
        .respond_with(jpeg(b"custom"))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/snapshot.jpg"))
        .respond_with(jpeg(b"generic"))
        .expect(0)
        .mount(&server)
        .await;

    let config = config(&server, CameraCapability::RtspHttpSnapshot, Some("/custom.jpg"));
    let resolver = SnapshotResolver::new(reqwest::Client::new(), &config, None);
    assert_eq!(resolver.get_snapshot(None).await.unwrap(), b"custom");
}

#[tokio::test]
async fn test_failed_custom_url_falls_through_to_onvif() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/custom.jpg"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;
    mount_onvif(&server).await;
    Mock::given(method("GET"))
        .and(path("/onvif-snap.jpg"))
        .respond_with(jpeg(b"onvif"))
        .mount(&server)
        .await;

    let mut config = config(&server, CameraCapability::RtspOnvifEvents, Some("/custom.jpg"));
    config.camera.username = Some("admin".into());
    config.camera.password = Some(SecretString::from("secret"));
    let resolver = SnapshotResolver::new(reqwest::Client::new(), &config, Some(onvif_client(&server)));

    assert_eq!(resolver.get_snapshot(Some("sub")).await.unwrap(), b"onvif");
}

#[tokio::test]
async fn test_slow_step_times_out_and_generic_endpoint_answers() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/custom.jpg"))
        .respond_with(jpeg(b"late").set_delay(Duration::from_secs(5)))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/snapshot.jpg"))
        .and(header("authorization", "Basic YWRtaW46c2VjcmV0"))
        .respond_with(jpeg(b"generic"))
        .mount(&server)
        .await;

    let mut config = config(&server, CameraCapability::RtspHttpSnapshot, Some("/custom.jpg"));
    config.camera.username = Some("admin".into());
    config.camera.password = Some(SecretString::from("secret"));
    let resolver = SnapshotResolver::new(reqwest::Client::new(), &config, None);

    assert_eq!(resolver.get_snapshot(None).await.unwrap(), b"generic");
}

#[tokio::test]
async fn test_all_methods_exhausted() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let config = config(&server, CameraCapability::RtspOnvifEvents, Some("/custom.jpg"));
    let resolver = SnapshotResolver::new(reqwest::Client::new(), &config, Some(onvif_client(&server)));

    let attempts = match resolver.get_snapshot(None).await {
        Err(CoreError::SnapshotUnavailable { attempts }) => attempts,
        other => panic!("unexpected result: {other:?}"),
    };
    assert!(attempts.contains("custom-url"), "{attempts}");
    assert!(attempts.contains("onvif"), "{attempts}");
    assert!(attempts.contains("generic-http"), "{attempts}");
}

#[tokio::test]
async fn test_rtsp_only_without_url_has_nothing_to_try() {
    let server = MockServer::start().await;
    let config = config(&server, CameraCapability::RtspOnly, None);
    let resolver = SnapshotResolver::new(reqwest::Client::new(), &config, None);

    let err = resolver.get_snapshot(None).await.unwrap_err();
    assert!(err.to_string().contains("no snapshot method configured"));
}

#[tokio::test]
async fn test_rtsp_frame_grab_is_the_last_resort() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/snapshot.jpg"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;

    let launcher = FrameWriter::new(b"frame", 0);
    let resolver = SnapshotResolver::new(reqwest::Client::new(), &restreamed(&server), None)
        .with_launcher(launcher.clone());

    assert_eq!(resolver.get_snapshot(Some("sub")).await.unwrap(), b"frame");

    let launched = launcher.launched.lock().unwrap();
    assert_eq!(launched.len(), 1);
    assert_eq!(launched[0].profile, "sub");
    assert_eq!(launched[0].program, "ffmpeg");
    assert!(
        launched[0]
            .args
            .contains(&"rtsp://127.0.0.1:8554/yi_10_0_0_2_sd".to_owned())
    );
    assert!(launched[0].args.contains(&"-frames:v".to_owned()));
}

#[tokio::test]
async fn test_failed_frame_grab_is_reported() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let resolver = SnapshotResolver::new(reqwest::Client::new(), &restreamed(&server), None)
        .with_launcher(FrameWriter::new(b"", 1));

    let attempts = match resolver.get_snapshot(None).await {
        Err(CoreError::SnapshotUnavailable { attempts }) => attempts,
        other => panic!("unexpected result: {other:?}"),
    };
    assert!(attempts.contains("generic-http"), "{attempts}");
    assert!(attempts.contains("rtsp-frame"), "{attempts}");
    assert!(attempts.contains("exit code 1"), "{attempts}");
}
