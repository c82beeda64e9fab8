//! CLI layer over camproxy-config: command-line flags win over the file and
//! the environment.

use secrecy::SecretString;

use camproxy_config::Config;
use camproxy_core::{AdapterConfig, Vendor};

use crate::cli::{GlobalOpts, OverrideArgs, RunArgs, VendorArg};
use crate::error::CliError;

impl From<VendorArg> for Vendor {
    fn from(arg: VendorArg) -> Self {
        match arg {
            VendorArg::Rtsp => Self::Rtsp,
            VendorArg::Tapo => Self::Tapo,
            VendorArg::Yi => Self::Yi,
        }
    }
}

/// Load file + environment, then apply flags.
pub fn load(global: &GlobalOpts, overrides: &OverrideArgs) -> Result<Config, CliError> {
    let mut config = camproxy_config::load_config(global.config.as_deref())?;
    apply_overrides(&mut config, overrides);
    Ok(config)
}

/// Effective engine config for `camproxy run`.
pub fn for_run(global: &GlobalOpts, args: &RunArgs) -> Result<AdapterConfig, CliError> {
    let mut config = load(global, &args.overrides)?;
    if let Some(port) = args.http_port {
        config.events.http_port = Some(port);
    }
    Ok(config.to_adapter_config()?)
}

pub fn apply_overrides(config: &mut Config, overrides: &OverrideArgs) {
    let OverrideArgs {
        nvr_host,
        token,
        nvr_username,
        nvr_password,
        mac,
        name,
        model,
        cert,
        vendor,
        camera_host,
    } = overrides;

    if let Some(host) = nvr_host {
        config.nvr.host = Some(host.clone());
    }
    if let Some(token) = token {
        config.nvr.token = Some(SecretString::from(token.clone()));
    }
    if let Some(username) = nvr_username {
        config.nvr.username = Some(username.clone());
    }
    if let Some(password) = nvr_password {
        config.nvr.password = Some(SecretString::from(password.clone()));
    }
    if let Some(mac) = mac {
        config.device.mac = Some(mac.clone());
    }
    if let Some(name) = name {
        config.device.name = Some(name.clone());
    }
    if let Some(model) = model {
        config.device.model = Some(model.clone());
    }
    if let Some(cert) = cert {
        config.identity.path = Some(cert.clone());
    }
    if let Some(vendor) = vendor {
        config.camera.vendor = (*vendor).into();
    }
    if let Some(host) = camera_host {
        config.camera.host = Some(host.clone());
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use secrecy::ExposeSecret;

    use super::*;

    #[test]
    fn flags_override_loaded_values() {
        let mut config = Config::default();
        config.nvr.host = Some("10.0.0.1".into());
        config.device.name = Some("from-file".into());

        let overrides = OverrideArgs {
            nvr_host: Some("10.0.0.2".into()),
            token: Some("flag-token".into()),
            vendor: Some(VendorArg::Tapo),
            ..OverrideArgs::default()
        };
        apply_overrides(&mut config, &overrides);

        assert_eq!(config.nvr.host.as_deref(), Some("10.0.0.2"));
        assert_eq!(config.nvr.token.unwrap().expose_secret(), "flag-token");
        assert_eq!(config.camera.vendor, Vendor::Tapo);
        assert_eq!(config.device.name.as_deref(), Some("from-file"));
    }
}
