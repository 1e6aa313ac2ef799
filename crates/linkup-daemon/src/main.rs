//! `linkupd`: runs a Linkup server from settings.
//!
//! Loads `~/.linkup/settings.json` (or `--settings`), opens every configured
//! endpoint and serves until Ctrl-C, then disconnects clients with
//! `ServerRequest` before exiting.

#![deny(unsafe_code)]

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use linkup_server::{
    AcceptAllAuthenticator, Authenticator, DomainAuthenticator, Server, ServerConfig,
};
use linkup_settings::{LinkupSettings, ServerSettings};
use linkup_transport::Certificate;
use metrics_exporter_prometheus::PrometheusBuilder;

#[derive(Parser, Debug)]
#[command(name = "linkupd", about = "Linkup messaging server")]
struct Cli {
    /// Settings file (defaults to `~/.linkup/settings.json`).
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Listener endpoint; repeat to serve several. Replaces configured endpoints.
    #[arg(long = "endpoint")]
    endpoints: Vec<String>,

    /// Log level override.
    #[arg(long)]
    log_level: Option<String>,
}

impl Cli {
    fn apply(&self, settings: &mut LinkupSettings) {
        if !self.endpoints.is_empty() {
            settings.server.endpoints.clone_from(&self.endpoints);
        }
        if let Some(level) = &self.log_level {
            settings.logging.level.clone_from(level);
        }
    }
}

fn load_settings(path: Option<&Path>) -> Result<LinkupSettings> {
    let settings = match path {
        Some(path) => linkup_settings::load_settings_from_path(path)
            .with_context(|| format!("loading settings from {}", path.display()))?,
        None => linkup_settings::load_settings().context("loading settings")?,
    };
    Ok(settings)
}

/// Make `settings` the process-wide value returned by `get_settings`.
fn install_settings(settings: LinkupSettings) -> Result<&'static LinkupSettings> {
    if linkup_settings::init_settings(settings).is_err() {
        anyhow::bail!("settings were initialized before startup");
    }
    Ok(linkup_settings::get_settings())
}

fn authenticator(settings: &ServerSettings) -> Arc<dyn Authenticator> {
    if settings.allowed_domains.is_empty() {
        Arc::new(AcceptAllAuthenticator)
    } else {
        Arc::new(DomainAuthenticator::new(&settings.allowed_domains))
    }
}

fn certificate(settings: &ServerSettings) -> Result<Option<Certificate>> {
    let Some(cert_path) = &settings.certificate_path else {
        return Ok(None);
    };
    let key_path = settings.private_key_path.as_deref().map(Path::new);
    let certificate = Certificate::load(Path::new(cert_path), key_path)
        .with_context(|| format!("loading certificate {cert_path}"))?;
    Ok(Some(certificate))
}

fn install_metrics(port: u16) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("installing prometheus exporter")?;
    tracing::info!(%addr, "metrics exporter listening");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut loaded = load_settings(cli.settings.as_deref())?;
    cli.apply(&mut loaded);
    let settings = install_settings(loaded)?;

    if settings.logging.json {
        linkup_core::logging::init_json_subscriber(&settings.logging.level);
    } else {
        linkup_core::logging::init_subscriber(&settings.logging.level);
    }

    if let Some(port) = settings.server.metrics_port {
        install_metrics(port)?;
    }

    let certificate = certificate(&settings.server)?;
    let server = Server::new(ServerConfig::from(&settings.server));
    server.add_authenticator(authenticator(&settings.server))?;

    for endpoint in &settings.server.endpoints {
        let addr = server
            .add_listener(endpoint, certificate.as_ref())
            .await
            .with_context(|| format!("starting listener {endpoint}"))?;
        tracing::info!(endpoint, %addr, "listening");
    }

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    tracing::info!(connections = server.connection_count(), "shutting down");
    server.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoints_replace_configured_ones() {
        let cli = Cli::try_parse_from([
            "linkupd",
            "--endpoint",
            "ws://0.0.0.0:8080/linkup",
            "--endpoint",
            "tcp://0.0.0.0:5650/",
            "--log-level",
            "debug",
        ])
        .unwrap();
        let mut settings = LinkupSettings::default();
        cli.apply(&mut settings);
        assert_eq!(
            settings.server.endpoints,
            vec!["ws://0.0.0.0:8080/linkup", "tcp://0.0.0.0:5650/"]
        );
        assert_eq!(settings.logging.level, "debug");
    }

    #[test]
    fn no_flags_keep_settings() {
        let cli = Cli::try_parse_from(["linkupd"]).unwrap();
        let mut settings = LinkupSettings::default();
        cli.apply(&mut settings);
        assert_eq!(settings, LinkupSettings::default());
    }

    #[test]
    fn installed_settings_are_process_wide() {
        let mut settings = LinkupSettings::default();
        settings.server.endpoints = vec!["ws://127.0.0.1:0/linkup".into()];
        let installed = install_settings(settings.clone()).unwrap();
        assert_eq!(installed, &settings);
        assert!(std::ptr::eq(installed, linkup_settings::get_settings()));
        assert!(install_settings(LinkupSettings::default()).is_err());
    }

    #[test]
    fn missing_certificate_is_none() {
        assert!(certificate(&ServerSettings::default()).unwrap().is_none());
    }

    #[test]
    fn unreadable_certificate_is_an_error() {
        let settings = ServerSettings {
            certificate_path: Some("/nonexistent/linkup.pem".into()),
            ..ServerSettings::default()
        };
        assert!(certificate(&settings).is_err());
    }

    #[tokio::test]
    async fn domain_list_restricts_sign_in() {
        use linkup_core::protocol::SignIn;

        let settings = ServerSettings {
            allowed_domains: vec!["example.org".into()],
            ..ServerSettings::default()
        };
        let auth = authenticator(&settings);
        let inside = SignIn::new("alice@example.org".parse().unwrap());
        let outside = SignIn::new("bob@elsewhere".parse().unwrap());
        assert!(auth.authenticate(&inside).await.is_some());
        assert!(auth.authenticate(&outside).await.is_none());
        assert!(
            authenticator(&ServerSettings::default())
                .authenticate(&outside)
                .await
                .is_some()
        );
    }
}
