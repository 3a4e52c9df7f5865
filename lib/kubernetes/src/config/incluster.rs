//! Configuration from inside a pod: the API server address comes from the
//! environment, credentials from the service-account mount.

use std::net::IpAddr;
use std::path::{Path, PathBuf};

use rustls::pki_types::CertificateDer;
use rustls::{ClientConfig, RootCertStore};

use super::{Auth, Config, RefreshableToken};

const SERVICE_HOSTENV: &str = "KUBERNETES_SERVICE_HOST";
const SERVICE_PORTENV: &str = "KUBERNETES_SERVICE_PORT";

/// Every pod gets the token, CA bundle and namespace mounted here.
const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

/// Errors from loading in-cluster config
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An expected environment variable is missing; probably not a pod
    #[error("environment variable {0} is not set, not running in a cluster?")]
    MissingEnvironment(&'static str),

    /// The advertised API server address does not form a valid url
    #[error("invalid api server address {0:?}")]
    InvalidAddress(String),

    /// A mounted credential file could not be read
    #[error("failed to read service account credential '{1:?}': {0}")]
    ReadCredential(#[source] std::io::Error, PathBuf),

    /// The mounted CA bundle is not valid PEM
    #[error("invalid ca bundle: {0}")]
    ParseCaBundle(#[source] pem::PemError),

    /// A CA certificate was rejected by rustls
    #[error("failed to build a RootCertStore: {0}")]
    BuildRootCertStore(#[source] rustls::Error),
}

pub fn from_environment() -> Result<Config, Error> {
    from_mount(Path::new(SERVICE_ACCOUNT_DIR))
}

fn from_mount(dir: &Path) -> Result<Config, Error> {
    let cluster_url = api_server_url()?;
    let default_namespace = read_credential(&dir.join("namespace"))?;
    let tls = ca_bundle(&dir.join("ca.crt"))?;

    let token_path = dir.join("token");
    let token = RefreshableToken::new(token_path.clone())
        .map_err(|err| Error::ReadCredential(err, token_path))?;

    Ok(Config {
        cluster_url,
        default_namespace,
        auth: Auth::RefreshableToken(token),
        tls,
    })
}

fn api_server_url() -> Result<http::Uri, Error> {
    let host = std::env::var(SERVICE_HOSTENV)
        .map_err(|_| Error::MissingEnvironment(SERVICE_HOSTENV))?;
    let port = std::env::var(SERVICE_PORTENV)
        .map_err(|_| Error::MissingEnvironment(SERVICE_PORTENV))?;

    build_url(&host, &port)
}

/// The host may be a name, an IPv4 or an IPv6 address; only the latter
/// needs brackets. The default https port is left implicit.
fn build_url(host: &str, port: &str) -> Result<http::Uri, Error> {
    let authority = match (host.parse::<IpAddr>(), port) {
        (Ok(IpAddr::V6(ip)), "443") => format!("[{ip}]"),
        (Ok(IpAddr::V6(ip)), port) => format!("[{ip}]:{port}"),
        (_, "443") => host.to_string(),
        (_, port) => format!("{host}:{port}"),
    };

    format!("https://{authority}")
        .parse()
        .map_err(|_| Error::InvalidAddress(format!("{host}:{port}")))
}

fn read_credential(path: &Path) -> Result<String, Error> {
    std::fs::read_to_string(path)
        .map(|content| content.trim().to_string())
        .map_err(|err| Error::ReadCredential(err, path.to_path_buf()))
}

/// The mounted bundle may hold several certificates; anything that is not
/// a certificate block is skipped.
fn ca_bundle(path: &Path) -> Result<ClientConfig, Error> {
    let data = std::fs::read(path).map_err(|err| Error::ReadCredential(err, path.to_path_buf()))?;

    let mut roots = RootCertStore::empty();
    for block in pem::parse_many(data).map_err(Error::ParseCaBundle)? {
        if block.tag() != "CERTIFICATE" {
            continue;
        }

        roots
            .add(CertificateDer::from(block.into_contents()))
            .map_err(Error::BuildRootCertStore)?;
    }

    Ok(ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uri(value: &str) -> http::Uri {
        value.parse().unwrap()
    }

    #[test]
    fn url_elides_default_port() {
        assert_eq!(build_url("10.0.0.1", "443").unwrap(), uri("https://10.0.0.1"));
        assert_eq!(
            build_url("kubernetes.default.svc", "443").unwrap(),
            uri("https://kubernetes.default.svc")
        );
    }

    #[test]
    fn url_keeps_explicit_port() {
        assert_eq!(
            build_url("10.0.0.1", "6443").unwrap(),
            uri("https://10.0.0.1:6443")
        );
    }

    #[test]
    fn url_brackets_ipv6() {
        assert_eq!(build_url("fd00::1", "443").unwrap(), uri("https://[fd00::1]"));
        assert_eq!(
            build_url("fd00::1", "6443").unwrap(),
            uri("https://[fd00::1]:6443")
        );
    }

    #[test]
    fn url_rejects_garbage() {
        assert!(matches!(
            build_url("host with spaces", "443"),
            Err(Error::InvalidAddress(_))
        ));
    }
}
