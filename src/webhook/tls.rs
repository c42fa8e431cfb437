//! Transport security for the admission webhook listener
//!
//! When OLM injects serving certificates they appear under a fixed
//! directory; otherwise the server falls back to the conventional default
//! location, where another tool (e.g. cert-manager) is expected to put them.
//! HTTP/2 is disabled unless explicitly allowed, to stay clear of the HTTP/2
//! rapid reset and stream cancellation CVEs.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use tracing::info;

use crate::{Error, Result};

/// Directory OLM mounts injected webhook certificates into
pub const WEBHOOK_CERT_DIR: &str = "/apiserver.local.config/certificates";
/// Injected certificate file name
pub const WEBHOOK_CERT_NAME: &str = "apiserver.crt";
/// Injected key file name
pub const WEBHOOK_KEY_NAME: &str = "apiserver.key";

/// Certificate file name used when none is configured
pub const DEFAULT_CERT_NAME: &str = "tls.crt";
/// Key file name used when none is configured
pub const DEFAULT_KEY_NAME: &str = "tls.key";

const HTTP1: &[u8] = b"http/1.1";
const HTTP2: &[u8] = b"h2";

/// A named mutation applied to the server TLS configuration
#[derive(Clone, Copy)]
pub struct TlsOption {
    name: &'static str,
    apply: fn(&mut ServerConfig),
}

impl TlsOption {
    /// Restrict ALPN to HTTP/1.1
    pub const HTTP1_ONLY: TlsOption = TlsOption {
        name: "http1-only",
        apply: force_http1,
    };

    /// Option name
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Apply the mutation
    pub fn apply(&self, config: &mut ServerConfig) {
        (self.apply)(config)
    }
}

impl fmt::Debug for TlsOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TlsOption").field(&self.name).finish()
    }
}

fn force_http1(config: &mut ServerConfig) {
    config.alpn_protocols = vec![HTTP1.to_vec()];
}

/// Webhook certificate location and TLS mutations
///
/// `cert_dir`, `cert_name` and `key_name` are either all set or all unset.
#[derive(Debug, Clone, Default)]
pub struct WebhookTlsConfig {
    /// Directory holding the certificate and key
    pub cert_dir: Option<PathBuf>,
    /// Certificate file name inside `cert_dir`
    pub cert_name: Option<String>,
    /// Key file name inside `cert_dir`
    pub key_name: Option<String>,
    /// Mutations applied, in order, to the server TLS configuration
    pub tls_options: Vec<TlsOption>,
}

/// Resolved certificate and key paths
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertPaths {
    /// Certificate (chain) PEM
    pub cert: PathBuf,
    /// Private key PEM
    pub key: PathBuf,
}

/// Directory the webhook server reads certificates from when none is configured
pub fn default_cert_dir() -> PathBuf {
    std::env::temp_dir()
        .join("k8s-webhook-server")
        .join("serving-certs")
}

/// Build the webhook TLS configuration
///
/// Looks for [`WEBHOOK_CERT_NAME`] and [`WEBHOOK_KEY_NAME`] in `cert_dir`.
/// Deterministic given the filesystem state and `enable_http2`.
pub fn configure_webhook_tls(cert_dir: &Path, enable_http2: bool) -> WebhookTlsConfig {
    let mut config = WebhookTlsConfig::default();

    let certs_injected = [WEBHOOK_CERT_NAME, WEBHOOK_KEY_NAME]
        .iter()
        .all(|name| cert_dir.join(name).is_file());

    if certs_injected {
        config.cert_dir = Some(cert_dir.to_path_buf());
        config.cert_name = Some(WEBHOOK_CERT_NAME.to_string());
        config.key_name = Some(WEBHOOK_KEY_NAME.to_string());
    } else {
        info!(dir = %cert_dir.display(), "OLM injected certs for webhooks not found");
    }

    if enable_http2 {
        info!("HTTP/2 for webhooks enabled");
    } else {
        config.tls_options.push(TlsOption::HTTP1_ONLY);
        info!("HTTP/2 for webhooks disabled");
    }

    config
}

impl WebhookTlsConfig {
    /// Certificate and key paths, falling back to the default location
    pub fn resolve(&self) -> CertPaths {
        let dir = self.cert_dir.clone().unwrap_or_else(default_cert_dir);
        let cert_name = self.cert_name.as_deref().unwrap_or(DEFAULT_CERT_NAME);
        let key_name = self.key_name.as_deref().unwrap_or(DEFAULT_KEY_NAME);
        CertPaths {
            cert: dir.join(cert_name),
            key: dir.join(key_name),
        }
    }

    /// Load the certificate and key and build the server TLS configuration
    ///
    /// ALPN starts as `h2, http/1.1`; every [`TlsOption`] is applied after.
    pub fn build_server_config(&self) -> Result<ServerConfig> {
        let paths = self.resolve();

        let certs = CertificateDer::pem_file_iter(&paths.cert)
            .and_then(|iter| iter.collect::<std::result::Result<Vec<_>, _>>())
            .map_err(|e| Error::Tls(format!("reading {}: {:?}", paths.cert.display(), e)))?;
        if certs.is_empty() {
            return Err(Error::Tls(format!(
                "no certificates in {}",
                paths.cert.display()
            )));
        }
        let key = PrivateKeyDer::from_pem_file(&paths.key)
            .map_err(|e| Error::Tls(format!("reading {}: {:?}", paths.key.display(), e)))?;

        let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
        let mut config = ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| Error::Tls(e.to_string()))?
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| Error::Tls(e.to_string()))?;

        config.alpn_protocols = vec![HTTP2.to_vec(), HTTP1.to_vec()];
        for option in &self.tls_options {
            option.apply(&mut config);
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_certs(dir: &Path, cert: bool, key: bool) {
        let generated = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        if cert {
            std::fs::write(dir.join(WEBHOOK_CERT_NAME), generated.cert.pem()).unwrap();
        }
        if key {
            std::fs::write(dir.join(WEBHOOK_KEY_NAME), generated.key_pair.serialize_pem()).unwrap();
        }
    }

    #[test]
    fn paths_set_only_when_both_files_present() {
        for (cert, key) in [(false, false), (true, false), (false, true), (true, true)] {
            for enable_http2 in [false, true] {
                let dir = tempfile::tempdir().unwrap();
                write_certs(dir.path(), cert, key);

                let config = configure_webhook_tls(dir.path(), enable_http2);
                let set = [
                    config.cert_dir.is_some(),
                    config.cert_name.is_some(),
                    config.key_name.is_some(),
                ];

                if cert && key {
                    assert_eq!(set, [true, true, true]);
                    assert_eq!(config.cert_dir.as_deref(), Some(dir.path()));
                    assert_eq!(config.cert_name.as_deref(), Some(WEBHOOK_CERT_NAME));
                    assert_eq!(config.key_name.as_deref(), Some(WEBHOOK_KEY_NAME));
                } else {
                    assert_eq!(set, [false, false, false], "cert={cert} key={key}");
                }
            }
        }
    }

    #[test]
    fn http2_disabled_adds_exactly_one_http1_option() {
        for (cert, key) in [(false, false), (true, true)] {
            let dir = tempfile::tempdir().unwrap();
            write_certs(dir.path(), cert, key);

            let config = configure_webhook_tls(dir.path(), false);
            assert_eq!(config.tls_options.len(), 1);
            assert_eq!(config.tls_options[0].name(), "http1-only");
        }
    }

    #[test]
    fn http2_enabled_adds_no_options() {
        let dir = tempfile::tempdir().unwrap();
        write_certs(dir.path(), true, true);
        assert!(configure_webhook_tls(dir.path(), true).tls_options.is_empty());

        let empty = tempfile::tempdir().unwrap();
        assert!(configure_webhook_tls(empty.path(), true).tls_options.is_empty());
    }

    #[test]
    fn missing_certs_fall_back_to_default_location() {
        let dir = tempfile::tempdir().unwrap();
        let config = configure_webhook_tls(dir.path(), false);
        assert_eq!(
            config.resolve(),
            CertPaths {
                cert: default_cert_dir().join(DEFAULT_CERT_NAME),
                key: default_cert_dir().join(DEFAULT_KEY_NAME),
            }
        );
    }

    #[test]
    fn server_config_honours_http1_only() {
        let dir = tempfile::tempdir().unwrap();
        write_certs(dir.path(), true, true);

        let config = configure_webhook_tls(dir.path(), false)
            .build_server_config()
            .unwrap();
        assert_eq!(config.alpn_protocols, vec![b"http/1.1".to_vec()]);

        let config = configure_webhook_tls(dir.path(), true)
            .build_server_config()
            .unwrap();
        assert_eq!(
            config.alpn_protocols,
            vec![b"h2".to_vec(), b"http/1.1".to_vec()]
        );
    }

    #[test]
    fn server_config_fails_without_files() {
        let config = WebhookTlsConfig {
            cert_dir: Some(PathBuf::from("/nonexistent/certs")),
            cert_name: Some(WEBHOOK_CERT_NAME.to_string()),
            key_name: Some(WEBHOOK_KEY_NAME.to_string()),
            tls_options: vec![],
        };
        assert!(matches!(config.build_server_config(), Err(Error::Tls(_))));
    }
}
