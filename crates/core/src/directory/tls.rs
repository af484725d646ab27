//! TLS client configuration that pins the server identity.
//!
//! ldap3 hands rustls the host of the connection URL as the name to verify.
//! [`ExpectedNameVerifier`] ignores that name and runs the regular webpki
//! chain and hostname checks against the configured `server_name` instead,
//! so the directory can be reached by an internal address or alias while the
//! certificate still has to match the expected identity.

use std::sync::Arc;
use std::time::SystemTime;

use rustls::client::{ServerCertVerified, ServerCertVerifier, WebPkiVerifier};
use rustls::{Certificate, ClientConfig, RootCertStore, ServerName};
use tracing::{debug, warn};

/// Verifies the server certificate against a fixed name.
pub struct ExpectedNameVerifier<V = WebPkiVerifier> {
    inner: V,
    expected: ServerName,
}

impl<V: ServerCertVerifier> ExpectedNameVerifier<V> {
    pub fn new(inner: V, expected: ServerName) -> Self {
        Self { inner, expected }
    }

    pub fn expected(&self) -> &ServerName {
        &self.expected
    }
}

impl<V: ServerCertVerifier> ServerCertVerifier for ExpectedNameVerifier<V> {
    fn verify_server_cert(
        &self,
        end_entity: &Certificate,
        intermediates: &[Certificate],
        presented: &ServerName,
        scts: &mut dyn Iterator<Item = &[u8]>,
        ocsp_response: &[u8],
        now: SystemTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        debug!(
            url_host = ?presented,
            expected = ?self.expected,
            "verifying server certificate"
        );
        self.inner.verify_server_cert(
            end_entity,
            intermediates,
            &self.expected,
            scts,
            ocsp_response,
            now,
        )
    }
}

/// Parse `server_name` as a DNS name or IP address.
pub fn expected_server_name(server_name: &str) -> Result<ServerName, std::io::Error> {
    ServerName::try_from(server_name).map_err(|e| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("invalid server name '{server_name}': {e}"),
        )
    })
}

/// Trust anchors from the platform certificate store.
fn native_roots() -> Result<RootCertStore, std::io::Error> {
    let mut roots = RootCertStore::empty();
    let certs = rustls_native_certs::load_native_certs()?;
    let (added, ignored) =
        roots.add_parsable_certificates(&certs.into_iter().map(|c| c.0).collect::<Vec<_>>());
    if ignored > 0 {
        warn!(ignored, "skipped unparsable certificates in the system store");
    }
    debug!(added, "loaded system trust anchors");
    Ok(roots)
}

/// Client configuration trusting the system roots and verifying the
/// certificate against `server_name`.
pub fn client_config(server_name: &str) -> Result<Arc<ClientConfig>, std::io::Error> {
    let expected = expected_server_name(server_name)?;
    let roots = native_roots()?;

    let mut config = ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(roots.clone())
        .with_no_client_auth();
    config
        .dangerous()
        .set_certificate_verifier(Arc::new(ExpectedNameVerifier::new(
            WebPkiVerifier::new(roots, None),
            expected,
        )));
    Ok(Arc::new(config))
}
