//! LDAP-backed [`DirectorySource`].
//!
//! [`LdapDirectory::connect`] walks through the connection stages one at a
//! time so a failure names the stage it happened in: TCP reachability, TLS
//! (StartTLS for `ldap://`, implicit for `ldaps://`), then simple bind.
//!
//! The certificate is verified against `server_name` rather than the URL
//! host; see [`crate::directory::tls`].

use std::net::TcpStream;
use std::time::Duration;

use ldap3::{LdapConn, LdapConnSettings, LdapError, Scope, SearchEntry};
use tracing::{debug, info, warn};
use url::Url;

use crate::config::DirectoryConfig;
use crate::directory::tls;
use crate::directory::{DirectorySource, SearchRequest};
use crate::errors::DirectoryError;

const LDAP_PORT: u16 = 389;
const LDAPS_PORT: u16 = 636;

/// An authenticated LDAP connection.
pub struct LdapDirectory {
    conn: LdapConn,
    url: String,
}

impl LdapDirectory {
    /// Connect, secure and bind using the given settings.
    pub fn connect(config: &DirectoryConfig) -> Result<Self, DirectoryError> {
        let url = Url::parse(&config.url).map_err(|e| DirectoryError::InvalidUrl {
            url: config.url.clone(),
            detail: e.to_string(),
        })?;
        let implicit_tls = match url.scheme() {
            "ldaps" => true,
            "ldap" => false,
            other => {
                return Err(DirectoryError::InvalidUrl {
                    url: config.url.clone(),
                    detail: format!("unsupported scheme '{other}'"),
                })
            }
        };
        let port = url
            .port()
            .unwrap_or(if implicit_tls { LDAPS_PORT } else { LDAP_PORT });
        let timeout = Duration::from_secs(config.connect_timeout_secs);

        // ldap3 opens its own socket; checking first keeps an unreachable
        // server reported as a connect failure rather than a TLS one.
        check_reachable(&url, port, timeout)?;

        debug!(
            url = %config.url,
            server_name = %config.server_name,
            starttls = !implicit_tls,
            "negotiating tls"
        );
        let encrypt_err = |source: LdapError| DirectoryError::Encrypt {
            server_name: config.server_name.clone(),
            source,
        };
        let tls_config =
            tls::client_config(&config.server_name).map_err(|e| encrypt_err(LdapError::from(e)))?;
        let settings = LdapConnSettings::new()
            .set_conn_timeout(timeout)
            .set_starttls(!implicit_tls)
            .set_config(tls_config);
        let mut conn = LdapConn::with_settings(settings, &config.url).map_err(encrypt_err)?;

        debug!(bind_dn = %config.bind_dn, "performing ldap bind");
        let password = config.password.as_deref().unwrap_or_default();
        conn.simple_bind(&config.bind_dn, password)
            .and_then(|res| res.success())
            .map_err(|source| DirectoryError::Bind {
                bind_dn: config.bind_dn.clone(),
                source,
            })?;

        info!(url = %config.url, bind_dn = %config.bind_dn, "connected to ldap");
        Ok(Self {
            conn,
            url: config.url.clone(),
        })
    }

    /// Close the connection politely. Errors are only logged: by the time
    /// this runs the data has already been read.
    pub fn unbind(mut self) {
        if let Err(e) = self.conn.unbind() {
            warn!(url = %self.url, error = %e, "error during ldap unbind");
        }
    }
}

impl DirectorySource for LdapDirectory {
    fn search(&mut self, request: &SearchRequest) -> Result<Vec<SearchEntry>, DirectoryError> {
        debug!(
            base_dn = %request.base_dn,
            filter = %request.filter,
            attributes = ?request.attributes,
            "searching ldap subtree"
        );

        let (entries, _res) = self
            .conn
            .search(
                &request.base_dn,
                Scope::Subtree,
                &request.filter,
                request.attributes.iter().map(String::as_str).collect::<Vec<_>>(),
            )
            .and_then(|res| res.success())
            .map_err(|source| DirectoryError::Search {
                base_dn: request.base_dn.clone(),
                filter: request.filter.clone(),
                source,
            })?;

        let entries: Vec<SearchEntry> = entries.into_iter().map(SearchEntry::construct).collect();
        info!(count = entries.len(), "ldap search complete");
        Ok(entries)
    }
}

impl std::fmt::Debug for LdapDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LdapDirectory").field("url", &self.url).finish()
    }
}

/// Make sure some address of the URL's host accepts TCP connections.
fn check_reachable(url: &Url, port: u16, timeout: Duration) -> Result<(), DirectoryError> {
    let address = format!("{}:{}", url.host_str().unwrap_or_default(), port);
    let connect_err = |source: std::io::Error| DirectoryError::Connect {
        address: address.clone(),
        source,
    };

    let addrs = url.socket_addrs(|| Some(port)).map_err(connect_err)?;
    debug!(%address, candidates = addrs.len(), "connecting to ldap server");

    let mut last_err = std::io::Error::new(
        std::io::ErrorKind::NotFound,
        "host resolved to no addresses",
    );
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(_) => return Ok(()),
            Err(e) => {
                debug!(%addr, error = %e, "connection attempt failed");
                last_err = e;
            }
        }
    }
    Err(connect_err(last_err))
}
