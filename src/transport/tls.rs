//! Certificate loading and the HTTP client setup shared by both transports.

use std::net::{SocketAddr, ToSocketAddrs};

use reqwest::{Certificate, ClientBuilder, Identity};
use tracing::debug;

use crate::config::{DialSettings, Endpoint};
use crate::error::{Result, WinRmError};

/// Parse a PEM bundle of trusted CA certificates.
///
/// A bundle that parses but holds no certificate is rejected too.
pub fn load_ca_pool(pem: &[u8]) -> Result<Vec<Certificate>> {
    let pool = Certificate::from_pem_bundle(pem)
        .map_err(|e| WinRmError::Config(format!("unable to read CA certificates: {}", e)))?;
    if pool.is_empty() {
        return Err(WinRmError::Config(
            "unable to read CA certificates: no certificate found".to_string(),
        ));
    }
    Ok(pool)
}

/// Combine a PEM certificate and PEM private key into a client identity.
pub fn load_identity(cert: &[u8], key: &[u8]) -> Result<Identity> {
    let mut pem = Vec::with_capacity(cert.len() + key.len() + 1);
    pem.extend_from_slice(cert);
    pem.push(b'\n');
    pem.extend_from_slice(key);
    Identity::from_pem(&pem)
        .map_err(|e| WinRmError::Config(format!("invalid client certificate or key: {}", e)))
}

/// Start an HTTP client builder for `endpoint` and return it with the URL
/// requests should target.
///
/// Applies certificate verification, the CA pool, dial settings and the TLS
/// server name override. The override keeps the connection on the
/// endpoint's address while the handshake presents and verifies the
/// override name.
pub(crate) fn http_builder(
    endpoint: &Endpoint,
    dial: &DialSettings,
) -> Result<(ClientBuilder, String)> {
    let mut builder = reqwest::Client::builder()
        .use_rustls_tls()
        .danger_accept_invalid_certs(endpoint.insecure)
        .connect_timeout(dial.connect_timeout)
        .tcp_keepalive(dial.keep_alive)
        .local_address(dial.local_address);

    if let Some(ref ca) = endpoint.ca_cert {
        for cert in load_ca_pool(ca)? {
            builder = builder.add_root_certificate(cert);
        }
        builder = builder.tls_built_in_root_certs(false);
    }

    let mut url = endpoint.url();
    if endpoint.https
        && let Some(ref server_name) = endpoint.tls_server_name
    {
        let addrs = resolve_endpoint(endpoint)?;
        debug!(
            host = %endpoint.host,
            server_name = %server_name,
            addrs = ?addrs,
            "Pinning TLS server name to endpoint address"
        );
        builder = builder.resolve_to_addrs(server_name, &addrs);
        url = endpoint.url_for_host(server_name);
    }

    Ok((builder, url))
}

fn resolve_endpoint(endpoint: &Endpoint) -> Result<Vec<SocketAddr>> {
    let host = endpoint.host.trim_start_matches('[').trim_end_matches(']');
    let addrs: Vec<SocketAddr> = (host, endpoint.port)
        .to_socket_addrs()
        .map_err(|e| WinRmError::Config(format!("cannot resolve {}: {}", endpoint.host, e)))?
        .collect();
    if addrs.is_empty() {
        return Err(WinRmError::Config(format!(
            "cannot resolve {}: no addresses",
            endpoint.host
        )));
    }
    Ok(addrs)
}
