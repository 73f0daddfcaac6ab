//! Internal module for establishing the IMAPS transport of a mailbox session.

use crate::config::MailboxConfig;
use crate::error::{Error, Result};
use rustls::ClientConfig;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, instrument};
use webpki_roots::TLS_SERVER_ROOTS;

/// A TLS stream over TCP, used for IMAP communication.
pub(crate) type TlsStream = tokio_rustls::client::TlsStream<TcpStream>;

/// Opens the TCP connection to the configured IMAP server and performs the TLS handshake.
#[instrument(
    name = "connection::establish_tls",
    skip_all,
    fields(imap_host = %config.host, imap_port = config.port)
)]
pub(crate) async fn establish_tls_connection(config: &MailboxConfig) -> Result<TlsStream> {
    let target_addr = config.server_address();
    let server_name = parse_server_name(&config.host)?;
    let tcp_stream = connect_direct(&target_addr).await?;

    debug!("Performing TLS handshake");

    create_tls_connector()
        .connect(server_name, tcp_stream)
        .await
        .map_err(|source| Error::TlsConnect {
            target: target_addr,
            source,
        })
}

/// Creates a TLS connector with the webpki root certificates.
fn create_tls_connector() -> TlsConnector {
    let mut root_cert_store = rustls::RootCertStore::empty();
    root_cert_store.add_trust_anchors(TLS_SERVER_ROOTS.iter().map(|ta| {
        rustls::OwnedTrustAnchor::from_subject_spki_name_constraints(
            ta.subject,
            ta.spki,
            ta.name_constraints,
        )
    }));

    let tls_config = ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(root_cert_store)
        .with_no_client_auth();

    TlsConnector::from(Arc::new(tls_config))
}

/// Parses server name for TLS SNI.
fn parse_server_name(host: &str) -> Result<rustls::ServerName> {
    rustls::ServerName::try_from(host).map_err(|source| Error::InvalidDnsName {
        host: host.to_string(),
        source,
    })
}

#[instrument(name = "connection::direct", skip_all)]
async fn connect_direct(target_addr: &str) -> Result<TcpStream> {
    debug!(target = %target_addr, "Establishing TCP connection");

    TcpStream::connect(target_addr)
        .await
        .map_err(|source| Error::TcpConnect {
            target: target_addr.to_string(),
            source,
        })
}
