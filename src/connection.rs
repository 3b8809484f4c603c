//! Internal module for dialing servers and wrapping streams in TLS.
//!
//! SMTP starts in plaintext and may upgrade with `STARTTLS`; the mailbox
//! collaborator uses implicit TLS from the first byte. Both go through the
//! same connector construction driven by [`TrustMode`].

use crate::config::TrustMode;
use crate::error::{Error, Result, Step};
use rustls::client::{ServerCertVerified, ServerCertVerifier};
use rustls::{Certificate, ClientConfig, RootCertStore, ServerName};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, instrument, warn};
use webpki_roots::TLS_SERVER_ROOTS;

/// Any bidirectional byte stream a session can run over.
pub(crate) trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

/// Type-erased stream, so plaintext and TLS share one session type.
pub(crate) type BoxedStream = Box<dyn AsyncStream>;

/// A TLS stream over TCP, used for IMAP communication.
pub(crate) type TlsStream = tokio_rustls::client::TlsStream<TcpStream>;

/// Opens a TCP connection to `host:port`.
#[instrument(name = "connection::dial", skip_all, fields(target = %format!("{host}:{port}")))]
pub(crate) async fn dial(host: &str, port: u16, timeout: Duration) -> Result<TcpStream> {
    let target = format!("{host}:{port}");
    debug!("Establishing TCP connection");

    tokio::time::timeout(timeout, TcpStream::connect((host, port)))
        .await
        .map_err(|_| Error::ConnectTimeout {
            target: target.clone(),
            timeout,
        })?
        .map_err(|source| Error::Dial { target, source })
}

/// Performs a TLS handshake over an already-open stream.
#[instrument(name = "connection::upgrade_tls", skip_all, fields(host = %host))]
pub(crate) async fn upgrade_tls<S>(
    stream: S,
    host: &str,
    trust: &TrustMode,
    timeout: Duration,
) -> Result<tokio_rustls::client::TlsStream<S>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let connector = tls_connector(trust)?;
    let server_name = parse_server_name(host)?;

    debug!("Performing TLS handshake");

    tokio::time::timeout(timeout, connector.connect(server_name, stream))
        .await
        .map_err(|_| Error::StepTimeout {
            step: Step::StartTls,
            timeout,
        })?
        .map_err(|source| Error::TlsHandshake {
            target: host.to_string(),
            source,
        })
}

/// Dials `host:port` and performs the TLS handshake immediately.
#[instrument(name = "connection::establish_tls", skip_all, fields(host = %host, port))]
pub(crate) async fn establish_tls_connection(
    host: &str,
    port: u16,
    trust: &TrustMode,
    timeout: Duration,
) -> Result<TlsStream> {
    let tcp_stream = dial(host, port, timeout).await?;
    upgrade_tls(tcp_stream, host, trust, timeout)
        .await
        .map_err(|err| match err {
            Error::TlsHandshake { source, .. } => Error::TlsConnect {
                target: format!("{host}:{port}"),
                source,
            },
            Error::StepTimeout { timeout, .. } => Error::MailboxTimeout {
                operation: "tls handshake",
                timeout,
            },
            other => other,
        })
}

/// Builds a TLS connector for the trust mode.
pub(crate) fn tls_connector(trust: &TrustMode) -> Result<TlsConnector> {
    let builder = ClientConfig::builder().with_safe_defaults();

    let tls_config = match trust {
        TrustMode::SystemRoots => builder
            .with_root_certificates(system_roots())
            .with_no_client_auth(),
        TrustMode::CustomCa(pem) => builder
            .with_root_certificates(custom_roots(pem)?)
            .with_no_client_auth(),
        TrustMode::SkipValidation => {
            warn!("Certificate validation is disabled");
            builder
                .with_custom_certificate_verifier(Arc::new(NoCertVerifier))
                .with_no_client_auth()
        }
    };

    Ok(TlsConnector::from(Arc::new(tls_config)))
}

fn system_roots() -> RootCertStore {
    let mut root_cert_store = RootCertStore::empty();
    root_cert_store.add_trust_anchors(TLS_SERVER_ROOTS.iter().map(|ta| {
        rustls::OwnedTrustAnchor::from_subject_spki_name_constraints(
            ta.subject,
            ta.spki,
            ta.name_constraints,
        )
    }));
    root_cert_store
}

/// Trust store holding only the certificates of a PEM bundle.
pub(crate) fn custom_roots(pem: &[u8]) -> Result<RootCertStore> {
    let mut reader = std::io::BufReader::new(pem);
    let ders = rustls_pemfile::certs(&mut reader).map_err(|err| Error::InvalidCaCert {
        message: err.to_string(),
    })?;
    if ders.is_empty() {
        return Err(Error::InvalidCaCert {
            message: "no certificates found in PEM bundle".to_string(),
        });
    }

    let mut root_cert_store = RootCertStore::empty();
    let (added, ignored) = root_cert_store.add_parsable_certificates(&ders);
    debug!(added, ignored, "Loaded custom CA bundle");

    if added == 0 {
        return Err(Error::InvalidCaCert {
            message: format!("none of the {ignored} certificates could be parsed"),
        });
    }
    Ok(root_cert_store)
}

/// Parses server name for TLS SNI.
fn parse_server_name(host: &str) -> Result<ServerName> {
    ServerName::try_from(host).map_err(|source| Error::InvalidDnsName {
        host: host.to_string(),
        source,
    })
}

/// Accepts any server certificate.
struct NoCertVerifier;

impl ServerCertVerifier for NoCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: SystemTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }
}
