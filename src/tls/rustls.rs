use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::client::WebPkiServerVerifier;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::WebPkiSupportedAlgorithms;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{CertificateError, ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

use super::MaybeTlsStream;
use crate::config::{SslMode, TlsConfig};
use crate::error::{ReplicationError, Result};
use crate::protocol::framing::write_ssl_request;

fn tls_err(what: &str, e: impl std::fmt::Display) -> ReplicationError {
    ReplicationError::Tls(format!("{what}: {e}"))
}

/// Send SSLRequest and, if the server agrees, run the TLS handshake.
pub async fn upgrade(mut tcp: TcpStream, tls: &TlsConfig, host: &str) -> Result<MaybeTlsStream> {
    write_ssl_request(&mut tcp).await?;
    let answer = tcp.read_u8().await?;

    if answer != b'S' {
        if tls.mode == SslMode::Prefer {
            warn!("server refused TLS; continuing in plain text (sslmode=prefer)");
            return Ok(MaybeTlsStream::Plain(tcp));
        }
        return Err(ReplicationError::Tls(
            "server does not support TLS (SSLRequest rejected)".into(),
        ));
    }

    let connector = TlsConnector::from(Arc::new(client_config(tls)?));
    let sni = tls.sni_hostname.clone().unwrap_or_else(|| host.to_string());
    let server_name = ServerName::try_from(sni).map_err(|e| tls_err("invalid SNI hostname", e))?;

    let stream = connector
        .connect(server_name, tcp)
        .await
        .map_err(|e| tls_err("tls handshake failed", e))?;
    debug!(mode = ?tls.mode, "tls established");
    Ok(MaybeTlsStream::Tls(Box::new(stream)))
}

fn client_config(tls: &TlsConfig) -> Result<ClientConfig> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()
        .map_err(|e| tls_err("protocol versions", e))?;

    let builder = match tls.mode {
        SslMode::VerifyFull => builder.with_root_certificates(root_store(tls)?),
        SslMode::VerifyCa => {
            let inner = WebPkiServerVerifier::builder_with_provider(
                Arc::new(root_store(tls)?),
                Arc::clone(&provider),
            )
            .build()
            .map_err(|e| tls_err("certificate verifier", e))?;
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(IgnoreHostname { inner }))
        }
        SslMode::Prefer | SslMode::Require | SslMode::Disable => builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCert {
                algorithms: provider.signature_verification_algorithms,
            })),
    };

    match (&tls.client_cert_pem_path, &tls.client_key_pem_path) {
        (Some(cert), Some(key)) => builder
            .with_client_auth_cert(load_certs(cert)?, load_key(key)?)
            .map_err(|e| tls_err("client certificate", e)),
        (None, None) => Ok(builder.with_no_client_auth()),
        _ => Err(ReplicationError::Config(
            "client_cert_pem_path and client_key_pem_path must be set together".into(),
        )),
    }
}

fn root_store(tls: &TlsConfig) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    match &tls.ca_pem_path {
        Some(path) => {
            let (added, ignored) = roots.add_parsable_certificates(load_certs(path)?);
            debug!(added, ignored, path = %path.display(), "loaded CA bundle");
            if added == 0 {
                return Err(ReplicationError::Tls(format!(
                    "no usable certificates in {}",
                    path.display()
                )));
            }
        }
        None => roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
    }
    Ok(roots)
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let f = File::open(path).map_err(|e| tls_err(&format!("open {}", path.display()), e))?;
    rustls_pemfile::certs(&mut BufReader::new(f))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| tls_err(&format!("parse {}", path.display()), e))
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let f = File::open(path).map_err(|e| tls_err(&format!("open {}", path.display()), e))?;
    rustls_pemfile::private_key(&mut BufReader::new(f))
        .map_err(|e| tls_err(&format!("parse {}", path.display()), e))?
        .ok_or_else(|| ReplicationError::Tls(format!("no private key in {}", path.display())))
}

/// `sslmode=require`: encrypt, but trust any certificate. Handshake
/// signatures are still checked.
#[derive(Debug)]
struct AcceptAnyCert {
    algorithms: WebPkiSupportedAlgorithms,
}

impl ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

/// `sslmode=verify-ca`: full chain validation, hostname not checked.
#[derive(Debug)]
struct IgnoreHostname {
    inner: Arc<WebPkiServerVerifier>,
}

impl ServerCertVerifier for IgnoreHostname {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp: &[u8],
        now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        match self
            .inner
            .verify_server_cert(end_entity, intermediates, server_name, ocsp, now)
        {
            Err(rustls::Error::InvalidCertificate(
                CertificateError::NotValidForName | CertificateError::NotValidForNameContext { .. },
            )) => Ok(ServerCertVerified::assertion()),
            other => other,
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}
