//! Certificate validation hook for the production transport.
//!
//! When a [`BadCertificateCallback`] is configured the transport builds its own rustls client
//! configuration whose verifier first runs standard WebPKI validation against the platform root
//! store and, only when that rejects the chain, asks the callback whether to accept it anyway.

use std::fmt;
use std::sync::Arc;

use rustls::client::WebPkiServerVerifier;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::ring;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};

use crate::Result;
use crate::error::{Error, Kind};

type CertificateFn = dyn Fn(&[u8], &str, u16) -> bool + Send + Sync;

/// Callback invoked with `(certificate DER bytes, host, port)` when certificate validation fails.
///
/// Returning `true` accepts the certificate and lets the handshake continue; returning `false`
/// fails the connection through the normal error path.
#[derive(Clone)]
pub struct BadCertificateCallback(Arc<CertificateFn>);

impl BadCertificateCallback {
    pub fn new<F>(callback: F) -> Self
    where
        F: Fn(&[u8], &str, u16) -> bool + Send + Sync + 'static,
    {
        Self(Arc::new(callback))
    }

    #[must_use]
    pub fn call(&self, certificate: &[u8], host: &str, port: u16) -> bool {
        (self.0)(certificate, host, port)
    }
}

impl fmt::Debug for BadCertificateCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BadCertificateCallback")
    }
}

/// Verifier that defers to WebPKI and falls back to a [`BadCertificateCallback`].
#[derive(Debug)]
struct CallbackVerifier {
    inner: Arc<WebPkiServerVerifier>,
    callback: BadCertificateCallback,
    host: String,
    port: u16,
}

impl ServerCertVerifier for CallbackVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        match self.inner.verify_server_cert(
            end_entity,
            intermediates,
            server_name,
            ocsp_response,
            now,
        ) {
            Ok(verified) => Ok(verified),
            Err(e) => {
                if self.callback.call(end_entity.as_ref(), &self.host, self.port) {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(host = %self.host, port = self.port, error = %e, "Accepting certificate rejected by validation");
                    Ok(ServerCertVerified::assertion())
                } else {
                    Err(e)
                }
            }
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

/// Build a rustls client configuration that routes validation failures for `host:port` through
/// `callback`.
pub(crate) fn client_config(
    callback: &BadCertificateCallback,
    host: &str,
    port: u16,
) -> Result<Arc<ClientConfig>> {
    let provider = Arc::new(ring::default_provider());

    let mut roots = RootCertStore::empty();
    let native = rustls_native_certs::load_native_certs();
    let (_added, _ignored) = roots.add_parsable_certificates(native.certs);

    let inner = WebPkiServerVerifier::builder_with_provider(Arc::new(roots), Arc::clone(&provider))
        .build()
        .map_err(|e| Error::with_source(Kind::Validation, e))?;

    let verifier = CallbackVerifier {
        inner,
        callback: callback.clone(),
        host: host.to_owned(),
        port,
    };

    let config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| Error::with_source(Kind::Internal, e))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_no_client_auth();

    Ok(Arc::new(config))
}
