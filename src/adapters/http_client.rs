use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use axum::body::Body as AxumBody;
use hyper::{Request, Response, Version, header, header::HeaderValue};
use hyper_rustls::HttpsConnector;
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::TokioExecutor,
};
use once_cell::sync::Lazy;
use tracing::Instrument;
use rustls::{
    DigitallySignedStruct, SignatureScheme,
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    crypto::{CryptoProvider, verify_tls12_signature, verify_tls13_signature},
    pki_types::{CertificateDer, ServerName, UnixTime},
};
use rustls_native_certs::load_native_certs;

use crate::{
    core::routing::TlsOptions,
    ports::http_client::{HttpClient, HttpClientError, HttpClientResult},
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Native roots are read from disk once and shared by every transport.
static NATIVE_ROOTS: Lazy<Vec<CertificateDer<'static>>> = Lazy::new(|| {
    let native_certs = load_native_certs();
    if !native_certs.errors.is_empty() {
        tracing::warn!(
            "Some native certificates failed to load: {:?}",
            native_certs.errors
        );
    }
    tracing::info!("Loaded {} native root certificates.", native_certs.certs.len());
    native_certs.certs
});

/// HTTP client adapter using Hyper with Rustls.
///
/// Responsibilities:
/// * Trusts native roots plus an optional per-upstream CA bundle, or nothing at all
///   when `insecure_skip_verify` is set
/// * Forces request version to HTTP/1.1 so `Upgrade` handshakes can be tunnelled
/// * Converts between Hyper body and Axum body types
///
/// One adapter is one connection pool; see [`crate::adapters::TransportCache`] for
/// how adapters are shared between upstreams.
pub struct HttpClientAdapter {
    client: Client<HttpsConnector<HttpConnector>, AxumBody>,
}

impl HttpClientAdapter {
    /// Create a client for upstreams reached with the given TLS settings.
    pub fn with_tls(options: &TlsOptions) -> HttpClientResult<Self> {
        let provider = CryptoProvider::get_default()
            .cloned()
            .unwrap_or_else(|| Arc::new(rustls::crypto::aws_lc_rs::default_provider()));

        let builder = rustls::ClientConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()
            .map_err(|e| HttpClientError::Tls(e.to_string()))?;

        let tls_config = if options.insecure_skip_verify {
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(SkipServerVerification(provider)))
                .with_no_client_auth()
        } else {
            builder
                .with_root_certificates(root_store(options.ca_bundle.as_deref())?)
                .with_no_client_auth()
        };

        let mut http_connector = HttpConnector::new();
        http_connector.enforce_http(false); // Allow HTTPS URLs
        http_connector.set_connect_timeout(Some(CONNECT_TIMEOUT));

        let https_connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_tls_config(tls_config)
            .https_or_http()
            .enable_http1()
            .wrap_connector(http_connector);

        let client = Client::builder(TokioExecutor::new()).build::<_, AxumBody>(https_connector);

        tracing::debug!(
            insecure = options.insecure_skip_verify,
            custom_ca = options.ca_bundle.is_some(),
            "Created new HTTP client"
        );
        Ok(Self { client })
    }
}

fn root_store(ca_bundle: Option<&str>) -> HttpClientResult<rustls::RootCertStore> {
    let mut root_cert_store = rustls::RootCertStore::empty();
    for cert in NATIVE_ROOTS.iter() {
        if root_cert_store.add(cert.clone()).is_err() {
            tracing::warn!("Failed to add native certificate to rustls RootCertStore");
        }
    }

    if let Some(bundle) = ca_bundle {
        let mut reader = bundle.as_bytes();
        let mut added = 0;
        for cert in rustls_pemfile::certs(&mut reader) {
            let cert = cert.map_err(|e| HttpClientError::Tls(format!("invalid CA bundle: {e}")))?;
            root_cert_store
                .add(cert)
                .map_err(|e| HttpClientError::Tls(format!("invalid CA certificate: {e}")))?;
            added += 1;
        }
        if added == 0 {
            return Err(HttpClientError::Tls(
                "CA bundle contains no certificates".to_string(),
            ));
        }
    }

    Ok(root_cert_store)
}

/// Accepts any server certificate while still checking handshake signatures.
#[derive(Debug)]
struct SkipServerVerification(Arc<CryptoProvider>);

impl ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

/// `Host` always names the upstream, never the gateway the caller talked to.
fn upstream_host(uri: &hyper::Uri) -> HttpClientResult<HeaderValue> {
    let host = uri
        .host()
        .ok_or_else(|| HttpClientError::InvalidRequest(format!("upstream uri {uri} has no host")))?;
    let value = match uri.port_u16() {
        Some(port) => HeaderValue::from_str(&format!("{host}:{port}")),
        None => HeaderValue::from_str(host),
    };
    value.map_err(|_| HttpClientError::InvalidRequest(format!("upstream host {host} is not a valid header value")))
}

#[async_trait]
impl HttpClient for HttpClientAdapter {
    async fn send_request(&self, req: Request<AxumBody>) -> HttpClientResult<Response<AxumBody>> {
        let host = upstream_host(req.uri())?;
        let (mut parts, body) = req.into_parts();
        parts.headers.insert(header::HOST, host);
        parts.version = Version::HTTP_11;

        let span = tracing::debug_span!(
            "upstream_request",
            upstream = %parts.uri.authority().map_or("unknown", |a| a.as_str()),
            http.method = %parts.method,
            http.path = %parts.uri.path(),
            http.status_code = tracing::field::Empty,
        );
        let method = parts.method.clone();
        let uri = parts.uri.clone();

        async move {
            tracing::trace!(headers = ?parts.headers, "Sending upstream request");
            match self.client.request(Request::from_parts(parts, body)).await {
                Ok(response) => {
                    tracing::Span::current().record("http.status_code", response.status().as_u16());
                    let (mut parts, body) = response.into_parts();
                    // re-framed by the downstream server
                    parts.headers.remove(header::TRANSFER_ENCODING);
                    Ok(Response::from_parts(parts, AxumBody::new(body)))
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Upstream request failed");
                    Err(HttpClientError::ConnectionError(format!("{method} {uri} failed: {e}")))
                }
            }
        }
        .instrument(span)
        .await
    }
}
