// Copyright (c) 2024 strix contributors.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Producing open, TLS-verified XML streams for a target domain.
//!
//! The connector resolves candidate endpoints (SRV or an override list),
//! walks them in order and performs the transport bring-up for each
//! flavour: immediate TLS with ALPN for XEP-0368 endpoints, or a
//! plaintext stream followed by STARTTLS. TLS failures abort the
//! candidate walk — they indicate misconfiguration, and hammering the
//! remaining endpoints would only bury the actual problem.

use core::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncBufRead, AsyncWrite, BufReader};

use strix_schema::Element;
use strix_stanzas::{ns, starttls, stream_features::StreamFeatures};

use crate::error::{Error, ProtocolError};
use crate::sasl::ChannelBinding;
use crate::stanza::XmppStreamElement;
use crate::xmlstream::{initiate_stream, ReadError, StreamHeader, Timeouts, XmlStream};

pub mod dns;
pub mod tls;

pub use self::dns::discover_endpoints;
pub use self::tls::{PinStore, PinType, TlsParams};

/// Object-safe bundle of the traits the transport under an XML stream
/// must provide.
pub trait AsyncReadAndWrite: AsyncBufRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncBufRead + AsyncWrite + Unpin + Send> AsyncReadAndWrite for T {}

/// The transport flavour of a candidate endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flavour {
    /// Plaintext TCP upgraded via STARTTLS.
    StartTls,

    /// TLS from the first byte, XEP-0368.
    DirectTls,
}

/// One candidate connection target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// Host name or address literal.
    pub host: String,

    /// TCP port.
    pub port: u16,

    /// How TLS is established on this endpoint.
    pub flavour: Flavour,
}

/// The transport type produced by the connector.
pub type BoxedXmlStream = XmlStream<Box<dyn AsyncReadAndWrite + 'static>, XmppStreamElement>;

/// An established, TLS-protected stream, ready for SASL.
pub struct EstablishedStream {
    /// The stream, positioned right after the post-TLS stream features.
    pub stream: BoxedXmlStream,

    /// The features announced on the secured stream.
    pub features: StreamFeatures,

    /// Channel binding data extracted from the TLS session.
    pub channel_binding: ChannelBinding,
}

/// Connector configuration.
#[derive(Debug, Clone)]
pub struct Connector {
    /// The domain to connect to (also the SNI name and the `to` of the
    /// stream header).
    pub domain: String,

    /// Candidate endpoints supplied by configuration; when non-empty,
    /// DNS discovery is skipped and this list is used verbatim.
    pub override_peer: Vec<Endpoint>,

    /// TLS verification parameters.
    pub tls: TlsParams,

    /// Per-candidate budget for TCP connect, TLS and stream setup
    /// together.
    pub negotiation_timeout: Duration,
}

impl Connector {
    /// Build a connector with default policies for `domain`.
    pub fn new<S: Into<String>>(domain: S) -> Connector {
        Connector {
            domain: domain.into(),
            override_peer: vec![],
            tls: TlsParams::default(),
            negotiation_timeout: Duration::new(60, 0),
        }
    }

    /// Establish a secured stream to the configured domain.
    ///
    /// Walks the candidate list; transport errors move on to the next
    /// candidate, TLS errors are re-raised immediately.
    pub async fn connect(&self, timeouts: Timeouts) -> Result<EstablishedStream, Error> {
        let endpoints = if self.override_peer.is_empty() {
            discover_endpoints(&self.domain).await?
        } else {
            self.override_peer.clone()
        };

        let mut last_error = None;
        for endpoint in &endpoints {
            log::debug!(
                "attempting connection to {}:{} ({:?})",
                endpoint.host,
                endpoint.port,
                endpoint.flavour
            );
            let attempt = self.connect_one(endpoint, timeouts);
            match tokio::time::timeout(self.negotiation_timeout, attempt).await {
                Ok(Ok(stream)) => return Ok(stream),
                Ok(Err(e @ Error::Tls(_))) => {
                    // not retryable across candidates
                    return Err(e);
                }
                Ok(Err(e)) => {
                    log::debug!(
                        "candidate {}:{} failed: {}",
                        endpoint.host,
                        endpoint.port,
                        e
                    );
                    last_error = Some(e);
                }
                Err(_elapsed) => {
                    log::debug!(
                        "candidate {}:{} exceeded the negotiation budget",
                        endpoint.host,
                        endpoint.port
                    );
                    last_error = Some(Error::Io(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        "connection attempt timed out",
                    )));
                }
            }
        }
        Err(last_error.unwrap_or(Error::Disconnected))
    }

    async fn connect_one(
        &self,
        endpoint: &Endpoint,
        timeouts: Timeouts,
    ) -> Result<EstablishedStream, Error> {
        let tcp = dns::connect_tcp(&endpoint.host, endpoint.port).await?;
        match endpoint.flavour {
            Flavour::DirectTls => {
                let tls_stream =
                    tls::connect_tls(tcp, &self.domain, &self.tls, Some(tls::ALPN_XMPP_CLIENT))
                        .await?;
                let channel_binding = tls::channel_binding(&tls_stream);
                let io: Box<dyn AsyncReadAndWrite> = Box::new(BufReader::new(tls_stream));
                let (features, stream) = self.open_stream(io, timeouts).await?;
                Ok(EstablishedStream {
                    stream,
                    features,
                    channel_binding,
                })
            }
            Flavour::StartTls => {
                let (features, mut stream) = self
                    .open_stream(BufReader::new(tcp), timeouts)
                    .await?;
                if !features.can_starttls() {
                    // the security policy of this engine never permits
                    // plaintext streams
                    return Err(ProtocolError::NoTls.into());
                }

                let request: Element = starttls::Request {}.into();
                stream.send(&request).await?;
                loop {
                    match stream.next().await {
                        Some(Ok(XmppStreamElement::Tls(starttls::Nonza::Proceed(_)))) => break,
                        Some(Ok(XmppStreamElement::Tls(starttls::Nonza::Failure(_)))) => {
                            return Err(ProtocolError::NoTls.into());
                        }
                        Some(Ok(other)) => {
                            log::warn!("ignoring element during STARTTLS: {:?}", other);
                        }
                        Some(Err(ReadError::SoftTimeout)) => continue,
                        Some(Err(ReadError::ParseError { error: e, .. })) => {
                            return Err(ProtocolError::Schema(e).into())
                        }
                        Some(Err(ReadError::HardError(e))) => return Err(e.into()),
                        Some(Err(ReadError::StreamFooterReceived)) | None => {
                            return Err(Error::Disconnected)
                        }
                    }
                }

                let tcp = stream.into_inner().into_inner();
                let tls_stream = tls::connect_tls(tcp, &self.domain, &self.tls, None).await?;
                let channel_binding = tls::channel_binding(&tls_stream);
                let io: Box<dyn AsyncReadAndWrite> = Box::new(BufReader::new(tls_stream));
                let (features, stream) = self.open_stream(io, timeouts).await?;
                Ok(EstablishedStream {
                    stream,
                    features,
                    channel_binding,
                })
            }
        }
    }

    async fn open_stream<Io: AsyncBufRead + AsyncWrite + Unpin>(
        &self,
        io: Io,
        timeouts: Timeouts,
    ) -> Result<(StreamFeatures, XmlStream<Io, XmppStreamElement>), Error> {
        let pending = initiate_stream(
            io,
            ns::JABBER_CLIENT,
            StreamHeader {
                to: Some(self.domain.as_str().into()),
                ..StreamHeader::default()
            },
            timeouts,
        )
        .await?;
        let (features, stream) = pending.recv_features().await?;
        Ok((features, stream))
    }
}
