// Copyright (c) 2024 strix contributors.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Error taxonomy of the engine.
//!
//! The split matters for the reconnect loop: transport errors
//! ([`Error::Io`], [`Error::Disconnected`]) are retried with backoff,
//! while TLS and authentication errors are critical and abort the client.

use hickory_resolver::error::ResolveError as DnsResolveError;
use std::error::Error as StdError;
use std::fmt;
use std::io::Error as IoError;
use std::net::AddrParseError;

use strix_stanzas::jid::JidParseError;
use strix_stanzas::sasl::DefinedCondition as SaslDefinedCondition;
use strix_stanzas::stanza_error::StanzaError;
use strix_stanzas::stream_error::StreamError;

use crate::sasl::MechanismError;

/// Top-level error type.
#[derive(Debug)]
pub enum Error {
    /// I/O error.
    Io(IoError),
    /// Error parsing a Jabber-Id.
    JidParse(JidParseError),
    /// Protocol-level error.
    Protocol(ProtocolError),
    /// Authentication error.
    Auth(AuthError),
    /// An IQ request was answered with an error reply.
    ///
    /// Recoverable by the application; surfaced only from request
    /// helpers.
    Stanza(StanzaError),
    /// TLS error.
    Tls(TlsError),
    /// Connection closed.
    Disconnected,
    /// Should never happen.
    InvalidState,
    /// DNS resolution error.
    Resolve(DnsResolveError),
    /// DNS label conversion error, no details available from module
    /// `idna`.
    Idna,
    /// Invalid IP/Port address.
    Addr(AddrParseError),
}

impl Error {
    /// Whether the reconnect loop may retry after this error.
    ///
    /// TLS and authentication failures indicate misconfiguration and are
    /// not retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Io(_) | Error::Disconnected | Error::Resolve(_) => true,
            Error::Protocol(_) | Error::Stanza(_) => true,
            Error::Auth(_) | Error::Tls(_) => false,
            Error::JidParse(_) | Error::InvalidState | Error::Idna | Error::Addr(_) => false,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Io(e) => write!(fmt, "IO error: {}", e),
            Error::JidParse(e) => write!(fmt, "jid parse error: {}", e),
            Error::Protocol(e) => write!(fmt, "protocol error: {}", e),
            Error::Auth(e) => write!(fmt, "authentication error: {}", e),
            Error::Stanza(e) => write!(
                fmt,
                "error reply: {}",
                e.defined_condition.element_name()
            ),
            Error::Tls(e) => write!(fmt, "TLS error: {}", e),
            Error::Disconnected => write!(fmt, "disconnected"),
            Error::InvalidState => write!(fmt, "invalid state"),
            Error::Resolve(e) => write!(fmt, "{:?}", e),
            Error::Idna => write!(fmt, "IDNA error"),
            Error::Addr(e) => write!(fmt, "wrong network address: {e}"),
        }
    }
}

impl StdError for Error {}

impl From<IoError> for Error {
    fn from(e: IoError) -> Self {
        Error::Io(e)
    }
}

impl From<JidParseError> for Error {
    fn from(e: JidParseError) -> Self {
        Error::JidParse(e)
    }
}

impl From<ProtocolError> for Error {
    fn from(e: ProtocolError) -> Self {
        Error::Protocol(e)
    }
}

impl From<AuthError> for Error {
    fn from(e: AuthError) -> Self {
        Error::Auth(e)
    }
}

impl From<TlsError> for Error {
    fn from(e: TlsError) -> Self {
        Error::Tls(e)
    }
}

impl From<DnsResolveError> for Error {
    fn from(e: DnsResolveError) -> Error {
        Error::Resolve(e)
    }
}

impl From<idna::Errors> for Error {
    fn from(_e: idna::Errors) -> Self {
        Error::Idna
    }
}

impl From<AddrParseError> for Error {
    fn from(e: AddrParseError) -> Error {
        Error::Addr(e)
    }
}

impl From<strix_schema::Error> for Error {
    fn from(e: strix_schema::Error) -> Error {
        ProtocolError::Schema(e).into()
    }
}

/// XMPP protocol-level error.
#[derive(Debug)]
pub enum ProtocolError {
    /// Error with expected stanza schema.
    Schema(strix_schema::Error),
    /// No TLS available although the security policy demands it.
    NoTls,
    /// Invalid response to resource binding.
    InvalidBindResponse,
    /// A stream error was received from the peer.
    StreamError(StreamError),
    /// The peer violated the stream management protocol.
    StreamManagement(&'static str),
    /// The peer does not offer a feature we cannot continue without.
    MissingFeature(&'static str),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ProtocolError::Schema(e) => write!(fmt, "error with expected stanza schema: {}", e),
            ProtocolError::NoTls => write!(fmt, "no TLS available"),
            ProtocolError::InvalidBindResponse => {
                write!(fmt, "invalid response to resource binding")
            }
            ProtocolError::StreamError(e) => write!(fmt, "stream error received: {}", e),
            ProtocolError::StreamManagement(msg) => {
                write!(fmt, "stream management violation: {}", msg)
            }
            ProtocolError::MissingFeature(feature) => {
                write!(fmt, "peer does not offer required feature: {}", feature)
            }
        }
    }
}

impl StdError for ProtocolError {}

impl From<strix_schema::Error> for ProtocolError {
    fn from(e: strix_schema::Error) -> Self {
        ProtocolError::Schema(e)
    }
}

impl From<StreamError> for ProtocolError {
    fn from(e: StreamError) -> Self {
        ProtocolError::StreamError(e)
    }
}

/// Authentication error.
#[derive(Debug)]
pub enum AuthError {
    /// No matching SASL mechanism available.
    NoMechanism,
    /// Local SASL implementation error.
    Sasl(MechanismError),
    /// Failure from server.
    Fail(SaslDefinedCondition),
    /// The password provider declined to supply further credentials.
    Aborted,
}

impl StdError for AuthError {}

impl fmt::Display for AuthError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            AuthError::NoMechanism => write!(fmt, "no matching SASL mechanism available"),
            AuthError::Sasl(s) => write!(fmt, "local SASL implementation error: {}", s),
            AuthError::Fail(c) => write!(fmt, "failure from the server: {:?}", c),
            AuthError::Aborted => write!(fmt, "credentials provider aborted authentication"),
        }
    }
}

impl From<MechanismError> for AuthError {
    fn from(e: MechanismError) -> Self {
        AuthError::Sasl(e)
    }
}

/// TLS-layer error.
#[derive(Debug)]
pub enum TlsError {
    /// Error reported by the TLS implementation.
    Tls(tokio_rustls::rustls::Error),
    /// The server name was not usable for SNI.
    DnsName(tokio_rustls::rustls::pki_types::InvalidDnsNameError),
    /// The pin store could not be loaded.
    PinStore(IoError),
}

impl fmt::Display for TlsError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TlsError::Tls(e) => write!(fmt, "TLS error: {}", e),
            TlsError::DnsName(e) => write!(fmt, "DNS name error: {}", e),
            TlsError::PinStore(e) => write!(fmt, "pin store error: {}", e),
        }
    }
}

impl StdError for TlsError {}

impl From<tokio_rustls::rustls::Error> for TlsError {
    fn from(e: tokio_rustls::rustls::Error) -> Self {
        TlsError::Tls(e)
    }
}
