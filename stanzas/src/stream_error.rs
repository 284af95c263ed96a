// Copyright (c) 2024 strix contributors.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Stream-level errors, RFC 6120 § 4.9.
//!
//! A `<stream:error/>` is always fatal to the stream which carries it.

use core::fmt;

use strix_schema::error::{Error, FromElementError};
use strix_schema::{Element, Node};

use crate::ns;

/// Defined stream error conditions from RFC 6120 § 4.9.3.
///
/// Conditions which this implementation never generates are still needed
/// to classify errors received from the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DefinedCondition {
    /// The entity has sent XML that cannot be processed.
    BadFormat,
    /// The entity has sent a namespace prefix that is unsupported.
    BadNamespacePrefix,
    /// The server is closing the active stream because a new stream has
    /// been initiated that conflicts with the existing stream.
    Conflict,
    /// One party is closing the stream because it has reason to believe
    /// the other party has permanently lost the ability to communicate.
    ConnectionTimeout,
    /// The value of the `to` attribute refers to an FQDN that is no longer
    /// serviced by the receiving entity.
    HostGone,
    /// The value of the `to` attribute does not correspond to an FQDN that
    /// is serviced by the receiving entity.
    HostUnknown,
    /// A stanza sent between two servers lacks a `to` or `from` attribute.
    ImproperAddressing,
    /// The server has experienced a misconfiguration or other internal
    /// error that prevents it from servicing the stream.
    InternalServerError,
    /// The data provided in a `from` attribute does not match an
    /// authorized JID.
    InvalidFrom,
    /// The stream namespace is invalid.
    InvalidNamespace,
    /// The entity has sent invalid XML over the stream.
    InvalidXml,
    /// The entity has attempted to send XML stanzas or other outbound data
    /// before the stream has been authenticated.
    NotAuthorized,
    /// The initiating entity has sent XML that violates the
    /// well-formedness rules.
    NotWellFormed,
    /// The entity has violated some local service policy.
    PolicyViolation,
    /// The server is unable to properly connect to a remote entity needed
    /// for authentication or authorization.
    RemoteConnectionFailed,
    /// The server is closing the stream because it has new (typically
    /// security-critical) features to offer.
    Reset,
    /// The server lacks the system resources necessary to service the
    /// stream.
    ResourceConstraint,
    /// The entity has attempted to send restricted XML features.
    RestrictedXml,
    /// The server will not provide service to the initiating entity but is
    /// redirecting traffic to another host under the administrative control
    /// of the same service provider.
    SeeOtherHost(String),
    /// The server is being shut down and all active streams are being
    /// closed.
    SystemShutdown,
    /// The error condition is not one of those defined by the other
    /// conditions.
    UndefinedCondition,
    /// The initiating entity has encoded the stream in an encoding that is
    /// not supported by the server.
    UnsupportedEncoding,
    /// The receiving entity has advertised a mandatory-to-negotiate stream
    /// feature that the initiating entity does not support.
    UnsupportedFeature,
    /// The initiating entity has sent a first-level child of the stream
    /// that is not supported by the server.
    UnsupportedStanzaType,
    /// The `version` attribute's value specifies a version of XMPP that is
    /// not supported.
    UnsupportedVersion,
}

impl DefinedCondition {
    /// The element name of this condition.
    pub fn element_name(&self) -> &'static str {
        match self {
            Self::BadFormat => "bad-format",
            Self::BadNamespacePrefix => "bad-namespace-prefix",
            Self::Conflict => "conflict",
            Self::ConnectionTimeout => "connection-timeout",
            Self::HostGone => "host-gone",
            Self::HostUnknown => "host-unknown",
            Self::ImproperAddressing => "improper-addressing",
            Self::InternalServerError => "internal-server-error",
            Self::InvalidFrom => "invalid-from",
            Self::InvalidNamespace => "invalid-namespace",
            Self::InvalidXml => "invalid-xml",
            Self::NotAuthorized => "not-authorized",
            Self::NotWellFormed => "not-well-formed",
            Self::PolicyViolation => "policy-violation",
            Self::RemoteConnectionFailed => "remote-connection-failed",
            Self::Reset => "reset",
            Self::ResourceConstraint => "resource-constraint",
            Self::RestrictedXml => "restricted-xml",
            Self::SeeOtherHost(_) => "see-other-host",
            Self::SystemShutdown => "system-shutdown",
            Self::UndefinedCondition => "undefined-condition",
            Self::UnsupportedEncoding => "unsupported-encoding",
            Self::UnsupportedFeature => "unsupported-feature",
            Self::UnsupportedStanzaType => "unsupported-stanza-type",
            Self::UnsupportedVersion => "unsupported-version",
        }
    }

    fn parse(name: &str, text: String) -> Option<DefinedCondition> {
        Some(match name {
            "bad-format" => Self::BadFormat,
            "bad-namespace-prefix" => Self::BadNamespacePrefix,
            "conflict" => Self::Conflict,
            "connection-timeout" => Self::ConnectionTimeout,
            "host-gone" => Self::HostGone,
            "host-unknown" => Self::HostUnknown,
            "improper-addressing" => Self::ImproperAddressing,
            "internal-server-error" => Self::InternalServerError,
            "invalid-from" => Self::InvalidFrom,
            "invalid-namespace" => Self::InvalidNamespace,
            "invalid-xml" => Self::InvalidXml,
            "not-authorized" => Self::NotAuthorized,
            "not-well-formed" => Self::NotWellFormed,
            "policy-violation" => Self::PolicyViolation,
            "remote-connection-failed" => Self::RemoteConnectionFailed,
            "reset" => Self::Reset,
            "resource-constraint" => Self::ResourceConstraint,
            "restricted-xml" => Self::RestrictedXml,
            "see-other-host" => Self::SeeOtherHost(text),
            "system-shutdown" => Self::SystemShutdown,
            "undefined-condition" => Self::UndefinedCondition,
            "unsupported-encoding" => Self::UnsupportedEncoding,
            "unsupported-feature" => Self::UnsupportedFeature,
            "unsupported-stanza-type" => Self::UnsupportedStanzaType,
            "unsupported-version" => Self::UnsupportedVersion,
            _ => return None,
        })
    }
}

/// A stream error, together with the optional descriptive text and any
/// application-specific conditions.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamError {
    /// The defined condition.
    pub condition: DefinedCondition,

    /// Optional descriptive text with its language tag.
    pub text: Option<(Option<String>, String)>,

    /// Application-specific conditions carried next to the defined one.
    pub application_specific: Vec<Element>,
}

impl StreamError {
    /// Construct a plain error from a condition, without text.
    pub fn new(condition: DefinedCondition) -> StreamError {
        StreamError {
            condition,
            text: None,
            application_specific: vec![],
        }
    }
}

impl fmt::Display for StreamError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.condition.element_name())?;
        if let Some((_, ref text)) = self.text {
            write!(f, " ({:?})", text)?;
        }
        Ok(())
    }
}

impl std::error::Error for StreamError {}

impl TryFrom<Element> for StreamError {
    type Error = FromElementError;

    fn try_from(elem: Element) -> Result<StreamError, FromElementError> {
        strix_schema::check_self!(elem, "error", ns::STREAM);

        let mut condition = None;
        let mut text = None;
        let mut application_specific = Vec::new();
        for child in elem.children() {
            if child.is("text", ns::XMPP_STREAMS) {
                let lang = child.attr("xml:lang").map(str::to_owned);
                text = Some((lang, child.text()));
            } else if child.has_ns(ns::XMPP_STREAMS) {
                match DefinedCondition::parse(child.name(), child.text()) {
                    Some(parsed) => condition = Some(parsed),
                    None => {
                        return Err(Error::Other("Unknown defined stream error condition.").into())
                    }
                }
            } else {
                application_specific.push(child.clone());
            }
        }
        let condition = condition.ok_or(Error::Other("Stream error has no defined condition."))?;
        Ok(StreamError {
            condition,
            text,
            application_specific,
        })
    }
}

impl From<StreamError> for Element {
    fn from(err: StreamError) -> Element {
        let mut elem = Element::bare("error", ns::STREAM);
        let condition_name = err.condition.element_name();
        let mut condition = Element::bare(condition_name, ns::XMPP_STREAMS);
        if let DefinedCondition::SeeOtherHost(host) = err.condition {
            condition.append_text_node(host);
        }
        elem.append_node(Node::Element(condition));
        if let Some((lang, text)) = err.text {
            let mut text_elem = Element::bare("text", ns::XMPP_STREAMS);
            if let Some(lang) = lang {
                text_elem.set_attr("xml:lang", lang.as_str());
            }
            text_elem.append_text_node(text);
            elem.append_node(Node::Element(text_elem));
        }
        for extra in err.application_specific {
            elem.append_node(Node::Element(extra));
        }
        elem
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_with_text() {
        let elem: Element = "<error xmlns='http://etherx.jabber.org/streams'><system-shutdown xmlns='urn:ietf:params:xml:ns:xmpp-streams'/><text xmlns='urn:ietf:params:xml:ns:xmpp-streams' xml:lang='en'>going down</text></error>"
            .parse()
            .unwrap();
        let error = StreamError::try_from(elem).unwrap();
        assert_eq!(error.condition, DefinedCondition::SystemShutdown);
        assert_eq!(
            error.text,
            Some((Some("en".to_owned()), "going down".to_owned()))
        );
    }

    #[test]
    fn see_other_host_keeps_target() {
        let elem: Element = "<error xmlns='http://etherx.jabber.org/streams'><see-other-host xmlns='urn:ietf:params:xml:ns:xmpp-streams'>alt.example:5222</see-other-host></error>"
            .parse()
            .unwrap();
        let error = StreamError::try_from(elem).unwrap();
        assert_eq!(
            error.condition,
            DefinedCondition::SeeOtherHost("alt.example:5222".to_owned())
        );
        let back: Element = error.into();
        assert!(back
            .get_child("see-other-host", ns::XMPP_STREAMS)
            .is_some());
    }

    #[test]
    fn round_trip_not_well_formed() {
        let error = StreamError::new(DefinedCondition::NotWellFormed);
        let elem: Element = error.clone().into();
        assert_eq!(StreamError::try_from(elem).unwrap(), error);
    }
}
