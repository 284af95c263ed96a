// Copyright (c) 2024 strix contributors.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Stanza-level errors, RFC 6120 § 8.3.

use std::collections::BTreeMap;

use strix_schema::error::{Error, FromElementError};
use strix_schema::{Element, Node};

use crate::jid::Jid;
use crate::ns;

strix_schema::generate_attribute!(
    /// The type of the error.
    ErrorType, "type", {
        /// Retry after providing credentials.
        Auth => "auth",

        /// Do not retry (the error cannot be remedied).
        Cancel => "cancel",

        /// Proceed (the condition was only a warning).
        Continue => "continue",

        /// Retry after changing the data sent.
        Modify => "modify",

        /// Retry after waiting (the error is temporary).
        Wait => "wait",
    }
);

/// List of valid stanza error conditions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DefinedCondition {
    /// The sender has sent a stanza containing XML that does not conform
    /// to the appropriate schema or that cannot be processed.
    BadRequest,

    /// Access cannot be granted because an existing resource exists with
    /// the same name or address.
    Conflict,

    /// The feature represented in the XML stanza is not implemented by the
    /// intended recipient or an intermediate server.
    FeatureNotImplemented,

    /// The requesting entity does not possess the necessary permissions.
    Forbidden,

    /// The recipient or server can no longer be contacted at this address,
    /// typically on a permanent basis. Carries the new address, if any, as
    /// character data.
    Gone {
        /// The new address of the entity for which the error was returned,
        /// if available.
        new_address: Option<String>,
    },

    /// The server has experienced a misconfiguration or other internal
    /// error.
    InternalServerError,

    /// The addressed JID or item requested cannot be found.
    ItemNotFound,

    /// The sending entity has provided an XMPP address that violates the
    /// address format rules.
    JidMalformed,

    /// The request does not meet criteria defined by the recipient or
    /// server.
    NotAcceptable,

    /// The recipient or server does not allow any entity to perform the
    /// action.
    NotAllowed,

    /// The sender needs to provide credentials before being allowed to
    /// perform the action, or has provided improper credentials.
    NotAuthorized,

    /// The entity has violated some local service policy.
    PolicyViolation,

    /// The intended recipient is temporarily unavailable.
    RecipientUnavailable,

    /// The recipient or server is redirecting requests for this
    /// information to another entity, typically in a temporary fashion.
    /// Carries the alternate address as character data.
    Redirect {
        /// The new address of the entity for which the error was returned,
        /// if available.
        new_address: Option<String>,
    },

    /// The requesting entity is not authorized to access the requested
    /// service because prior registration is necessary.
    RegistrationRequired,

    /// A remote server or service specified in the JID of the intended
    /// recipient does not exist or cannot be resolved.
    RemoteServerNotFound,

    /// A remote server was resolved but communications could not be
    /// established within a reasonable amount of time.
    RemoteServerTimeout,

    /// The server or recipient is busy or lacks the system resources
    /// necessary to service the request.
    ResourceConstraint,

    /// The server or recipient does not currently provide the requested
    /// service.
    ///
    /// This is also the mandated reply to an IQ request nobody handles.
    ServiceUnavailable,

    /// The requesting entity is not authorized to access the requested
    /// service because a prior subscription is necessary.
    SubscriptionRequired,

    /// The error condition is not one of those defined by the other
    /// conditions in this list.
    UndefinedCondition,

    /// The recipient or server understood the request but was not
    /// expecting it at this time.
    UnexpectedRequest,
}

impl DefinedCondition {
    /// The element name of this condition.
    pub fn element_name(&self) -> &'static str {
        match self {
            Self::BadRequest => "bad-request",
            Self::Conflict => "conflict",
            Self::FeatureNotImplemented => "feature-not-implemented",
            Self::Forbidden => "forbidden",
            Self::Gone { .. } => "gone",
            Self::InternalServerError => "internal-server-error",
            Self::ItemNotFound => "item-not-found",
            Self::JidMalformed => "jid-malformed",
            Self::NotAcceptable => "not-acceptable",
            Self::NotAllowed => "not-allowed",
            Self::NotAuthorized => "not-authorized",
            Self::PolicyViolation => "policy-violation",
            Self::RecipientUnavailable => "recipient-unavailable",
            Self::Redirect { .. } => "redirect",
            Self::RegistrationRequired => "registration-required",
            Self::RemoteServerNotFound => "remote-server-not-found",
            Self::RemoteServerTimeout => "remote-server-timeout",
            Self::ResourceConstraint => "resource-constraint",
            Self::ServiceUnavailable => "service-unavailable",
            Self::SubscriptionRequired => "subscription-required",
            Self::UndefinedCondition => "undefined-condition",
            Self::UnexpectedRequest => "unexpected-request",
        }
    }
}

impl TryFrom<Element> for DefinedCondition {
    type Error = FromElementError;

    fn try_from(elem: Element) -> Result<DefinedCondition, FromElementError> {
        if !elem.has_ns(ns::XMPP_STANZAS) {
            return Err(FromElementError::Mismatch(elem));
        }
        let text = elem.text();
        let address = if text.is_empty() { None } else { Some(text) };
        Ok(match elem.name() {
            "bad-request" => Self::BadRequest,
            "conflict" => Self::Conflict,
            "feature-not-implemented" => Self::FeatureNotImplemented,
            "forbidden" => Self::Forbidden,
            "gone" => Self::Gone {
                new_address: address,
            },
            "internal-server-error" => Self::InternalServerError,
            "item-not-found" => Self::ItemNotFound,
            "jid-malformed" => Self::JidMalformed,
            "not-acceptable" => Self::NotAcceptable,
            "not-allowed" => Self::NotAllowed,
            "not-authorized" => Self::NotAuthorized,
            "policy-violation" => Self::PolicyViolation,
            "recipient-unavailable" => Self::RecipientUnavailable,
            "redirect" => Self::Redirect {
                new_address: address,
            },
            "registration-required" => Self::RegistrationRequired,
            "remote-server-not-found" => Self::RemoteServerNotFound,
            "remote-server-timeout" => Self::RemoteServerTimeout,
            "resource-constraint" => Self::ResourceConstraint,
            "service-unavailable" => Self::ServiceUnavailable,
            "subscription-required" => Self::SubscriptionRequired,
            "undefined-condition" => Self::UndefinedCondition,
            "unexpected-request" => Self::UnexpectedRequest,
            _ => return Err(FromElementError::Mismatch(elem)),
        })
    }
}

impl From<DefinedCondition> for Element {
    fn from(condition: DefinedCondition) -> Element {
        let name = condition.element_name();
        let mut elem = Element::bare(name, ns::XMPP_STANZAS);
        match condition {
            DefinedCondition::Gone { new_address } | DefinedCondition::Redirect { new_address } => {
                if let Some(address) = new_address {
                    elem.append_text_node(address);
                }
            }
            _ => (),
        }
        elem
    }
}

type Lang = String;

/// The representation of a stanza error.
#[derive(Debug, Clone, PartialEq)]
pub struct StanzaError {
    /// The type of this error.
    pub type_: ErrorType,

    /// The JID of the entity who set this error.
    pub by: Option<Jid>,

    /// One of the defined conditions for this error to happen.
    pub defined_condition: DefinedCondition,

    /// Human-readable description of this error.
    pub texts: BTreeMap<Lang, String>,

    /// A protocol-specific extension for this error.
    pub other: Option<Element>,
}

impl StanzaError {
    /// Create a new `<error/>` with the according content.
    pub fn new<L, T>(
        type_: ErrorType,
        defined_condition: DefinedCondition,
        lang: L,
        text: T,
    ) -> StanzaError
    where
        L: Into<Lang>,
        T: Into<String>,
    {
        StanzaError {
            type_,
            by: None,
            defined_condition,
            texts: {
                let mut texts = BTreeMap::new();
                texts.insert(lang.into(), text.into());
                texts
            },
            other: None,
        }
    }
}

impl TryFrom<Element> for StanzaError {
    type Error = FromElementError;

    fn try_from(elem: Element) -> Result<StanzaError, FromElementError> {
        strix_schema::check_self!(elem, "error", ns::JABBER_CLIENT);

        let type_ = strix_schema::get_attr!(elem, "type", Required);
        let by = strix_schema::get_attr!(elem, "by", Option);
        let mut defined_condition = None;
        let mut texts = BTreeMap::new();
        let mut other = None;

        for child in elem.children() {
            if child.is("text", ns::XMPP_STANZAS) {
                let lang = child.attr("xml:lang").unwrap_or("").to_owned();
                if texts.insert(lang, child.text()).is_some() {
                    return Err(Error::Other("Text element present twice for the same xml:lang.").into());
                }
            } else if child.has_ns(ns::XMPP_STANZAS) {
                if defined_condition.is_some() {
                    return Err(Error::Other("Error must not have more than one defined-condition.").into());
                }
                defined_condition = Some(DefinedCondition::try_from(child.clone()).map_err(Error::from)?);
            } else {
                // at most one application-specific extension is kept
                if other.is_none() {
                    other = Some(child.clone());
                }
            }
        }

        let defined_condition = defined_condition
            .ok_or(Error::Other("Error must have a defined-condition."))?;

        Ok(StanzaError {
            type_,
            by,
            defined_condition,
            texts,
            other,
        })
    }
}

impl From<StanzaError> for Element {
    fn from(err: StanzaError) -> Element {
        let mut elem = Element::builder("error", ns::JABBER_CLIENT)
            .attr("type", err.type_)
            .attr("by", err.by)
            .append(Element::from(err.defined_condition))
            .build();
        for (lang, text) in err.texts {
            let mut text_elem = Element::bare("text", ns::XMPP_STANZAS);
            if !lang.is_empty() {
                text_elem.set_attr("xml:lang", lang.as_str());
            }
            text_elem.append_text_node(text);
            elem.append_node(Node::Element(text_elem));
        }
        if let Some(other) = err.other {
            elem.append_node(Node::Element(other));
        }
        elem
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_simple_error() {
        let elem: Element = "<error xmlns='jabber:client' type='cancel'><service-unavailable xmlns='urn:ietf:params:xml:ns:xmpp-stanzas'/></error>"
            .parse()
            .unwrap();
        let error = StanzaError::try_from(elem).unwrap();
        assert_eq!(error.type_, ErrorType::Cancel);
        assert_eq!(error.defined_condition, DefinedCondition::ServiceUnavailable);
    }

    #[test]
    fn parse_gone_with_address() {
        let elem: Element = "<error xmlns='jabber:client' type='cancel'><gone xmlns='urn:ietf:params:xml:ns:xmpp-stanzas'>xmpp:rab@example.org</gone></error>"
            .parse()
            .unwrap();
        let error = StanzaError::try_from(elem).unwrap();
        assert_eq!(
            error.defined_condition,
            DefinedCondition::Gone {
                new_address: Some("xmpp:rab@example.org".to_owned()),
            }
        );
    }

    #[test]
    fn missing_condition_rejected() {
        let elem: Element = "<error xmlns='jabber:client' type='cancel'/>".parse().unwrap();
        assert!(StanzaError::try_from(elem).is_err());
    }

    #[test]
    fn texts_round_trip() {
        let error = StanzaError::new(
            ErrorType::Wait,
            DefinedCondition::ResourceConstraint,
            "en",
            "too busy",
        );
        let elem: Element = error.clone().into();
        let reparsed = StanzaError::try_from(elem).unwrap();
        assert_eq!(reparsed, error);
    }
}
