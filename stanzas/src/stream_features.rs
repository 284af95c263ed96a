// Copyright (c) 2024 strix contributors.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Stream features, RFC 6120 § 4.3.2.

use strix_schema::error::{Error, FromElementError};
use strix_schema::Element;

use crate::ns;
use crate::sasl::SaslMechanisms;
use crate::sm::StreamManagement;
use crate::starttls::StartTls;

/// The legacy session feature from RFC 3921.
///
/// Modern servers advertise it with an `<optional/>` child; only when that
/// child is absent does a client have to perform session establishment.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    /// Whether session establishment may be skipped.
    pub optional: bool,
}

impl TryFrom<Element> for Session {
    type Error = FromElementError;

    fn try_from(elem: Element) -> Result<Session, FromElementError> {
        strix_schema::check_self!(elem, "session", ns::SESSION);
        let optional = elem.has_child("optional", ns::SESSION);
        Ok(Session { optional })
    }
}

impl From<Session> for Element {
    fn from(feature: Session) -> Element {
        let mut elem = Element::bare("session", ns::SESSION);
        if feature.optional {
            elem.append_child(Element::bare("optional", ns::SESSION));
        }
        elem
    }
}

/// The `<stream:features/>` element sent by the server after every stream
/// header.
///
/// Features this implementation does not know are preserved in `others`
/// for services to inspect.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StreamFeatures {
    /// STARTTLS advertisement.
    pub starttls: Option<StartTls>,

    /// Resource binding advertisement.
    pub bind: bool,

    /// Legacy session advertisement.
    pub session: Option<Session>,

    /// SASL mechanisms offered.
    pub sasl_mechanisms: SaslMechanisms,

    /// Stream management advertisement.
    pub stream_management: Option<StreamManagement>,

    /// Features not otherwise understood.
    pub others: Vec<Element>,
}

impl StreamFeatures {
    /// Can the stream be secured with STARTTLS?
    pub fn can_starttls(&self) -> bool {
        self.starttls.is_some()
    }

    /// Does the server require STARTTLS before anything else?
    pub fn starttls_required(&self) -> bool {
        self.starttls
            .as_ref()
            .map(|feature| feature.required)
            .unwrap_or(false)
    }

    /// Can the stream be bound to a resource?
    pub fn can_bind(&self) -> bool {
        self.bind
    }

    /// Must the legacy session be negotiated?
    pub fn needs_legacy_session(&self) -> bool {
        self.session
            .as_ref()
            .map(|session| !session.optional)
            .unwrap_or(false)
    }
}

impl TryFrom<Element> for StreamFeatures {
    type Error = FromElementError;

    fn try_from(elem: Element) -> Result<StreamFeatures, FromElementError> {
        strix_schema::check_self!(elem, "features", ns::STREAM);
        let mut features = StreamFeatures::default();
        for child in elem.children() {
            if child.is("starttls", ns::TLS) {
                features.starttls = Some(StartTls::try_from(child.clone()).map_err(Error::from)?);
            } else if child.is("bind", ns::BIND) {
                features.bind = true;
            } else if child.is("session", ns::SESSION) {
                features.session = Some(Session::try_from(child.clone()).map_err(Error::from)?);
            } else if child.is("mechanisms", ns::SASL) {
                features.sasl_mechanisms =
                    SaslMechanisms::try_from(child.clone()).map_err(Error::from)?;
            } else if child.is("sm", ns::SM) {
                features.stream_management =
                    Some(StreamManagement::try_from(child.clone()).map_err(Error::from)?);
            } else {
                features.others.push(child.clone());
            }
        }
        Ok(features)
    }
}

impl From<StreamFeatures> for Element {
    fn from(features: StreamFeatures) -> Element {
        let mut elem = Element::bare("features", ns::STREAM);
        if let Some(starttls) = features.starttls {
            elem.append_child(starttls.into());
        }
        if features.bind {
            elem.append_child(Element::bare("bind", ns::BIND));
        }
        if let Some(session) = features.session {
            elem.append_child(session.into());
        }
        if !features.sasl_mechanisms.mechanisms.is_empty() {
            elem.append_child(features.sasl_mechanisms.into());
        }
        if let Some(sm) = features.stream_management {
            elem.append_child(sm.into());
        }
        for other in features.others {
            elem.append_child(other);
        }
        elem
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_post_auth_features() {
        let elem: Element = "<features xmlns='http://etherx.jabber.org/streams'><bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'/><session xmlns='urn:ietf:params:xml:ns:xmpp-session'><optional/></session><sm xmlns='urn:xmpp:sm:3'/></features>"
            .parse()
            .unwrap();
        let features = StreamFeatures::try_from(elem).unwrap();
        assert!(features.can_bind());
        assert!(!features.needs_legacy_session());
        assert!(features.stream_management.is_some());
        assert!(!features.can_starttls());
    }

    #[test]
    fn mandatory_legacy_session() {
        let elem: Element = "<features xmlns='http://etherx.jabber.org/streams'><session xmlns='urn:ietf:params:xml:ns:xmpp-session'/></features>"
            .parse()
            .unwrap();
        let features = StreamFeatures::try_from(elem).unwrap();
        assert!(features.needs_legacy_session());
    }

    #[test]
    fn unknown_features_preserved() {
        let elem: Element = "<features xmlns='http://etherx.jabber.org/streams'><compression xmlns='http://jabber.org/features/compress'/></features>"
            .parse()
            .unwrap();
        let features = StreamFeatures::try_from(elem).unwrap();
        assert_eq!(features.others.len(), 1);
    }
}
