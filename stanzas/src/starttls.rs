// Copyright (c) 2024 strix contributors.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! STARTTLS negotiation, RFC 6120 § 5.

use strix_schema::error::FromElementError;
use strix_schema::Element;

use crate::ns;

/// The `<starttls/>` stream feature offered by the server.
#[derive(Debug, Clone, PartialEq)]
pub struct StartTls {
    /// Whether the server requires TLS before anything else.
    pub required: bool,
}

impl TryFrom<Element> for StartTls {
    type Error = FromElementError;

    fn try_from(elem: Element) -> Result<StartTls, FromElementError> {
        strix_schema::check_self!(elem, "starttls", ns::TLS);
        let required = elem.has_child("required", ns::TLS);
        Ok(StartTls { required })
    }
}

impl From<StartTls> for Element {
    fn from(feature: StartTls) -> Element {
        let mut elem = Element::bare("starttls", ns::TLS);
        if feature.required {
            elem.append_child(Element::bare("required", ns::TLS));
        }
        elem
    }
}

strix_schema::generate_element!(
    /// The client's request to begin TLS negotiation.
    Request, "starttls", crate::ns::TLS
);

strix_schema::generate_element!(
    /// The server's go-ahead: the TLS handshake starts right after this
    /// element.
    Proceed, "proceed", crate::ns::TLS
);

strix_schema::generate_element!(
    /// The server's refusal; the stream is closed afterwards.
    Failure, "failure", crate::ns::TLS
);

/// Any STARTTLS nonza the server may send.
#[derive(Debug, Clone, PartialEq)]
pub enum Nonza {
    /// `<proceed/>`
    Proceed(Proceed),

    /// `<failure/>`
    Failure(Failure),
}

impl TryFrom<Element> for Nonza {
    type Error = FromElementError;

    fn try_from(elem: Element) -> Result<Nonza, FromElementError> {
        if !elem.has_ns(ns::TLS) {
            return Err(FromElementError::Mismatch(elem));
        }
        match elem.name() {
            "proceed" => Ok(Nonza::Proceed(Proceed::try_from(elem)?)),
            "failure" => Ok(Nonza::Failure(Failure::try_from(elem)?)),
            _ => Err(FromElementError::Mismatch(elem)),
        }
    }
}

impl From<Nonza> for Element {
    fn from(nonza: Nonza) -> Element {
        match nonza {
            Nonza::Proceed(nonza) => nonza.into(),
            Nonza::Failure(nonza) => nonza.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feature_required_flag() {
        let elem: Element =
            "<starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'><required/></starttls>"
                .parse()
                .unwrap();
        let feature = StartTls::try_from(elem).unwrap();
        assert!(feature.required);
    }

    #[test]
    fn proceed() {
        let elem: Element = "<proceed xmlns='urn:ietf:params:xml:ns:xmpp-tls'/>"
            .parse()
            .unwrap();
        match Nonza::try_from(elem).unwrap() {
            Nonza::Proceed(_) => (),
            other => panic!("unexpected nonza: {:?}", other),
        }
    }
}
