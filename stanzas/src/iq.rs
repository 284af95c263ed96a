// Copyright (c) 2024 strix contributors.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! IQ stanzas, RFC 6120 § 8.2.3.
//!
//! An IQ is the request/response primitive of XMPP: every `get`/`set`
//! carries exactly one payload and demands exactly one `result`/`error`
//! with the same `id` in return.

use strix_schema::error::{Error, FromElementError};
use strix_schema::{Element, Node};

use crate::jid::Jid;
use crate::ns;
use crate::stanza_error::{DefinedCondition, ErrorType, StanzaError};

/// The payload of an IQ, determined by its `type` attribute.
#[derive(Debug, Clone, PartialEq)]
pub enum IqType {
    /// Request for information.
    Get(Element),

    /// Request changing some state.
    Set(Element),

    /// Successful reply, with an optional result payload.
    Result(Option<Element>),

    /// Error reply.
    Error(StanzaError),
}

impl IqType {
    /// The value of the `type` attribute for this payload.
    pub fn as_str(&self) -> &'static str {
        match self {
            IqType::Get(_) => "get",
            IqType::Set(_) => "set",
            IqType::Result(_) => "result",
            IqType::Error(_) => "error",
        }
    }

    /// Whether this is a request (`get` or `set`).
    pub fn is_request(&self) -> bool {
        matches!(self, IqType::Get(_) | IqType::Set(_))
    }
}

/// The `<iq/>` stanza.
#[derive(Debug, Clone, PartialEq)]
pub struct Iq {
    /// The sender of this IQ.
    pub from: Option<Jid>,

    /// The recipient of this IQ.
    pub to: Option<Jid>,

    /// The identifier pairing this IQ with its reply. Mandatory on the
    /// wire; an empty string here means "not assigned yet".
    pub id: String,

    /// The payload of this IQ.
    pub payload: IqType,
}

impl Iq {
    /// Create a `get` request.
    pub fn from_get<S: Into<String>, P: Into<Element>>(id: S, payload: P) -> Iq {
        Iq {
            from: None,
            to: None,
            id: id.into(),
            payload: IqType::Get(payload.into()),
        }
    }

    /// Create a `set` request.
    pub fn from_set<S: Into<String>, P: Into<Element>>(id: S, payload: P) -> Iq {
        Iq {
            from: None,
            to: None,
            id: id.into(),
            payload: IqType::Set(payload.into()),
        }
    }

    /// Create a `result` reply to the given request.
    ///
    /// Addressing is mirrored: the reply goes back to where the request
    /// came from.
    pub fn result_of(request: &Iq, payload: Option<Element>) -> Iq {
        Iq {
            from: request.to.clone(),
            to: request.from.clone(),
            id: request.id.clone(),
            payload: IqType::Result(payload),
        }
    }

    /// Create an `error` reply to the given request.
    pub fn error_of(request: &Iq, error: StanzaError) -> Iq {
        Iq {
            from: request.to.clone(),
            to: request.from.clone(),
            id: request.id.clone(),
            payload: IqType::Error(error),
        }
    }

    /// The canonical reply for a request nobody handles, RFC 6120 § 8.4.
    pub fn service_unavailable_reply(request: &Iq) -> Iq {
        Iq::error_of(
            request,
            StanzaError::new(
                ErrorType::Cancel,
                DefinedCondition::ServiceUnavailable,
                "en",
                "No handler registered for this request.",
            ),
        )
    }

    /// The request payload, if this is a `get` or `set`.
    pub fn request_payload(&self) -> Option<&Element> {
        match self.payload {
            IqType::Get(ref payload) | IqType::Set(ref payload) => Some(payload),
            _ => None,
        }
    }
}

impl TryFrom<Element> for Iq {
    type Error = FromElementError;

    fn try_from(elem: Element) -> Result<Iq, FromElementError> {
        strix_schema::check_self!(elem, "iq", ns::JABBER_CLIENT);

        let from = strix_schema::get_attr!(elem, "from", Option);
        let to = strix_schema::get_attr!(elem, "to", Option);
        let id: String = strix_schema::get_attr!(elem, "id", Required);
        let type_: String = strix_schema::get_attr!(elem, "type", Required);

        let mut payload = None;
        let mut error = None;
        for child in elem.children() {
            if child.is("error", ns::JABBER_CLIENT) {
                if error.is_some() {
                    return Err(Error::Other("More than one error in iq element.").into());
                }
                error = Some(StanzaError::try_from(child.clone()).map_err(Error::from)?);
            } else {
                if payload.is_some() {
                    return Err(Error::Other("More than one payload in iq element.").into());
                }
                payload = Some(child.clone());
            }
        }

        let payload = match type_.as_str() {
            "get" => IqType::Get(payload.ok_or(Error::Other("Iq get missing payload."))?),
            "set" => IqType::Set(payload.ok_or(Error::Other("Iq set missing payload."))?),
            "result" => IqType::Result(payload),
            "error" => IqType::Error(error.ok_or(Error::Other("Iq error missing error element."))?),
            _ => return Err(Error::Other("Unknown iq type.").into()),
        };

        Ok(Iq {
            from,
            to,
            id,
            payload,
        })
    }
}

impl From<Iq> for Element {
    fn from(iq: Iq) -> Element {
        let type_ = iq.payload.as_str();
        let mut elem = Element::builder("iq", ns::JABBER_CLIENT)
            .attr("from", iq.from)
            .attr("to", iq.to)
            .attr("id", iq.id)
            .attr("type", type_)
            .build();
        match iq.payload {
            IqType::Get(payload) | IqType::Set(payload) => {
                elem.append_node(Node::Element(payload));
            }
            IqType::Result(Some(payload)) => {
                elem.append_node(Node::Element(payload));
            }
            IqType::Result(None) => (),
            IqType::Error(error) => {
                elem.append_node(Node::Element(error.into()));
            }
        }
        elem
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_get() {
        let elem: Element =
            "<iq xmlns='jabber:client' id='p1' type='get'><ping xmlns='urn:xmpp:ping'/></iq>"
                .parse()
                .unwrap();
        let iq = Iq::try_from(elem).unwrap();
        assert_eq!(iq.id, "p1");
        assert!(iq.payload.is_request());
        assert!(iq.request_payload().unwrap().is("ping", ns::PING));
    }

    #[test]
    fn missing_id_rejected() {
        let elem: Element =
            "<iq xmlns='jabber:client' type='get'><ping xmlns='urn:xmpp:ping'/></iq>"
                .parse()
                .unwrap();
        assert!(Iq::try_from(elem).is_err());
    }

    #[test]
    fn get_without_payload_rejected() {
        let elem: Element = "<iq xmlns='jabber:client' id='x' type='get'/>".parse().unwrap();
        assert!(Iq::try_from(elem).is_err());
    }

    #[test]
    fn result_without_payload_allowed() {
        let elem: Element = "<iq xmlns='jabber:client' id='x' type='result'/>"
            .parse()
            .unwrap();
        let iq = Iq::try_from(elem).unwrap();
        assert_eq!(iq.payload, IqType::Result(None));
    }

    #[test]
    fn unhandled_reply_is_service_unavailable() {
        let request = Iq {
            from: Some("alice@example.net/orchard".parse().unwrap()),
            to: None,
            id: "42".to_owned(),
            payload: IqType::Get(Element::bare("x", "urn:example:unknown")),
        };
        let reply = Iq::service_unavailable_reply(&request);
        assert_eq!(reply.id, "42");
        assert_eq!(reply.to, request.from);
        match reply.payload {
            IqType::Error(ref error) => {
                assert_eq!(
                    error.defined_condition,
                    DefinedCondition::ServiceUnavailable
                );
            }
            ref other => panic!("unexpected payload: {:?}", other),
        }
    }

    #[test]
    fn round_trip_error_reply() {
        let elem: Element = "<iq xmlns='jabber:client' id='e1' type='error'><error xmlns='jabber:client' type='cancel'><item-not-found xmlns='urn:ietf:params:xml:ns:xmpp-stanzas'/></error></iq>"
            .parse()
            .unwrap();
        let iq = Iq::try_from(elem.clone()).unwrap();
        let back: Element = iq.clone().into();
        assert_eq!(Iq::try_from(back).unwrap(), iq);
    }
}
