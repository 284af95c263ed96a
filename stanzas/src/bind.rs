// Copyright (c) 2024 strix contributors.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Resource binding, RFC 6120 § 7.

use strix_schema::error::{Error, FromElementError};
use strix_schema::{Element, Node};

use crate::jid::{FullJid, Jid};
use crate::ns;

/// The bind request sent inside an IQ `set` to ask the server for a
/// resource.
#[derive(Debug, Clone, PartialEq)]
pub struct BindQuery {
    /// The resource requested by the client; `None` lets the server pick.
    pub resource: Option<String>,
}

impl BindQuery {
    /// Create a new bind request.
    pub fn new(resource: Option<String>) -> BindQuery {
        BindQuery { resource }
    }
}

impl TryFrom<Element> for BindQuery {
    type Error = FromElementError;

    fn try_from(elem: Element) -> Result<BindQuery, FromElementError> {
        strix_schema::check_self!(elem, "bind", ns::BIND);
        let resource = elem
            .get_child("resource", ns::BIND)
            .map(|child| child.text());
        Ok(BindQuery { resource })
    }
}

impl From<BindQuery> for Element {
    fn from(query: BindQuery) -> Element {
        let mut elem = Element::bare("bind", ns::BIND);
        if let Some(resource) = query.resource {
            let mut child = Element::bare("resource", ns::BIND);
            child.append_text_node(resource);
            elem.append_node(Node::Element(child));
        }
        elem
    }
}

/// The bind result carried in the reply IQ, containing the jid the stream
/// is now bound to.
#[derive(Debug, Clone, PartialEq)]
pub struct BindResponse {
    /// The full JID assigned by the server.
    pub jid: FullJid,
}

impl TryFrom<Element> for BindResponse {
    type Error = FromElementError;

    fn try_from(elem: Element) -> Result<BindResponse, FromElementError> {
        strix_schema::check_self!(elem, "bind", ns::BIND);
        let jid_elem = elem
            .get_child("jid", ns::BIND)
            .ok_or(Error::Other("Bind response has no jid."))?;
        let jid: Jid = jid_elem.text().parse().map_err(Error::text_parse_error)?;
        let jid = FullJid::try_from(jid).map_err(Error::text_parse_error)?;
        Ok(BindResponse { jid })
    }
}

impl From<BindResponse> for Element {
    fn from(response: BindResponse) -> Element {
        let mut elem = Element::bare("bind", ns::BIND);
        let mut jid = Element::bare("jid", ns::BIND);
        jid.append_text_node(response.jid.to_string());
        elem.append_node(Node::Element(jid));
        elem
    }
}

impl From<BindResponse> for FullJid {
    fn from(response: BindResponse) -> FullJid {
        response.jid
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_with_and_without_resource() {
        let query = BindQuery::new(None);
        let elem: Element = query.into();
        assert!(elem.get_child("resource", ns::BIND).is_none());

        let query = BindQuery::new(Some("orchard".to_owned()));
        let elem: Element = query.into();
        assert_eq!(
            elem.get_child("resource", ns::BIND).unwrap().text(),
            "orchard"
        );
    }

    #[test]
    fn response_parses_full_jid() {
        let elem: Element = "<bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'><jid>alice@example.net/orchard</jid></bind>"
            .parse()
            .unwrap();
        let response = BindResponse::try_from(elem).unwrap();
        assert_eq!(response.jid.to_string(), "alice@example.net/orchard");
    }

    #[test]
    fn response_requires_resource() {
        let elem: Element = "<bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'><jid>alice@example.net</jid></bind>"
            .parse()
            .unwrap();
        assert!(BindResponse::try_from(elem).is_err());
    }
}
