// Copyright (c) 2024 strix contributors.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Service Discovery, XEP-0030.

use strix_schema::error::{Error, FromElementError};
use strix_schema::Element;

use crate::jid::Jid;
use crate::ns;

/// Query for the identities and features of an entity.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoInfoQuery {
    /// The node to query, if any.
    pub node: Option<String>,
}

impl TryFrom<Element> for DiscoInfoQuery {
    type Error = FromElementError;

    fn try_from(elem: Element) -> Result<DiscoInfoQuery, FromElementError> {
        strix_schema::check_self!(elem, "query", ns::DISCO_INFO);
        Ok(DiscoInfoQuery {
            node: strix_schema::get_attr!(elem, "node", Option),
        })
    }
}

impl From<DiscoInfoQuery> for Element {
    fn from(query: DiscoInfoQuery) -> Element {
        Element::builder("query", ns::DISCO_INFO)
            .attr("node", query.node)
            .build()
    }
}

/// One identity of an entity: a category/type pair with an optional
/// human-readable name.
#[derive(Debug, Clone, PartialEq)]
pub struct Identity {
    /// The category of the entity, e.g. `client`.
    pub category: String,

    /// The type within the category, e.g. `bot`.
    pub type_: String,

    /// Human-readable name.
    pub name: Option<String>,
}

impl TryFrom<Element> for Identity {
    type Error = FromElementError;

    fn try_from(elem: Element) -> Result<Identity, FromElementError> {
        strix_schema::check_self!(elem, "identity", ns::DISCO_INFO);
        let category: String = strix_schema::get_attr!(elem, "category", Required);
        if category.is_empty() {
            return Err(Error::Other("Identity category must not be empty.").into());
        }
        let type_: String = strix_schema::get_attr!(elem, "type", Required);
        if type_.is_empty() {
            return Err(Error::Other("Identity type must not be empty.").into());
        }
        Ok(Identity {
            category,
            type_,
            name: strix_schema::get_attr!(elem, "name", Option),
        })
    }
}

impl From<Identity> for Element {
    fn from(identity: Identity) -> Element {
        Element::builder("identity", ns::DISCO_INFO)
            .attr("category", identity.category)
            .attr("type", identity.type_)
            .attr("name", identity.name)
            .build()
    }
}

/// The result of a disco#info query.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoInfoResult {
    /// The node this result describes, if any.
    pub node: Option<String>,

    /// The identities of the entity.
    pub identities: Vec<Identity>,

    /// The namespaces of the features the entity supports.
    pub features: Vec<String>,

    /// Extension payloads (e.g. XEP-0128 data forms).
    pub extensions: Vec<Element>,
}

impl TryFrom<Element> for DiscoInfoResult {
    type Error = FromElementError;

    fn try_from(elem: Element) -> Result<DiscoInfoResult, FromElementError> {
        strix_schema::check_self!(elem, "query", ns::DISCO_INFO);
        let node = strix_schema::get_attr!(elem, "node", Option);
        let mut identities = Vec::new();
        let mut features = Vec::new();
        let mut extensions = Vec::new();
        for child in elem.children() {
            if child.is("identity", ns::DISCO_INFO) {
                identities.push(Identity::try_from(child.clone()).map_err(Error::from)?);
            } else if child.is("feature", ns::DISCO_INFO) {
                let var: String = strix_schema::get_attr!(child, "var", Required);
                features.push(var);
            } else {
                extensions.push(child.clone());
            }
        }
        Ok(DiscoInfoResult {
            node,
            identities,
            features,
            extensions,
        })
    }
}

impl From<DiscoInfoResult> for Element {
    fn from(result: DiscoInfoResult) -> Element {
        let mut elem = Element::builder("query", ns::DISCO_INFO)
            .attr("node", result.node)
            .build();
        for identity in result.identities {
            elem.append_child(identity.into());
        }
        for feature in result.features {
            elem.append_child(
                Element::builder("feature", ns::DISCO_INFO)
                    .attr("var", feature)
                    .build(),
            );
        }
        for extension in result.extensions {
            elem.append_child(extension);
        }
        elem
    }
}

strix_schema::generate_element!(
    /// Query for the items an entity offers below an optional node.
    DiscoItemsQuery, "query", crate::ns::DISCO_ITEMS,
    attributes: [
        /// The node to query, if any.
        node: Option<String> = "node",
    ]
);

/// One item below a disco node.
#[derive(Debug, Clone, PartialEq)]
pub struct Item {
    /// The JID of the item.
    pub jid: Jid,

    /// The node of the item, if any.
    pub node: Option<String>,

    /// Human-readable name.
    pub name: Option<String>,
}

impl TryFrom<Element> for Item {
    type Error = FromElementError;

    fn try_from(elem: Element) -> Result<Item, FromElementError> {
        strix_schema::check_self!(elem, "item", ns::DISCO_ITEMS);
        Ok(Item {
            jid: strix_schema::get_attr!(elem, "jid", Required),
            node: strix_schema::get_attr!(elem, "node", Option),
            name: strix_schema::get_attr!(elem, "name", Option),
        })
    }
}

impl From<Item> for Element {
    fn from(item: Item) -> Element {
        Element::builder("item", ns::DISCO_ITEMS)
            .attr("jid", item.jid)
            .attr("node", item.node)
            .attr("name", item.name)
            .build()
    }
}

strix_schema::generate_element!(
    /// The result of a disco#items query.
    DiscoItemsResult, "query", crate::ns::DISCO_ITEMS,
    attributes: [
        /// The node this result describes, if any.
        node: Option<String> = "node",
    ],
    children: [
        /// The items below this node.
        items: Vec<Item> = ("item", crate::ns::DISCO_ITEMS)
    ]
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn info_result_round_trip() {
        let elem: Element = "<query xmlns='http://jabber.org/protocol/disco#info'><identity category='client' type='bot' name='strix'/><feature var='urn:xmpp:ping'/></query>"
            .parse()
            .unwrap();
        let result = DiscoInfoResult::try_from(elem).unwrap();
        assert_eq!(result.identities.len(), 1);
        assert_eq!(result.features, vec!["urn:xmpp:ping"]);
        let back: Element = result.clone().into();
        assert_eq!(DiscoInfoResult::try_from(back).unwrap(), result);
    }

    #[test]
    fn identity_requires_category_and_type() {
        let elem: Element =
            "<identity xmlns='http://jabber.org/protocol/disco#info' category='' type='bot'/>"
                .parse()
                .unwrap();
        assert!(Identity::try_from(elem).is_err());
    }

    #[test]
    fn items_result() {
        let elem: Element = "<query xmlns='http://jabber.org/protocol/disco#items'><item jid='chat.example.net' name='Chatrooms'/></query>"
            .parse()
            .unwrap();
        let result = DiscoItemsResult::try_from(elem).unwrap();
        assert_eq!(result.items.len(), 1);
        assert_eq!(result.items[0].jid.domain(), "chat.example.net");
    }
}
