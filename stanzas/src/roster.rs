// Copyright (c) 2024 strix contributors.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Roster management, RFC 6121 § 2.

use strix_schema::error::{Error, FromElementError};
use strix_schema::{Element, Node};

use crate::jid::Jid;
use crate::ns;

strix_schema::generate_attribute!(
    /// The state of a presence subscription.
    Subscription, "subscription", {
        /// The user does not have a subscription to the contact's presence,
        /// and the contact does not have a subscription to the user's
        /// presence.
        None => "none",

        /// The user has a subscription to the contact's presence, but the
        /// contact does not have a subscription to the user's presence.
        To => "to",

        /// The contact has a subscription to the user's presence, but the
        /// user does not have a subscription to the contact's presence.
        From => "from",

        /// Both the user and the contact have subscriptions to each other's
        /// presence.
        Both => "both",

        /// The item is to be removed.
        Remove => "remove",
    }, Default = None
);

/// A single roster entry.
#[derive(Debug, Clone, PartialEq)]
pub struct Item {
    /// The JID of this entry.
    pub jid: Jid,

    /// The name people will see in their contact list.
    pub name: Option<String>,

    /// The state of the presence subscription.
    pub subscription: Subscription,

    /// Whether a subscription request is pending approval by the contact.
    pub ask: bool,

    /// The groups this entry belongs to.
    pub groups: Vec<String>,
}

impl TryFrom<Element> for Item {
    type Error = FromElementError;

    fn try_from(elem: Element) -> Result<Item, FromElementError> {
        strix_schema::check_self!(elem, "item", ns::ROSTER);
        let ask = match elem.attr("ask") {
            Some("subscribe") => true,
            Some(_) => return Err(Error::Other("Invalid ask attribute on roster item.").into()),
            None => false,
        };
        let mut groups = Vec::new();
        for child in elem.children() {
            if child.is("group", ns::ROSTER) {
                groups.push(child.text());
            }
        }
        Ok(Item {
            jid: strix_schema::get_attr!(elem, "jid", Required),
            name: strix_schema::get_attr!(elem, "name", OptionEmpty),
            subscription: strix_schema::get_attr!(elem, "subscription", Default),
            ask,
            groups,
        })
    }
}

impl From<Item> for Element {
    fn from(item: Item) -> Element {
        let mut elem = Element::builder("item", ns::ROSTER)
            .attr("jid", item.jid)
            .attr("name", item.name)
            .attr("subscription", item.subscription)
            .attr("ask", if item.ask { Some("subscribe") } else { None })
            .build();
        for group in item.groups {
            let mut child = Element::bare("group", ns::ROSTER);
            child.append_node(Node::Text(group));
            elem.append_node(Node::Element(child));
        }
        elem
    }
}

strix_schema::generate_element!(
    /// A roster query, sent to fetch the roster or carried in a push.
    Roster, "query", crate::ns::ROSTER,
    attributes: [
        /// The roster version, if versioning is supported.
        ver: Option<String> = "ver",
    ],
    children: [
        /// The entries of this roster (or of this push).
        items: Vec<Item> = ("item", crate::ns::ROSTER)
    ]
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_roster_result() {
        let elem: Element = "<query xmlns='jabber:iq:roster' ver='ver11'><item jid='romeo@example.net' name='Romeo' subscription='both'><group>Friends</group></item><item jid='mercutio@example.org' ask='subscribe'/></query>"
            .parse()
            .unwrap();
        let roster = Roster::try_from(elem).unwrap();
        assert_eq!(roster.ver, Some("ver11".to_owned()));
        assert_eq!(roster.items.len(), 2);
        assert_eq!(roster.items[0].subscription, Subscription::Both);
        assert_eq!(roster.items[0].groups, vec!["Friends"]);
        assert!(roster.items[1].ask);
        assert_eq!(roster.items[1].subscription, Subscription::None);
    }

    #[test]
    fn invalid_ask_rejected() {
        let elem: Element = "<item xmlns='jabber:iq:roster' jid='a@b' ask='no'/>"
            .parse()
            .unwrap();
        assert!(Item::try_from(elem).is_err());
    }

    #[test]
    fn removal_round_trip() {
        let item = Item {
            jid: "old@example.net".parse().unwrap(),
            name: None,
            subscription: Subscription::Remove,
            ask: false,
            groups: vec![],
        };
        let elem: Element = item.clone().into();
        assert_eq!(elem.attr("subscription"), Some("remove"));
        assert_eq!(Item::try_from(elem).unwrap(), item);
    }
}
