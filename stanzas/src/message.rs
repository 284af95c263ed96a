// Copyright (c) 2024 strix contributors.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Message stanzas, RFC 6121 § 5.

use std::collections::BTreeMap;

use strix_schema::error::FromElementError;
use strix_schema::policy::{append_lang_map, text_lang_map};
use strix_schema::{Element, Node};

use crate::jid::Jid;
use crate::ns;

strix_schema::generate_attribute!(
    /// The type of a message.
    MessageType, "type", {
        /// Standalone message sent outside of any chat.
        Normal => "normal",

        /// Message sent in the context of a one-to-one chat.
        Chat => "chat",

        /// Message sent in the context of a multi-user chat.
        Groupchat => "groupchat",

        /// Message sent in a news-like fashion, no reply expected.
        Headline => "headline",

        /// Error reply to a previously sent message.
        Error => "error",
    }, Default = Normal
);

type Lang = String;

/// The `<message/>` stanza.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// The sender of this message.
    pub from: Option<Jid>,

    /// The recipient of this message.
    pub to: Option<Jid>,

    /// The identifier of this message, if any.
    pub id: Option<String>,

    /// The message type.
    pub type_: MessageType,

    /// Used to group messages into a conversation thread.
    pub thread: Option<String>,

    /// Subject of the message, one per language.
    pub subjects: BTreeMap<Lang, String>,

    /// Body of the message, one per language.
    pub bodies: BTreeMap<Lang, String>,

    /// Extension payloads.
    pub payloads: Vec<Element>,
}

impl Message {
    /// Create a new message addressed to `to`.
    pub fn new(to: Option<Jid>) -> Message {
        Message {
            from: None,
            to,
            id: None,
            type_: MessageType::Chat,
            thread: None,
            subjects: BTreeMap::new(),
            bodies: BTreeMap::new(),
            payloads: vec![],
        }
    }

    /// Set a body without a language tag.
    pub fn with_body<S: Into<String>>(mut self, body: S) -> Message {
        self.bodies.insert(String::new(), body.into());
        self
    }

    /// The best body for the given preferred languages: the first language
    /// in `prefer` that exists, the untagged body otherwise.
    pub fn get_best_body(&self, prefer: &[&str]) -> Option<&String> {
        for lang in prefer {
            if let Some(body) = self.bodies.get(*lang) {
                return Some(body);
            }
        }
        self.bodies.get("")
    }
}

impl TryFrom<Element> for Message {
    type Error = FromElementError;

    fn try_from(elem: Element) -> Result<Message, FromElementError> {
        strix_schema::check_self!(elem, "message", ns::JABBER_CLIENT);

        let subjects = text_lang_map(&elem, "subject", ns::JABBER_CLIENT);
        let bodies = text_lang_map(&elem, "body", ns::JABBER_CLIENT);
        let mut thread = None;
        let mut payloads = Vec::new();
        for child in elem.children() {
            if child.is("subject", ns::JABBER_CLIENT) || child.is("body", ns::JABBER_CLIENT) {
                continue;
            }
            if child.is("thread", ns::JABBER_CLIENT) {
                thread = Some(child.text());
                continue;
            }
            payloads.push(child.clone());
        }

        Ok(Message {
            from: strix_schema::get_attr!(elem, "from", Option),
            to: strix_schema::get_attr!(elem, "to", Option),
            id: strix_schema::get_attr!(elem, "id", Option),
            type_: strix_schema::get_attr!(elem, "type", Default),
            thread,
            subjects,
            bodies,
            payloads,
        })
    }
}

impl From<Message> for Element {
    fn from(message: Message) -> Element {
        let mut elem = Element::builder("message", ns::JABBER_CLIENT)
            .attr("from", message.from)
            .attr("to", message.to)
            .attr("id", message.id)
            .attr("type", message.type_)
            .build();
        append_lang_map(&mut elem, "subject", ns::JABBER_CLIENT, &message.subjects);
        append_lang_map(&mut elem, "body", ns::JABBER_CLIENT, &message.bodies);
        if let Some(thread) = message.thread {
            let mut child = Element::bare("thread", ns::JABBER_CLIENT);
            child.append_text_node(thread);
            elem.append_node(Node::Element(child));
        }
        for payload in message.payloads {
            elem.append_node(Node::Element(payload));
        }
        elem
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_chat_message() {
        let elem: Element = "<message xmlns='jabber:client' from='alice@example.net/a' type='chat'><body>hi</body><body xml:lang='de'>hallo</body></message>"
            .parse()
            .unwrap();
        let message = Message::try_from(elem).unwrap();
        assert_eq!(message.type_, MessageType::Chat);
        assert_eq!(message.get_best_body(&["de"]), Some(&"hallo".to_owned()));
        assert_eq!(message.get_best_body(&["fr"]), Some(&"hi".to_owned()));
    }

    #[test]
    fn type_defaults_to_normal() {
        let elem: Element = "<message xmlns='jabber:client'/>".parse().unwrap();
        let message = Message::try_from(elem).unwrap();
        assert_eq!(message.type_, MessageType::Normal);
        // and stays off the wire on output
        let back: Element = message.into();
        assert_eq!(back.attr("type"), None);
    }

    #[test]
    fn unknown_children_are_payloads() {
        let elem: Element = "<message xmlns='jabber:client'><active xmlns='http://jabber.org/protocol/chatstates'/></message>"
            .parse()
            .unwrap();
        let message = Message::try_from(elem).unwrap();
        assert_eq!(message.payloads.len(), 1);
        assert!(message.payloads[0].is("active", "http://jabber.org/protocol/chatstates"));
    }

    #[test]
    fn round_trip() {
        let message = Message::new(Some("alice@example.net".parse().unwrap()))
            .with_body("body text");
        let elem: Element = message.clone().into();
        assert_eq!(Message::try_from(elem).unwrap(), message);
    }
}
