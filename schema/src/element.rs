// Copyright (c) 2024 strix contributors.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! # Generic XML element tree
//!
//! [`Element`] is the workhorse of the schema layer: every XML subtree read
//! from a stream is first materialised as an `Element` (this is the captured
//! root-event-sequence of the wire protocol), and every stanza is serialised
//! by converting it back into one. The tree preserves attribute and child
//! order and resolved namespaces, which makes re-serialisation
//! infoset-equivalent to the input.

use core::fmt;
use core::str::FromStr;
use std::collections::BTreeMap;

use bytes::BytesMut;

use rxml::writer::{Encoder, SimpleNamespaces, TrackNamespace};
use rxml::{Event, Namespace, NcName};

use crate::error::Error;
use crate::item::Item;

/// Namespace of the reserved `xml:` prefix.
pub const XML_NS: &str = "http://www.w3.org/XML/1998/namespace";

/// A node in an element tree: either a child element or character data.
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    /// A child element.
    Element(Element),

    /// A text node.
    Text(String),
}

impl Node {
    /// Return a reference to the contained element, if this is an element
    /// node.
    pub fn as_element(&self) -> Option<&Element> {
        match self {
            Node::Element(ref el) => Some(el),
            Node::Text(_) => None,
        }
    }

    /// Return the contained text, if this is a text node.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Node::Element(_) => None,
            Node::Text(ref s) => Some(s),
        }
    }
}

impl From<Element> for Node {
    fn from(other: Element) -> Node {
        Node::Element(other)
    }
}

impl From<String> for Node {
    fn from(other: String) -> Node {
        Node::Text(other)
    }
}

impl From<&str> for Node {
    fn from(other: &str) -> Node {
        Node::Text(other.to_owned())
    }
}

/// A single XML element with resolved namespaces.
#[derive(Debug, Clone, PartialEq)]
pub struct Element {
    name: String,
    ns: String,
    attrs: BTreeMap<String, String>,
    nodes: Vec<Node>,
}

impl Element {
    /// Start building a new element with the given local name and namespace.
    pub fn builder<N: Into<String>, S: Into<String>>(name: N, ns: S) -> ElementBuilder {
        ElementBuilder {
            root: Element {
                name: name.into(),
                ns: ns.into(),
                attrs: BTreeMap::new(),
                nodes: Vec::new(),
            },
        }
    }

    /// Create a bare element with no attributes and no children.
    pub fn bare<N: Into<String>, S: Into<String>>(name: N, ns: S) -> Element {
        Element {
            name: name.into(),
            ns: ns.into(),
            attrs: BTreeMap::new(),
            nodes: Vec::new(),
        }
    }

    /// The local name of this element.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The resolved namespace of this element.
    pub fn ns(&self) -> &str {
        &self.ns
    }

    /// Check whether this element matches the given name and namespace.
    pub fn is<'a, N: AsRef<str>, S: AsRef<str>>(&self, name: N, ns: S) -> bool {
        self.name == name.as_ref() && self.ns == ns.as_ref()
    }

    /// Check whether this element is in the given namespace.
    pub fn has_ns<S: AsRef<str>>(&self, ns: S) -> bool {
        self.ns == ns.as_ref()
    }

    /// Get an attribute value by name.
    ///
    /// The reserved `xml:lang` attribute is addressed literally as
    /// `"xml:lang"`.
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs.get(name).map(|s| s.as_str())
    }

    /// Set an attribute. A `None` value removes the attribute.
    pub fn set_attr<V: IntoAttributeValue>(&mut self, name: &str, value: V) {
        match value.into_attribute_value() {
            Some(value) => {
                self.attrs.insert(name.to_owned(), value);
            }
            None => {
                self.attrs.remove(name);
            }
        }
    }

    /// Iterate over the attributes of this element.
    pub fn attrs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.attrs.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Iterate over all nodes of this element, in document order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter()
    }

    /// Iterate over the child elements of this element, in document order.
    pub fn children(&self) -> impl Iterator<Item = &Element> {
        self.nodes.iter().filter_map(Node::as_element)
    }

    /// Consume the element and iterate over its child elements.
    pub fn into_children(self) -> impl Iterator<Item = Element> {
        self.nodes.into_iter().filter_map(|node| match node {
            Node::Element(el) => Some(el),
            Node::Text(_) => None,
        })
    }

    /// Get the first child matching name and namespace.
    pub fn get_child<N: AsRef<str>, S: AsRef<str>>(&self, name: N, ns: S) -> Option<&Element> {
        self.children()
            .find(|child| child.is(name.as_ref(), ns.as_ref()))
    }

    /// Check for the presence of a child matching name and namespace.
    pub fn has_child<N: AsRef<str>, S: AsRef<str>>(&self, name: N, ns: S) -> bool {
        self.get_child(name, ns).is_some()
    }

    /// Remove and return the first child matching name and namespace.
    pub fn take_child<N: AsRef<str>, S: AsRef<str>>(&mut self, name: N, ns: S) -> Option<Element> {
        let index = self.nodes.iter().position(|node| {
            node.as_element()
                .map(|el| el.is(name.as_ref(), ns.as_ref()))
                .unwrap_or(false)
        })?;
        match self.nodes.remove(index) {
            Node::Element(el) => Some(el),
            Node::Text(_) => unreachable!(),
        }
    }

    /// Append a node to this element's content.
    pub fn append_node(&mut self, node: Node) {
        self.nodes.push(node);
    }

    /// Append a child element.
    pub fn append_child(&mut self, child: Element) -> &mut Element {
        self.nodes.push(Node::Element(child));
        match self.nodes.last_mut() {
            Some(Node::Element(el)) => el,
            _ => unreachable!(),
        }
    }

    /// Append a text node.
    pub fn append_text_node<S: Into<String>>(&mut self, text: S) {
        self.nodes.push(Node::Text(text.into()));
    }

    /// Concatenation of all text nodes directly below this element.
    pub fn text(&self) -> String {
        let mut out = String::new();
        for node in &self.nodes {
            if let Node::Text(ref s) = node {
                out.push_str(s);
            }
        }
        out
    }

    fn ns_value(&self) -> Namespace {
        if self.ns.is_empty() {
            Namespace::NONE
        } else {
            Namespace::from(self.ns.as_str())
        }
    }

    /// Serialise this element into a flat item sequence.
    ///
    /// The items can be pushed into an [`rxml::writer::Encoder`] one by one;
    /// the encoder takes care of namespace declarations and prefix
    /// management.
    pub fn as_items(&self) -> Result<Vec<Item<'_>>, Error> {
        let mut out = Vec::new();
        self.append_items(&mut out)?;
        Ok(out)
    }

    fn append_items<'x>(&'x self, out: &mut Vec<Item<'x>>) -> Result<(), Error> {
        let name = NcName::try_from(self.name.as_str())?;
        out.push(Item::ElementHeadStart(
            self.ns_value(),
            std::borrow::Cow::Owned(name),
        ));
        for (key, value) in self.attrs.iter() {
            let (ns, local) = match key.strip_prefix("xml:") {
                Some(local) => (Namespace::from(XML_NS), local),
                None => (Namespace::NONE, key.as_str()),
            };
            let local = NcName::try_from(local)?;
            out.push(Item::Attribute(
                ns,
                std::borrow::Cow::Owned(local),
                std::borrow::Cow::Borrowed(value),
            ));
        }
        out.push(Item::ElementHeadEnd);
        for node in &self.nodes {
            match node {
                Node::Element(ref child) => child.append_items(out)?,
                Node::Text(ref text) => out.push(Item::Text(std::borrow::Cow::Borrowed(text))),
            }
        }
        out.push(Item::ElementFoot);
        Ok(())
    }
}

impl fmt::Display for Element {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let items = self.as_items().map_err(|_| fmt::Error)?;
        let mut encoder = Encoder::<SimpleNamespaces>::new();
        encoder
            .ns_tracker_mut()
            .declare_fixed(None, self.ns.as_str().into());
        let mut buf = BytesMut::new();
        for item in items {
            encoder
                .encode_into_bytes(item.as_rxml_item(), &mut buf)
                .map_err(|_| fmt::Error)?;
        }
        f.write_str(core::str::from_utf8(&buf).map_err(|_| fmt::Error)?)
    }
}

fn map_nonio_error<T>(r: Result<T, rxml::Error>) -> Result<T, Error> {
    match r {
        Ok(v) => Ok(v),
        // no I/O happens when parsing from a byte slice
        Err(rxml::Error::IO(_)) => unreachable!(),
        Err(rxml::Error::Xml(e)) => Err(e.into()),
        Err(rxml::Error::InvalidUtf8Byte(_)) => Err(Error::Other("invalid utf-8")),
        Err(rxml::Error::InvalidChar(_)) => Err(Error::Other("non-character encountered")),
        Err(rxml::Error::RestrictedXml(_)) => Err(Error::Other("restricted xml")),
    }
}

impl FromStr for Element {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = s.as_bytes();
        let reader = rxml::Reader::new(&mut bytes);
        let mut builder = TreeBuilder::new();
        for ev in reader {
            if let Some(root) = builder.feed(map_nonio_error(ev)?)? {
                return Ok(root);
            }
        }
        Err(Error::XmlError(rxml::error::XmlError::InvalidEof(
            "while parsing element",
        )))
    }
}

/// Incremental builder assembling [`Element`] trees from parser events.
///
/// The builder tracks nesting depth; a completed tree is returned from
/// [`feed`][`Self::feed`] as soon as the element which opened at depth zero
/// is closed. Whitespace outside any element is discarded, other stray text
/// is an error.
pub struct TreeBuilder {
    stack: Vec<Element>,
}

impl TreeBuilder {
    /// Create a new, empty tree builder.
    pub fn new() -> Self {
        Self { stack: Vec::new() }
    }

    /// Current nesting depth.
    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    /// Feed a single parser event.
    ///
    /// Returns `Ok(Some(_))` when a complete tree has been assembled.
    pub fn feed(&mut self, ev: Event) -> Result<Option<Element>, Error> {
        match ev {
            Event::XmlDeclaration(_, _) => Ok(None),
            Event::StartElement(_, (ns, name), attrs) => {
                let mut element = Element::bare(name.to_string(), ns.to_string());
                for ((ans, aname), value) in attrs.into_iter() {
                    if ans == Namespace::NONE {
                        element.attrs.insert(aname.to_string(), value);
                    } else if ans == XML_NS {
                        element.attrs.insert(format!("xml:{}", aname), value);
                    } else {
                        // Foreign-namespaced attributes are not used by the
                        // protocols we speak; drop rather than guess a
                        // prefix mapping for them.
                        log::debug!(
                            "dropping foreign-namespaced attribute {{{}}}{}",
                            ans,
                            aname
                        );
                    }
                }
                self.stack.push(element);
                Ok(None)
            }
            Event::Text(_, text) => {
                match self.stack.last_mut() {
                    Some(parent) => parent.append_text_node(text),
                    None => {
                        if !text.as_bytes().iter().all(u8::is_ascii_whitespace) {
                            return Err(Error::Other("text content outside of any element"));
                        }
                    }
                }
                Ok(None)
            }
            Event::EndElement(_) => match self.stack.pop() {
                Some(element) => match self.stack.last_mut() {
                    Some(parent) => {
                        parent.append_child(element);
                        Ok(None)
                    }
                    None => Ok(Some(element)),
                },
                None => Err(Error::Other("end of element at depth zero")),
            },
        }
    }
}

/// Builder for [`Element`] values.
pub struct ElementBuilder {
    root: Element,
}

impl ElementBuilder {
    /// Set an attribute. `None` values are skipped.
    pub fn attr<V: IntoAttributeValue>(mut self, name: &str, value: V) -> Self {
        self.root.set_attr(name, value);
        self
    }

    /// Append a node.
    pub fn append<N: Into<Node>>(mut self, node: N) -> Self {
        self.root.nodes.push(node.into());
        self
    }

    /// Append a sequence of nodes.
    pub fn append_all<N: Into<Node>, I: IntoIterator<Item = N>>(mut self, iter: I) -> Self {
        for node in iter {
            self.root.nodes.push(node.into());
        }
        self
    }

    /// Finish building.
    pub fn build(self) -> Element {
        self.root
    }
}

/// Conversion of typed values into attribute text.
///
/// Returning `None` omits the attribute entirely, which is how
/// default-valued attributes stay off the wire.
pub trait IntoAttributeValue {
    /// Turn the value into an optional attribute string.
    fn into_attribute_value(self) -> Option<String>;
}

macro_rules! impl_into_attribute_value_via_display {
    ($($t:ty),+$(,)?) => {
        $(
            impl IntoAttributeValue for $t {
                fn into_attribute_value(self) -> Option<String> {
                    Some(self.to_string())
                }
            }
        )+
    }
}

impl_into_attribute_value_via_display!(u8, u16, u32, u64, usize, i8, i16, i32, i64, isize);

impl IntoAttributeValue for String {
    fn into_attribute_value(self) -> Option<String> {
        Some(self)
    }
}

impl IntoAttributeValue for &str {
    fn into_attribute_value(self) -> Option<String> {
        Some(self.to_owned())
    }
}

impl<T: IntoAttributeValue> IntoAttributeValue for Option<T> {
    fn into_attribute_value(self) -> Option<String> {
        self.and_then(IntoAttributeValue::into_attribute_value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_simple() {
        let elem: Element = "<ping xmlns='urn:xmpp:ping'/>".parse().unwrap();
        assert_eq!(elem.name(), "ping");
        assert_eq!(elem.ns(), "urn:xmpp:ping");
        assert_eq!(elem.nodes().count(), 0);
    }

    #[test]
    fn parse_attributes_and_text() {
        let elem: Element = "<body xmlns='jabber:client' xml:lang='en'>hello</body>"
            .parse()
            .unwrap();
        assert_eq!(elem.attr("xml:lang"), Some("en"));
        assert_eq!(elem.text(), "hello");
    }

    #[test]
    fn parse_nested_default_ns_redeclaration() {
        // stanza forwarding redeclares the default namespace on the inner
        // stanza; the resolved namespaces must survive.
        let elem: Element = "<forwarded xmlns='urn:xmpp:forward:0'><message xmlns='jabber:client'><body>hi</body></message></forwarded>"
            .parse()
            .unwrap();
        let message = elem.get_child("message", "jabber:client").unwrap();
        let body = message.get_child("body", "jabber:client").unwrap();
        assert_eq!(body.text(), "hi");
    }

    #[test]
    fn reject_malformed() {
        assert!("<open><mismatch></open>".parse::<Element>().is_err());
    }

    #[test]
    fn builder_and_access() {
        let elem = Element::builder("query", "jabber:iq:roster")
            .attr("ver", "ver27")
            .append(Element::builder("item", "jabber:iq:roster").attr("jid", "a@b").build())
            .build();
        assert!(elem.is("query", "jabber:iq:roster"));
        assert_eq!(elem.attr("ver"), Some("ver27"));
        assert_eq!(elem.children().count(), 1);
    }

    #[test]
    fn take_child_removes_only_first_match() {
        let mut elem = Element::builder("x", "ns")
            .append(Element::bare("a", "ns"))
            .append(Element::bare("a", "ns"))
            .build();
        assert!(elem.take_child("a", "ns").is_some());
        assert_eq!(elem.children().count(), 1);
    }

    #[test]
    fn display_round_trip() {
        let elem: Element = "<message xmlns='jabber:client' type='chat'><body>42</body></message>"
            .parse()
            .unwrap();
        let rendered = elem.to_string();
        let reparsed: Element = rendered.parse().unwrap();
        assert_eq!(elem, reparsed);
    }

    #[test]
    fn omitted_optional_attribute() {
        let mut elem = Element::bare("presence", "jabber:client");
        elem.set_attr("type", None::<String>);
        assert_eq!(elem.attr("type"), None);
    }
}
