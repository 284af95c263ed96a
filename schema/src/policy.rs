// Copyright (c) 2024 strix contributors.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Unknown-content policies and descriptor extraction helpers.
//!
//! Every class declares, separately for unknown attributes and unknown
//! children, what happens to content its schema does not describe. The
//! default for both is [`Drop`][`UnknownAttributePolicy::Drop`].

use std::collections::BTreeMap;

use crate::element::{Element, Node};
use crate::error::Error;

/// Policy for attributes not described by the schema of a class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnknownAttributePolicy {
    /// Ignore the attribute.
    #[default]
    Drop,

    /// Fail parsing of the whole element.
    Fail,
}

impl UnknownAttributePolicy {
    /// Apply the policy to all attributes of `elem` which are not listed in
    /// `known`.
    pub fn apply(&self, elem: &Element, known: &[&str]) -> Result<(), Error> {
        match self {
            Self::Drop => Ok(()),
            Self::Fail => {
                for (name, _) in elem.attrs() {
                    if !known.contains(&name) {
                        return Err(Error::Other("unknown attribute in element"));
                    }
                }
                Ok(())
            }
        }
    }
}

/// Policy for child elements not described by the schema of a class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnknownChildPolicy {
    /// Ignore the child.
    #[default]
    Drop,

    /// Fail parsing of the whole element.
    Fail,

    /// Preserve the child subtree in an implicit collector.
    Preserve,
}

impl UnknownChildPolicy {
    /// Apply the policy to all children of `elem` for which `known` returns
    /// false.
    ///
    /// Returns the collector of preserved subtrees (empty unless the policy
    /// is [`Preserve`][`Self::Preserve`]).
    pub fn apply<F: Fn(&Element) -> bool>(
        &self,
        elem: &Element,
        known: F,
    ) -> Result<Vec<Element>, Error> {
        let mut collector = Vec::new();
        for child in elem.children() {
            if known(child) {
                continue;
            }
            match self {
                Self::Drop => (),
                Self::Fail => return Err(Error::Other("unknown child in element")),
                Self::Preserve => collector.push(child.clone()),
            }
        }
        Ok(collector)
    }
}

/// Policy applied when materialising a child element fails to parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChildErrorPolicy {
    /// Surface the parse error to the caller.
    #[default]
    Surface,

    /// Substitute the descriptor's default value.
    SubstituteDefault,

    /// Drop the offending element.
    Discard,
}

/// Extract a `xml:lang` keyed text map from repeated children.
///
/// Children of `elem` matching `name` and `ns` are collected into a map from
/// language tag to character data; a child without `xml:lang` is stored
/// under the empty string. Repeated tags keep the first occurrence, as
/// required for language-mapped stanza fields.
pub fn text_lang_map(elem: &Element, name: &str, ns: &str) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    for child in elem.children() {
        if !child.is(name, ns) {
            continue;
        }
        let lang = child.attr("xml:lang").unwrap_or("").to_owned();
        map.entry(lang).or_insert_with(|| child.text());
    }
    map
}

/// Serialise a language map back into repeated children on `parent`.
pub fn append_lang_map(parent: &mut Element, name: &str, ns: &str, map: &BTreeMap<String, String>) {
    for (lang, text) in map {
        let mut child = Element::bare(name, ns);
        if !lang.is_empty() {
            child.set_attr("xml:lang", lang.as_str());
        }
        child.append_node(Node::Text(text.clone()));
        parent.append_node(Node::Element(child));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_attribute_policies() {
        let elem: Element = "<x xmlns='ns' a='1' b='2'/>".parse().unwrap();
        assert!(UnknownAttributePolicy::Drop.apply(&elem, &["a"]).is_ok());
        assert!(UnknownAttributePolicy::Fail.apply(&elem, &["a"]).is_err());
        assert!(UnknownAttributePolicy::Fail
            .apply(&elem, &["a", "b"])
            .is_ok());
    }

    #[test]
    fn unknown_child_preserve_collects() {
        let elem: Element = "<x xmlns='ns'><known/><stray xmlns='other'/></x>"
            .parse()
            .unwrap();
        let collected = UnknownChildPolicy::Preserve
            .apply(&elem, |child| child.is("known", "ns"))
            .unwrap();
        assert_eq!(collected.len(), 1);
        assert!(collected[0].is("stray", "other"));
        assert!(UnknownChildPolicy::Fail
            .apply(&elem, |child| child.is("known", "ns"))
            .is_err());
    }

    #[test]
    fn lang_map_round_trip() {
        let elem: Element =
            "<message xmlns='jabber:client'><body>hi</body><body xml:lang='de'>hallo</body></message>"
                .parse()
                .unwrap();
        let map = text_lang_map(&elem, "body", "jabber:client");
        assert_eq!(map.get(""), Some(&"hi".to_owned()));
        assert_eq!(map.get("de"), Some(&"hallo".to_owned()));

        let mut out = Element::bare("message", "jabber:client");
        append_lang_map(&mut out, "body", "jabber:client", &map);
        assert_eq!(text_lang_map(&out, "body", "jabber:client"), map);
    }
}
