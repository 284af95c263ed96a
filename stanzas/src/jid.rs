// Copyright (c) 2024 strix contributors.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! # Jabber identifiers
//!
//! A [`Jid`] is the address of an entity in the XMPP network, written as
//! `local@domain/resource` with `domain` the only mandatory part. Parsing
//! canonicalises each part: the domain goes through IDNA and ASCII case
//! folding, the localpart through a nodeprep-equivalent case fold and
//! prohibited-character check, the resourcepart is preserved byte-exact
//! but checked for prohibited characters. Equality and hashing operate on
//! the canonical forms, so `A@B` and `a@b` compare equal.

use core::fmt;
use core::str::FromStr;

use strix_schema::text::{AsXmlText, FromXmlText};
use strix_schema::{Error as SchemaError, IntoAttributeValue};

/// RFC 6122 limits every part of a JID to 1023 bytes.
const MAX_PART_LEN: usize = 1023;

/// Error enumeration for JID parsing and construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JidParseError {
    /// The domain part is missing or empty.
    DomainEmpty,

    /// A part was present but empty (e.g. `@domain` or `domain/`).
    PartEmpty,

    /// A part exceeded the 1023 byte limit of RFC 6122.
    PartTooLong,

    /// A prohibited codepoint was encountered.
    ProhibitedCharacter,

    /// The domain failed IDNA conversion.
    BadDomain,

    /// A full JID was required but no resource was present.
    ResourceMissing,
}

impl fmt::Display for JidParseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            Self::DomainEmpty => "domain part is missing or empty",
            Self::PartEmpty => "empty part in JID",
            Self::PartTooLong => "part longer than 1023 bytes",
            Self::ProhibitedCharacter => "prohibited character in JID",
            Self::BadDomain => "domain failed IDNA conversion",
            Self::ResourceMissing => "resource part required but missing",
        })
    }
}

impl std::error::Error for JidParseError {}

fn prepare_local(local: &str) -> Result<String, JidParseError> {
    if local.is_empty() {
        return Err(JidParseError::PartEmpty);
    }
    if local.len() > MAX_PART_LEN {
        return Err(JidParseError::PartTooLong);
    }
    let mut out = String::with_capacity(local.len());
    for ch in local.chars() {
        // prohibited output of nodeprep, plus the separators themselves
        match ch {
            '\u{0}'..='\u{1f}' | '"' | '&' | '\'' | '/' | ':' | '<' | '>' | '@' | ' ' => {
                return Err(JidParseError::ProhibitedCharacter)
            }
            _ => (),
        }
        for folded in ch.to_lowercase() {
            out.push(folded);
        }
    }
    Ok(out)
}

fn prepare_domain(domain: &str) -> Result<String, JidParseError> {
    if domain.is_empty() {
        return Err(JidParseError::DomainEmpty);
    }
    if domain.len() > MAX_PART_LEN {
        return Err(JidParseError::PartTooLong);
    }
    if domain.contains('\u{0}') {
        return Err(JidParseError::ProhibitedCharacter);
    }
    // IP literals pass through unchanged apart from case folding.
    if domain.parse::<core::net::IpAddr>().is_ok() {
        return Ok(domain.to_ascii_lowercase());
    }
    let prepared =
        idna::domain_to_ascii(domain.trim_end_matches('.')).map_err(|_| JidParseError::BadDomain)?;
    if prepared.is_empty() {
        return Err(JidParseError::DomainEmpty);
    }
    Ok(prepared)
}

fn prepare_resource(resource: &str) -> Result<String, JidParseError> {
    if resource.is_empty() {
        return Err(JidParseError::PartEmpty);
    }
    if resource.len() > MAX_PART_LEN {
        return Err(JidParseError::PartTooLong);
    }
    for ch in resource.chars() {
        if ('\u{0}'..='\u{1f}').contains(&ch) {
            return Err(JidParseError::ProhibitedCharacter);
        }
    }
    Ok(resource.to_owned())
}

/// A Jabber identifier, bare or full.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Jid {
    local: Option<String>,
    domain: String,
    resource: Option<String>,
}

impl Jid {
    /// Parse and canonicalise a JID from its textual form.
    pub fn new(s: &str) -> Result<Jid, JidParseError> {
        s.parse()
    }

    /// Construct a JID from already separated parts.
    pub fn from_parts(
        local: Option<&str>,
        domain: &str,
        resource: Option<&str>,
    ) -> Result<Jid, JidParseError> {
        Ok(Jid {
            local: local.map(prepare_local).transpose()?,
            domain: prepare_domain(domain)?,
            resource: resource.map(prepare_resource).transpose()?,
        })
    }

    /// The localpart, if any.
    pub fn node(&self) -> Option<&str> {
        self.local.as_deref()
    }

    /// The domainpart.
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// The resourcepart, if any.
    pub fn resource(&self) -> Option<&str> {
        self.resource.as_deref()
    }

    /// Whether this is a full JID (has a resource).
    pub fn is_full(&self) -> bool {
        self.resource.is_some()
    }

    /// Whether this is a bare JID (has no resource).
    pub fn is_bare(&self) -> bool {
        self.resource.is_none()
    }

    /// The bare form of this JID, with the resource stripped.
    pub fn to_bare(&self) -> BareJid {
        BareJid(Jid {
            local: self.local.clone(),
            domain: self.domain.clone(),
            resource: None,
        })
    }

    /// Attach a resource, producing a full JID.
    pub fn with_resource(&self, resource: &str) -> Result<FullJid, JidParseError> {
        Ok(FullJid(Jid {
            local: self.local.clone(),
            domain: self.domain.clone(),
            resource: Some(prepare_resource(resource)?),
        }))
    }
}

impl FromStr for Jid {
    type Err = JidParseError;

    fn from_str(s: &str) -> Result<Jid, JidParseError> {
        let (rest, resource) = match s.split_once('/') {
            Some((rest, resource)) => (rest, Some(resource)),
            None => (s, None),
        };
        let (local, domain) = match rest.split_once('@') {
            Some((local, domain)) => (Some(local), domain),
            None => (None, rest),
        };
        Jid::from_parts(local, domain, resource)
    }
}

impl fmt::Display for Jid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if let Some(ref local) = self.local {
            write!(f, "{}@", local)?;
        }
        f.write_str(&self.domain)?;
        if let Some(ref resource) = self.resource {
            write!(f, "/{}", resource)?;
        }
        Ok(())
    }
}

impl FromXmlText for Jid {
    fn from_xml_text(s: String) -> Result<Self, SchemaError> {
        s.parse().map_err(SchemaError::text_parse_error)
    }
}

impl AsXmlText for Jid {
    fn as_xml_text(&self) -> Result<std::borrow::Cow<'_, str>, SchemaError> {
        Ok(std::borrow::Cow::Owned(self.to_string()))
    }
}

impl IntoAttributeValue for Jid {
    fn into_attribute_value(self) -> Option<String> {
        Some(self.to_string())
    }
}

/// A JID without a resource part.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BareJid(Jid);

impl BareJid {
    /// Parse a bare JID; a resource part is rejected.
    pub fn new(s: &str) -> Result<BareJid, JidParseError> {
        let jid: Jid = s.parse()?;
        if jid.is_full() {
            return Err(JidParseError::ProhibitedCharacter);
        }
        Ok(BareJid(jid))
    }

    /// Attach a resource, producing a full JID.
    pub fn with_resource(&self, resource: &str) -> Result<FullJid, JidParseError> {
        self.0.with_resource(resource)
    }
}

impl core::ops::Deref for BareJid {
    type Target = Jid;

    fn deref(&self) -> &Jid {
        &self.0
    }
}

impl fmt::Display for BareJid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl From<BareJid> for Jid {
    fn from(other: BareJid) -> Jid {
        other.0
    }
}

/// A JID with a resource part.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FullJid(Jid);

impl FullJid {
    /// Parse a full JID; a missing resource part is rejected.
    pub fn new(s: &str) -> Result<FullJid, JidParseError> {
        let jid: Jid = s.parse()?;
        if jid.is_bare() {
            return Err(JidParseError::ResourceMissing);
        }
        Ok(FullJid(jid))
    }
}

impl core::ops::Deref for FullJid {
    type Target = Jid;

    fn deref(&self) -> &Jid {
        &self.0
    }
}

impl fmt::Display for FullJid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl From<FullJid> for Jid {
    fn from(other: FullJid) -> Jid {
        other.0
    }
}

impl TryFrom<Jid> for FullJid {
    type Error = JidParseError;

    fn try_from(other: Jid) -> Result<FullJid, JidParseError> {
        if other.is_bare() {
            return Err(JidParseError::ResourceMissing);
        }
        Ok(FullJid(other))
    }
}

/// Escape a string for use as a localpart, per XEP-0106.
pub fn node_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for ch in s.chars() {
        match ch {
            ' ' => out.push_str("\\20"),
            '"' => out.push_str("\\22"),
            '&' => out.push_str("\\26"),
            '\'' => out.push_str("\\27"),
            '/' => out.push_str("\\2f"),
            ':' => out.push_str("\\3a"),
            '<' => out.push_str("\\3c"),
            '>' => out.push_str("\\3e"),
            '@' => out.push_str("\\40"),
            '\\' => out.push_str("\\5c"),
            ch => out.push(ch),
        }
    }
    out
}

/// Reverse [`node_escape`].
pub fn node_unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(pos) = rest.find('\\') {
        out.push_str(&rest[..pos]);
        let escape = rest[pos..].get(..3);
        match escape {
            Some("\\20") => out.push(' '),
            Some("\\22") => out.push('"'),
            Some("\\26") => out.push('&'),
            Some("\\27") => out.push('\''),
            Some("\\2f") => out.push('/'),
            Some("\\3a") => out.push(':'),
            Some("\\3c") => out.push('<'),
            Some("\\3e") => out.push('>'),
            Some("\\40") => out.push('@'),
            Some("\\5c") => out.push('\\'),
            _ => {
                out.push('\\');
                rest = &rest[pos + 1..];
                continue;
            }
        }
        rest = &rest[pos + 3..];
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_forms() {
        let jid: Jid = "alice@example.net/orchard".parse().unwrap();
        assert_eq!(jid.node(), Some("alice"));
        assert_eq!(jid.domain(), "example.net");
        assert_eq!(jid.resource(), Some("orchard"));
        assert!(jid.is_full());

        let bare: Jid = "example.net".parse().unwrap();
        assert_eq!(bare.node(), None);
        assert!(bare.is_bare());
    }

    #[test]
    fn canonicalisation() {
        let a: Jid = "Alice@Example.NET".parse().unwrap();
        let b: Jid = "alice@example.net".parse().unwrap();
        assert_eq!(a, b);
        // the resource is case sensitive
        let c: Jid = "alice@example.net/Foo".parse().unwrap();
        let d: Jid = "alice@example.net/foo".parse().unwrap();
        assert_ne!(c, d);
    }

    #[test]
    fn rejects_garbage() {
        assert!("".parse::<Jid>().is_err());
        assert!("@example.net".parse::<Jid>().is_err());
        assert!("example.net/".parse::<Jid>().is_err());
        assert!("a b@example.net".parse::<Jid>().is_err());
        assert!("a\u{0}b@example.net".parse::<Jid>().is_err());
        let long = "x".repeat(1024);
        assert!(format!("{}@example.net", long).parse::<Jid>().is_err());
    }

    #[test]
    fn bare_and_full_newtypes() {
        assert!(BareJid::new("a@b.example/r").is_err());
        assert!(FullJid::new("a@b.example").is_err());
        let full = FullJid::new("a@b.example/r").unwrap();
        assert_eq!(full.to_bare(), BareJid::new("a@b.example").unwrap());
    }

    #[test]
    fn idn_domain() {
        let jid: Jid = "alice@bücher.example".parse().unwrap();
        assert_eq!(jid.domain(), "xn--bcher-kva.example");
    }

    #[test]
    fn escaping_round_trip() {
        let escaped = node_escape("d'artagnan & co / one:two");
        assert_eq!(escaped, "d\\27artagnan\\20\\26\\20co\\20\\2f\\20one\\3atwo");
        assert_eq!(node_unescape(&escaped), "d'artagnan & co / one:two");
    }
}
