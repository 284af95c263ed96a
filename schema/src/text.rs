// Copyright (c) 2024 strix contributors.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Module containing implementations for conversions to/from XML text.

use std::borrow::Cow;

use base64::engine::{general_purpose::STANDARD as StandardBase64Engine, Engine as _};
use chrono::{DateTime, FixedOffset, NaiveDate, SecondsFormat};

use crate::error::Error;

/// Trait for parsing a value from XML text.
///
/// This is the `parse` direction of a character-data type. The `format`
/// direction is covered by [`AsXmlText`]; assignment-time coercion is done
/// through the ordinary `From`/`TryFrom`/`FromStr` conversions of the
/// respective types.
pub trait FromXmlText: Sized {
    /// Convert the given XML text to a value.
    fn from_xml_text(s: String) -> Result<Self, Error>;
}

/// Trait for converting a value to XML text.
pub trait AsXmlText {
    /// Convert the value to an XML string in canonical form.
    fn as_xml_text(&self) -> Result<Cow<'_, str>, Error>;

    /// Convert the value to an XML string, or `None` to omit the value from
    /// the output entirely.
    ///
    /// The default implementation never omits the value. Types with a
    /// designated default (such as enumerations with an "absent" member)
    /// override this.
    fn as_optional_xml_text(&self) -> Result<Option<Cow<'_, str>>, Error> {
        Ok(Some(self.as_xml_text()?))
    }
}

macro_rules! convert_via_fromstr_and_display {
    ($($t:ty,)+) => {
        $(
            impl FromXmlText for $t {
                #[doc = concat!("Parse [`", stringify!($t), "`] from XML text via [`FromStr`][`core::str::FromStr`].")]
                fn from_xml_text(s: String) -> Result<Self, Error> {
                    s.parse().map_err(Error::text_parse_error)
                }
            }

            impl AsXmlText for $t {
                #[doc = concat!("Convert [`", stringify!($t), "`] to XML text via [`Display`][`core::fmt::Display`].\n\nThis implementation never fails.")]
                fn as_xml_text(&self) -> Result<Cow<'_, str>, Error> {
                    Ok(Cow::Owned(self.to_string()))
                }
            }
        )+
    }
}

convert_via_fromstr_and_display! {
    u8,
    u16,
    u32,
    u64,
    usize,
    i8,
    i16,
    i32,
    i64,
    isize,
    f32,
    f64,
    core::net::IpAddr,
    core::net::SocketAddr,
}

/// This provides an implementation compliant with xsd::bool.
impl FromXmlText for bool {
    /// Parse a boolean from XML text.
    ///
    /// The values `"1"` and `"true"` are considered true. The values `"0"`
    /// and `"false"` are considered `false`. Any other value is invalid and
    /// will return an error.
    fn from_xml_text(s: String) -> Result<Self, Error> {
        match s.as_str() {
            "1" => "true",
            "0" => "false",
            other => other,
        }
        .parse()
        .map_err(Error::text_parse_error)
    }
}

/// This provides an implementation compliant with xsd::bool.
impl AsXmlText for bool {
    /// Convert a boolean to XML text.
    ///
    /// `true` is converted to `"true"` and `false` is converted to
    /// `"false"`. This implementation never fails.
    fn as_xml_text(&self) -> Result<Cow<'_, str>, Error> {
        match self {
            true => Ok(Cow::Borrowed("true")),
            false => Ok(Cow::Borrowed("false")),
        }
    }
}

impl FromXmlText for String {
    fn from_xml_text(s: String) -> Result<Self, Error> {
        Ok(s)
    }
}

impl AsXmlText for String {
    fn as_xml_text(&self) -> Result<Cow<'_, str>, Error> {
        Ok(Cow::Borrowed(self))
    }
}

/// Represent a way to encode/decode text data into a Rust type.
///
/// This trait can be used in scenarios where implementing [`FromXmlText`]
/// and/or [`AsXmlText`] on a type is not feasible or sensible, such as the
/// following:
///
/// 1. The type originates in a foreign crate, preventing the implementation
///    of foreign traits.
///
/// 2. There is more than one way to convert a value to/from XML.
pub trait TextCodec<T> {
    /// Decode a string value into the type.
    fn decode(&self, s: String) -> Result<T, Error>;

    /// Encode the type as string value.
    ///
    /// If this returns `None`, the string value is not emitted at all.
    fn encode<'x>(&self, value: &'x T) -> Result<Option<Cow<'x, str>>, Error>;
}

/// Text codec which does no transform.
pub struct Plain;

impl TextCodec<String> for Plain {
    fn decode(&self, s: String) -> Result<String, Error> {
        Ok(s)
    }

    fn encode<'x>(&self, value: &'x String) -> Result<Option<Cow<'x, str>>, Error> {
        Ok(Some(Cow::Borrowed(value)))
    }
}

/// Text codec which maps the empty string to `None`.
pub struct EmptyAsNone;

impl TextCodec<Option<String>> for EmptyAsNone {
    fn decode(&self, s: String) -> Result<Option<String>, Error> {
        if s.is_empty() {
            Ok(None)
        } else {
            Ok(Some(s))
        }
    }

    fn encode<'x>(&self, value: &'x Option<String>) -> Result<Option<Cow<'x, str>>, Error> {
        Ok(value
            .as_ref()
            .map(|s| s.as_str())
            .and_then(|s| if s.is_empty() { None } else { Some(s) })
            .map(Cow::Borrowed))
    }
}

/// Text codec transforming text to binary using standard base64.
pub struct Base64;

impl TextCodec<Vec<u8>> for Base64 {
    fn decode(&self, s: String) -> Result<Vec<u8>, Error> {
        StandardBase64Engine
            .decode(s.as_bytes())
            .map_err(Error::text_parse_error)
    }

    fn encode<'x>(&self, value: &'x Vec<u8>) -> Result<Option<Cow<'x, str>>, Error> {
        Ok(Some(Cow::Owned(StandardBase64Engine.encode(value))))
    }
}

/// An instant in time, with timezone, in the `DateTime` profile of XEP-0082.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Timestamp(pub DateTime<FixedOffset>);

impl FromXmlText for Timestamp {
    fn from_xml_text(s: String) -> Result<Self, Error> {
        DateTime::parse_from_rfc3339(&s)
            .map(Timestamp)
            .map_err(Error::text_parse_error)
    }
}

impl AsXmlText for Timestamp {
    fn as_xml_text(&self) -> Result<Cow<'_, str>, Error> {
        Ok(Cow::Owned(self.0.to_rfc3339_opts(SecondsFormat::Secs, true)))
    }
}

/// A calendar date in the `Date` profile of XEP-0082.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Date(pub NaiveDate);

impl FromXmlText for Date {
    fn from_xml_text(s: String) -> Result<Self, Error> {
        NaiveDate::parse_from_str(&s, "%Y-%m-%d")
            .map(Date)
            .map_err(Error::text_parse_error)
    }
}

impl AsXmlText for Date {
    fn as_xml_text(&self) -> Result<Cow<'_, str>, Error> {
        Ok(Cow::Owned(self.0.format("%Y-%m-%d").to_string()))
    }
}

/// A BCP 47 language tag, as used in `xml:lang`.
///
/// Comparison is case-insensitive per BCP 47; the original spelling is
/// preserved for output.
#[derive(Debug, Clone, Eq)]
pub struct LanguageTag(String);

impl LanguageTag {
    /// Return the tag as written.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl PartialEq for LanguageTag {
    fn eq(&self, other: &Self) -> bool {
        self.0.eq_ignore_ascii_case(&other.0)
    }
}

impl FromXmlText for LanguageTag {
    fn from_xml_text(s: String) -> Result<Self, Error> {
        if s.is_empty() {
            return Err(Error::Other("empty language tag"));
        }
        if !s
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-')
        {
            return Err(Error::Other("invalid character in language tag"));
        }
        Ok(LanguageTag(s))
    }
}

impl AsXmlText for LanguageTag {
    fn as_xml_text(&self) -> Result<Cow<'_, str>, Error> {
        Ok(Cow::Borrowed(&self.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bool_canonical_forms() {
        for s in ["1", "true"] {
            assert_eq!(bool::from_xml_text(s.to_owned()).unwrap(), true);
        }
        for s in ["0", "false"] {
            assert_eq!(bool::from_xml_text(s.to_owned()).unwrap(), false);
        }
        assert!(bool::from_xml_text("yes".to_owned()).is_err());
    }

    #[test]
    fn base64_codec() {
        let decoded = Base64.decode("aGVsbG8=".to_owned()).unwrap();
        assert_eq!(decoded, b"hello");
        let encoded = Base64.encode(&decoded).unwrap().unwrap();
        assert_eq!(encoded, "aGVsbG8=");
    }

    #[test]
    fn empty_as_none() {
        assert_eq!(EmptyAsNone.decode(String::new()).unwrap(), None);
        assert_eq!(
            EmptyAsNone.decode("x".to_owned()).unwrap(),
            Some("x".to_owned())
        );
        assert_eq!(EmptyAsNone.encode(&Some(String::new())).unwrap(), None);
    }

    #[test]
    fn timestamp_profile() {
        let ts = Timestamp::from_xml_text("1969-07-21T02:56:15Z".to_owned()).unwrap();
        assert_eq!(ts.as_xml_text().unwrap(), "1969-07-21T02:56:15Z");
        let offset = Timestamp::from_xml_text("1969-07-20T21:56:15-05:00".to_owned()).unwrap();
        assert_eq!(ts, offset);
        assert!(Timestamp::from_xml_text("не дата".to_owned()).is_err());
    }

    #[test]
    fn language_tags_compare_case_insensitively() {
        let a = LanguageTag::from_xml_text("de-DE".to_owned()).unwrap();
        let b = LanguageTag::from_xml_text("de-de".to_owned()).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "de-DE");
        assert!(LanguageTag::from_xml_text("de_DE".to_owned()).is_err());
    }
}
