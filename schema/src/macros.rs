// Copyright (c) 2024 strix contributors.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Declarative schema macros.
//!
//! These macros are how element classes describe their wire schema: a
//! [`generate_element!`] invocation lists the attribute, child and text
//! descriptors of a class and expands to the record type together with its
//! `TryFrom<Element>` (parse) and `Into<Element>` (serialise) conversions.
//! [`generate_attribute!`] builds enumeration types for attribute values.
//!
//! Unknown attributes and children are dropped by invocations of
//! [`generate_element!`]; classes with a `Fail` or `Preserve` policy
//! implement their conversions by hand using
//! [`UnknownAttributePolicy`][`crate::policy::UnknownAttributePolicy`] and
//! [`UnknownChildPolicy`][`crate::policy::UnknownChildPolicy`].

/// Extract an attribute from an element, applying the descriptor kind.
///
/// Kinds: `Required`, `Option`, `OptionEmpty` (empty string counts as
/// absent), `Default` (substitute `Default::default()` when absent) and
/// `ErroneousAsAbsent` (parse failures count as absent).
#[macro_export]
macro_rules! get_attr {
    ($elem:ident, $attr:tt, $type:tt) => {
        $crate::get_attr!(
            $elem,
            $attr,
            $type,
            value,
            value
                .parse()
                .map_err($crate::error::Error::text_parse_error)?
        )
    };
    ($elem:ident, $attr:tt, OptionEmpty, $value:ident, $func:expr) => {
        match $elem.attr($attr) {
            Some("") => None,
            Some($value) => Some($func),
            None => None,
        }
    };
    ($elem:ident, $attr:tt, Option, $value:ident, $func:expr) => {
        match $elem.attr($attr) {
            Some($value) => Some($func),
            None => None,
        }
    };
    ($elem:ident, $attr:tt, ErroneousAsAbsent, $value:ident, $func:expr) => {
        match $elem.attr($attr) {
            Some($value) => (|| -> Result<_, $crate::error::Error> { Ok($func) })().ok(),
            None => None,
        }
    };
    ($elem:ident, $attr:tt, Required, $value:ident, $func:expr) => {
        match $elem.attr($attr) {
            Some($value) => $func,
            None => {
                return Err($crate::error::Error::Other(
                    concat!("Required attribute '", $attr, "' missing."),
                )
                .into());
            }
        }
    };
    ($elem:ident, $attr:tt, Default, $value:ident, $func:expr) => {
        match $elem.attr($attr) {
            Some($value) => $func,
            None => ::std::default::Default::default(),
        }
    };
}

/// Check that an element matches the class qname, or bail out with a
/// `Mismatch` carrying the element back to the caller.
#[macro_export]
macro_rules! check_self {
    ($elem:ident, $name:tt, $ns:expr) => {
        if !$elem.is($name, $ns) {
            return Err($crate::error::FromElementError::Mismatch($elem));
        }
    };
}

/// Fail parsing if the element has any child element.
#[macro_export]
macro_rules! check_no_children {
    ($elem:ident, $name:tt) => {
        if $elem.children().next().is_some() {
            return Err($crate::error::Error::Other(concat!(
                "Unknown child in ",
                $name,
                " element."
            ))
            .into());
        }
    };
}

/// Fail parsing if the element carries attributes not listed.
#[macro_export]
macro_rules! check_no_unknown_attributes {
    ($elem:ident, $name:tt, [$($attr:tt),*]) => {
        for (_attr, _) in $elem.attrs() {
            $(
                if _attr == $attr {
                    continue;
                }
            )*
            return Err($crate::error::Error::Other(
                concat!("Unknown attribute in ", $name, " element."),
            )
            .into());
        }
    };
}

/// Generate an enumeration type for an attribute value.
///
/// Three forms exist: a plain enumeration over string values, an
/// enumeration with a designated default member (which is omitted from
/// serialised output), and a boolean represented as `true|1` / `false|0`.
#[macro_export]
macro_rules! generate_attribute {
    ($(#[$meta:meta])* $elem:ident, $name:tt, {$($(#[$a_meta:meta])* $a:ident => $b:tt),+$(,)?}) => (
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash)]
        pub enum $elem {
            $(
                $(#[$a_meta])*
                $a
            ),+
        }
        impl ::std::str::FromStr for $elem {
            type Err = $crate::error::Error;
            fn from_str(s: &str) -> Result<$elem, $crate::error::Error> {
                Ok(match s {
                    $($b => $elem::$a),+,
                    _ => return Err($crate::error::Error::Other(concat!("Unknown value for '", $name, "' attribute."))),
                })
            }
        }
        impl $crate::text::FromXmlText for $elem {
            fn from_xml_text(s: String) -> Result<$elem, $crate::error::Error> {
                s.parse()
            }
        }
        impl ::std::fmt::Display for $elem {
            fn fmt(&self, fmt: &mut ::std::fmt::Formatter) -> Result<(), ::std::fmt::Error> {
                write!(fmt, "{}", match self {
                    $($elem::$a => $b),+
                })
            }
        }
        impl $crate::text::AsXmlText for $elem {
            fn as_xml_text(&self) -> Result<::std::borrow::Cow<'_, str>, $crate::error::Error> {
                match self {
                    $(
                        $elem::$a => Ok(::std::borrow::Cow::Borrowed($b))
                    ),+
                }
            }
        }
        impl $crate::IntoAttributeValue for $elem {
            fn into_attribute_value(self) -> Option<String> {
                Some(String::from(match self {
                    $($elem::$a => $b),+
                }))
            }
        }
    );
    ($(#[$meta:meta])* $elem:ident, $name:tt, {$($(#[$a_meta:meta])* $a:ident => $b:tt),+$(,)?}, Default = $default:ident) => (
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash)]
        pub enum $elem {
            $(
                $(#[$a_meta])*
                $a
            ),+
        }
        impl ::std::str::FromStr for $elem {
            type Err = $crate::error::Error;
            fn from_str(s: &str) -> Result<$elem, $crate::error::Error> {
                Ok(match s {
                    $($b => $elem::$a),+,
                    _ => return Err($crate::error::Error::Other(concat!("Unknown value for '", $name, "' attribute."))),
                })
            }
        }
        impl $crate::text::FromXmlText for $elem {
            fn from_xml_text(s: String) -> Result<$elem, $crate::error::Error> {
                s.parse()
            }
        }
        impl ::std::fmt::Display for $elem {
            fn fmt(&self, fmt: &mut ::std::fmt::Formatter) -> Result<(), ::std::fmt::Error> {
                write!(fmt, "{}", match self {
                    $($elem::$a => $b),+
                })
            }
        }
        impl $crate::text::AsXmlText for $elem {
            fn as_xml_text(&self) -> Result<::std::borrow::Cow<'_, str>, $crate::error::Error> {
                Ok(::std::borrow::Cow::Borrowed(match self {
                    $($elem::$a => $b),+
                }))
            }

            #[allow(unreachable_patterns)]
            fn as_optional_xml_text(&self) -> Result<Option<::std::borrow::Cow<'_, str>>, $crate::error::Error> {
                Ok(Some(::std::borrow::Cow::Borrowed(match self {
                    $elem::$default => return Ok(None),
                    $($elem::$a => $b),+
                })))
            }
        }
        impl $crate::IntoAttributeValue for $elem {
            #[allow(unreachable_patterns)]
            fn into_attribute_value(self) -> Option<String> {
                Some(String::from(match self {
                    $elem::$default => return None,
                    $($elem::$a => $b),+
                }))
            }
        }
        impl ::std::default::Default for $elem {
            fn default() -> $elem {
                $elem::$default
            }
        }
    );
    ($(#[$meta:meta])* $elem:ident, $name:tt, bool) => (
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $elem {
            /// True value, represented by either 'true' or '1'.
            True,
            /// False value, represented by either 'false' or '0'.
            False,
        }
        impl ::std::str::FromStr for $elem {
            type Err = $crate::error::Error;
            fn from_str(s: &str) -> Result<Self, $crate::error::Error> {
                Ok(match s {
                    "true" | "1" => $elem::True,
                    "false" | "0" => $elem::False,
                    _ => return Err($crate::error::Error::Other(concat!("Unknown value for '", $name, "' attribute."))),
                })
            }
        }
        impl $crate::text::FromXmlText for $elem {
            fn from_xml_text(s: String) -> Result<$elem, $crate::error::Error> {
                s.parse()
            }
        }
        impl $crate::text::AsXmlText for $elem {
            fn as_xml_text(&self) -> Result<::std::borrow::Cow<'_, str>, $crate::error::Error> {
                match self {
                    Self::True => Ok(::std::borrow::Cow::Borrowed("true")),
                    Self::False => Ok(::std::borrow::Cow::Borrowed("false")),
                }
            }

            fn as_optional_xml_text(&self) -> Result<Option<::std::borrow::Cow<'_, str>>, $crate::error::Error> {
                match self {
                    Self::True => Ok(Some(::std::borrow::Cow::Borrowed("true"))),
                    Self::False => Ok(None),
                }
            }
        }
        impl $crate::IntoAttributeValue for $elem {
            fn into_attribute_value(self) -> Option<String> {
                match self {
                    $elem::True => Some(String::from("true")),
                    $elem::False => None,
                }
            }
        }
        impl ::std::default::Default for $elem {
            fn default() -> $elem {
                $elem::False
            }
        }
    );
}

/// Generate a newtype wrapper around `String` used for opaque protocol
/// identifiers.
#[macro_export]
macro_rules! generate_id {
    ($(#[$meta:meta])* $elem:ident) => (
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash)]
        pub struct $elem(pub String);
        impl ::std::str::FromStr for $elem {
            type Err = $crate::error::Error;
            fn from_str(s: &str) -> Result<$elem, $crate::error::Error> {
                Ok($elem(String::from(s)))
            }
        }
        impl $crate::text::FromXmlText for $elem {
            fn from_xml_text(s: String) -> Result<$elem, $crate::error::Error> {
                Ok(Self(s))
            }
        }
        impl $crate::text::AsXmlText for $elem {
            fn as_xml_text(&self) -> Result<::std::borrow::Cow<'_, str>, $crate::error::Error> {
                Ok(::std::borrow::Cow::Borrowed(self.0.as_str()))
            }
        }
        impl $crate::IntoAttributeValue for $elem {
            fn into_attribute_value(self) -> Option<String> {
                Some(self.0)
            }
        }
    );
}

#[doc(hidden)]
#[macro_export]
macro_rules! __child_init {
    (Option) => {
        None
    };
    (Required) => {
        None
    };
    (Vec) => {
        Vec::new()
    };
}

#[doc(hidden)]
#[macro_export]
macro_rules! __child_push {
    (Option, $acc:ident, $value:expr, $name:tt) => {
        if $acc.is_some() {
            return Err($crate::error::Error::Other(concat!(
                "Element ",
                $name,
                " must not have more than one such child."
            ))
            .into());
        } else {
            $acc = Some($value);
        }
    };
    (Required, $acc:ident, $value:expr, $name:tt) => {
        $crate::__child_push!(Option, $acc, $value, $name)
    };
    (Vec, $acc:ident, $value:expr, $name:tt) => {
        $acc.push($value);
    };
}

#[doc(hidden)]
#[macro_export]
macro_rules! __child_finish {
    (Option, $acc:ident, $name:tt) => {
        $acc
    };
    (Required, $acc:ident, $name:tt) => {
        match $acc {
            Some(value) => value,
            None => {
                return Err($crate::error::Error::Other(concat!(
                    "Missing child in ",
                    $name,
                    " element."
                ))
                .into());
            }
        }
    };
    (Vec, $acc:ident, $name:tt) => {
        $acc
    };
}

#[doc(hidden)]
#[macro_export]
macro_rules! __child_emit {
    (Option, $builder:ident, $value:expr) => {
        if let Some(child) = $value {
            $builder = $builder.append($crate::Element::from(child));
        }
    };
    (Required, $builder:ident, $value:expr) => {
        $builder = $builder.append($crate::Element::from($value));
    };
    (Vec, $builder:ident, $value:expr) => {
        for child in $value {
            $builder = $builder.append($crate::Element::from(child));
        }
    };
}

/// Generate an element class from its wire schema.
///
/// The invocation lists the attribute descriptors (kind, type and qname of
/// each attribute), the child descriptors (cardinality, field type and
/// child qname) and optionally a text descriptor with its codec. The macro
/// expands to the record type plus `TryFrom<Element>` and `Into<Element>`
/// implementations. Unknown attributes and children are dropped.
#[macro_export]
macro_rules! generate_element {
    ($(#[$meta:meta])* $elem:ident, $name:tt, $ns:expr) => (
        $crate::generate_element!($(#[$meta])* $elem, $name, $ns, attributes: [], children: []);
    );
    ($(#[$meta:meta])* $elem:ident, $name:tt, $ns:expr, attributes: [$($attrs:tt)*]) => (
        $crate::generate_element!($(#[$meta])* $elem, $name, $ns, attributes: [$($attrs)*], children: []);
    );
    ($(#[$meta:meta])* $elem:ident, $name:tt, $ns:expr, children: [$($children:tt)*]) => (
        $crate::generate_element!($(#[$meta])* $elem, $name, $ns, attributes: [], children: [$($children)*]);
    );
    ($(#[$meta:meta])* $elem:ident, $name:tt, $ns:expr, text: ($(#[$text_meta:meta])* $text_ident:ident: $text_type:ty, $codec:expr)) => (
        $crate::generate_element!($(#[$meta])* $elem, $name, $ns, attributes: [], children: [], text: ($(#[$text_meta])* $text_ident: $text_type, $codec));
    );
    ($(#[$meta:meta])* $elem:ident, $name:tt, $ns:expr, attributes: [$($attrs:tt)*], text: ($(#[$text_meta:meta])* $text_ident:ident: $text_type:ty, $codec:expr)) => (
        $crate::generate_element!($(#[$meta])* $elem, $name, $ns, attributes: [$($attrs)*], children: [], text: ($(#[$text_meta])* $text_ident: $text_type, $codec));
    );
    ($(#[$meta:meta])* $elem:ident, $name:tt, $ns:expr,
     attributes: [$($(#[$attr_meta:meta])* $attr_ident:ident: $attr_kind:tt<$attr_type:ty> = $attr_name:tt),*$(,)?],
     children: [$($(#[$child_meta:meta])* $child_ident:ident: $child_kind:tt<$child_type:ty> = ($child_name:tt, $child_ns:expr)),*$(,)?]
     $(, text: ($(#[$text_meta:meta])* $text_ident:ident: $text_type:ty, $codec:expr))?
    ) => (
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq)]
        pub struct $elem {
            $(
                $(#[$attr_meta])*
                pub $attr_ident: $crate::__attr_field_type!($attr_kind<$attr_type>),
            )*
            $(
                $(#[$child_meta])*
                pub $child_ident: $crate::__child_field_type!($child_kind<$child_type>),
            )*
            $(
                $(#[$text_meta])*
                pub $text_ident: $text_type,
            )*
        }

        impl ::std::convert::TryFrom<$crate::Element> for $elem {
            type Error = $crate::error::FromElementError;

            #[allow(unused_mut, unused_variables)]
            fn try_from(elem: $crate::Element) -> Result<$elem, $crate::error::FromElementError> {
                $crate::check_self!(elem, $name, $ns);
                $(
                    let mut $child_ident = $crate::__child_init!($child_kind);
                )*
                for child in elem.children() {
                    $(
                        if child.is($child_name, $child_ns) {
                            let parsed = <$child_type as ::std::convert::TryFrom<$crate::Element>>::try_from(child.clone())
                                .map_err($crate::error::Error::from)?;
                            $crate::__child_push!($child_kind, $child_ident, parsed, $name);
                            continue;
                        }
                    )*
                    // unknown children are dropped
                }
                Ok($elem {
                    $(
                        $attr_ident: $crate::get_attr!(elem, $attr_name, $attr_kind),
                    )*
                    $(
                        $child_ident: $crate::__child_finish!($child_kind, $child_ident, $name),
                    )*
                    $(
                        $text_ident: $crate::text::TextCodec::<$text_type>::decode(&$codec, elem.text())?,
                    )*
                })
            }
        }

        impl From<$elem> for $crate::Element {
            #[allow(unused_mut)]
            fn from(elem: $elem) -> $crate::Element {
                let mut builder = $crate::Element::builder($name, $ns)
                    $(
                        .attr($attr_name, elem.$attr_ident)
                    )*;
                $(
                    $crate::__child_emit!($child_kind, builder, elem.$child_ident);
                )*
                $(
                    match $crate::text::TextCodec::<$text_type>::encode(&$codec, &elem.$text_ident) {
                        Ok(Some(text)) => {
                            builder = builder.append(text.into_owned());
                        }
                        // Never-failing codecs are the norm; a codec error
                        // here means the value was unrepresentable and the
                        // element is emitted without text.
                        Ok(None) | Err(_) => (),
                    }
                )*
                builder.build()
            }
        }
    );
}

#[doc(hidden)]
#[macro_export]
macro_rules! __attr_field_type {
    (Option<$t:ty>) => { Option<$t> };
    (OptionEmpty<$t:ty>) => { Option<$t> };
    (ErroneousAsAbsent<$t:ty>) => { Option<$t> };
    (Required<$t:ty>) => { $t };
    (Default<$t:ty>) => { $t };
}

#[doc(hidden)]
#[macro_export]
macro_rules! __child_field_type {
    (Option<$t:ty>) => { Option<$t> };
    (Required<$t:ty>) => { $t };
    (Vec<$t:ty>) => { Vec<$t> };
}

#[cfg(test)]
mod tests {
    use crate::text::Plain;
    use crate::Element;

    generate_attribute!(
        /// Whether the subject opted in.
        OptIn,
        "opt-in",
        bool
    );

    generate_attribute!(
        /// Delivery urgency.
        Urgency, "urgency", {
            /// Deliver as soon as possible.
            Now => "now",
            /// Deliver in the next batch.
            Batched => "batched",
        }, Default = Batched
    );

    generate_element!(
        /// A note with a bounded set of attributes and a child list.
        Note, "note", "urn:example:notes",
        attributes: [
            /// Sequence number.
            seq: Required<u32> = "seq",
            /// Optional author.
            author: Option<String> = "author",
            /// Urgency; absent means batched.
            urgency: Default<Urgency> = "urgency",
        ],
        children: [
            attachments: Vec<Attachment> = ("attachment", "urn:example:notes")
        ],
        text: (body: String, Plain)
    );

    generate_element!(
        /// An attachment reference.
        Attachment, "attachment", "urn:example:notes",
        attributes: [
            name: Required<String> = "name",
        ]
    );

    #[test]
    fn parse_full() {
        let elem: Element = "<note xmlns='urn:example:notes' seq='7' urgency='now'><attachment name='a.txt'/>body text</note>"
            .parse()
            .unwrap();
        let note = Note::try_from(elem).unwrap();
        assert_eq!(note.seq, 7);
        assert_eq!(note.author, None);
        assert_eq!(note.urgency, Urgency::Now);
        assert_eq!(note.attachments.len(), 1);
        assert_eq!(note.attachments[0].name, "a.txt");
        assert_eq!(note.body, "body text");
    }

    #[test]
    fn missing_required_attribute() {
        let elem: Element = "<note xmlns='urn:example:notes'/>".parse().unwrap();
        assert!(Note::try_from(elem).is_err());
    }

    #[test]
    fn unknown_content_is_dropped() {
        let elem: Element =
            "<note xmlns='urn:example:notes' seq='1' stray='x'><other xmlns='elsewhere'/></note>"
                .parse()
                .unwrap();
        let note = Note::try_from(elem).unwrap();
        assert_eq!(note.seq, 1);
        assert_eq!(note.attachments.len(), 0);
    }

    #[test]
    fn default_attribute_omitted_on_output() {
        let note = Note {
            seq: 3,
            author: Some("alice".to_owned()),
            urgency: Urgency::Batched,
            attachments: vec![],
            body: String::new(),
        };
        let elem: Element = note.into();
        assert_eq!(elem.attr("seq"), Some("3"));
        assert_eq!(elem.attr("author"), Some("alice"));
        // default value stays off the wire
        assert_eq!(elem.attr("urgency"), None);
    }

    #[test]
    fn round_trip() {
        let elem: Element =
            "<note xmlns='urn:example:notes' seq='9' author='bob'><attachment name='x'/>hi</note>"
                .parse()
                .unwrap();
        let note = Note::try_from(elem.clone()).unwrap();
        let back: Element = note.into();
        let reparsed = Note::try_from(back).unwrap();
        let original = Note::try_from(elem).unwrap();
        assert_eq!(reparsed, original);
    }

    #[test]
    fn mismatch_returns_element() {
        let elem: Element = "<memo xmlns='urn:example:notes' seq='1'/>".parse().unwrap();
        match Note::try_from(elem) {
            Err(crate::error::FromElementError::Mismatch(el)) => {
                assert_eq!(el.name(), "memo");
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn bool_attribute() {
        use core::str::FromStr;
        assert_eq!(OptIn::from_str("1").unwrap(), OptIn::True);
        assert_eq!(OptIn::from_str("false").unwrap(), OptIn::False);
        assert!(OptIn::from_str("maybe").is_err());
    }
}
