// Copyright (c) 2024 strix contributors.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
/*!
# Declarative XML schema layer

This crate provides the schema machinery underneath the stanza definitions:
a namespace-resolved [`Element`] tree, character-data type conversions,
composable validators, unknown-content policies and the macro layer which
turns a wire-schema description into a typed record with `TryFrom<Element>`
and `Into<Element>` conversions.

The crate is deliberately free of any I/O or protocol knowledge; it only
knows how to move between XML subtrees and typed values.
*/

pub mod error;
#[macro_use]
pub mod macros;
pub mod element;
pub mod item;
pub mod policy;
pub mod registry;
pub mod text;
pub mod validate;

#[doc(hidden)]
pub mod exports {
    pub use rxml;
}

pub use element::{Element, ElementBuilder, IntoAttributeValue, Node, TreeBuilder};
pub use error::{Error, FromElementError};
pub use item::Item;
pub use registry::{Carrier, PayloadRegistry};

/// Attempt to transform an [`Element`] into a typed value, returning the
/// element unharmed if its header does not match the expectations of `T`.
pub fn try_from_element<T>(from: Element) -> Result<T, FromElementError>
where
    T: TryFrom<Element, Error = FromElementError>,
{
    T::try_from(from)
}
