// Copyright (c) 2024 strix contributors.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
/*!
# Stanza and nonza definitions

Typed representations of the XML vocabulary spoken on a client-to-server
XMPP stream: the three stanza kinds, the negotiation nonzas (STARTTLS,
SASL, resource binding, stream management) and the protocol extensions the
built-in services need. Each type converts to and from
[`Element`][`strix_schema::Element`] via the schema layer.
*/

pub mod bind;
pub mod disco;
pub mod iq;
pub mod jid;
pub mod message;
pub mod ns;
pub mod ping;
pub mod presence;
pub mod roster;
pub mod sasl;
pub mod sm;
pub mod stanza_error;
pub mod starttls;
pub mod stream_error;
pub mod stream_features;

pub use strix_schema as schema;
pub use strix_schema::{Element, Error, FromElementError};
