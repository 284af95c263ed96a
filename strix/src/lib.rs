// Copyright (c) 2024 strix contributors.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
/*!
# strix — a resilient XMPP client engine

The crate is layered from the wire up:

- [`xmlstream`]: RFC 6120 XML stream framing over any transport, with
  liveness timeouts and restartability.
- [`connect`]: DNS SRV discovery (including XEP-0368 direct TLS), TLS
  with pinning, STARTTLS.
- [`sasl`]: client-side SASL mechanisms (SCRAM with channel binding,
  PLAIN, ANONYMOUS, EXTERNAL).
- [`stanzastream`]: the reliability layer — send queue, XEP-0198 stream
  management with resumption and retransmission, IQ correlation, filter
  chains and dispatch.
- [`client`]: reconnect supervision, session establishment and the
  service container for protocol extensions.
*/

pub mod client;
pub mod connect;
pub mod error;
pub mod sasl;
pub mod stanza;
pub mod stanzastream;
pub mod xmlstream;

pub use strix_schema as schema;
pub use strix_stanzas as stanzas;

pub use strix_stanzas::jid;

pub use client::{Client, ClientEvent, Config, Service, ServiceHandle};
pub use error::Error;
pub use stanza::{IdGenerator, Stanza, XmppStreamElement};
pub use stanzastream::{Event, StanzaStage, StanzaState, StanzaStream, StanzaToken, StreamEvent};
pub use xmlstream::Timeouts;
