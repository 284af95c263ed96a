// Copyright (c) 2024 strix contributors.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! XML namespace constants used by the protocol definitions.

/// RFC 6120: the stream framing namespace, bound to the `stream` prefix.
pub const STREAM: &str = "http://etherx.jabber.org/streams";

/// RFC 6120: default namespace of client-to-server streams.
pub const JABBER_CLIENT: &str = "jabber:client";

/// RFC 6120: stanza error conditions.
pub const XMPP_STANZAS: &str = "urn:ietf:params:xml:ns:xmpp-stanzas";

/// RFC 6120: stream error conditions.
pub const XMPP_STREAMS: &str = "urn:ietf:params:xml:ns:xmpp-streams";

/// RFC 6120: STARTTLS negotiation.
pub const TLS: &str = "urn:ietf:params:xml:ns:xmpp-tls";

/// RFC 6120: SASL negotiation.
pub const SASL: &str = "urn:ietf:params:xml:ns:xmpp-sasl";

/// RFC 6120: resource binding.
pub const BIND: &str = "urn:ietf:params:xml:ns:xmpp-bind";

/// RFC 3921: legacy session establishment.
pub const SESSION: &str = "urn:ietf:params:xml:ns:xmpp-session";

/// XEP-0198: Stream Management.
pub const SM: &str = "urn:xmpp:sm:3";

/// XEP-0199: XMPP Ping.
pub const PING: &str = "urn:xmpp:ping";

/// XEP-0030: Service Discovery, the `info` part.
pub const DISCO_INFO: &str = "http://jabber.org/protocol/disco#info";

/// XEP-0030: Service Discovery, the `items` part.
pub const DISCO_ITEMS: &str = "http://jabber.org/protocol/disco#items";

/// RFC 6121: roster management.
pub const ROSTER: &str = "jabber:iq:roster";

/// XEP-0203: Delayed Delivery.
pub const DELAY: &str = "urn:xmpp:delay";
