// Copyright (c) 2024 strix contributors.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Per-client payload class registry.
//!
//! Inbound payload matching and outbound payload admission both resolve
//! through this registry. It is plain data owned by whoever constructs the
//! client; there is no process-global registry.

use std::collections::BTreeSet;

use crate::element::Element;
use crate::error::Error;

/// The stanza kind a payload class is registered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Carrier {
    /// IQ get/set/result payloads.
    Iq,

    /// Message child payloads.
    Message,

    /// Presence child payloads.
    Presence,

    /// Payloads carried inside pubsub event items.
    PubsubEvent,
}

/// Registry binding `(carrier, namespace, local-name)` triples to payload
/// classes.
///
/// Registration is what makes round trips symmetric: a payload which cannot
/// be matched on receive must not be sent either, and attempting to do so
/// fails with [`Error::PayloadNotRegistered`].
#[derive(Debug, Default, Clone)]
pub struct PayloadRegistry {
    classes: BTreeSet<(Carrier, String, String)>,
}

impl PayloadRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a qualified name to a payload class of the given carrier.
    ///
    /// Duplicate registrations are rejected to keep inbound matching
    /// unambiguous.
    pub fn register(&mut self, carrier: Carrier, ns: &str, name: &str) -> Result<(), Error> {
        if !self
            .classes
            .insert((carrier, ns.to_owned(), name.to_owned()))
        {
            return Err(Error::Other("payload class registered twice"));
        }
        Ok(())
    }

    /// Check whether a qualified name is registered for the carrier.
    pub fn is_registered(&self, carrier: Carrier, ns: &str, name: &str) -> bool {
        // BTreeSet<(_, String, String)> cannot be probed with &str keys
        // without allocating; registries are small, so scan instead.
        self.classes
            .iter()
            .any(|(c, n, l)| *c == carrier && n == ns && l == name)
    }

    /// Admission check for an outbound payload.
    pub fn check_outbound(&self, carrier: Carrier, payload: &Element) -> Result<(), Error> {
        if self.is_registered(carrier, payload.ns(), payload.name()) {
            Ok(())
        } else {
            Err(Error::PayloadNotRegistered {
                namespace: payload.ns().to_owned(),
                name: payload.name().to_owned(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outbound_admission() {
        let mut reg = PayloadRegistry::new();
        reg.register(Carrier::Iq, "urn:xmpp:ping", "ping").unwrap();

        let ping = Element::bare("ping", "urn:xmpp:ping");
        assert!(reg.check_outbound(Carrier::Iq, &ping).is_ok());
        // registered for iq only
        match reg.check_outbound(Carrier::Message, &ping) {
            Err(Error::PayloadNotRegistered { namespace, name }) => {
                assert_eq!(namespace, "urn:xmpp:ping");
                assert_eq!(name, "ping");
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn duplicate_registration_rejected() {
        let mut reg = PayloadRegistry::new();
        reg.register(Carrier::Iq, "urn:xmpp:ping", "ping").unwrap();
        assert!(reg.register(Carrier::Iq, "urn:xmpp:ping", "ping").is_err());
    }
}
