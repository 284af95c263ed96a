// Copyright (c) 2024 strix contributors.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Stanza filter chains.
//!
//! Each direction has two chains: the service chain (run closest to the
//! wire) and the application chain. Inbound stanzas pass the service
//! chain first, outbound stanzas the application chain first. A filter
//! may mutate the stanza or drop it by returning `None`.

use crate::stanza::Stanza;

/// A filter function: returns the (possibly modified) stanza, or `None`
/// to drop it.
pub type FilterFn = Box<dyn FnMut(Stanza) -> Option<Stanza> + Send>;

/// Token identifying a registered filter, for deregistration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilterToken(u64);

struct FilterEntry {
    order: i32,
    seq: u64,
    token: FilterToken,
    func: FilterFn,
}

/// An ordered chain of stanza filters.
///
/// Filters run in ascending `order`; ties are broken by registration
/// sequence. The ordering is fixed at registration time, there is no
/// runtime re-ordering.
#[derive(Default)]
pub struct FilterChain {
    entries: Vec<FilterEntry>,
    next_seq: u64,
}

impl FilterChain {
    /// Create an empty chain.
    pub fn new() -> FilterChain {
        FilterChain::default()
    }

    /// Register a filter at the given order position.
    pub fn register(&mut self, order: i32, func: FilterFn) -> FilterToken {
        let seq = self.next_seq;
        self.next_seq += 1;
        let token = FilterToken(seq);
        let entry = FilterEntry {
            order,
            seq,
            token,
            func,
        };
        let position = self
            .entries
            .iter()
            .position(|other| (other.order, other.seq) > (order, seq))
            .unwrap_or(self.entries.len());
        self.entries.insert(position, entry);
        token
    }

    /// Remove a previously registered filter.
    ///
    /// Returns false if the token does not name a registered filter.
    pub fn unregister(&mut self, token: FilterToken) -> bool {
        let before = self.entries.len();
        self.entries.retain(|entry| entry.token != token);
        self.entries.len() != before
    }

    /// Run a stanza through the chain.
    pub fn apply(&mut self, stanza: Stanza) -> Option<Stanza> {
        let mut stanza = stanza;
        for entry in self.entries.iter_mut() {
            stanza = (entry.func)(stanza)?;
        }
        Some(stanza)
    }
}

/// The filter chains of one direction.
#[derive(Default)]
pub struct DirectionFilters {
    /// Chain reserved for services; runs closest to the wire.
    pub service: FilterChain,

    /// Chain for application code.
    pub app: FilterChain,
}

impl DirectionFilters {
    fn new() -> DirectionFilters {
        DirectionFilters::default()
    }

    /// Run a stanza through both chains in inbound order (service first).
    pub fn apply_inbound(&mut self, stanza: Stanza) -> Option<Stanza> {
        let stanza = self.service.apply(stanza)?;
        self.app.apply(stanza)
    }

    /// Run a stanza through both chains in outbound order (application
    /// first).
    pub fn apply_outbound(&mut self, stanza: Stanza) -> Option<Stanza> {
        let stanza = self.app.apply(stanza)?;
        self.service.apply(stanza)
    }
}

/// Filter chains for both directions.
#[derive(Default)]
pub struct StreamFilters {
    /// Filters applied to stanzas arriving from the stream.
    pub inbound: DirectionFilters,

    /// Filters applied to stanzas before serialisation.
    pub outbound: DirectionFilters,
}

impl StreamFilters {
    /// Create empty filter chains.
    pub fn new() -> StreamFilters {
        StreamFilters {
            inbound: DirectionFilters::new(),
            outbound: DirectionFilters::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use strix_stanzas::message::Message;

    fn message(body: &str) -> Stanza {
        Stanza::Message(Message::new(None).with_body(body))
    }

    fn body_of(stanza: &Stanza) -> String {
        match stanza {
            Stanza::Message(message) => message.bodies.get("").cloned().unwrap_or_default(),
            _ => panic!("not a message"),
        }
    }

    #[test]
    fn filters_run_in_order() {
        let mut chain = FilterChain::new();
        chain.register(10, Box::new(|stanza| {
            let Stanza::Message(mut message) = stanza else {
                return Some(stanza);
            };
            let body = message.bodies.remove("").unwrap_or_default();
            message.bodies.insert(String::new(), format!("{}-second", body));
            Some(Stanza::Message(message))
        }));
        chain.register(0, Box::new(|stanza| {
            let Stanza::Message(mut message) = stanza else {
                return Some(stanza);
            };
            let body = message.bodies.remove("").unwrap_or_default();
            message.bodies.insert(String::new(), format!("{}-first", body));
            Some(Stanza::Message(message))
        }));
        let result = chain.apply(message("x")).unwrap();
        assert_eq!(body_of(&result), "x-first-second");
    }

    #[test]
    fn equal_order_breaks_ties_by_registration() {
        let mut chain = FilterChain::new();
        chain.register(0, Box::new(|stanza| {
            let Stanza::Message(mut message) = stanza else {
                return Some(stanza);
            };
            let body = message.bodies.remove("").unwrap_or_default();
            message.bodies.insert(String::new(), format!("{}a", body));
            Some(Stanza::Message(message))
        }));
        chain.register(0, Box::new(|stanza| {
            let Stanza::Message(mut message) = stanza else {
                return Some(stanza);
            };
            let body = message.bodies.remove("").unwrap_or_default();
            message.bodies.insert(String::new(), format!("{}b", body));
            Some(Stanza::Message(message))
        }));
        let result = chain.apply(message("")).unwrap();
        assert_eq!(body_of(&result), "ab");
    }

    #[test]
    fn drop_sentinel_stops_the_chain() {
        let mut chain = FilterChain::new();
        chain.register(0, Box::new(|_| None));
        chain.register(1, Box::new(|_| panic!("must not run after a drop")));
        assert!(chain.apply(message("x")).is_none());
    }

    #[test]
    fn unregister_removes_filter() {
        let mut chain = FilterChain::new();
        let token = chain.register(0, Box::new(|_| None));
        assert!(chain.unregister(token));
        assert!(!chain.unregister(token));
        assert!(chain.apply(message("x")).is_some());
    }

    #[test]
    fn direction_order_service_vs_app() {
        let mut filters = DirectionFilters::default();
        filters.service.register(0, Box::new(|stanza| {
            let Stanza::Message(mut message) = stanza else {
                return Some(stanza);
            };
            let body = message.bodies.remove("").unwrap_or_default();
            message.bodies.insert(String::new(), format!("{}s", body));
            Some(Stanza::Message(message))
        }));
        filters.app.register(0, Box::new(|stanza| {
            let Stanza::Message(mut message) = stanza else {
                return Some(stanza);
            };
            let body = message.bodies.remove("").unwrap_or_default();
            message.bodies.insert(String::new(), format!("{}p", body));
            Some(Stanza::Message(message))
        }));
        let inbound = filters.apply_inbound(message("")).unwrap();
        assert_eq!(body_of(&inbound), "sp");
        let outbound = filters.apply_outbound(message("")).unwrap();
        assert_eq!(body_of(&outbound), "ps");
    }
}
