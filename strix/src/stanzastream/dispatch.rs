// Copyright (c) 2024 strix contributors.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Message and presence dispatch.
//!
//! Handlers register under a `(type, from)` key where `from` may be a
//! full JID, a bare JID, or absent (wildcard). At most one handler may
//! exist per key; later registrations fail instead of silently replacing
//! the earlier one. Lookup walks from most to least specific: full JID,
//! bare JID, wildcard.

use core::fmt;
use std::collections::HashMap;
use std::hash::Hash;

use strix_stanzas::jid::Jid;
use strix_stanzas::message::{Message, MessageType};
use strix_stanzas::presence::{Presence, PresenceType};

/// Error returned when a handler key is already taken.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerAlreadyRegistered;

impl fmt::Display for HandlerAlreadyRegistered {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a handler is already registered for this key")
    }
}

impl std::error::Error for HandlerAlreadyRegistered {}

/// Generic dispatcher for one stanza kind.
pub struct SimpleStanzaDispatcher<St, Ty> {
    handlers: HashMap<(Option<Ty>, Option<Jid>), Box<dyn FnMut(St) + Send>>,
}

impl<St, Ty: Clone + Eq + Hash> SimpleStanzaDispatcher<St, Ty> {
    /// Create an empty dispatcher.
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register a handler for the given key.
    ///
    /// `from` may be a full JID, a bare JID, or `None` for a wildcard.
    pub fn register(
        &mut self,
        type_: Option<Ty>,
        from: Option<Jid>,
        handler: Box<dyn FnMut(St) + Send>,
    ) -> Result<(), HandlerAlreadyRegistered> {
        let key = (type_, from);
        if self.handlers.contains_key(&key) {
            return Err(HandlerAlreadyRegistered);
        }
        self.handlers.insert(key, handler);
        Ok(())
    }

    /// Remove the handler for the given key.
    pub fn unregister(&mut self, type_: Option<Ty>, from: Option<Jid>) -> bool {
        self.handlers.remove(&(type_, from)).is_some()
    }

    /// Dispatch a stanza; returns it unharmed if no handler matched.
    pub fn dispatch(&mut self, type_: Option<Ty>, from: Option<&Jid>, stanza: St) -> Option<St> {
        // most specific first: full JID, bare JID, wildcard
        if let Some(from) = from {
            let key = (type_.clone(), Some(from.clone()));
            if let Some(handler) = self.handlers.get_mut(&key) {
                handler(stanza);
                return None;
            }
            let bare: Jid = from.to_bare().into();
            let key = (type_.clone(), Some(bare));
            if let Some(handler) = self.handlers.get_mut(&key) {
                handler(stanza);
                return None;
            }
        }
        if let Some(handler) = self.handlers.get_mut(&(type_, None)) {
            handler(stanza);
            return None;
        }
        Some(stanza)
    }
}

impl<St, Ty: Clone + Eq + Hash> Default for SimpleStanzaDispatcher<St, Ty> {
    fn default() -> Self {
        Self::new()
    }
}

/// Dispatcher for inbound messages.
pub type MessageDispatcher = SimpleStanzaDispatcher<Message, MessageType>;

/// Dispatcher for inbound presences.
///
/// The type key is `Option<PresenceType>` where `None` is available
/// presence; a wildcard-type registration is not offered for presence
/// because the type distinguishes semantically unrelated flows.
pub type PresenceDispatcher = SimpleStanzaDispatcher<Presence, PresenceType>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn message_from(from: &str, type_: MessageType) -> Message {
        let mut message = Message::new(None);
        message.from = Some(from.parse().unwrap());
        message.type_ = type_;
        message
    }

    fn counting_handler(counter: &Arc<AtomicUsize>) -> Box<dyn FnMut(Message) + Send> {
        let counter = counter.clone();
        Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn duplicate_registration_fails() {
        let mut dispatcher = MessageDispatcher::new();
        dispatcher
            .register(Some(MessageType::Chat), None, Box::new(|_| ()))
            .unwrap();
        assert_eq!(
            dispatcher.register(Some(MessageType::Chat), None, Box::new(|_| ())),
            Err(HandlerAlreadyRegistered)
        );
    }

    #[test]
    fn full_jid_beats_bare_beats_wildcard() {
        let full = Arc::new(AtomicUsize::new(0));
        let bare = Arc::new(AtomicUsize::new(0));
        let wildcard = Arc::new(AtomicUsize::new(0));

        let mut dispatcher = MessageDispatcher::new();
        dispatcher
            .register(
                Some(MessageType::Chat),
                Some("a@b.example/r".parse().unwrap()),
                counting_handler(&full),
            )
            .unwrap();
        dispatcher
            .register(
                Some(MessageType::Chat),
                Some("a@b.example".parse().unwrap()),
                counting_handler(&bare),
            )
            .unwrap();
        dispatcher
            .register(Some(MessageType::Chat), None, counting_handler(&wildcard))
            .unwrap();

        let message = message_from("a@b.example/r", MessageType::Chat);
        let from = message.from.clone();
        assert!(dispatcher
            .dispatch(Some(MessageType::Chat), from.as_ref(), message)
            .is_none());
        assert_eq!(full.load(Ordering::SeqCst), 1);
        assert_eq!(bare.load(Ordering::SeqCst), 0);

        let message = message_from("a@b.example/other", MessageType::Chat);
        let from = message.from.clone();
        assert!(dispatcher
            .dispatch(Some(MessageType::Chat), from.as_ref(), message)
            .is_none());
        assert_eq!(bare.load(Ordering::SeqCst), 1);

        let message = message_from("stranger@c.example", MessageType::Chat);
        let from = message.from.clone();
        assert!(dispatcher
            .dispatch(Some(MessageType::Chat), from.as_ref(), message)
            .is_none());
        assert_eq!(wildcard.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unmatched_stanza_is_returned() {
        let mut dispatcher = MessageDispatcher::new();
        dispatcher
            .register(Some(MessageType::Chat), None, Box::new(|_| ()))
            .unwrap();
        let message = message_from("a@b.example", MessageType::Headline);
        let from = message.from.clone();
        assert!(dispatcher
            .dispatch(Some(MessageType::Headline), from.as_ref(), message)
            .is_some());
    }

    #[test]
    fn unregister_frees_the_key() {
        let mut dispatcher = MessageDispatcher::new();
        dispatcher
            .register(Some(MessageType::Chat), None, Box::new(|_| ()))
            .unwrap();
        assert!(dispatcher.unregister(Some(MessageType::Chat), None));
        assert!(dispatcher
            .register(Some(MessageType::Chat), None, Box::new(|_| ()))
            .is_ok());
    }
}
