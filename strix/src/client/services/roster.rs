// Copyright (c) 2024 strix contributors.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! RFC 6121 roster tracking.
//!
//! Keeps a local copy of the roster, applies pushes from the server and
//! offers the fetch/set operations.

use core::any::Any;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use strix_schema::{Element, FromElementError};
use strix_stanzas::jid::Jid;
use strix_stanzas::ns;
use strix_stanzas::roster::{Item, Roster, Subscription};

use crate::client::{ClientEvent, Service, ServiceHandle};
use crate::error::{Error, ProtocolError};
use crate::stanzastream::{IqReply, IqRequest, IqRequestHandler, IqRequestKind, IqResponse};

type RosterMap = BTreeMap<Jid, Item>;

/// Roster service: local mirror plus fetch/update operations.
pub struct RosterService {
    handle: ServiceHandle,
    entries: Arc<Mutex<RosterMap>>,
    ver: Arc<Mutex<Option<String>>>,
}

fn apply_items(entries: &mut RosterMap, items: Vec<Item>) {
    for item in items {
        if item.subscription == Subscription::Remove {
            entries.remove(&item.jid);
        } else {
            entries.insert(item.jid.clone(), item);
        }
    }
}

impl RosterService {
    /// Fetch the roster from the server and replace the local mirror.
    pub async fn fetch(&self) -> Result<Vec<Item>, Error> {
        let query: Element = Roster {
            ver: self.ver.lock().unwrap().clone(),
            items: vec![],
        }
        .into();
        let token = self.handle.send_iq(None, IqRequest::Get(query)).await?;
        match token.await {
            Ok(IqResponse::Result(Some(payload))) => {
                let roster = Roster::try_from(payload)
                    .map_err(|e: FromElementError| ProtocolError::Schema(e.into()))?;
                let mut entries = self.entries.lock().unwrap();
                entries.clear();
                apply_items(&mut entries, roster.items);
                *self.ver.lock().unwrap() = roster.ver;
                Ok(entries.values().cloned().collect())
            }
            // empty result: the roster did not change relative to `ver`
            Ok(IqResponse::Result(None)) => {
                Ok(self.entries.lock().unwrap().values().cloned().collect())
            }
            Ok(IqResponse::Error(error)) => Err(Error::Stanza(error)),
            Err(_) => Err(Error::Disconnected),
        }
    }

    /// Add or update a roster entry.
    pub async fn set_entry(&self, item: Item) -> Result<(), Error> {
        let query: Element = Roster {
            ver: None,
            items: vec![item],
        }
        .into();
        let token = self.handle.send_iq(None, IqRequest::Set(query)).await?;
        match token.await {
            Ok(IqResponse::Result(_)) => Ok(()),
            Ok(IqResponse::Error(error)) => Err(Error::Stanza(error)),
            Err(_) => Err(Error::Disconnected),
        }
    }

    /// Remove a roster entry.
    pub async fn remove_entry(&self, jid: Jid) -> Result<(), Error> {
        self.set_entry(Item {
            jid,
            name: None,
            subscription: Subscription::Remove,
            ask: false,
            groups: vec![],
        })
        .await
    }

    /// The current local mirror of the roster.
    pub fn entries(&self) -> Vec<Item> {
        self.entries.lock().unwrap().values().cloned().collect()
    }
}

impl Service for RosterService {
    fn attach(handle: &ServiceHandle) -> Result<Self, Error> {
        let entries: Arc<Mutex<RosterMap>> = Arc::new(Mutex::new(BTreeMap::new()));
        let push_state = entries.clone();
        // Roster pushes arrive as IQ sets from the account (or bare
        // server); RFC 6121 § 2.1.6 requires discarding pushes from
        // anywhere else.
        let _ = handle.register_iq_handler(
            IqRequestKind::Set,
            ns::ROSTER,
            "query",
            IqRequestHandler::Callback(Box::new(move |iq| {
                if iq.from.is_some() {
                    // only pushes without a from (== from the account
                    // itself on c2s streams) are trusted here
                    log::warn!("ignoring roster push from {:?}", iq.from);
                    return IqReply::Error(strix_stanzas::stanza_error::StanzaError::new(
                        strix_stanzas::stanza_error::ErrorType::Auth,
                        strix_stanzas::stanza_error::DefinedCondition::Forbidden,
                        "en",
                        "Roster pushes are only accepted from the server.",
                    ));
                }
                match iq
                    .request_payload()
                    .map(|payload| Roster::try_from(payload.clone()))
                {
                    Some(Ok(roster)) => {
                        apply_items(&mut push_state.lock().unwrap(), roster.items);
                        IqReply::Result(None)
                    }
                    _ => IqReply::Error(strix_stanzas::stanza_error::StanzaError::new(
                        strix_stanzas::stanza_error::ErrorType::Modify,
                        strix_stanzas::stanza_error::DefinedCondition::BadRequest,
                        "en",
                        "Malformed roster push.",
                    )),
                }
            })),
        );
        Ok(RosterService {
            handle: handle.clone(),
            entries,
            ver: Arc::new(Mutex::new(None)),
        })
    }

    fn handle_event(&mut self, event: &ClientEvent) {
        if let ClientEvent::StreamDestroyed = event {
            // the mirror may be stale relative to the new session
            log::debug!("session lost; roster mirror may be outdated until the next fetch");
        }
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
