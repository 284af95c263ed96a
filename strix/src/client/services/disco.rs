// Copyright (c) 2024 strix contributors.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! XEP-0030 service discovery.
//!
//! Answers `disco#info` queries about this client with the registered
//! identity and feature set, and offers typed queries against other
//! entities.

use core::any::Any;
use std::sync::{Arc, Mutex};

use strix_schema::{Element, FromElementError};
use strix_stanzas::disco::{DiscoInfoQuery, DiscoInfoResult, DiscoItemsResult, Identity};
use strix_stanzas::jid::Jid;
use strix_stanzas::ns;
use strix_stanzas::stanza_error::{DefinedCondition, ErrorType, StanzaError};

use crate::client::{ClientEvent, Service, ServiceHandle};
use crate::error::{Error, ProtocolError};
use crate::stanzastream::{IqReply, IqRequest, IqRequestHandler, IqRequestKind, IqResponse};

/// The identity and features this client advertises.
#[derive(Debug, Clone)]
struct Advertised {
    identities: Vec<Identity>,
    features: Vec<String>,
}

/// Service discovery: responder for the local entity, query helpers for
/// remote ones.
pub struct DiscoService {
    handle: ServiceHandle,
    advertised: Arc<Mutex<Advertised>>,
}

impl DiscoService {
    /// Add a feature namespace to the advertised set.
    pub fn add_feature<S: Into<String>>(&self, feature: S) {
        let mut advertised = self.advertised.lock().unwrap();
        let feature = feature.into();
        if !advertised.features.contains(&feature) {
            advertised.features.push(feature);
        }
    }

    /// Replace the advertised identity.
    pub fn set_identity(&self, identity: Identity) {
        self.advertised.lock().unwrap().identities = vec![identity];
    }

    /// Query the disco#info of an entity.
    pub async fn query_info(
        &self,
        to: Jid,
        node: Option<String>,
    ) -> Result<DiscoInfoResult, Error> {
        let query: Element = DiscoInfoQuery { node }.into();
        let token = self.handle.send_iq(Some(to), IqRequest::Get(query)).await?;
        match token.await {
            Ok(IqResponse::Result(Some(payload))) => DiscoInfoResult::try_from(payload)
                .map_err(|e: FromElementError| ProtocolError::Schema(e.into()).into()),
            Ok(IqResponse::Result(None)) => {
                Err(ProtocolError::Schema(strix_schema::Error::Other(
                    "disco#info result without payload",
                ))
                .into())
            }
            Ok(IqResponse::Error(error)) => Err(Error::Stanza(error)),
            Err(_) => Err(Error::Disconnected),
        }
    }

    /// Query the disco#items of an entity.
    pub async fn query_items(
        &self,
        to: Jid,
        node: Option<String>,
    ) -> Result<DiscoItemsResult, Error> {
        let query = Element::builder("query", ns::DISCO_ITEMS)
            .attr("node", node)
            .build();
        let token = self.handle.send_iq(Some(to), IqRequest::Get(query)).await?;
        match token.await {
            Ok(IqResponse::Result(Some(payload))) => DiscoItemsResult::try_from(payload)
                .map_err(|e: FromElementError| ProtocolError::Schema(e.into()).into()),
            Ok(IqResponse::Result(None)) => {
                Err(ProtocolError::Schema(strix_schema::Error::Other(
                    "disco#items result without payload",
                ))
                .into())
            }
            Ok(IqResponse::Error(error)) => Err(Error::Stanza(error)),
            Err(_) => Err(Error::Disconnected),
        }
    }
}

impl Service for DiscoService {
    fn attach(handle: &ServiceHandle) -> Result<Self, Error> {
        let advertised = Arc::new(Mutex::new(Advertised {
            identities: vec![Identity {
                category: "client".to_owned(),
                type_: "pc".to_owned(),
                name: None,
            }],
            features: vec![
                ns::DISCO_INFO.to_owned(),
                ns::DISCO_ITEMS.to_owned(),
                ns::PING.to_owned(),
            ],
        }));
        let responder_state = advertised.clone();
        let _ = handle.register_iq_handler(
            IqRequestKind::Get,
            ns::DISCO_INFO,
            "query",
            IqRequestHandler::Callback(Box::new(move |iq| {
                let query = iq
                    .request_payload()
                    .and_then(|payload| DiscoInfoQuery::try_from(payload.clone()).ok());
                match query {
                    Some(DiscoInfoQuery { node: None }) => {
                        let advertised = responder_state.lock().unwrap();
                        let result = DiscoInfoResult {
                            node: None,
                            identities: advertised.identities.clone(),
                            features: advertised.features.clone(),
                            extensions: vec![],
                        };
                        IqReply::Result(Some(result.into()))
                    }
                    // no nodes are advertised by the bare client
                    Some(DiscoInfoQuery { node: Some(_) }) => IqReply::Error(StanzaError::new(
                        ErrorType::Cancel,
                        DefinedCondition::ItemNotFound,
                        "en",
                        "No such node.",
                    )),
                    None => IqReply::Error(StanzaError::new(
                        ErrorType::Modify,
                        DefinedCondition::BadRequest,
                        "en",
                        "Malformed disco#info query.",
                    )),
                }
            })),
        );
        Ok(DiscoService {
            handle: handle.clone(),
            advertised,
        })
    }

    fn handle_event(&mut self, _event: &ClientEvent) {}

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
