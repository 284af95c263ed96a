// Copyright (c) 2024 strix contributors.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! XEP-0199 ping responder and prober.

use core::any::Any;

use strix_schema::Element;
use strix_stanzas::jid::Jid;
use strix_stanzas::ns;
use strix_stanzas::ping::Ping;

use crate::client::{ClientEvent, Service, ServiceHandle};
use crate::error::Error;
use crate::stanzastream::{IqReply, IqRequest, IqRequestHandler, IqRequestKind, IqResponse};

/// Replies to `<ping/>` requests and offers an application-level ping
/// probe.
pub struct PingService {
    handle: ServiceHandle,
}

impl PingService {
    /// Ping an entity; resolves once any reply arrives.
    ///
    /// Per XEP-0199, an error reply (e.g. `service-unavailable`) proves
    /// liveness just as well as a result.
    pub async fn ping(&self, to: Jid) -> Result<(), Error> {
        let token = self
            .handle
            .send_iq(Some(to), IqRequest::Get(Element::from(Ping {})))
            .await?;
        match token.await {
            Ok(IqResponse::Result(_)) | Ok(IqResponse::Error(_)) => Ok(()),
            Err(_) => Err(Error::Disconnected),
        }
    }
}

impl Service for PingService {
    fn attach(handle: &ServiceHandle) -> Result<Self, Error> {
        // ignore a duplicate registration: someone installed their own
        // ping responder, which is fine
        let _ = handle.register_iq_handler(
            IqRequestKind::Get,
            ns::PING,
            "ping",
            IqRequestHandler::Callback(Box::new(|_| IqReply::Result(None))),
        );
        Ok(PingService {
            handle: handle.clone(),
        })
    }

    fn handle_event(&mut self, _event: &ClientEvent) {}

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
