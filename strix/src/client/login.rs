// Copyright (c) 2024 strix contributors.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Connection bring-up: transport, SASL, post-auth stream restart.
//!
//! Resource binding does **not** happen here; the stanza stream performs
//! it as part of its negotiation so that it can interleave with stream
//! management resumption.

use futures::{SinkExt, StreamExt};

use strix_schema::Element;
use strix_stanzas::sasl as sasl_nonzas;

use crate::connect::{Connector, EstablishedStream};
use crate::error::{AuthError, Error};
use crate::sasl::{Credentials, Mechanism};
use crate::stanza::XmppStreamElement;
use crate::stanzastream::Connection;
use crate::xmlstream::{ReadError, Timeouts};

use super::config::{Config, PasswordSource};

/// Drive the SASL exchange on an established stream.
///
/// On success the stream must be restarted by the caller; this function
/// only runs the `<auth/>` conversation.
async fn authenticate(
    stream: &mut crate::connect::BoxedXmlStream,
    mechanism: &mut dyn Mechanism,
) -> Result<(), Error> {
    let initial = mechanism.initial().map_err(AuthError::from)?;
    let auth: Element = sasl_nonzas::Auth {
        mechanism: mechanism.name(),
        data: initial,
    }
    .into();
    stream.send(&auth).await?;

    loop {
        match stream.next().await {
            Some(Ok(XmppStreamElement::Sasl(sasl_nonzas::Nonza::Challenge(challenge)))) => {
                let response = mechanism
                    .response(&challenge.data)
                    .map_err(AuthError::from)?;
                let response: Element = sasl_nonzas::Response { data: response }.into();
                stream.send(&response).await?;
            }
            Some(Ok(XmppStreamElement::Sasl(sasl_nonzas::Nonza::Success(success)))) => {
                mechanism.success(&success.data).map_err(AuthError::from)?;
                return Ok(());
            }
            Some(Ok(XmppStreamElement::Sasl(sasl_nonzas::Nonza::Failure(failure)))) => {
                return Err(AuthError::Fail(failure.defined_condition).into());
            }
            Some(Ok(other)) => {
                log::warn!("ignoring element during SASL negotiation: {:?}", other);
            }
            Some(Err(ReadError::SoftTimeout)) => continue,
            Some(Err(ReadError::ParseError { error, .. })) => {
                return Err(Error::from(error));
            }
            Some(Err(ReadError::HardError(e))) => return Err(e.into()),
            Some(Err(ReadError::StreamFooterReceived)) | None => return Err(Error::Disconnected),
        }
    }
}

/// Build a [`Connector`] from the client configuration.
pub(super) fn connector_for(config: &Config) -> Result<Connector, Error> {
    let mut connector = Connector::new(config.jid.domain());
    connector.override_peer = config.override_peer.clone();
    connector.negotiation_timeout = config.negotiation_timeout;
    connector.tls.accept_self_signed = config.accept_self_signed;
    if let Some(ref path) = config.pin_store {
        connector.tls.pins = Some(crate::connect::PinStore::load(path, config.pin_type)?);
    }
    Ok(connector)
}

/// Establish a secured, authenticated stream, restarted and positioned
/// after the post-auth stream features.
///
/// `attempt` feeds the password provider so that it can offer different
/// credentials on retries.
pub async fn client_auth(
    connector: &Connector,
    config: &Config,
    timeouts: Timeouts,
    attempt: u64,
) -> Result<Connection, Error> {
    let EstablishedStream {
        mut stream,
        features,
        channel_binding,
    } = connector.connect(timeouts).await?;

    let password = match &config.password {
        source @ PasswordSource::Static(_) => source.get(&config.jid, 0),
        source => source.get(&config.jid, attempt),
    };
    let Some(password) = password else {
        return Err(AuthError::Aborted.into());
    };

    let mut creds = Credentials::new()
        .with_password(password)
        .with_channel_binding(channel_binding);
    if let Some(node) = config.jid.node() {
        creds = creds.with_username(node);
    }

    let mut mechanism = crate::sasl::select_mechanism(
        &features.sasl_mechanisms.mechanisms,
        &creds,
        true,
        false,
    )
    .map_err(|_| AuthError::NoMechanism)?;

    log::debug!("authenticating via {}", mechanism.name());
    authenticate(&mut stream, mechanism.as_mut()).await?;

    // RFC 6120 § 6.4.6: the stream is restarted after authentication.
    let pending = stream
        .initiate_reset()
        .send_header(crate::xmlstream::StreamHeader {
            to: Some(config.jid.domain().to_owned().into()),
            ..crate::xmlstream::StreamHeader::default()
        })
        .await?;
    let (features, stream) = pending.recv_features().await?;

    Ok(Connection {
        stream,
        features,
        identity: config.jid.clone(),
    })
}
