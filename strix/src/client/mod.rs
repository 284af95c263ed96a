// Copyright (c) 2024 strix contributors.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! # The client supervisor
//!
//! [`Client`] owns a [`StanzaStream`] and a [`ServiceContainer`] and
//! turns the stream's raw events into the lifecycle signals services and
//! applications observe: stream established, suspended, resumed,
//! destroyed, failed, stopped.
//!
//! Reconnecting is handled below the client (in the stream's connector,
//! with exponential backoff); the client decides what is fatal: TLS and
//! authentication errors abort immediately, as does exhausting the
//! initial connection attempts before the first success.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures::StreamExt;

use strix_schema::registry::{Carrier, PayloadRegistry};
use strix_stanzas::jid::Jid;
use strix_stanzas::ns;

use crate::error::{AuthError, Error};
use crate::stanza::Stanza;
use crate::stanzastream::{
    backoff_reconnector, Event, IqRequest, IqResponseToken, StanzaStream, StanzaToken,
    StreamEvent,
};

mod config;
mod login;
mod service;
pub mod services;

pub use config::{Config, PasswordSource};
pub use service::{Service, ServiceContainer, ServiceDescriptor, ServiceError, ServiceHandle};

/// Lifecycle signals of a [`Client`].
///
/// Signals are delivered synchronously to the services (in summon order)
/// before the event is returned from
/// [`next_event`][`Client::next_event`]; service handlers must not
/// block.
#[derive(Debug)]
pub enum ClientEvent {
    /// A session was established and the stream is running.
    StreamEstablished {
        /// The JID the stream is bound to.
        bound_jid: Jid,
    },

    /// The transport was lost; resumption may still succeed.
    StreamSuspended,

    /// The stream was resumed without loss of state.
    StreamResumed,

    /// The previous logical session is gone; a new
    /// [`StreamEstablished`][`Self::StreamEstablished`] follows
    /// immediately.
    StreamDestroyed,

    /// An unhandled stanza arrived.
    Stanza(Stanza),

    /// A critical error terminated the connection loop.
    ///
    /// A [`Stopped`][`Self::Stopped`] event follows.
    Failure(Error),

    /// The stream ended and will not reconnect.
    Stopped,
}

/// An XMPP client: reconnect supervision plus the service container.
pub struct Client {
    stream: StanzaStream,
    services: ServiceContainer,
    bound_jid: Option<Jid>,
    established_once: bool,
    pending: VecDeque<ClientEvent>,
    fatal: Arc<Mutex<Option<Error>>>,
}

/// Payload classes every client understands out of the box.
fn default_registry() -> PayloadRegistry {
    let mut registry = PayloadRegistry::new();
    // infallible: the registry is empty
    registry.register(Carrier::Iq, ns::PING, "ping").unwrap();
    registry.register(Carrier::Iq, ns::ROSTER, "query").unwrap();
    registry
        .register(Carrier::Iq, ns::DISCO_INFO, "query")
        .unwrap();
    registry
        .register(Carrier::Iq, ns::DISCO_ITEMS, "query")
        .unwrap();
    registry
}

impl Client {
    /// Create a client and start connecting.
    pub fn new(config: Config) -> Result<Client, Error> {
        let connector = Arc::new(login::connector_for(&config)?);
        let timeouts = config.timeouts;
        let queue_depth = config.queue_depth;
        let resumption_window = config.resumption_window();
        let max_initial_attempts = config.max_initial_attempts;
        let config = Arc::new(config);

        let ever_connected = Arc::new(AtomicBool::new(false));
        let total_attempts = Arc::new(AtomicU64::new(0));
        let fatal: Arc<Mutex<Option<Error>>> = Arc::new(Mutex::new(None));

        let login = {
            let connector = connector.clone();
            let config = config.clone();
            let ever_connected = ever_connected.clone();
            let total_attempts = total_attempts.clone();
            let fatal = fatal.clone();
            move |attempt: u64| {
                let connector = connector.clone();
                let config = config.clone();
                let ever_connected = ever_connected.clone();
                let total_attempts = total_attempts.clone();
                let fatal = fatal.clone();
                async move {
                    if !ever_connected.load(Ordering::SeqCst)
                        && total_attempts.fetch_add(1, Ordering::SeqCst) >= max_initial_attempts
                    {
                        // fail fast on misconfiguration: the server was
                        // never reachable with these settings
                        log::error!(
                            "giving up after {} initial connection attempts",
                            max_initial_attempts
                        );
                        *fatal.lock().unwrap() = Some(AuthError::Aborted.into());
                        return Err(AuthError::Aborted.into());
                    }
                    match login::client_auth(&connector, &config, timeouts, attempt).await {
                        Ok(conn) => {
                            ever_connected.store(true, Ordering::SeqCst);
                            Ok(conn)
                        }
                        Err(e) => {
                            if !e.is_retryable() {
                                log::error!("critical connection error: {}", e);
                                // keep the structured reason for the
                                // Failure signal; hand the reconnector a
                                // non-retryable marker
                                *fatal.lock().unwrap() = Some(e);
                                return Err(AuthError::Aborted.into());
                            }
                            Err(e)
                        }
                    }
                }
            }
        };

        let stream = StanzaStream::new(
            backoff_reconnector(login),
            queue_depth,
            resumption_window,
            default_registry(),
        );
        let handle = ServiceHandle {
            sender: stream.sender(),
            hooks: stream.hooks().clone(),
        };
        Ok(Client {
            stream,
            services: ServiceContainer::new(handle),
            bound_jid: None,
            established_once: false,
            pending: VecDeque::new(),
            fatal,
        })
    }

    /// The JID the current session is bound to, if any.
    pub fn bound_jid(&self) -> Option<&Jid> {
        self.bound_jid.as_ref()
    }

    /// The underlying stanza stream.
    pub fn stream(&self) -> &StanzaStream {
        &self.stream
    }

    /// Summon a service and its dependency closure.
    pub fn summon<S: Service>(&mut self) -> Result<(), ServiceError> {
        self.services.summon::<S>()
    }

    /// Run a closure against a summoned service.
    pub fn with_service<S: Service, R>(&mut self, f: impl FnOnce(&mut S) -> R) -> Option<R> {
        self.services.with_service::<S, R>(f)
    }

    /// Send a stanza.
    pub async fn send(&self, stanza: Stanza) -> Result<StanzaToken, Error> {
        self.stream.send(Box::new(stanza)).await
    }

    /// Send an IQ request.
    pub async fn send_iq(
        &self,
        to: Option<Jid>,
        req: IqRequest,
    ) -> Result<IqResponseToken, Error> {
        self.stream.send_iq(to, req).await
    }

    fn translate(&mut self, event: Event) -> ClientEvent {
        match event {
            Event::Stream(StreamEvent::Reset { bound_jid }) => {
                if self.established_once {
                    // loss of the previous session is reported before the
                    // new establishment
                    self.pending.push_back(ClientEvent::StreamEstablished {
                        bound_jid: bound_jid.clone(),
                    });
                    self.bound_jid = Some(bound_jid);
                    ClientEvent::StreamDestroyed
                } else {
                    self.established_once = true;
                    self.bound_jid = Some(bound_jid.clone());
                    ClientEvent::StreamEstablished { bound_jid }
                }
            }
            Event::Stream(StreamEvent::Suspended) => ClientEvent::StreamSuspended,
            Event::Stream(StreamEvent::Resumed) => ClientEvent::StreamResumed,
            Event::Stanza(stanza) => ClientEvent::Stanza(stanza),
        }
    }

    /// Wait for the next lifecycle event or unhandled stanza.
    ///
    /// Services observe every event before it is returned here. `None`
    /// is never returned; the final event of a client's life is
    /// [`ClientEvent::Stopped`].
    pub async fn next_event(&mut self) -> ClientEvent {
        if let Some(event) = self.pending.pop_front() {
            self.services.dispatch(&event);
            if matches!(event, ClientEvent::Stopped) {
                self.services.shutdown_all();
            }
            return event;
        }
        match self.stream.next().await {
            Some(event) => {
                let event = self.translate(event);
                self.services.dispatch(&event);
                event
            }
            None => {
                if let Some(error) = self.fatal.lock().unwrap().take() {
                    self.pending.push_back(ClientEvent::Stopped);
                    let event = ClientEvent::Failure(error);
                    self.services.dispatch(&event);
                    return event;
                }
                let event = ClientEvent::Stopped;
                self.services.dispatch(&event);
                self.services.shutdown_all();
                event
            }
        }
    }

    /// Close the client: tear down services and shut the stream down
    /// cleanly.
    pub async fn close(mut self) {
        self.services.dispatch(&ClientEvent::Stopped);
        self.services.shutdown_all();
        self.stream.close().await;
    }
}
