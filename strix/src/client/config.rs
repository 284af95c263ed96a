// Copyright (c) 2024 strix contributors.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Client configuration surface.

use core::fmt;
use core::time::Duration;
use std::path::PathBuf;
use std::sync::Arc;

use strix_stanzas::jid::Jid;

use crate::connect::{Endpoint, PinType};
use crate::xmlstream::Timeouts;

/// Where the account password comes from.
///
/// The provider form is handed the account JID and the zero-based attempt
/// counter; returning `None` aborts authentication (and thereby the
/// client, since authentication failures are critical).
#[derive(Clone)]
pub enum PasswordSource {
    /// A fixed password.
    Static(String),

    /// A callback, e.g. prompting the user or consulting a keyring.
    Provider(Arc<dyn Fn(&Jid, u64) -> Option<String> + Send + Sync>),
}

impl PasswordSource {
    /// Obtain the password for the given attempt.
    pub fn get(&self, jid: &Jid, attempt: u64) -> Option<String> {
        match self {
            PasswordSource::Static(password) => {
                if attempt == 0 {
                    Some(password.clone())
                } else {
                    // a wrong static password stays wrong
                    None
                }
            }
            PasswordSource::Provider(provider) => provider(jid, attempt),
        }
    }
}

impl fmt::Debug for PasswordSource {
    // never print secrets, not even by accident
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PasswordSource::Static(_) => f.write_str("PasswordSource::Static(..)"),
            PasswordSource::Provider(_) => f.write_str("PasswordSource::Provider(..)"),
        }
    }
}

/// Configuration of a [`Client`][`crate::client::Client`].
#[derive(Debug, Clone)]
pub struct Config {
    /// The account JID, bare (server picks the resource) or full (a
    /// specific resource is requested at bind time).
    pub jid: Jid,

    /// The password, fixed or via provider.
    pub password: PasswordSource,

    /// Candidate endpoints to use instead of DNS SRV discovery.
    pub override_peer: Vec<Endpoint>,

    /// Path to a certificate/public-key pin database; see
    /// [`PinStore::load`][`crate::connect::PinStore::load`] for the file
    /// format.
    pub pin_store: Option<PathBuf>,

    /// Whether the pins are public keys (`0`) or certificates (`1`).
    pub pin_type: PinType,

    /// Accept self-signed server certificates.
    pub accept_self_signed: bool,

    /// Maximum duration of disconnection across which stream resumption
    /// is attempted. Zero disables resumption.
    pub resumption_timeout: Duration,

    /// Number of connection attempts before the *first* successful
    /// connection after which the client gives up; fail-fast against
    /// misconfiguration. After the first success, reconnection retries
    /// indefinitely with backoff.
    pub max_initial_attempts: u64,

    /// Per-stage timeout for connection setup (TCP + TLS + stream
    /// handshake per candidate).
    pub negotiation_timeout: Duration,

    /// Liveness timeouts of the underlying XML streams.
    pub timeouts: Timeouts,

    /// Depth of the inbound and outbound stanza queues.
    pub queue_depth: usize,
}

impl Config {
    /// A configuration with reasonable defaults for the given account.
    pub fn new(jid: Jid, password: impl Into<String>) -> Config {
        Config {
            jid,
            password: PasswordSource::Static(password.into()),
            override_peer: vec![],
            pin_store: None,
            pin_type: PinType::Certificate,
            accept_self_signed: false,
            resumption_timeout: Duration::new(900, 0),
            max_initial_attempts: 4,
            negotiation_timeout: Duration::new(60, 0),
            timeouts: Timeouts::default(),
            queue_depth: 128,
        }
    }

    /// Use a password provider instead of a fixed password.
    pub fn with_password_provider<F>(mut self, provider: F) -> Config
    where
        F: Fn(&Jid, u64) -> Option<String> + Send + Sync + 'static,
    {
        self.password = PasswordSource::Provider(Arc::new(provider));
        self
    }

    /// Supply a fixed endpoint list, skipping SRV discovery.
    pub fn with_override_peer(mut self, endpoints: Vec<Endpoint>) -> Config {
        self.override_peer = endpoints;
        self
    }

    /// Whether resumption is enabled at all.
    pub fn resumption_window(&self) -> Option<Duration> {
        if self.resumption_timeout.is_zero() {
            None
        } else {
            Some(self.resumption_timeout)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_password_only_for_first_attempt() {
        let jid: Jid = "a@b.example".parse().unwrap();
        let source = PasswordSource::Static("secret".to_owned());
        assert_eq!(source.get(&jid, 0), Some("secret".to_owned()));
        assert_eq!(source.get(&jid, 1), None);
    }

    #[test]
    fn provider_sees_attempt_counter() {
        let jid: Jid = "a@b.example".parse().unwrap();
        let source = PasswordSource::Provider(Arc::new(|_, attempt| {
            if attempt < 2 {
                Some(format!("try-{}", attempt))
            } else {
                None
            }
        }));
        assert_eq!(source.get(&jid, 1), Some("try-1".to_owned()));
        assert_eq!(source.get(&jid, 2), None);
    }

    #[test]
    fn zero_resumption_timeout_disables_resumption() {
        let mut config = Config::new("a@b.example".parse().unwrap(), "pw");
        assert!(config.resumption_window().is_some());
        config.resumption_timeout = Duration::ZERO;
        assert!(config.resumption_window().is_none());
    }
}
