// Copyright (c) 2024 strix contributors.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! SASL client mechanisms.
//!
//! PLAIN is only ever offered by the selection logic once the transport
//! is TLS-protected; SCRAM (RFC 5802) is implemented for SHA-1 and
//! SHA-256, in both the bare and the channel-binding (`-PLUS`) variants.

use core::fmt;
use core::marker::PhantomData;

use base64::engine::{general_purpose::STANDARD as Base64, Engine as _};
use hmac::{Hmac, Mac};
use rand::{thread_rng, Rng};
use sha1::{Digest, Sha1 as Sha1Digest};
use sha2::Sha256 as Sha256Digest;

use strix_stanzas::sasl::Mechanism as MechanismName;

/// Channel binding data negotiated by the transport layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelBinding {
    /// No channel binding available.
    None,

    /// RFC 9266 `tls-exporter` keying material.
    TlsExporter(Vec<u8>),
}

impl ChannelBinding {
    /// The GS2 header announcing this binding.
    fn gs2_header(&self, supported_but_unused: bool) -> String {
        match self {
            // "y" tells the server we could do channel binding but think
            // it does not support it; plain "n" that we cannot at all.
            ChannelBinding::None => {
                if supported_but_unused {
                    "y,,".to_owned()
                } else {
                    "n,,".to_owned()
                }
            }
            ChannelBinding::TlsExporter(_) => "p=tls-exporter,,".to_owned(),
        }
    }

    fn data(&self) -> &[u8] {
        match self {
            ChannelBinding::None => &[],
            ChannelBinding::TlsExporter(data) => data,
        }
    }
}

/// Credentials used to authenticate.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    /// The authentication identity (the localpart of the account JID).
    pub username: Option<String>,

    /// The password.
    pub password: Option<String>,

    /// Channel binding data from the transport.
    pub channel_binding: ChannelBinding,
}

impl Default for ChannelBinding {
    fn default() -> Self {
        ChannelBinding::None
    }
}

impl Credentials {
    /// Start building credentials.
    pub fn new() -> Credentials {
        Credentials::default()
    }

    /// Set the username.
    pub fn with_username<S: Into<String>>(mut self, username: S) -> Credentials {
        self.username = Some(username.into());
        self
    }

    /// Set the password.
    pub fn with_password<S: Into<String>>(mut self, password: S) -> Credentials {
        self.password = Some(password.into());
        self
    }

    /// Set the channel binding data.
    pub fn with_channel_binding(mut self, channel_binding: ChannelBinding) -> Credentials {
        self.channel_binding = channel_binding;
        self
    }
}

/// Local failure during a SASL exchange.
#[derive(Debug)]
pub enum MechanismError {
    /// The credentials are incomplete for the chosen mechanism.
    MissingCredentials,

    /// The server sent a challenge we cannot parse.
    MalformedChallenge,

    /// The server's iteration count or nonce violates the protocol.
    InvalidParameters,

    /// The server signature did not verify; the server does not actually
    /// know the password.
    ServerSignatureMismatch,

    /// The mechanism received data in an unexpected phase.
    UnexpectedPhase,
}

impl fmt::Display for MechanismError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            Self::MissingCredentials => "credentials incomplete for mechanism",
            Self::MalformedChallenge => "malformed server challenge",
            Self::InvalidParameters => "invalid SCRAM parameters from server",
            Self::ServerSignatureMismatch => "server signature mismatch",
            Self::UnexpectedPhase => "mechanism data in unexpected phase",
        })
    }
}

impl std::error::Error for MechanismError {}

/// A SASL client mechanism.
pub trait Mechanism: Send {
    /// The IANA name of the mechanism.
    fn name(&self) -> MechanismName;

    /// Produce the initial response.
    fn initial(&mut self) -> Result<Vec<u8>, MechanismError>;

    /// Respond to a server challenge.
    fn response(&mut self, challenge: &[u8]) -> Result<Vec<u8>, MechanismError>;

    /// Process the additional data sent with `<success/>`.
    fn success(&mut self, data: &[u8]) -> Result<(), MechanismError>;
}

/// The PLAIN mechanism, RFC 4616.
pub struct Plain {
    username: String,
    password: String,
}

impl Plain {
    /// Build from credentials.
    pub fn from_credentials(creds: &Credentials) -> Result<Plain, MechanismError> {
        match (&creds.username, &creds.password) {
            (Some(username), Some(password)) => Ok(Plain {
                username: username.clone(),
                password: password.clone(),
            }),
            _ => Err(MechanismError::MissingCredentials),
        }
    }
}

impl Mechanism for Plain {
    fn name(&self) -> MechanismName {
        MechanismName::Plain
    }

    fn initial(&mut self) -> Result<Vec<u8>, MechanismError> {
        let mut data = Vec::new();
        data.push(0);
        data.extend_from_slice(self.username.as_bytes());
        data.push(0);
        data.extend_from_slice(self.password.as_bytes());
        Ok(data)
    }

    fn response(&mut self, _challenge: &[u8]) -> Result<Vec<u8>, MechanismError> {
        Err(MechanismError::UnexpectedPhase)
    }

    fn success(&mut self, _data: &[u8]) -> Result<(), MechanismError> {
        Ok(())
    }
}

/// The ANONYMOUS mechanism, RFC 4505.
pub struct Anonymous;

impl Mechanism for Anonymous {
    fn name(&self) -> MechanismName {
        MechanismName::Anonymous
    }

    fn initial(&mut self) -> Result<Vec<u8>, MechanismError> {
        Ok(b"anonymous".to_vec())
    }

    fn response(&mut self, _challenge: &[u8]) -> Result<Vec<u8>, MechanismError> {
        Err(MechanismError::UnexpectedPhase)
    }

    fn success(&mut self, _data: &[u8]) -> Result<(), MechanismError> {
        Ok(())
    }
}

/// The EXTERNAL mechanism, RFC 4422 appendix A; authentication is taken
/// from the outer context (a TLS client certificate).
pub struct External;

impl Mechanism for External {
    fn name(&self) -> MechanismName {
        MechanismName::External
    }

    fn initial(&mut self) -> Result<Vec<u8>, MechanismError> {
        Ok(vec![])
    }

    fn response(&mut self, _challenge: &[u8]) -> Result<Vec<u8>, MechanismError> {
        Err(MechanismError::UnexpectedPhase)
    }

    fn success(&mut self, _data: &[u8]) -> Result<(), MechanismError> {
        Ok(())
    }
}

/// Hash profile for SCRAM.
pub trait ScramProfile: Send {
    /// Mechanism name without channel binding.
    const NAME: MechanismName;

    /// Mechanism name with channel binding.
    const NAME_PLUS: MechanismName;

    /// H(data).
    fn hash(data: &[u8]) -> Vec<u8>;

    /// HMAC(key, data).
    fn hmac(key: &[u8], data: &[u8]) -> Vec<u8>;

    /// Hi(password, salt, iterations), i.e. PBKDF2.
    fn derive(password: &[u8], salt: &[u8], iterations: u32) -> Vec<u8>;
}

/// SCRAM-SHA-1 profile.
pub struct Sha1;

impl ScramProfile for Sha1 {
    const NAME: MechanismName = MechanismName::ScramSha1;
    const NAME_PLUS: MechanismName = MechanismName::ScramSha1Plus;

    fn hash(data: &[u8]) -> Vec<u8> {
        Sha1Digest::digest(data).to_vec()
    }

    fn hmac(key: &[u8], data: &[u8]) -> Vec<u8> {
        let mut mac =
            Hmac::<Sha1Digest>::new_from_slice(key).expect("hmac accepts any key length");
        mac.update(data);
        mac.finalize().into_bytes().to_vec()
    }

    fn derive(password: &[u8], salt: &[u8], iterations: u32) -> Vec<u8> {
        let mut out = vec![0u8; 20];
        pbkdf2::pbkdf2_hmac::<Sha1Digest>(password, salt, iterations, &mut out);
        out
    }
}

/// SCRAM-SHA-256 profile.
pub struct Sha256;

impl ScramProfile for Sha256 {
    const NAME: MechanismName = MechanismName::ScramSha256;
    const NAME_PLUS: MechanismName = MechanismName::ScramSha256Plus;

    fn hash(data: &[u8]) -> Vec<u8> {
        Sha256Digest::digest(data).to_vec()
    }

    fn hmac(key: &[u8], data: &[u8]) -> Vec<u8> {
        let mut mac =
            Hmac::<Sha256Digest>::new_from_slice(key).expect("hmac accepts any key length");
        mac.update(data);
        mac.finalize().into_bytes().to_vec()
    }

    fn derive(password: &[u8], salt: &[u8], iterations: u32) -> Vec<u8> {
        let mut out = vec![0u8; 32];
        pbkdf2::pbkdf2_hmac::<Sha256Digest>(password, salt, iterations, &mut out);
        out
    }
}

enum ScramPhase {
    Initial,
    AwaitServerFirst {
        client_nonce: String,
        client_first_bare: String,
    },
    AwaitSuccess {
        server_signature: Vec<u8>,
    },
    Done,
}

/// The SCRAM mechanism, RFC 5802, parameterised over the hash profile.
pub struct Scram<P: ScramProfile> {
    username: String,
    password: String,
    channel_binding: ChannelBinding,
    plus: bool,
    phase: ScramPhase,
    _profile: PhantomData<P>,
}

impl<P: ScramProfile> Scram<P> {
    /// Build from credentials, without channel binding.
    pub fn from_credentials(creds: &Credentials) -> Result<Scram<P>, MechanismError> {
        Self::build(creds, false)
    }

    /// Build the `-PLUS` variant; requires channel binding data.
    pub fn from_credentials_plus(creds: &Credentials) -> Result<Scram<P>, MechanismError> {
        if creds.channel_binding == ChannelBinding::None {
            return Err(MechanismError::MissingCredentials);
        }
        Self::build(creds, true)
    }

    fn build(creds: &Credentials, plus: bool) -> Result<Scram<P>, MechanismError> {
        match (&creds.username, &creds.password) {
            (Some(username), Some(password)) => Ok(Scram {
                username: username.clone(),
                password: password.clone(),
                channel_binding: creds.channel_binding.clone(),
                plus,
                phase: ScramPhase::Initial,
                _profile: PhantomData,
            }),
            _ => Err(MechanismError::MissingCredentials),
        }
    }

    fn gs2_header(&self) -> String {
        if self.plus {
            self.channel_binding.gs2_header(false)
        } else {
            // we advertise "y" when we do have binding data but chose the
            // non-PLUS variant, to defeat downgrade attacks
            let have_binding = self.channel_binding != ChannelBinding::None;
            ChannelBinding::None.gs2_header(have_binding)
        }
    }

    fn cbind_input(&self) -> Vec<u8> {
        let mut input = self.gs2_header().into_bytes();
        if self.plus {
            input.extend_from_slice(self.channel_binding.data());
        }
        input
    }
}

fn scram_attr<'x>(field: &'x str, key: &str) -> Option<&'x str> {
    field.strip_prefix(key)
}

impl<P: ScramProfile> Mechanism for Scram<P> {
    fn name(&self) -> MechanismName {
        if self.plus {
            P::NAME_PLUS
        } else {
            P::NAME
        }
    }

    fn initial(&mut self) -> Result<Vec<u8>, MechanismError> {
        let mut nonce_raw = [0u8; 24];
        thread_rng().fill(&mut nonce_raw);
        let client_nonce = Base64.encode(nonce_raw);
        // SASLprep is the identity transform for the vast majority of
        // user names; "=" and "," must be escaped in any case.
        let username = self
            .username
            .replace('=', "=3D")
            .replace(',', "=2C");
        let client_first_bare = format!("n={},r={}", username, client_nonce);
        let message = format!("{}{}", self.gs2_header(), client_first_bare);
        self.phase = ScramPhase::AwaitServerFirst {
            client_nonce,
            client_first_bare,
        };
        Ok(message.into_bytes())
    }

    fn response(&mut self, challenge: &[u8]) -> Result<Vec<u8>, MechanismError> {
        let phase = core::mem::replace(&mut self.phase, ScramPhase::Done);
        let ScramPhase::AwaitServerFirst {
            client_nonce,
            client_first_bare,
        } = phase
        else {
            return Err(MechanismError::UnexpectedPhase);
        };

        let server_first =
            core::str::from_utf8(challenge).map_err(|_| MechanismError::MalformedChallenge)?;
        let mut nonce = None;
        let mut salt = None;
        let mut iterations = None;
        for field in server_first.split(',') {
            if let Some(v) = scram_attr(field, "r=") {
                nonce = Some(v.to_owned());
            } else if let Some(v) = scram_attr(field, "s=") {
                salt = Some(
                    Base64
                        .decode(v)
                        .map_err(|_| MechanismError::MalformedChallenge)?,
                );
            } else if let Some(v) = scram_attr(field, "i=") {
                iterations = Some(
                    v.parse::<u32>()
                        .map_err(|_| MechanismError::MalformedChallenge)?,
                );
            }
        }
        let (nonce, salt, iterations) = match (nonce, salt, iterations) {
            (Some(n), Some(s), Some(i)) => (n, s, i),
            _ => return Err(MechanismError::MalformedChallenge),
        };
        // the server nonce must extend ours, and the iteration count must
        // not invite a downgrade
        if !nonce.starts_with(&client_nonce) || iterations < 1 {
            return Err(MechanismError::InvalidParameters);
        }

        let salted_password = P::derive(self.password.as_bytes(), &salt, iterations);
        let client_key = P::hmac(&salted_password, b"Client Key");
        let stored_key = P::hash(&client_key);

        let channel_binding = Base64.encode(self.cbind_input());
        let client_final_without_proof = format!("c={},r={}", channel_binding, nonce);
        let auth_message = format!(
            "{},{},{}",
            client_first_bare, server_first, client_final_without_proof
        );
        let client_signature = P::hmac(&stored_key, auth_message.as_bytes());
        let client_proof: Vec<u8> = client_key
            .iter()
            .zip(client_signature.iter())
            .map(|(key, sig)| key ^ sig)
            .collect();

        let server_key = P::hmac(&salted_password, b"Server Key");
        let server_signature = P::hmac(&server_key, auth_message.as_bytes());

        let client_final = format!(
            "{},p={}",
            client_final_without_proof,
            Base64.encode(client_proof)
        );
        self.phase = ScramPhase::AwaitSuccess { server_signature };
        Ok(client_final.into_bytes())
    }

    fn success(&mut self, data: &[u8]) -> Result<(), MechanismError> {
        let phase = core::mem::replace(&mut self.phase, ScramPhase::Done);
        let ScramPhase::AwaitSuccess { server_signature } = phase else {
            return Err(MechanismError::UnexpectedPhase);
        };
        let server_final =
            core::str::from_utf8(data).map_err(|_| MechanismError::MalformedChallenge)?;
        let verifier = server_final
            .split(',')
            .find_map(|field| scram_attr(field, "v="))
            .ok_or(MechanismError::MalformedChallenge)?;
        let verifier = Base64
            .decode(verifier)
            .map_err(|_| MechanismError::MalformedChallenge)?;
        if verifier != server_signature {
            return Err(MechanismError::ServerSignatureMismatch);
        }
        Ok(())
    }
}

/// Select the strongest mutually supported mechanism.
///
/// The preference order is EXTERNAL (when requested by configuration),
/// the SCRAM `-PLUS` variants (when channel binding data is available),
/// plain SCRAM, PLAIN (only when `tls_secured`), and finally ANONYMOUS
/// when no password is configured.
pub fn select_mechanism(
    offered: &[String],
    creds: &Credentials,
    tls_secured: bool,
    use_external: bool,
) -> Result<Box<dyn Mechanism>, MechanismError> {
    let offers = |name: MechanismName| offered.iter().any(|m| m == &name.to_string());

    if use_external && offers(MechanismName::External) {
        return Ok(Box::new(External));
    }
    let have_password = creds.username.is_some() && creds.password.is_some();
    if have_password {
        if creds.channel_binding != ChannelBinding::None {
            if offers(MechanismName::ScramSha256Plus) {
                return Ok(Box::new(Scram::<Sha256>::from_credentials_plus(creds)?));
            }
            if offers(MechanismName::ScramSha1Plus) {
                return Ok(Box::new(Scram::<Sha1>::from_credentials_plus(creds)?));
            }
        }
        if offers(MechanismName::ScramSha256) {
            return Ok(Box::new(Scram::<Sha256>::from_credentials(creds)?));
        }
        if offers(MechanismName::ScramSha1) {
            return Ok(Box::new(Scram::<Sha1>::from_credentials(creds)?));
        }
        if tls_secured && offers(MechanismName::Plain) {
            return Ok(Box::new(Plain::from_credentials(creds)?));
        }
    } else if offers(MechanismName::Anonymous) {
        return Ok(Box::new(Anonymous));
    }
    Err(MechanismError::MissingCredentials)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds() -> Credentials {
        Credentials::new().with_username("user").with_password("pencil")
    }

    #[test]
    fn plain_initial_response() {
        let mut plain = Plain::from_credentials(&creds()).unwrap();
        assert_eq!(plain.initial().unwrap(), b"\x00user\x00pencil");
    }

    // Test vector from RFC 5802 § 5, driven with a fixed client nonce by
    // replaying the recorded exchange through the state machine.
    #[test]
    fn scram_sha1_rfc_vector() {
        let mut scram = Scram::<Sha1>::from_credentials(&creds()).unwrap();
        let initial = scram.initial().unwrap();
        let initial = String::from_utf8(initial).unwrap();
        assert!(initial.starts_with("n,,n=user,r="));
        let client_nonce = initial.split("r=").nth(1).unwrap().to_owned();

        // substitute the RFC's client nonce to reproduce its derivations
        scram.phase = ScramPhase::AwaitServerFirst {
            client_nonce: "fyko+d2lbbFgONRv9qkxdawL".to_owned(),
            client_first_bare: "n=user,r=fyko+d2lbbFgONRv9qkxdawL".to_owned(),
        };
        let _ = client_nonce;

        let server_first =
            b"r=fyko+d2lbbFgONRv9qkxdawL3rfcNHYJY1ZVvWVs7j,s=QSXCR+Q6sek8bf92,i=4096";
        let client_final = scram.response(server_first).unwrap();
        assert_eq!(
            String::from_utf8(client_final).unwrap(),
            "c=biws,r=fyko+d2lbbFgONRv9qkxdawL3rfcNHYJY1ZVvWVs7j,p=v0X8v3Bz2T0CJGbJQyF0X+HI4Ts="
        );

        scram
            .success(b"v=rmF9pqV8S7suAoZWja4dJRkFsKQ=")
            .unwrap();
    }

    #[test]
    fn scram_rejects_nonce_truncation() {
        let mut scram = Scram::<Sha1>::from_credentials(&creds()).unwrap();
        let _ = scram.initial().unwrap();
        // server nonce does not extend the client nonce
        let result = scram.response(b"r=attacker,s=QSXCR+Q6sek8bf92,i=4096");
        assert!(matches!(result, Err(MechanismError::InvalidParameters)));
    }

    #[test]
    fn scram_rejects_bad_server_signature() {
        let mut scram = Scram::<Sha1>::from_credentials(&creds()).unwrap();
        let _ = scram.initial().unwrap();
        scram.phase = ScramPhase::AwaitServerFirst {
            client_nonce: "fyko+d2lbbFgONRv9qkxdawL".to_owned(),
            client_first_bare: "n=user,r=fyko+d2lbbFgONRv9qkxdawL".to_owned(),
        };
        let _ = scram
            .response(b"r=fyko+d2lbbFgONRv9qkxdawL3rfcNHYJY1ZVvWVs7j,s=QSXCR+Q6sek8bf92,i=4096")
            .unwrap();
        assert!(matches!(
            scram.success(b"v=AAAAAAAAAAAAAAAAAAAAAAAAAAA="),
            Err(MechanismError::ServerSignatureMismatch)
        ));
    }

    #[test]
    fn mechanism_selection_prefers_scram() {
        let offered = vec![
            "PLAIN".to_owned(),
            "SCRAM-SHA-1".to_owned(),
            "SCRAM-SHA-256".to_owned(),
        ];
        let mechanism = select_mechanism(&offered, &creds(), true, false).unwrap();
        assert_eq!(mechanism.name(), MechanismName::ScramSha256);
    }

    #[test]
    fn plain_requires_tls() {
        let offered = vec!["PLAIN".to_owned()];
        assert!(select_mechanism(&offered, &creds(), false, false).is_err());
        assert!(select_mechanism(&offered, &creds(), true, false).is_ok());
    }

    #[test]
    fn plus_variant_requires_binding() {
        let offered = vec!["SCRAM-SHA-256-PLUS".to_owned(), "SCRAM-SHA-256".to_owned()];
        let without = select_mechanism(&offered, &creds(), true, false).unwrap();
        assert_eq!(without.name(), MechanismName::ScramSha256);

        let with = creds().with_channel_binding(ChannelBinding::TlsExporter(vec![1; 32]));
        let mechanism = select_mechanism(&offered, &with, true, false).unwrap();
        assert_eq!(mechanism.name(), MechanismName::ScramSha256Plus);
    }
}
