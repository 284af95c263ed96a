// Copyright (c) 2024 strix contributors.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! SASL negotiation nonzas, RFC 6120 § 6.

use core::str::FromStr;

use base64::engine::{general_purpose::STANDARD as Base64, Engine as _};

use strix_schema::error::{Error, FromElementError};
use strix_schema::Element;

use crate::ns;

strix_schema::generate_attribute!(
    /// The SASL mechanisms this implementation can speak.
    Mechanism, "mechanism", {
        /// Plain text password.
        Plain => "PLAIN",

        /// SCRAM over SHA-1.
        ScramSha1 => "SCRAM-SHA-1",

        /// SCRAM over SHA-1, with channel binding.
        ScramSha1Plus => "SCRAM-SHA-1-PLUS",

        /// SCRAM over SHA-256.
        ScramSha256 => "SCRAM-SHA-256",

        /// SCRAM over SHA-256, with channel binding.
        ScramSha256Plus => "SCRAM-SHA-256-PLUS",

        /// Anonymous login.
        Anonymous => "ANONYMOUS",

        /// Authentication from outer context, e.g. a TLS client
        /// certificate.
        External => "EXTERNAL",
    }
);

/// Decode the base64 payload of a SASL element, where `=` denotes an
/// explicitly empty payload.
fn decode_sasl_data(text: &str) -> Result<Vec<u8>, Error> {
    if text == "=" {
        return Ok(vec![]);
    }
    Base64.decode(text).map_err(Error::text_parse_error)
}

fn encode_sasl_data(data: &[u8]) -> String {
    if data.is_empty() {
        return "=".to_owned();
    }
    Base64.encode(data)
}

/// Initial authentication request.
#[derive(Debug, Clone, PartialEq)]
pub struct Auth {
    /// The chosen mechanism.
    pub mechanism: Mechanism,

    /// The initial response, if the mechanism has one.
    pub data: Vec<u8>,
}

impl TryFrom<Element> for Auth {
    type Error = FromElementError;

    fn try_from(elem: Element) -> Result<Auth, FromElementError> {
        strix_schema::check_self!(elem, "auth", ns::SASL);
        let mechanism = strix_schema::get_attr!(elem, "mechanism", Required);
        let data = decode_sasl_data(&elem.text())?;
        Ok(Auth { mechanism, data })
    }
}

impl From<Auth> for Element {
    fn from(auth: Auth) -> Element {
        let mut elem = Element::builder("auth", ns::SASL)
            .attr("mechanism", auth.mechanism)
            .build();
        elem.append_text_node(encode_sasl_data(&auth.data));
        elem
    }
}

/// A challenge sent by the server during mechanism negotiation.
#[derive(Debug, Clone, PartialEq)]
pub struct Challenge {
    /// The challenge data.
    pub data: Vec<u8>,
}

impl TryFrom<Element> for Challenge {
    type Error = FromElementError;

    fn try_from(elem: Element) -> Result<Challenge, FromElementError> {
        strix_schema::check_self!(elem, "challenge", ns::SASL);
        let data = decode_sasl_data(&elem.text())?;
        Ok(Challenge { data })
    }
}

impl From<Challenge> for Element {
    fn from(challenge: Challenge) -> Element {
        let mut elem = Element::bare("challenge", ns::SASL);
        elem.append_text_node(encode_sasl_data(&challenge.data));
        elem
    }
}

/// The client's response to a challenge.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    /// The response data.
    pub data: Vec<u8>,
}

impl TryFrom<Element> for Response {
    type Error = FromElementError;

    fn try_from(elem: Element) -> Result<Response, FromElementError> {
        strix_schema::check_self!(elem, "response", ns::SASL);
        let data = decode_sasl_data(&elem.text())?;
        Ok(Response { data })
    }
}

impl From<Response> for Element {
    fn from(response: Response) -> Element {
        let mut elem = Element::bare("response", ns::SASL);
        elem.append_text_node(encode_sasl_data(&response.data));
        elem
    }
}

/// Announcement of a successful authentication, with optional additional
/// data from the mechanism.
#[derive(Debug, Clone, PartialEq)]
pub struct Success {
    /// Additional data (e.g. the SCRAM server signature).
    pub data: Vec<u8>,
}

impl TryFrom<Element> for Success {
    type Error = FromElementError;

    fn try_from(elem: Element) -> Result<Success, FromElementError> {
        strix_schema::check_self!(elem, "success", ns::SASL);
        let text = elem.text();
        let data = if text.is_empty() {
            vec![]
        } else {
            decode_sasl_data(&text)?
        };
        Ok(Success { data })
    }
}

impl From<Success> for Element {
    fn from(success: Success) -> Element {
        let mut elem = Element::bare("success", ns::SASL);
        if !success.data.is_empty() {
            elem.append_text_node(encode_sasl_data(&success.data));
        }
        elem
    }
}

/// Abort the exchange, sent by the client.
#[derive(Debug, Clone, PartialEq)]
pub struct Abort;

impl TryFrom<Element> for Abort {
    type Error = FromElementError;

    fn try_from(elem: Element) -> Result<Abort, FromElementError> {
        strix_schema::check_self!(elem, "abort", ns::SASL);
        Ok(Abort)
    }
}

impl From<Abort> for Element {
    fn from(_: Abort) -> Element {
        Element::bare("abort", ns::SASL)
    }
}

/// Defined SASL error conditions, RFC 6120 § 6.5.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DefinedCondition {
    /// The client aborted the exchange.
    Aborted,
    /// The account has been disabled.
    AccountDisabled,
    /// The credentials have expired.
    CredentialsExpired,
    /// The mechanism requires encryption of the stream first.
    EncryptionRequired,
    /// The base64 data was malformed.
    IncorrectEncoding,
    /// The authorization identity was rejected.
    InvalidAuthzid,
    /// The requested mechanism is not offered.
    InvalidMechanism,
    /// The request was malformed.
    MalformedRequest,
    /// The mechanism is weaker than server policy permits.
    MechanismTooWeak,
    /// The credentials were wrong, or the exchange failed.
    NotAuthorized,
    /// A temporary server-side error.
    TemporaryAuthFailure,
}

impl FromStr for DefinedCondition {
    type Err = Error;

    fn from_str(s: &str) -> Result<DefinedCondition, Error> {
        Ok(match s {
            "aborted" => Self::Aborted,
            "account-disabled" => Self::AccountDisabled,
            "credentials-expired" => Self::CredentialsExpired,
            "encryption-required" => Self::EncryptionRequired,
            "incorrect-encoding" => Self::IncorrectEncoding,
            "invalid-authzid" => Self::InvalidAuthzid,
            "invalid-mechanism" => Self::InvalidMechanism,
            "malformed-request" => Self::MalformedRequest,
            "mechanism-too-weak" => Self::MechanismTooWeak,
            "not-authorized" => Self::NotAuthorized,
            "temporary-auth-failure" => Self::TemporaryAuthFailure,
            _ => return Err(Error::Other("Unknown SASL defined-condition.")),
        })
    }
}

impl DefinedCondition {
    /// The element name of this condition.
    pub fn element_name(&self) -> &'static str {
        match self {
            Self::Aborted => "aborted",
            Self::AccountDisabled => "account-disabled",
            Self::CredentialsExpired => "credentials-expired",
            Self::EncryptionRequired => "encryption-required",
            Self::IncorrectEncoding => "incorrect-encoding",
            Self::InvalidAuthzid => "invalid-authzid",
            Self::InvalidMechanism => "invalid-mechanism",
            Self::MalformedRequest => "malformed-request",
            Self::MechanismTooWeak => "mechanism-too-weak",
            Self::NotAuthorized => "not-authorized",
            Self::TemporaryAuthFailure => "temporary-auth-failure",
        }
    }
}

/// Announcement of a failed authentication.
#[derive(Debug, Clone, PartialEq)]
pub struct Failure {
    /// The cause of the failure.
    pub defined_condition: DefinedCondition,
}

impl TryFrom<Element> for Failure {
    type Error = FromElementError;

    fn try_from(elem: Element) -> Result<Failure, FromElementError> {
        strix_schema::check_self!(elem, "failure", ns::SASL);
        let mut defined_condition = None;
        for child in elem.children() {
            if !child.has_ns(ns::SASL) || child.name() == "text" {
                continue;
            }
            defined_condition = child.name().parse::<DefinedCondition>().ok();
        }
        Ok(Failure {
            defined_condition: defined_condition
                .ok_or(Error::Other("SASL failure has no defined condition."))?,
        })
    }
}

impl From<Failure> for Element {
    fn from(failure: Failure) -> Element {
        let mut elem = Element::bare("failure", ns::SASL);
        elem.append_child(Element::bare(
            failure.defined_condition.element_name(),
            ns::SASL,
        ));
        elem
    }
}

/// Any SASL nonza which may appear on the stream.
#[derive(Debug, Clone, PartialEq)]
pub enum Nonza {
    /// `<challenge/>`
    Challenge(Challenge),

    /// `<success/>`
    Success(Success),

    /// `<failure/>`
    Failure(Failure),
}

impl TryFrom<Element> for Nonza {
    type Error = FromElementError;

    fn try_from(elem: Element) -> Result<Nonza, FromElementError> {
        if !elem.has_ns(ns::SASL) {
            return Err(FromElementError::Mismatch(elem));
        }
        match elem.name() {
            "challenge" => Ok(Nonza::Challenge(Challenge::try_from(elem)?)),
            "success" => Ok(Nonza::Success(Success::try_from(elem)?)),
            "failure" => Ok(Nonza::Failure(Failure::try_from(elem)?)),
            _ => Err(SchemaFromElementError::Mismatch(elem)),
        }
    }
}

impl From<Nonza> for Element {
    fn from(nonza: Nonza) -> Element {
        match nonza {
            Nonza::Challenge(nonza) => nonza.into(),
            Nonza::Success(nonza) => nonza.into(),
            Nonza::Failure(nonza) => nonza.into(),
        }
    }
}

/// The `<mechanisms/>` stream feature.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SaslMechanisms {
    /// Mechanism names offered by the server, in server order.
    pub mechanisms: Vec<String>,
}

impl TryFrom<Element> for SaslMechanisms {
    type Error = FromElementError;

    fn try_from(elem: Element) -> Result<SaslMechanisms, FromElementError> {
        strix_schema::check_self!(elem, "mechanisms", ns::SASL);
        let mut mechanisms = Vec::new();
        for child in elem.children() {
            if child.is("mechanism", ns::SASL) {
                mechanisms.push(child.text());
            }
        }
        Ok(SaslMechanisms { mechanisms })
    }
}

impl From<SaslMechanisms> for Element {
    fn from(feature: SaslMechanisms) -> Element {
        let mut elem = Element::bare("mechanisms", ns::SASL);
        for mechanism in feature.mechanisms {
            let mut child = Element::bare("mechanism", ns::SASL);
            child.append_text_node(mechanism);
            elem.append_child(child);
        }
        elem
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_with_initial_response() {
        let auth = Auth {
            mechanism: Mechanism::Plain,
            data: b"\x00alice\x00secret".to_vec(),
        };
        let elem: Element = auth.clone().into();
        assert_eq!(elem.attr("mechanism"), Some("PLAIN"));
        assert_eq!(Auth::try_from(elem).unwrap(), auth);
    }

    #[test]
    fn empty_payload_encodes_as_equals_sign() {
        let auth = Auth {
            mechanism: Mechanism::External,
            data: vec![],
        };
        let elem: Element = auth.clone().into();
        assert_eq!(elem.text(), "=");
        assert_eq!(Auth::try_from(elem).unwrap(), auth);
    }

    #[test]
    fn failure_condition() {
        let elem: Element = "<failure xmlns='urn:ietf:params:xml:ns:xmpp-sasl'><not-authorized/></failure>"
            .parse()
            .unwrap();
        let failure = Failure::try_from(elem).unwrap();
        assert_eq!(failure.defined_condition, DefinedCondition::NotAuthorized);
    }

    #[test]
    fn mechanisms_feature() {
        let elem: Element = "<mechanisms xmlns='urn:ietf:params:xml:ns:xmpp-sasl'><mechanism>SCRAM-SHA-1</mechanism><mechanism>PLAIN</mechanism></mechanisms>"
            .parse()
            .unwrap();
        let feature = SaslMechanisms::try_from(elem).unwrap();
        assert_eq!(feature.mechanisms, vec!["SCRAM-SHA-1", "PLAIN"]);
    }
}
