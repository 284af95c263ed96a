// Copyright (c) 2024 strix contributors.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! XMPP Ping, XEP-0199.

strix_schema::generate_element!(
    /// An application-level ping. The recipient replies with an empty IQ
    /// result, or `service-unavailable` if it does not implement the
    /// protocol; either answer proves liveness.
    Ping, "ping", crate::ns::PING
);

#[cfg(test)]
mod tests {
    use super::*;
    use strix_schema::Element;

    #[test]
    fn round_trip() {
        let elem: Element = "<ping xmlns='urn:xmpp:ping'/>".parse().unwrap();
        let ping = Ping::try_from(elem).unwrap();
        let back: Element = ping.into();
        assert!(back.is("ping", crate::ns::PING));
    }
}
