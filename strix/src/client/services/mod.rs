// Copyright (c) 2024 strix contributors.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Built-in services: liveness ping, service discovery, roster.

mod disco;
mod ping;
mod roster;

pub use disco::DiscoService;
pub use ping::PingService;
pub use roster::RosterService;
