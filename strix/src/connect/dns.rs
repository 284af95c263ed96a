// Copyright (c) 2024 strix contributors.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Endpoint discovery via DNS SRV.
//!
//! Both the `_xmpps-client._tcp` (direct TLS, XEP-0368) and the
//! `_xmpp-client._tcp` (STARTTLS) services are looked up; the union of the
//! records is ordered by SRV priority with proper weighted random
//! selection among records of equal priority (RFC 2782).

use std::net::SocketAddr;

use futures::{future::select_ok, FutureExt};
use hickory_resolver::{
    config::LookupIpStrategy, error::ResolveErrorKind, name_server::TokioConnectionProvider,
    system_conf::read_system_conf, IntoName, TokioAsyncResolver,
};
use log::{debug, warn};
use rand::Rng;
use tokio::net::TcpStream;

use crate::error::Error;

use super::{Endpoint, Flavour};

const XMPP_CLIENT_SRV: &str = "_xmpp-client._tcp";
const XMPPS_CLIENT_SRV: &str = "_xmpps-client._tcp";
const FALLBACK_PORT: u16 = 5222;

/// A raw SRV record of one of the two services, before ordering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SrvCandidate {
    pub priority: u16,
    pub weight: u16,
    pub host: String,
    pub port: u16,
    pub flavour: Flavour,
}

/// Order SRV candidates per RFC 2782: priority ascending; within one
/// priority, repeated weighted random selection (records with weight zero
/// are eligible but unlikely).
pub(crate) fn order_candidates<R: Rng>(
    mut records: Vec<SrvCandidate>,
    rng: &mut R,
) -> Vec<Endpoint> {
    records.sort_by_key(|record| record.priority);
    let mut ordered = Vec::with_capacity(records.len());
    let mut start = 0;
    while start < records.len() {
        let priority = records[start].priority;
        let end = start
            + records[start..]
                .iter()
                .take_while(|record| record.priority == priority)
                .count();
        let mut remaining: Vec<SrvCandidate> = records[start..end].to_vec();
        while !remaining.is_empty() {
            // weight zero must stay selectable, hence the +1 per slot
            let total: u32 = remaining.iter().map(|r| r.weight as u32 + 1).sum();
            let mut pick = rng.gen_range(0..total);
            let mut index = 0;
            for (i, record) in remaining.iter().enumerate() {
                let slot = record.weight as u32 + 1;
                if pick < slot {
                    index = i;
                    break;
                }
                pick -= slot;
            }
            let chosen = remaining.remove(index);
            ordered.push(Endpoint {
                host: chosen.host,
                port: chosen.port,
                flavour: chosen.flavour,
            });
        }
        start = end;
    }
    ordered
}

enum SrvOutcome {
    Records(Vec<SrvCandidate>),
    /// The lookup failed with a nameserver error (anything but "the name
    /// exists and has no such records").
    Failed(Error),
    Timeout(Error),
}

async fn lookup_one(
    resolver: &TokioAsyncResolver,
    service: &str,
    domain: &str,
    flavour: Flavour,
) -> SrvOutcome {
    let name = match format!("{}.{}.", service, domain).into_name() {
        Ok(name) => name,
        Err(e) => return SrvOutcome::Failed(Error::Resolve(e.into())),
    };
    match resolver.srv_lookup(name).await {
        Ok(lookup) => {
            let mut records = Vec::new();
            for srv in lookup.iter() {
                let target = srv.target().to_ascii();
                // a single record with target "." means the service is
                // decidedly not provided
                if target == "." {
                    debug!("{} service disabled for {} via root target", service, domain);
                    return SrvOutcome::Records(vec![]);
                }
                records.push(SrvCandidate {
                    priority: srv.priority(),
                    weight: srv.weight(),
                    host: target.trim_end_matches('.').to_owned(),
                    port: srv.port(),
                    flavour,
                });
            }
            SrvOutcome::Records(records)
        }
        Err(e) => match e.kind() {
            ResolveErrorKind::NoRecordsFound { .. } => SrvOutcome::Records(vec![]),
            ResolveErrorKind::Timeout => SrvOutcome::Timeout(Error::Resolve(e)),
            _ => SrvOutcome::Failed(Error::Resolve(e)),
        },
    }
}

async fn lookup_both(
    resolver: &TokioAsyncResolver,
    domain: &str,
) -> (SrvOutcome, SrvOutcome) {
    let direct = lookup_one(resolver, XMPPS_CLIENT_SRV, domain, Flavour::DirectTls).await;
    let starttls = lookup_one(resolver, XMPP_CLIENT_SRV, domain, Flavour::StartTls).await;
    (direct, starttls)
}

/// Discover the candidate endpoints for `domain`.
///
/// Bare IP addresses produce a single candidate and skip SRV resolution
/// entirely. A domain without SRV records falls back to the domain itself
/// on the default client port.
pub async fn discover_endpoints(domain: &str) -> Result<Vec<Endpoint>, Error> {
    if domain.parse::<core::net::IpAddr>().is_ok() {
        return Ok(vec![Endpoint {
            host: domain.to_owned(),
            port: FALLBACK_PORT,
            flavour: Flavour::StartTls,
        }]);
    }

    let ascii_domain = idna::domain_to_ascii(domain)?;
    let mut resolver = TokioAsyncResolver::tokio_from_system_conf()?;

    let mut outcome = lookup_both(&resolver, &ascii_domain).await;
    if matches!(outcome.0, SrvOutcome::Timeout(_)) || matches!(outcome.1, SrvOutcome::Timeout(_)) {
        // Reconfigure the resolver from the system configuration once;
        // the first timeout may be due to a stale resolv.conf (e.g. after
        // a network change).
        debug!("SRV lookup timed out, reloading resolver configuration and retrying once");
        resolver = TokioAsyncResolver::tokio_from_system_conf()?;
        outcome = lookup_both(&resolver, &ascii_domain).await;
    }

    let records = match outcome {
        (SrvOutcome::Records(mut direct), SrvOutcome::Records(starttls)) => {
            direct.extend(starttls);
            direct
        }
        (SrvOutcome::Records(records), SrvOutcome::Failed(e) | SrvOutcome::Timeout(e))
        | (SrvOutcome::Failed(e) | SrvOutcome::Timeout(e), SrvOutcome::Records(records)) => {
            // One of the two services failed to resolve while the other
            // succeeded; proceed with the partial result.
            warn!(
                "one SRV lookup for {} failed ({}); continuing with partial result",
                domain, e
            );
            records
        }
        (SrvOutcome::Failed(e) | SrvOutcome::Timeout(e), _) => return Err(e),
    };

    if records.is_empty() {
        return Ok(vec![Endpoint {
            host: ascii_domain,
            port: FALLBACK_PORT,
            flavour: Flavour::StartTls,
        }]);
    }

    Ok(order_candidates(records, &mut rand::thread_rng()))
}

/// Connect over TCP, resolving A/AAAA records (happy eyeballs).
pub async fn connect_tcp(host: &str, port: u16) -> Result<TcpStream, Error> {
    let ascii_domain = idna::domain_to_ascii(host)?;

    if let Ok(ip) = ascii_domain.parse() {
        return Ok(TcpStream::connect(&SocketAddr::new(ip, port)).await?);
    }

    let (config, mut options) = read_system_conf()?;
    options.ip_strategy = LookupIpStrategy::Ipv4AndIpv6;
    let resolver = TokioAsyncResolver::new(config, options, TokioConnectionProvider::default());

    let ips = resolver.lookup_ip(ascii_domain).await?;

    // Happy Eyeballs: connect to all records in parallel, return the
    // first to succeed
    select_ok(
        ips.into_iter()
            .map(|ip| TcpStream::connect(SocketAddr::new(ip, port)).boxed()),
    )
    .await
    .map(|(result, _)| result)
    .map_err(|_| Error::Disconnected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    fn candidate(priority: u16, weight: u16, host: &str, flavour: Flavour) -> SrvCandidate {
        SrvCandidate {
            priority,
            weight,
            host: host.to_owned(),
            port: 5222,
            flavour,
        }
    }

    #[test]
    fn priorities_dominate_weights() {
        let mut rng = StdRng::seed_from_u64(1);
        let ordered = order_candidates(
            vec![
                candidate(20, 10_000, "heavy-low-prio", Flavour::StartTls),
                candidate(10, 0, "light-high-prio", Flavour::DirectTls),
            ],
            &mut rng,
        );
        assert_eq!(ordered[0].host, "light-high-prio");
        assert_eq!(ordered[0].flavour, Flavour::DirectTls);
        assert_eq!(ordered[1].host, "heavy-low-prio");
    }

    #[test]
    fn all_candidates_survive_ordering() {
        let mut rng = StdRng::seed_from_u64(7);
        let records: Vec<_> = (0u16..10)
            .map(|i| candidate(1, i * 10, &format!("host-{}", i), Flavour::StartTls))
            .collect();
        let ordered = order_candidates(records.clone(), &mut rng);
        assert_eq!(ordered.len(), records.len());
        for record in &records {
            assert!(ordered.iter().any(|ep| ep.host == record.host));
        }
    }

    #[test]
    fn weighted_selection_prefers_heavy_records() {
        // over many seeds, the much heavier record must come out first in
        // the clear majority of runs
        let mut wins = 0;
        for seed in 0..100 {
            let mut rng = StdRng::seed_from_u64(seed);
            let ordered = order_candidates(
                vec![
                    candidate(5, 1, "light", Flavour::StartTls),
                    candidate(5, 1000, "heavy", Flavour::StartTls),
                ],
                &mut rng,
            );
            if ordered[0].host == "heavy" {
                wins += 1;
            }
        }
        assert!(wins > 90, "heavy record won only {} of 100 runs", wins);
    }
}
