/// Embedded DNS for the TUN handler
///
/// Classifies queries into the names we own (.veil services, .snode
/// routers, reverse PTR inside our range, LNS names) and synthesizes
/// answers from the live IP mapping. Everything else is left for the
/// upstream resolvers.

use crate::identity::RouterId;
use crate::service::address::Address;
use simple_dns::rdata::{RData, A, AAAA, PTR};
use simple_dns::{Name, Packet, PacketFlag, ResourceRecord, CLASS, QTYPE, RCODE, TYPE};
use std::net::{Ipv4Addr, Ipv6Addr};
use tracing::debug;

const ANSWER_TTL: u32 = 300;

/// A name we answer ourselves
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookedName {
    /// <base32>.veil
    Service(Address),
    /// <hex>.snode
    Snode(RouterId),
    /// in-addr.arpa / ip6.arpa inside our range
    Reverse(u128),
    /// some-name.veil that is not a base32 address: an LNS name
    Lns(String),
}

/// Parse a query and decide whether we should answer it
///
/// Returns the question name and its classification, or None for queries
/// that belong upstream.
pub fn classify_query(bytes: &[u8], in_range: impl Fn(u128) -> bool) -> Option<(String, QTYPE, HookedName)> {
    let query = Packet::parse(bytes).ok()?;
    let question = query.questions.first()?;
    let qname = question.qname.to_string();
    let qtype = question.qtype;

    match qtype {
        QTYPE::TYPE(TYPE::A) | QTYPE::TYPE(TYPE::AAAA) | QTYPE::TYPE(TYPE::CNAME) => {
            classify_name(&qname).map(|hooked| (qname, qtype, hooked))
        }
        QTYPE::TYPE(TYPE::PTR) => {
            let ip = parse_reverse_name(&qname)?;
            if in_range(ip) {
                Some((qname, qtype, HookedName::Reverse(ip)))
            } else {
                None
            }
        }
        _ => None,
    }
}

/// Classify a forward name by our TLDs
pub fn classify_name(name: &str) -> Option<HookedName> {
    let trimmed = name.trim_end_matches('.').to_lowercase();

    if let Some(label) = trimmed.strip_suffix(".snode") {
        let router = RouterId::from_hex(label).ok()?;
        return Some(HookedName::Snode(router));
    }

    if Address::is_veil_address(&trimmed) {
        return match Address::from_hostname(&trimmed) {
            Ok(addr) => Some(HookedName::Service(addr)),
            // not a raw address: resolve through LNS
            Err(_) => Some(HookedName::Lns(trimmed)),
        };
    }

    None
}

/// Answer an A/AAAA query with the mapped IP
pub fn build_address_reply(query_bytes: &[u8], qname: &str, ip: u128) -> Option<Vec<u8>> {
    let query = Packet::parse(query_bytes).ok()?;
    let qtype = query.questions.first()?.qtype;
    let mut reply = query.into_reply();
    reply.set_flags(PacketFlag::AUTHORITATIVE_ANSWER);

    let name = Name::new_unchecked(qname).into_owned();
    match qtype {
        QTYPE::TYPE(TYPE::A) => {
            let v4 = ip_to_v4(ip)?;
            reply.answers.push(ResourceRecord::new(
                name,
                CLASS::IN,
                ANSWER_TTL,
                RData::A(A::from(v4)),
            ));
        }
        QTYPE::TYPE(TYPE::AAAA) => {
            reply.answers.push(ResourceRecord::new(
                name,
                CLASS::IN,
                ANSWER_TTL,
                RData::AAAA(AAAA::from(Ipv6Addr::from(ip))),
            ));
        }
        _ => return None,
    }

    reply.build_bytes_vec_compressed().ok()
}

/// Answer a PTR query with the mapped hostname
pub fn build_ptr_reply(query_bytes: &[u8], qname: &str, hostname: &str) -> Option<Vec<u8>> {
    let query = Packet::parse(query_bytes).ok()?;
    let mut reply = query.into_reply();
    reply.set_flags(PacketFlag::AUTHORITATIVE_ANSWER);

    let name = Name::new_unchecked(qname).into_owned();
    let target = Name::new_unchecked(hostname).into_owned();
    reply.answers.push(ResourceRecord::new(
        name,
        CLASS::IN,
        ANSWER_TTL,
        RData::PTR(PTR(target)),
    ));
    reply.build_bytes_vec_compressed().ok()
}

/// Answer with NXDOMAIN for names we own but cannot map
pub fn build_nxdomain(query_bytes: &[u8]) -> Option<Vec<u8>> {
    let query = Packet::parse(query_bytes).ok()?;
    let mut reply = query.into_reply();
    reply.set_flags(PacketFlag::AUTHORITATIVE_ANSWER);
    *reply.rcode_mut() = RCODE::NameError;
    reply.build_bytes_vec_compressed().ok()
}

/// Parse `x.y.z.w.in-addr.arpa` or `...ip6.arpa` into a 128-bit IP
fn parse_reverse_name(name: &str) -> Option<u128> {
    let trimmed = name.trim_end_matches('.').to_lowercase();

    if let Some(rest) = trimmed.strip_suffix(".in-addr.arpa") {
        let mut octets: Vec<u8> = Vec::with_capacity(4);
        for part in rest.split('.') {
            octets.push(part.parse().ok()?);
        }
        if octets.len() != 4 {
            return None;
        }
        octets.reverse();
        let v4 = Ipv4Addr::new(octets[0], octets[1], octets[2], octets[3]);
        return Some(v4_to_ip(v4));
    }

    if let Some(rest) = trimmed.strip_suffix(".ip6.arpa") {
        let nibbles: Vec<&str> = rest.split('.').collect();
        if nibbles.len() != 32 {
            return None;
        }
        let mut value: u128 = 0;
        // nibbles come least significant first
        for nibble in nibbles.iter().rev() {
            let digit = u128::from_str_radix(nibble, 16).ok()?;
            if nibble.len() != 1 {
                return None;
            }
            value = (value << 4) | digit;
        }
        return Some(value);
    }

    debug!(name = %trimmed, "unparseable reverse name");
    None
}

/// Map an IPv4 address into the 128-bit interface keyspace
pub fn v4_to_ip(v4: Ipv4Addr) -> u128 {
    Ipv6Addr::from(v4.to_ipv6_mapped()).into()
}

/// Back out an IPv4 address when the 128-bit value is v4-mapped
pub fn ip_to_v4(ip: u128) -> Option<Ipv4Addr> {
    let v6 = Ipv6Addr::from(ip);
    v6.to_ipv4_mapped()
}
