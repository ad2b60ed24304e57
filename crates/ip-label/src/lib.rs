//! Encoding of IP addresses into DNS labels, and decoding of query
//! names under a root domain back into structured requests.
//!
//! Names have the shape `<leaf>.<uuid>.<root>`, where the leaf is either
//! `_acme-challenge` or a dashed IP address tagged with its family, such
//! as `127-0-0-1-v4` or `2001-db8--1-v6`. Nothing here is stored: a name
//! either decodes or it doesn't.
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use uuid::Uuid;

/// A query name under the root domain, decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodedName {
    /// The root domain itself.
    Apex,
    /// A label present in the static records configuration.
    Static(String),
    /// `_acme-challenge.<id>`
    Challenge(Uuid),
    /// `<dashed-v4>-v4.<id>`
    A(Uuid, Ipv4Addr),
    /// `<dashed-v6>-v6.<id>`
    Aaaa(Uuid, Ipv6Addr),
}

fn normalize(name: &str) -> String {
    name.trim_end_matches('.').to_ascii_lowercase()
}

/// Decode a fully-qualified query name relative to `root_domain`.
///
/// `is_static` reports whether a label (relative to the root) has static
/// records configured; a static label shadows any algorithmic decoding
/// that would otherwise apply to it.
///
/// Returns `None` for names outside the root domain and for names whose
/// leaf is ill-formed; the caller is expected to answer those silently.
pub fn decode<F>(name: &str, root_domain: &str, is_static: F) -> Option<DecodedName>
where
    F: Fn(&str) -> bool,
{
    let name = normalize(name);
    let root = normalize(root_domain);

    if name == root {
        return Some(DecodedName::Apex);
    }

    let rel = name.strip_suffix(&format!(".{root}"))?;

    if is_static(rel) {
        return Some(DecodedName::Static(rel.to_string()));
    }

    let mut labels = rel.split('.');
    let (leaf, id_label) = (labels.next()?, labels.next()?);
    if labels.next().is_some() {
        return None;
    }

    let id = Uuid::parse_str(id_label).ok()?;

    if leaf == "_acme-challenge" {
        return Some(DecodedName::Challenge(id));
    }

    let last = leaf.rfind('-')?;
    let (value, suffix) = (&leaf[..last], &leaf[last + 1..]);

    match suffix {
        "v4" => {
            let ip: Ipv4Addr = value.replace('-', ".").parse().ok()?;
            Some(DecodedName::A(id, ip))
        }
        "v6" => {
            // The IPv4-in-IPv6 textual form is not representable in a
            // label; anything that would need a `.` is rejected rather
            // than guessed at.
            if value.contains('.') {
                return None;
            }
            let ip: Ipv6Addr = value.replace('-', ":").parse().ok()?;
            Some(DecodedName::Aaaa(id, ip))
        }
        _ => None,
    }
}

/// The `-v4` leaf label for an IPv4 address, e.g. `127-0-0-1-v4`.
pub fn v4_label(ip: Ipv4Addr) -> String {
    format!("{}-v4", ip.to_string().replace('.', "-"))
}

/// The `-v6` leaf label for an IPv6 address, e.g. `2001-db8--1-v6`.
///
/// IPv4-mapped addresses render with embedded dots and must be
/// canonicalized to their v4 form first; use [`domain_for_ip`] unless the
/// address is known not to be mapped.
pub fn v6_label(ip: Ipv6Addr) -> String {
    format!("{}-v6", ip.to_string().replace(':', "-"))
}

/// The full name encoding `ip` under `root_domain`.
///
/// IPv4-mapped IPv6 addresses are canonicalized to their IPv4 form, so
/// the produced name always round-trips through [`decode`].
pub fn domain_for_ip(root_domain: &str, ip: IpAddr) -> String {
    let root = normalize(root_domain);

    let label = match ip {
        IpAddr::V4(v4) => v4_label(v4),
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => v4_label(v4),
            None => v6_label(v6),
        },
    };

    format!("{label}.{root}")
}
