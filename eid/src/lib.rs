//! Endpoint Identifier validation and scheme dispatch.
//!
//! EIDs are kept as strings throughout the node; this crate provides the
//! total, purely lexical checks the rest of the stack relies on. Nothing
//! here resolves or normalizes.

use thiserror::Error;


/// A specialized `Result` type for EID validation.
pub type Result<T> = core::result::Result<T, Error>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("unsupported or missing EID scheme")]
    UnsupportedScheme,

    #[error("DTN node name is empty or contains invalid characters")]
    InvalidNodeName,

    #[error("DTN demux contains non-VCHAR characters")]
    InvalidDemux,

    #[error("ipn component is not a plain decimal number")]
    NotANumber,

    #[error("ipn component has a leading zero")]
    LeadingZero,

    #[error("ipn component does not fit in 64 bits")]
    Overflow,

    #[error("malformed ipn EID structure")]
    MalformedIpn,

    #[error("EID does not identify a local endpoint")]
    NotLocal,
}

/// The EID schemes the node understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Dtn,
    Ipn,
}

/// Classifies an EID by its scheme prefix without validating the remainder.
pub fn scheme_of(eid: &str) -> Option<Scheme> {
    if eid.starts_with("dtn:") {
        Some(Scheme::Dtn)
    } else if eid.starts_with("ipn:") {
        Some(Scheme::Ipn)
    } else {
        None
    }
}

fn is_node_name_char(c: u8) -> bool {
    c.is_ascii_alphanumeric() || c == b'-' || c == b'.' || c == b'_'
}

fn is_vchar(c: u8) -> bool {
    (0x21..=0x7E).contains(&c)
}

fn validate_dtn(eid: &str) -> Result<()> {
    if eid == "dtn:none" {
        return Ok(());
    }
    let Some(rest) = eid.strip_prefix("dtn://") else {
        return Err(Error::InvalidNodeName);
    };
    let Some(slash) = rest.find('/') else {
        return Err(Error::InvalidNodeName);
    };
    let (node_name, demux) = (&rest[..slash], &rest[slash + 1..]);
    if node_name.is_empty() || !node_name.bytes().all(is_node_name_char) {
        return Err(Error::InvalidNodeName);
    }
    if !demux.bytes().all(is_vchar) {
        return Err(Error::InvalidDemux);
    }
    Ok(())
}

/// Parses one decimal component of an ipn EID, returning the value and the
/// unconsumed remainder.
///
/// Rejects everything `strtoull` would sneak past a naive caller: signs,
/// leading zeros on nonzero values, locale separators, and overflow.
fn parse_ipn_component(s: &str) -> Result<(u64, &str)> {
    let digits_end = s
        .bytes()
        .position(|c| !c.is_ascii_digit())
        .unwrap_or(s.len());
    let digits = &s[..digits_end];
    if digits.is_empty() {
        return Err(Error::NotANumber);
    }
    if digits.len() > 1 && digits.starts_with('0') {
        return Err(Error::LeadingZero);
    }
    let value = digits.parse::<u64>().map_err(|_| Error::Overflow)?;
    Ok((value, &s[digits_end..]))
}

/// Parses `ipn:<node>.<service>` into its numeric components.
pub fn parse_ipn(eid: &str) -> Result<(u64, u64)> {
    let Some(rest) = eid.strip_prefix("ipn:") else {
        return Err(Error::UnsupportedScheme);
    };
    let (node, rest) = parse_ipn_component(rest)?;
    let Some(rest) = rest.strip_prefix('.') else {
        return Err(Error::MalformedIpn);
    };
    let (service, rest) = parse_ipn_component(rest)?;
    if !rest.is_empty() {
        return Err(Error::MalformedIpn);
    }
    Ok((node, service))
}

/// Formats an ipn EID from its numeric components.
pub fn format_ipn(node: u64, service: u64) -> String {
    format!("ipn:{node}.{service}")
}

/// Validates an EID in either supported scheme.
pub fn validate(eid: &str) -> Result<()> {
    match scheme_of(eid) {
        Some(Scheme::Dtn) => validate_dtn(eid),
        Some(Scheme::Ipn) => parse_ipn(eid).map(|_| ()),
        None => Err(Error::UnsupportedScheme),
    }
}

/// Validates an EID that must name a local node: an empty demux for the dtn
/// scheme, or service number zero for ipn.
pub fn validate_local(eid: &str) -> Result<()> {
    validate(eid)?;
    match scheme_of(eid) {
        Some(Scheme::Dtn) => {
            let Some(rest) = eid.strip_prefix("dtn://") else {
                return Err(Error::NotLocal);
            };
            // The first slash after the node name must terminate the EID
            match rest.find('/') {
                Some(i) if i == rest.len() - 1 => Ok(()),
                _ => Err(Error::NotLocal),
            }
        }
        Some(Scheme::Ipn) => {
            let (_, service) = parse_ipn(eid)?;
            if service != 0 {
                return Err(Error::NotLocal);
            }
            Ok(())
        }
        None => Err(Error::UnsupportedScheme),
    }
}

/// Validates a DTN demux string used as an agent sink identifier.
pub fn validate_demux(demux: &str) -> Result<()> {
    if !demux.bytes().all(is_vchar) {
        return Err(Error::InvalidDemux);
    }
    Ok(())
}

/// Parses an ipn agent sink identifier, which is a bare service number.
pub fn parse_ipn_service(sink: &str) -> Result<u64> {
    let (service, rest) = parse_ipn_component(sink)?;
    if !rest.is_empty() {
        return Err(Error::MalformedIpn);
    }
    Ok(service)
}

/// Extracts the node id of a valid EID: `dtn://<node>/` for the dtn scheme
/// (trailing slash included), `ipn:<node>.0` for ipn. `dtn:none` has no
/// node id.
pub fn node_id(eid: &str) -> Option<String> {
    match scheme_of(eid)? {
        Scheme::Dtn => {
            if validate_dtn(eid).is_err() || eid == "dtn:none" {
                return None;
            }
            let rest = &eid["dtn://".len()..];
            let slash = rest.find('/')?;
            Some(eid[..="dtn://".len() + slash].to_string())
        }
        Scheme::Ipn => {
            let (node, _) = parse_ipn(eid).ok()?;
            Some(format_ipn(node, 0))
        }
    }
}
