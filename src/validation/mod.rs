/// Syntax and policy validation for identifiers
///
/// Handles, NSIDs, record keys, DIDs, and AT-URIs are all validated here.
/// Handle policy (service domains, reserved names) is configuration-driven;
/// the syntax rules are fixed.
use crate::error::{PdsError, PdsResult};

/// Reserved front parts that may not be registered as service handles
/// unless explicitly allowed.
const RESERVED_SUBDOMAINS: &[&str] = &[
    "admin", "administrator", "mod", "moderator", "staff", "support", "help",
    "info", "contact", "abuse", "security", "root", "www", "mail", "email",
    "api", "xrpc", "atproto", "app", "official", "team", "about", "blog",
    "status", "well-known",
];

/// Slur fragments that block handle registration outright. Kept short and
/// unambiguous; longer pattern lists belong in deployment config.
const BLOCKED_FRAGMENTS: &[&str] = &["nigger", "faggot", "kike", "tranny"];

/// Maximum total handle length
const MAX_HANDLE_LEN: usize = 253;

/// Service-handle front part length bounds
const MIN_FRONT_LEN: usize = 3;
const MAX_FRONT_LEN: usize = 18;

/// Lowercase and trim a handle
pub fn normalize_handle(handle: &str) -> String {
    handle.trim().trim_end_matches('.').to_lowercase()
}

/// Basic domain-name shape: dot-separated labels of [a-z0-9-]
pub fn ensure_valid_handle(handle: &str) -> PdsResult<()> {
    if handle.is_empty() || handle.len() > MAX_HANDLE_LEN {
        return Err(PdsError::invalid_request("Handle has invalid length"));
    }
    let labels: Vec<&str> = handle.split('.').collect();
    if labels.len() < 2 {
        return Err(PdsError::invalid_request(
            "Handle must be a domain name with at least two segments",
        ));
    }
    for label in &labels {
        if label.is_empty()
            || label.len() > 63
            || label.starts_with('-')
            || label.ends_with('-')
            || !label
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        {
            return Err(PdsError::invalid_request(format!(
                "Handle segment {:?} is invalid",
                label
            )));
        }
    }
    // TLD must not be all-numeric
    if labels
        .last()
        .map(|tld| tld.chars().all(|c| c.is_ascii_digit()))
        .unwrap_or(true)
    {
        return Err(PdsError::invalid_request("Handle TLD is invalid"));
    }
    for fragment in BLOCKED_FRAGMENTS {
        if handle.contains(fragment) {
            return Err(PdsError::invalid_request("Handle is not allowed"));
        }
    }
    Ok(())
}

/// Which service domain (if any) a handle falls under
pub fn service_domain_for<'a>(handle: &str, service_domains: &'a [String]) -> Option<&'a str> {
    service_domains
        .iter()
        .map(|d| d.as_str())
        .find(|domain| handle.ends_with(*domain))
}

/// Extra constraints on handles under one of our own service domains
pub fn ensure_valid_service_handle(
    handle: &str,
    domain: &str,
    allow_reserved: bool,
) -> PdsResult<()> {
    let front = handle
        .strip_suffix(domain)
        .ok_or_else(|| PdsError::invalid_request("Handle is not under the service domain"))?;
    if front.contains('.') {
        return Err(PdsError::invalid_request(
            "Service handles may not contain additional segments",
        ));
    }
    if front.len() < MIN_FRONT_LEN || front.len() > MAX_FRONT_LEN {
        return Err(PdsError::invalid_request(format!(
            "Service handle names must be {}-{} characters",
            MIN_FRONT_LEN, MAX_FRONT_LEN
        )));
    }
    if !allow_reserved && RESERVED_SUBDOMAINS.contains(&front) {
        return Err(PdsError::invalid_request("Handle is reserved"));
    }
    Ok(())
}

/// NSID: reverse-DNS collection identifier, at least three segments
pub fn ensure_valid_nsid(nsid: &str) -> PdsResult<()> {
    let segments: Vec<&str> = nsid.split('.').collect();
    if nsid.len() > 317 || segments.len() < 3 {
        return Err(PdsError::invalid_request(format!(
            "Invalid collection NSID: {:?}",
            nsid
        )));
    }
    for (i, segment) in segments.iter().enumerate() {
        let name_segment = i == segments.len() - 1;
        if segment.is_empty()
            || segment.len() > 63
            || segment.starts_with('-')
            || segment.ends_with('-')
            || !segment.chars().all(|c| {
                c.is_ascii_alphanumeric() || c == '-'
            })
            || (!name_segment && segment.chars().next().is_some_and(|c| c.is_ascii_digit()))
        {
            return Err(PdsError::invalid_request(format!(
                "Invalid collection NSID: {:?}",
                nsid
            )));
        }
    }
    Ok(())
}

/// Record key: short opaque string, restricted charset
pub fn ensure_valid_rkey(rkey: &str) -> PdsResult<()> {
    if rkey.is_empty()
        || rkey.len() > 512
        || rkey == "."
        || rkey == ".."
        || !rkey
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | '~' | ':'))
    {
        return Err(PdsError::invalid_request(format!(
            "Invalid record key: {:?}",
            rkey
        )));
    }
    Ok(())
}

/// DID: `did:<method>:<identifier>` with a known method
pub fn ensure_valid_did(did: &str) -> PdsResult<()> {
    let mut parts = did.splitn(3, ':');
    let (scheme, method, ident) = (
        parts.next().unwrap_or(""),
        parts.next().unwrap_or(""),
        parts.next().unwrap_or(""),
    );
    if scheme != "did"
        || !matches!(method, "plc" | "web" | "key")
        || ident.is_empty()
        || did.len() > 2048
        || !ident
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | ':' | '%'))
    {
        return Err(PdsError::invalid_request(format!("Invalid DID: {:?}", did)));
    }
    Ok(())
}

pub fn is_valid_did(did: &str) -> bool {
    ensure_valid_did(did).is_ok()
}

/// AT-URI: `at://<authority>/<collection>/<rkey>`
pub fn ensure_valid_at_uri(uri: &str) -> PdsResult<()> {
    let rest = uri
        .strip_prefix("at://")
        .ok_or_else(|| PdsError::invalid_request(format!("Invalid AT-URI: {:?}", uri)))?;
    let parts: Vec<&str> = rest.split('/').collect();
    match parts.as_slice() {
        [authority] => {
            ensure_authority(authority)?;
        }
        [authority, collection] => {
            ensure_authority(authority)?;
            ensure_valid_nsid(collection)?;
        }
        [authority, collection, rkey] => {
            ensure_authority(authority)?;
            ensure_valid_nsid(collection)?;
            ensure_valid_rkey(rkey)?;
        }
        _ => {
            return Err(PdsError::invalid_request(format!(
                "Invalid AT-URI: {:?}",
                uri
            )))
        }
    }
    Ok(())
}

pub fn is_valid_at_uri(uri: &str) -> bool {
    ensure_valid_at_uri(uri).is_ok()
}

fn ensure_authority(authority: &str) -> PdsResult<()> {
    if authority.starts_with("did:") {
        ensure_valid_did(authority)
    } else {
        ensure_valid_handle(authority)
    }
}

/// Split an AT-URI into (did, collection, rkey)
pub fn parse_at_uri(uri: &str) -> PdsResult<(String, String, String)> {
    ensure_valid_at_uri(uri)?;
    let rest = uri.trim_start_matches("at://");
    let parts: Vec<&str> = rest.split('/').collect();
    if parts.len() != 3 {
        return Err(PdsError::invalid_request(format!(
            "AT-URI does not name a record: {:?}",
            uri
        )));
    }
    Ok((
        parts[0].to_string(),
        parts[1].to_string(),
        parts[2].to_string(),
    ))
}
