//! Deterministic virtual -> host name translation.
//!
//! Names are built by joining components with `-`, with an `x` token between
//! the object name and each tenant component. Anything that would not fit the
//! 63 byte label limit, or whose components could be re-split differently, is
//! shortened to a 52 byte prefix plus a sha256-derived token.

use sha2::{Digest, Sha256};
use vcsync_core::{Identity, TenantConfig};

/// Longest name produced by [`safe_concat_name`]; also the label value limit.
pub const MAX_NAME_LEN: usize = 63;

const HASHED_PREFIX_LEN: usize = 52;
const HASH_TOKEN_LEN: usize = 10;
const SEPARATOR: &str = "x";

/// Prefix for translated cluster-scoped names; keeps them clear of reserved prefixes like `system-`.
const CLUSTER_PREFIX: &str = "vcluster";

/// Joins `parts` with `-`, hashing the result down when it exceeds [`MAX_NAME_LEN`].
pub fn safe_concat_name(parts: &[&str]) -> String {
    let full = parts.join("-");
    if full.len() > MAX_NAME_LEN {
        hashed_name(&full, &full)
    } else {
        full
    }
}

/// First 10 hex chars of sha256(`input`).
pub fn hash_token(input: &str) -> String {
    let digest = hex::encode(Sha256::digest(input.as_bytes()));
    digest[..HASH_TOKEN_LEN].to_string()
}

fn hashed_name(full: &str, hash_input: &str) -> String {
    let mut cut = HASHED_PREFIX_LEN.min(full.len());
    while !full.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}-{}", &full[..cut], hash_token(hash_input)).replace(".-", "-")
}

/// A component that contains the separator token can be re-split into a
/// different component list producing the same joined string.
fn is_ambiguous(part: &str) -> bool {
    part == SEPARATOR
        || part.contains("-x-")
        || part.starts_with("x-")
        || part.ends_with("-x")
}

/// Joins `components` with the `x` token between them, after an optional prefix.
pub(crate) fn join_components(prefix: Option<&str>, components: &[&str]) -> String {
    let mut parts: Vec<&str> = prefix.into_iter().collect();
    for (i, c) in components.iter().copied().enumerate() {
        if i > 0 {
            parts.push(SEPARATOR);
        }
        parts.push(c);
    }
    if components.iter().any(|c| is_ambiguous(c)) {
        // NUL never appears in object names, so the hash sees the real component boundaries
        hashed_name(&parts.join("-"), &parts.join("\0"))
    } else {
        safe_concat_name(&parts)
    }
}

/// Host name of a virtual object.
///
/// Cluster-scoped kinds: `vcluster-<name>-x-<host namespace>-x-<suffix>`.
/// Namespaced kinds: `<name>-x-<virtual namespace>-x-<suffix>`; the host
/// namespace is fixed per tenant, so the virtual namespace has to be part of
/// the name.
pub fn physical_name(identity: &Identity, tenant: &TenantConfig) -> String {
    match (identity.kind.namespaced, identity.namespace.as_deref()) {
        (true, Some(ns)) => join_components(None, &[&identity.name, ns, &tenant.suffix]),
        _ => join_components(Some(CLUSTER_PREFIX), &[&identity.name, &tenant.host_namespace, &tenant.suffix]),
    }
}

pub use vcsync_core::names::{validate_name, MAX_SUBDOMAIN_LEN};
