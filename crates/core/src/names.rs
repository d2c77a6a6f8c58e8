//! Object name rules enforced by the API server.

use std::sync::OnceLock;

use regex::Regex;

use crate::{Error, Result};

/// Upper bound for object names (DNS-1123 subdomain).
pub const MAX_SUBDOMAIN_LEN: usize = 253;

fn subdomain_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*$")
            .unwrap_or_else(|e| panic!("subdomain regex: {e}"))
    })
}

/// Checks that `name` is accepted as an object name by the API server.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::validation("object name must not be empty"));
    }
    if name.len() > MAX_SUBDOMAIN_LEN {
        return Err(Error::validation(format!(
            "object name {name:?} is {} bytes long, limit is {MAX_SUBDOMAIN_LEN}",
            name.len()
        )));
    }
    if !subdomain_re().is_match(name) {
        return Err(Error::validation(format!("object name {name:?} is not a valid DNS-1123 subdomain")));
    }
    Ok(())
}
