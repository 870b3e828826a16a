//! Client/server protocol compatibility.

/// Metadata header the client stamps its semver into.
pub const CLIENT_VERSION_HEADER: &str = "x-helm-api-client";

/// The server's protocol version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

fn major(v: &str) -> Option<u64> {
    v.trim_start_matches('v').split('.').next()?.parse().ok()
}

/// Compatible when both sides parse and share a major version.
pub fn is_compatible(client: &str, server: &str) -> bool {
    match (major(client), major(server)) {
        (Some(c), Some(s)) => c == s,
        _ => false,
    }
}
