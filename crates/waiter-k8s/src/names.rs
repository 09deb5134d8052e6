//! Workload name derivation
//!
//! Maps a Waiter service-id onto a cluster-legal workload name. The
//! mapping is deterministic and collision-resistant: the hash segments
//! embedded in the service-id are preserved (fully when the budget
//! allows, outer segments otherwise) and the human-readable prefix
//! absorbs whatever truncation the length budget forces.

use waiter_core::{Error, Result, ServiceId};

/// Width of one outer hash segment in the service-id
const HASH_SEGMENT_LEN: usize = 8;

/// Name budget at which the full hash is preserved
const FULL_HASH_THRESHOLD: usize = 48;

/// Derive the workload name for a service.
///
/// The service-id is expected to end in `<prefix>-<hash>` where `hash`
/// is at least 16 hex characters. The output is
/// `<prefix'>-<hash-suffix>` bounded by
/// `max_name_length - pod_suffix_length - 1`, leaving room for the
/// pod-name suffix the orchestrator appends and its separator.
pub fn service_id_to_app_name(
    service_id: &ServiceId,
    max_name_length: usize,
    pod_suffix_length: usize,
) -> Result<String> {
    let (prefix, hash) = split_service_id(service_id)?;

    let budget = max_name_length
        .checked_sub(pod_suffix_length + 1)
        .ok_or_else(|| Error::malformed("max-name-length smaller than the pod suffix"))?;

    let hash_suffix = if budget >= FULL_HASH_THRESHOLD {
        hash.to_string()
    } else {
        let x = &hash[..HASH_SEGMENT_LEN];
        let z = &hash[hash.len() - HASH_SEGMENT_LEN..];
        format!("{}{}", x, z)
    };

    let prefix_budget = budget
        .checked_sub(hash_suffix.len() + 1)
        .ok_or_else(|| Error::malformed("name budget cannot hold the hash suffix"))?;
    let prefix = if prefix.len() > prefix_budget {
        &prefix[..prefix_budget]
    } else {
        prefix
    };

    Ok(format!("{}-{}", prefix, hash_suffix))
}

/// Split a service-id into its trailing hash segment and the dash-free
/// prefix component immediately before it.
fn split_service_id(service_id: &ServiceId) -> Result<(&str, &str)> {
    let id = service_id.as_str();
    let (head, hash) = id
        .rsplit_once('-')
        .ok_or_else(|| Error::malformed(format!("service-id {} has no hash segment", id)))?;

    if hash.len() < 2 * HASH_SEGMENT_LEN || !hash.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(Error::malformed(format!(
            "service-id {} does not end in a hash of at least {} hex characters",
            id,
            2 * HASH_SEGMENT_LEN
        )));
    }

    // The prefix is only the last dash-free component; "waiter-myapp-<hash>"
    // shortens to "myapp-...".
    let prefix = head.rsplit('-').next().unwrap_or(head);
    if prefix.is_empty() {
        return Err(Error::malformed(format!(
            "service-id {} has an empty name prefix",
            id
        )));
    }

    Ok((prefix, hash))
}
