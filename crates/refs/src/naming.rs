//! Deterministic names for entities created by expansion.
//!
//! `prefix-<safe(fnv1a64(segments))>`: the 64-bit FNV-1a hash of the
//! concatenated segments, rendered in decimal and mapped through the
//! Kubernetes safe alphabet. Names must stay stable across releases since
//! they are how an earlier expansion is recognized.

use refmap_core::Path;

const SAFE_ALPHABET: &[u8] = b"bcdfghjklmnpqrstvwxz2456789";

fn fnv1a64<'a>(parts: impl IntoIterator<Item = &'a str>) -> u64 {
    let mut h: u64 = 0xcbf29ce484222325; // 64-bit FNV-1a offset
    for part in parts {
        for b in part.as_bytes() {
            h ^= *b as u64;
            h = h.wrapping_mul(0x100000001b3);
        }
    }
    h
}

/// Map every byte onto the alphabet Kubernetes uses for generated names.
pub fn safe_encode(s: &str) -> String {
    s.bytes().map(|b| SAFE_ALPHABET[b as usize % SAFE_ALPHABET.len()] as char).collect()
}

pub fn prefixed_name<S: AsRef<str>>(prefix: &str, segments: &[S]) -> String {
    let hash = fnv1a64(segments.iter().map(|s| s.as_ref()));
    format!("{}-{}", prefix, safe_encode(&hash.to_string()))
}

/// Name of the entity expanded from `path` (relative to the expansion root)
/// of the main object `prefix`. A leading `entry` segment is ignored so the
/// spec and its entry mirror resolve to the same entity.
pub fn entity_name(prefix: &str, path: &Path) -> String {
    let segs = path.segments();
    let segs = match segs.first() {
        Some(first) if first == "entry" => &segs[1..],
        _ => segs,
    };
    prefixed_name(prefix, segs)
}
