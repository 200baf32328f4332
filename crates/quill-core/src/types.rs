//! Identity hashing and identifiers

/// One-way blake3 digest of `ip|user_agent`, hex encoded
pub fn identity_hash(ip: &str, user_agent: &str) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(ip.as_bytes());
    hasher.update(b"|");
    hasher.update(user_agent.as_bytes());
    hex::encode(hasher.finalize().as_bytes())
}

/// Fresh random identifier with a readable prefix, e.g. `sess_3f2a...`
pub fn new_id(prefix: &str) -> String {
    format!("{}_{}", prefix, uuid::Uuid::new_v4().simple())
}
