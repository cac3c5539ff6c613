use ring::digest;

/// Stable pseudonymous key for a raw device identifier: lowercase hex of its
/// SHA-256 digest. Only this form is ever persisted, logged, or audited.
pub fn hash_device_id(raw_device_id: &str) -> String {
    let digest = digest::digest(&digest::SHA256, raw_device_id.as_bytes());
    hex::encode(digest.as_ref())
}
