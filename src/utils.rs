use sha1::{Digest, Sha1};

/// SHA1 of `bytes`, hex encoded.
///
/// All content identities in dflow (task, job and submission hashes) go
/// through this function so every hash in the system has the same shape.
pub fn sha1_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}
