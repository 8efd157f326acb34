use sha2::{Digest, Sha256};
use std::fmt::Write;

/// Hex encoded SHA-256 of `bytes`, truncated to 16 characters.
pub fn content_hash<B: AsRef<[u8]>>(bytes: B) -> String {
    let digest = Sha256::digest(bytes.as_ref());
    let mut hex = String::with_capacity(16);
    for byte in digest.iter().take(8) {
        let _ = write!(hex, "{byte:02x}");
    }
    hex
}

/// Pod name prefix shared by the replicas of one deployment, i.e. the pod
/// name without its replica-set and pod suffixes.
pub fn pod_prefix(pod_name: &str) -> Option<&str> {
    let mut parts = pod_name.rsplitn(3, '-');
    let _pod = parts.next()?;
    let _replica_set = parts.next()?;
    parts.next().filter(|prefix| !prefix.is_empty())
}
