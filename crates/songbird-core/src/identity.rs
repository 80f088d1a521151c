use sha2::{Digest, Sha256};

/// Number of hex characters kept from the digest (48 bits).
pub const TASK_ID_LEN: usize = 12;

/// Derives the stable identifier of a task from its composite key.
///
/// The output path is deliberately not part of the key: a task keeps its id
/// when it is retried into a different location.
///
/// Ids are the first 12 hex characters of SHA-256 over `subject|variant|source`.
/// Earlier tooling truncated an MD5 digest instead, so an id printed by it will
/// not resolve here. Checkpoint files never store ids and load unchanged.
pub fn task_id(subject: &str, variant: &str, source_filename: &str) -> String {
    let key = format!("{}|{}|{}", subject, variant, source_filename);
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    let digest = hasher.finalize();
    let mut hex = format!("{:x}", digest);
    hex.truncate(TASK_ID_LEN);
    hex
}
