use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;

use crate::types::MutationId;

/// Generates a mutation id from a nanosecond clock reading plus a random
/// 32-bit suffix. Collisions are improbable, not impossible.
pub fn generate_mutation_id() -> MutationId {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let suffix: u32 = rand::thread_rng().r#gen();
    format!("m-{nanos:x}-{suffix:08x}")
}
