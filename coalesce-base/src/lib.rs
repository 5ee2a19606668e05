mod error;
mod ids;
mod safeint;

pub use error::{err, malformed, misuse, Error, Result};
pub use ids::{ReplicaId, REPLICA_ID_LEN};
pub use safeint::{safe_index, safe_len, safe_u64, COUNTER_MODULUS, MAX_SAFE_INT};
