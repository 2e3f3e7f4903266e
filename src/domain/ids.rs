//! Branded id types.
//!
//! Job ids, ask ids, lease owners, and commit hashes are all opaque strings
//! on the wire, but semantically distinct. Newtypes keep them from being
//! cross-assigned inside the scheduler; validation happens at the boundary.

use rand::Rng;
use serde::{Deserialize, Serialize};

macro_rules! branded_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

branded_id!(
    /// Identifier of a job (`job_<base36 ms>_<random8>`).
    JobId
);
branded_id!(
    /// Identifier of an Ask (UUID v4).
    AskId
);
branded_id!(
    /// Identity of the worker holding a lease.
    LeaseOwner
);
branded_id!(
    /// A git commit hash pinned by a job spec.
    CommitHash
);

impl JobId {
    /// Generate a fresh job id: `"job_" + base36(now_ms) + "_" + random8`.
    pub fn generate() -> Self {
        let now_ms = chrono::Utc::now().timestamp_millis();
        Self(format!("job_{}_{}", base36(now_ms as u64), random_suffix(8)))
    }
}

impl AskId {
    /// Generate a fresh ask id (UUID v4).
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl LeaseOwner {
    /// Generate a worker identity: `"worker-" + random token`.
    pub fn generate(index: usize) -> Self {
        Self(format!("worker-{index}-{}", random_suffix(6)))
    }
}

/// Render a u64 in lowercase base36.
fn base36(mut n: u64) -> String {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if n == 0 {
        return "0".to_string();
    }
    let mut buf = Vec::with_capacity(13);
    while n > 0 {
        buf.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    buf.reverse();
    String::from_utf8(buf).expect("base36 digits are ascii")
}

/// Random lowercase-alphanumeric suffix of the given length.
fn random_suffix(len: usize) -> String {
    const CHARS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| CHARS[rng.gen_range(0..CHARS.len())] as char)
        .collect()
}
