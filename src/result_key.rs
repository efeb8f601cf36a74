//! Cache keys for transformed results

use crate::params::Params;
use xxhash_rust::xxh3::xxh3_128;

/// Derives the result-storage key for a resource and its parameters
pub trait ResultKey: Send + Sync {
    fn derive(&self, key: &str, params: &Params) -> String;
}

/// `normalized_params/key`, or `key` when there are no parameters
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultResultKey;

impl ResultKey for DefaultResultKey {
    fn derive(&self, key: &str, params: &Params) -> String {
        if params.is_empty() {
            key.to_string()
        } else {
            format!("{}/{}", params.normalized(), key)
        }
    }
}

/// Hashed, directory-sharded keys: `ab/cd/abcd…[.ext]`
///
/// Keeps keys short and spreads entries across directories when results are
/// stored on a filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct HashedResultKey {
    /// Append the requested output format as a file extension
    pub with_extension: bool,
}

impl HashedResultKey {
    pub fn new(with_extension: bool) -> Self {
        HashedResultKey { with_extension }
    }
}

impl ResultKey for HashedResultKey {
    fn derive(&self, key: &str, params: &Params) -> String {
        let digest = format!("{:032x}", xxh3_128(DefaultResultKey.derive(key, params).as_bytes()));
        let mut out = format!("{}/{}/{}", &digest[0..2], &digest[2..4], digest);
        if self.with_extension {
            if let Some(format) = params.format() {
                out.push('.');
                out.push_str(format.as_str());
            }
        }
        out
    }
}
