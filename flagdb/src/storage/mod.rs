pub mod bucket_engine;
pub mod record;

use serde_derive::{Deserialize, Serialize};

/// Engine status, used for diagnostics and tests.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Status {
    /// The name of the storage engine.
    pub name: String,
    /// The number of live keys across all buckets.
    pub keys: u64,
    /// The logical size of live key/value pairs (keys + values, no framing).
    pub size: u64,
}

/// Type-byte discriminators prefixed onto a user table name `T` to form the
/// three parallel bucket names `V(T)`, `F(T)`, `P(T)`: current value, flag
/// annotation, and prior value.
pub mod bucket_kind {
    pub const VALUE: u8 = 0;
    pub const FLAG: u8 = 1;
    pub const PRIOR_VALUE: u8 = 2;
}

/// Builds the on-disk bucket name for `(kind, table)`: one discriminator
/// byte followed by the raw table name bytes.
pub fn bucket_name(kind: u8, table: &[u8]) -> Vec<u8> {
    let mut name = Vec::with_capacity(table.len() + 1);
    name.push(kind);
    name.extend_from_slice(table);
    name
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn bucket_name_prefixes_kind_byte() {
        let name = bucket_name(bucket_kind::VALUE, b"tbName");
        assert_eq!(name[0], bucket_kind::VALUE);
        assert_eq!(&name[1..], b"tbName");
    }
}
