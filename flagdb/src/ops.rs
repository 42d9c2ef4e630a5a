//! The transport-agnostic operation surface, as argument structs a
//! dispatcher or wire codec can serialize directly.

use serde_derive::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetArgs {
    pub chain: u64,
    pub tb_name: Vec<u8>,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetWithFlagArgs {
    pub chain: u64,
    pub flag: Vec<u8>,
    pub tb_name: Vec<u8>,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetArgs {
    pub chain: u64,
    pub tb_name: Vec<u8>,
    pub key: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlagArgs {
    pub chain: u64,
    pub flag: Vec<u8>,
}

/// One request across the whole operation surface. A transport (the
/// `flagd` service, or a test harness) maps this to a `Dispatcher` call and
/// serializes the `Reply`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    OpenFlag(FlagArgs),
    GetLastFlag { chain: u64 },
    Commit(FlagArgs),
    Cancel(FlagArgs),
    Rollback(FlagArgs),
    Set(SetArgs),
    SetWithFlag(SetWithFlagArgs),
    Get(GetArgs),
    Exist(GetArgs),
    GetNextKey(GetArgs),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Reply {
    Ok,
    Bytes(Vec<u8>),
    Bool(bool),
    Err(String),
}
