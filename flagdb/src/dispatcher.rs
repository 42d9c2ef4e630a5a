//! The tenant dispatcher: one `FlagManager` per tenant id, lazily
//! constructed on first use.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crate::error::{CResult, Error};
use crate::manager::FlagManager;
use crate::ops::{FlagArgs, GetArgs, Reply, Request, SetArgs, SetWithFlagArgs};

pub struct Dispatcher {
    root: PathBuf,
    managers: Mutex<HashMap<u64, Arc<Mutex<FlagManager>>>>,
    closed: Mutex<bool>,
}

impl Dispatcher {
    pub fn new(root: PathBuf) -> CResult<Self> {
        std::fs::create_dir_all(&root)?;
        Ok(Self { root, managers: Mutex::new(HashMap::new()), closed: Mutex::new(false) })
    }

    fn tenant_dir(&self, chain: u64) -> PathBuf {
        self.root.join(format!("db_{chain}"))
    }

    /// Fetches the manager for `chain`, constructing it on first use. Holds
    /// the map lock only long enough to fetch or insert.
    fn manager(&self, chain: u64) -> CResult<Arc<Mutex<FlagManager>>> {
        if *self.closed.lock().unwrap() {
            return Err(Error::ManagerUnavailable("dispatcher is closed".to_string()));
        }

        let mut managers = self.managers.lock().unwrap();
        if let Some(mgr) = managers.get(&chain) {
            return Ok(mgr.clone());
        }

        let dir = self.tenant_dir(chain);
        let mgr = FlagManager::new(dir)
            .map_err(|err| Error::ManagerUnavailable(format!("chain {chain}: {err}")))?;
        let mgr = Arc::new(Mutex::new(mgr));
        managers.insert(chain, mgr.clone());
        Ok(mgr)
    }

    pub fn open_flag(&self, chain: u64, flag: &[u8]) -> CResult<()> {
        self.manager(chain)?.lock().unwrap().open_flag(flag)
    }

    pub fn get_last_flag(&self, chain: u64) -> CResult<Vec<u8>> {
        self.manager(chain)?.lock().unwrap().get_last_flag()
    }

    pub fn commit(&self, chain: u64, flag: &[u8]) -> CResult<()> {
        self.manager(chain)?.lock().unwrap().commit(flag)
    }

    pub fn cancel(&self, chain: u64, flag: &[u8]) -> CResult<()> {
        self.manager(chain)?.lock().unwrap().cancel(flag)
    }

    pub fn rollback(&self, chain: u64, flag: &[u8]) -> CResult<()> {
        self.manager(chain)?.lock().unwrap().rollback(flag)
    }

    pub fn set(&self, chain: u64, table: &[u8], key: &[u8], value: &[u8]) -> CResult<()> {
        self.manager(chain)?.lock().unwrap().set(table, key, value)
    }

    pub fn set_with_flag(&self, chain: u64, flag: &[u8], table: &[u8], key: &[u8], value: &[u8]) -> CResult<()> {
        self.manager(chain)?.lock().unwrap().set_with_flag(flag, table, key, value)
    }

    pub fn get(&self, chain: u64, table: &[u8], key: &[u8]) -> CResult<Vec<u8>> {
        self.manager(chain)?.lock().unwrap().get(table, key)
    }

    pub fn exist(&self, chain: u64, table: &[u8], key: &[u8]) -> CResult<bool> {
        self.manager(chain)?.lock().unwrap().exist(table, key)
    }

    pub fn get_next_key(&self, chain: u64, table: &[u8], prev: &[u8]) -> CResult<Vec<u8>> {
        self.manager(chain)?.lock().unwrap().get_next_key(table, prev)
    }

    /// Dispatches one transport-agnostic request, turning any error into a
    /// `Reply::Err` rather than propagating it — the shape a wire handler
    /// wants.
    pub fn handle(&self, request: Request) -> Reply {
        let result = match request {
            Request::OpenFlag(FlagArgs { chain, flag }) => self.open_flag(chain, &flag).map(|()| Reply::Ok),
            Request::GetLastFlag { chain } => self.get_last_flag(chain).map(Reply::Bytes),
            Request::Commit(FlagArgs { chain, flag }) => self.commit(chain, &flag).map(|()| Reply::Ok),
            Request::Cancel(FlagArgs { chain, flag }) => self.cancel(chain, &flag).map(|()| Reply::Ok),
            Request::Rollback(FlagArgs { chain, flag }) => self.rollback(chain, &flag).map(|()| Reply::Ok),
            Request::Set(SetArgs { chain, tb_name, key, value }) => {
                self.set(chain, &tb_name, &key, &value).map(|()| Reply::Ok)
            }
            Request::SetWithFlag(SetWithFlagArgs { chain, flag, tb_name, key, value }) => {
                self.set_with_flag(chain, &flag, &tb_name, &key, &value).map(|()| Reply::Ok)
            }
            Request::Get(GetArgs { chain, tb_name, key }) => self.get(chain, &tb_name, &key).map(Reply::Bytes),
            Request::Exist(GetArgs { chain, tb_name, key }) => self.exist(chain, &tb_name, &key).map(Reply::Bool),
            Request::GetNextKey(GetArgs { chain, tb_name, key }) => {
                self.get_next_key(chain, &tb_name, &key).map(Reply::Bytes)
            }
        };
        result.unwrap_or_else(|err| Reply::Err(err.to_string()))
    }

    /// Shuts down every manager and refuses further lookups.
    pub fn close(&self) {
        let mut closed = self.closed.lock().unwrap();
        *closed = true;
        let mut managers = self.managers.lock().unwrap();
        for (chain, mgr) in managers.drain() {
            if let Err(err) = mgr.lock().unwrap().shutdown() {
                log::error!("chain {chain}: failed to shut down cleanly: {err}");
            }
        }
    }
}
