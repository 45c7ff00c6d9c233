//! The root directory: one entry per environment, plus the control file.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use skein_proto::Dir;
use tracing::info;

use crate::config::CmdFsConfig;
use crate::ctl::{Ctl, TreeStats, CTL_NAME};
use crate::env::Env;
use crate::error::FsError;
use crate::interp::Interp;
use crate::node::{attrs, Caps, Node};

pub(crate) struct Root {
    config: Arc<CmdFsConfig>,
    interp: Arc<dyn Interp>,
    ctl: Arc<Ctl>,
    envs: Mutex<BTreeMap<String, Env>>,
}

impl Root {
    pub(crate) fn new(config: Arc<CmdFsConfig>, interp: Arc<dyn Interp>, stats: Arc<TreeStats>) -> Self {
        let ctl = Ctl::new(
            config.name.clone(),
            config.owner.clone(),
            config.chunk_size,
            stats,
        );
        Self {
            config,
            interp,
            ctl: Arc::new(ctl),
            envs: Mutex::new(BTreeMap::new()),
        }
    }

    pub(crate) fn env(&self, name: &str) -> Option<Env> {
        self.envs.lock().get(name).cloned()
    }
}

#[async_trait]
impl Node for Root {
    fn path(&self) -> String {
        "/".to_string()
    }

    fn stat(&self) -> Dir {
        // +1 for the control file
        let n = self.envs.lock().len() as u64 + 1;
        attrs("/", "d", 0o755, n, &self.config.owner)
    }

    fn caps(&self) -> Caps {
        Caps::WALK | Caps::GETDIR | Caps::MKDIR | Caps::REMOVE
    }

    fn all_virtual(&self) -> bool {
        true
    }

    fn walk(&self, name: &str) -> Result<Arc<dyn Node>, FsError> {
        if name == CTL_NAME {
            return Ok(self.ctl.clone());
        }
        match self.envs.lock().get(name) {
            Some(e) => Ok(Arc::new(e.clone())),
            None => Err(FsError::NotExist(format!("/{}", name))),
        }
    }

    fn getdir(&self) -> Result<Vec<String>, FsError> {
        let mut names = vec![CTL_NAME.to_string()];
        names.extend(self.envs.lock().keys().cloned());
        Ok(names)
    }

    async fn mkdir(&self, name: &str, _meta: &Dir) -> Result<(), FsError> {
        let mut envs = self.envs.lock();
        if name == CTL_NAME || envs.contains_key(name) {
            return Err(FsError::Exists(format!("/{}", name)));
        }
        let env = Env::new(name, self.config.clone(), self.interp.clone());
        envs.insert(name.to_string(), env);
        info!(env = name, "new environment");
        Ok(())
    }

    async fn remove(&self, name: &str, _all: bool) -> Result<(), FsError> {
        if name == CTL_NAME {
            return Err(FsError::Perm(format!("/{}", name)));
        }
        let env = self.envs.lock().remove(name);
        match env {
            Some(env) => {
                env.removed();
                Ok(())
            }
            None => Err(FsError::NotExist(format!("/{}", name))),
        }
    }
}
