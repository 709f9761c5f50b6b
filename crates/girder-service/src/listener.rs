//! Listener configuration shared by both TCP service engines.

use std::collections::BTreeMap;
use std::time::Duration;

use girder_core::error::{Error, Result};
use girder_net::TcpAddrInfo;

#[derive(Debug, Clone)]
pub struct ListenerConfig {
    pub addr: TcpAddrInfo,
    pub listen_timeout: Duration,
    pub backlog: u32,
}

pub const DEFAULT_BACKLOG: u32 = 15;

/// Listener configurations keyed by the id handed back at registration.
/// Reconfiguration is only legal while the owning service is idle.
#[derive(Debug, Default)]
pub struct ListenerConfigs {
    configs: BTreeMap<u64, ListenerConfig>,
    last_id: u64,
}

impl ListenerConfigs {
    pub fn new() -> Self {
        ListenerConfigs {
            configs: BTreeMap::new(),
            last_id: 0,
        }
    }

    pub fn add(&mut self, config: ListenerConfig) -> u64 {
        self.last_id += 1;
        self.configs.insert(self.last_id, config);
        self.last_id
    }

    pub fn update(&mut self, id: u64, config: ListenerConfig) -> Result<()> {
        match self.configs.get_mut(&id) {
            Some(existing) => {
                *existing = config;
                Ok(())
            }
            None => Err(Error::ListenerNotFound(id)),
        }
    }

    pub fn remove(&mut self, id: u64) -> Result<ListenerConfig> {
        self.configs.remove(&id).ok_or(Error::ListenerNotFound(id))
    }

    pub fn clear(&mut self) {
        self.configs.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = (u64, &ListenerConfig)> {
        self.configs.iter().map(|(id, config)| (*id, config))
    }

    pub fn len(&self) -> usize {
        self.configs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.configs.is_empty()
    }
}
