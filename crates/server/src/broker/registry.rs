//! Registry of running device loops

use crate::device::DeviceLoop;
use common::{Error, Result};
use protocol::DeviceIdentity;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

/// Device loops keyed by device identity
///
/// Each entry owns its loop: inserting starts the device's lifetime in the
/// broker and removing disposes the loop before the entry disappears.
#[derive(Default)]
pub struct DeviceRegistry {
    devices: RwLock<HashMap<DeviceIdentity, Arc<DeviceLoop>>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build, start and register a loop unless `identity` is already present
    pub fn insert_with<F>(&self, identity: DeviceIdentity, build: F) -> Result<Arc<DeviceLoop>>
    where
        F: FnOnce(DeviceIdentity) -> Result<DeviceLoop>,
    {
        let mut devices = self.devices.write().unwrap_or_else(PoisonError::into_inner);
        if devices.contains_key(&identity) {
            return Err(Error::DeviceAlreadyExists(identity.to_string()));
        }

        let device = Arc::new(build(identity.clone())?);
        devices.insert(identity, device.clone());
        Ok(device)
    }

    /// Dispose the loop registered under `identity`, then drop the entry
    ///
    /// The lock is released while the worker is joined; lookups in that
    /// window still find the entry, with its loop already stopped.
    pub fn remove(&self, identity: &DeviceIdentity) -> Result<()> {
        let device = self
            .get(identity)
            .ok_or_else(|| Error::DeviceNotFound(identity.to_string()))?;

        device.dispose();

        let mut devices = self.devices.write().unwrap_or_else(PoisonError::into_inner);
        match devices.get(identity) {
            Some(current) if Arc::ptr_eq(current, &device) => {
                devices.remove(identity);
                Ok(())
            }
            // Another caller removed it while this one was disposing
            _ => Err(Error::DeviceNotFound(identity.to_string())),
        }
    }

    pub fn get(&self, identity: &DeviceIdentity) -> Option<Arc<DeviceLoop>> {
        self.devices
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(identity)
            .cloned()
    }

    /// Identities of all registered devices, ordered by vendor then product id
    pub fn identities(&self) -> Vec<DeviceIdentity> {
        let mut identities: Vec<DeviceIdentity> = self
            .devices
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|device| device.identity())
            .collect();
        identities.sort_by_key(|id| (id.vendor_id, id.product_id));
        identities
    }

    pub fn loops(&self) -> Vec<Arc<DeviceLoop>> {
        self.devices
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.devices
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
