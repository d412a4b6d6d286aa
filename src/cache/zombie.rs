use tracing::warn;
use crate::core::config::ZombiePolicy;
use crate::core::error::{Error, ErrorKind, Result};
use crate::core::types::ObjectId;

/// Called when marking finds a reference to an entity no channel holds
pub trait ZombieOidHandler: Send + Sync {
    fn handle_zombie_oid(&self, object_id: ObjectId) -> Result<()>;
}

/// Logs zombies and keeps marking
pub struct IgnoreZombieOids;

impl ZombieOidHandler for IgnoreZombieOids {
    fn handle_zombie_oid(&self, object_id: ObjectId) -> Result<()> {
        warn!(object_id = %object_id, "reference to unknown entity found during marking");
        Ok(())
    }
}

/// Turns every zombie into an error, disabling the storage
pub struct FailOnZombieOids;

impl ZombieOidHandler for FailOnZombieOids {
    fn handle_zombie_oid(&self, object_id: ObjectId) -> Result<()> {
        Err(Error::new(
            ErrorKind::ZombieOid,
            format!("reference to unknown entity {} found during marking", object_id),
        ))
    }
}

pub fn handler_for(policy: ZombiePolicy) -> Box<dyn ZombieOidHandler> {
    match policy {
        ZombiePolicy::Ignore => Box::new(IgnoreZombieOids),
        ZombiePolicy::Fail => Box::new(FailOnZombieOids),
    }
}

/// Type ids and constants are never stored as entities, so references into
/// those ranges are not zombies.
pub fn is_potential_zombie(object_id: ObjectId) -> bool {
    !(object_id.is_type_id_range() || object_id.is_constant_range())
}
