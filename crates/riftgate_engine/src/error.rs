use std::io;

use riftgate_shared::types::{EntityId, PortalId};
use thiserror::Error;

/// Failure of a portal- or entity-level engine operation. Nothing here is
/// fatal; callers decide whether to retry.
#[derive(Debug, Error)]
pub enum PortalError {
    #[error("portal {0} does not exist")]
    InvalidPortal(PortalId),
    #[error("entity {0} is unknown to the host")]
    UnknownEntity(EntityId),
    #[error("a portal cannot be linked to itself")]
    SelfLink(PortalId),
    #[error("settings file error: {0}")]
    Settings(#[from] io::Error),
}

/// Failure of a manual teleport request.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TeleportError {
    #[error("source portal has no linked twin")]
    NoLinkedPortal,
    #[error("invalid or inactive portal")]
    InvalidPortal,
    #[error("target location is blocked")]
    Blocked,
    #[error("entity does not fit through the portal pair")]
    TooLarge,
}
