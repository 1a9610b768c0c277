//! Services for parcel reconciliation

pub mod address_normalizer;
pub mod match_engine;
pub mod parcel_locks;
pub mod rollback;
pub mod session_manager;
pub mod update_applier;

pub use address_normalizer::{AddressNormalizer, NormalizedAddress};
pub use match_engine::MatchEngine;
pub use parcel_locks::{ParcelGuard, ParcelLocks};
pub use rollback::{RollbackController, RollbackFailure, RollbackReport};
pub use session_manager::ImportSessionManager;
pub use update_applier::UpdateApplier;
