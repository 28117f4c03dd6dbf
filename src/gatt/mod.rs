//! GATT-level bookkeeping: identifiers, the peripheral directory and
//! value-change subscriptions.

pub mod directory;
pub mod ids;
pub mod subscription;
