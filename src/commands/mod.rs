pub mod inventory;
pub mod reconcile;
pub mod status;
