pub mod directory;
pub mod instances;
pub mod provision;
pub mod reconcile;
pub mod serve;
