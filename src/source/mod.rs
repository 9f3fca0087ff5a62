//! Reading gridded SST data from Zarr v2 stores.

pub mod blosc;
pub mod cftime;
pub mod codec;
pub mod error;
pub mod loader;
pub mod metadata;
pub mod store;

pub use loader::{load_cube, plan_selection, Dataset, SelectionPlan, SelectionRequest};
pub use store::{open_store, ChunkStore};
