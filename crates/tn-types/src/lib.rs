pub mod checkpoint;
pub mod config;
pub mod errors;
pub mod hparams;
pub mod ids;
pub mod operations;
pub mod snapshot;
pub mod state;

pub use checkpoint::*;
pub use config::*;
pub use errors::*;
pub use hparams::*;
pub use ids::*;
pub use operations::*;
pub use snapshot::*;
pub use state::*;
