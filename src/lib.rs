pub mod dataset;
pub mod device;
pub mod error;
pub mod network;
pub mod stages;
mod storage;
mod test;

pub use dataset::HostDataset;
pub use error::{NetErr, Result};
pub use network::Network;
