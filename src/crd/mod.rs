mod postgres_cluster;
mod postgres_dbops;
mod version;

pub use postgres_cluster::*;
pub use postgres_dbops::*;
pub use version::*;
