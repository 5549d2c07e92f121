mod postgres_cluster;

pub use postgres_cluster::*;
