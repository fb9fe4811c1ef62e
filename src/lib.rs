// Library for the server and agent binaries, and for tests

pub mod aggregator;
pub mod bucket_repo;
pub mod clock;
pub mod collector;
pub mod config;
pub mod ingest;
pub mod logging;
pub mod models;
pub mod prober;
pub mod protocol;
pub mod retention_worker;
pub mod routes;
pub mod shutdown;
pub mod stats;
pub mod sync;
pub mod version;
pub mod worker;
