//! MDM fleet simulator: drives many simulated devices through the MDM
//! command loop and reports latency statistics.

pub mod worker;

pub use worker::{run_connect_workers, ConnectStats, ConnectWorkerData};
