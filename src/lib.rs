pub mod agent;
pub mod config;
pub mod heartbeat;
pub mod logging;
pub mod master;
pub mod muxer;
pub mod net;
pub mod pubsub;
pub mod shutdown;
pub mod storage;
pub mod utils;
pub mod wire;
