pub mod compile;
pub mod config;
pub mod sandbox;
pub mod server;
pub mod store;
pub mod util;
