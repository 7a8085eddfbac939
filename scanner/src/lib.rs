pub mod cli;
pub mod engine;
pub mod handlers;
pub mod logroute;
pub mod registry;
pub mod server;
pub mod supervisor;
