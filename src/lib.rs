pub mod cli;
pub mod config;
pub mod control;
pub mod daemon;
pub mod errors;
pub mod globals;
pub mod helpers;
pub mod registry;
pub mod router;
pub mod supervisor;
