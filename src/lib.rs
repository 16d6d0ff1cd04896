pub mod allocator;
pub mod checkpoint;
pub mod cloud;
pub mod config;
pub mod errors;
pub mod iac;
pub mod logging;
pub mod orchestrator;
pub mod policy;
pub mod process;
pub mod provision_config;
pub mod request;
pub mod tracker;
pub mod ui;
pub mod workspace;

#[cfg(test)]
pub(crate) mod testing;
