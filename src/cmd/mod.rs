//! CLI command implementations.
//!
//! | Module       | Commands handled |
//! |--------------|------------------|
//! | `run`        | `Run`            |
//! | `checkpoint` | `Checkpoint`     |
//! | `config`     | `Config`         |

pub mod checkpoint;
pub mod config;
pub mod run;

pub use checkpoint::cmd_checkpoint;
pub use config::cmd_config;
pub use run::cmd_run;
