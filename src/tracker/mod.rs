pub mod git;

pub use git::{GitVcs, VersionControl};
