pub mod cascade;
pub mod finalize;
pub mod peering;
pub mod phased_apply;
pub mod saga;
pub mod staging;

pub use peering::{PeeringGenerator, ScriptPeeringGenerator};
pub use phased_apply::DeployedVpc;
pub use saga::{Collaborators, Saga, SagaRun};
pub use staging::StagingHandle;
