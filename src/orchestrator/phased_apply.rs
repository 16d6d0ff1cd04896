//! Two-phase apply of the generated segment.
//!
//! The provider races when a VPC and its dependents are created in one
//! apply, so the VPC resource is applied alone first. The engine walks
//! `Init -> TargetedApply -> LegacyImport -> FullApply -> IdentityLookup`;
//! every step except the import can end the run.

use std::path::PathBuf;

use crate::checkpoint::{ApplyCheckpoint, Stage, StageStatus, SurvivingArtifact};
use crate::errors::SagaError;
use crate::iac::IacEngine;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyPhase {
    Init,
    TargetedApply,
    LegacyImport,
    FullApply,
    IdentityLookup,
    Done,
}

impl ApplyPhase {
    pub fn step_name(self) -> &'static str {
        match self {
            ApplyPhase::Init => "init",
            ApplyPhase::TargetedApply => "targeted_apply",
            ApplyPhase::LegacyImport => "legacy_import",
            ApplyPhase::FullApply => "full_apply",
            ApplyPhase::IdentityLookup => "identity_lookup",
            ApplyPhase::Done => "done",
        }
    }
}

/// The segment as confirmed from engine state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployedVpc {
    pub vpc_id: String,
    pub address: String,
}

/// Legacy parameter to adopt into state after the targeted apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyImport {
    pub address: String,
    pub id: String,
}

pub struct PhasedApply<'a> {
    engine: &'a dyn IacEngine,
    root: PathBuf,
    address: String,
    legacy_import: Option<LegacyImport>,
}

impl<'a> PhasedApply<'a> {
    pub fn new(
        engine: &'a dyn IacEngine,
        root: PathBuf,
        address: impl Into<String>,
        legacy_import: Option<LegacyImport>,
    ) -> Self {
        Self {
            engine,
            root,
            address: address.into(),
            legacy_import,
        }
    }

    fn exec_error(&self, phase: ApplyPhase, message: String) -> SagaError {
        SagaError::ApplyExec {
            phase: phase.step_name().to_string(),
            root: self.root.clone(),
            message,
        }
    }

    /// Step through the phases, logging each to the checkpoint.
    pub async fn run(&self, checkpoint: &mut ApplyCheckpoint) -> Result<DeployedVpc, SagaError> {
        let mut phase = ApplyPhase::Init;
        let mut deployed = None;

        while phase != ApplyPhase::Done {
            let step = Some(phase.step_name());
            phase = match phase {
                ApplyPhase::Init => {
                    let run = self.engine.init(&self.root).await.map_err(|e| {
                        SagaError::ApplyInit {
                            root: self.root.clone(),
                            message: format!("{:#}", e),
                        }
                    })?;
                    if !run.succeeded {
                        checkpoint.record(Stage::PhasedApply, step, StageStatus::Failed, &run.detail);
                        return Err(SagaError::ApplyInit {
                            root: self.root.clone(),
                            message: run.detail,
                        });
                    }
                    checkpoint.record(Stage::PhasedApply, step, StageStatus::Succeeded, "");
                    ApplyPhase::TargetedApply
                }
                ApplyPhase::TargetedApply => {
                    checkpoint.add_artifact(SurvivingArtifact::Infrastructure {
                        root: self.root.clone(),
                        resource: None,
                        applied: false,
                    });
                    let targets = [self.address.clone()];
                    let run = self
                        .engine
                        .apply(&self.root, &targets)
                        .await
                        .map_err(|e| self.exec_error(phase, format!("{:#}", e)))?;
                    if !run.succeeded {
                        checkpoint.record(Stage::PhasedApply, step, StageStatus::Failed, &run.detail);
                        return Err(self.exec_error(phase, run.detail));
                    }
                    checkpoint.record(
                        Stage::PhasedApply,
                        step,
                        StageStatus::Succeeded,
                        format!("-target={}", self.address),
                    );
                    ApplyPhase::LegacyImport
                }
                ApplyPhase::LegacyImport => {
                    match self.legacy_import {
                        None => {
                            checkpoint.record(
                                Stage::PhasedApply,
                                step,
                                StageStatus::Skipped,
                                "not configured",
                            );
                        }
                        Some(ref import) => {
                            let outcome = self
                                .engine
                                .import(&self.root, &import.address, &import.id)
                                .await;
                            match outcome {
                                Ok(run) if run.succeeded => checkpoint.record(
                                    Stage::PhasedApply,
                                    step,
                                    StageStatus::Succeeded,
                                    &import.address,
                                ),
                                Ok(run) => {
                                    checkpoint.record(
                                        Stage::PhasedApply,
                                        step,
                                        StageStatus::Skipped,
                                        &run.detail,
                                    );
                                    checkpoint.warn(format!(
                                        "Legacy import of {} did not succeed (ignored)",
                                        import.address
                                    ));
                                }
                                Err(e) => {
                                    checkpoint.record(
                                        Stage::PhasedApply,
                                        step,
                                        StageStatus::Skipped,
                                        format!("{:#}", e),
                                    );
                                    checkpoint.warn(format!(
                                        "Legacy import of {} could not run: {:#}",
                                        import.address, e
                                    ));
                                }
                            }
                        }
                    }
                    ApplyPhase::FullApply
                }
                ApplyPhase::FullApply => {
                    let run = self
                        .engine
                        .apply(&self.root, &[])
                        .await
                        .map_err(|e| self.exec_error(phase, format!("{:#}", e)))?;
                    if !run.succeeded {
                        checkpoint.record(Stage::PhasedApply, step, StageStatus::Failed, &run.detail);
                        return Err(self.exec_error(phase, run.detail));
                    }
                    checkpoint.record(Stage::PhasedApply, step, StageStatus::Succeeded, "");
                    ApplyPhase::IdentityLookup
                }
                ApplyPhase::IdentityLookup => {
                    let lookup_error = || SagaError::IdentityLookup {
                        root: self.root.clone(),
                        address: self.address.clone(),
                    };
                    let id = match self.engine.resource_id(&self.root, &self.address).await {
                        Ok(Some(id)) => id,
                        Ok(None) => {
                            checkpoint.record(
                                Stage::PhasedApply,
                                step,
                                StageStatus::Failed,
                                "empty id",
                            );
                            return Err(lookup_error());
                        }
                        Err(e) => {
                            checkpoint.record(
                                Stage::PhasedApply,
                                step,
                                StageStatus::Failed,
                                format!("{:#}", e),
                            );
                            return Err(lookup_error());
                        }
                    };
                    checkpoint.record(Stage::PhasedApply, step, StageStatus::Succeeded, &id);
                    checkpoint.confirm_infrastructure(&self.root, &id);
                    checkpoint.vpc_id = Some(id.clone());
                    deployed = Some(DeployedVpc {
                        vpc_id: id,
                        address: self.address.clone(),
                    });
                    ApplyPhase::Done
                }
                ApplyPhase::Done => ApplyPhase::Done,
            };
        }

        deployed.ok_or_else(|| SagaError::IdentityLookup {
            root: self.root.clone(),
            address: self.address.clone(),
        })
    }
}
