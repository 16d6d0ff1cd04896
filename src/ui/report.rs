//! Operator-facing rendering of a checkpoint.

use crate::checkpoint::{ApplyCheckpoint, SagaOutcome, StageStatus, SurvivingArtifact};
use crate::ui::icons::{BRANCH, CHECK, CLOUD, CROSS, LOCK, SKIP, WARN};
use console::style;

fn artifact_icon(artifact: &SurvivingArtifact) -> console::Emoji<'static, 'static> {
    match artifact {
        SurvivingArtifact::CidrReservation { .. }
        | SurvivingArtifact::ConfigParameter { .. }
        | SurvivingArtifact::UnconfirmedReservation { .. } => LOCK,
        SurvivingArtifact::StagingBranch { .. } => BRANCH,
        SurvivingArtifact::Infrastructure { .. } => CLOUD,
    }
}

/// Full styled report: stage log, outcome, surviving side effects, warnings.
pub fn render(checkpoint: &ApplyCheckpoint) -> String {
    let mut lines = Vec::new();
    lines.push(format!(
        "{} {}  {}",
        style("Run").bold(),
        checkpoint.run_id,
        style(checkpoint.started_at.format("%Y-%m-%d %H:%M:%S UTC")).dim()
    ));
    lines.push(format!(
        "  {} {} / {} / {}",
        style("Request:").dim(),
        checkpoint.request.name,
        checkpoint.request.account_id,
        checkpoint.request.region
    ));
    if let Some(ref vpc_id) = checkpoint.vpc_id {
        lines.push(format!("  {} {}", style("VPC:").dim(), style(vpc_id).cyan()));
    }

    lines.push(String::new());
    lines.push(format!("{}", style("Stages").underlined()));
    for record in &checkpoint.records {
        let icon = match record.status {
            StageStatus::Succeeded => CHECK,
            StageStatus::Failed => CROSS,
            StageStatus::Skipped => SKIP,
        };
        let name = match record.step {
            Some(ref step) => format!("{} / {}", record.stage, step),
            None => record.stage.to_string(),
        };
        if record.detail.is_empty() {
            lines.push(format!("  {}{}", icon, name));
        } else {
            lines.push(format!(
                "  {}{} {}",
                icon,
                name,
                style(format!("- {}", record.detail)).dim()
            ));
        }
    }

    lines.push(String::new());
    match &checkpoint.outcome {
        SagaOutcome::Succeeded => {
            lines.push(format!("{}", style("Outcome: succeeded").green().bold()))
        }
        SagaOutcome::SucceededUnmerged { branches } => {
            lines.push(format!(
                "{}{}",
                WARN,
                style("Outcome: succeeded but NOT merged; trunk is out of sync with deployed infrastructure")
                    .yellow()
                    .bold()
            ));
            for branch in branches {
                lines.push(format!("    {}{}", BRANCH, branch));
            }
        }
        SagaOutcome::Failed {
            stage,
            class,
            message,
            remediation,
            severity,
        } => {
            let class = match severity {
                Some(severity) => format!("{} ({})", class, severity),
                None => class.clone(),
            };
            lines.push(format!(
                "{}{} at {}",
                CROSS,
                style(class).red().bold(),
                stage
            ));
            lines.push(format!("    {}", message));
            lines.push(format!("  {} {}", style("Next:").bold(), remediation));
        }
        SagaOutcome::InProgress => {
            lines.push(format!("{}", style("Outcome: in progress").yellow()))
        }
    }

    if !checkpoint.artifacts.is_empty() {
        lines.push(String::new());
        lines.push(format!("{}", style("Still existing").underlined()));
        for artifact in &checkpoint.artifacts {
            lines.push(format!("  {}{}", artifact_icon(artifact), artifact.describe()));
        }
    }

    if !checkpoint.warnings.is_empty() {
        lines.push(String::new());
        lines.push(format!("{}", style("Warnings").underlined()));
        for warning in &checkpoint.warnings {
            lines.push(format!("  {}{}", WARN, style(warning).yellow()));
        }
    }

    lines.join("\n")
}
