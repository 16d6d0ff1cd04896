use crate::checkpoint::Stage;
use crate::request::ProvisioningRequest;
use crate::ui::icons::{CHECK, CROSS, SKIP, SPARKLE, WARN};
use console::style;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::time::Duration;

/// Terminal UI for a provisioning run, rendered via `indicatif`.
///
/// Two bars are stacked vertically:
/// - Stage bar: how many saga stages have been passed
/// - Step bar: spinner naming the external call currently running
pub struct SagaUI {
    multi: MultiProgress,
    stage_bar: ProgressBar,
    step_bar: ProgressBar,
    verbose: bool,
}

impl SagaUI {
    pub fn new(verbose: bool) -> Self {
        let multi = MultiProgress::new();

        let stage_style = ProgressStyle::default_bar()
            .template("{prefix:.bold.dim} [{bar:30.cyan/blue}] {pos}/{len} {msg}")
            .expect("progress bar template is a valid static string")
            .progress_chars("█▓▒░");
        let stage_bar = multi.add(ProgressBar::new(Stage::ALL.len() as u64));
        stage_bar.set_style(stage_style);
        stage_bar.set_prefix("Stages");

        let step_style = ProgressStyle::default_spinner()
            .template("{prefix:.bold.dim} {spinner} {msg}")
            .expect("progress bar template is a valid static string");
        let step_bar = multi.add(ProgressBar::new_spinner());
        step_bar.set_style(step_style);
        step_bar.set_prefix("  Step");

        Self {
            multi,
            stage_bar,
            step_bar,
            verbose,
        }
    }

    fn print_line(&self, msg: impl AsRef<str>) {
        if self.multi.println(msg.as_ref()).is_err() {
            eprintln!("{}", msg.as_ref());
        }
    }

    pub fn print_header(&self, request: &ProvisioningRequest) {
        self.print_line(format!("{}", style("═".repeat(70)).cyan()));
        self.print_line(format!(
            "{} VPC {} in {} / {}",
            style("▶").green().bold(),
            style(&request.name).yellow().bold(),
            request.account_id,
            request.region
        ));
        self.print_line(format!(
            "{}  {}",
            style("Branch:").dim(),
            request.branch_name()
        ));
        self.print_line(format!("{}", style("═".repeat(70)).cyan()));
    }

    pub fn start_stage(&self, stage: Stage) {
        self.stage_bar
            .set_message(format!("{}", style(stage.label()).yellow()));
        self.step_bar.reset();
        self.step_bar.set_message(format!("{}", style("starting").dim()));
        self.step_bar.enable_steady_tick(Duration::from_millis(100));
    }

    /// Update the spinner with the external call in flight.
    pub fn log_step(&self, msg: &str) {
        self.step_bar.set_message(format!("{}", style(msg).dim()));
        if self.verbose {
            self.print_line(format!("    {} {}", style("→").dim(), style(msg).dim()));
        }
    }

    pub fn stage_complete(&self, stage: Stage, detail: &str) {
        self.stage_bar.inc(1);
        self.step_bar.finish_and_clear();
        if detail.is_empty() {
            self.print_line(format!("{}{}", CHECK, stage.label()));
        } else {
            self.print_line(format!(
                "{}{} {}",
                CHECK,
                stage.label(),
                style(format!("({})", detail)).dim()
            ));
        }
    }

    pub fn stage_skipped(&self, stage: Stage, reason: &str) {
        self.stage_bar.inc(1);
        self.step_bar.finish_and_clear();
        self.print_line(format!(
            "{}{} {}",
            SKIP,
            style(stage.label()).dim(),
            style(format!("({})", reason)).dim()
        ));
    }

    pub fn stage_failed(&self, stage: Stage, reason: &str) {
        self.step_bar.finish_and_clear();
        self.stage_bar.abandon();
        self.print_line(format!(
            "\n{}Stage {} failed: {}\n",
            CROSS,
            style(stage.label()).red().bold(),
            reason
        ));
    }

    pub fn warn(&self, msg: &str) {
        self.print_line(format!("    {}{}", WARN, style(msg).yellow()));
    }

    pub fn finish(&self, merged: bool) {
        self.stage_bar.finish_and_clear();
        if merged {
            self.print_line(format!(
                "\n{}{}\n",
                SPARKLE,
                style("Provisioning complete").green().bold()
            ));
        }
    }
}
