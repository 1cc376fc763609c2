//! Pipeline execution progress UI.
//!
//! Renders [`PipelineEvent`]s as they arrive from the orchestrator. It
//! supports three output modes:
//! - `full`: stage banners, per-stack spinners and an overall progress bar
//! - `minimal`: one line per finished stack
//! - `json`: one JSON event per line, for machine consumption

use crate::dag::{PipelineEvent, PipelineSummary, StackResult};
use crate::pipeline::{Pipeline, PipelineResult};
use crate::ui::icons::{
    CHECK, CLOCK, CROSS, EXPORT, KEY, PIVOT, RUNNING, SKIP, SPARKLE, STAGE, WAVE,
};
use console::{Term, style};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::io::Write;
use std::sync::Mutex;
use std::time::Duration;

/// Output mode for the pipeline UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UiMode {
    /// Banners and progress bars
    #[default]
    Full,
    /// Single-line status updates
    Minimal,
    /// JSON-formatted events
    Json,
}

impl std::str::FromStr for UiMode {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_lowercase().as_str() {
            "json" => Self::Json,
            "minimal" => Self::Minimal,
            _ => Self::Full,
        })
    }
}

impl UiMode {
    pub fn parse(s: &str) -> Self {
        s.parse().unwrap_or_default()
    }
}

/// Terminal UI for a pipeline run.
///
/// Events are consumed sequentially by a single task; the bar map lock is
/// only held for map updates.
pub struct PipelineUI {
    mode: UiMode,
    multi: MultiProgress,
    /// Stacks finished out of stacks planned
    header_bar: ProgressBar,
    stack_bars: Mutex<HashMap<String, ProgressBar>>,
    total_stacks: usize,
    verbose: bool,
    term: Term,
}

impl PipelineUI {
    pub fn new(total_stacks: usize, mode: UiMode, verbose: bool) -> Self {
        let multi = MultiProgress::new();
        let term = Term::stdout();

        let header_bar = if mode == UiMode::Full {
            let header_style = ProgressStyle::default_bar()
                .template("{prefix:.bold} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("█▓▒░");
            let bar = multi.add(ProgressBar::new(total_stacks as u64));
            bar.set_style(header_style);
            bar.set_prefix("Stacks");
            bar.set_message("Starting...");
            bar
        } else {
            ProgressBar::hidden()
        };

        Self {
            mode,
            multi,
            header_bar,
            stack_bars: Mutex::new(HashMap::new()),
            total_stacks,
            verbose,
            term,
        }
    }

    /// Print above the bars, or straight to stdout when they are not drawn.
    fn println(&self, line: impl AsRef<str>) {
        if self.multi.is_hidden() {
            let _ = writeln!(&self.term, "{}", line.as_ref());
        } else {
            self.multi.println(line).ok();
        }
    }

    pub fn handle_event(&self, event: &PipelineEvent) {
        match self.mode {
            UiMode::Json => self.handle_json(event),
            UiMode::Minimal => self.handle_minimal(event),
            UiMode::Full => self.handle_full(event),
        }
    }

    fn handle_json(&self, event: &PipelineEvent) {
        if let Ok(json) = serde_json::to_string(event) {
            let _ = writeln!(&self.term, "{}", json);
        }
    }

    fn handle_minimal(&self, event: &PipelineEvent) {
        match event {
            PipelineEvent::StageStarted { stage, .. } => {
                let _ = writeln!(&self.term, "Stage {}", stage);
            }
            PipelineEvent::StackCompleted { stack, result } => {
                if result.success {
                    let _ = writeln!(&self.term, "✓ {}", stack);
                } else {
                    let _ = writeln!(
                        &self.term,
                        "✗ {} ({})",
                        stack,
                        result.error.as_deref().unwrap_or("failed")
                    );
                }
            }
            PipelineEvent::StackSkipped { stack, .. } => {
                let _ = writeln!(&self.term, "- {}", stack);
            }
            PipelineEvent::PlanReplaced { current, .. } => {
                let _ = writeln!(&self.term, "Plan replaced ({})", short(current));
            }
            PipelineEvent::PipelineCompleted { success, summary } => {
                let _ = writeln!(
                    &self.term,
                    "Done: {}/{} {}",
                    summary.completed,
                    summary.total_stacks,
                    if *success { "✓" } else { "✗" }
                );
            }
            _ => {}
        }
    }

    fn handle_full(&self, event: &PipelineEvent) {
        match event {
            PipelineEvent::PlanReplaced {
                previous,
                current,
                resume_stage,
            } => self.on_plan_replaced(previous, current, resume_stage.as_deref()),
            PipelineEvent::StageStarted { stage, index } => self.on_stage_started(stage, *index),
            PipelineEvent::WaveStarted { wave, stacks, .. } => self.on_wave_started(wave, stacks),
            PipelineEvent::StackStarted { stack, .. } => self.on_stack_started(stack),
            PipelineEvent::StackCompleted { stack, result } => {
                self.on_stack_completed(stack, result)
            }
            PipelineEvent::StackSkipped { stack, wave } => {
                self.header_bar.inc(1);
                self.println(format!(
                    "  {}{} {}",
                    SKIP,
                    style(stack).dim(),
                    style(format!("({} skipped)", wave)).dim()
                ));
            }
            PipelineEvent::WaveCompleted {
                wave,
                success_count,
                failed_count,
            } => {
                if self.verbose || *failed_count > 0 {
                    self.println(format!(
                        "  {} {}: {} succeeded, {} failed",
                        WAVE,
                        wave,
                        style(success_count).green(),
                        style(failed_count).red()
                    ));
                }
            }
            PipelineEvent::StageCompleted { stage, success } => {
                let status = if *success {
                    style("complete").green()
                } else {
                    style("failed").red().bold()
                };
                self.println(format!("{}Stage {} {}", STAGE, style(stage).yellow(), status));
            }
            PipelineEvent::PipelineCompleted { success, summary } => {
                self.on_pipeline_completed(*success, summary)
            }
        }
    }

    fn on_plan_replaced(&self, previous: &str, current: &str, resume: Option<&str>) {
        self.println(format!(
            "{}Definition changed: plan {} → {}, resuming at {}",
            PIVOT,
            style(short(previous)).dim(),
            style(short(current)).cyan().bold(),
            style(resume.unwrap_or("end")).yellow()
        ));
    }

    fn on_stage_started(&self, stage: &str, index: usize) {
        self.println("");
        self.println(format!(
            "{}{} Stage {}: {}",
            STAGE,
            style("═".repeat(50)).cyan(),
            style(index + 1).yellow().bold(),
            style(stage).bold()
        ));
        self.header_bar.set_message(stage.to_string());
    }

    fn on_wave_started(&self, wave: &str, stacks: &[String]) {
        let parallel = if stacks.len() > 1 {
            format!(" {}", style("(parallel)").dim())
        } else {
            String::new()
        };
        self.println(format!(
            "  {}{} [{}]{}",
            WAVE,
            wave,
            style(stacks.join(", ")).yellow(),
            parallel
        ));
    }

    fn on_stack_started(&self, stack: &str) {
        let bar_style = ProgressStyle::default_spinner()
            .template("    {prefix:.bold} {spinner} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner());

        let bar = self.multi.add(ProgressBar::new_spinner());
        bar.set_style(bar_style);
        bar.set_prefix(format!("[{}]", stack));
        bar.set_message(format!("{}provisioning", RUNNING));
        bar.enable_steady_tick(Duration::from_millis(100));

        if let Ok(mut bars) = self.stack_bars.lock() {
            bars.insert(stack.to_string(), bar);
        }
    }

    fn on_stack_completed(&self, stack: &str, result: &StackResult) {
        let bar = self.stack_bars.lock().ok().and_then(|mut bars| bars.remove(stack));
        if let Some(bar) = bar {
            bar.finish_and_clear();
            self.multi.remove(&bar);
        }
        self.header_bar.inc(1);

        if result.success {
            self.println(format!(
                "    {}{} {}",
                CHECK,
                style(stack).green(),
                style(format_duration(result.duration)).dim()
            ));
            if self.verbose {
                for (id, identifier) in &result.resolved {
                    self.println(format!("        {} = {}", id, style(identifier).dim()));
                }
            }
        } else {
            self.println(format!(
                "    {}{} {}",
                CROSS,
                style(stack).red().bold(),
                result.error.as_deref().unwrap_or("failed")
            ));
        }
    }

    fn on_pipeline_completed(&self, success: bool, summary: &PipelineSummary) {
        self.header_bar.finish_and_clear();

        self.println("");
        self.println(format!("{}", style("═".repeat(60)).cyan()));
        if success {
            self.println(format!(
                "{}Pipeline {} {}",
                SPARKLE,
                style("COMPLETE").green().bold(),
                SPARKLE
            ));
        } else {
            self.println(format!("{}Pipeline {}", CROSS, style("FAILED").red().bold()));
        }
        self.println(format!("{}", style("═".repeat(60)).cyan()));

        self.println("");
        self.println(format!(
            "{} Stacks: {}/{} completed",
            CLOCK,
            style(summary.completed).green().bold(),
            summary.total_stacks.max(self.total_stacks)
        ));
        if summary.failed > 0 {
            self.println(format!("     {} stacks failed", style(summary.failed).red().bold()));
        }
        if summary.skipped > 0 {
            self.println(format!("     {} stacks skipped", style(summary.skipped).yellow()));
        }
        self.println(format!("     Duration: {}", style(format_duration(summary.duration)).cyan()));
    }

    /// Print the stage plan before execution starts.
    pub fn print_plan(&self, pipeline: &Pipeline) {
        if self.mode != UiMode::Full {
            return;
        }

        self.println(format!("\n{} Pipeline plan", style("═".repeat(60)).cyan()));
        self.println(format!(
            "  {} stacks in {} stages  {}",
            style(pipeline.stack_count()).yellow().bold(),
            style(pipeline.stages().len()).yellow().bold(),
            style(short(pipeline.fingerprint())).dim()
        ));
        for line in plan_lines(pipeline) {
            self.println(line);
        }
        self.println(format!("{}", style("═".repeat(60)).cyan()));
    }

    /// Print exports and issued roles of a finished run.
    pub fn print_report(&self, result: &PipelineResult) {
        if self.mode == UiMode::Json {
            return;
        }

        if let Some(stage) = result.failed_stage() {
            self.println("");
            self.println(format!("{}Stage {} failed:", CROSS, style(&stage.name).red().bold()));
            for failure in stage.failures() {
                self.println(format!(
                    "  {} / {}: {}",
                    failure.wave,
                    style(&failure.stack).bold(),
                    failure.error
                ));
            }
        }

        if !result.exports.is_empty() {
            self.println("");
            self.println(format!("{}{}", EXPORT, style("Exports").underlined()));
            for (name, value) in &result.exports {
                self.println(format!("  {} = {}", style(name).cyan(), value));
            }
        }

        for (stack, role) in &result.roles {
            self.println("");
            self.println(format!(
                "{}Role {} (from {}, trusted by {})",
                KEY,
                style(&role.name).bold(),
                stack,
                role.trust_principal
            ));
            for statement in &role.statements {
                let actions: Vec<&str> = statement.actions.iter().map(String::as_str).collect();
                let scopes: Vec<&str> =
                    statement.resource_scopes.iter().map(String::as_str).collect();
                self.println(format!(
                    "  {} on {}",
                    style(actions.join(", ")).yellow(),
                    scopes.join(", ")
                ));
            }
        }

        if result.replans > 0 {
            self.println(format!(
                "\n{}Plan replaced {} time(s) during the run",
                PIVOT, result.replans
            ));
        }
    }
}

/// Stage and wave lines for a plan, without styling.
pub fn plan_lines(pipeline: &Pipeline) -> Vec<String> {
    let mut lines = Vec::new();
    for (i, stage) in pipeline.stages().iter().enumerate() {
        lines.push(format!("  Stage {}: {}", i + 1, stage.name));
        for wave in &stage.waves {
            let parallel = if wave.members.len() > 1 { " (parallel)" } else { "" };
            lines.push(format!("    {}: [{}]{}", wave.name, wave.members.join(", "), parallel));
        }
    }
    lines
}

/// Format a duration for display.
pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs >= 3600 {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    } else if secs >= 60 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else if secs > 0 {
        format!("{}s", secs)
    } else {
        format!("{}ms", d.as_millis())
    }
}

fn short(fingerprint: &str) -> &str {
    fingerprint.get(..12).unwrap_or(fingerprint)
}
