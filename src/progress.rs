use std::collections::VecDeque;
use std::time::Duration;

use console::style;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};

/// Controls how a watched task is rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Spinner + ring-buffer of task output, cleared on completion.
    Normal,
    /// Like Normal but keeps the task output after completion.
    Verbose,
    /// Spinner only, no task output.
    Quiet,
    /// No ANSI; task output printed as prefixed lines (piped/non-TTY).
    Plain,
    /// Nothing on the terminal; used when stdout carries JSON.
    Silent,
}

impl OutputMode {
    pub fn is_interactive(self) -> bool {
        matches!(
            self,
            OutputMode::Normal | OutputMode::Verbose | OutputMode::Quiet
        )
    }
}

const MAX_LOG_LINES: usize = 10;

fn spinner_style() -> ProgressStyle {
    ProgressStyle::with_template("{spinner:.cyan} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
}

fn done_style() -> ProgressStyle {
    ProgressStyle::with_template("{msg}").unwrap_or_else(|_| ProgressStyle::default_spinner())
}

/// Terminal view of one task being watched.
///
/// Task output is folded into the spinner's message as extra lines (ring
/// buffer of ~10) so the bar stays a single indicatif object whose line
/// count it tracks itself.
pub struct TaskProgress {
    bar: ProgressBar,
    label: String,
    lines: VecDeque<String>,
    mode: OutputMode,
}

impl TaskProgress {
    pub fn new(label: &str, mode: OutputMode) -> Self {
        let bar = if mode.is_interactive() {
            let bar = ProgressBar::new_spinner();
            bar.set_style(spinner_style());
            bar.set_message(label.to_string());
            bar.enable_steady_tick(Duration::from_millis(80));
            bar
        } else {
            ProgressBar::with_draw_target(None, ProgressDrawTarget::hidden())
        };

        if mode == OutputMode::Plain {
            println!("{label}");
        }

        Self {
            bar,
            label: label.to_string(),
            lines: VecDeque::new(),
            mode,
        }
    }

    /// Add one line of task output.
    pub fn log(&mut self, line: &str) {
        match self.mode {
            OutputMode::Quiet | OutputMode::Silent => return,
            OutputMode::Plain => {
                println!("    {line}");
                return;
            }
            OutputMode::Normal | OutputMode::Verbose => {}
        }

        if self.lines.len() >= MAX_LOG_LINES {
            self.lines.pop_front();
        }
        self.lines.push_back(line.to_string());

        if self.mode == OutputMode::Verbose {
            self.bar.println(format!("    {line}"));
            return;
        }

        let mut msg = self.label.clone();
        for l in &self.lines {
            msg.push_str("\n    ");
            msg.push_str(l);
        }
        self.bar.set_message(msg);
    }

    /// Collapse the spinner into a final status line.
    pub fn finish(self, success: bool, message: &str) {
        let mark = if success {
            style("\u{2713}").green()
        } else {
            style("\u{2717}").red()
        };
        match self.mode {
            OutputMode::Silent => {}
            OutputMode::Plain => {
                let word = if success { "ok" } else { "failed" };
                println!("{} {word}: {message}", self.label);
            }
            _ => {
                self.bar.set_style(done_style());
                self.bar.finish_with_message(format!("{mark} {message}"));
            }
        }
    }

    /// Stop drawing without a verdict, leaving `message` behind.
    pub fn abandon(self, message: &str) {
        match self.mode {
            OutputMode::Silent => {}
            OutputMode::Plain => println!("{message}"),
            _ => {
                self.bar.set_style(done_style());
                self.bar
                    .abandon_with_message(format!("{} {message}", style("!").yellow()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_buffer_keeps_last_lines() {
        let mut p = TaskProgress {
            bar: ProgressBar::hidden(),
            label: "start VM 101".into(),
            lines: VecDeque::new(),
            mode: OutputMode::Normal,
        };
        for i in 0..(MAX_LOG_LINES + 3) {
            p.log(&format!("line {i}"));
        }
        assert_eq!(p.lines.len(), MAX_LOG_LINES);
        assert_eq!(p.lines.front().map(String::as_str), Some("line 3"));
        assert!(p.bar.message().starts_with("start VM 101\n"));
    }

    #[test]
    fn quiet_mode_drops_lines() {
        let mut p = TaskProgress::new("x", OutputMode::Silent);
        p.log("ignored");
        assert!(p.lines.is_empty());
        p.finish(true, "done");
    }

    #[test]
    fn interactive_modes() {
        assert!(OutputMode::Normal.is_interactive());
        assert!(!OutputMode::Plain.is_interactive());
        assert!(!OutputMode::Silent.is_interactive());
    }
}
