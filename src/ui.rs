//! Progress output for the command-line tools.

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::io::IsTerminal;
use std::str::FromStr;
use std::time::{Duration, Instant};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UiMode {
    Auto,
    Plain,
    Pretty,
}

impl FromStr for UiMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(UiMode::Auto),
            "plain" => Ok(UiMode::Plain),
            "pretty" => Ok(UiMode::Pretty),
            other => Err(anyhow::anyhow!("unknown ui mode '{}'", other)),
        }
    }
}

/// Chooses between an indicatif spinner and plain `==>` lines on stderr.
#[derive(Clone, Debug)]
pub struct Ui {
    mode: UiMode,
    is_tty: bool,
}

impl Ui {
    pub fn new(mode: UiMode, is_tty: bool) -> Self {
        Self { mode, is_tty }
    }

    /// Mode from a flag, TTY detection from stderr. `NO_COLOR` forces plain in auto mode.
    pub fn detect(mode: UiMode) -> Self {
        let no_color = std::env::var_os("NO_COLOR").is_some();
        let mode = if mode == UiMode::Auto && no_color {
            UiMode::Plain
        } else {
            mode
        };
        Self::new(mode, std::io::stderr().is_terminal())
    }

    fn pretty(&self) -> bool {
        self.is_tty && self.mode != UiMode::Plain
    }

    pub fn stage(&self, name: &str) -> Stage {
        if !self.pretty() {
            eprintln!("==> {}", name);
            return Stage::new(name, None);
        }
        let spinner = ProgressBar::new_spinner();
        spinner.set_draw_target(ProgressDrawTarget::stderr());
        spinner.set_style(
            ProgressStyle::with_template("{spinner:.green} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        spinner.enable_steady_tick(Duration::from_millis(100));
        spinner.set_message(format!("{name}..."));
        Stage::new(name, Some(spinner))
    }
}

/// Running stage; reports its duration when dropped.
pub struct Stage {
    name: String,
    started: Instant,
    spinner: Option<ProgressBar>,
    detail: Option<String>,
}

impl Stage {
    fn new(name: &str, spinner: Option<ProgressBar>) -> Self {
        Self {
            name: name.to_string(),
            started: Instant::now(),
            spinner,
            detail: None,
        }
    }

    /// Short note appended to the completion line.
    pub fn set_detail(&mut self, detail: impl Into<String>) {
        self.detail = Some(detail.into());
    }

    fn summary(&self) -> String {
        let elapsed = format_duration(self.started.elapsed());
        match &self.detail {
            Some(detail) => format!("done: {} - {} ({})", self.name, detail, elapsed),
            None => format!("done: {} ({})", self.name, elapsed),
        }
    }
}

impl Drop for Stage {
    fn drop(&mut self) {
        let message = self.summary();
        match &self.spinner {
            Some(spinner) => spinner.finish_with_message(message),
            None => eprintln!("{message}"),
        }
    }
}

pub fn format_duration(duration: Duration) -> String {
    if duration.as_secs() >= 1 {
        format!("{:.2}s", duration.as_secs_f64())
    } else {
        format!("{}ms", duration.as_millis())
    }
}
