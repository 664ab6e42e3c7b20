use std::io::IsTerminal;
use std::time::{Duration, Instant};

use anstyle::{AnsiColor, Effects, Style};
use indicatif::{HumanBytes, ProgressBar, ProgressStyle};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum OutputStyle {
    Plain,
    Rich,
}

pub(crate) fn resolve_output_style(stdout_is_tty: bool) -> OutputStyle {
    if stdout_is_tty {
        OutputStyle::Rich
    } else {
        OutputStyle::Plain
    }
}

pub(crate) fn current_output_style() -> OutputStyle {
    resolve_output_style(std::io::stdout().is_terminal())
}

#[derive(Copy, Clone, Debug)]
pub(crate) struct TerminalRenderer {
    style: OutputStyle,
}

/// What a phase bar counts.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum PhaseUnit {
    Bytes,
    Percent,
}

/// The bar for one apply phase. Plain output keeps the counters only.
pub(crate) struct PhaseBar {
    label: &'static str,
    unit: PhaseUnit,
    done: u64,
    total: u64,
    bar: Option<ProgressBar>,
    started: Instant,
}

impl TerminalRenderer {
    pub(crate) fn from_style(style: OutputStyle) -> Self {
        Self { style }
    }

    pub(crate) fn style(self) -> OutputStyle {
        self.style
    }

    pub(crate) fn print_status(self, status: &str, message: &str) {
        println!("{}", render_status_line(self.style, status, message));
    }

    pub(crate) fn print_section(self, title: &str) {
        if let Some(header) = render_section_header(self.style, title) {
            println!();
            println!("{}", colorize(header_style(), &header));
        }
    }

    pub(crate) fn start_phase(self, label: &'static str, unit: PhaseUnit) -> PhaseBar {
        let bar = (self.style == OutputStyle::Rich).then(|| {
            let template = match unit {
                PhaseUnit::Bytes => {
                    "{spinner:.cyan.bold} {msg:<8} [{bar:24.cyan/blue}] {bytes}/{total_bytes}"
                }
                PhaseUnit::Percent => {
                    "{spinner:.cyan.bold} {msg:<8} [{bar:24.cyan/blue}] {percent:>3}%"
                }
            };
            let bar = ProgressBar::new(1);
            if let Ok(style) = ProgressStyle::with_template(template) {
                bar.set_style(style.tick_chars("|/-\\ ").progress_chars("#>-"));
            }
            bar.set_message(label);
            bar.enable_steady_tick(Duration::from_millis(100));
            bar
        });

        PhaseBar {
            label,
            unit,
            done: 0,
            total: 0,
            bar,
            started: Instant::now(),
        }
    }
}

impl PhaseBar {
    pub(crate) fn update(&mut self, done: u64, total: u64) {
        self.total = total;
        self.done = done.min(total);
        if let Some(bar) = &self.bar {
            bar.set_length(total.max(1));
            bar.set_position(self.done);
        }
    }

    /// Prints above the bar so the bar stays at the bottom.
    pub(crate) fn println(&self, line: &str) {
        match &self.bar {
            Some(bar) => bar.println(line),
            None => println!("{line}"),
        }
    }

    pub(crate) fn finish(mut self, succeeded: bool) {
        let Some(bar) = self.bar.take() else {
            return;
        };
        bar.finish_and_clear();
        if !succeeded {
            return;
        }
        let summary = render_phase_summary(
            OutputStyle::Rich,
            self.label,
            self.unit,
            self.done,
            Some(self.started.elapsed()),
        );
        if let Some(summary) = summary {
            println!("{summary}");
        }
    }
}

pub(crate) fn render_status_line(style: OutputStyle, status: &str, message: &str) -> String {
    match style {
        OutputStyle::Plain => message.to_string(),
        OutputStyle::Rich => format!("{} {message}", status_badge(status)),
    }
}

fn status_badge(status: &str) -> &'static str {
    match status {
        "ok" => "[OK]",
        "warn" => "[WARN]",
        "err" => "[ERR]",
        _ => "[..]",
    }
}

pub(crate) fn render_section_header(style: OutputStyle, title: &str) -> Option<String> {
    match style {
        OutputStyle::Plain => None,
        OutputStyle::Rich => Some(format!("== {title} ==")),
    }
}

/// The line left behind once a phase bar finishes.
pub(crate) fn render_phase_summary(
    style: OutputStyle,
    label: &str,
    unit: PhaseUnit,
    done: u64,
    elapsed: Option<Duration>,
) -> Option<String> {
    if style == OutputStyle::Plain {
        return None;
    }
    let amount = match unit {
        PhaseUnit::Bytes => format!("{}", HumanBytes(done)),
        PhaseUnit::Percent => format!("{}%", done.min(100)),
    };
    let took = elapsed
        .map(|elapsed| format!(" in {}", format_elapsed(elapsed)))
        .unwrap_or_default();
    Some(format!(
        "{} {amount}{took}",
        colorize(label_style(), label)
    ))
}

fn format_elapsed(elapsed: Duration) -> String {
    format!("{:.3}s", elapsed.as_secs_f64())
}

fn header_style() -> Style {
    Style::new()
        .fg_color(Some(AnsiColor::Blue.into()))
        .effects(Effects::BOLD | Effects::UNDERLINE)
}

fn label_style() -> Style {
    Style::new()
        .fg_color(Some(AnsiColor::Cyan.into()))
        .effects(Effects::BOLD)
}

fn colorize(style: Style, text: &str) -> String {
    format!("{style}{text}{style:#}")
}
