//! The console bootstrapper application.

use std::io::{BufRead, IsTerminal, Write};
use std::sync::Mutex;

use burn_core::{
    ActionState, ErrorReport, PackageState, RequestState, Restart, UiResult, UserExperience,
};
use burn_engine::UI_HINT_RETRY_CANCEL;
use tracing::info;

use crate::args::Display;
use crate::render::{render_status_line, OutputStyle, PhaseBar, PhaseUnit, TerminalRenderer};

/// Renders engine callbacks to the terminal. Quiet runs print nothing and
/// accept every default; only full runs ask questions.
pub(crate) struct ConsoleUx {
    renderer: TerminalRenderer,
    display: Display,
    norestart: bool,
    bars: Mutex<Bars>,
}

#[derive(Default)]
struct Bars {
    cache: Option<PhaseBar>,
    execute: Option<PhaseBar>,
}

impl ConsoleUx {
    pub(crate) fn new(style: OutputStyle, display: Display, norestart: bool) -> Self {
        Self {
            renderer: TerminalRenderer::from_style(style),
            display,
            norestart,
            bars: Mutex::new(Bars::default()),
        }
    }

    fn visible(&self) -> bool {
        self.display != Display::Quiet
    }

    fn status(&self, status: &str, message: &str) {
        if !self.visible() {
            return;
        }
        let Ok(bars) = self.bars.lock() else {
            self.renderer.print_status(status, message);
            return;
        };
        let line = render_status_line(self.renderer.style(), status, message);
        match bars.execute.as_ref().or(bars.cache.as_ref()) {
            Some(bar) => bar.println(&line),
            None => println!("{line}"),
        }
    }

    fn section(&self, title: &str) {
        if self.visible() {
            self.renderer.print_section(title);
        }
    }

    fn finish_bars(&self, succeeded: bool) {
        let Ok(mut bars) = self.bars.lock() else {
            return;
        };
        for bar in [bars.cache.take(), bars.execute.take()].into_iter().flatten() {
            bar.finish(succeeded);
        }
    }

    /// Full runs on a terminal ask whether to retry; everything else takes
    /// the engine's default.
    fn ask_retry(&self, message: &str) -> UiResult {
        if self.display != Display::Full || !std::io::stdin().is_terminal() {
            return UiResult::NoAction;
        }
        print!("{message} Retry? [y/N] ");
        let _ = std::io::stdout().flush();
        let mut answer = String::new();
        if std::io::stdin().lock().read_line(&mut answer).is_err() {
            return UiResult::Cancel;
        }
        match answer.trim().to_ascii_lowercase().as_str() {
            "y" | "yes" => UiResult::Retry,
            _ => UiResult::Cancel,
        }
    }
}

impl UserExperience for ConsoleUx {
    fn on_detect_begin(&self, package_count: usize) -> UiResult {
        self.section("detect");
        info!(package_count, "detect begin");
        UiResult::NoAction
    }

    fn on_detect_package_complete(&self, package_id: &str, state: PackageState) {
        self.status("step", &format!("{package_id}: {}", state.as_str()));
    }

    fn on_plan_begin(&self, _package_count: usize) -> UiResult {
        self.section("plan");
        UiResult::NoAction
    }

    fn on_plan_package_complete(
        &self,
        package_id: &str,
        requested: RequestState,
        execute: ActionState,
        _rollback: ActionState,
    ) {
        if requested != RequestState::None {
            self.status(
                "step",
                &format!("{package_id}: {requested:?} ({execute:?})").to_lowercase(),
            );
        }
    }

    fn on_apply_begin(&self) -> UiResult {
        self.section("apply");
        UiResult::NoAction
    }

    fn on_elevate(&self) -> UiResult {
        self.status("step", "requesting elevation");
        UiResult::NoAction
    }

    fn on_cache_package_begin(&self, package_id: &str, payload_count: usize) -> UiResult {
        if let Ok(mut bars) = self.bars.lock() {
            if bars.cache.is_none() && self.visible() {
                bars.cache = Some(self.renderer.start_phase("cache", PhaseUnit::Bytes));
            }
        }
        info!(package = package_id, payload_count, "caching package");
        UiResult::NoAction
    }

    fn on_cache_package_complete(&self, package_id: &str, succeeded: bool) {
        if !succeeded {
            self.status("err", &format!("failed to cache {package_id}"));
        }
    }

    fn on_cache_progress(&self, completed_bytes: u64, total_bytes: u64) -> UiResult {
        if let Ok(mut bars) = self.bars.lock() {
            if let Some(bar) = bars.cache.as_mut() {
                bar.update(completed_bytes, total_bytes);
            }
        }
        UiResult::NoAction
    }

    fn on_execute_package_begin(&self, package_id: &str, execute: bool) -> UiResult {
        if let Ok(mut bars) = self.bars.lock() {
            if let Some(cache) = bars.cache.take() {
                cache.finish(true);
            }
            if bars.execute.is_none() && self.visible() {
                bars.execute = Some(self.renderer.start_phase("execute", PhaseUnit::Percent));
            }
        }
        let verb = if execute { "executing" } else { "rolling back" };
        self.status("step", &format!("{verb} {package_id}"));
        UiResult::NoAction
    }

    fn on_execute_progress(&self, _package_id: &str, _progress: u32, overall: u32) -> UiResult {
        if let Ok(mut bars) = self.bars.lock() {
            if let Some(bar) = bars.execute.as_mut() {
                bar.update(u64::from(overall), 100);
            }
        }
        UiResult::NoAction
    }

    fn on_execute_package_complete(&self, package_id: &str, status: u32, restart: Restart) -> UiResult {
        if status == 0 {
            let suffix = match restart {
                Restart::None => "",
                Restart::Required | Restart::Initiated => " (restart required)",
            };
            self.status("ok", &format!("{package_id}{suffix}"));
        } else {
            self.status("err", &format!("{package_id} failed with 0x{status:08x}"));
        }
        UiResult::NoAction
    }

    fn on_error(&self, report: &ErrorReport<'_>) -> UiResult {
        let subject = report.package_id.unwrap_or("bundle");
        let message = format!("{subject}: {}", report.message);
        self.status("err", &message);
        if report.ui_hint & 0xF == UI_HINT_RETRY_CANCEL {
            return self.ask_retry(&message);
        }
        UiResult::NoAction
    }

    fn on_apply_complete(&self, status: u32, restart: Restart) -> UiResult {
        self.finish_bars(status == 0);
        if status != 0 {
            self.status("err", &format!("apply failed with 0x{status:08x}"));
            return UiResult::NoAction;
        }
        match restart {
            Restart::None => self.status("ok", "apply complete"),
            _ if self.norestart => self.status("ok", "apply complete"),
            Restart::Required | Restart::Initiated => {
                self.status("warn", "apply complete; restart to finish")
            }
        }
        UiResult::NoAction
    }
}
