//! Log source reader. Fetches the tail of each source through the executor
//! and gates how often logs are re-read.

use crate::commands::InterfaceCommands;
use crate::executor::CommandRunner;
use crate::scanner::LogExcerpt;
use nexwatch_common::{CommandError, LogSource};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Kernel log fragments that point at a struggling driver.
pub const DRIVER_ERROR_MARKERS: &[&str] = &[
    "bus is down",
    "firmware fail",
    "card removed",
    "brcmf_sdio",
    "sdio_cmd52_error",
    "-110",
    "probe failed",
];

/// Kernel lines searched for driver errors.
const DRIVER_ERROR_SCAN_LINES: usize = 200;

pub struct LogReader {
    runner: Arc<dyn CommandRunner>,
    commands: Arc<InterfaceCommands>,
    tail_lines: usize,
    application_log: String,
}

impl LogReader {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        commands: Arc<InterfaceCommands>,
        tail_lines: usize,
        application_log: String,
    ) -> Self {
        Self {
            runner,
            commands,
            tail_lines,
            application_log,
        }
    }

    pub async fn read_source(&self, source: LogSource) -> Result<LogExcerpt, CommandError> {
        let spec = match source {
            LogSource::Kernel => self.commands.kernel_log(self.tail_lines),
            LogSource::System => self.commands.system_log(self.tail_lines),
            LogSource::Application => self
                .commands
                .tail_file(&self.application_log, self.tail_lines),
        };
        let output = self.runner.run_checked(&spec).await?;
        Ok(LogExcerpt::new(source, output.stdout))
    }

    /// Tail of every source. Unreadable sources are skipped.
    pub async fn read_all(&self) -> Vec<LogExcerpt> {
        let mut excerpts = Vec::with_capacity(3);
        for source in [LogSource::Kernel, LogSource::System, LogSource::Application] {
            match self.read_source(source).await {
                Ok(excerpt) => excerpts.push(excerpt),
                Err(e) => debug!("Could not read {} log: {}", source.as_str(), e),
            }
        }
        excerpts
    }

    /// Last `limit` kernel lines mentioning a driver error marker.
    pub async fn recent_driver_errors(&self, limit: usize) -> Result<Vec<String>, CommandError> {
        let output = self
            .runner
            .run_checked(&self.commands.kernel_log(DRIVER_ERROR_SCAN_LINES))
            .await?;
        Ok(filter_driver_errors(&output.stdout, limit))
    }
}

pub fn filter_driver_errors(text: &str, limit: usize) -> Vec<String> {
    let matching: Vec<&str> = text
        .lines()
        .filter(|line| {
            let lower = line.to_lowercase();
            DRIVER_ERROR_MARKERS.iter().any(|marker| lower.contains(marker))
        })
        .collect();
    let skip = matching.len().saturating_sub(limit);
    matching[skip..].iter().map(|line| line.to_string()).collect()
}

/// Allows an action at most once per interval.
#[derive(Debug)]
pub struct RefreshGate {
    interval: Duration,
    last: Option<Instant>,
}

impl RefreshGate {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    /// True, and the gate closes for another interval, if the previous pass
    /// is at least one interval old.
    pub fn try_pass(&mut self, now: Instant) -> bool {
        match self.last {
            Some(last) if now.duration_since(last) < self.interval => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }
}
