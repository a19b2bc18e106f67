use std::future::Future;
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};

/// Progress spinner shown on stderr while awaiting a long-running future.
#[derive(Debug)]
pub(crate) struct Spinner {
    enabled: bool,
}

impl Spinner {
    pub(crate) fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    /// Awaits `operation`, spinning with `message` when enabled.
    ///
    /// The spinner is cleared whether the operation succeeds or fails.
    pub(crate) async fn wrap<Fut, T>(&self, message: impl Into<String>, operation: Fut) -> T
    where
        Fut: Future<Output = T>,
    {
        if !self.enabled {
            return operation.await;
        }

        let spinner = ProgressBar::new_spinner()
            .with_style(spinner_style())
            .with_message(message.into());
        spinner.enable_steady_tick(Duration::from_millis(90));
        let result = operation.await;
        spinner.finish_and_clear();
        result
    }
}

fn spinner_style() -> ProgressStyle {
    ProgressStyle::with_template("{spinner:.cyan.bold} {msg}")
        .unwrap_or_else(|_error| ProgressStyle::default_spinner())
        .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏")
}
