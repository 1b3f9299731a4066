use std::future::Future;
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use owo_colors::OwoColorize;

/// Async progress spinner for scanning and connection setup.
#[derive(Debug)]
pub(crate) struct Spinner {
    enabled: bool,
}

impl Spinner {
    /// Creates a spinner with explicit enable/disable control.
    pub(crate) fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    /// Runs a fallible operation behind an indefinite spinner when enabled.
    ///
    /// The spinner finishes with `done` on success and `failed` on error.
    pub(crate) async fn with_spinner<F, Fut, T, E>(
        &self,
        message: &str,
        done: &str,
        failed: &str,
        operation: F,
    ) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if !self.enabled {
            return operation().await;
        }

        let spinner = new_spinner(message);
        let result = operation().await;
        let finish_message = match &result {
            Ok(_) => format!("{} {done}", "✓".green()),
            Err(_) => format!("{} {failed}", "✗".red()),
        };
        spinner.finish_with_message(finish_message);
        result
    }
}

fn new_spinner(message: &str) -> ProgressBar {
    let spinner = ProgressBar::new_spinner();
    spinner.set_style(spinner_style());
    spinner.set_message(message.to_string());
    spinner.enable_steady_tick(Duration::from_millis(90));
    spinner
}

fn spinner_style() -> ProgressStyle {
    let base_style = ProgressStyle::default_spinner();
    let templated =
        ProgressStyle::with_template("{spinner:.cyan.bold} {msg}").unwrap_or(base_style);
    templated.tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏")
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::disabled(false)]
    #[case::enabled(true)]
    #[tokio::test]
    async fn with_spinner_returns_operation_result(#[case] enabled: bool) {
        let spinner = Spinner::new(enabled);
        let result: Result<u8, String> = spinner
            .with_spinner("scanning...", "found", "not found", || async { Ok(42) })
            .await;
        assert_eq!(Ok(42), result);
    }

    #[rstest]
    #[case::disabled(false)]
    #[case::enabled(true)]
    #[tokio::test]
    async fn with_spinner_passes_errors_through(#[case] enabled: bool) {
        let spinner = Spinner::new(enabled);
        let result: Result<u8, &str> = spinner
            .with_spinner("connecting...", "connected", "failed", || async {
                Err("timed out")
            })
            .await;
        assert_eq!(Err("timed out"), result);
    }
}
