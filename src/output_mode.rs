//! Accessible versus standard terminal output.
//!
//! Accessible mode prints static, labelled lines suitable for screen readers
//! and logs. It is chosen explicitly through configuration, or detected from
//! `NO_COLOR` (any value) and `TERM=dumb`.

use std::env;

/// How progress is presented on the terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Static text lines.
    Accessible,
    /// Animated progress lines.
    Standard,
}

impl OutputMode {
    /// Resolve the mode from the process environment.
    #[must_use]
    pub fn detect(explicit: Option<bool>) -> Self {
        Self::detect_with(explicit, |key| env::var(key).ok())
    }

    /// Resolve the mode with an injected environment lookup.
    ///
    /// ```
    /// use polyflow::output_mode::OutputMode;
    ///
    /// let dumb = |key: &str| (key == "TERM").then(|| "dumb".to_owned());
    /// assert_eq!(OutputMode::detect_with(None, dumb), OutputMode::Accessible);
    /// assert_eq!(OutputMode::detect_with(Some(false), dumb), OutputMode::Standard);
    /// ```
    #[must_use]
    pub fn detect_with(explicit: Option<bool>, read_env: impl Fn(&str) -> Option<String>) -> Self {
        let accessible = explicit.unwrap_or_else(|| {
            read_env("NO_COLOR").is_some() || read_env("TERM").as_deref() == Some("dumb")
        });
        if accessible {
            Self::Accessible
        } else {
            Self::Standard
        }
    }

    /// Whether this is [`OutputMode::Accessible`].
    #[must_use]
    pub const fn is_accessible(self) -> bool {
        matches!(self, Self::Accessible)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::explicit_on(Some(true), None, None, OutputMode::Accessible)]
    #[case::explicit_off_wins(Some(false), Some("1"), Some("dumb"), OutputMode::Standard)]
    #[case::no_color(None, Some(""), None, OutputMode::Accessible)]
    #[case::dumb_terminal(None, None, Some("dumb"), OutputMode::Accessible)]
    #[case::default(None, None, Some("xterm-256color"), OutputMode::Standard)]
    fn resolves_mode(
        #[case] explicit: Option<bool>,
        #[case] no_color: Option<&str>,
        #[case] term: Option<&str>,
        #[case] expected: OutputMode,
    ) {
        let mode = OutputMode::detect_with(explicit, |key| match key {
            "NO_COLOR" => no_color.map(str::to_owned),
            "TERM" => term.map(str::to_owned),
            _ => None,
        });
        assert_eq!(mode, expected);
    }
}
