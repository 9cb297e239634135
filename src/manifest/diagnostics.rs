//! Translates manifest parsing errors into actionable diagnostics.
use miette::{Diagnostic, NamedSource, SourceSpan};
use serde_saphyr::{Error as YamlError, Location};
use thiserror::Error;

/// YAML source content for a manifest.
///
/// # Examples
/// ```rust
/// use polyflow::manifest::ManifestSource;
/// let source = ManifestSource::from("derivations: []");
/// assert_eq!(source.as_str(), "derivations: []");
/// ```
#[derive(Debug, Clone)]
pub struct ManifestSource(String);

impl ManifestSource {
    /// Wrap manifest text.
    #[must_use]
    pub fn new(src: impl Into<String>) -> Self {
        Self(src.into())
    }

    /// The manifest text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl From<&str> for ManifestSource {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Display name for a manifest used in diagnostics, usually its path.
#[derive(Debug, Clone)]
pub struct ManifestName(String);

impl ManifestName {
    /// Wrap a display name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The display name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl std::fmt::Display for ManifestName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

const YAML_HINTS: [(&str, &str); 4] = [
    (
        "did not find expected '-'",
        "Start each derivation with '-' under `derivations:` and indent consistently.",
    ),
    (
        "mapping values are not allowed",
        "Quote expressions that contain ': ', e.g. expr: \"{'k': 1}\".",
    ),
    (
        "found character that cannot start any token",
        "Quote expressions that start with characters such as '%', '@' or '`'.",
    ),
    (
        "unknown escape character",
        "Use single quotes for expressions containing backslashes.",
    ),
];

fn saturating_usize(value: u64) -> usize {
    usize::try_from(value).unwrap_or(usize::MAX)
}

fn location_to_index(src: &ManifestSource, loc: Location) -> usize {
    let target_line = saturating_usize(loc.line().saturating_sub(1));
    let target_column = saturating_usize(loc.column().saturating_sub(1));
    let mut offset = 0usize;
    for (idx, segment) in src.as_str().split_inclusive('\n').enumerate() {
        if idx == target_line {
            let line = segment.strip_suffix('\n').unwrap_or(segment);
            let byte_index = line
                .char_indices()
                .nth(target_column)
                .map_or(line.len(), |(byte_idx, _)| byte_idx);
            return offset + byte_index;
        }
        offset += segment.len();
    }
    src.as_str().len()
}

fn to_span(src: &ManifestSource, loc: Location) -> SourceSpan {
    let at = location_to_index(src, loc);
    let bytes = src.as_str().as_bytes();
    let (start, end) = match bytes.get(at) {
        Some(&b) if b != b'\n' => (at, at + 1),
        _ => {
            let start = if at > 0 && bytes.get(at - 1).is_some_and(|p| *p != b'\n') {
                at - 1
            } else {
                at
            };
            (start, at)
        }
    };
    SourceSpan::new(start.into(), end.saturating_sub(start))
}

#[derive(Debug, Error, Diagnostic)]
#[error("{message}")]
#[diagnostic(code(polyflow::manifest::yaml))]
struct YamlDiagnostic {
    #[source_code]
    src: NamedSource<String>,
    #[label("parse error here")]
    span: Option<SourceSpan>,
    #[help]
    help: Option<String>,
    #[source]
    source: YamlError,
    message: String,
}

fn has_tab_indent(src: &ManifestSource, loc: Option<Location>) -> bool {
    let Some(loc) = loc else { return false };
    let line_idx = saturating_usize(loc.line().saturating_sub(1));
    let line = src.as_str().lines().nth(line_idx).unwrap_or("");
    line.chars()
        .take_while(|c| c.is_whitespace())
        .any(|c| c == '\t')
}

fn hint_for(err_str: &str, src: &ManifestSource, loc: Option<Location>) -> Option<String> {
    if has_tab_indent(src, loc) {
        return Some("Use spaces for indentation; tabs are invalid in YAML.".into());
    }
    let lower = err_str.to_lowercase();
    YAML_HINTS
        .iter()
        .find(|(needle, _)| lower.contains(*needle))
        .map(|(_, hint)| (*hint).into())
}

/// Wrap a YAML syntax error with its source location and a hint.
#[must_use]
pub fn map_yaml_error(
    err: YamlError,
    src: &ManifestSource,
    name: &ManifestName,
) -> Box<dyn Diagnostic + Send + Sync + 'static> {
    let loc = err.location();
    let (line, col, span) = loc.map_or((1, 1, None), |l| {
        (l.line(), l.column(), Some(to_span(src, l)))
    });
    let err_str = err.to_string();
    let help = hint_for(&err_str, src, loc);
    Box::new(YamlDiagnostic {
        src: NamedSource::new(name.as_str(), src.as_str().to_owned()),
        span,
        help,
        source: err,
        message: format!("YAML parse error at line {line}, column {col}: {err_str}"),
    })
}

#[derive(Debug, Error, Diagnostic)]
#[error("{message}")]
#[diagnostic(
    code(polyflow::manifest::structure),
    help("each derivation needs a name, a language, and exactly one of expr, import, or convert")
)]
struct DataDiagnostic {
    #[source]
    source: serde_json::Error,
    message: String,
}

/// Wrap a schema error raised after the YAML parsed successfully.
#[must_use]
pub fn map_data_error(
    err: serde_json::Error,
    name: &ManifestName,
) -> Box<dyn Diagnostic + Send + Sync + 'static> {
    let message = format!("invalid manifest {name}: {err}");
    Box::new(DataDiagnostic {
        source: err,
        message,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn yaml_error(src: &ManifestSource) -> YamlError {
        serde_saphyr::from_str::<serde_json::Value>(src.as_str()).expect_err("expected parse error")
    }

    #[test]
    fn tab_indentation_gets_a_hint() {
        let src = ManifestSource::from("\tkey: \"unterminated");
        let diag = map_yaml_error(yaml_error(&src), &src, &ManifestName::new("Pipeline.yml"));
        let help = diag.help().map(|h| h.to_string()).unwrap_or_default();
        assert!(help.contains("Use spaces for indentation"), "help: {help}");
    }

    #[test]
    fn messages_name_line_and_column() {
        let src = ManifestSource::from("derivations:\n  - name: a\n   bad: [\n");
        let diag = map_yaml_error(yaml_error(&src), &src, &ManifestName::new("Pipeline.yml"));
        assert!(diag.to_string().starts_with("YAML parse error at line"));
    }

    #[test]
    fn missing_locations_default_to_the_first_line() {
        let src = ManifestSource::from("derivations: [1");
        let err = serde_saphyr::Error::Eof {
            location: Location::UNKNOWN,
        };
        let diag = map_yaml_error(err, &src, &ManifestName::new("Pipeline.yml"));
        assert!(diag.to_string().contains("line 1, column 1"));
    }
}
