//! Language tags for derivation runtimes.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Runtime a derivation body is evaluated in.
///
/// `Jinja` runs in-process through `MiniJinja`. The remaining languages are
/// evaluated by spawning their interpreter.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    /// `MiniJinja` expressions.
    Jinja,
    /// POSIX shell snippets.
    Shell,
    /// Python expressions.
    Python,
    /// R expressions.
    R,
}

impl Language {
    /// Every supported language, in tag order.
    pub const ALL: [Self; 4] = [Self::Jinja, Self::Shell, Self::Python, Self::R];

    /// Stable lowercase tag used in manifests, fingerprints and format tags.
    #[must_use]
    pub const fn tag(self) -> &'static str {
        match self {
            Self::Jinja => "jinja",
            Self::Shell => "shell",
            Self::Python => "python",
            Self::R => "r",
        }
    }

    /// Whether this runtime's native artifacts are JSON documents.
    #[must_use]
    pub const fn is_json_native(self) -> bool {
        !matches!(self, Self::Shell)
    }

    /// Whether an input called `name` cannot be bound in this runtime.
    ///
    /// Shell inputs become environment variables, so names the shell or the
    /// dynamic loader act on are refused. The other runtimes refuse their
    /// keywords and literals; Python also refuses the wrapper's own prefix.
    #[must_use]
    pub fn reserves(self, name: &str) -> bool {
        match self {
            Self::Jinja => JINJA_RESERVED.contains(&name),
            Self::Shell => {
                SHELL_RESERVED.contains(&name)
                    || ["LC_", "LD_", "BASH_", "DYLD_"]
                        .iter()
                        .any(|prefix| name.starts_with(prefix))
            }
            Self::Python => PYTHON_RESERVED.contains(&name) || name.starts_with("_polyflow"),
            Self::R => R_RESERVED.contains(&name),
        }
    }
}

const JINJA_RESERVED: &[&str] = &[
    "true", "false", "none", "True", "False", "None", "and", "or", "not", "in", "is", "if",
    "else",
];

const SHELL_RESERVED: &[&str] = &[
    "PATH", "HOME", "IFS", "PWD", "OLDPWD", "CDPATH", "ENV", "SHELL", "USER", "LOGNAME", "LANG",
    "TMPDIR", "TERM", "PS1", "PS2", "PS4", "OPTIND", "OPTARG", "PPID", "LINENO", "MAIL",
    "MAILPATH",
];

const PYTHON_RESERVED: &[&str] = &[
    "False", "None", "True", "and", "as", "assert", "async", "await", "break", "class",
    "continue", "def", "del", "elif", "else", "except", "finally", "for", "from", "global", "if",
    "import", "in", "is", "lambda", "nonlocal", "not", "or", "pass", "raise", "return", "try",
    "while", "with", "yield",
];

const R_RESERVED: &[&str] = &[
    "if", "else", "repeat", "while", "function", "for", "in", "next", "break", "TRUE", "FALSE",
    "NULL", "Inf", "NaN", "NA", "NA_integer_", "NA_real_", "NA_complex_", "NA_character_",
];

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Error returned when parsing an unknown language tag.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown language '{0}' (expected one of: jinja, shell, python, r)")]
pub struct UnknownLanguage(pub String);

impl FromStr for Language {
    type Err = UnknownLanguage;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|lang| lang.tag().eq_ignore_ascii_case(s))
            .ok_or_else(|| UnknownLanguage(s.to_owned()))
    }
}
