//! Step definitions: the smallest unit of work inside a task.
//!
//! Grounded on `examples/original_source/tubular/step.py` (`StepType`,
//! `_StepActionClone/_StepActionScript/_StepActionExec/_StepActionArchive`).

use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptLang {
    Shell,
    Batch,
    PowerShell,
    Python,
}

impl ScriptLang {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "shell" => Some(ScriptLang::Shell),
            "batch" | "bat" => Some(ScriptLang::Batch),
            "powershell" | "ps" => Some(ScriptLang::PowerShell),
            "python" | "py" => Some(ScriptLang::Python),
            _ => None,
        }
    }

    /// The file extension written for the generated step script.
    pub fn extension(self) -> &'static str {
        match self {
            ScriptLang::Shell => "sh",
            ScriptLang::Batch => "bat",
            ScriptLang::PowerShell => "ps1",
            ScriptLang::Python => "py",
        }
    }
}

/// A single step within a task. Each variant carries an optional display label.
#[derive(Debug, Clone)]
pub enum StepDef {
    Clone {
        url: String,
        branch: String,
        display: String,
    },
    Script {
        lang: ScriptLang,
        body: String,
        display: String,
    },
    Exec {
        command_line: String,
        display: String,
    },
    Archive {
        target: String,
        display: String,
    },
}

impl StepDef {
    pub fn display(&self) -> &str {
        match self {
            StepDef::Clone { display, .. }
            | StepDef::Script { display, .. }
            | StepDef::Exec { display, .. }
            | StepDef::Archive { display, .. } => display,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            StepDef::Clone { .. } => "Clone",
            StepDef::Script { .. } => "Script",
            StepDef::Exec { .. } => "Exec",
            StepDef::Archive { .. } => "Archive",
        }
    }
}

/// Raw on-disk shape of a step, as it appears inside a task YAML file's `steps` list.
#[derive(Debug, Deserialize)]
pub struct RawStep {
    #[serde(rename = "type")]
    pub kind: String,
    pub display: Option<String>,
    pub url: Option<String>,
    pub branch: Option<String>,
    pub lang: Option<String>,
    pub script: Option<String>,
    pub target: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum StepParseError {
    #[error("unknown step type '{0}'")]
    UnknownType(String),
    #[error("unknown script language '{0}'")]
    UnknownLang(String),
    #[error("step type '{kind}' is missing required field '{field}'")]
    MissingField { kind: &'static str, field: &'static str },
}

impl TryFrom<RawStep> for StepDef {
    type Error = StepParseError;

    fn try_from(raw: RawStep) -> Result<Self, Self::Error> {
        let display_or = |raw_display: Option<String>, fallback: &str| {
            raw_display.unwrap_or_else(|| fallback.to_string())
        };

        match raw.kind.to_ascii_lowercase().as_str() {
            "clone" => {
                let url = raw.url.ok_or(StepParseError::MissingField {
                    kind: "clone",
                    field: "url",
                })?;
                let branch = raw.branch.ok_or(StepParseError::MissingField {
                    kind: "clone",
                    field: "branch",
                })?;
                let display = display_or(raw.display, "clone");
                Ok(StepDef::Clone { url, branch, display })
            }
            "script" => {
                let lang_str = raw.lang.ok_or(StepParseError::MissingField {
                    kind: "script",
                    field: "lang",
                })?;
                let lang = ScriptLang::parse(&lang_str)
                    .ok_or_else(|| StepParseError::UnknownLang(lang_str))?;
                let body = raw.script.ok_or(StepParseError::MissingField {
                    kind: "script",
                    field: "script",
                })?;
                let display = display_or(raw.display, "script");
                Ok(StepDef::Script { lang, body, display })
            }
            "exec" => {
                let command_line = raw.target.ok_or(StepParseError::MissingField {
                    kind: "exec",
                    field: "target",
                })?;
                let display = display_or(raw.display, "exec");
                Ok(StepDef::Exec { command_line, display })
            }
            "archive" => {
                let target = raw.target.ok_or(StepParseError::MissingField {
                    kind: "archive",
                    field: "target",
                })?;
                let display = display_or(raw.display, "archive");
                Ok(StepDef::Archive { target, display })
            }
            other => Err(StepParseError::UnknownType(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn script_lang_parses_aliases() {
        assert_eq!(ScriptLang::parse("bat"), Some(ScriptLang::Batch));
        assert_eq!(ScriptLang::parse("PY"), Some(ScriptLang::Python));
        assert_eq!(ScriptLang::parse("nope"), None);
    }

    #[test]
    fn raw_step_without_display_falls_back_to_type() {
        let raw = RawStep {
            kind: "exec".into(),
            display: None,
            url: None,
            branch: None,
            lang: None,
            script: None,
            target: Some("echo hi".into()),
        };
        let step = StepDef::try_from(raw).unwrap();
        assert_eq!(step.display(), "exec");
    }
}
