//! Parameter collection, confirmations and notices for the person running
//! the migration.

use std::collections::BTreeMap;
use std::io::{self, BufRead, Write};

use crossterm::event::{self, Event, KeyCode, KeyEventKind, KeyModifiers};
use crossterm::terminal::{disable_raw_mode, enable_raw_mode};
use tracing::info;

use crate::error::{Error, ErrorKind, Result};
use crate::params::{FieldSpec, MigrationParameters, validate_field};

/// Discovered values offered for a field, keyed by parameter name.
pub type Choices = BTreeMap<&'static str, Vec<String>>;

pub trait Operator {
    /// Fill every field in `fields` that `params` does not already hold.
    fn collect(
        &self,
        fields: &[FieldSpec],
        params: &mut MigrationParameters,
        choices: &Choices,
    ) -> Result<()>;

    /// A yes/no decision. `assume_yes` operators may answer it themselves.
    fn confirm(&self, question: &str, default: bool) -> Result<bool>;

    /// A question about something only the person at the keyboard can know,
    /// such as whether a manual step was carried out. Never auto-answered.
    fn attest(&self, question: &str) -> Result<bool> {
        self.confirm(question, false)
    }

    fn notify(&self, message: &str);
}

fn default_for<'a>(spec: &'a FieldSpec, choices: &'a Choices) -> Option<&'a str> {
    spec.default.or_else(|| {
        choices
            .get(spec.key)
            .and_then(|c| c.first())
            .map(String::as_str)
    })
}

/// Prompts on the controlling terminal. Secrets are read without echo.
#[derive(Debug, Clone, Default)]
pub struct TerminalOperator {
    pub assume_yes: bool,
}

impl TerminalOperator {
    pub fn new(assume_yes: bool) -> Self {
        Self { assume_yes }
    }

    fn prompt(&self, spec: &FieldSpec, choices: &Choices) -> Result<Option<String>> {
        let mut label = spec.label.to_string();
        if let Some(options) = choices.get(spec.key).filter(|c| !c.is_empty()) {
            label.push_str(&format!(" ({})", options.join(", ")));
        }
        if let Some(d) = default_for(spec, choices) {
            label.push_str(&format!(" [{d}]"));
        } else if !spec.required {
            label.push_str(" [optional]");
        }
        if spec.secret {
            read_hidden(&format!("{label}: "))
        } else {
            read_line(&format!("{label}: "))
        }
    }
}

impl Operator for TerminalOperator {
    fn collect(
        &self,
        fields: &[FieldSpec],
        params: &mut MigrationParameters,
        choices: &Choices,
    ) -> Result<()> {
        for spec in fields {
            if params.contains(spec.key) {
                continue;
            }
            loop {
                let raw = self
                    .prompt(spec, choices)?
                    .ok_or_else(|| Error::new(ErrorKind::Cancelled, "input closed"))?;
                let value = if raw.trim().is_empty() {
                    default_for(spec, choices).unwrap_or_default().to_string()
                } else if spec.secret {
                    raw
                } else {
                    raw.trim().to_string()
                };
                if value.is_empty() {
                    if spec.required {
                        eprintln!("  {} is required", spec.label);
                        continue;
                    }
                    break;
                }
                match validate_field(spec, &value) {
                    Ok(()) => {
                        params.set(spec.key, value);
                        break;
                    }
                    Err(e) => eprintln!("  {e}"),
                }
            }
        }
        Ok(())
    }

    fn confirm(&self, question: &str, default: bool) -> Result<bool> {
        if self.assume_yes {
            info!(question, "auto-confirmed");
            return Ok(true);
        }
        ask_yes_no(question, default)
    }

    fn attest(&self, question: &str) -> Result<bool> {
        ask_yes_no(question, false)
    }

    fn notify(&self, message: &str) {
        eprintln!("{message}");
    }
}

/// Runs from a parameters file only. Missing required values are errors;
/// confirmations answer `assume_yes` and attestations answer no.
#[derive(Debug, Clone, Default)]
pub struct BatchOperator {
    pub assume_yes: bool,
}

impl Operator for BatchOperator {
    fn collect(
        &self,
        fields: &[FieldSpec],
        params: &mut MigrationParameters,
        choices: &Choices,
    ) -> Result<()> {
        for spec in fields {
            if params.contains(spec.key) {
                continue;
            }
            match default_for(spec, choices) {
                Some(d) => params.set(spec.key, d),
                None if spec.required => {
                    return Err(Error::validation(format!(
                        "missing required parameter '{}' ({}) and no terminal to ask",
                        spec.key, spec.label
                    )));
                }
                None => {}
            }
        }
        Ok(())
    }

    fn confirm(&self, question: &str, _default: bool) -> Result<bool> {
        info!(question, answer = self.assume_yes, "non-interactive confirmation");
        Ok(self.assume_yes)
    }

    fn attest(&self, question: &str) -> Result<bool> {
        info!(question, "nobody to ask, answering no");
        Ok(false)
    }

    fn notify(&self, message: &str) {
        info!("{message}");
        eprintln!("{message}");
    }
}

fn ask_yes_no(question: &str, default: bool) -> Result<bool> {
    let hint = if default { "[Y/n]" } else { "[y/N]" };
    loop {
        let Some(answer) = read_line(&format!("{question} {hint} "))? else {
            return Ok(false);
        };
        match answer.trim().to_ascii_lowercase().as_str() {
            "" => return Ok(default),
            "y" | "yes" => return Ok(true),
            "n" | "no" => return Ok(false),
            _ => eprintln!("  please answer y or n"),
        }
    }
}

fn read_line(prompt: &str) -> Result<Option<String>> {
    let mut err = io::stderr();
    let _ = write!(err, "{prompt}");
    let _ = err.flush();
    let mut line = String::new();
    let n = io::stdin().lock().read_line(&mut line)?;
    if n == 0 {
        return Ok(None);
    }
    Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()))
}

struct RawModeGuard;

impl RawModeGuard {
    fn enter() -> Result<Self> {
        enable_raw_mode().map_err(|e| Error::msg(format!("failed to enter raw mode: {e}")))?;
        Ok(Self)
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = disable_raw_mode();
    }
}

/// Read a line without echo. Ctrl-C aborts as an interrupt since raw mode
/// keeps the terminal from raising SIGINT.
fn read_hidden(prompt: &str) -> Result<Option<String>> {
    let mut err = io::stderr();
    let _ = write!(err, "{prompt}");
    let _ = err.flush();
    let mut out = String::new();
    {
        let _raw = RawModeGuard::enter()?;
        loop {
            let Event::Key(key) =
                event::read().map_err(|e| Error::msg(format!("terminal read failed: {e}")))?
            else {
                continue;
            };
            if key.kind != KeyEventKind::Press {
                continue;
            }
            match key.code {
                KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => {
                    drop(_raw);
                    let _ = writeln!(err);
                    return Err(Error::interrupted());
                }
                KeyCode::Char('d') if key.modifiers.contains(KeyModifiers::CONTROL) => {
                    if out.is_empty() {
                        drop(_raw);
                        let _ = writeln!(err);
                        return Ok(None);
                    }
                }
                KeyCode::Enter => break,
                KeyCode::Backspace => {
                    out.pop();
                }
                KeyCode::Char(c) => out.push(c),
                _ => {}
            }
        }
    }
    let _ = writeln!(err);
    Ok(Some(out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::{COMMON_FIELDS, NAME, PORT, TARGET};

    #[test]
    fn batch_fills_defaults_and_choices() {
        let fields = [
            COMMON_FIELDS[2],
            FieldSpec::required("bridge", "Bridge", crate::params::FieldRule::NonEmpty),
        ];
        let mut choices = Choices::new();
        choices.insert("bridge", vec!["vmbr1".into(), "vmbr0".into()]);
        let mut p = MigrationParameters::new();
        BatchOperator::default()
            .collect(&fields, &mut p, &choices)
            .expect("collect");
        assert_eq!(p.get(PORT), Some("22"));
        assert_eq!(p.get("bridge"), Some("vmbr1"));
    }

    #[test]
    fn batch_rejects_missing_required() {
        let mut p = MigrationParameters::from_pairs([(NAME, "web1")]);
        let err = BatchOperator::default()
            .collect(COMMON_FIELDS, &mut p, &Choices::new())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(err.to_string().contains(TARGET));
    }

    #[test]
    fn batch_confirms_only_with_assume_yes() {
        assert!(!BatchOperator::default().confirm("go?", true).expect("confirm"));
        let yes = BatchOperator { assume_yes: true };
        assert!(yes.confirm("go?", false).expect("confirm"));
    }
}
