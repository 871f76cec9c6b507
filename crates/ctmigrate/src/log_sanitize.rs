//! Cleaning of text that comes from other programs (ssh, tar, docker, pct)
//! before it reaches the log or the operator's terminal.

const MAX_LINE_CHARS: usize = 2048;
const REDACTED: &str = "***";

#[derive(Clone, Copy)]
enum Escape {
    Start,
    Csi,
    // OSC/DCS style strings, terminated by BEL or ESC '\'.
    Str { after_esc: bool },
}

/// Strip terminal escape sequences and control characters from one line and
/// cap its length.
pub fn sanitize_log_line(input: &str) -> String {
    let mut out = String::with_capacity(input.len().min(MAX_LINE_CHARS));
    let mut esc: Option<Escape> = None;
    let mut count = 0usize;

    for c in input.chars() {
        esc = match esc {
            Some(Escape::Start) => match c {
                '[' => Some(Escape::Csi),
                ']' | 'P' | 'X' | '^' | '_' => Some(Escape::Str { after_esc: false }),
                _ => None,
            },
            Some(Escape::Csi) => {
                if ('@'..='~').contains(&c) {
                    None
                } else {
                    Some(Escape::Csi)
                }
            }
            Some(Escape::Str { after_esc }) => match c {
                '\x07' => None,
                '\\' if after_esc => None,
                '\x1b' => Some(Escape::Str { after_esc: true }),
                _ => Some(Escape::Str { after_esc: false }),
            },
            None => {
                if c == '\x1b' {
                    Some(Escape::Start)
                } else {
                    if c == '\t' {
                        out.push(' ');
                        count += 1;
                    } else if !c.is_control() && !is_bidi_control(c) {
                        out.push(c);
                        count += 1;
                    }
                    None
                }
            }
        };
        if count >= MAX_LINE_CHARS {
            out.push_str(" ...[truncated]");
            break;
        }
    }
    out
}

/// Sanitize multi-line diagnostic output, keeping only the last `max_lines`
/// non-empty lines (the tail is where ssh and pct put the cause).
pub fn sanitize_diagnostic(input: &str, max_lines: usize) -> String {
    let lines: Vec<String> = input
        .split(['\n', '\r'])
        .map(sanitize_log_line)
        .filter(|l| !l.trim().is_empty())
        .collect();
    let skip = lines.len().saturating_sub(max_lines);
    lines[skip..].join("\n")
}

/// Replace every occurrence of each non-empty secret with `***`.
pub fn redact(input: &str, secrets: &[&str]) -> String {
    let mut out = input.to_string();
    for secret in secrets.iter().filter(|s| !s.is_empty()) {
        out = out.replace(secret, REDACTED);
    }
    out
}

fn is_bidi_control(c: char) -> bool {
    matches!(c, '\u{061C}' | '\u{200E}' | '\u{200F}')
        || ('\u{202A}'..='\u{202E}').contains(&c)
        || ('\u{2066}'..='\u{2069}').contains(&c)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_color_and_title_sequences() {
        let got = sanitize_log_line("ok \u{1b}[31mred\u{1b}[0m \u{1b}]0;title\u{7} done");
        assert_eq!(got, "ok red  done");
    }

    #[test]
    fn strips_string_sequences_terminated_by_st() {
        assert_eq!(sanitize_log_line("a\u{1b}Ppayload\u{1b}\\b"), "ab");
    }

    #[test]
    fn diagnostic_keeps_tail() {
        let raw = "Warning: Permanently added 'h' to known hosts.\r\n\nline2\nPermission denied (publickey,password).\n";
        assert_eq!(
            sanitize_diagnostic(raw, 2),
            "line2\nPermission denied (publickey,password)."
        );
    }

    #[test]
    fn redacts_all_secrets() {
        let got = redact("pw=hunter22 again hunter22 ct=abcde", &["hunter22", "", "abcde"]);
        assert_eq!(got, "pw=*** again *** ct=***");
    }
}
