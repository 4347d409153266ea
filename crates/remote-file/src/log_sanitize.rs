const MAX_LOG_CHARS: usize = 4096;
pub const MAX_SNIPPET_CHARS: usize = 256;

#[derive(Clone, Copy)]
enum Escape {
    Start,
    Csi,
    // OSC/DCS-style strings, ended by BEL (OSC only) or ESC '\'.
    Str { bel_ends: bool, saw_esc: bool },
}

/// Strip terminal escape sequences and control characters from a single
/// line and cap its length.
pub fn sanitize_log_line(input: &str) -> String {
    sanitize_with_limit(input, MAX_LOG_CHARS)
}

/// Printable excerpt of a response body for error messages.
pub fn body_snippet(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    let out = sanitize_with_limit(&text, MAX_SNIPPET_CHARS);
    if out.trim().is_empty() {
        "<empty body>".into()
    } else {
        out
    }
}

fn sanitize_with_limit(input: &str, max_chars: usize) -> String {
    let mut out = String::with_capacity(input.len().min(max_chars));
    let mut esc: Option<Escape> = None;
    let mut count = 0usize;

    for c in input.chars() {
        if let Some(state) = esc {
            esc = match state {
                Escape::Start => match c {
                    '[' => Some(Escape::Csi),
                    ']' => Some(Escape::Str {
                        bel_ends: true,
                        saw_esc: false,
                    }),
                    'P' | 'X' | '^' | '_' => Some(Escape::Str {
                        bel_ends: false,
                        saw_esc: false,
                    }),
                    _ => None,
                },
                Escape::Csi => (!('@'..='~').contains(&c)).then_some(Escape::Csi),
                Escape::Str { bel_ends, saw_esc } => {
                    if (bel_ends && c == '\x07') || (saw_esc && c == '\\') {
                        None
                    } else {
                        Some(Escape::Str {
                            bel_ends,
                            saw_esc: c == '\x1b',
                        })
                    }
                }
            };
            continue;
        }

        match c {
            '\x1b' => esc = Some(Escape::Start),
            '\r' | '\n' => {}
            '\t' => {
                out.push(' ');
                count += 1;
            }
            c if c.is_control() || is_format_control(c) => {}
            c => {
                out.push(c);
                count += 1;
            }
        }

        if count >= max_chars {
            out.push_str(" ...[truncated]");
            break;
        }
    }

    out
}

fn is_format_control(c: char) -> bool {
    matches!(c, '\u{061C}' | '\u{200E}' | '\u{200F}')
        || ('\u{202A}'..='\u{202E}').contains(&c)
        || ('\u{2066}'..='\u{2069}').contains(&c)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_csi_and_osc_sequences() {
        let input = "ok \u{1b}[31mred\u{1b}[0m \u{1b}]0;title\u{7} done";
        assert_eq!(sanitize_log_line(input), "ok red  done");
    }

    #[test]
    fn strips_dcs_until_string_terminator() {
        assert_eq!(sanitize_log_line("a\u{1b}Ppayload\u{1b}\\b"), "ab");
    }

    #[test]
    fn strips_newlines_and_bidi_controls() {
        assert_eq!(sanitize_log_line("a\tb\nc\r\u{202e}x"), "a bcx");
    }

    #[test]
    fn snippet_is_truncated_and_never_blank() {
        let long = vec![b'x'; 10_000];
        let s = body_snippet(&long);
        assert!(s.ends_with("...[truncated]"));
        assert!(s.len() < 300);
        assert_eq!(body_snippet(b"\r\n"), "<empty body>");
        assert_eq!(body_snippet(b"Not Found\n"), "Not Found");
    }
}
