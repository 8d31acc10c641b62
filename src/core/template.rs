//! Command template expansion
//!
//! Upload commands are user-supplied templates with substitution tokens
//! (`<file>`, `<filesize>`, `<chunk>`). The expander keeps the escape
//! contract the original device profiles were written against: `$$` in the
//! replacement text collapses to a literal `$` during insertion, everything
//! else is copied verbatim. Callers substituting binary chunk data must
//! therefore double every `$` first — [`escape_dollars`] — or payload bytes
//! of value `0x24` would be corrupted.

/// Replace the first occurrence of `token` in `template`, un-escaping `$$`
/// sequences in `replacement` as it is inserted.
pub fn expand_template(template: &str, token: &str, replacement: &str) -> String {
    let Some(at) = template.find(token) else {
        return template.to_string();
    };

    let mut out = String::with_capacity(template.len() + replacement.len());
    out.push_str(&template[..at]);

    let mut chars = replacement.chars();
    while let Some(c) = chars.next() {
        if c == '$' {
            match chars.next() {
                Some('$') => out.push('$'),
                Some(other) => {
                    out.push('$');
                    out.push(other);
                }
                None => out.push('$'),
            }
        } else {
            out.push(c);
        }
    }

    out.push_str(&template[at + token.len()..]);
    out
}

/// Double every `$`, producing text safe to hand to [`expand_template`].
pub fn escape_dollars(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if c == '$' {
            out.push_str("$$");
        } else {
            out.push(c);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_substitution() {
        assert_eq!(
            expand_template("MMEM:DOWN:FNAM <file>", "<file>", "\"/Recordings/a.dlog\""),
            "MMEM:DOWN:FNAM \"/Recordings/a.dlog\""
        );
    }

    #[test]
    fn test_missing_token_leaves_template_untouched() {
        assert_eq!(expand_template("MMEM:DOWN:SIZE 10", "<chunk>", "x"), "MMEM:DOWN:SIZE 10");
    }

    #[test]
    fn test_only_first_occurrence_is_replaced() {
        assert_eq!(expand_template("<n> and <n>", "<n>", "1"), "1 and <n>");
    }

    #[test]
    fn test_dollar_escape_roundtrip() {
        // A chunk containing 0x24 must survive substitution byte-for-byte.
        let chunk = "ab$cd$$";
        let expanded = expand_template("MMEM:DOWN:DATA <chunk>", "<chunk>", &escape_dollars(chunk));
        assert_eq!(expanded, "MMEM:DOWN:DATA ab$cd$$");
    }

    #[test]
    fn test_lone_trailing_dollar() {
        assert_eq!(expand_template("x<t>", "<t>", "$"), "x$");
    }
}
