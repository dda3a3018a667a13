use madara_base::{err, Result};

/// A key begining with `.` is local: not replicated, not modified-tracked
/// for transport purposes. Every other key is global.
pub fn is_local_key(key: &str) -> bool {
    key.starts_with('.')
}

/// Validates that a key's brace-delimited expansion segments
/// (`var{.id}.state`) are balanced. Does not resolve them — resolution
/// happens against a `Context` at compile/evaluate time in `madara-eval`.
pub fn validate_key_braces(key: &str) -> Result<()> {
    let mut depth = 0i32;
    for c in key.chars() {
        match c {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth < 0 {
                    return Err(err(format!(
                        "unbalanced '}}' in key expansion segment: {key}"
                    )));
                }
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err(err(format!(
            "unbalanced '{{' in key expansion segment: {key}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn local_keys_start_with_dot() {
        assert!(is_local_key(".private"));
        assert!(!is_local_key("agent1.state"));
    }

    #[test]
    fn brace_balance() {
        assert!(validate_key_braces("var{.id}.state").is_ok());
        assert!(validate_key_braces("var{.id.state").is_err());
        assert!(validate_key_braces("var.id}.state").is_err());
    }
}
