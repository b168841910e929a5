//! Shortening of docker output before it lands in error messages.
//!
//! `docker push` and `docker commit` can print pages of progress before the
//! actual failure, and the message ends up in the job history and status
//! file. Only the tail is kept since docker reports the error last.

/// Characters of stderr kept in a [`dockmaster_core::RuntimeError`].
pub const DEFAULT_MAX_CHARS: usize = 2_000;

const ELISION: &str = "[…] ";

/// Decode `raw` lossily, trim it, and keep at most the last `max_chars`
/// characters.
pub fn summarize(raw: &[u8], max_chars: usize) -> String {
    let text = String::from_utf8_lossy(raw);
    let text = text.trim();
    let total = text.chars().count();
    if total <= max_chars {
        return text.to_owned();
    }
    let skip = total - max_chars;
    let tail: String = text.chars().skip(skip).collect();
    format!("{ELISION}{}", tail.trim_start())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_output_is_only_trimmed() {
        assert_eq!(summarize(b"  no such container\n", 100), "no such container");
    }

    #[test]
    fn long_output_keeps_the_tail() {
        let mut raw = "progress\n".repeat(500);
        raw.push_str("denied: requested access to the resource is denied");
        let out = summarize(raw.as_bytes(), 60);
        assert!(out.starts_with(ELISION));
        assert!(out.ends_with("requested access to the resource is denied"));
        assert!(out.chars().count() <= 60 + ELISION.chars().count());
    }

    #[test]
    fn multibyte_text_is_not_split() {
        let out = summarize("ééééé".as_bytes(), 3);
        assert_eq!(out, format!("{ELISION}ééé"));
    }

    #[test]
    fn invalid_utf8_is_replaced() {
        assert_eq!(summarize(&[0x66, 0xff, 0x6f], 10), "f\u{fffd}o");
    }
}
