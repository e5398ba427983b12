//! Removal of `<private>...</private>` spans before anything is stored.

use once_cell::sync::Lazy;
use regex::Regex;

static PRIVATE_SPAN: Lazy<Regex> = Lazy::new(|| {
    // An unterminated opening marker hides everything after it.
    Regex::new(r"(?is)<private>.*?(?:</private>|\z)").expect("Valid privacy marker regex")
});

/// Strip every privacy-marked span, markers included.
///
/// Surrounding text is left untouched (no trimming), so
/// `"<private>x</private> rest"` becomes `" rest"`.
pub fn strip_private(text: &str) -> String {
    PRIVATE_SPAN.replace_all(text, "").into_owned()
}

/// Whether `text` carries any privacy marker
pub fn has_private(text: &str) -> bool {
    PRIVATE_SPAN.is_match(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn strips_marked_span() {
        assert_eq!(
            strip_private("<private>token=abc123</private> Use this endpoint for auth"),
            " Use this endpoint for auth"
        );
    }

    #[test]
    fn strips_multiple_multiline_spans_case_insensitively() {
        let input = "a <PRIVATE>one\ntwo</Private> b <private>three</private> c";
        assert_eq!(strip_private(input), "a  b  c");
    }

    #[test]
    fn unterminated_marker_hides_the_rest() {
        assert_eq!(strip_private("keep <private>secret forever"), "keep ");
    }

    #[test]
    fn text_without_markers_is_unchanged() {
        let input = "nothing to hide";
        assert!(!has_private(input));
        assert_eq!(strip_private(input), input);
    }
}
