//! Pure string normalization used wherever an LLM model identifier becomes
//! part of a log field, a compaction-summary tag, or a sandbox/session
//! label. See the teacher's `domain::workspace::hex_encode` for the
//! precedent of a small pure string utility living next to other domain
//! types rather than in an infra module.

/// Normalize `input` into the token family `^[a-z0-9]+(_[a-z0-9]+)*$`
/// (or the empty string, if nothing alphanumeric was present).
///
/// Lower-cases the input, then collapses every run of characters that are
/// not ASCII alphanumeric into a single `_`, and trims leading/trailing
/// underscores.
#[must_use]
pub fn sanitize(input: &str) -> String {
    let lowered = input.to_lowercase();
    let mut out = String::with_capacity(lowered.len());
    let mut last_was_sep = true; // suppress a leading separator
    for c in lowered.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c);
            last_was_sep = false;
        } else if !last_was_sep {
            out.push('_');
            last_was_sep = true;
        }
    }
    if out.ends_with('_') {
        out.pop();
    }
    out
}
