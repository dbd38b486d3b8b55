//! JSON-path column rendering.
//!
//! The remote stores some unique keys inside JSON columns; filtering on
//! them requires the gateway's arrow syntax. This helper is the only place
//! that syntax appears.

/// Render a dotted path for the gateway's filter language: `a` stays `a`,
/// `a.b` becomes `a->>b`, `a.b.c` becomes `a->b->>c` (text extraction on
/// the final hop only).
pub fn render_json_path(path: &str) -> String {
    let segments: Vec<&str> = path.split('.').collect();
    match segments.as_slice() {
        [] => String::new(),
        [only] => (*only).to_string(),
        [head @ .., last] => {
            let mut out = head.join("->");
            out.push_str("->>");
            out.push_str(last);
            out
        }
    }
}
