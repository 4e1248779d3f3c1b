//! Live-reload script injection for HTML responses
//!
//! The injected block carries a marker attribute so that running the
//! transform twice never produces two clients on the same page.

use super::socket::SOCKET_PATH;

/// Attribute that identifies the injected script block
pub const INJECTION_MARKER: &str = "data-devlight-live-reload";

const CLIENT_SCRIPT: &str = include_str!("client/live-reload.js");

/// Render the `<script>` block for the given overlay setting
pub fn script_block(show_overlay: bool) -> String {
    let body = CLIENT_SCRIPT
        .replace(
            "__DEVLIGHT_SHOW_OVERLAY__",
            if show_overlay { "true" } else { "false" },
        )
        .replace("__DEVLIGHT_SOCKET_PATH__", SOCKET_PATH);
    format!("<script {}>\n{}</script>\n", INJECTION_MARKER, body)
}

/// Embed the live-reload client into an HTML document
///
/// Returns the input unchanged when the marker is already present. Otherwise
/// the block goes right before `</head>` (case-insensitive), or at the very
/// start of the document when there is no head.
pub fn inject(html: &str, show_overlay: bool) -> String {
    if html.contains(INJECTION_MARKER) {
        return html.to_string();
    }

    let block = script_block(show_overlay);
    let mut out = String::with_capacity(html.len() + block.len());

    // ASCII lowercasing keeps byte offsets aligned with the original
    match html.to_ascii_lowercase().find("</head>") {
        Some(idx) => {
            out.push_str(&html[..idx]);
            out.push_str(&block);
            out.push_str(&html[idx..]);
        }
        None => {
            out.push_str(&block);
            out.push_str(html);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = "<!DOCTYPE html><html><head><title>x</title></head><body>hi</body></html>";

    #[test]
    fn test_inject_before_head_close() {
        let out = inject(PAGE, true);
        let marker_at = out.find(INJECTION_MARKER).unwrap();
        let head_at = out.find("</head>").unwrap();
        assert!(marker_at < head_at);
        assert_eq!(out.matches(INJECTION_MARKER).count(), 1);
        assert!(out.ends_with("<body>hi</body></html>"));
    }

    #[test]
    fn test_inject_is_idempotent() {
        for overlay in [true, false] {
            for html in [PAGE, "<p>fragment</p>", "", "<HTML><HEAD></HEAD></HTML>"] {
                let once = inject(html, overlay);
                let twice = inject(&once, overlay);
                assert_eq!(once, twice);
                assert_eq!(twice.matches(INJECTION_MARKER).count(), 1);
            }
        }
    }

    #[test]
    fn test_inject_prepends_without_head() {
        let out = inject("<p>fragment</p>", false);
        assert!(out.starts_with("<script"));
        assert!(out.ends_with("<p>fragment</p>"));
    }

    #[test]
    fn test_inject_uppercase_head() {
        let out = inject("<HTML><HEAD><TITLE>t</TITLE></HEAD><BODY></BODY></HTML>", true);
        assert!(out.find(INJECTION_MARKER).unwrap() < out.find("</HEAD>").unwrap());
    }

    #[test]
    fn test_overlay_flag_rendered() {
        assert!(script_block(true).contains("var SHOW_OVERLAY = true;"));
        assert!(script_block(false).contains("var SHOW_OVERLAY = false;"));
        assert!(script_block(true).contains(SOCKET_PATH));
        assert!(!script_block(true).contains("__DEVLIGHT_"));
    }
}
