use std::sync::OnceLock;

use regex::Regex;
use scraper::ElementRef;

/// Elements whose text never shows up on the rendered page.
const HIDDEN: [&str; 4] = ["script", "style", "noscript", "template"];

/// Text nodes under `el`, in document order, skipping script-like content.
pub fn visible_strings<'a>(el: ElementRef<'a>) -> impl Iterator<Item = &'a str> + 'a {
    el.descendants().filter_map(|node| {
        let text = node.value().as_text()?;
        let parent = node.parent()?;
        match parent.value().as_element() {
            Some(p) if HIDDEN.contains(&p.name()) => None,
            _ => Some(&**text),
        }
    })
}

/// Every text node trimmed and glued together with no separator.
pub fn stripped_text(el: ElementRef<'_>) -> String {
    visible_strings(el)
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .collect()
}

pub fn contains_text(el: ElementRef<'_>, needle: &str) -> bool {
    visible_strings(el).collect::<String>().contains(needle)
}

/// Collapse whitespace runs (full-width spaces included) and trim.
pub fn collapse_whitespace(s: &str) -> String {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"\s+").unwrap());
    re.replace_all(s, " ").trim().to_string()
}

/// Prefix of `s` before the first `marker`, or all of `s`.
pub fn cut_at<'a>(s: &'a str, marker: &str) -> &'a str {
    match s.find(marker) {
        Some(i) => &s[..i],
        None => s,
    }
}

/// Text between the first `marker` and the next one (or the end).
pub fn after_marker<'a>(s: &'a str, marker: &str) -> Option<&'a str> {
    if marker.is_empty() {
        return None;
    }
    s.split(marker).nth(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use scraper::Html;

    #[test]
    fn collapses_mixed_whitespace() {
        assert_eq!(collapse_whitespace("  東京都\u{3000}港区 \n\t 芝浦 "), "東京都 港区 芝浦");
    }

    #[test]
    fn after_marker_stops_at_repeat() {
        assert_eq!(after_marker("a本社b本社c", "本社"), Some("b"));
        assert_eq!(after_marker("no marker", "本社"), None);
    }

    #[test]
    fn stripped_text_skips_scripts() {
        let doc = Html::parse_fragment("<div> 業種 <script>var x = 1;</script><span> 商社 </span></div>");
        let div = doc.root_element();
        assert_eq!(stripped_text(div), "業種商社");
    }
}
