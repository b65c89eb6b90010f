use regex::Regex;
use std::sync::OnceLock;

fn href_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?i)<a\s[^>]*href\s*=\s*["']([^"']+)["']"#).unwrap_or_else(|_| unreachable!())
    })
}

pub fn parse_type_listing(html: &str) -> Vec<String> {
    let mut types = Vec::new();
    for cap in href_regex().captures_iter(html) {
        let href = &cap[1];
        let Some(name) = href.strip_suffix('/') else {
            continue;
        };
        if name.is_empty()
            || name == "."
            || name == ".."
            || name.contains('/')
            || name.contains(':')
            || name.starts_with('?')
        {
            continue;
        }
        if !types.iter().any(|t| t == name) {
            types.push(name.to_owned());
        }
    }
    types
}
