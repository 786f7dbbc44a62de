use regex::Regex;
use tracing::warn;

const COMMON_SHAPES: [&str; 3] = [r"CTF\{[^}\s]+\}", r"flag\{[^}\s]+\}", r"FLAG\{[^}\s]+\}"];

/// Pattern matcher for captured flags.
///
/// Built from the run's optional flag-format hint, where `*` stands for the
/// flag body (`CTF{*}`, `picoCTF{*}`), plus the common `CTF{}`, `flag{}` and
/// `FLAG{}` shapes.
#[derive(Debug, Clone)]
pub struct FlagMatcher {
    patterns: Vec<Regex>,
}

impl FlagMatcher {
    pub fn new(flag_format: Option<&str>) -> Self {
        let mut sources = Vec::new();
        if let Some(format) = flag_format.map(str::trim).filter(|f| !f.is_empty()) {
            sources.push(format_to_pattern(format));
        }
        sources.extend(COMMON_SHAPES.iter().map(|s| s.to_string()));

        let patterns = sources
            .iter()
            .filter_map(|src| match Regex::new(src) {
                Ok(re) => Some(re),
                Err(e) => {
                    warn!(pattern = %src, error = %e, "skipping unusable flag pattern");
                    None
                }
            })
            .collect();
        Self { patterns }
    }

    /// Every distinct flag in `text`, in order of first appearance.
    pub fn find_all(&self, text: &str) -> Vec<String> {
        let mut hits: Vec<(usize, String)> = Vec::new();
        for re in &self.patterns {
            for m in re.find_iter(text) {
                if !hits.iter().any(|(_, v)| v == m.as_str()) {
                    hits.push((m.start(), m.as_str().to_string()));
                }
            }
        }
        hits.sort_by_key(|(pos, _)| *pos);
        hits.into_iter().map(|(_, v)| v).collect()
    }
}

fn format_to_pattern(format: &str) -> String {
    if format.contains('*') {
        format
            .split('*')
            .map(regex::escape)
            .collect::<Vec<_>>()
            .join(r"[^}\s]+")
    } else if let Some(prefix) = format.strip_suffix("{}") {
        format!(r"{}\{{[^}}\s]+\}}", regex::escape(prefix))
    } else {
        regex::escape(format)
    }
}
