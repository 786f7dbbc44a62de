use std::sync::LazyLock;

use flagforge_common::{FormDescriptor, FormField};
use scraper::{ElementRef, Html, Selector};
use url::Url;

static LINKS: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("a[href]").expect("link selector is a valid static selector"));
static FORMS: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("form").expect("form selector is a valid static selector"));
static FIELDS: LazyLock<Selector> = LazyLock::new(|| {
    Selector::parse("input, textarea, select").expect("field selector is a valid static selector")
});

/// Links and forms extracted from one HTML page.
#[derive(Debug, Default, PartialEq)]
pub struct ParsedPage {
    /// Absolute http(s) links, fragment removed, in document order
    pub links: Vec<Url>,
    pub forms: Vec<FormDescriptor>,
}

/// Extract links and forms from `body`, resolving relative references
/// against `base`.
pub fn parse_html(body: &str, base: &Url) -> ParsedPage {
    let document = Html::parse_document(body);

    let mut links: Vec<Url> = Vec::new();
    for element in document.select(&LINKS) {
        let Some(href) = element.value().attr("href") else {
            continue;
        };
        let href = href.trim();
        if href.is_empty() || href.starts_with('#') || href.starts_with("javascript:") || href.starts_with("mailto:") {
            continue;
        }
        let Ok(mut url) = base.join(href) else {
            continue;
        };
        if !matches!(url.scheme(), "http" | "https") {
            continue;
        }
        url.set_fragment(None);
        if !links.contains(&url) {
            links.push(url);
        }
    }

    let forms = document.select(&FORMS).map(|form| form_descriptor(form, base)).collect();

    ParsedPage { links, forms }
}

fn form_descriptor(form: ElementRef<'_>, base: &Url) -> FormDescriptor {
    let action = form
        .value()
        .attr("action")
        .map(str::trim)
        .filter(|a| !a.is_empty())
        .and_then(|a| base.join(a).ok())
        .unwrap_or_else(|| base.clone());
    let method = form
        .value()
        .attr("method")
        .map(|m| m.trim().to_uppercase())
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| "GET".to_string());

    let fields = form
        .select(&FIELDS)
        .filter_map(|field| {
            let el = field.value();
            let name = el.attr("name")?.trim();
            if name.is_empty() {
                return None;
            }
            let field_type = match el.name() {
                "input" => el.attr("type").unwrap_or("text").to_lowercase(),
                other => other.to_string(),
            };
            Some(FormField {
                name: name.to_string(),
                field_type,
                required: el.attr("required").is_some(),
            })
        })
        .collect();

    FormDescriptor {
        action: action.to_string(),
        method,
        fields,
        page_url: base.to_string(),
    }
}
