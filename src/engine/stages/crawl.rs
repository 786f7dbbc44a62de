use std::collections::{HashSet, VecDeque};

use anyhow::anyhow;
use async_trait::async_trait;
use flagforge_common::Stage;
use serde_json::json;
use url::Url;

use super::FETCH_TOOL;
use crate::engine::context::StageContext;
use crate::engine::html::parse_html;
use crate::engine::{StageOutcome, StageRunner};
use crate::errors::{StageError, ToolErrorKind};
use crate::run::normalize_url;
use crate::tools::FetchedPage;

/// Breadth-first crawl of the target's host, followed by a probe of
/// well-known paths. Does not consult the oracle.
pub struct CrawlStage;

#[async_trait]
impl StageRunner for CrawlStage {
    fn stage(&self) -> Stage {
        Stage::Crawl
    }

    async fn run(&self, ctx: &mut StageContext<'_>) -> Result<StageOutcome, StageError> {
        let input = ctx.input()?;
        let root = Url::parse(input.target_url.trim())
            .map_err(|e| anyhow!("invalid target URL {}: {}", input.target_url, e))?;
        let max_pages = ctx.settings().crawl_max_pages.max(1);
        let max_depth = ctx.settings().crawl_max_depth;
        let probe_paths = ctx.settings().probe_paths.clone();

        let mut queue: VecDeque<(Url, usize)> = VecDeque::from([(root.clone(), 0)]);
        let mut seen: HashSet<String> = HashSet::from([normalize_url(root.as_str())]);
        let mut fetched = 0usize;
        let mut pages = 0usize;
        let mut forms = 0usize;

        while let Some((url, depth)) = queue.pop_front() {
            if fetched >= max_pages {
                queue.push_front((url, depth));
                break;
            }
            let outcome = ctx.invoke_tool(FETCH_TOOL, &json!({ "url": url.as_str() })).await?;
            fetched += 1;

            if let Some(kind) = outcome.error {
                if fetched > 1 {
                    continue;
                }
                if kind == ToolErrorKind::NotFound {
                    ctx.log(format!("{} is unavailable, skipping crawl", FETCH_TOOL))?;
                    return Ok(StageOutcome::Advance);
                }
                return Err(StageError::ToolsUnavailable {
                    stage: Stage::Crawl,
                    calls: 1,
                    last_error: outcome.describe(),
                });
            }

            let Some(page) = FetchedPage::parse(&outcome.output) else {
                ctx.add_page(url.as_str())?;
                pages += 1;
                continue;
            };
            // redirects can land on a page we already have
            if !ctx.add_page(&page.url)? {
                continue;
            }
            pages += 1;

            if page.is_html() {
                let base = Url::parse(&page.url).unwrap_or_else(|_| url.clone());
                let parsed = parse_html(&page.body, &base);
                for form in parsed.forms {
                    ctx.add_form(form)?;
                    forms += 1;
                }
                if depth < max_depth {
                    for link in parsed.links {
                        if same_origin(&link, &root) && seen.insert(normalize_url(link.as_str())) {
                            queue.push_back((link, depth + 1));
                        }
                    }
                }
            }
            ctx.report_progress(0.8 * fetched as f64 / max_pages as f64)?;
        }

        let cap_reached = !queue.is_empty();
        if cap_reached {
            ctx.log(format!(
                "Crawl page cap of {} reached with {} URLs left unvisited",
                max_pages,
                queue.len()
            ))?;
        }

        let mut hits = 0usize;
        for (i, path) in probe_paths.iter().enumerate() {
            let Ok(url) = root.join(path) else {
                continue;
            };
            if !seen.insert(normalize_url(url.as_str())) {
                continue;
            }
            let outcome = ctx.probe_tool(FETCH_TOOL, &json!({ "url": url.as_str() })).await?;
            if outcome.is_ok() && ctx.add_page(url.as_str())? {
                pages += 1;
                hits += 1;
                ctx.add_finding(format!("Probe hit: {}", url))?;
            }
            ctx.report_progress(0.8 + 0.2 * (i + 1) as f64 / probe_paths.len() as f64)?;
        }

        ctx.log(format!(
            "Crawl finished: {} pages, {} forms, {} probe hits",
            pages, forms, hits
        ))?;
        Ok(if cap_reached {
            StageOutcome::CapReached
        } else {
            StageOutcome::Advance
        })
    }
}

fn same_origin(link: &Url, root: &Url) -> bool {
    link.scheme() == root.scheme()
        && link.host_str() == root.host_str()
        && link.port_or_known_default() == root.port_or_known_default()
}
