use std::collections::HashSet;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use reqwest::{Client, Url};
use scraper::{Html, Selector};
use tracing::{info, warn};

use crate::records::TargetPage;
use crate::supabase::SupabaseClient;

pub const PORTAL_URL: &str = "https://data.sfgov.org";
/// Safety cap on browse pages walked in one crawl.
pub const MAX_BROWSE_PAGES: usize = 70;
/// Objects listed per storage call when looking for missing uploads.
const LIST_LIMIT: usize = 700;

/// Datasets found on one browse page.
#[derive(Debug)]
pub struct BrowsePage {
    pub datasets: Vec<TargetPage>,
    pub has_next: bool,
}

fn selector(css: &str) -> Result<Selector> {
    Selector::parse(css).map_err(|e| anyhow!("invalid selector {}: {:?}", css, e))
}

pub fn parse_browse_page(html: &str, base: &Url) -> Result<BrowsePage> {
    let document = Html::parse_document(html);
    let result_links = selector("a.browse2-result-name-link")?;
    let next = selector("a.next")?;

    let datasets = document
        .select(&result_links)
        .filter_map(|a| {
            let href = a.value().attr("href")?;
            let url = base.join(href).ok()?;
            let mut page = TargetPage::new(url.to_string());
            page.title = Some(a.text().collect::<String>().trim().to_string());
            Some(page)
        })
        .collect();

    let has_next = document
        .select(&next)
        .next()
        .map(|a| !a.value().classes().any(|c| c == "disabled"))
        .unwrap_or(false);

    Ok(BrowsePage { datasets, has_next })
}

/// Walk the portal's dataset listing page by page.
pub async fn crawl(client: &Client, portal: &str, max_pages: usize) -> Result<Vec<TargetPage>> {
    let base = Url::parse(portal).with_context(|| format!("invalid portal URL {}", portal))?;
    let mut datasets = Vec::new();
    let mut pages = 0;

    for page in 1..=max_pages.min(MAX_BROWSE_PAGES) {
        info!("Processing page {}...", page);
        let url = format!("{}/browse?limitTo=datasets&page={}", portal.trim_end_matches('/'), page);
        let html = client
            .get(&url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .with_context(|| format!("failed to fetch {}", url))?
            .text()
            .await
            .with_context(|| format!("failed to read {}", url))?;

        let parsed = parse_browse_page(&html, &base)?;
        datasets.extend(parsed.datasets);
        pages = page;
        if !parsed.has_next {
            break;
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }

    info!("Found {} datasets across {} pages", datasets.len(), pages);
    Ok(datasets)
}

/// Fill in each dataset's id (last URL path segment) and its CSV export URL.
pub fn annotate(pages: Vec<TargetPage>) -> Vec<TargetPage> {
    pages
        .into_iter()
        .map(|mut page| {
            let id = dataset_id(&page.url);
            if let Some(id) = id {
                page.download_url = Some(format!("{}/api/views/{}/rows.csv", PORTAL_URL, id));
                page.id = Some(id);
            }
            page
        })
        .collect()
}

fn dataset_id(url: &str) -> Option<String> {
    let path = Url::parse(url)
        .map(|u| u.path().to_string())
        .unwrap_or_else(|_| url.to_string());
    path.split('/')
        .filter(|s| !s.is_empty())
        .last()
        .map(str::to_string)
}

/// One export URL per line.
pub fn download_url_lines(pages: &[TargetPage]) -> String {
    pages
        .iter()
        .filter_map(|p| p.download_url.as_deref())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Datasets whose `<id>.csv` is not among `existing`.
pub fn missing_datasets<'a>(pages: &'a [TargetPage], existing: &HashSet<String>) -> Vec<&'a TargetPage> {
    pages
        .iter()
        .filter(|p| p.download_url.is_some())
        .filter(|p| match &p.id {
            Some(id) => !existing.contains(&format!("{}.csv", id)),
            None => false,
        })
        .collect()
}

#[derive(Debug, Default)]
pub struct BackfillReport {
    pub missing: usize,
    pub uploaded: usize,
    pub failed: usize,
}

/// Download every dataset missing from `<bucket>/csv/` and upload it there.
/// A failed dataset is logged and skipped.
pub async fn backfill(
    storage: &SupabaseClient,
    http: &Client,
    bucket: &str,
    pages: &[TargetPage],
) -> Result<BackfillReport> {
    let existing: HashSet<String> = storage
        .list_objects(bucket, "csv", LIST_LIMIT)
        .await?
        .into_iter()
        .map(|o| o.name)
        .collect();
    let missing = missing_datasets(pages, &existing);
    info!("{} of {} datasets missing from {}/csv", missing.len(), pages.len(), bucket);

    let mut report = BackfillReport {
        missing: missing.len(),
        ..Default::default()
    };
    for page in missing {
        match copy_dataset(storage, http, bucket, page).await {
            Ok(path) => {
                info!("Uploaded {}", path);
                report.uploaded += 1;
            }
            Err(err) => {
                warn!("Error processing {}: {:#}", page.label(), err);
                report.failed += 1;
            }
        }
    }
    Ok(report)
}

async fn copy_dataset(
    storage: &SupabaseClient,
    http: &Client,
    bucket: &str,
    page: &TargetPage,
) -> Result<String> {
    let (Some(id), Some(url)) = (page.id.as_deref(), page.download_url.as_deref()) else {
        anyhow::bail!("{} has no id or download URL", page.url);
    };
    info!("Downloading {}.csv from {}", id, url);
    let bytes = http
        .get(url)
        .send()
        .await
        .and_then(|r| r.error_for_status())
        .with_context(|| format!("failed to download {}", url))?
        .bytes()
        .await?;
    storage
        .upload_object(bucket, &format!("csv/{}.csv", id), bytes.to_vec(), "text/csv")
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    const BROWSE_HTML: &str = r#"
        <div class="browse2-results">
          <a class="browse2-result-name-link" href="https://data.sfgov.org/Public-Safety/Fire-Incidents/wr8u-xric">
            Fire Incidents
          </a>
          <a class="browse2-result-name-link" href="/Housing-and-Buildings/Building-Permits/i98e-djp9">Building Permits</a>
          <a class="other" href="/ignored">Ignored</a>
        </div>
        <a class="next" href="/browse?page=2">Next</a>
    "#;

    #[test]
    fn parses_results_and_next_link() {
        let base = Url::parse(PORTAL_URL).unwrap();
        let page = parse_browse_page(BROWSE_HTML, &base).unwrap();
        assert!(page.has_next);
        assert_eq!(page.datasets.len(), 2);
        assert_eq!(page.datasets[0].title.as_deref(), Some("Fire Incidents"));
        assert_eq!(
            page.datasets[1].url,
            "https://data.sfgov.org/Housing-and-Buildings/Building-Permits/i98e-djp9"
        );
    }

    #[test]
    fn disabled_next_ends_the_crawl() {
        let base = Url::parse(PORTAL_URL).unwrap();
        let html = r##"<a class="next disabled" href="#">Next</a>"##;
        assert!(!parse_browse_page(html, &base).unwrap().has_next);
        assert!(!parse_browse_page("<p>no pager</p>", &base).unwrap().has_next);
    }

    #[test]
    fn annotates_ids_and_export_urls() {
        let pages = annotate(vec![TargetPage::new(
            "https://data.sfgov.org/Public-Safety/Fire-Incidents/wr8u-xric",
        )]);
        assert_eq!(pages[0].id.as_deref(), Some("wr8u-xric"));
        assert_eq!(
            pages[0].download_url.as_deref(),
            Some("https://data.sfgov.org/api/views/wr8u-xric/rows.csv")
        );
        assert_eq!(
            download_url_lines(&pages),
            "https://data.sfgov.org/api/views/wr8u-xric/rows.csv"
        );
    }

    #[test]
    fn finds_datasets_not_yet_uploaded() {
        let pages = annotate(vec![
            TargetPage::new("https://data.sfgov.org/a/aaaa-1111"),
            TargetPage::new("https://data.sfgov.org/b/bbbb-2222"),
        ]);
        let existing: HashSet<String> = ["aaaa-1111.csv".to_string()].into_iter().collect();
        let missing = missing_datasets(&pages, &existing);
        assert_eq!(missing.len(), 1);
        assert_eq!(missing[0].id.as_deref(), Some("bbbb-2222"));
    }
}
