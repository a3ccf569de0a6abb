use std::path::PathBuf;

use anyhow::Result;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn};

use crate::browser::{download_links, PageCapture, PageSource};
use crate::checkpoint::CheckpointStore;
use crate::config::{FailurePolicy, RetryPolicy, ScrapeConfig};
use crate::error::ScrapeError;
use crate::records::{FailedPage, TargetPage};

/// Result of a scrape run.
#[derive(Debug)]
pub struct ScrapeOutcome {
    /// Every consumed record, including those restored from a checkpoint.
    pub pages: Vec<TargetPage>,
    /// Records without text after exhausting their retries (`skip` policy
    /// only), including those skipped by the run a checkpoint came from.
    pub failures: Vec<FailedPage>,
    /// Checkpoints written by this run.
    pub checkpoints: Vec<PathBuf>,
    /// Input index the run started from.
    pub resumed_from: usize,
}

impl ScrapeOutcome {
    pub fn with_text(&self) -> usize {
        self.pages.iter().filter(|p| p.text.is_some()).count()
    }
}

/// Capture a page, retrying rate-limited attempts after a fixed delay.
/// Any other failure is returned at once.
pub async fn fetch_with_retry<S>(
    source: &S,
    url: &str,
    retry: RetryPolicy,
) -> Result<PageCapture, ScrapeError>
where
    S: PageSource + ?Sized,
{
    let mut attempt = 1;
    loop {
        match source.capture(url).await {
            Ok(capture) => return Ok(capture),
            Err(e) if e.is_rate_limited() => {
                if attempt >= retry.max_attempts {
                    return Err(ScrapeError::RetriesExhausted {
                        url: url.to_string(),
                        attempts: attempt,
                        last: e,
                    });
                }
                warn!(
                    "Rate limited on {} (attempt {}/{}), retrying in {:.1}s",
                    url,
                    attempt,
                    retry.max_attempts,
                    retry.delay.as_secs_f64()
                );
                tokio::time::sleep(retry.delay).await;
                attempt += 1;
            }
            Err(e) => {
                return Err(ScrapeError::Fetch {
                    url: url.to_string(),
                    source: e,
                })
            }
        }
    }
}

/// Annotate each record with its page text and download links, one page
/// at a time.
///
/// Resumes after the highest checkpoint in `store`, whose records must be a
/// prefix of `pages`. A snapshot of everything consumed so far is written
/// every `checkpoint_every` records and once more for a trailing partial
/// batch.
pub async fn scrape_pages<S>(
    source: &S,
    store: &CheckpointStore,
    pages: Vec<TargetPage>,
    config: &ScrapeConfig,
) -> Result<ScrapeOutcome>
where
    S: PageSource + ?Sized,
{
    let total = pages.len();
    let mut processed: Vec<TargetPage> = Vec::with_capacity(total);
    let mut resumed_from = 0;

    if let Some(checkpoint) = store.latest()? {
        anyhow::ensure!(
            checkpoint.count <= total,
            "{} holds {} records but the input only has {}",
            checkpoint.path.display(),
            checkpoint.count,
            total
        );
        if let Some(i) = checkpoint
            .records
            .iter()
            .zip(&pages)
            .position(|(saved, input)| saved.url != input.url)
        {
            anyhow::bail!(
                "{} does not match the input at record {} ({} vs {}); remove {} to start over",
                checkpoint.path.display(),
                i,
                checkpoint.records[i].url,
                pages[i].url,
                store.dir().display()
            );
        }
        info!(
            "Resuming after {} ({} of {} records done)",
            checkpoint.path.display(),
            checkpoint.count,
            total
        );
        resumed_from = checkpoint.count;
        processed = checkpoint.records;
    }

    let mut failures: Vec<FailedPage> = processed
        .iter()
        .filter(|p| p.text.is_none())
        .map(|p| FailedPage {
            url: p.url.clone(),
            error: format!("no text after an earlier run (resumed at record {})", resumed_from),
        })
        .collect();
    if !failures.is_empty() {
        warn!("{} restored records have no text", failures.len());
    }

    let pb = ProgressBar::new(total as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40} {pos}/{len} ({per_sec}, eta {eta})")?
            .progress_chars("=> "),
    );
    pb.set_position(resumed_from as u64);

    let mut checkpoints = Vec::new();
    let mut saved = resumed_from;

    for mut page in pages.into_iter().skip(resumed_from) {
        match fetch_with_retry(source, &page.url, config.retry).await {
            Ok(capture) => {
                page.download_links = download_links(&capture.links);
                page.text = Some(capture.text);
            }
            Err(err @ ScrapeError::RetriesExhausted { .. })
                if config.failure_policy == FailurePolicy::Skip =>
            {
                warn!("Skipping {}: {}", page.label(), err);
                failures.push(FailedPage {
                    url: page.url.clone(),
                    error: err.to_string(),
                });
            }
            Err(err) => {
                pb.finish_and_clear();
                return Err(err.into());
            }
        }
        processed.push(page);
        pb.inc(1);

        if processed.len() % config.checkpoint_every == 0 {
            checkpoints.push(store.write(&processed)?);
            saved = processed.len();
        }
    }
    pb.finish_and_clear();

    if processed.len() > saved {
        checkpoints.push(store.write(&processed)?);
    }

    info!(
        "Scraped {} pages ({} resumed, {} skipped)",
        processed.len(),
        resumed_from,
        failures.len()
    );
    Ok(ScrapeOutcome {
        pages: processed,
        failures,
        checkpoints,
        resumed_from,
    })
}

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::browser::PageCapture;
    use crate::error::FetchError;

    /// Browser double: scripted failures per URL, success otherwise.
    #[derive(Default)]
    struct ScriptedSource {
        script: Mutex<HashMap<String, VecDeque<FetchError>>>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedSource {
        fn fail(self, url: &str, errors: Vec<FetchError>) -> Self {
            self.script
                .lock()
                .unwrap()
                .insert(url.to_string(), errors.into_iter().collect());
            self
        }

        fn calls_for(&self, url: &str) -> usize {
            self.calls.lock().unwrap().iter().filter(|u| *u == url).count()
        }

        fn total_calls(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl PageSource for ScriptedSource {
        async fn capture(&self, url: &str) -> Result<PageCapture, FetchError> {
            self.calls.lock().unwrap().push(url.to_string());
            let next = self
                .script
                .lock()
                .unwrap()
                .get_mut(url)
                .and_then(|queue| queue.pop_front());
            match next {
                Some(err) => Err(err),
                None => Ok(PageCapture {
                    text: format!("text of {}", url),
                    links: vec![format!("{}/rows.csv", url), format!("{}/about", url)],
                }),
            }
        }

        async fn screenshot(&self, _url: &str) -> Result<String, FetchError> {
            Ok(String::new())
        }
    }

    fn rate_limited() -> FetchError {
        FetchError::from_message("429 Too Many Requests")
    }

    fn url(i: usize) -> String {
        format!("https://data.sfgov.org/d/page-{}", i)
    }

    fn inputs(n: usize) -> Vec<TargetPage> {
        (0..n).map(|i| TargetPage::new(url(i))).collect()
    }

    fn config(dir: &std::path::Path, policy: FailurePolicy) -> ScrapeConfig {
        ScrapeConfig {
            retry: RetryPolicy {
                max_attempts: 3,
                delay: Duration::from_secs(5),
            },
            checkpoint_every: 25,
            checkpoint_dir: dir.to_path_buf(),
            failure_policy: policy,
        }
    }

    fn file_names(paths: &[PathBuf]) -> Vec<String> {
        paths
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn all_successes_checkpoint_every_25() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let source = ScriptedSource::default();

        let out = scrape_pages(&source, &store, inputs(60), &config(dir.path(), FailurePolicy::Abort))
            .await
            .unwrap();

        assert_eq!(out.pages.len(), 60);
        assert_eq!(out.with_text(), 60);
        assert_eq!(out.pages[59].text.as_deref(), Some("text of https://data.sfgov.org/d/page-59"));
        assert_eq!(
            file_names(&out.checkpoints),
            vec!["checkpoint_25.json", "checkpoint_50.json", "checkpoint_60.json"]
        );
        assert_eq!(source.total_calls(), 60);
    }

    #[tokio::test(start_paused = true)]
    async fn exact_multiple_writes_no_extra_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let out = scrape_pages(
            &ScriptedSource::default(),
            &store,
            inputs(50),
            &config(dir.path(), FailurePolicy::Abort),
        )
        .await
        .unwrap();
        assert_eq!(
            file_names(&out.checkpoints),
            vec!["checkpoint_25.json", "checkpoint_50.json"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn retries_rate_limits_with_fixed_delay() {
        let target = url(0);
        let source =
            ScriptedSource::default().fail(&target, vec![rate_limited(), rate_limited()]);
        let retry = RetryPolicy {
            max_attempts: 3,
            delay: Duration::from_secs(5),
        };

        let start = tokio::time::Instant::now();
        let capture = fetch_with_retry(&source, &target, retry).await.unwrap();
        let waited = start.elapsed();

        assert_eq!(capture.text, format!("text of {}", target));
        assert_eq!(source.calls_for(&target), 3);
        assert!(waited >= Duration::from_secs(10), "waited {:?}", waited);
        assert!(waited < Duration::from_secs(15), "waited {:?}", waited);
    }

    #[tokio::test(start_paused = true)]
    async fn keeps_only_download_links() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let out = scrape_pages(
            &ScriptedSource::default(),
            &store,
            inputs(2),
            &config(dir.path(), FailurePolicy::Abort),
        )
        .await
        .unwrap();

        assert_eq!(out.pages[1].download_links, vec![format!("{}/rows.csv", url(1))]);
        assert_eq!(
            ScriptedSource::default().page_text(&url(1)).await.unwrap(),
            out.pages[1].text.clone().unwrap()
        );
        let saved = store.latest().unwrap().unwrap();
        assert_eq!(saved.records[1].download_links, out.pages[1].download_links);
    }

    #[tokio::test(start_paused = true)]
    async fn status_digits_in_the_url_do_not_trigger_retries() {
        let target = "https://data.sfgov.org/Housing/Permits/k429-ab3x".to_string();
        let source = ScriptedSource::default().fail(
            &target,
            vec![FetchError::from_message(format!(
                "error sending request for url ({})",
                target
            ))],
        );
        let retry = RetryPolicy {
            max_attempts: 3,
            delay: Duration::from_secs(5),
        };

        let start = tokio::time::Instant::now();
        let err = fetch_with_retry(&source, &target, retry).await.unwrap_err();

        assert!(matches!(err, ScrapeError::Fetch { .. }), "{:?}", err);
        assert_eq!(source.calls_for(&target), 1);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_abort_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let bad = url(30);
        let source = ScriptedSource::default()
            .fail(&bad, vec![rate_limited(), rate_limited(), rate_limited()]);

        let err = scrape_pages(&source, &store, inputs(40), &config(dir.path(), FailurePolicy::Abort))
            .await
            .unwrap_err();

        match err.downcast_ref::<ScrapeError>() {
            Some(ScrapeError::RetriesExhausted { url, attempts, .. }) => {
                assert_eq!(url, &bad);
                assert_eq!(*attempts, 3);
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(source.calls_for(&bad), 3);
        assert_eq!(source.total_calls(), 33);
        // Completed checkpoints survive the abort.
        assert_eq!(store.latest().unwrap().unwrap().count, 25);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_skip_and_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let bad = url(3);
        let source = ScriptedSource::default()
            .fail(&bad, vec![rate_limited(), rate_limited(), rate_limited()]);

        let out = scrape_pages(&source, &store, inputs(10), &config(dir.path(), FailurePolicy::Skip))
            .await
            .unwrap();

        assert_eq!(out.pages.len(), 10);
        assert_eq!(out.with_text(), 9);
        assert!(out.pages[3].text.is_none());
        assert_eq!(out.failures.len(), 1);
        assert_eq!(out.failures[0].url, bad);
        assert!(out.failures[0].error.contains("after 3 rate-limited attempts"));
    }

    #[tokio::test(start_paused = true)]
    async fn other_failures_are_not_retried() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let bad = url(2);
        let source = ScriptedSource::default().fail(
            &bad,
            vec![FetchError::from_message("net::ERR_CONNECTION_RESET")],
        );

        let start = tokio::time::Instant::now();
        let err = scrape_pages(&source, &store, inputs(5), &config(dir.path(), FailurePolicy::Skip))
            .await
            .unwrap_err();

        assert!(matches!(
            err.downcast_ref::<ScrapeError>(),
            Some(ScrapeError::Fetch { .. })
        ));
        assert_eq!(source.calls_for(&bad), 1);
        assert_eq!(source.total_calls(), 3);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn resumes_after_latest_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let mut done = inputs(25);
        for page in &mut done {
            page.text = Some("from earlier run".into());
        }
        store.write(&done).unwrap();

        let source = ScriptedSource::default();
        let out = scrape_pages(&source, &store, inputs(40), &config(dir.path(), FailurePolicy::Abort))
            .await
            .unwrap();

        assert_eq!(out.resumed_from, 25);
        assert_eq!(out.pages.len(), 40);
        assert_eq!(out.pages[0].text.as_deref(), Some("from earlier run"));
        assert_eq!(source.total_calls(), 15);
        assert_eq!(source.calls_for(&url(0)), 0);
        assert_eq!(file_names(&out.checkpoints), vec!["checkpoint_40.json"]);
    }

    #[tokio::test(start_paused = true)]
    async fn skipped_records_are_still_reported_after_resume() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let exhausted = || vec![rate_limited(), rate_limited(), rate_limited()];

        let first = ScriptedSource::default().fail(&url(3), exhausted());
        let out = scrape_pages(&first, &store, inputs(30), &config(dir.path(), FailurePolicy::Skip))
            .await
            .unwrap();
        assert_eq!(out.failures.len(), 1);
        assert_eq!(store.latest().unwrap().unwrap().count, 30);

        let second = ScriptedSource::default().fail(&url(35), exhausted());
        let out = scrape_pages(&second, &store, inputs(40), &config(dir.path(), FailurePolicy::Skip))
            .await
            .unwrap();

        assert_eq!(out.resumed_from, 30);
        assert_eq!(second.calls_for(&url(3)), 0);
        assert!(out.pages[3].text.is_none());
        let failed: Vec<_> = out.failures.iter().map(|f| f.url.clone()).collect();
        assert_eq!(failed, vec![url(3), url(35)]);
    }

    #[tokio::test(start_paused = true)]
    async fn complete_checkpoint_means_nothing_left_to_do() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let mut done = inputs(40);
        for page in &mut done {
            page.text = Some("from earlier run".into());
        }
        store.write(&done).unwrap();

        let source = ScriptedSource::default();
        let out = scrape_pages(&source, &store, inputs(40), &config(dir.path(), FailurePolicy::Abort))
            .await
            .unwrap();

        assert_eq!(out.resumed_from, 40);
        assert_eq!(out.pages, done);
        assert_eq!(source.total_calls(), 0);
        assert!(out.checkpoints.is_empty());
        assert!(out.failures.is_empty());
        assert_eq!(store.list().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn refuses_checkpoint_from_other_input() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        store.write(&[TargetPage::new("https://elsewhere.org/a")]).unwrap();

        let result = scrape_pages(
            &ScriptedSource::default(),
            &store,
            inputs(3),
            &config(dir.path(), FailurePolicy::Abort),
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn merged_checkpoints_rebuild_the_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let out = scrape_pages(
            &ScriptedSource::default(),
            &store,
            inputs(80),
            &config(dir.path(), FailurePolicy::Abort),
        )
        .await
        .unwrap();

        assert_eq!(store.list().unwrap().len(), 4);
        assert_eq!(store.load_merged().unwrap(), out.pages);
    }
}
