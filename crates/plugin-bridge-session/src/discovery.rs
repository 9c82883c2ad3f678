//! Worker/page discovery.
//!
//! The number of workers attached beneath a page is used as a proxy for
//! "a plugin is running here". It is a heuristic: two plugin sessions with
//! similar worker counts cannot be told apart, and the first best candidate
//! in listing order wins.

use futures::future::join_all;
use plugin_bridge_cdp::{DebugBrowser, DebugPage, TargetInfo};
use plugin_bridge_core::BridgeError;
use serde::Serialize;

/// One candidate execution context from a discovery pass.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PageCandidate {
    #[serde(skip)]
    pub target: TargetInfo,
    pub worker_count: usize,
    pub is_current: bool,
}

impl PageCandidate {
    #[must_use]
    pub fn url(&self) -> &str {
        &self.target.url
    }
}

/// Outcome of initial selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selection {
    /// Index into the candidate list.
    Existing(usize),
    /// No usable page exists; open a blank one.
    CreateBlank,
}

/// Whether `url` points at a concrete open document.
#[must_use]
pub fn is_document_url(url: &str, markers: &[String]) -> bool {
    markers.iter().any(|m| url.contains(m.as_str()))
}

/// Pick the page to attach to when no page is selected yet.
#[must_use]
pub fn select_initial(candidates: &[PageCandidate], markers: &[String]) -> Selection {
    let is_doc = |c: &PageCandidate| is_document_url(c.url(), markers);

    let best = candidates
        .iter()
        .enumerate()
        .filter(|(_, c)| c.worker_count > 0)
        .fold(None::<(usize, &PageCandidate)>, |best, (i, c)| match best {
            None => Some((i, c)),
            Some((_, b))
                if c.worker_count > b.worker_count
                    || (c.worker_count == b.worker_count && is_doc(c) && !is_doc(b)) =>
            {
                Some((i, c))
            }
            keep => keep,
        });
    if let Some((i, _)) = best {
        return Selection::Existing(i);
    }

    candidates
        .iter()
        .position(is_doc)
        .or_else(|| (!candidates.is_empty()).then_some(0))
        .map_or(Selection::CreateBlank, Selection::Existing)
}

/// Decide whether monitoring should move away from the current page.
///
/// Returns the index of the page to switch to. Switches only when the current
/// page has no workers and another has some, or when an alternative exceeds
/// the current count by more than `margin`.
#[must_use]
pub fn should_switch(
    candidates: &[PageCandidate],
    margin: usize,
    markers: &[String],
) -> Option<usize> {
    let Some(current) = candidates.iter().position(|c| c.is_current) else {
        // The current page vanished from the listing.
        return match select_initial(candidates, markers) {
            Selection::Existing(i) => Some(i),
            Selection::CreateBlank => None,
        };
    };
    let current_count = candidates[current].worker_count;

    let (best, best_count) = candidates
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != current)
        .map(|(i, c)| (i, c.worker_count))
        .fold(None::<(usize, usize)>, |best, (i, n)| match best {
            Some((_, b)) if b >= n => best,
            _ => Some((i, n)),
        })?;

    let switch = (current_count == 0 && best_count >= 1)
        || best_count > current_count.saturating_add(margin);
    switch.then_some(best)
}

/// Enumerate page candidates and probe their worker counts.
///
/// Inspector tabs and non-page targets are excluded. A probe failure counts
/// as zero workers rather than failing the pass. The page already attached
/// as `current` reports the workers it tracks and is not probed again.
///
/// # Errors
/// Returns error if the listing endpoint cannot be reached.
pub async fn discover<B: DebugBrowser + ?Sized>(
    browser: &B,
    current: Option<&dyn DebugPage>,
) -> Result<Vec<PageCandidate>, BridgeError> {
    let current_target = current.map(|page| page.target().id.as_str());
    let targets: Vec<TargetInfo> = browser
        .list_targets()
        .await?
        .into_iter()
        .filter(|t| t.is_page() && !t.is_inspector())
        .collect();

    let counts = join_all(targets.iter().map(|t| async move {
        match current {
            Some(page) if page.target().id == t.id => Ok(page.workers().len()),
            _ => browser.count_workers(t).await,
        }
    }))
    .await;

    let candidates: Vec<PageCandidate> = targets
        .into_iter()
        .zip(counts)
        .map(|(target, count)| {
            let worker_count = count.unwrap_or_else(|e| {
                tracing::warn!(target_id = %target.id, "Worker probe failed: {e}");
                0
            });
            let is_current = current_target == Some(target.id.as_str());
            PageCandidate {
                target,
                worker_count,
                is_current,
            }
        })
        .collect();

    tracing::debug!(
        candidates = ?candidates
            .iter()
            .map(|c| (c.url(), c.worker_count))
            .collect::<Vec<_>>(),
        "Discovery pass"
    );
    Ok(candidates)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockBrowser, page_target};

    fn markers() -> Vec<String> {
        vec!["/design/".into(), "/file/".into()]
    }

    fn candidates(spec: &[(&str, usize)], current: Option<usize>) -> Vec<PageCandidate> {
        spec.iter()
            .enumerate()
            .map(|(i, (url, n))| PageCandidate {
                target: page_target(&format!("P{i}"), url),
                worker_count: *n,
                is_current: current == Some(i),
            })
            .collect()
    }

    #[test]
    fn test_zero_worker_current_switches_to_highest() {
        let c = candidates(
            &[
                ("https://app/design/a", 0),
                ("https://app/design/b", 3),
                ("https://app/design/c", 4),
            ],
            Some(0),
        );
        assert_eq!(should_switch(&c, 1, &markers()), Some(2));
    }

    #[test]
    fn test_hysteresis_margin() {
        let within = candidates(&[("https://app/design/a", 4), ("https://app/design/b", 5)], Some(0));
        assert_eq!(should_switch(&within, 1, &markers()), None);

        let beyond = candidates(&[("https://app/design/a", 4), ("https://app/design/b", 6)], Some(0));
        assert_eq!(should_switch(&beyond, 1, &markers()), Some(1));
    }

    #[test]
    fn test_no_switch_when_current_is_best() {
        let c = candidates(&[("https://app/design/a", 3), ("https://app/", 0)], Some(0));
        assert_eq!(should_switch(&c, 1, &markers()), None);
    }

    #[test]
    fn test_no_switch_when_nobody_has_workers() {
        let c = candidates(&[("https://app/design/a", 0), ("https://app/design/b", 0)], Some(0));
        assert_eq!(should_switch(&c, 1, &markers()), None);
    }

    #[test]
    fn test_vanished_current_falls_back_to_initial_selection() {
        let c = candidates(&[("https://app/", 0), ("https://app/design/b", 2)], None);
        assert_eq!(should_switch(&c, 1, &markers()), Some(1));
    }

    #[test]
    fn test_initial_prefers_worker_count() {
        let c = candidates(&[("https://app/design/a", 1), ("https://app/", 2)], None);
        assert_eq!(select_initial(&c, &markers()), Selection::Existing(1));
    }

    #[test]
    fn test_initial_tie_breaks_toward_document() {
        let c = candidates(&[("https://app/", 2), ("https://app/file/x", 2)], None);
        assert_eq!(select_initial(&c, &markers()), Selection::Existing(1));
    }

    #[test]
    fn test_initial_without_workers() {
        let c = candidates(&[("https://app/", 0), ("https://app/design/x", 0)], None);
        assert_eq!(select_initial(&c, &markers()), Selection::Existing(1));

        let c = candidates(&[("https://app/", 0), ("https://app/recent", 0)], None);
        assert_eq!(select_initial(&c, &markers()), Selection::Existing(0));

        assert_eq!(select_initial(&[], &markers()), Selection::CreateBlank);
    }

    #[tokio::test]
    async fn test_discover_filters_inspectors_and_marks_current() {
        let browser = MockBrowser::new();
        browser.add_page("P1", "https://app/design/a", 2);
        browser.add_page("DT", "devtools://devtools/inspector.html", 0);
        let mut worker = page_target("SW", "https://app/sw.js");
        worker.target_type = "service_worker".into();
        browser.add_target(worker);

        let current = browser
            .attach(&page_target("P1", "https://app/design/a"))
            .await
            .unwrap();
        let found = discover(browser.as_ref(), Some(current.as_ref())).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].worker_count, 2);
        assert!(found[0].is_current);
    }

    #[tokio::test]
    async fn test_current_page_reports_tracked_workers_without_probe() {
        let browser = MockBrowser::new();
        browser.add_page("P1", "https://app/design/a", 1);
        browser.add_page("P2", "https://app/design/b", 2);
        browser
            .attach(&page_target("P1", "https://app/design/a"))
            .await
            .unwrap();
        let current = browser.last_page();
        current.set_workers(3);

        let found = discover(browser.as_ref(), Some(current.as_ref() as &dyn DebugPage))
            .await
            .unwrap();
        assert_eq!(found[0].worker_count, 3);
        assert!(found[0].is_current);
        assert_eq!(found[1].worker_count, 2);
        assert_eq!(browser.probed(), ["P2"]);
    }

    #[test]
    fn test_discover_surfaces_unreachable_endpoint() {
        let browser = MockBrowser::new();
        browser.set_unreachable(true);
        let err = tokio_test::block_on(discover(browser.as_ref(), None)).unwrap_err();
        assert!(matches!(err, BridgeError::Connection(_)));
    }
}
