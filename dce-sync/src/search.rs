//! Driver search with a debounced, cancellable worker
//!
//! Each submitted query cancels the previous pending one. Results are only
//! published once the debounce interval passes without a newer query.

use dce_common::models::DriverRecord;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Indices into the searched driver list that match `query`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchResults {
    pub query: String,
    pub indices: Vec<usize>,
}

/// Case-insensitive match on name, first name and CP number
///
/// A blank query matches every driver.
pub fn filter_drivers(drivers: &[DriverRecord], query: &str) -> Vec<usize> {
    let needle = query.trim().to_lowercase();
    drivers
        .iter()
        .enumerate()
        .filter(|(_, driver)| needle.is_empty() || matches_driver(driver, &needle))
        .map(|(index, _)| index)
        .collect()
}

fn matches_driver(driver: &DriverRecord, needle: &str) -> bool {
    let fields = [
        Some(driver.name.as_str()),
        driver.first_name.as_deref(),
        driver.cp_number.as_deref(),
    ];
    fields
        .into_iter()
        .flatten()
        .any(|field| field.to_lowercase().contains(needle))
}

pub struct SearchDebouncer {
    debounce: Duration,
    pending: Option<CancellationToken>,
    results: Arc<watch::Sender<SearchResults>>,
}

impl SearchDebouncer {
    pub fn new(debounce: Duration) -> (Self, watch::Receiver<SearchResults>) {
        let (tx, rx) = watch::channel(SearchResults::default());
        let debouncer = Self {
            debounce,
            pending: None,
            results: Arc::new(tx),
        };
        (debouncer, rx)
    }

    pub fn subscribe(&self) -> watch::Receiver<SearchResults> {
        self.results.subscribe()
    }

    /// Schedule a search over `drivers`, cancelling any pending one
    ///
    /// The returned task resolves to whether it published results.
    pub fn submit(&mut self, query: impl Into<String>, drivers: Arc<[DriverRecord]>) -> JoinHandle<bool> {
        self.cancel();

        let token = CancellationToken::new();
        self.pending = Some(token.clone());

        let query = query.into();
        let debounce = self.debounce;
        let results = Arc::clone(&self.results);

        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!(query = %query, "Search superseded");
                    false
                }
                _ = tokio::time::sleep(debounce) => {
                    let indices = filter_drivers(&drivers, &query);
                    debug!(query = %query, matches = indices.len(), "Search published");
                    results.send_replace(SearchResults { query, indices });
                    true
                }
            }
        })
    }

    /// Cancel the pending search, if any
    pub fn cancel(&mut self) {
        if let Some(token) = self.pending.take() {
            token.cancel();
        }
    }
}

impl Drop for SearchDebouncer {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drivers() -> Arc<[DriverRecord]> {
        let mut claire = DriverRecord::new("Durand");
        claire.first_name = Some("Claire".to_string());
        let mut paul = DriverRecord::new("Martin");
        paul.cp_number = Some("CP-4521".to_string());
        vec![claire, paul, DriverRecord::new("Lefèvre")].into()
    }

    #[test]
    fn test_filter_is_case_insensitive_across_fields() {
        let drivers = drivers();
        assert_eq!(filter_drivers(&drivers, "claire"), vec![0]);
        assert_eq!(filter_drivers(&drivers, "cp-45"), vec![1]);
        assert_eq!(filter_drivers(&drivers, "LEFÈVRE"), vec![2]);
        assert_eq!(filter_drivers(&drivers, "  "), vec![0, 1, 2]);
        assert!(filter_drivers(&drivers, "zz").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_newer_query_cancels_pending() {
        let (mut debouncer, rx) = SearchDebouncer::new(Duration::from_millis(300));

        let first = debouncer.submit("dur", drivers());
        tokio::time::advance(Duration::from_millis(100)).await;
        let second = debouncer.submit("martin", drivers());

        assert!(!first.await.unwrap());
        assert!(second.await.unwrap());

        let published = rx.borrow().clone();
        assert_eq!(published.query, "martin");
        assert_eq!(published.indices, vec![1]);
    }
}
