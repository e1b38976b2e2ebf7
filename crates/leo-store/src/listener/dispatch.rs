//! Per-batch dispatch: parse, partition on the reindex flag, route, dedup,
//! invoke, acknowledge.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::debug;

use super::{Indexer, IndexerRegistry, Route};
use crate::events::StoreDataDetails;
use crate::queue::LeasedMessage;
use crate::{Error, Result};

/// Handle one batch of messages sharing a logical key.
///
/// Messages are acknowledged only after every partition of the batch has
/// been indexed; any failure leaves the whole batch unacknowledged so the
/// queue redelivers it. Leases are released by drop in every path.
pub(crate) async fn dispatch_batch(
    registry: &IndexerRegistry,
    messages: Vec<Box<dyn LeasedMessage>>,
) -> Result<()> {
    let mut parsed = Vec::with_capacity(messages.len());
    for message in &messages {
        let details = StoreDataDetails::from_json(message.body())
            .map_err(|err| Error::Dispatch(format!("unparseable message body: {err}")))?;
        parsed.push(details);
    }

    // Group by (route, reindex partition), preserving arrival order within
    // each group. The reindex flag is stripped from the copies handed
    // downstream so it cannot propagate through re-emitted writes.
    let mut order: HashMap<(Route, bool), usize> = HashMap::new();
    let mut groups: Vec<(Route, bool, Arc<dyn Indexer>, Vec<StoreDataDetails>)> = Vec::new();
    for mut details in parsed {
        let is_reindex = details.metadata.reindex();
        if is_reindex {
            details.metadata.clear_reindex();
        }
        let (route, indexer) = registry.resolve(&details)?;
        match order.get(&(route.clone(), is_reindex)) {
            Some(&slot) => groups[slot].3.push(details),
            None => {
                order.insert((route.clone(), is_reindex), groups.len());
                groups.push((route, is_reindex, indexer, vec![details]));
            }
        }
    }

    for (route, is_reindex, indexer, items) in groups {
        let items = deduplicate(&route, items);
        debug!(
            "dispatching {} item(s) via {route:?} (reindex: {is_reindex})",
            items.len()
        );
        if is_reindex {
            indexer.reindex(items).await?;
        } else {
            indexer.index(items).await?;
        }
    }

    for message in &messages {
        message.complete().await?;
    }
    Ok(())
}

/// Type batches collapse by id (first wins; events without an id all pass),
/// path batches collapse by base path.
fn deduplicate(route: &Route, items: Vec<StoreDataDetails>) -> Vec<StoreDataDetails> {
    match route {
        Route::Type(_) => {
            let mut seen = HashSet::new();
            items
                .into_iter()
                .filter(|details| match details.id {
                    Some(id) => seen.insert(id),
                    None => true,
                })
                .collect()
        }
        Route::Path(_) => {
            let mut seen = HashSet::new();
            items
                .into_iter()
                .filter(|details| seen.insert(details.base_path.clone()))
                .collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::Metadata;

    fn item(base_path: &str, id: Option<i64>) -> StoreDataDetails {
        StoreDataDetails {
            container: "c".to_string(),
            base_path: base_path.to_string(),
            id,
            metadata: Metadata::new(),
        }
    }

    #[test]
    fn type_batches_collapse_by_id_keeping_the_first() {
        let route = Route::Type("Order".to_string());
        let deduped = deduplicate(
            &route,
            vec![
                item("orders/1.json", Some(1)),
                item("orders/1-updated.json", Some(1)),
                item("orders/2.json", Some(2)),
                item("orders/3.json", None),
                item("orders/4.json", None),
            ],
        );
        let paths: Vec<&str> = deduped.iter().map(|d| d.base_path.as_str()).collect();
        assert_eq!(
            paths,
            vec![
                "orders/1.json",
                "orders/2.json",
                "orders/3.json",
                "orders/4.json"
            ]
        );
    }

    #[test]
    fn path_batches_collapse_by_base_path() {
        let route = Route::Path("orders/".to_string());
        let deduped = deduplicate(
            &route,
            vec![
                item("orders/1.json", Some(1)),
                item("orders/1.json", Some(2)),
                item("orders/2.json", None),
            ],
        );
        assert_eq!(deduped.len(), 2);
    }
}
