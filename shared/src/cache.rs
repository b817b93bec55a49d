//! In-memory read-model cache patched by optimistic updates.
//!
//! A query holds either a flat list or a list of pages. Patches are
//! structural: append to the first page, replace in place, or remove. Nothing
//! here ever re-sorts a collection.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use crate::listeners::{Listeners, Subscription};

/// Anything that can live in a [`QueryCache`].
pub trait CacheItem: Clone + Send + Sync + 'static {
    /// Temp id while optimistic, server id once confirmed.
    fn item_id(&self) -> &str;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Sending,
    Sent,
    Error,
}

#[derive(Clone, Debug, PartialEq)]
pub struct CachedItem<T> {
    pub item: T,
    pub optimistic: bool,
    pub status: SyncStatus,
    pub last_error: Option<String>,
}

impl<T: CacheItem> CachedItem<T> {
    /// Item as delivered by the server.
    pub fn confirmed(item: T) -> Self {
        Self {
            item,
            optimistic: false,
            status: SyncStatus::Sent,
            last_error: None,
        }
    }

    pub fn optimistic(item: T) -> Self {
        Self {
            item,
            optimistic: true,
            status: SyncStatus::Sending,
            last_error: None,
        }
    }

    pub fn id(&self) -> &str {
        self.item.item_id()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum QueryData<T> {
    Flat(Vec<CachedItem<T>>),
    Paged(Vec<Vec<CachedItem<T>>>),
}

impl<T: CacheItem> QueryData<T> {
    pub fn flat(items: impl IntoIterator<Item = T>) -> Self {
        QueryData::Flat(items.into_iter().map(CachedItem::confirmed).collect())
    }

    pub fn paged<P>(pages: impl IntoIterator<Item = P>) -> Self
    where
        P: IntoIterator<Item = T>,
    {
        QueryData::Paged(
            pages
                .into_iter()
                .map(|page| page.into_iter().map(CachedItem::confirmed).collect())
                .collect(),
        )
    }

    pub fn len(&self) -> usize {
        match self {
            QueryData::Flat(items) => items.len(),
            QueryData::Paged(pages) => pages.iter().map(Vec::len).sum(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> Box<dyn Iterator<Item = &CachedItem<T>> + '_> {
        match self {
            QueryData::Flat(items) => Box::new(items.iter()),
            QueryData::Paged(pages) => Box::new(pages.iter().flatten()),
        }
    }

    pub fn iter_mut(&mut self) -> Box<dyn Iterator<Item = &mut CachedItem<T>> + '_> {
        match self {
            QueryData::Flat(items) => Box::new(items.iter_mut()),
            QueryData::Paged(pages) => Box::new(pages.iter_mut().flatten()),
        }
    }

    pub fn find(&self, id: &str) -> Option<&CachedItem<T>> {
        self.iter().find(|entry| entry.id() == id)
    }

    pub fn find_mut(&mut self, id: &str) -> Option<&mut CachedItem<T>> {
        self.iter_mut().find(|entry| entry.id() == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.find(id).is_some()
    }

    /// Appends to the end of the first page (or the flat list).
    pub fn append(&mut self, entry: CachedItem<T>) {
        match self {
            QueryData::Flat(items) => items.push(entry),
            QueryData::Paged(pages) => match pages.first_mut() {
                Some(first) => first.push(entry),
                None => pages.push(vec![entry]),
            },
        }
    }

    /// Replaces the first entry whose id is in `ids` with `entry` and drops
    /// any other entry matching `ids`. Returns false when nothing matched.
    pub fn replace_any(&mut self, ids: &[&str], entry: CachedItem<T>) -> bool {
        let mut replacement = Some(entry);
        let mut patch = |items: &mut Vec<CachedItem<T>>| {
            items.retain_mut(|existing| {
                if !ids.contains(&existing.id()) {
                    return true;
                }
                match replacement.take() {
                    Some(new) => {
                        *existing = new;
                        true
                    }
                    None => false,
                }
            });
        };
        match self {
            QueryData::Flat(items) => patch(items),
            QueryData::Paged(pages) => pages.iter_mut().for_each(patch),
        }
        replacement.is_none()
    }

    /// Removes every entry with `id`, returning the first.
    pub fn remove(&mut self, id: &str) -> Option<CachedItem<T>> {
        let mut removed = None;
        let mut prune = |items: &mut Vec<CachedItem<T>>| {
            items.retain(|existing| {
                if existing.id() != id {
                    return true;
                }
                if removed.is_none() {
                    removed = Some(existing.clone());
                }
                false
            });
        };
        match self {
            QueryData::Flat(items) => prune(items),
            QueryData::Paged(pages) => pages.iter_mut().for_each(prune),
        }
        removed
    }
}

/// Emitted after a query changes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheEvent {
    pub query: String,
}

/// Named queries shared by the reconciler and the views reading them.
pub struct QueryCache<T> {
    queries: Mutex<HashMap<String, QueryData<T>>>,
    listeners: Listeners<CacheEvent>,
}

impl<T: CacheItem> QueryCache<T> {
    pub fn new() -> Self {
        Self {
            queries: Mutex::new(HashMap::new()),
            listeners: Listeners::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, QueryData<T>>> {
        self.queries.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn notify(&self, query: &str) {
        self.listeners.emit(&CacheEvent {
            query: query.to_string(),
        });
    }

    /// Stores a fresh server result, replacing whatever the query held.
    pub fn set(&self, query: &str, data: QueryData<T>) {
        self.lock().insert(query.to_string(), data);
        self.notify(query);
    }

    pub fn get(&self, query: &str) -> Option<QueryData<T>> {
        self.lock().get(query).cloned()
    }

    /// All entries of `query` in display order.
    pub fn items(&self, query: &str) -> Vec<CachedItem<T>> {
        self.lock()
            .get(query)
            .map(|data| data.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn find(&self, query: &str, id: &str) -> Option<CachedItem<T>> {
        self.lock().get(query).and_then(|data| data.find(id).cloned())
    }

    pub fn invalidate(&self, query: &str) -> bool {
        let removed = self.lock().remove(query).is_some();
        if removed {
            self.notify(query);
        }
        removed
    }

    /// Runs `patch` on an existing query. Listeners fire only when the query
    /// exists.
    pub fn update<R>(&self, query: &str, patch: impl FnOnce(&mut QueryData<T>) -> R) -> Option<R> {
        let result = {
            let mut queries = self.lock();
            queries.get_mut(query).map(patch)
        };
        if result.is_some() {
            self.notify(query);
        }
        result
    }

    /// Like [`update`](Self::update), creating an empty flat query first if
    /// needed.
    pub fn upsert<R>(&self, query: &str, patch: impl FnOnce(&mut QueryData<T>) -> R) -> R {
        let result = {
            let mut queries = self.lock();
            let data = queries
                .entry(query.to_string())
                .or_insert_with(|| QueryData::Flat(Vec::new()));
            patch(data)
        };
        self.notify(query);
        result
    }

    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&CacheEvent) + Send + Sync + 'static,
    {
        self.listeners.subscribe(listener)
    }
}

impl<T: CacheItem> Default for QueryCache<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for QueryCache<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryCache").finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Clone, Debug, PartialEq)]
    pub(crate) struct Note {
        pub id: String,
        pub body: String,
    }

    impl Note {
        pub(crate) fn new(id: &str, body: &str) -> Self {
            Self {
                id: id.to_string(),
                body: body.to_string(),
            }
        }
    }

    impl CacheItem for Note {
        fn item_id(&self) -> &str {
            &self.id
        }
    }

    fn ids(data: &QueryData<Note>) -> Vec<String> {
        data.iter().map(|e| e.id().to_string()).collect()
    }

    #[test]
    fn append_targets_first_page() {
        let mut data = QueryData::paged(vec![
            vec![Note::new("a", ""), Note::new("b", "")],
            vec![Note::new("c", "")],
        ]);
        data.append(CachedItem::optimistic(Note::new("tmp-1", "")));
        match &data {
            QueryData::Paged(pages) => {
                assert_eq!(pages[0].len(), 3);
                assert_eq!(pages[0][2].id(), "tmp-1");
                assert_eq!(pages[1].len(), 1);
            }
            QueryData::Flat(_) => panic!("expected pages"),
        }

        let mut empty: QueryData<Note> = QueryData::Paged(Vec::new());
        empty.append(CachedItem::optimistic(Note::new("tmp-2", "")));
        assert_eq!(ids(&empty), vec!["tmp-2"]);
    }

    #[test]
    fn replace_any_keeps_position_and_dedupes() {
        let mut data = QueryData::flat(vec![
            Note::new("a", ""),
            Note::new("tmp-1", "draft"),
            Note::new("b", ""),
            Note::new("srv-1", "pushed early"),
        ]);
        let replaced = data.replace_any(
            &["tmp-1", "srv-1"],
            CachedItem::confirmed(Note::new("srv-1", "final")),
        );
        assert!(replaced);
        assert_eq!(ids(&data), vec!["a", "srv-1", "b"]);
        assert_eq!(data.find("srv-1").unwrap().item.body, "final");
    }

    #[test]
    fn replace_any_without_match_inserts_nothing() {
        let mut data = QueryData::flat(vec![Note::new("a", "")]);
        assert!(!data.replace_any(&["zzz"], CachedItem::confirmed(Note::new("zzz", ""))));
        assert_eq!(ids(&data), vec!["a"]);
    }

    #[test]
    fn remove_across_pages() {
        let mut data = QueryData::paged(vec![vec![Note::new("a", "")], vec![Note::new("b", "")]]);
        assert_eq!(data.remove("b").unwrap().id(), "b");
        assert!(data.remove("b").is_none());
        assert_eq!(data.len(), 1);
    }

    #[test]
    fn update_notifies_only_existing_queries() {
        let cache = QueryCache::<Note>::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        let _sub = cache.subscribe(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });

        assert!(cache.update("notes", |d| d.len()).is_none());
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        cache.set("notes", QueryData::flat(vec![Note::new("a", "")]));
        assert_eq!(cache.update("notes", |d| d.len()), Some(1));
        assert_eq!(hits.load(Ordering::SeqCst), 2);

        cache.upsert("other", |d| d.append(CachedItem::confirmed(Note::new("x", ""))));
        assert_eq!(cache.items("other").len(), 1);
    }
}
