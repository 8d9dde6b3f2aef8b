//! Sliding-window paginated loader.
//!
//! One generic engine serves message history and every media overview. A
//! window is the locally known, ordered slice of a server-side collection
//! plus its total count, the single outstanding page fetch, and the set of
//! items whose full payload is currently resident.
//!
//! Items are kept ascending: index 0 is the oldest known item. `Backward`
//! pages prepend older items and `Forward` pages append newer ones.

use crate::config::LoaderConfig;
use crate::error::{SyncError, SyncResult};
use chatsync_protocol::{MsgId, RequestToken};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Debug;
use std::hash::Hash;
use tracing::{debug, warn};

/// An item that can live in a window.
pub trait WindowItem: Copy + Ord + Hash + Debug {
    /// Returns true for items the server does not know about yet.
    fn is_provisional(&self) -> bool;
}

impl WindowItem for MsgId {
    fn is_provisional(&self) -> bool {
        MsgId::is_provisional(*self)
    }
}

/// Paging direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Towards older items.
    Backward,
    /// Towards newer items.
    Forward,
}

/// What is known about the size of the server-side collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TotalCount {
    /// Not fetched yet.
    Unknown,
    /// The server reported this many items.
    Known(u32),
    /// Every item is in the window.
    AllLoaded,
}

impl TotalCount {
    /// Integer view: `-1` unknown, `0` fully loaded, otherwise the count.
    pub fn raw(&self) -> i64 {
        match self {
            TotalCount::Unknown => -1,
            TotalCount::Known(count) => i64::from(*count),
            TotalCount::AllLoaded => 0,
        }
    }

    fn known(&self) -> u32 {
        match self {
            TotalCount::Known(count) => *count,
            _ => 0,
        }
    }
}

/// Where a requested page starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Anchor<I> {
    /// The newest items, newest first.
    Newest,
    /// The oldest items, oldest first.
    Oldest,
    /// Items strictly older than the given one.
    Before(I),
    /// Items strictly newer than the given one.
    After(I),
}

/// A page fetch the caller must perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadRequest<I> {
    /// Token the completion must carry.
    pub token: RequestToken,
    /// Paging direction; `None` for a count probe.
    pub direction: Option<Direction>,
    /// Page start.
    pub anchor: Anchor<I>,
    /// Page size; zero for a count probe.
    pub limit: u32,
}

impl<I> LoadRequest<I> {
    /// Returns true if only the total count is requested.
    pub fn is_probe(&self) -> bool {
        self.direction.is_none()
    }
}

/// Size information returned with a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageTotal {
    /// The page holds the whole collection.
    Exact,
    /// The collection has this many items in total.
    Count(u32),
}

/// A completed page fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedPage<I> {
    /// Items in server order.
    pub items: Vec<I>,
    /// Size information.
    pub total: PageTotal,
}

/// Items whose full payload should be loaded or may be dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Residency<I> {
    /// Newly resident items.
    pub wanted: Vec<I>,
    /// Items released back to their lightweight form.
    pub released: Vec<I>,
}

impl<I> Residency<I> {
    /// Returns true if nothing changed.
    pub fn is_empty(&self) -> bool {
        self.wanted.is_empty() && self.released.is_empty()
    }
}

impl<I> Default for Residency<I> {
    fn default() -> Self {
        Self {
            wanted: Vec::new(),
            released: Vec::new(),
        }
    }
}

/// Effect of a viewport change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewportChange<I> {
    /// Payload residency changes.
    pub residency: Residency<I>,
    /// Direction that should be paged in, if the focus is near an edge.
    pub load: Option<Direction>,
}

#[derive(Debug, Clone, Copy)]
struct InFlight<I> {
    token: RequestToken,
    direction: Option<Direction>,
    anchor: Anchor<I>,
    limit: u32,
}

/// State of one window.
#[derive(Debug, Clone)]
pub struct Window<I> {
    items: Vec<I>,
    total: TotalCount,
    in_flight: Option<InFlight<I>>,
    oldest_reached: bool,
    newest_reached: bool,
    resident: BTreeSet<I>,
}

impl<I: WindowItem> Window<I> {
    fn new() -> Self {
        Self {
            items: Vec::new(),
            total: TotalCount::Unknown,
            in_flight: None,
            oldest_reached: false,
            newest_reached: false,
            resident: BTreeSet::new(),
        }
    }

    /// Items in ascending order.
    pub fn items(&self) -> &[I] {
        &self.items
    }

    /// Number of items.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Returns true if the window holds no items.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Total count.
    pub fn total(&self) -> TotalCount {
        self.total
    }

    /// Integer view of the total count.
    pub fn total_raw(&self) -> i64 {
        self.total.raw()
    }

    /// Returns true while a page fetch or count probe is outstanding.
    pub fn is_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Returns true once every item is known to be in the window.
    pub fn is_fully_loaded(&self) -> bool {
        self.total == TotalCount::AllLoaded
    }

    /// Returns true if nothing remains to be paged in `direction`.
    pub fn is_exhausted(&self, direction: Direction) -> bool {
        match direction {
            Direction::Backward => self.oldest_reached,
            Direction::Forward => self.newest_reached,
        }
    }

    /// Returns true if the window reaches the newest end of the collection.
    pub fn reaches_newest(&self) -> bool {
        self.newest_reached
    }

    /// Position of an item.
    pub fn position(&self, item: I) -> Option<usize> {
        self.items.binary_search(&item).ok()
    }

    /// Returns true if the item is in the window.
    pub fn contains(&self, item: I) -> bool {
        self.position(item).is_some()
    }

    /// Items whose full payload is resident.
    pub fn resident(&self) -> &BTreeSet<I> {
        &self.resident
    }

    /// Number of items the server already knows about.
    pub fn server_len(&self) -> usize {
        self.items.len() - self.provisional_len()
    }

    /// Number of optimistic items not yet known to the server.
    pub fn provisional_len(&self) -> usize {
        self.items.iter().filter(|item| item.is_provisional()).count()
    }

    fn oldest_server(&self) -> Option<I> {
        self.items.iter().find(|item| !item.is_provisional()).copied()
    }

    fn newest_server(&self) -> Option<I> {
        self.items
            .iter()
            .rev()
            .find(|item| !item.is_provisional())
            .copied()
    }

    /// Merges items, keeping the window sorted and free of duplicates.
    /// Returns the number of new items.
    fn merge(&mut self, items: impl IntoIterator<Item = I>) -> usize {
        let before = self.items.len();
        self.items.extend(items);
        self.items.sort_unstable();
        self.items.dedup();
        self.items.len() - before
    }

    fn exhaust(&mut self, direction: Direction) {
        match direction {
            Direction::Backward => self.oldest_reached = true,
            Direction::Forward => self.newest_reached = true,
        }
    }
}

/// Paginated loader over many keyed windows.
#[derive(Debug, Clone)]
pub struct SlidingWindowLoader<K, I> {
    config: LoaderConfig,
    windows: BTreeMap<K, Window<I>>,
}

impl<K, I> SlidingWindowLoader<K, I>
where
    K: Ord + Clone + Debug,
    I: WindowItem,
{
    /// Creates a loader with no windows.
    pub fn new(config: LoaderConfig) -> Self {
        Self {
            config,
            windows: BTreeMap::new(),
        }
    }

    /// Loader configuration.
    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    /// Looks up a window.
    pub fn window(&self, key: &K) -> Option<&Window<I>> {
        self.windows.get(key)
    }

    /// Iterates all windows in key order.
    pub fn windows(&self) -> impl Iterator<Item = (&K, &Window<I>)> {
        self.windows.iter()
    }

    /// Requests the next page in `direction`.
    ///
    /// Returns `None` while a fetch is outstanding for the key, once the
    /// window is fully loaded, or when the direction is exhausted.
    pub fn load_more(
        &mut self,
        key: &K,
        direction: Direction,
        many: bool,
        token: RequestToken,
    ) -> Option<LoadRequest<I>> {
        let config = self.config;
        let window = self.windows.entry(key.clone()).or_insert_with(Window::new);

        if window.in_flight.is_some() {
            debug!(?key, "load already in flight");
            return None;
        }
        if window.is_fully_loaded() || window.is_exhausted(direction) {
            return None;
        }

        let anchor = match direction {
            Direction::Backward => window.oldest_server().map_or(Anchor::Newest, Anchor::Before),
            Direction::Forward => window.newest_server().map_or(Anchor::Oldest, Anchor::After),
        };
        let request = LoadRequest {
            token,
            direction: Some(direction),
            anchor,
            limit: config.page_size(window.len(), many),
        };
        window.in_flight = Some(InFlight {
            token,
            direction: request.direction,
            anchor,
            limit: request.limit,
        });
        Some(request)
    }

    /// Requests only the total count of a collection whose size is unknown.
    pub fn probe_count(&mut self, key: &K, token: RequestToken) -> Option<LoadRequest<I>> {
        let window = self.windows.entry(key.clone()).or_insert_with(Window::new);
        if window.in_flight.is_some() || window.total != TotalCount::Unknown {
            return None;
        }
        window.in_flight = Some(InFlight {
            token,
            direction: None,
            anchor: Anchor::Newest,
            limit: 0,
        });
        Some(LoadRequest {
            token,
            direction: None,
            anchor: Anchor::Newest,
            limit: 0,
        })
    }

    /// Applies a completed fetch. Returns the number of new items.
    pub fn on_fetched(
        &mut self,
        key: &K,
        token: RequestToken,
        page: FetchedPage<I>,
    ) -> SyncResult<usize> {
        let window = self
            .windows
            .get_mut(key)
            .ok_or_else(|| SyncError::UnknownWindow(format!("{key:?}")))?;
        let flight = match window.in_flight {
            Some(flight) if flight.token == token => flight,
            _ => return Err(SyncError::StaleCompletion { token }),
        };
        window.in_flight = None;

        let Some(direction) = flight.direction else {
            let added = window.merge(page.items);
            window.total = match page.total {
                PageTotal::Exact => TotalCount::AllLoaded,
                PageTotal::Count(count) => TotalCount::Known(
                    window
                        .total
                        .known()
                        .max(count.saturating_add(window.provisional_len() as u32)),
                ),
            };
            return Ok(added);
        };

        match flight.anchor {
            Anchor::Newest => window.newest_reached = true,
            Anchor::Oldest => window.oldest_reached = true,
            _ => {}
        }

        let received = page.items.len();
        let added = window.merge(page.items);
        match page.total {
            PageTotal::Exact => {
                window.total = TotalCount::AllLoaded;
                window.oldest_reached = true;
                window.newest_reached = true;
            }
            PageTotal::Count(count) if received == 0 => {
                window.exhaust(direction);
                if window.server_len() >= count as usize {
                    window.total = TotalCount::AllLoaded;
                } else {
                    warn!(
                        ?key,
                        count,
                        known = window.server_len(),
                        "empty page does not cover the reported count"
                    );
                    if window.total == TotalCount::Unknown {
                        window.total = TotalCount::Known(
                            count.saturating_add(window.provisional_len() as u32),
                        );
                    }
                }
            }
            PageTotal::Count(count) => {
                let corrected = count.saturating_add(window.provisional_len() as u32);
                window.total = TotalCount::Known(window.total.known().max(corrected));
                if (received as u32) < flight.limit {
                    window.exhaust(direction);
                }
                if window.oldest_reached
                    && window.newest_reached
                    && window.server_len() >= count as usize
                {
                    window.total = TotalCount::AllLoaded;
                }
            }
        }
        Ok(added)
    }

    /// Releases the in-flight slot after a failed fetch so it can be retried.
    pub fn on_failed(&mut self, key: &K, token: RequestToken) -> bool {
        match self.windows.get_mut(key) {
            Some(window) if window.in_flight.map(|f| f.token) == Some(token) => {
                window.in_flight = None;
                true
            }
            _ => false,
        }
    }

    /// Adds a live item at the newest end of an existing window.
    ///
    /// Missing windows stay missing, and windows that have not reached the
    /// newest end are left alone; the item arrives with a later page.
    /// Returns true if the item was inserted.
    pub fn push_newest(&mut self, key: &K, item: I) -> bool {
        match self.windows.get_mut(key) {
            Some(window) if window.newest_reached => Self::insert_newest(window, item),
            _ => false,
        }
    }

    /// Like [`push_newest`](Self::push_newest), but creates the window
    /// anchored at the newest end when it does not exist yet.
    pub fn open_newest(&mut self, key: &K, item: I) -> bool {
        let window = self.windows.entry(key.clone()).or_insert_with(|| {
            let mut window = Window::new();
            window.newest_reached = true;
            window
        });
        if !window.newest_reached {
            return false;
        }
        Self::insert_newest(window, item)
    }

    fn insert_newest(window: &mut Window<I>, item: I) -> bool {
        let inserted = window.merge([item]) == 1;
        if inserted {
            if let TotalCount::Known(count) = window.total {
                window.total = TotalCount::Known(count.saturating_add(1));
            }
        }
        inserted
    }

    /// Removes items from every window. Returns the keys that changed.
    pub fn remove_items(&mut self, items: &[I]) -> Vec<K> {
        let doomed: BTreeSet<I> = items.iter().copied().collect();
        let mut changed = Vec::new();
        for (key, window) in &mut self.windows {
            let before = window.items.len();
            window.items.retain(|item| !doomed.contains(item));
            window.resident.retain(|item| !doomed.contains(item));
            if window.items.len() != before {
                changed.push(key.clone());
            }
        }
        changed
    }

    /// Replaces `old` with `new` in every window. Where `new` is already
    /// present, `old` is simply dropped. Returns the keys that changed.
    pub fn rename_item(&mut self, old: I, new: I) -> Vec<K> {
        let mut changed = Vec::new();
        for (key, window) in &mut self.windows {
            let Some(pos) = window.position(old) else {
                continue;
            };
            window.items.remove(pos);
            window.merge([new]);
            if window.resident.remove(&old) {
                window.resident.insert(new);
            }
            changed.push(key.clone());
        }
        changed
    }

    /// Makes the neighbourhood of `index` in the direction of travel
    /// resident, then enforces the resident bound.
    pub fn preload(&mut self, key: &K, index: usize, delta: i32) -> Residency<I> {
        let config = self.config;
        let mut change = Residency::default();
        let Some(window) = self.windows.get_mut(key) else {
            return change;
        };
        if window.items.is_empty() {
            return change;
        }

        let last = window.items.len() as i64 - 1;
        let focus = (index as i64).min(last);
        let step = i64::from(delta);
        let preload = i64::from(config.preload_count);
        let (mut from, mut to) = if step != 0 {
            (focus + step, focus + step * preload)
        } else {
            (focus - 1, focus + 1)
        };
        if from > to {
            std::mem::swap(&mut from, &mut to);
        }

        let neighbourhood = std::iter::once(focus).chain(from.max(0)..=to.min(last));
        for pos in neighbourhood {
            let item = window.items[pos as usize];
            if window.resident.insert(item) {
                change.wanted.push(item);
            }
        }

        while window.resident.len() > config.max_resident() {
            let farthest = window
                .resident
                .iter()
                .filter_map(|item| {
                    window
                        .position(*item)
                        .map(|pos| ((pos as i64 - focus).abs(), *item))
                })
                .max();
            let Some((_, item)) = farthest else {
                break;
            };
            window.resident.remove(&item);
            change.released.push(item);
        }
        change
    }

    /// Releases the single item at the trailing edge of the neighbourhood
    /// (`index - 2 * delta`).
    pub fn evict(&mut self, key: &K, index: usize, delta: i32) -> Option<I> {
        if delta == 0 {
            return None;
        }
        let window = self.windows.get_mut(key)?;
        let forget = index as i64 - 2 * i64::from(delta);
        if forget < 0 || forget >= window.items.len() as i64 {
            return None;
        }
        let item = window.items[forget as usize];
        window.resident.remove(&item).then_some(item)
    }

    /// Handles a move of the focus to `index` travelling by `delta`.
    pub fn viewport_changed(&mut self, key: &K, index: usize, delta: i32) -> ViewportChange<I> {
        let mut residency = self.preload(key, index, delta);
        if let Some(item) = self.evict(key, index, delta) {
            residency.released.push(item);
        }

        let threshold = self.config.edge_threshold as usize;
        let load = self.windows.get(key).and_then(|window| {
            let near_start = index <= threshold;
            let near_end = index + threshold + 1 >= window.items.len();
            let backward = near_start && !window.oldest_reached;
            let forward = near_end && !window.newest_reached;
            match delta.signum() {
                1 if forward => Some(Direction::Forward),
                -1 if backward => Some(Direction::Backward),
                0 if backward => Some(Direction::Backward),
                0 if forward => Some(Direction::Forward),
                _ => None,
            }
        });
        ViewportChange { residency, load }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Loader = SlidingWindowLoader<u8, MsgId>;

    const KEY: u8 = 1;

    fn new_loader() -> Loader {
        SlidingWindowLoader::new(LoaderConfig::default())
    }

    fn ids(range: std::ops::RangeInclusive<i64>) -> Vec<MsgId> {
        range.map(MsgId).collect()
    }

    fn slice(items: Vec<MsgId>, count: u32) -> FetchedPage<MsgId> {
        FetchedPage {
            items,
            total: PageTotal::Count(count),
        }
    }

    /// Fills a window with `range` through a completed backward page.
    fn filled(range: std::ops::RangeInclusive<i64>, count: u32) -> Loader {
        let mut loader = new_loader();
        let req = loader
            .load_more(&KEY, Direction::Backward, false, RequestToken(1))
            .unwrap();
        loader
            .on_fetched(&KEY, req.token, slice(ids(range), count))
            .unwrap();
        loader
    }

    #[test]
    fn first_page_offsets() {
        let mut loader = new_loader();
        let back = loader
            .load_more(&KEY, Direction::Backward, false, RequestToken(1))
            .unwrap();
        assert_eq!(back.anchor, Anchor::Newest);
        assert_eq!(back.limit, 20);

        let mut other = new_loader();
        let fwd = other
            .load_more(&KEY, Direction::Forward, false, RequestToken(1))
            .unwrap();
        assert_eq!(fwd.anchor, Anchor::Oldest);
    }

    #[test]
    fn at_most_one_fetch_in_flight() {
        let mut loader = new_loader();
        assert!(loader
            .load_more(&KEY, Direction::Backward, false, RequestToken(1))
            .is_some());
        assert!(loader
            .load_more(&KEY, Direction::Backward, false, RequestToken(2))
            .is_none());
        assert!(loader.probe_count(&KEY, RequestToken(3)).is_none());
        assert!(loader.window(&KEY).unwrap().is_in_flight());
    }

    #[test]
    fn stale_completion_is_rejected() {
        let mut loader = new_loader();
        loader.load_more(&KEY, Direction::Backward, false, RequestToken(1));
        let err = loader
            .on_fetched(&KEY, RequestToken(9), slice(ids(1..=3), 3))
            .unwrap_err();
        assert_eq!(err, SyncError::StaleCompletion { token: RequestToken(9) });
        assert!(loader.window(&KEY).unwrap().is_in_flight());

        let err = loader
            .on_fetched(&7, RequestToken(1), slice(vec![], 0))
            .unwrap_err();
        assert!(matches!(err, SyncError::UnknownWindow(_)));
    }

    #[test]
    fn twenty_of_fifty_seven_then_empty_page() {
        let mut loader = new_loader();
        let req = loader
            .load_more(&KEY, Direction::Forward, false, RequestToken(1))
            .unwrap();
        assert_eq!(req.limit, 20);
        loader
            .on_fetched(&KEY, req.token, slice(ids(1..=20), 57))
            .unwrap();
        let window = loader.window(&KEY).unwrap();
        assert_eq!(window.len(), 20);
        assert_eq!(window.total_raw(), 57);

        let req = loader
            .load_more(&KEY, Direction::Forward, false, RequestToken(2))
            .unwrap();
        assert_eq!(req.anchor, Anchor::After(MsgId(20)));
        loader
            .on_fetched(&KEY, req.token, slice(vec![], 57))
            .unwrap();

        let window = loader.window(&KEY).unwrap();
        assert_eq!(window.total_raw(), 57);
        assert!(!window.is_fully_loaded());
        assert!(loader
            .load_more(&KEY, Direction::Forward, false, RequestToken(3))
            .is_none());
    }

    #[test]
    fn empty_page_covering_count_completes() {
        let mut loader = filled(1..=20, 20);
        assert_eq!(loader.window(&KEY).unwrap().total_raw(), 20);
        let req = loader
            .load_more(&KEY, Direction::Backward, false, RequestToken(2))
            .unwrap();
        assert_eq!(req.anchor, Anchor::Before(MsgId(1)));
        loader
            .on_fetched(&KEY, req.token, slice(vec![], 20))
            .unwrap();
        assert_eq!(loader.window(&KEY).unwrap().total_raw(), 0);
    }

    #[test]
    fn complete_page_means_fully_loaded() {
        let mut loader = new_loader();
        let req = loader
            .load_more(&KEY, Direction::Backward, false, RequestToken(1))
            .unwrap();
        loader
            .on_fetched(
                &KEY,
                req.token,
                FetchedPage {
                    items: ids(1..=3),
                    total: PageTotal::Exact,
                },
            )
            .unwrap();
        let window = loader.window(&KEY).unwrap();
        assert!(window.is_fully_loaded());
        assert_eq!(window.total_raw(), 0);
        assert!(loader
            .load_more(&KEY, Direction::Backward, false, RequestToken(2))
            .is_none());
    }

    #[test]
    fn pages_are_deduplicated_and_sorted() {
        let mut loader = filled(21..=40, 100);
        let req = loader
            .load_more(&KEY, Direction::Backward, false, RequestToken(2))
            .unwrap();
        loader
            .on_fetched(&KEY, req.token, slice(vec![MsgId(22), MsgId(19), MsgId(5)], 100))
            .unwrap();
        let window = loader.window(&KEY).unwrap();
        let expected: Vec<MsgId> = [5, 19].into_iter().chain(21..=40).map(MsgId).collect();
        assert_eq!(window.items(), expected.as_slice());
    }

    #[test]
    fn page_size_tiers() {
        let mut loader = filled(1..=21, 100);
        let req = loader
            .load_more(&KEY, Direction::Backward, false, RequestToken(2))
            .unwrap();
        assert_eq!(req.limit, 50);
    }

    #[test]
    fn count_probe_resolves_total_with_provisional_items() {
        let mut loader = new_loader();
        assert!(loader.open_newest(&KEY, MsgId::provisional(0)));
        let req = loader.probe_count(&KEY, RequestToken(1)).unwrap();
        assert!(req.is_probe());
        assert_eq!(req.limit, 0);
        loader
            .on_fetched(&KEY, req.token, slice(vec![], 7))
            .unwrap();

        let window = loader.window(&KEY).unwrap();
        assert_eq!(window.total_raw(), 8);
        assert_eq!(window.len(), 1);
        assert!(loader.probe_count(&KEY, RequestToken(2)).is_none());
    }

    #[test]
    fn push_newest_only_at_newest_edge() {
        let mut loader = new_loader();
        let req = loader
            .load_more(&KEY, Direction::Forward, false, RequestToken(1))
            .unwrap();
        loader
            .on_fetched(&KEY, req.token, slice(ids(1..=20), 57))
            .unwrap();
        assert!(!loader.push_newest(&KEY, MsgId(100)));

        let mut loader = filled(1..=20, 30);
        assert!(loader.push_newest(&KEY, MsgId(21)));
        assert!(!loader.push_newest(&KEY, MsgId(21)));
        assert_eq!(loader.window(&KEY).unwrap().total_raw(), 31);
    }

    #[test]
    fn push_newest_never_creates_a_window() {
        let mut loader = new_loader();
        assert!(!loader.push_newest(&KEY, MsgId(1)));
        assert!(loader.window(&KEY).is_none());

        let req = loader
            .load_more(&KEY, Direction::Forward, false, RequestToken(1))
            .unwrap();
        assert_eq!(req.anchor, Anchor::Oldest);
    }

    #[test]
    fn open_newest_creates_a_window_at_the_newest_end() {
        let mut loader = new_loader();
        let local = MsgId::provisional(3);
        assert!(loader.open_newest(&KEY, local));
        let window = loader.window(&KEY).unwrap();
        assert!(window.reaches_newest());
        assert_eq!(window.total_raw(), -1);
        assert!(loader.push_newest(&KEY, MsgId(9)));
        assert_eq!(loader.window(&KEY).unwrap().items(), &[MsgId(9), local]);
    }

    #[test]
    fn first_empty_page_resolves_unknown_total() {
        let mut loader = new_loader();
        loader.open_newest(&KEY, MsgId::provisional(0));
        let req = loader
            .load_more(&KEY, Direction::Backward, false, RequestToken(1))
            .unwrap();
        loader
            .on_fetched(&KEY, req.token, slice(vec![], 57))
            .unwrap();

        let window = loader.window(&KEY).unwrap();
        assert_eq!(window.total_raw(), 58);
        assert!(!window.is_fully_loaded());
        assert!(window.is_exhausted(Direction::Backward));
    }

    #[test]
    fn rename_and_remove_across_windows() {
        let mut loader = filled(1..=3, 10);
        let local = MsgId::provisional(0);
        loader.push_newest(&KEY, local);
        loader.open_newest(&2, local);

        let changed = loader.rename_item(local, MsgId(4));
        assert_eq!(changed, vec![KEY, 2]);
        assert!(loader.window(&KEY).unwrap().contains(MsgId(4)));
        assert!(!loader.window(&2).unwrap().contains(local));

        loader.push_newest(&2, MsgId::provisional(1));
        loader.rename_item(MsgId::provisional(1), MsgId(4));
        assert_eq!(loader.window(&2).unwrap().items(), &[MsgId(4)]);

        let changed = loader.remove_items(&[MsgId(4), MsgId(2)]);
        assert_eq!(changed.len(), 2);
        assert_eq!(loader.window(&KEY).unwrap().items(), &[MsgId(1), MsgId(3)]);
    }

    #[test]
    fn preload_neighbourhood_and_forget() {
        let mut loader = filled(1..=30, 30);
        let change = loader.preload(&KEY, 10, 1);
        let expected: Vec<MsgId> = [11, 12, 13, 14, 15].into_iter().map(MsgId).collect();
        assert_eq!(change.wanted, expected);

        let change = loader.preload(&KEY, 10, -1);
        assert_eq!(change.wanted, ids(7..=10));

        loader.preload(&KEY, 12, 1);
        assert_eq!(loader.evict(&KEY, 12, 1), Some(MsgId(11)));
        assert_eq!(loader.evict(&KEY, 12, 1), None);
        assert_eq!(loader.evict(&KEY, 12, 0), None);
    }

    #[test]
    fn resident_bound_after_jump() {
        let mut loader = filled(1..=100, 100);
        loader.preload(&KEY, 10, 1);
        let change = loader.preload(&KEY, 80, 1);
        let window = loader.window(&KEY).unwrap();
        assert!(window.resident().len() <= loader.config().max_resident());
        assert!(!change.released.is_empty());
        assert!(window.resident().contains(&MsgId(81)));
    }

    #[test]
    fn viewport_near_edge_requests_page() {
        let mut loader = filled(1..=30, 200);
        let change = loader.viewport_changed(&KEY, 5, -1);
        assert_eq!(change.load, Some(Direction::Backward));

        let change = loader.viewport_changed(&KEY, 29, 1);
        assert_eq!(change.load, None);
    }

    #[test]
    fn failed_fetch_frees_slot() {
        let mut loader = new_loader();
        loader.load_more(&KEY, Direction::Backward, false, RequestToken(1));
        assert!(!loader.on_failed(&KEY, RequestToken(2)));
        assert!(loader.on_failed(&KEY, RequestToken(1)));
        assert!(loader
            .load_more(&KEY, Direction::Backward, false, RequestToken(3))
            .is_some());
    }
}
