//! Concurrency-safe sorted list of message index entries.

use std::sync::RwLock;

/// Locator of a stored message: which log file holds it and where.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IndexEntry {
    pub id: u64,
    pub file_id: u64,
    pub offset: u64,
    pub size: u32,
}

/// Result of a binary search over the list.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SearchOutcome {
    pub found: bool,
    /// Position of the entry when found; the insertion point otherwise.
    pub position: usize,
    /// The index closest to the searched id by absolute distance,
    /// tie-breaking toward the larger index.
    pub best: usize,
}

/// An ordered list of [`IndexEntry`], ascending and unique by id.
///
/// Readers never block one another; writers are serialized. Callers insert
/// near the tail (ids are assigned monotonically), so placement is O(1)
/// amortized.
#[derive(Default, Debug)]
pub struct IndexList {
    items: RwLock<Vec<IndexEntry>>,
}

impl IndexList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            items: RwLock::new(Vec::with_capacity(capacity)),
        }
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn insert(&self, entries: impl IntoIterator<Item = IndexEntry>) {
        let mut items = self.items.write().expect("index list lock poisoned");
        for entry in entries {
            insert_entry(&mut items, entry);
        }
    }

    pub fn insert_list(&self, other: &IndexList) {
        let other = other.read().clone();
        self.insert(other);
    }

    pub fn front(&self) -> Option<IndexEntry> {
        self.read().first().copied()
    }

    pub fn back(&self) -> Option<IndexEntry> {
        self.read().last().copied()
    }

    pub fn get(&self, position: usize) -> Option<IndexEntry> {
        self.read().get(position).copied()
    }

    /// True when the id lies between the first and last entry, inclusive.
    pub fn contains(&self, id: u64) -> bool {
        let items = self.read();
        match (items.first(), items.last()) {
            (Some(front), Some(back)) => front.id <= id && id <= back.id,
            _ => false,
        }
    }

    /// Binary search for an id. Returns `None` on an empty list.
    pub fn search(&self, id: u64) -> Option<SearchOutcome> {
        let items = self.read();
        if items.is_empty() {
            return None;
        }
        Some(match items.binary_search_by_key(&id, |entry| entry.id) {
            Ok(position) => SearchOutcome {
                found: true,
                position,
                best: position,
            },
            Err(insertion) => {
                let best = if insertion == 0 {
                    0
                } else if insertion == items.len() {
                    items.len() - 1
                } else {
                    let below = id - items[insertion - 1].id;
                    let above = items[insertion].id - id;
                    if below < above { insertion - 1 } else { insertion }
                };
                SearchOutcome {
                    found: false,
                    position: insertion,
                    best,
                }
            }
        })
    }

    /// Collect up to `count` entries starting at `start_id` and advancing
    /// by `direction` (+1 forward, -1 backward).
    ///
    /// When `start_id` is absent the walk starts at the nearest entry on
    /// the requested side, so a forward extract never yields ids below the
    /// start. Each step re-reads the list and halts when the position runs
    /// out of range, tolerating concurrent inserts.
    pub fn extract(&self, start_id: u64, direction: i8, count: usize) -> Vec<IndexEntry> {
        let Some(outcome) = self.search(start_id) else {
            return Vec::new();
        };
        let step: i64 = if direction < 0 { -1 } else { 1 };
        let mut position = outcome.best as i64;
        if !outcome.found {
            if let Some(best) = self.get(outcome.best) {
                if step > 0 && best.id < start_id {
                    position += 1;
                } else if step < 0 && best.id > start_id {
                    position -= 1;
                }
            }
        }

        let mut entries = Vec::new();
        while entries.len() < count && position >= 0 {
            match self.get(position as usize) {
                Some(entry) => {
                    entries.push(entry);
                    position += step;
                }
                None => break,
            }
        }
        entries
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Vec<IndexEntry>> {
        self.items.read().expect("index list lock poisoned")
    }
}

fn insert_entry(items: &mut Vec<IndexEntry>, entry: IndexEntry) {
    // Common case: strictly larger than the current tail.
    match items.last() {
        None => items.push(entry),
        Some(back) if back.id < entry.id => items.push(entry),
        _ => match items.binary_search_by_key(&entry.id, |e| e.id) {
            // Duplicate id: keep the id unique, refresh the locator.
            Ok(position) => items[position] = entry,
            Err(position) => items.insert(position, entry),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: u64) -> IndexEntry {
        IndexEntry {
            id,
            file_id: 0,
            offset: id * 100,
            size: 10,
        }
    }

    fn list_of(ids: &[u64]) -> IndexList {
        let list = IndexList::new();
        list.insert(ids.iter().map(|&id| entry(id)));
        list
    }

    #[test]
    fn insert_keeps_order_regardless_of_arrival() {
        let list = list_of(&[5, 1, 9, 3, 7]);
        let ids: Vec<u64> = (0..list.len()).map(|i| list.get(i).unwrap().id).collect();
        assert_eq!(ids, vec![1, 3, 5, 7, 9]);
    }

    #[test]
    fn insert_duplicate_replaces_entry() {
        let list = list_of(&[1, 2, 3]);
        list.insert([IndexEntry {
            id: 2,
            file_id: 9,
            offset: 0,
            size: 1,
        }]);
        assert_eq!(list.len(), 3);
        assert_eq!(list.get(1).unwrap().file_id, 9);
    }

    #[test]
    fn front_and_back() {
        let list = list_of(&[4, 2, 8]);
        assert_eq!(list.front().unwrap().id, 2);
        assert_eq!(list.back().unwrap().id, 8);
        assert!(IndexList::new().front().is_none());
    }

    #[test]
    fn contains_is_range_based() {
        let list = list_of(&[2, 4, 8]);
        assert!(list.contains(2));
        assert!(list.contains(5));
        assert!(list.contains(8));
        assert!(!list.contains(1));
        assert!(!list.contains(9));
    }

    #[test]
    fn search_finds_exact_and_nearest() {
        let list = list_of(&[10, 20, 30]);

        let hit = list.search(20).unwrap();
        assert!(hit.found);
        assert_eq!(hit.position, 1);

        let miss = list.search(24).unwrap();
        assert!(!miss.found);
        assert_eq!(miss.best, 1, "24 is closer to 20 than to 30");

        let tie = list.search(25).unwrap();
        assert_eq!(tie.best, 2, "ties break toward the larger index");

        let below = list.search(1).unwrap();
        assert_eq!(below.best, 0);
        let above = list.search(99).unwrap();
        assert_eq!(above.best, 2);
    }

    #[test]
    fn extract_forward_respects_start_and_count() {
        let list = list_of(&[1, 2, 3, 4, 5]);
        let ids: Vec<u64> = list.extract(3, 1, 2).iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![3, 4]);
    }

    #[test]
    fn extract_forward_from_missing_id_never_goes_below_start() {
        let list = list_of(&[10, 20, 30]);
        let ids: Vec<u64> = list.extract(19, 1, 10).iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![20, 30]);
    }

    #[test]
    fn extract_backward() {
        let list = list_of(&[10, 20, 30]);
        let ids: Vec<u64> = list.extract(30, -1, 2).iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![30, 20]);

        let ids: Vec<u64> = list.extract(25, -1, 10).iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![20, 10]);
    }

    #[test]
    fn extract_with_unbounded_count() {
        let list = list_of(&[1, 2, 3]);
        let ids: Vec<u64> = list
            .extract(1, 1, usize::MAX)
            .iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn extract_on_empty_list() {
        assert!(IndexList::new().extract(1, 1, 5).is_empty());
    }

    #[test]
    fn readers_do_not_block_each_other_during_writes() {
        use std::sync::Arc;

        let list = Arc::new(IndexList::new());
        let writer = {
            let list = Arc::clone(&list);
            std::thread::spawn(move || {
                for id in 1..=1000u64 {
                    list.insert([entry(id)]);
                }
            })
        };
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let list = Arc::clone(&list);
                std::thread::spawn(move || {
                    let mut last_len = 0;
                    while last_len < 1000 {
                        let len = list.len();
                        assert!(len >= last_len);
                        last_len = len;
                        if let Some(back) = list.back() {
                            // The writer may have advanced between the two reads.
                            assert!(back.id as usize >= len);
                        }
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for reader in readers {
            reader.join().unwrap();
        }
    }
}
