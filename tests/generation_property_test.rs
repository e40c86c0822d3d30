//! Randomized writer/reader interleavings over the buffer pool
//!
//! A single writer allocates, frees and commits while guards pin snapshots
//! of the live entries. Every entry visible when a guard was taken must
//! read back unchanged for as long as that guard lives, even after the
//! writer freed it, recycled its array or grew its buffer.

use photondb_docstore::datastore::{BufferType, DataStore, EntryRef, GenerationHandler, RefLayout};
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Op {
    Alloc { fixed: bool, words: usize, value: u32 },
    Free(usize),
    Guard,
    Release(usize),
    Commit,
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    entry_ref: EntryRef,
    words: usize,
    value: u32,
}

impl Entry {
    fn expected(&self) -> Vec<u32> {
        (0..self.words as u32).map(|i| self.value.wrapping_add(i)).collect()
    }
}

const FIXED_WORDS: usize = 2;

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (any::<bool>(), 1usize..5, any::<u32>())
            .prop_map(|(fixed, words, value)| Op::Alloc { fixed, words, value }),
        3 => any::<usize>().prop_map(Op::Free),
        1 => Just(Op::Guard),
        1 => any::<usize>().prop_map(Op::Release),
        2 => Just(Op::Commit),
    ]
}

fn commit(store: &mut DataStore, handler: &mut GenerationHandler) {
    store.transfer_hold_lists(handler.current_generation());
    handler.inc_generation();
    store.trim_hold_lists(handler.oldest_used_generation());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn guarded_entries_stay_intact(ops in prop::collection::vec(op_strategy(), 1..300)) {
        let mut handler = GenerationHandler::new();
        let generations = handler.reader();
        // Small buffers so growth and primary switches happen often
        let mut store = DataStore::new(RefLayout::new(12, 8), &handler);
        let var_type = store.add_type(BufferType::new(1, 4, 256));
        let fixed_type = store.add_type(BufferType::new(FIXED_WORDS as u32, 2, 32));
        let reader = store.reader();

        let mut live: Vec<Entry> = Vec::new();
        let mut guards = Vec::new();

        for op in ops {
            match op {
                Op::Alloc { fixed, words, value } => {
                    let (type_id, words) = if fixed {
                        (fixed_type, FIXED_WORDS)
                    } else {
                        (var_type, words)
                    };
                    let data: Vec<u32> = (0..words as u32).map(|i| value.wrapping_add(i)).collect();
                    let entry_ref = store.insert(type_id, &data).unwrap();
                    prop_assert!(entry_ref.valid());
                    live.push(Entry { entry_ref, words, value });
                }
                Op::Free(index) => {
                    if !live.is_empty() {
                        let entry = live.swap_remove(index % live.len());
                        store.hold_elem(entry.entry_ref, entry.words);
                    }
                }
                Op::Guard => {
                    guards.push((generations.take_guard(), live.clone()));
                }
                Op::Release(index) => {
                    if !guards.is_empty() {
                        guards.swap_remove(index % guards.len());
                    }
                }
                Op::Commit => commit(&mut store, &mut handler),
            }

            for (guard, snapshot) in &guards {
                for entry in snapshot {
                    let view = reader.get(guard, entry.entry_ref, entry.words);
                    prop_assert_eq!(view.to_vec(), entry.expected());
                }
            }
            for entry in &live {
                prop_assert_eq!(store.get(entry.entry_ref, entry.words).to_vec(), entry.expected());
            }
            let live_words: usize = live.iter().map(|e| e.words).sum();
            prop_assert_eq!(store.memory_used(), live_words * 4);
        }

        guards.clear();
        commit(&mut store, &mut handler);
        commit(&mut store, &mut handler);
        prop_assert_eq!(store.hold_list_len(), 0);
        prop_assert_eq!(store.memory_usage().allocated_bytes_on_hold, 0);
    }

    #[test]
    fn oldest_used_generation_tracks_guards(holds in prop::collection::vec(any::<bool>(), 1..50)) {
        let mut handler = GenerationHandler::new();
        let generations = handler.reader();
        let mut guards = Vec::new();

        for keep in holds {
            let guard = generations.take_guard();
            if keep {
                guards.push(guard);
            }
            handler.inc_generation();

            let oldest = guards
                .iter()
                .map(|g| g.generation())
                .min()
                .unwrap_or(handler.current_generation());
            prop_assert_eq!(handler.oldest_used_generation(), oldest);
            prop_assert!(handler.oldest_used_generation() <= handler.current_generation());
        }

        guards.clear();
        handler.update_oldest_used_generation();
        prop_assert_eq!(handler.oldest_used_generation(), handler.current_generation());
    }
}
