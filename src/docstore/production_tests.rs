//! Production-style workloads for the document store
//!
//! Random writes, removes, flushes, compactions and reopens against the
//! log data store, checked against an in-memory model.

#[cfg(test)]
mod workload {
    use crate::docstore::{
        CompressionConfig, Document, DocumentStore, DocumentStoreConfig, DocumentTypeRepo,
        LogStoreConfig,
    };
    use crate::error::{Error, Result};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::collections::HashMap;
    use std::path::Path;

    const LIDS: u32 = 200;

    fn config() -> DocumentStoreConfig {
        DocumentStoreConfig {
            log: LogStoreConfig { max_chunk_bytes: 8 * 1024 },
            ..DocumentStoreConfig::new(CompressionConfig::zstd(3), 32 * 1024, 64)
        }
    }

    fn repo() -> DocumentTypeRepo {
        DocumentTypeRepo::new().with_type("event")
    }

    fn event(lid: u32, version: u64, rng: &mut StdRng) -> Document {
        let body: String = (0..rng.gen_range(0..200))
            .map(|_| rng.gen_range(b'a'..=b'z') as char)
            .collect();
        Document::new(format!("id:event::{}", lid), "event")
            .with_field("version", version)
            .with_field("body", body)
    }

    fn verify(store: &DocumentStore, model: &HashMap<u32, Document>) -> Result<()> {
        for lid in 0..LIDS {
            assert_eq!(store.read(lid, &repo())?.as_ref(), model.get(&lid), "lid {}", lid);
        }
        Ok(())
    }

    fn open(dir: &Path) -> Result<DocumentStore> {
        DocumentStore::open(dir, config())
    }

    #[test]
    fn test_random_workload_with_reopen() -> Result<()> {
        let dir = tempfile::tempdir().map_err(|e| Error::Storage(e.to_string()))?;
        let mut rng = StdRng::seed_from_u64(0x5eed);
        let mut model: HashMap<u32, Document> = HashMap::new();
        let mut token = 0u64;
        let mut store = open(dir.path())?;

        for round in 0..5 {
            for _ in 0..1000 {
                token += 1;
                let lid = rng.gen_range(0..LIDS);
                match rng.gen_range(0..10) {
                    0..=6 => {
                        let doc = event(lid, token, &mut rng);
                        store.write(token, lid, &doc)?;
                        model.insert(lid, doc);
                    }
                    7 => {
                        store.remove(token, lid)?;
                        model.remove(&lid);
                    }
                    _ => {
                        store.read(lid, &repo())?;
                    }
                }
            }
            verify(&store, &model)?;

            if store.compact_bloat(token)? {
                verify(&store, &model)?;
            }
            store.flush(token)?;
            assert_eq!(store.last_sync_token(), token);

            drop(store);
            store = open(dir.path())?;
            assert_eq!(store.last_sync_token(), token, "round {}", round);
            verify(&store, &model)?;
        }

        let stats = store.cache_stats();
        assert!(stats.lookups() > 0);
        assert!(stats.memory_used <= 32 * 1024);
        Ok(())
    }

    #[test]
    fn test_visit_matches_reads() -> Result<()> {
        let dir = tempfile::tempdir().map_err(|e| Error::Storage(e.to_string()))?;
        let mut rng = StdRng::seed_from_u64(42);
        let store = open(dir.path())?;

        let mut model = HashMap::new();
        for token in 1..=500u64 {
            let lid = rng.gen_range(0..LIDS);
            let doc = event(lid, token, &mut rng);
            store.write(token, lid, &doc)?;
            model.insert(lid, doc);
        }

        let lids: Vec<u32> = (0..LIDS).collect();
        let mut visited = HashMap::new();
        let count = store.visit(&lids, &repo(), &mut |lid: u32, doc: Document| {
            visited.insert(lid, doc);
        })?;
        assert_eq!(count, model.len());
        assert_eq!(visited, model);
        Ok(())
    }
}
