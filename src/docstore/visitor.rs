//! Visitor callbacks for batch reads and full-store iteration
//!
//! Closures implement every visitor trait, so callers can pass
//! `&mut |lid, data| { ... }` wherever a visitor is expected.

use super::document::Document;

/// Receives raw (decompressed) payloads
pub trait DataStoreVisitor {
    fn visit(&mut self, lid: u32, data: &[u8]);
}

impl<F: FnMut(u32, &[u8])> DataStoreVisitor for F {
    fn visit(&mut self, lid: u32, data: &[u8]) {
        self(lid, data)
    }
}

/// Receives decoded documents
pub trait DocumentVisitor {
    fn visit(&mut self, lid: u32, doc: Document);
}

impl<F: FnMut(u32, Document)> DocumentVisitor for F {
    fn visit(&mut self, lid: u32, doc: Document) {
        self(lid, doc)
    }
}

/// Receives progress of a full-store iteration as a fraction in `[0, 1]`
pub trait VisitorProgress {
    fn update_progress(&mut self, progress: f64);
}

impl<F: FnMut(f64)> VisitorProgress for F {
    fn update_progress(&mut self, progress: f64) {
        self(progress)
    }
}

/// Progress sink that ignores updates
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl VisitorProgress for NoProgress {
    fn update_progress(&mut self, _progress: f64) {}
}
