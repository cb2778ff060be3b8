//! Nearest-neighbour lookup over prototype descriptors.

use crate::types::FaceDescriptor;

/// Closest indexed prototype to a query.
#[derive(Debug, Clone, PartialEq)]
pub struct Nearest {
    pub identity_id: String,
    pub distance: f32,
}

/// Strategy for finding the closest known prototype to a query descriptor.
///
/// The resolver only depends on this trait, so the linear scan can be
/// swapped for an approximate index without changing resolution semantics.
pub trait DescriptorIndex: Send {
    fn insert(&mut self, identity_id: &str, descriptor: &FaceDescriptor);
    /// Globally closest prototype, or `None` when the index is empty.
    fn nearest(&self, query: &FaceDescriptor) -> Option<Nearest>;
    fn clear(&mut self);
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Exhaustive Euclidean scan. O(n) per query.
#[derive(Debug, Default)]
pub struct LinearScanIndex {
    entries: Vec<(String, FaceDescriptor)>,
}

impl LinearScanIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DescriptorIndex for LinearScanIndex {
    fn insert(&mut self, identity_id: &str, descriptor: &FaceDescriptor) {
        self.entries
            .push((identity_id.to_string(), descriptor.clone()));
    }

    fn nearest(&self, query: &FaceDescriptor) -> Option<Nearest> {
        let mut best_distance = f32::INFINITY;
        let mut best_idx: Option<usize> = None;

        // Strict comparison: on equal distance the earlier prototype wins.
        for (i, (_, prototype)) in self.entries.iter().enumerate() {
            let distance = query.euclidean_distance(prototype);
            if distance < best_distance {
                best_distance = distance;
                best_idx = Some(i);
            }
        }

        best_idx.map(|i| Nearest {
            identity_id: self.entries[i].0.clone(),
            distance: best_distance,
        })
    }

    fn clear(&mut self) {
        self.entries.clear();
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}
