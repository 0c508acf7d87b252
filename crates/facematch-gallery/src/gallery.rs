use crate::enrollment::EnrollError;
use crate::store::{GalleryStore, LoadSource, StoreError};
use chrono::Utc;
use facematch_core::{Embedding, Gallery, GalleryEntry};
use std::sync::Arc;

/// The enrolled gallery plus the store it persists to.
///
/// Only this type talks to the store. Enrollment bumps a generation counter;
/// a save records the generation it wrote, so `has_unsaved_changes` is exact
/// even when saves run elsewhere from a [`GallerySnapshot`].
pub struct EmbeddingGallery {
    store: Arc<dyn GalleryStore>,
    gallery: Gallery,
    source: LoadSource,
    generation: u64,
    persisted: u64,
}

/// Point-in-time copy of the gallery, used to save off the matching thread.
#[derive(Debug, Clone)]
pub struct GallerySnapshot {
    pub gallery: Gallery,
    pub generation: u64,
}

impl EmbeddingGallery {
    /// Load from `store`. Missing data gives an empty gallery; corrupt data is an error.
    pub fn load(store: Arc<dyn GalleryStore>) -> Result<Self, StoreError> {
        let (gallery, source) = store.load()?;
        Ok(Self {
            store,
            gallery,
            source,
            generation: 0,
            persisted: 0,
        })
    }

    pub fn gallery(&self) -> &Gallery {
        &self.gallery
    }

    pub fn source(&self) -> LoadSource {
        self.source
    }

    pub fn store(&self) -> Arc<dyn GalleryStore> {
        Arc::clone(&self.store)
    }

    pub fn is_empty(&self) -> bool {
        self.gallery.is_empty()
    }

    pub fn len(&self) -> usize {
        self.gallery.len()
    }

    /// Append a sample and return how many samples `identity` now has.
    ///
    /// Anything the store could not load back is refused: a blank identity,
    /// or values that are non-finite or overflow the magnitude.
    pub fn enroll(&mut self, identity: &str, embedding: Embedding) -> Result<usize, EnrollError> {
        if identity.trim().is_empty() {
            return Err(EnrollError::BlankIdentity);
        }
        if !embedding.is_finite() {
            return Err(EnrollError::DegenerateEmbedding);
        }
        let mut entry = GalleryEntry::new(identity, embedding);
        entry.enrolled_at = Some(Utc::now());
        self.gallery.enroll(entry);
        self.generation += 1;
        Ok(self.gallery.samples_for(identity))
    }

    pub fn has_unsaved_changes(&self) -> bool {
        self.persisted < self.generation
    }

    pub fn snapshot(&self) -> GallerySnapshot {
        GallerySnapshot {
            gallery: self.gallery.clone(),
            generation: self.generation,
        }
    }

    /// Record that everything up to `generation` is durable.
    pub fn mark_persisted(&mut self, generation: u64) {
        self.persisted = self.persisted.max(generation.min(self.generation));
    }

    /// Save the current contents synchronously.
    pub fn save(&mut self) -> Result<(), StoreError> {
        let snapshot = self.snapshot();
        snapshot.persist(self.store.as_ref())?;
        self.mark_persisted(snapshot.generation);
        Ok(())
    }
}

impl GallerySnapshot {
    pub fn persist(&self, store: &dyn GalleryStore) -> Result<(), StoreError> {
        store.save(&self.gallery)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn emb(values: &[f32]) -> Embedding {
        Embedding::new(values.to_vec())
    }

    #[test]
    fn test_load_empty_store() {
        let gallery = EmbeddingGallery::load(Arc::new(MemoryStore::new())).unwrap();
        assert!(gallery.is_empty());
        assert_eq!(gallery.source(), LoadSource::Empty);
        assert!(!gallery.has_unsaved_changes());
    }

    #[test]
    fn test_load_corrupt_store_is_error() {
        let result = EmbeddingGallery::load(Arc::new(MemoryStore::with_blob("garbage")));
        assert!(matches!(result, Err(StoreError::Corrupt { .. })));
    }

    #[test]
    fn test_enroll_appends_and_counts_samples() {
        let mut gallery = EmbeddingGallery::load(Arc::new(MemoryStore::new())).unwrap();
        assert_eq!(gallery.enroll("alice", emb(&[1.0, 0.0])), Ok(1));
        assert_eq!(gallery.enroll("bob", emb(&[0.0, 1.0])), Ok(1));
        assert_eq!(gallery.enroll("alice", emb(&[0.9, 0.1])), Ok(2));
        assert_eq!(gallery.len(), 3);
        assert!(gallery.gallery().entries().iter().all(|e| e.enrolled_at.is_some()));
    }

    #[test]
    fn test_unsaved_changes_until_save() {
        let store = Arc::new(MemoryStore::new());
        let mut gallery = EmbeddingGallery::load(store.clone()).unwrap();
        gallery.enroll("alice", emb(&[1.0, 0.0])).unwrap();
        assert!(gallery.has_unsaved_changes());

        // Abnormal termination before a save loses the enrollment.
        assert!(store.blob().is_none());

        gallery.save().unwrap();
        assert!(!gallery.has_unsaved_changes());
        let reloaded = EmbeddingGallery::load(store).unwrap();
        assert!(reloaded.gallery().same_samples(gallery.gallery()));
    }

    #[test]
    fn test_snapshot_persist_marks_only_its_generation() {
        let store = Arc::new(MemoryStore::new());
        let mut gallery = EmbeddingGallery::load(store.clone()).unwrap();
        gallery.enroll("alice", emb(&[1.0, 0.0])).unwrap();
        let snapshot = gallery.snapshot();
        gallery.enroll("bob", emb(&[0.0, 1.0])).unwrap();

        snapshot.persist(store.as_ref()).unwrap();
        gallery.mark_persisted(snapshot.generation);
        assert!(gallery.has_unsaved_changes());

        gallery.save().unwrap();
        assert!(!gallery.has_unsaved_changes());
    }

    #[test]
    fn test_enroll_refuses_entries_that_would_not_reload() {
        let store = Arc::new(MemoryStore::new());
        let mut gallery = EmbeddingGallery::load(store.clone()).unwrap();
        gallery.enroll("alice", emb(&[1.0, 0.0])).unwrap();

        assert_eq!(gallery.enroll("", emb(&[0.0, 1.0])), Err(EnrollError::BlankIdentity));
        assert_eq!(gallery.enroll("  ", emb(&[0.0, 1.0])), Err(EnrollError::BlankIdentity));
        assert_eq!(
            gallery.enroll("bob", emb(&[f32::NAN, 1.0])),
            Err(EnrollError::DegenerateEmbedding)
        );
        assert_eq!(
            gallery.enroll("bob", emb(&[3e38, 3e38])),
            Err(EnrollError::DegenerateEmbedding)
        );
        assert_eq!(gallery.len(), 1);

        gallery.save().unwrap();
        let reloaded = EmbeddingGallery::load(store).unwrap();
        assert!(reloaded.gallery().same_samples(gallery.gallery()));
    }
}
