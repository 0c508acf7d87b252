//! facematch-gallery: Enrolled face storage.
//!
//! Owns the durable gallery (atomic JSON blob with an optional bundled
//! seed), the debug text export, and the enrollment workflow that turns an
//! unknown face into a named entry.

pub mod enrollment;
pub mod export;
pub mod gallery;
pub mod store;

pub use enrollment::{EnrollError, EnrollOutcome, EnrollmentWorkflow, PersistPolicy};
pub use gallery::{EmbeddingGallery, GallerySnapshot};
pub use store::{FileStore, GalleryStore, LoadSource, MemoryStore, StoreError};
