pub mod gallery;
pub mod user_store;

pub use gallery::{CommitOutcome, EnrolledIdentity, FileGalleryStore, Gallery, GalleryMap, GalleryStore};
pub use user_store::{UserRecord, UserStore};
