//! Feed skeleton composition: cursor codec, composer, query boundary

pub mod composer;
pub mod cursor;
pub mod service;

pub use composer::{ComposerSettings, FeedComposer, FeedError, FeedPage};
pub use cursor::{CursorError, FeedCursor, PaginationCursor, EOF, MAX_RANKED_OFFSET};
pub use service::{FeedService, FeedSkeletonResponse, SkeletonItem};
