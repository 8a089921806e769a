//! Concrete [`ListWatch`](crate::informer::ListWatch) transports.

pub mod dir;

pub use dir::{DirectoryListWatch, FileObject};
