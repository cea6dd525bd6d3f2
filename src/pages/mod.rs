//! Versioned page storage.
//!
//! Pages are opaque byte blobs addressed by `(branch, page number, commit)`.
//! A read returns the newest version at or below the requested commit,
//! searching the branch first and then each ancestor up to its fork point.

mod store;

pub use store::{
    drop_branch, max_page_no, maxpage_table, move_range, pages_table, plain_max_page_no,
    read_local, read_page, read_plain, set_max_page_mark, truncate_after, version_count,
    write_page, write_plain, PLAIN_PAGES_TABLE,
};
