//! Branch directory.
//!
//! Branches are independent linear histories. Each records the parent it
//! was forked from and the parent commit it was forked at; everything at
//! or below that commit is read through the parent.

mod directory;

pub use directory::{
    meta_key, split_ref, validate_name, BranchDirectory, LineageStep, BRANCH_FIELDS,
    DEFAULT_BRANCH, MAX_ANCESTRY_DEPTH,
};
