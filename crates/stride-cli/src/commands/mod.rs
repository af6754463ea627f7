pub mod add;
pub mod common;
pub mod conflicts;
pub mod delete;
pub mod edit;
pub mod list;
pub mod migrate;
pub mod purge;
pub mod sync;
