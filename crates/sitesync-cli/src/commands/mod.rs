pub mod common;
pub mod conflicts;
pub mod outbox;
pub mod records;
pub mod seed;
pub mod sync;
pub mod version;
