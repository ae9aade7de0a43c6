//! Services shared by the facade, the sync engine and the binaries

mod local_store;

pub use local_store::{
    delete_base_version, CommittedMutation, LocalMutation, LocalStore, StoreCounts,
};
