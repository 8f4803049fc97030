//! Vault access: scanning managed notes and writing rendered ones.

pub mod store;
pub mod writer;

pub use store::{VaultScan, VaultStore, ARCHIVE_FOLDER};
pub use writer::{render_note, write_note, NoteContext};
