//! Messaging fabric for quorumcode.
//!
//! The fabric is a set of named, append-only, totally-ordered streams with
//! blocking tail reads. Mailboxes are streams named `qc:mailbox/<recipient>`;
//! event streams share the same machinery. [`Fabric`] is the contract,
//! [`MemoryFabric`] the in-process implementation, and [`mailbox`] the
//! envelope-aware read/write layer on top.

pub mod mailbox;
pub mod memory;
pub mod stream;

pub use mailbox::{Mailbox, MailboxReader};
pub use memory::MemoryFabric;
pub use stream::{EntryId, Fabric, StreamEntry};
