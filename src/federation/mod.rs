//! ActivityPub federation module
//!
//! Handles:
//! - Domain blocking of remote peers
//! - Dereferencing of remote accounts, statuses, instances, media and emoji
//! - The federating store backing inbound activity processing
//! - Side effects handed to downstream processing
//! - HTTP Signatures and WebFinger

pub mod dereferencing;
pub mod domain_block;
pub mod federating_db;
pub mod media;
pub mod objects;
pub mod side_effects;
pub mod signature;
pub mod transport;
pub mod webfinger;

pub use dereferencing::{Dereferencer, ThreadResolution, ThreadStop};
pub use domain_block::DomainBlockGuard;
pub use federating_db::{FederatingDatabase, FederatingDb, InboundContext};
pub use media::{MediaManager, RemoteMediaManager};
pub use side_effects::{FederatedModel, FromFederator, SideEffectReceiver, SideEffectSender};
pub use transport::{HttpTransport, Transport};
