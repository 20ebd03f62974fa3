//! Offline-first sync core for the Boodle Bilao point-of-sale terminal.
//!
//! Sales keep getting recorded when the connection to the hosted record
//! store drops: writes land in a durable SQLite cache and an outbox of
//! pending mutations, and a sync engine replays the outbox when
//! connectivity returns. The payment ledger on top enforces the
//! unpaid/paid/voided lifecycle, computes totals once at the
//! authoritative write, and derives receipt ticket numbers on read.

pub mod cache;
pub mod connectivity;
pub mod db;
pub mod error;
pub mod ledger;
pub mod model;
pub mod outbox;
pub mod remote;
pub mod sync;

pub use connectivity::ConnectivityMonitor;
pub use error::SyncError;
pub use ledger::{DailyStats, Totals};
pub use model::{
    Discount, DiscountKind, LineItem, PaymentMethod, PaymentPatch, PaymentRecord, PaymentStatus,
    SalesChannel,
};
pub use remote::{HttpStore, MemoryStore, RemoteStore};
pub use sync::{SyncEngine, SyncStatus};
