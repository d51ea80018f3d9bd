pub mod amount;
pub mod clock;
pub mod config;
pub mod csv;
pub mod engine;
pub mod model;
pub mod payout;
pub mod rebalance;
pub mod reconcile;
pub mod refund;
pub mod signals;
pub mod store;
pub mod treasury;

pub use amount::Amount;
pub use config::LedgerConfig;
pub use engine::{Engine, EngineError};
pub use model::{Actor, Command, SpendKind, TransactionId, UserId, VaultId};
pub use treasury::{Collaborators, Treasury};
