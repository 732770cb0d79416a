//! tasknet-services: the task protocol session and the stores it shares
//! with every other session of a node.

pub mod directory;
pub mod escalation;
pub mod history;
pub mod hooks;
pub mod ledger;
pub mod node;
pub mod session;
pub mod tasks;
pub mod transport;

pub use escalation::{Arbiter, EscalationService};
pub use history::MessageHistory;
pub use ledger::SubtaskLedger;
pub use node::LocalNode;
pub use session::{Session, SessionContext, SessionEvent, SessionHandle, Stores};
pub use tasks::TaskBoard;
