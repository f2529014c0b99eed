//! Server-side halves of the sync engine: the `breakdownQuery` execution
//! engine ([`engine`]), the custom-procedure transaction handle
//! ([`transaction`]), and the per-connection session ([`session`]).

pub mod engine;
pub mod session;
pub mod transaction;

pub use engine::{execute_query, StepResult};
pub use session::{AllowAllMutations, CustomProcedure, Hub, MutationGuard, Session, SessionId};
pub use transaction::Transaction;
