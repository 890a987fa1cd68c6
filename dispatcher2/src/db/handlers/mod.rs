//! Repository implementations for database access.
//!
//! Repositories are constructed over a `&mut PgConnection` so callers decide
//! the transaction scope: the consumer pool wraps a whole lease in one
//! transaction, the API handlers use short-lived ones.

pub mod requests;
pub mod schedules;
pub mod servers;
pub mod tokens;

pub use requests::Requests;
pub use schedules::Schedules;
pub use servers::Servers;
pub use tokens::Tokens;
