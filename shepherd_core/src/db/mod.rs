//! Plain query modules, one per table family.
//!
//! Write functions take `&mut PgConnection` so callers compose them under
//! one transaction via [`crate::Db::with_tx`]; reads are generic over the
//! executor so they run on the pool or inside a transaction as needed.

pub mod adoptions;
pub mod audit;
pub mod batches;
pub mod clusters;
pub mod events;
pub mod hierarchy;
pub mod namespaces;
pub mod notifications;
pub mod ratelimits;
pub mod rbac;
pub mod sizes;
pub mod templates;
pub mod tickets;
pub mod users;
