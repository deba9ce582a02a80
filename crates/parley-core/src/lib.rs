//! Thread/message domain engine for two-party conversations.
//!
//! [`Messenger`] is the entry point; it wires the [`AccessGuard`], the
//! [`ThreadDirectory`], the [`MessageLedger`] and the fan-out
//! [`Dispatcher`] over a [`Store`].

pub mod directory;
pub mod error;
pub mod fanout;
pub mod guard;
pub mod identity;
pub mod ledger;
pub mod messenger;
pub mod store;

pub use directory::ThreadDirectory;
pub use error::ChatError;
pub use fanout::{Dispatcher, Subscription, SubscriptionHandle};
pub use guard::AccessGuard;
pub use identity::{CurrentUser, Identity, TokenIssuer};
pub use ledger::MessageLedger;
pub use messenger::Messenger;
pub use store::{Store, StoreError};

#[cfg(test)]
pub(crate) mod testing;
