use std::sync::Arc;

use parley_types::events::Topic;
use parley_types::models::{Message, Thread, ThreadId};

use crate::directory::ThreadDirectory;
use crate::error::ChatError;
use crate::fanout::{Dispatcher, Subscription};
use crate::guard::AccessGuard;
use crate::identity::{CurrentUser, Identity, TokenIssuer};
use crate::ledger::MessageLedger;
use crate::store::{Store, run_blocking};

/// The operations exposed to transports: three reads, two writes and two
/// subscription topics, all taking the caller's [`Identity`].
pub struct Messenger<S> {
    store: Arc<S>,
    tokens: TokenIssuer,
    dispatcher: Dispatcher,
    guard: AccessGuard<S>,
    directory: ThreadDirectory<S>,
    ledger: MessageLedger<S>,
}

impl<S: Store> Messenger<S> {
    pub fn new(store: Arc<S>, tokens: TokenIssuer, dispatcher: Dispatcher) -> Self {
        let guard = AccessGuard::new(store.clone());
        Self {
            directory: ThreadDirectory::new(store.clone(), guard.clone(), dispatcher.clone()),
            ledger: MessageLedger::new(store.clone(), guard.clone(), dispatcher.clone()),
            guard,
            store,
            tokens,
            dispatcher,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn tokens(&self) -> &TokenIssuer {
        &self.tokens
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Resolves a bearer token to the current user. Invalid, expired and
    /// orphaned tokens yield `Anonymous`; only store failures are errors.
    pub async fn identify(&self, bearer: Option<&str>) -> Result<Identity, ChatError> {
        let Some(claims) = bearer.and_then(|token| self.tokens.verify(token)) else {
            return Ok(Identity::Anonymous);
        };

        let user = run_blocking(&self.store, move |store| store.find_user_by_id(claims.sub)).await?;
        Ok(user
            .map(|u| Identity::User(CurrentUser::from(&u)))
            .unwrap_or_default())
    }

    pub async fn can_access(&self, identity: &Identity, thread_id: ThreadId) -> Result<bool, ChatError> {
        self.guard.can_access(identity, thread_id).await
    }

    pub async fn list_threads(&self, identity: &Identity) -> Result<Vec<Thread>, ChatError> {
        self.directory.list_threads(identity).await
    }

    pub async fn get_thread(&self, identity: &Identity, thread_id: ThreadId) -> Result<Thread, ChatError> {
        self.directory.get_thread(identity, thread_id).await
    }

    pub async fn create_thread(&self, identity: &Identity, other_username: &str) -> Result<Thread, ChatError> {
        self.directory.create_thread(identity, other_username).await
    }

    pub async fn list_messages(&self, identity: &Identity, thread_id: ThreadId) -> Result<Vec<Message>, ChatError> {
        self.ledger.list_messages(identity, thread_id).await
    }

    pub async fn send_message(
        &self,
        identity: &Identity,
        thread_id: ThreadId,
        content: &str,
    ) -> Result<Message, ChatError> {
        self.ledger.send_message(identity, thread_id, content).await
    }

    /// New messages of one thread. Participants only.
    pub async fn thread_topic(&self, identity: &Identity, thread_id: ThreadId) -> Result<Subscription, ChatError> {
        self.guard.authorize(identity, thread_id).await?;
        Ok(self.dispatcher.subscribe(Topic::thread(thread_id)))
    }

    /// Activity on the caller's own threads. Updates for other users'
    /// threads never reach the subscription.
    pub fn thread_list_topic(&self, identity: &Identity) -> Result<Subscription, ChatError> {
        let user = identity.user()?;
        Ok(self.dispatcher.subscribe(Topic::ThreadList).visible_to(user.id))
    }
}
