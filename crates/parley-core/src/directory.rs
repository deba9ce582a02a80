use std::sync::Arc;

use tracing::{debug, info};

use parley_types::events::{ThreadEvent, Topic};
use parley_types::models::{Thread, ThreadId};

use crate::error::ChatError;
use crate::fanout::Dispatcher;
use crate::guard::AccessGuard;
use crate::identity::Identity;
use crate::store::{Store, run_blocking};

/// Resolves and creates threads. Owns the one-thread-per-pair rule.
pub struct ThreadDirectory<S> {
    store: Arc<S>,
    guard: AccessGuard<S>,
    dispatcher: Dispatcher,
}

impl<S: Store> ThreadDirectory<S> {
    pub fn new(store: Arc<S>, guard: AccessGuard<S>, dispatcher: Dispatcher) -> Self {
        Self {
            store,
            guard,
            dispatcher,
        }
    }

    /// The caller's threads, most recently active first, each carrying its
    /// latest message.
    pub async fn list_threads(&self, identity: &Identity) -> Result<Vec<Thread>, ChatError> {
        let user_id = identity.user()?.id;
        run_blocking(&self.store, move |store| store.list_threads_for_user(user_id)).await
    }

    /// A thread with its full history, oldest message first.
    pub async fn get_thread(&self, identity: &Identity, thread_id: ThreadId) -> Result<Thread, ChatError> {
        self.guard.authorize(identity, thread_id).await?;
        run_blocking(&self.store, move |store| store.get_thread_with_messages(thread_id))
            .await?
            .ok_or(ChatError::NotFound("Thread"))
    }

    /// Opens the conversation between the caller and `other_username`.
    /// Idempotent and symmetric: every call for the same pair, from either
    /// side, returns the same thread.
    pub async fn create_thread(&self, identity: &Identity, other_username: &str) -> Result<Thread, ChatError> {
        let caller = identity.user()?;
        let other_username = other_username.trim();
        if other_username.is_empty() {
            return Err(ChatError::bad_input("Participant username is required"));
        }

        let name = other_username.to_string();
        let other = run_blocking(&self.store, move |store| store.find_user_by_username(&name))
            .await?
            .ok_or(ChatError::NotFound("User"))?;

        if other.id == caller.id {
            return Err(ChatError::bad_input("Cannot create thread with yourself"));
        }

        let (a, b) = (caller.id, other.id);
        if let Some(existing) =
            run_blocking(&self.store, move |store| store.find_thread_by_participant_pair(a, b)).await?
        {
            debug!("Thread {} already exists for {} and {}", existing.id, caller.username, other.username);
            return self.full_thread(existing.id).await;
        }

        let (resolved, created) =
            match run_blocking(&self.store, move |store| store.create_thread_with_participants(a, b)).await {
                Ok(outcome) => outcome,
                // Lost a race the store could not settle on its own: the
                // winner's thread is the answer.
                Err(ChatError::Conflict(_)) => {
                    let existing = run_blocking(&self.store, move |store| store.find_thread_by_participant_pair(a, b))
                        .await?
                        .ok_or_else(|| ChatError::Conflict("Thread creation conflicted, retry".into()))?;
                    (existing, false)
                }
                Err(e) => return Err(e),
            };

        let thread = self.full_thread(resolved.id).await?;
        if created {
            info!("{} opened thread {} with {}", caller.username, thread.id, other.username);
            self.dispatcher.publish(Topic::ThreadList, ThreadEvent::ThreadUpdated(thread.clone()));
        } else {
            debug!("Thread {} was opened concurrently for {} and {}", thread.id, caller.username, other.username);
        }
        Ok(thread)
    }

    async fn full_thread(&self, thread_id: ThreadId) -> Result<Thread, ChatError> {
        run_blocking(&self.store, move |store| store.get_thread_with_messages(thread_id))
            .await?
            .ok_or(ChatError::NotFound("Thread"))
    }
}
