use std::sync::Arc;

use parley_types::models::ThreadId;

use crate::error::ChatError;
use crate::identity::{CurrentUser, Identity};
use crate::store::{Store, run_blocking};

/// Decides whether an identity may read or write a thread: participants
/// only, no overrides.
pub struct AccessGuard<S> {
    store: Arc<S>,
}

impl<S> Clone for AccessGuard<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
        }
    }
}

impl<S: Store> AccessGuard<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub async fn can_access(&self, identity: &Identity, thread_id: ThreadId) -> Result<bool, ChatError> {
        let Identity::User(user) = identity else {
            return Ok(false);
        };
        let user_id = user.id;
        run_blocking(&self.store, move |store| store.is_participant(thread_id, user_id)).await
    }

    /// Resolves the caller for an operation on `thread_id`.
    ///
    /// Anonymous callers fail `Unauthenticated` before any lookup. Missing
    /// threads and threads the caller is not part of both fail `NotFound`.
    pub async fn authorize<'a>(
        &self,
        identity: &'a Identity,
        thread_id: ThreadId,
    ) -> Result<&'a CurrentUser, ChatError> {
        let user = identity.user()?;
        if self.can_access(identity, thread_id).await? {
            Ok(user)
        } else {
            Err(ChatError::NotFound("Thread"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::seeded;

    #[tokio::test]
    async fn only_participants_pass() {
        let (db, ids) = seeded(&["alice", "bob", "mallory"]);
        let (alice, bob, mallory) = (&ids[0], &ids[1], &ids[2]);
        let (thread, _) = db
            .create_thread_for_pair(alice.user().unwrap().id, bob.user().unwrap().id)
            .unwrap();
        let guard = AccessGuard::new(db);

        assert!(guard.can_access(alice, thread.id).await.unwrap());
        assert!(guard.can_access(bob, thread.id).await.unwrap());
        assert!(!guard.can_access(mallory, thread.id).await.unwrap());
        assert!(!guard.can_access(&Identity::Anonymous, thread.id).await.unwrap());

        assert_eq!(guard.authorize(bob, thread.id).await.unwrap().username, "bob");
    }

    #[tokio::test]
    async fn outsiders_and_missing_threads_look_the_same() {
        let (db, ids) = seeded(&["alice", "bob", "mallory"]);
        let (thread, _) = db
            .create_thread_for_pair(ids[0].user().unwrap().id, ids[1].user().unwrap().id)
            .unwrap();
        let guard = AccessGuard::new(db);

        let outsider = guard.authorize(&ids[2], thread.id).await.unwrap_err();
        let missing = guard.authorize(&ids[0], 404).await.unwrap_err();
        assert!(matches!(outsider, ChatError::NotFound("Thread")));
        assert!(matches!(missing, ChatError::NotFound("Thread")));

        let anonymous = guard.authorize(&Identity::Anonymous, thread.id).await.unwrap_err();
        assert!(matches!(anonymous, ChatError::Unauthenticated));
    }
}
