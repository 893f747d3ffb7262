//! In-memory user set with kick-off on removal

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::core::proxy::{MemoryUser, UserManager};
use crate::core::SessionManager;
use crate::error::UserError;
use crate::logger::log;

/// User set keyed by email
///
/// Removing a user (directly or through [`UserStore::update`]) cancels the
/// user's live sessions when a [`SessionManager`] is attached.
#[derive(Debug, Clone, Default)]
pub struct UserStore {
    users: Arc<RwLock<HashMap<String, MemoryUser>>>,
    sessions: Option<SessionManager>,
}

impl UserStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sessions(sessions: SessionManager) -> Self {
        Self {
            users: Arc::default(),
            sessions: Some(sessions),
        }
    }

    pub async fn get(&self, email: &str) -> Option<MemoryUser> {
        self.users.read().await.get(email).cloned()
    }

    pub async fn contains(&self, email: &str) -> bool {
        self.users.read().await.contains_key(email)
    }

    pub async fn user_count(&self) -> usize {
        self.users.read().await.len()
    }

    /// Replace the whole set, kicking users that disappeared.
    ///
    /// Returns (added, removed, kicked).
    pub async fn update(&self, new_users: &[MemoryUser]) -> (usize, usize, usize) {
        let mut users = self.users.write().await;

        let new_emails: HashSet<&str> = new_users.iter().map(|u| u.email.as_str()).collect();
        let removed: Vec<String> = users
            .keys()
            .filter(|email| !new_emails.contains(email.as_str()))
            .cloned()
            .collect();
        let added = new_emails
            .iter()
            .filter(|email| !users.contains_key(**email))
            .count();

        let mut kicked = 0;
        for email in &removed {
            kicked += self.kick(email);
        }

        *users = new_users
            .iter()
            .map(|u| (u.email.clone(), u.clone()))
            .collect();

        if added > 0 || !removed.is_empty() {
            log::info!(
                added = added,
                removed = removed.len(),
                kicked = kicked,
                total = users.len(),
                "Users updated"
            );
        }

        (added, removed.len(), kicked)
    }

    fn kick(&self, email: &str) -> usize {
        let kicked = self
            .sessions
            .as_ref()
            .map_or(0, |sessions| sessions.kick_user(email));
        if kicked > 0 {
            log::info!(email = email, kicked = kicked, "User removed and kicked");
        }
        kicked
    }
}

fn valid_email(email: &str) -> bool {
    !email.is_empty() && !email.chars().any(|c| c.is_whitespace() || c.is_control())
}

#[async_trait]
impl UserManager for UserStore {
    async fn add_user(&self, user: MemoryUser) -> Result<(), UserError> {
        if !valid_email(&user.email) {
            return Err(UserError::InvalidEmail(user.email));
        }
        let mut users = self.users.write().await;
        if users.contains_key(&user.email) {
            return Err(UserError::AlreadyExists(user.email));
        }
        log::debug!(email = %user.email, level = user.level, "User added");
        users.insert(user.email.clone(), user);
        Ok(())
    }

    async fn remove_user(&self, email: &str) -> Result<(), UserError> {
        if self.users.write().await.remove(email).is_none() {
            return Err(UserError::NotFound(email.to_string()));
        }
        self.kick(email);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(email: &str) -> MemoryUser {
        MemoryUser::new(email)
    }

    #[tokio::test]
    async fn test_add_and_remove() {
        let store = UserStore::new();
        store.add_user(user("a@example.com")).await.unwrap();
        assert!(store.contains("a@example.com").await);
        assert_eq!(store.user_count().await, 1);

        store.remove_user("a@example.com").await.unwrap();
        assert!(!store.contains("a@example.com").await);
    }

    #[tokio::test]
    async fn test_duplicate_add_keeps_original() {
        let store = UserStore::new();
        let mut first = user("a@example.com");
        first.level = 1;
        store.add_user(first).await.unwrap();

        let err = store.add_user(user("a@example.com")).await.unwrap_err();
        assert_eq!(err, UserError::AlreadyExists("a@example.com".to_string()));
        assert_eq!(store.user_count().await, 1);
        assert_eq!(store.get("a@example.com").await.unwrap().level, 1);
    }

    #[tokio::test]
    async fn test_remove_unknown_is_not_found() {
        let store = UserStore::new();
        let err = store.remove_user("ghost@example.com").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_invalid_email_rejected() {
        let store = UserStore::new();
        assert!(matches!(
            store.add_user(user("")).await,
            Err(UserError::InvalidEmail(_))
        ));
        assert!(matches!(
            store.add_user(user("a b@example.com")).await,
            Err(UserError::InvalidEmail(_))
        ));
        assert_eq!(store.user_count().await, 0);
    }

    #[tokio::test]
    async fn test_remove_kicks_sessions() {
        let sessions = SessionManager::new();
        let store = UserStore::with_sessions(sessions.clone());
        store.add_user(user("a@example.com")).await.unwrap();

        let session = sessions.register("in", None).with_user("a@example.com");
        let other = sessions.register("in", None).with_user("b@example.com");

        store.remove_user("a@example.com").await.unwrap();
        assert!(session.is_cancelled());
        assert!(!other.is_cancelled());
    }

    #[tokio::test]
    async fn test_update_diff() {
        let sessions = SessionManager::new();
        let store = UserStore::with_sessions(sessions.clone());
        store
            .update(&[user("a@example.com"), user("b@example.com")])
            .await;

        let session_b = sessions.register("in", None).with_user("b@example.com");
        let (added, removed, kicked) = store
            .update(&[user("a@example.com"), user("c@example.com")])
            .await;

        assert_eq!((added, removed, kicked), (1, 1, 1));
        assert!(session_b.is_cancelled());
        assert!(store.contains("c@example.com").await);
        assert!(!store.contains("b@example.com").await);
    }

    #[tokio::test]
    async fn test_concurrent_adds() {
        let store = UserStore::new();
        let handles: Vec<_> = (0..10)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move { store.add_user(user(&format!("u{}@example.com", i))).await })
            })
            .collect();
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert_eq!(store.user_count().await, 10);
    }
}
