//! Conversation cache
//!
//! Maps conversation reads onto [`CacheEngine`] and conversation writes onto
//! [`PendingInvalidation`] units. The store is reached only on a miss, through
//! [`ConversationStore`].
//!
//! ## Cache Keys
//!
//! - `CONVERSATION:{owner}-{conversation}`: one conversation record
//! - `CONVERSATION_IDS:{owner}`: every conversation id of an owner
//! - `CONVERSATION_IDS_HASH:{owner}`: fingerprint of the above
//! - `CONVERSATION_HAS_READ_SEQ:{owner}-{conversation}`: read sequence
//! - `RECV_MSG_OPT:{owner}-{conversation}`: receive-message option
//! - `SUPER_GROUP_RECV_MSG_NOT_NOTIFY_USER_IDS:{group}` and its `_HASH`
//! - `CONVERSATION_NOT_RECEIVE_MESSAGE_USER_IDS:{conversation}`
//!
//! An index and its fingerprint are always invalidated together: deleting
//! an id list also queues its hash key.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::BoxError;
use crate::{CacheEngine, CacheError, PendingInvalidation, fingerprint};

/// Key builders for the conversation namespace
pub mod keys {
    use crate::CacheKey;

    pub const CONVERSATION: &str = "CONVERSATION:";
    pub const CONVERSATION_IDS: &str = "CONVERSATION_IDS:";
    pub const CONVERSATION_IDS_HASH: &str = "CONVERSATION_IDS_HASH:";
    pub const CONVERSATION_HAS_READ_SEQ: &str = "CONVERSATION_HAS_READ_SEQ:";
    pub const RECV_MSG_OPT: &str = "RECV_MSG_OPT:";
    pub const SUPER_GROUP_RECV_MSG_NOT_NOTIFY_USER_IDS: &str =
        "SUPER_GROUP_RECV_MSG_NOT_NOTIFY_USER_IDS:";
    pub const SUPER_GROUP_RECV_MSG_NOT_NOTIFY_USER_IDS_HASH: &str =
        "SUPER_GROUP_RECV_MSG_NOT_NOTIFY_USER_IDS_HASH:";
    pub const CONVERSATION_NOT_RECEIVE_MESSAGE_USER_IDS: &str =
        "CONVERSATION_NOT_RECEIVE_MESSAGE_USER_IDS:";

    pub fn conversation(owner_user_id: &str, conversation_id: &str) -> CacheKey {
        CacheKey::build(CONVERSATION, &[owner_user_id, conversation_id])
    }

    pub fn conversation_ids(owner_user_id: &str) -> CacheKey {
        CacheKey::build(CONVERSATION_IDS, &[owner_user_id])
    }

    pub fn conversation_ids_hash(owner_user_id: &str) -> CacheKey {
        CacheKey::build(CONVERSATION_IDS_HASH, &[owner_user_id])
    }

    pub fn has_read_seq(owner_user_id: &str, conversation_id: &str) -> CacheKey {
        CacheKey::build(CONVERSATION_HAS_READ_SEQ, &[owner_user_id, conversation_id])
    }

    pub fn recv_msg_opt(owner_user_id: &str, conversation_id: &str) -> CacheKey {
        CacheKey::build(RECV_MSG_OPT, &[owner_user_id, conversation_id])
    }

    pub fn super_group_not_notify_user_ids(group_id: &str) -> CacheKey {
        CacheKey::build(SUPER_GROUP_RECV_MSG_NOT_NOTIFY_USER_IDS, &[group_id])
    }

    pub fn super_group_not_notify_user_ids_hash(group_id: &str) -> CacheKey {
        CacheKey::build(SUPER_GROUP_RECV_MSG_NOT_NOTIFY_USER_IDS_HASH, &[group_id])
    }

    pub fn not_receive_message_user_ids(conversation_id: &str) -> CacheKey {
        CacheKey::build(CONVERSATION_NOT_RECEIVE_MESSAGE_USER_IDS, &[conversation_id])
    }
}

/// A user's view of one conversation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub owner_user_id: String,
    pub conversation_id: String,
    pub conversation_type: i32,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub group_id: String,
    #[serde(default)]
    pub recv_msg_opt: i32,
    #[serde(default)]
    pub is_pinned: bool,
    #[serde(default)]
    pub is_private_chat: bool,
    #[serde(default)]
    pub burn_duration: i32,
    #[serde(default)]
    pub group_at_type: i32,
    #[serde(default)]
    pub attached_info: String,
    #[serde(default)]
    pub ex: String,
    #[serde(default)]
    pub max_seq: i64,
    #[serde(default)]
    pub min_seq: i64,
    /// Creation time, milliseconds since the Unix epoch
    #[serde(default)]
    pub create_time: i64,
}

/// Store adapter consulted on cache misses.
///
/// `Ok(None)` means the store confirmed the record does not exist and is
/// cached as such; `Err` is a transient failure and is never cached. List
/// lookups return an empty list rather than `None`.
#[async_trait]
pub trait ConversationStore: Send + Sync + 'static {
    /// Load one conversation by owner and id
    async fn take(
        &self,
        owner_user_id: &str,
        conversation_id: &str,
    ) -> Result<Option<Conversation>, BoxError>;

    /// Load every conversation id owned by a user
    async fn find_user_conversation_ids(&self, owner_user_id: &str)
    -> Result<Vec<String>, BoxError>;

    /// Load the receive-message option of a user for a conversation
    async fn get_user_recv_msg_opt(
        &self,
        owner_user_id: &str,
        conversation_id: &str,
    ) -> Result<Option<i32>, BoxError>;

    /// Load users of a super group who receive messages without notification
    async fn find_super_group_recv_msg_not_notify_user_ids(
        &self,
        group_id: &str,
    ) -> Result<Vec<String>, BoxError>;

    /// Load users who do not receive messages of a conversation
    async fn get_conversation_not_receive_message_user_ids(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<String>, BoxError>;
}

/// Conversation cache over a shared [`CacheEngine`]
pub struct ConversationCache<S: ConversationStore> {
    engine: CacheEngine,
    store: Arc<S>,
    ttl: Duration,
}

impl<S: ConversationStore> Clone for ConversationCache<S> {
    fn clone(&self) -> Self {
        Self {
            engine: self.engine.clone(),
            store: Arc::clone(&self.store),
            ttl: self.ttl,
        }
    }
}

impl<S: ConversationStore> ConversationCache<S> {
    /// Create a conversation cache using the engine's default TTL
    pub fn new(engine: CacheEngine, store: Arc<S>) -> Self {
        let ttl = engine.config().default_ttl;
        Self { engine, store, ttl }
    }

    /// Override the TTL of positive entries
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn engine(&self) -> &CacheEngine {
        &self.engine
    }

    /// Get every conversation id owned by a user
    pub async fn get_user_conversation_ids(
        &self,
        owner_user_id: &str,
    ) -> Result<Vec<String>, CacheError> {
        self.engine
            .get_or_fetch(&keys::conversation_ids(owner_user_id), self.ttl, || async {
                self.store
                    .find_user_conversation_ids(owner_user_id)
                    .await
                    .map(Some)
            })
            .await
    }

    /// Queue the id lists of `owner_user_ids`, and their fingerprints, for deletion
    pub fn del_conversation_ids(&self, owner_user_ids: &[&str]) -> PendingInvalidation {
        owner_user_ids
            .iter()
            .fold(self.engine.pending(), |pending, id| {
                pending.with_linked([keys::conversation_ids(id), keys::conversation_ids_hash(id)])
            })
    }

    /// Get the fingerprint of a user's conversation ids.
    ///
    /// The ids are read from the store, never from a cached copy, so the
    /// shared fingerprint always describes the list as it was stored.
    pub async fn get_user_conversation_ids_hash(
        &self,
        owner_user_id: &str,
    ) -> Result<u64, CacheError> {
        self.engine
            .get_or_fetch(
                &keys::conversation_ids_hash(owner_user_id),
                self.ttl,
                || async {
                    let ids = self.store.find_user_conversation_ids(owner_user_id).await?;
                    Ok::<_, BoxError>(Some(fingerprint(&ids)))
                },
            )
            .await
    }

    /// Queue only the fingerprints of `owner_user_ids` for deletion
    pub fn del_user_conversation_ids_hash(&self, owner_user_ids: &[&str]) -> PendingInvalidation {
        self.engine.pending().with(
            owner_user_ids
                .iter()
                .map(|id| keys::conversation_ids_hash(id)),
        )
    }

    /// Get one conversation
    pub async fn get_conversation(
        &self,
        owner_user_id: &str,
        conversation_id: &str,
    ) -> Result<Conversation, CacheError> {
        self.engine
            .get_or_fetch(
                &keys::conversation(owner_user_id, conversation_id),
                self.ttl,
                || self.store.take(owner_user_id, conversation_id),
            )
            .await
    }

    /// Queue conversations of one owner for deletion
    pub fn del_conversations(
        &self,
        owner_user_id: &str,
        conversation_ids: &[&str],
    ) -> PendingInvalidation {
        self.engine.pending().with(
            conversation_ids
                .iter()
                .map(|id| keys::conversation(owner_user_id, id)),
        )
    }

    /// Queue one conversation as seen by several owners for deletion
    pub fn del_users_conversation(
        &self,
        conversation_id: &str,
        owner_user_ids: &[&str],
    ) -> PendingInvalidation {
        self.engine.pending().with(
            owner_user_ids
                .iter()
                .map(|owner| keys::conversation(owner, conversation_id)),
        )
    }

    /// Get several conversations of one owner.
    ///
    /// Conversations the store does not have are left out; any other failure
    /// fails the call with `PartialBatchFailure`.
    pub async fn get_conversations(
        &self,
        owner_user_id: &str,
        conversation_ids: &[String],
    ) -> Result<Vec<Conversation>, CacheError> {
        self.engine
            .get_or_fetch_many(
                conversation_ids,
                self.ttl,
                |id| keys::conversation(owner_user_id, id),
                |id: String| async move { self.store.take(owner_user_id, &id).await },
            )
            .await?
            .into_found()
    }

    /// Get every conversation of one owner
    pub async fn get_user_all_conversations(
        &self,
        owner_user_id: &str,
    ) -> Result<Vec<Conversation>, CacheError> {
        let conversation_ids = self.get_user_conversation_ids(owner_user_id).await?;
        self.get_conversations(owner_user_id, &conversation_ids)
            .await
    }

    /// Get a user's receive-message option for a conversation
    pub async fn get_user_recv_msg_opt(
        &self,
        owner_user_id: &str,
        conversation_id: &str,
    ) -> Result<i32, CacheError> {
        self.engine
            .get_or_fetch(
                &keys::recv_msg_opt(owner_user_id, conversation_id),
                self.ttl,
                || self.store.get_user_recv_msg_opt(owner_user_id, conversation_id),
            )
            .await
    }

    pub fn del_user_recv_msg_opt(
        &self,
        owner_user_id: &str,
        conversation_id: &str,
    ) -> PendingInvalidation {
        self.engine
            .pending()
            .with([keys::recv_msg_opt(owner_user_id, conversation_id)])
    }

    /// Get users of a super group who receive messages without notification
    pub async fn get_super_group_recv_msg_not_notify_user_ids(
        &self,
        group_id: &str,
    ) -> Result<Vec<String>, CacheError> {
        self.engine
            .get_or_fetch(
                &keys::super_group_not_notify_user_ids(group_id),
                self.ttl,
                || async {
                    self.store
                        .find_super_group_recv_msg_not_notify_user_ids(group_id)
                        .await
                        .map(Some)
                },
            )
            .await
    }

    /// Queue a super group's not-notify list, and its fingerprint, for deletion
    pub fn del_super_group_recv_msg_not_notify_user_ids(
        &self,
        group_id: &str,
    ) -> PendingInvalidation {
        self.engine.pending().with_linked([
            keys::super_group_not_notify_user_ids(group_id),
            keys::super_group_not_notify_user_ids_hash(group_id),
        ])
    }

    /// Get the fingerprint of a super group's not-notify list, read from the store
    pub async fn get_super_group_recv_msg_not_notify_user_ids_hash(
        &self,
        group_id: &str,
    ) -> Result<u64, CacheError> {
        self.engine
            .get_or_fetch(
                &keys::super_group_not_notify_user_ids_hash(group_id),
                self.ttl,
                || async {
                    let user_ids = self
                        .store
                        .find_super_group_recv_msg_not_notify_user_ids(group_id)
                        .await?;
                    Ok::<_, BoxError>(Some(fingerprint(&user_ids)))
                },
            )
            .await
    }

    pub fn del_super_group_recv_msg_not_notify_user_ids_hash(
        &self,
        group_id: &str,
    ) -> PendingInvalidation {
        self.engine
            .pending()
            .with([keys::super_group_not_notify_user_ids_hash(group_id)])
    }

    /// Queue a user's read sequences for the given conversations for deletion
    pub fn del_user_all_has_read_seqs(
        &self,
        owner_user_id: &str,
        conversation_ids: &[&str],
    ) -> PendingInvalidation {
        self.engine.pending().with(
            conversation_ids
                .iter()
                .map(|id| keys::has_read_seq(owner_user_id, id)),
        )
    }

    /// Get users who do not receive messages of a conversation
    pub async fn get_conversation_not_receive_message_user_ids(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<String>, CacheError> {
        self.engine
            .get_or_fetch(
                &keys::not_receive_message_user_ids(conversation_id),
                self.ttl,
                || async {
                    self.store
                        .get_conversation_not_receive_message_user_ids(conversation_id)
                        .await
                        .map(Some)
                },
            )
            .await
    }

    pub fn del_conversation_not_receive_message_user_ids(
        &self,
        conversation_ids: &[&str],
    ) -> PendingInvalidation {
        self.engine.pending().with(
            conversation_ids
                .iter()
                .map(|id| keys::not_receive_message_user_ids(id)),
        )
    }
}
