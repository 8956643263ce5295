use async_trait::async_trait;

use crate::{AnswerId, AuthInfo, FormId, Status, UserId};

/// Storage revision of one status row, bumped on every successful write so
/// concurrent writers can detect each other.
pub type Revision = i64;

/// Answer facts the review flow needs besides the status row itself.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AnswerMeta {
    pub form_id: FormId,
    pub form_name: String,
    pub owner_id: UserId,
    pub owner_email: String,
}

/// What the review flow needs from a backing store. Implemented over
/// postgres by the server and over in-memory maps by the mock.
#[async_trait]
pub trait ReviewDb {
    fn current_user(&self) -> UserId;

    /// All-false when the answer does not exist.
    async fn auth_info_for(&mut self, answer: AnswerId) -> anyhow::Result<AuthInfo>;

    async fn answer_meta(&mut self, answer: AnswerId) -> anyhow::Result<Option<AnswerMeta>>;

    async fn display_name(&mut self, user: UserId) -> anyhow::Result<String>;

    async fn load_status(&mut self, answer: AnswerId)
        -> anyhow::Result<Option<(Status, Revision)>>;

    /// Write `status` back only if the row is still at revision `expect`;
    /// returns whether the write won.
    async fn store_status(
        &mut self,
        answer: AnswerId,
        expect: Revision,
        status: &Status,
    ) -> anyhow::Result<bool>;
}
