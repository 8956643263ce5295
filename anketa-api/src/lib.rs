use chrono::Utc;

mod answer;
mod auth;
mod comment;
mod db;
mod error;
mod form;
mod review;
mod status;
mod user;

pub use answer::{Answer, AnswerDetail, AnswerId, AnswerPatch, NewAnswer};
pub use auth::{AuthInfo, AuthToken, NewSession};
pub use comment::{Comment, CommentPath, CommentTree};
pub use db::{AnswerMeta, ReviewDb, Revision};
pub use error::Error;
pub use form::{
    AvailableForms, CompletedForm, FieldKind, FieldSpec, Form, FormId, FormPatch, FormSummary,
    NewForm, SetFormClosed,
};
pub use review::{submit_review, Notification, ReviewOutcome, ReviewSubmit, MAX_SUBMIT_ATTEMPTS};
pub use status::{RawStatus, ReviewState, Status, StatusFlags};
pub use user::{NewUser, User, UserId};

pub use uuid::{uuid, Uuid};
pub type Time = chrono::DateTime<Utc>;

pub const STUB_UUID: Uuid = uuid!("ffffffff-ffff-ffff-ffff-ffffffffffff");

/// Postgres TEXT columns cannot hold NUL bytes, so reject them at the API
/// boundary rather than on insertion.
pub(crate) fn validate_string(s: &str) -> Result<(), Error> {
    if s.contains('\0') {
        return Err(Error::NullByteInString(s.to_string()));
    }
    Ok(())
}
