use std::str::FromStr;

use anyhow::{anyhow, Context};
use serde_json::json;
use uuid::Uuid;

use crate::{AnswerId, CommentPath, FormId, StatusFlags};

#[derive(Debug, Eq, PartialEq, thiserror::Error)]
pub enum Error {
    #[error("Unknown error: {0}")]
    Unknown(String),

    #[error("Permission denied")]
    PermissionDenied,

    #[error("{0} not found")]
    NotFound(String),

    #[error("Uuid already used {0}")]
    UuidAlreadyUsed(Uuid),

    #[error("Email already used {0}")]
    EmailAlreadyUsed(String),

    #[error("Form {0:?} was already answered by this user")]
    AlreadyAnswered(FormId),

    #[error("Form {0:?} is closed to new answers")]
    FormClosed(FormId),

    #[error("Answer {0:?} was modified concurrently too many times")]
    ConcurrentModification(AnswerId),

    #[error("Comment path {0:?} does not name a comment in the current tree")]
    InvalidCommentPath(CommentPath),

    #[error("More than one status flag is set in {0:?}")]
    InvalidStatusFlags(StatusFlags),

    #[error("Review submission carries neither a status nor a comment")]
    EmptyReview,

    #[error("Comment text is empty")]
    EmptyComment,

    #[error("Required field {0:?} is missing or empty")]
    MissingField(String),

    #[error("Field {0:?} is not declared by the form")]
    UnknownField(String),

    #[error("Null byte in string is not allowed {0:?}")]
    NullByteInString(String),
}

impl Error {
    pub fn status_code(&self) -> http::StatusCode {
        use http::StatusCode;
        match self {
            Error::Unknown(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::PermissionDenied => StatusCode::FORBIDDEN,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::UuidAlreadyUsed(_) => StatusCode::CONFLICT,
            Error::EmailAlreadyUsed(_) => StatusCode::CONFLICT,
            Error::AlreadyAnswered(_) => StatusCode::CONFLICT,
            Error::FormClosed(_) => StatusCode::CONFLICT,
            Error::ConcurrentModification(_) => StatusCode::CONFLICT,
            Error::InvalidCommentPath(_) => StatusCode::BAD_REQUEST,
            Error::InvalidStatusFlags(_) => StatusCode::BAD_REQUEST,
            Error::EmptyReview => StatusCode::BAD_REQUEST,
            Error::EmptyComment => StatusCode::BAD_REQUEST,
            Error::MissingField(_) => StatusCode::BAD_REQUEST,
            Error::UnknownField(_) => StatusCode::BAD_REQUEST,
            Error::NullByteInString(_) => StatusCode::BAD_REQUEST,
        }
    }

    pub fn contents(&self) -> Vec<u8> {
        serde_json::to_vec(&match self {
            Error::Unknown(msg) => json!({
                "message": msg,
                "type": "unknown",
            }),
            Error::PermissionDenied => json!({
                "message": "permission denied",
                "type": "permission-denied",
            }),
            Error::NotFound(entity) => json!({
                "message": "entity not found",
                "type": "not-found",
                "entity": entity,
            }),
            Error::UuidAlreadyUsed(u) => json!({
                "message": "uuid conflict",
                "type": "conflict-uuid",
                "uuid": u,
            }),
            Error::EmailAlreadyUsed(e) => json!({
                "message": "email already used",
                "type": "conflict-email",
                "email": e,
            }),
            Error::AlreadyAnswered(f) => json!({
                "message": "form already answered by this user",
                "type": "already-answered",
                "form": f.0,
            }),
            Error::FormClosed(f) => json!({
                "message": "form is closed to new answers",
                "type": "form-closed",
                "form": f.0,
            }),
            Error::ConcurrentModification(a) => json!({
                "message": "answer status was modified concurrently too many times",
                "type": "concurrent-modification",
                "answer": a.0,
            }),
            Error::InvalidCommentPath(p) => json!({
                "message": "comment path does not name a comment",
                "type": "invalid-comment-path",
                "path": p,
            }),
            Error::InvalidStatusFlags(f) => json!({
                "message": "more than one status flag is set",
                "type": "invalid-status-flags",
                "flags": f,
            }),
            Error::EmptyReview => json!({
                "message": "review carries neither a status nor a comment",
                "type": "empty-review",
            }),
            Error::EmptyComment => json!({
                "message": "comment text is empty",
                "type": "empty-comment",
            }),
            Error::MissingField(f) => json!({
                "message": "a required field is missing or empty",
                "type": "missing-field",
                "field": f,
            }),
            Error::UnknownField(f) => json!({
                "message": "a field is not declared by the form",
                "type": "unknown-field",
                "field": f,
            }),
            Error::NullByteInString(s) => json!({
                "message": "there was a null byte in argument string",
                "type": "null-byte",
                "string": s,
            }),
        })
        .expect("serializing error contents")
    }

    pub fn parse(body: &[u8]) -> anyhow::Result<Error> {
        let data: serde_json::Value =
            serde_json::from_slice(body).context("parsing error contents")?;
        let uuid_field = |name: &str| {
            data.get(name)
                .and_then(|u| u.as_str())
                .and_then(|u| Uuid::from_str(u).ok())
                .ok_or_else(|| anyhow!("error field {name:?} is not a proper uuid"))
        };
        let str_field = |name: &str| {
            data.get(name)
                .and_then(|s| s.as_str())
                .map(String::from)
                .ok_or_else(|| anyhow!("error field {name:?} is not a string"))
        };
        Ok(
            match data
                .get("type")
                .and_then(|t| t.as_str())
                .ok_or_else(|| anyhow!("error type is not a string"))?
            {
                "unknown" => Error::Unknown(String::from(
                    data.get("message")
                        .and_then(|msg| msg.as_str())
                        .unwrap_or(""),
                )),
                "permission-denied" => Error::PermissionDenied,
                "not-found" => Error::NotFound(str_field("entity")?),
                "conflict-uuid" => Error::UuidAlreadyUsed(uuid_field("uuid")?),
                "conflict-email" => Error::EmailAlreadyUsed(str_field("email")?),
                "already-answered" => Error::AlreadyAnswered(FormId(uuid_field("form")?)),
                "form-closed" => Error::FormClosed(FormId(uuid_field("form")?)),
                "concurrent-modification" => {
                    Error::ConcurrentModification(AnswerId(uuid_field("answer")?))
                }
                "invalid-comment-path" => Error::InvalidCommentPath(
                    data.get("path")
                        .cloned()
                        .and_then(|p| serde_json::from_value(p).ok())
                        .ok_or_else(|| anyhow!("error path is not an index list"))?,
                ),
                "invalid-status-flags" => Error::InvalidStatusFlags(
                    data.get("flags")
                        .cloned()
                        .and_then(|f| serde_json::from_value(f).ok())
                        .ok_or_else(|| anyhow!("error flags are not a bool triple"))?,
                ),
                "empty-review" => Error::EmptyReview,
                "empty-comment" => Error::EmptyComment,
                "missing-field" => Error::MissingField(str_field("field")?),
                "unknown-field" => Error::UnknownField(str_field("field")?),
                "null-byte" => Error::NullByteInString(str_field("string")?),
                _ => return Err(anyhow!("error contents has unknown type")),
            },
        )
    }
}
