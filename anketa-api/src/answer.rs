use std::collections::BTreeMap;

use uuid::Uuid;

use crate::{Error, Form, FormId, Status, User, STUB_UUID};

#[derive(
    Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, serde::Deserialize, serde::Serialize,
)]
pub struct AnswerId(pub Uuid);

impl AnswerId {
    pub fn stub() -> AnswerId {
        AnswerId(STUB_UUID)
    }
}

/// One submission of one form, keyed by field id.
#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct Answer {
    pub id: AnswerId,
    pub form_id: FormId,
    pub owner_id: crate::UserId,
    pub fields: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct NewAnswer {
    pub id: AnswerId,
    pub form_id: FormId,
    pub fields: BTreeMap<String, String>,
}

impl NewAnswer {
    pub fn new(form_id: FormId, fields: BTreeMap<String, String>) -> NewAnswer {
        NewAnswer {
            id: AnswerId(Uuid::new_v4()),
            form_id,
            fields,
        }
    }

    pub fn validate(&self) -> Result<(), Error> {
        for (id, value) in &self.fields {
            crate::validate_string(id)?;
            crate::validate_string(value)?;
        }
        Ok(())
    }
}

/// Replacement payload for an already-submitted answer.
#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct AnswerPatch {
    pub fields: BTreeMap<String, String>,
}

impl AnswerPatch {
    pub fn validate(&self) -> Result<(), Error> {
        for (id, value) in &self.fields {
            crate::validate_string(id)?;
            crate::validate_string(value)?;
        }
        Ok(())
    }
}

/// Everything the review screen shows for one answer.
#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct AnswerDetail {
    pub answer: Answer,
    pub owner: User,
    pub form: Form,
    pub status: Status,
}
