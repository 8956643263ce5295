use std::collections::BTreeMap;

use uuid::Uuid;

use crate::{AnswerId, Error, Status, UserId, STUB_UUID};

#[derive(
    Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, serde::Deserialize, serde::Serialize,
)]
pub struct FormId(pub Uuid);

impl FormId {
    pub fn stub() -> FormId {
        FormId(STUB_UUID)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    Text,
    Textarea,
    Radio,
    Checkbox,
}

#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct FieldSpec {
    pub id: String,
    pub label: String,
    pub kind: FieldKind,
    pub required: bool,
    /// Choices for radio and checkbox fields; empty for free-text kinds.
    #[serde(default)]
    pub options: Vec<String>,
}

impl FieldSpec {
    pub fn validate(&self) -> Result<(), Error> {
        crate::validate_string(&self.id)?;
        crate::validate_string(&self.label)?;
        for o in &self.options {
            crate::validate_string(o)?;
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct Form {
    pub id: FormId,
    pub owner_id: UserId,
    pub name: String,
    pub fields: Vec<FieldSpec>,
    pub closed: bool,
}

impl Form {
    /// Check an answer payload against the declared fields: every key must
    /// name a field, and required fields must carry a non-empty value.
    pub fn validate_answer(&self, fields: &BTreeMap<String, String>) -> Result<(), Error> {
        for id in fields.keys() {
            if !self.fields.iter().any(|f| f.id == *id) {
                return Err(Error::UnknownField(id.clone()));
            }
        }
        for f in self.fields.iter().filter(|f| f.required) {
            match fields.get(&f.id) {
                Some(v) if !v.is_empty() => (),
                _ => return Err(Error::MissingField(f.id.clone())),
            }
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct NewForm {
    pub id: FormId,
    pub name: String,
    pub fields: Vec<FieldSpec>,
}

impl NewForm {
    pub fn new(name: String, fields: Vec<FieldSpec>) -> NewForm {
        NewForm {
            id: FormId(Uuid::new_v4()),
            name,
            fields,
        }
    }

    pub fn validate(&self) -> Result<(), Error> {
        crate::validate_string(&self.name)?;
        for f in &self.fields {
            f.validate()?;
        }
        Ok(())
    }
}

/// Full replacement of a form's name and fields; already-submitted answers
/// are left alone, whatever the new field list says.
#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct FormPatch {
    pub name: String,
    pub fields: Vec<FieldSpec>,
}

impl FormPatch {
    pub fn validate(&self) -> Result<(), Error> {
        crate::validate_string(&self.name)?;
        for f in &self.fields {
            f.validate()?;
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct SetFormClosed {
    pub closed: bool,
}

#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct FormSummary {
    pub id: FormId,
    pub name: String,
    pub closed: bool,
}

/// Respondent-side view of the forms list: what can still be filled in, and
/// what was already submitted along with its review state.
#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct AvailableForms {
    pub available: Vec<FormSummary>,
    pub completed: Vec<CompletedForm>,
}

#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct CompletedForm {
    pub answer_id: AnswerId,
    pub form: FormSummary,
    pub status: Status,
}
