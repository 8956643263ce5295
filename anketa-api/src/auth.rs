use uuid::Uuid;

use crate::{Error, STUB_UUID};

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct AuthToken(pub Uuid);

impl AuthToken {
    pub fn stub() -> AuthToken {
        AuthToken(STUB_UUID)
    }
}

#[derive(Clone, Debug, bolero::generator::TypeGenerator, serde::Deserialize, serde::Serialize)]
pub struct NewSession {
    pub email: String,
    pub password: String,
    pub device: String,
}

impl NewSession {
    pub fn validate(&self) -> Result<(), Error> {
        crate::validate_string(&self.email)?;
        crate::validate_string(&self.password)?;
        crate::validate_string(&self.device)?;
        Ok(())
    }
}

/// What the caller may do with one answer, resolved against the live data at
/// request time.
#[derive(Clone, Copy, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct AuthInfo {
    pub can_read: bool,
    pub can_comment: bool,
    pub can_review: bool,
}

impl AuthInfo {
    pub fn for_roles(is_owner: bool, is_reviewer: bool) -> AuthInfo {
        AuthInfo {
            can_read: is_owner || is_reviewer,
            can_comment: is_owner || is_reviewer,
            can_review: is_reviewer,
        }
    }

    pub fn none() -> AuthInfo {
        Self::for_roles(false, false)
    }
}
