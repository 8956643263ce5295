use uuid::Uuid;

use crate::{Error, STUB_UUID};

#[derive(
    Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, serde::Deserialize, serde::Serialize,
)]
pub struct UserId(pub Uuid);

impl UserId {
    pub fn stub() -> UserId {
        UserId(STUB_UUID)
    }
}

#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct User {
    pub id: UserId,
    pub name: String,
    pub surname: String,
    pub is_admin: bool,
}

impl User {
    /// Name as it gets stamped on comments.
    pub fn display_name(&self) -> String {
        format!("{} {}", self.name, self.surname)
    }
}

#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct NewUser {
    pub id: UserId,
    pub email: String,
    pub name: String,
    pub surname: String,
    pub password: String,
    pub is_admin: bool,
}

impl NewUser {
    pub fn new(email: String, name: String, surname: String, password: String) -> NewUser {
        NewUser {
            id: UserId(Uuid::new_v4()),
            email,
            name,
            surname,
            password,
            is_admin: false,
        }
    }

    pub fn validate(&self) -> Result<(), Error> {
        crate::validate_string(&self.email)?;
        crate::validate_string(&self.name)?;
        crate::validate_string(&self.surname)?;
        crate::validate_string(&self.password)?;
        Ok(())
    }
}
