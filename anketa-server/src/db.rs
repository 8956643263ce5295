use anketa_api::{
    Answer, AnswerDetail, AnswerId, AnswerMeta, AnswerPatch, AuthInfo, AuthToken, AvailableForms,
    CommentTree, CompletedForm, FieldSpec, Form, FormId, FormPatch, FormSummary, NewAnswer,
    NewForm, NewSession, NewUser, ReviewDb, ReviewState, Revision, Status, StatusFlags, User,
    UserId, Uuid,
};
use anyhow::Context;
use axum::async_trait;
use chrono::Utc;
use futures::TryStreamExt;
use sqlx::{types::Json, Connection, Row};
use std::collections::BTreeMap;

use crate::Error;

// The cost the original deployment used; DEFAULT_COST would double the
// login latency for no benefit at this threat model.
const BCRYPT_COST: u32 = 10;

pub async fn create_user(conn: &mut sqlx::PgConnection, u: NewUser) -> Result<(), Error> {
    let email_taken = sqlx::query("SELECT id FROM users WHERE email = $1")
        .bind(&u.email)
        .fetch_optional(&mut *conn)
        .await
        .context("checking for email conflicts")?;
    if email_taken.is_some() {
        return Err(Error::email_already_used(u.email));
    }
    let id_taken = sqlx::query("SELECT id FROM users WHERE id = $1")
        .bind(u.id.0)
        .fetch_optional(&mut *conn)
        .await
        .context("checking for uuid conflicts")?;
    if id_taken.is_some() {
        return Err(Error::uuid_already_used(u.id.0));
    }
    let hash = bcrypt::hash(&u.password, BCRYPT_COST).context("hashing password")?;
    sqlx::query("INSERT INTO users VALUES ($1, $2, $3, $4, $5, $6)")
        .bind(u.id.0)
        .bind(&u.email)
        .bind(&u.name)
        .bind(&u.surname)
        .bind(&hash)
        .bind(u.is_admin)
        .execute(&mut *conn)
        .await
        .with_context(|| format!("inserting user {:?}", u.id))?;
    Ok(())
}

pub async fn login_user(
    conn: &mut sqlx::PgConnection,
    s: &NewSession,
) -> anyhow::Result<Option<AuthToken>> {
    let user = sqlx::query("SELECT id, password FROM users WHERE email = $1")
        .bind(&s.email)
        .fetch_optional(&mut *conn)
        .await
        .context("querying users table")?;
    let user = match user {
        None => return Ok(None),
        Some(u) => u,
    };
    let hash: String = user
        .try_get("password")
        .context("retrieving the password field")?;
    if !bcrypt::verify(&s.password, &hash).context("verifying password")? {
        return Ok(None);
    }
    let token = AuthToken(Uuid::new_v4());
    let now = Utc::now().naive_utc();
    sqlx::query("INSERT INTO sessions VALUES ($1, $2, $3, $4, $5)")
        .bind(token.0)
        .bind(user.try_get::<Uuid, _>("id").context("retrieving the id field")?)
        .bind(&s.device)
        .bind(now)
        .bind(now)
        .execute(&mut *conn)
        .await
        .context("inserting session")?;
    Ok(Some(token))
}

pub async fn logout_user(conn: &mut sqlx::PgConnection, token: &AuthToken) -> anyhow::Result<bool> {
    let res = sqlx::query("DELETE FROM sessions WHERE token = $1")
        .bind(token.0)
        .execute(conn)
        .await
        .context("deleting session")?;
    Ok(res.rows_affected() > 0)
}

pub async fn recover_session(
    conn: &mut sqlx::PgConnection,
    token: AuthToken,
) -> Result<UserId, Error> {
    let row = sqlx::query("UPDATE sessions SET last_active = $1 WHERE token = $2 RETURNING user_id")
        .bind(Utc::now().naive_utc())
        .bind(token.0)
        .fetch_optional(conn)
        .await
        .context("recovering session")?;
    match row {
        None => Err(Error::permission_denied()),
        Some(r) => Ok(UserId(
            r.try_get("user_id")
                .context("retrieving the user_id field")?,
        )),
    }
}

pub async fn fetch_user(conn: &mut sqlx::PgConnection, user: UserId) -> anyhow::Result<Option<User>> {
    let row = sqlx::query("SELECT name, surname, is_admin FROM users WHERE id = $1")
        .bind(user.0)
        .fetch_optional(conn)
        .await
        .context("querying users table")?;
    Ok(match row {
        None => None,
        Some(r) => Some(User {
            id: user,
            name: r.try_get("name").context("retrieving the name field")?,
            surname: r
                .try_get("surname")
                .context("retrieving the surname field")?,
            is_admin: r
                .try_get("is_admin")
                .context("retrieving the is_admin field")?,
        }),
    })
}

pub async fn is_admin(conn: &mut sqlx::PgConnection, user: UserId) -> anyhow::Result<bool> {
    let row = sqlx::query("SELECT is_admin FROM users WHERE id = $1")
        .bind(user.0)
        .fetch_optional(conn)
        .await
        .context("querying users table")?;
    Ok(match row {
        None => false,
        Some(r) => r
            .try_get("is_admin")
            .context("retrieving the is_admin field")?,
    })
}

pub async fn create_form(
    conn: &mut sqlx::PgConnection,
    owner: UserId,
    f: NewForm,
) -> Result<(), Error> {
    let id_taken = sqlx::query("SELECT id FROM forms WHERE id = $1")
        .bind(f.id.0)
        .fetch_optional(&mut *conn)
        .await
        .context("checking for uuid conflicts")?;
    if id_taken.is_some() {
        return Err(Error::uuid_already_used(f.id.0));
    }
    sqlx::query("INSERT INTO forms VALUES ($1, $2, $3, $4, false)")
        .bind(f.id.0)
        .bind(owner.0)
        .bind(&f.name)
        .bind(Json(&f.fields))
        .execute(&mut *conn)
        .await
        .with_context(|| format!("inserting form {:?}", f.id))?;
    Ok(())
}

pub async fn fetch_form(conn: &mut sqlx::PgConnection, form: FormId) -> anyhow::Result<Option<Form>> {
    let row = sqlx::query("SELECT owner_id, name, fields, closed FROM forms WHERE id = $1")
        .bind(form.0)
        .fetch_optional(conn)
        .await
        .context("querying forms table")?;
    Ok(match row {
        None => None,
        Some(r) => {
            let fields: Json<Vec<FieldSpec>> = r
                .try_get("fields")
                .context("retrieving the fields field")?;
            Some(Form {
                id: form,
                owner_id: UserId(
                    r.try_get("owner_id")
                        .context("retrieving the owner_id field")?,
                ),
                name: r.try_get("name").context("retrieving the name field")?,
                fields: fields.0,
                closed: r.try_get("closed").context("retrieving the closed field")?,
            })
        }
    })
}

pub async fn update_form(
    conn: &mut sqlx::PgConnection,
    form: FormId,
    p: &FormPatch,
) -> anyhow::Result<()> {
    let res = sqlx::query("UPDATE forms SET name = $2, fields = $3 WHERE id = $1")
        .bind(form.0)
        .bind(&p.name)
        .bind(Json(&p.fields))
        .execute(conn)
        .await
        .with_context(|| format!("updating form {:?}", form))?;
    anyhow::ensure!(
        res.rows_affected() == 1,
        "update of form {:?} affected {} rows",
        form,
        res.rows_affected()
    );
    Ok(())
}

pub async fn set_form_closed(
    conn: &mut sqlx::PgConnection,
    form: FormId,
    closed: bool,
) -> anyhow::Result<()> {
    let res = sqlx::query("UPDATE forms SET closed = $2 WHERE id = $1")
        .bind(form.0)
        .bind(closed)
        .execute(conn)
        .await
        .with_context(|| format!("updating form {:?}", form))?;
    anyhow::ensure!(
        res.rows_affected() == 1,
        "update of form {:?} affected {} rows",
        form,
        res.rows_affected()
    );
    Ok(())
}

pub async fn fetch_forms_owned_by(
    conn: &mut sqlx::PgConnection,
    owner: UserId,
) -> anyhow::Result<Vec<FormSummary>> {
    let mut rows = sqlx::query("SELECT id, name, closed FROM forms WHERE owner_id = $1 ORDER BY name")
        .bind(owner.0)
        .fetch(conn);
    let mut res = Vec::new();
    while let Some(r) = rows.try_next().await.context("querying forms table")? {
        res.push(summary_from_row(&r)?);
    }
    Ok(res)
}

pub async fn fetch_available_forms(
    conn: &mut sqlx::PgConnection,
    user: UserId,
) -> anyhow::Result<AvailableForms> {
    let mut rows = sqlx::query(
        "
            SELECT f.id, f.name, f.closed, a.id AS answer_id,
                   s.approved, s.waiting, s.edits_required, s.comments, s.revision
                FROM forms f
            LEFT JOIN answers a
                ON a.form_id = f.id
                AND a.owner_id = $1
            LEFT JOIN statuses s
                ON s.answer_id = a.id
            ORDER BY f.name
        ",
    )
    .bind(user.0)
    .fetch(conn);
    let mut res = AvailableForms {
        available: Vec::new(),
        completed: Vec::new(),
    };
    while let Some(r) = rows.try_next().await.context("querying forms table")? {
        let form = summary_from_row(&r)?;
        match r
            .try_get::<Option<Uuid>, _>("answer_id")
            .context("retrieving the answer_id field")?
        {
            None => res.available.push(form),
            Some(answer) => res.completed.push(CompletedForm {
                answer_id: AnswerId(answer),
                form,
                status: status_from_row(&r)?.0,
            }),
        }
    }
    Ok(res)
}

pub async fn submit_answer(
    conn: &mut sqlx::PgConnection,
    owner: UserId,
    a: NewAnswer,
) -> Result<(), Error> {
    let form = fetch_form(&mut *conn, a.form_id)
        .await
        .context("fetching form")?
        .ok_or_else(|| Error::not_found("form"))?;
    if form.closed {
        return Err(Error::form_closed(form.id));
    }
    form.validate_answer(&a.fields)?;
    let answered = sqlx::query("SELECT id FROM answers WHERE form_id = $1 AND owner_id = $2")
        .bind(a.form_id.0)
        .bind(owner.0)
        .fetch_optional(&mut *conn)
        .await
        .context("checking for a previous answer")?;
    if answered.is_some() {
        return Err(Error::already_answered(a.form_id));
    }
    let id_taken = sqlx::query("SELECT id FROM answers WHERE id = $1")
        .bind(a.id.0)
        .fetch_optional(&mut *conn)
        .await
        .context("checking for uuid conflicts")?;
    if id_taken.is_some() {
        return Err(Error::uuid_already_used(a.id.0));
    }
    // The status row must exist as soon as the answer is visible, the
    // review flow has no lazy-creation path.
    let mut tx = conn.begin().await.context("beginning transaction")?;
    sqlx::query("INSERT INTO answers VALUES ($1, $2, $3, $4, $5)")
        .bind(a.id.0)
        .bind(a.form_id.0)
        .bind(owner.0)
        .bind(Json(&a.fields))
        .bind(Utc::now().naive_utc())
        .execute(&mut *tx)
        .await
        .with_context(|| format!("inserting answer {:?}", a.id))?;
    sqlx::query("INSERT INTO statuses (answer_id) VALUES ($1)")
        .bind(a.id.0)
        .execute(&mut *tx)
        .await
        .with_context(|| format!("inserting status row for answer {:?}", a.id))?;
    tx.commit().await.context("committing answer")?;
    Ok(())
}

pub async fn edit_answer(
    conn: &mut sqlx::PgConnection,
    user: UserId,
    answer: AnswerId,
    p: AnswerPatch,
) -> Result<(), Error> {
    let a = fetch_answer(&mut *conn, answer)
        .await
        .context("fetching answer")?
        .ok_or_else(|| Error::not_found("answer"))?;
    if a.owner_id != user {
        return Err(Error::permission_denied());
    }
    let form = fetch_form(&mut *conn, a.form_id)
        .await
        .context("fetching form")?
        .with_context(|| format!("answer {:?} references a missing form", answer))?;
    form.validate_answer(&p.fields)?;
    // Unconditional write: an owner edit outranks any concurrent review,
    // so it takes no part in the revision protocol beyond bumping it.
    let mut tx = conn.begin().await.context("beginning transaction")?;
    sqlx::query("UPDATE answers SET fields = $2 WHERE id = $1")
        .bind(answer.0)
        .bind(Json(&p.fields))
        .execute(&mut *tx)
        .await
        .with_context(|| format!("updating answer {:?}", answer))?;
    sqlx::query(
        "
            UPDATE statuses
            SET approved = false, waiting = true, edits_required = false,
                revision = revision + 1
            WHERE answer_id = $1
        ",
    )
    .bind(answer.0)
    .execute(&mut *tx)
    .await
    .with_context(|| format!("resetting status of answer {:?}", answer))?;
    tx.commit().await.context("committing answer edit")?;
    Ok(())
}

pub async fn fetch_answer(
    conn: &mut sqlx::PgConnection,
    answer: AnswerId,
) -> anyhow::Result<Option<Answer>> {
    let row = sqlx::query("SELECT form_id, owner_id, fields FROM answers WHERE id = $1")
        .bind(answer.0)
        .fetch_optional(conn)
        .await
        .context("querying answers table")?;
    Ok(match row {
        None => None,
        Some(r) => Some(answer_from_row(answer, &r)?),
    })
}

pub async fn fetch_answer_detail(
    conn: &mut sqlx::PgConnection,
    answer: AnswerId,
) -> anyhow::Result<Option<AnswerDetail>> {
    let row = sqlx::query(
        "
            SELECT a.form_id, a.owner_id, a.fields,
                   u.name, u.surname, u.is_admin,
                   f.owner_id AS form_owner_id, f.name AS form_name,
                   f.fields AS form_fields, f.closed,
                   s.approved, s.waiting, s.edits_required, s.comments, s.revision
                FROM answers a
            INNER JOIN users u
                ON u.id = a.owner_id
            INNER JOIN forms f
                ON f.id = a.form_id
            INNER JOIN statuses s
                ON s.answer_id = a.id
            WHERE a.id = $1
        ",
    )
    .bind(answer.0)
    .fetch_optional(conn)
    .await
    .context("querying answers table")?;
    let r = match row {
        None => return Ok(None),
        Some(r) => r,
    };
    let a = answer_from_row(answer, &r)?;
    let owner = User {
        id: a.owner_id,
        name: r.try_get("name").context("retrieving the name field")?,
        surname: r
            .try_get("surname")
            .context("retrieving the surname field")?,
        is_admin: r
            .try_get("is_admin")
            .context("retrieving the is_admin field")?,
    };
    let form_fields: Json<Vec<FieldSpec>> = r
        .try_get("form_fields")
        .context("retrieving the form_fields field")?;
    let form = Form {
        id: a.form_id,
        owner_id: UserId(
            r.try_get("form_owner_id")
                .context("retrieving the form_owner_id field")?,
        ),
        name: r
            .try_get("form_name")
            .context("retrieving the form_name field")?,
        fields: form_fields.0,
        closed: r.try_get("closed").context("retrieving the closed field")?,
    };
    let (status, _) = status_from_row(&r)?;
    Ok(Some(AnswerDetail {
        answer: a,
        owner,
        form,
        status,
    }))
}

pub async fn fetch_form_answers(
    conn: &mut sqlx::PgConnection,
    form: &Form,
) -> anyhow::Result<Vec<AnswerDetail>> {
    let mut rows = sqlx::query(
        "
            SELECT a.id, a.owner_id, a.fields,
                   u.name, u.surname, u.is_admin,
                   s.approved, s.waiting, s.edits_required, s.comments, s.revision
                FROM answers a
            INNER JOIN users u
                ON u.id = a.owner_id
            INNER JOIN statuses s
                ON s.answer_id = a.id
            WHERE a.form_id = $1
            ORDER BY u.surname, u.name
        ",
    )
    .bind(form.id.0)
    .fetch(conn);
    let mut res = Vec::new();
    while let Some(r) = rows.try_next().await.context("querying answers table")? {
        let owner_id = UserId(
            r.try_get("owner_id")
                .context("retrieving the owner_id field")?,
        );
        let fields: Json<BTreeMap<String, String>> = r
            .try_get("fields")
            .context("retrieving the fields field")?;
        res.push(AnswerDetail {
            answer: Answer {
                id: AnswerId(r.try_get("id").context("retrieving the id field")?),
                form_id: form.id,
                owner_id,
                fields: fields.0,
            },
            owner: User {
                id: owner_id,
                name: r.try_get("name").context("retrieving the name field")?,
                surname: r
                    .try_get("surname")
                    .context("retrieving the surname field")?,
                is_admin: r
                    .try_get("is_admin")
                    .context("retrieving the is_admin field")?,
            },
            form: form.clone(),
            status: status_from_row(&r)?.0,
        });
    }
    Ok(res)
}

pub async fn load_status(
    conn: &mut sqlx::PgConnection,
    answer: AnswerId,
) -> anyhow::Result<Option<(Status, Revision)>> {
    let row = sqlx::query(
        "SELECT approved, waiting, edits_required, comments, revision
            FROM statuses WHERE answer_id = $1",
    )
    .bind(answer.0)
    .fetch_optional(conn)
    .await
    .context("querying statuses table")?;
    Ok(match row {
        None => None,
        Some(r) => Some(status_from_row(&r)?),
    })
}

fn summary_from_row(r: &sqlx::postgres::PgRow) -> anyhow::Result<FormSummary> {
    Ok(FormSummary {
        id: FormId(r.try_get("id").context("retrieving the id field")?),
        name: r.try_get("name").context("retrieving the name field")?,
        closed: r.try_get("closed").context("retrieving the closed field")?,
    })
}

fn answer_from_row(id: AnswerId, r: &sqlx::postgres::PgRow) -> anyhow::Result<Answer> {
    let fields: Json<BTreeMap<String, String>> = r
        .try_get("fields")
        .context("retrieving the fields field")?;
    Ok(Answer {
        id,
        form_id: FormId(
            r.try_get("form_id")
                .context("retrieving the form_id field")?,
        ),
        owner_id: UserId(
            r.try_get("owner_id")
                .context("retrieving the owner_id field")?,
        ),
        fields: fields.0,
    })
}

fn status_from_row(r: &sqlx::postgres::PgRow) -> anyhow::Result<(Status, Revision)> {
    let flags = StatusFlags {
        approved: r
            .try_get("approved")
            .context("retrieving the approved field")?,
        waiting: r
            .try_get("waiting")
            .context("retrieving the waiting field")?,
        edits_required: r
            .try_get("edits_required")
            .context("retrieving the edits_required field")?,
    };
    // The table has CHECK constraints for this, so hitting it means the
    // database was edited behind our back.
    let state = ReviewState::try_from(flags)
        .map_err(|err| anyhow::anyhow!("status row holds an impossible flag triple: {err}"))?;
    let comments: Json<CommentTree> = r
        .try_get("comments")
        .context("retrieving the comments field")?;
    let revision = r
        .try_get("revision")
        .context("retrieving the revision field")?;
    Ok((
        Status {
            state,
            comments: comments.0,
        },
        revision,
    ))
}

pub struct PostgresDb<'a> {
    pub conn: &'a mut sqlx::PgConnection,
    pub user: UserId,
}

#[async_trait]
impl ReviewDb for PostgresDb<'_> {
    fn current_user(&self) -> UserId {
        self.user
    }

    async fn auth_info_for(&mut self, answer: AnswerId) -> anyhow::Result<AuthInfo> {
        let auth = sqlx::query(
            "
                SELECT a.owner_id, f.owner_id AS form_owner_id, u.is_admin
                    FROM answers a
                INNER JOIN forms f
                    ON f.id = a.form_id
                INNER JOIN users u
                    ON u.id = $2
                WHERE a.id = $1
            ",
        )
        .bind(answer.0)
        .bind(self.user.0)
        .fetch_all(&mut *self.conn)
        .await
        .with_context(|| {
            format!(
                "checking permissions of user {:?} on answer {:?}",
                self.user, answer
            )
        })?;
        match &auth[..] {
            [] => Ok(AuthInfo::none()),
            [r] => {
                let owner = UserId(
                    r.try_get("owner_id")
                        .context("retrieving the owner_id field")?,
                );
                let form_owner = UserId(
                    r.try_get("form_owner_id")
                        .context("retrieving the form_owner_id field")?,
                );
                let admin: bool = r
                    .try_get("is_admin")
                    .context("retrieving the is_admin field")?;
                Ok(AuthInfo::for_roles(
                    owner == self.user,
                    form_owner == self.user || admin,
                ))
            }
            _ => Err(anyhow::anyhow!(
                "query returned multiple lines for answer {:?} and user {:?}",
                answer,
                self.user
            )),
        }
    }

    async fn answer_meta(&mut self, answer: AnswerId) -> anyhow::Result<Option<AnswerMeta>> {
        let row = sqlx::query(
            "
                SELECT a.owner_id, f.id AS form_id, f.name AS form_name, u.email
                    FROM answers a
                INNER JOIN forms f
                    ON f.id = a.form_id
                INNER JOIN users u
                    ON u.id = a.owner_id
                WHERE a.id = $1
            ",
        )
        .bind(answer.0)
        .fetch_optional(&mut *self.conn)
        .await
        .context("querying answers table")?;
        Ok(match row {
            None => None,
            Some(r) => Some(AnswerMeta {
                form_id: FormId(
                    r.try_get("form_id")
                        .context("retrieving the form_id field")?,
                ),
                form_name: r
                    .try_get("form_name")
                    .context("retrieving the form_name field")?,
                owner_id: UserId(
                    r.try_get("owner_id")
                        .context("retrieving the owner_id field")?,
                ),
                owner_email: r.try_get("email").context("retrieving the email field")?,
            }),
        })
    }

    async fn display_name(&mut self, user: UserId) -> anyhow::Result<String> {
        let u = fetch_user(&mut *self.conn, user)
            .await?
            .with_context(|| format!("no user {:?} in database", user))?;
        Ok(u.display_name())
    }

    async fn load_status(&mut self, answer: AnswerId) -> anyhow::Result<Option<(Status, Revision)>> {
        load_status(&mut *self.conn, answer).await
    }

    async fn store_status(
        &mut self,
        answer: AnswerId,
        expect: Revision,
        status: &Status,
    ) -> anyhow::Result<bool> {
        let flags = status.state.flags();
        let res = sqlx::query(
            "
                UPDATE statuses
                SET approved = $2, waiting = $3, edits_required = $4,
                    comments = $5, revision = revision + 1
                WHERE answer_id = $1
                AND revision = $6
            ",
        )
        .bind(answer.0)
        .bind(flags.approved)
        .bind(flags.waiting)
        .bind(flags.edits_required)
        .bind(Json(&status.comments))
        .bind(expect)
        .execute(&mut *self.conn)
        .await
        .with_context(|| format!("storing status of answer {:?}", answer))?;
        Ok(res.rows_affected() == 1)
    }
}
