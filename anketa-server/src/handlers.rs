use anketa_api::{
    AnswerDetail, AnswerId, AnswerPatch, AuthToken, AvailableForms, Form, FormId, FormPatch,
    FormSummary, NewAnswer, NewForm, NewSession, NewUser, ReviewSubmit, SetFormClosed, Status,
    User, UserId,
};
use anyhow::Context;
use axum::{
    extract::{Path, State},
    Json,
};

use crate::{db, extractors::*, Error, Notifier};

pub async fn register(mut conn: PgConn, Json(data): Json<NewUser>) -> Result<(), Error> {
    data.validate()?;
    // Whatever the caller sent, self-registration never grants admin.
    db::create_user(
        &mut *conn,
        NewUser {
            is_admin: false,
            ..data
        },
    )
    .await
}

pub async fn admin_create_user(
    AdminAuth: AdminAuth,
    mut conn: PgConn,
    Json(data): Json<NewUser>,
) -> Result<(), Error> {
    data.validate()?;
    db::create_user(&mut *conn, data).await
}

pub async fn auth(
    mut conn: PgConn,
    Json(data): Json<NewSession>,
) -> Result<Json<AuthToken>, Error> {
    data.validate()?;
    Ok(Json(
        db::login_user(&mut *conn, &data)
            .await
            .context("logging user in")?
            .ok_or(Error::permission_denied())?,
    ))
}

pub async fn unauth(user: PreAuth, mut conn: PgConn) -> Result<(), Error> {
    match db::logout_user(&mut *conn, &user.0).await {
        Ok(true) => Ok(()),
        Ok(false) => Err(Error::permission_denied()),
        Err(e) => Err(Error::Anyhow(e)),
    }
}

pub async fn whoami(Auth(user): Auth, mut conn: PgConn) -> Result<Json<User>, Error> {
    Ok(Json(
        db::fetch_user(&mut *conn, user)
            .await
            .with_context(|| format!("fetching user {:?}", user))?
            .ok_or(Error::permission_denied())?,
    ))
}

pub async fn create_form(
    Auth(user): Auth,
    mut conn: PgConn,
    Json(data): Json<NewForm>,
) -> Result<(), Error> {
    data.validate()?;
    if !db::is_admin(&mut *conn, user)
        .await
        .context("checking admin rights")?
    {
        return Err(Error::permission_denied());
    }
    db::create_form(&mut *conn, user, data).await
}

pub async fn update_form(
    Auth(user): Auth,
    Path(form): Path<FormId>,
    mut conn: PgConn,
    Json(data): Json<FormPatch>,
) -> Result<(), Error> {
    data.validate()?;
    require_form_owner(&mut *conn, user, form).await?;
    db::update_form(&mut *conn, form, &data).await?;
    Ok(())
}

pub async fn set_form_closed(
    Auth(user): Auth,
    Path(form): Path<FormId>,
    mut conn: PgConn,
    Json(data): Json<SetFormClosed>,
) -> Result<(), Error> {
    require_form_owner(&mut *conn, user, form).await?;
    db::set_form_closed(&mut *conn, form, data.closed).await?;
    Ok(())
}

pub async fn fetch_form(
    Auth(user): Auth,
    Path(form): Path<FormId>,
    mut conn: PgConn,
) -> Result<Json<Form>, Error> {
    Ok(Json(
        db::fetch_form(&mut *conn, form)
            .await
            .with_context(|| format!("fetching form {:?} for {:?}", form, user))?
            .ok_or_else(|| Error::not_found("form"))?,
    ))
}

pub async fn fetch_own_forms(
    Auth(user): Auth,
    mut conn: PgConn,
) -> Result<Json<Vec<FormSummary>>, Error> {
    Ok(Json(
        db::fetch_forms_owned_by(&mut *conn, user)
            .await
            .with_context(|| format!("fetching form list of {:?}", user))?,
    ))
}

pub async fn fetch_available_forms(
    Auth(user): Auth,
    mut conn: PgConn,
) -> Result<Json<AvailableForms>, Error> {
    Ok(Json(
        db::fetch_available_forms(&mut *conn, user)
            .await
            .with_context(|| format!("fetching available forms for {:?}", user))?,
    ))
}

pub async fn submit_answer(
    Auth(user): Auth,
    mut conn: PgConn,
    Json(data): Json<NewAnswer>,
) -> Result<(), Error> {
    data.validate()?;
    db::submit_answer(&mut *conn, user, data).await
}

pub async fn edit_answer(
    Auth(user): Auth,
    Path(answer): Path<AnswerId>,
    mut conn: PgConn,
    Json(data): Json<AnswerPatch>,
) -> Result<(), Error> {
    data.validate()?;
    db::edit_answer(&mut *conn, user, answer, data).await
}

pub async fn fetch_answer(
    Auth(user): Auth,
    Path(answer): Path<AnswerId>,
    mut conn: PgConn,
) -> Result<Json<AnswerDetail>, Error> {
    let detail = db::fetch_answer_detail(&mut *conn, answer)
        .await
        .with_context(|| format!("fetching detail of answer {:?}", answer))?
        .ok_or_else(|| Error::not_found("answer"))?;
    if detail.answer.owner_id != user
        && detail.form.owner_id != user
        && !db::is_admin(&mut *conn, user)
            .await
            .context("checking admin rights")?
    {
        return Err(Error::permission_denied());
    }
    Ok(Json(detail))
}

pub async fn fetch_form_answers(
    Auth(user): Auth,
    Path(form): Path<FormId>,
    mut conn: PgConn,
) -> Result<Json<Vec<AnswerDetail>>, Error> {
    let form = require_form_owner(&mut *conn, user, form).await?;
    Ok(Json(
        db::fetch_form_answers(&mut *conn, &form)
            .await
            .with_context(|| format!("listing answers of form {:?}", form.id))?,
    ))
}

pub async fn submit_review(
    Auth(user): Auth,
    State(notifier): State<Notifier>,
    Path(answer): Path<AnswerId>,
    mut conn: PgConn,
    Json(sub): Json<ReviewSubmit>,
) -> Result<Json<Status>, Error> {
    let mut db = db::PostgresDb {
        conn: &mut *conn,
        user,
    };
    let outcome = anketa_api::submit_review(&mut db, answer, sub)
        .await
        .with_context(|| format!("submitting review on answer {:?}", answer))??;
    if let Some(n) = outcome.notification {
        notifier.send(n);
    }
    Ok(Json(outcome.status))
}

/// Form-level mutations and listings are for the form owner or an admin.
/// A missing form reports NotFound even to non-owners, forms are not
/// secret here.
async fn require_form_owner(
    conn: &mut sqlx::PgConnection,
    user: UserId,
    form: FormId,
) -> Result<Form, Error> {
    let form = db::fetch_form(&mut *conn, form)
        .await
        .context("fetching form")?
        .ok_or_else(|| Error::not_found("form"))?;
    if form.owner_id != user
        && !db::is_admin(&mut *conn, user)
            .await
            .context("checking admin rights")?
    {
        return Err(Error::permission_denied());
    }
    Ok(form)
}
