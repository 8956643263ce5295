use anketa_api::{AuthToken, Uuid};
use anyhow::Context;
use axum::{
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use structopt::StructOpt;

mod db;
mod error;
mod extractors;
mod fuzz;
mod handlers;
mod notify;

pub use error::Error;
pub use extractors::*;
pub use notify::Notifier;

pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!();

#[derive(Debug, StructOpt)]
#[structopt(
    name = "anketa-server",
    about = "HTTP server for the anketa form review service"
)]
struct Opt {
    /// Address to listen on
    #[structopt(long, default_value = "0.0.0.0:3000")]
    bind: SocketAddr,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opt = Opt::from_args();
    tracing_subscriber::fmt::init();

    let db_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    let db = create_sqlx_pool(&db_url).await?;
    {
        let mut conn = db.acquire().await?;
        MIGRATOR
            .run(&mut *conn)
            .await
            .context("running pending migrations")?;
    }

    let admin_token = admin_token_from_env()?;
    if admin_token.is_none() {
        tracing::warn!("ADMIN_TOKEN is not set, admin endpoints will refuse all requests");
    }
    let notifier = Notifier::from_env()?;

    let app = app(db, notifier, admin_token);
    tracing::info!("listening on {}", opt.bind);
    axum::Server::bind(&opt.bind)
        .serve(app.into_make_service())
        .await
        .context("serving axum webserver")
}

pub async fn create_sqlx_pool(db_url: &str) -> anyhow::Result<PgPool> {
    Ok(PgPool::new(
        sqlx::postgres::PgPoolOptions::new()
            .max_connections(8)
            .connect(db_url)
            .await
            .with_context(|| format!("opening database {:?}", db_url))?,
    ))
}

fn admin_token_from_env() -> anyhow::Result<Option<AuthToken>> {
    match std::env::var("ADMIN_TOKEN") {
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(err).context("retrieving ADMIN_TOKEN environment variable"),
        Ok(tok) => Ok(Some(AuthToken(
            Uuid::try_parse(&tok).context("parsing ADMIN_TOKEN as an auth token")?,
        ))),
    }
}

pub fn app(db: PgPool, notifier: Notifier, admin_token: Option<AuthToken>) -> Router {
    let state = AppState {
        db,
        notifier,
        admin_token,
    };
    Router::new()
        .route("/api/register", post(handlers::register))
        .route("/api/auth", post(handlers::auth))
        .route("/api/admin/create-user", post(handlers::admin_create_user))
        .route("/api/unauth", post(handlers::unauth))
        .route("/api/whoami", get(handlers::whoami))
        .route("/api/forms", post(handlers::create_form))
        .route("/api/forms/mine", get(handlers::fetch_own_forms))
        .route("/api/forms/available", get(handlers::fetch_available_forms))
        .route(
            "/api/form/:form_id",
            get(handlers::fetch_form).put(handlers::update_form),
        )
        .route("/api/form/:form_id/closed", post(handlers::set_form_closed))
        .route(
            "/api/form/:form_id/answers",
            get(handlers::fetch_form_answers),
        )
        .route("/api/answers", post(handlers::submit_answer))
        .route(
            "/api/answer/:answer_id",
            get(handlers::fetch_answer).put(handlers::edit_answer),
        )
        .route("/api/answer/:answer_id/review", post(handlers::submit_review))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}
