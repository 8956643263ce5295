#![cfg(test)]

use anketa_api::{AnswerId, AuthToken, Error as ApiError, NewUser, Uuid};
use axum::{
    extract::FromRequestParts,
    http::{self, request},
    Router,
};
use std::panic::AssertUnwindSafe;
use tower::{Service, ServiceExt};

use crate::*;

macro_rules! do_tokio_test {
    ( $name:ident, $typ:ty, $fn:expr ) => {
        #[test]
        fn $name() {
            let runtime = AssertUnwindSafe(
                tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .expect("failed initializing tokio runtime"),
            );
            bolero::check!()
                .with_type::<$typ>()
                .cloned()
                .for_each(move |v| {
                    let () = runtime.block_on($fn(v));
                })
        }
    };
}

do_tokio_test!(fuzz_preauth_bearer, String, |token| async move {
    if let Ok(req) = http::Request::builder()
        .method(http::Method::GET)
        .uri("/")
        .header(http::header::AUTHORIZATION, token)
        .body(())
    {
        let mut req = req.into_parts().0;
        let res = PreAuth::from_request_parts(&mut req, &()).await;
        match res {
            Ok(_) => (),
            Err(Error::Api(ApiError::PermissionDenied)) => (),
            Err(e) => panic!("got unexpected error: {e}"),
        }
    }
});

do_tokio_test!(fuzz_preauth_cookie, String, |cookie| async move {
    if let Ok(req) = http::Request::builder()
        .method(http::Method::GET)
        .uri("/")
        .header(http::header::COOKIE, cookie)
        .body(())
    {
        let mut req = req.into_parts().0;
        let res = PreAuth::from_request_parts(&mut req, &()).await;
        match res {
            Ok(_) => (),
            Err(Error::Api(ApiError::PermissionDenied)) => (),
            Err(e) => panic!("got unexpected error: {e}"),
        }
    }
});

#[tokio::test]
async fn preauth_accepts_bearer_and_cookie_tokens() {
    let token = Uuid::new_v4();
    let other = Uuid::new_v4();

    let mut bearer = parts_with(http::header::AUTHORIZATION, format!("bearer {token}"));
    let res = PreAuth::from_request_parts(&mut bearer, &())
        .await
        .expect("bearer preauth");
    assert_eq!(res.0, AuthToken(token));

    let mut cookie = parts_with(http::header::COOKIE, format!("lang=ru; token={token}"));
    let res = PreAuth::from_request_parts(&mut cookie, &())
        .await
        .expect("cookie preauth");
    assert_eq!(res.0, AuthToken(token));

    // the header wins over the cookie
    let mut both = http::Request::builder()
        .uri("/")
        .header(http::header::AUTHORIZATION, format!("bearer {token}"))
        .header(http::header::COOKIE, format!("token={other}"))
        .body(())
        .expect("building request")
        .into_parts()
        .0;
    let res = PreAuth::from_request_parts(&mut both, &())
        .await
        .expect("preauth with both");
    assert_eq!(res.0, AuthToken(token));

    let mut wrong_scheme = parts_with(http::header::AUTHORIZATION, format!("basic {token}"));
    assert!(PreAuth::from_request_parts(&mut wrong_scheme, &())
        .await
        .is_err());
}

fn parts_with(header: http::header::HeaderName, value: String) -> request::Parts {
    http::Request::builder()
        .uri("/")
        .header(header, value)
        .body(())
        .expect("building request")
        .into_parts()
        .0
}

/// An app whose pool points at a closed port: anything that reaches the
/// database comes back as an internal error, anything rejected before it
/// comes back as PermissionDenied. Good enough to pin down the auth
/// perimeter without a live postgres.
fn test_app(notifier: Notifier) -> (Router, Uuid) {
    let admin_token = Uuid::new_v4();
    let pool = PgPool::new(
        sqlx::postgres::PgPoolOptions::new()
            .acquire_timeout(std::time::Duration::from_millis(250))
            .connect_lazy("postgresql://postgres@127.0.0.1:9/unreachable")
            .expect("building lazy pool"),
    );
    (app(pool, notifier, Some(AuthToken(admin_token))), admin_token)
}

async fn run(
    app: &mut Router,
    method: &str,
    uri: &str,
    token: Option<Uuid>,
    body: serde_json::Value,
) -> (http::StatusCode, Vec<u8>) {
    let req = request::Builder::new()
        .method(method)
        .uri(uri)
        .header(http::header::CONTENT_TYPE, "application/json");
    let req = match token {
        Some(token) => req.header(http::header::AUTHORIZATION, format!("bearer {token}")),
        None => req,
    };
    let req = req
        .body(axum::body::Body::from(
            serde_json::to_vec(&body).expect("serializing request body to json"),
        ))
        .expect("building request");
    app.ready().await.expect("waiting for app to be ready");
    let resp = app.call(req).await.expect("running request");
    let status = resp.status();
    let body = hyper::body::to_bytes(resp.into_body())
        .await
        .expect("recovering resp bytes")
        .to_vec();
    (status, body)
}

#[tokio::test]
async fn unauthenticated_requests_are_rejected() {
    let (mut app, _) = test_app(Notifier::buffer());
    for (method, uri) in [
        ("POST", "/api/unauth"),
        ("GET", "/api/whoami"),
        ("POST", "/api/forms"),
        ("GET", "/api/forms/mine"),
        ("GET", "/api/forms/available"),
        ("GET", "/api/form/4be327e4-9a48-4aae-a2a6-e39440ac50b6"),
        ("POST", "/api/answers"),
        (
            "POST",
            "/api/answer/4be327e4-9a48-4aae-a2a6-e39440ac50b6/review",
        ),
    ] {
        let (status, body) = run(&mut app, method, uri, None, serde_json::json!({})).await;
        assert_eq!(status, http::StatusCode::FORBIDDEN, "{method} {uri}");
        assert_eq!(
            ApiError::parse(&body).expect("parsing error body"),
            ApiError::PermissionDenied,
            "{method} {uri}"
        );
    }
}

#[tokio::test]
async fn garbage_tokens_are_rejected() {
    let (mut app, _) = test_app(Notifier::buffer());
    let req = request::Builder::new()
        .method("GET")
        .uri("/api/whoami")
        .header(http::header::AUTHORIZATION, "bearer not-a-uuid")
        .body(axum::body::Body::empty())
        .expect("building request");
    app.ready().await.expect("waiting for app to be ready");
    let resp = app.call(req).await.expect("running request");
    assert_eq!(resp.status(), http::StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn register_needs_no_token() {
    let (mut app, _) = test_app(Notifier::buffer());
    let (status, _) = run(
        &mut app,
        "POST",
        "/api/register",
        None,
        serde_json::json!({}),
    )
    .await;
    // not turned away at the door: the request died on the dead pool
    assert_eq!(status, http::StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn cookie_sessions_reach_the_database() {
    let (mut app, _) = test_app(Notifier::buffer());
    let req = request::Builder::new()
        .method("GET")
        .uri("/api/whoami")
        .header(http::header::COOKIE, format!("token={}", Uuid::new_v4()))
        .body(axum::body::Body::empty())
        .expect("building request");
    app.ready().await.expect("waiting for app to be ready");
    let resp = app.call(req).await.expect("running request");
    assert_eq!(resp.status(), http::StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn admin_routes_check_the_token_before_the_database() {
    let (mut app, admin_token) = test_app(Notifier::buffer());

    let (status, body) = run(
        &mut app,
        "POST",
        "/api/admin/create-user",
        Some(Uuid::new_v4()),
        serde_json::json!({}),
    )
    .await;
    assert_eq!(status, http::StatusCode::FORBIDDEN);
    assert_eq!(
        ApiError::parse(&body).expect("parsing error body"),
        ApiError::PermissionDenied
    );

    let user = NewUser::new(
        String::from("admin@example.com"),
        String::from("Anna"),
        String::from("Orlova"),
        String::from("hunter2"),
    );
    let (status, _) = run(
        &mut app,
        "POST",
        "/api/admin/create-user",
        Some(admin_token),
        serde_json::to_value(&user).expect("serializing user"),
    )
    .await;
    assert_eq!(status, http::StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn error_responses_carry_parseable_bodies() {
    use axum::response::IntoResponse;
    let cases = vec![
        (Error::permission_denied(), http::StatusCode::FORBIDDEN),
        (Error::not_found("answer"), http::StatusCode::NOT_FOUND),
        (
            Error::Api(ApiError::ConcurrentModification(AnswerId::stub())),
            http::StatusCode::CONFLICT,
        ),
        (
            Error::Anyhow(anyhow::anyhow!("boom")),
            http::StatusCode::INTERNAL_SERVER_ERROR,
        ),
    ];
    for (err, expected) in cases {
        let resp = err.into_response();
        assert_eq!(resp.status(), expected);
        let body = hyper::body::to_bytes(resp.into_body())
            .await
            .expect("recovering resp bytes");
        let parsed = ApiError::parse(&body).expect("parsing error body");
        assert_eq!(parsed.status_code(), expected);
    }
}
