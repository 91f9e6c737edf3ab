// End-to-end request pipeline: built-in interceptors, auth, body parsing and error envelopes
mod common;

#[cfg(test)]
mod test {
    use std::time::Duration;

    use async_trait::async_trait;
    use axum::body::Body;
    use bytes::Bytes;
    use http::StatusCode;
    use http_body_util::BodyExt;
    use keel::{
        AuthResult, AuthStrategy, Request, Server,
        core::{AuthOptions, PayloadOptions, Route, Router, handler_fn},
    };
    use serde_json::{Value, json};

    use crate::common::{local_config, send, start};

    struct TokenHeader;

    #[async_trait]
    impl AuthStrategy for TokenHeader {
        async fn authenticate(&self, req: &Request) -> eyre::Result<AuthResult> {
            Ok(match req.header("authorization") {
                Some("Bearer good") => AuthResult::authenticated("alice"),
                _ => AuthResult::unauthenticated(),
            })
        }
    }

    fn api() -> Router {
        Router::new("api", "/api")
            .route(Route::get(
                "/users/{id:\\d+}",
                handler_fn(|req, res| {
                    let id = req.param("id").unwrap_or_default().to_string();
                    res.text(StatusCode::OK, id)?;
                    Ok(())
                }),
            ))
            .route(
                Route::get(
                    "/me",
                    handler_fn(|req, res| {
                        let principal = req.auth().principal.clone().unwrap_or_default();
                        res.text(StatusCode::OK, principal)?;
                        Ok(())
                    }),
                )
                .auth(AuthOptions::required(&["token"])),
            )
            .route(Route::post(
                "/echo",
                handler_fn(|req, res| {
                    res.json(StatusCode::OK, &req.payload().to_value())?;
                    Ok(())
                }),
            ))
            .route(
                Route::post(
                    "/upload",
                    handler_fn(|req, res| {
                        let form = req
                            .payload()
                            .as_multipart()
                            .ok_or_else(|| keel::HttpError::bad_request("expected a form"))?;
                        let summary = json!({
                            "title": form.field("title"),
                            "files": form.files.iter().map(|f| f.size()).collect::<Vec<_>>(),
                        });
                        res.json(StatusCode::OK, &summary)?;
                        Ok(())
                    }),
                )
                .payload(PayloadOptions::default().with_max_bytes(256)),
            )
    }

    fn builder() -> keel::ServerBuilder {
        Server::builder(local_config(Duration::from_secs(1), Duration::from_secs(1)))
            .router(api())
            .strategy("token", TokenHeader)
    }

    async fn body_json(res: http::Response<Body>) -> Value {
        let bytes = res.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_params_and_request_id_over_tcp() {
        let (server, addr) = start(builder()).await;

        let res = send(addr, "GET", "/api/users/42", &[], "").await;
        assert_eq!(res.status, 200);
        assert_eq!(res.body, "42");
        assert!(res.header("x-request-id").is_some());

        // constraint rejects non-digits, so the router fallback answers
        let res = send(addr, "GET", "/api/users/abc", &[], "").await;
        assert_eq!(res.status, 404);
        let envelope: Value = serde_json::from_str(&res.body).unwrap();
        assert_eq!(envelope["status"], 404);

        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_auth_required_route() {
        let (server, addr) = start(builder()).await;

        let res = send(addr, "GET", "/api/me", &[], "").await;
        assert_eq!(res.status, 401);

        let res = send(addr, "GET", "/api/me", &[("Authorization", "Bearer wrong")], "").await;
        assert_eq!(res.status, 401);

        let res = send(addr, "GET", "/api/me", &[("Authorization", "Bearer good")], "").await;
        assert_eq!(res.status, 200);
        assert_eq!(res.body, "alice");

        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_method_not_allowed_lists_methods() {
        let (server, addr) = start(builder()).await;

        let res = send(addr, "DELETE", "/api/echo", &[], "").await;
        assert_eq!(res.status, 405);
        assert_eq!(res.header("allow"), Some("POST"));

        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_json_echo_and_trailing_slash_redirect() {
        let (server, addr) = start(builder()).await;

        let res = send(
            addr,
            "POST",
            "/api/echo",
            &[("Content-Type", "application/json")],
            r#"{"name":"keel","tags":[1,2]}"#,
        )
        .await;
        assert_eq!(res.status, 200);
        let echoed: Value = serde_json::from_str(&res.body).unwrap();
        assert_eq!(echoed, json!({"name": "keel", "tags": [1, 2]}));

        let res = send(addr, "GET", "/api/users/7/?x=1", &[], "").await;
        assert_eq!(res.status, 308);
        assert_eq!(res.header("location"), Some("/api/users/7?x=1"));

        let res = send(
            addr,
            "POST",
            "/api/echo",
            &[("Content-Type", "application/json")],
            "{not json",
        )
        .await;
        assert_eq!(res.status, 400);

        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_streamed_upload_over_limit_is_413() {
        let server = builder().build().unwrap();

        let chunks: Vec<Result<Bytes, std::io::Error>> =
            (0..32).map(|_| Ok(Bytes::from_static(b"0123456789abcdef"))).collect();
        let req = http::Request::post("/api/upload")
            .header("content-type", "multipart/form-data; boundary=X")
            .body(Body::from_stream(futures_util::stream::iter(chunks)))
            .unwrap();

        let res = server.dispatcher().handle(req, None).await;
        assert_eq!(res.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(body_json(res).await["status"], 413);
    }

    #[tokio::test]
    async fn test_multipart_fields_and_files() {
        let server = builder().build().unwrap();

        let body = "--X\r\n\
            Content-Disposition: form-data; name=\"title\"\r\n\r\n\
            hi\r\n\
            --X\r\n\
            Content-Disposition: form-data; name=\"doc\"; filename=\"a.txt\"\r\n\
            Content-Type: text/plain\r\n\r\n\
            abcd\r\n\
            --X--\r\n";
        let req = http::Request::post("/api/upload")
            .header("content-type", "multipart/form-data; boundary=X")
            .body(Body::from(body))
            .unwrap();

        let res = server.dispatcher().handle(req, None).await;
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(body_json(res).await, json!({"title": "hi", "files": [4]}));
    }
}
