// Server lifecycle: start, drain, socket close and provider teardown
mod common;

#[cfg(test)]
mod test {
    use std::{
        sync::{
            Arc,
            atomic::{AtomicUsize, Ordering},
        },
        time::Duration,
    };

    use async_trait::async_trait;
    use axum::body::Body;
    use http::StatusCode;
    use keel::{
        DataProvider, Server,
        core::{Route, Router, async_handler_fn},
        utils::ServerState,
    };
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpStream,
    };

    use crate::common::{local_config, send, start};

    #[derive(Default)]
    struct Counters {
        created: AtomicUsize,
        destroyed: AtomicUsize,
    }

    struct CountingProvider(Arc<Counters>);

    #[async_trait]
    impl DataProvider for CountingProvider {
        fn name(&self) -> &str {
            "counting"
        }

        async fn create(&self) -> eyre::Result<()> {
            self.0.created.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn destroy(&self) -> eyre::Result<()> {
            self.0.destroyed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn slow_router(delay: Duration) -> Router {
        Router::new("slow", "").route(Route::get(
            "/slow",
            async_handler_fn(move |_req, res| {
                Box::pin(async move {
                    tokio::time::sleep(delay).await;
                    res.text(StatusCode::OK, "done")?;
                    Ok(())
                })
            }),
        ))
    }

    async fn wait_for_in_flight(server: &Server, count: usize) {
        for _ in 0..200 {
            if server.connection_tracker().in_flight_count() == count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("in-flight count never reached {count}");
    }

    #[tokio::test]
    async fn test_concurrent_shutdown_tears_down_once() {
        let counters = Arc::new(Counters::default());
        let builder = Server::builder(local_config(Duration::from_millis(200), Duration::from_millis(200)))
            .provider(CountingProvider(counters.clone()));
        let (server, _addr) = start(builder).await;
        assert_eq!(server.state(), ServerState::Listening);
        assert_eq!(counters.created.load(Ordering::SeqCst), 1);

        let (first, second) = tokio::join!(server.shutdown(), server.shutdown());
        assert_ne!(first.already_stopping, second.already_stopping);
        assert_eq!(counters.destroyed.load(Ordering::SeqCst), 1);
        assert_eq!(server.state(), ServerState::Stopped);

        let third = server.shutdown().await;
        assert!(third.already_stopping);
        assert_eq!(counters.destroyed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_in_flight_request_drains_before_stop() {
        let builder = Server::builder(local_config(Duration::from_secs(2), Duration::from_secs(1)))
            .router(slow_router(Duration::from_millis(200)));
        let (server, addr) = start(builder).await;

        let client = tokio::spawn(async move { send(addr, "GET", "/slow", &[], "").await });
        wait_for_in_flight(&server, 1).await;

        let report = server.shutdown().await;
        assert!(report.drained);
        assert_eq!(report.residual_requests, 0);
        assert_eq!(report.sockets_forced, 0);

        let res = client.await.unwrap();
        assert_eq!(res.status, 200);
        assert_eq!(res.body, "done");

        // the listener is gone
        assert!(TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn test_grace_period_expiry_forces_sockets_closed() {
        let builder = Server::builder(local_config(Duration::from_millis(100), Duration::from_millis(100)))
            .router(slow_router(Duration::from_secs(10)));
        let (server, addr) = start(builder).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /slow HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .await
            .unwrap();
        wait_for_in_flight(&server, 1).await;

        let report = server.shutdown().await;
        assert!(!report.drained);
        assert_eq!(report.residual_requests, 1);
        assert_eq!(report.sockets_forced, 1);
        assert_eq!(server.state(), ServerState::Stopped);

        // the forced close ends the stream without a response
        let mut buf = Vec::new();
        let read = tokio::time::timeout(Duration::from_secs(2), stream.read_to_end(&mut buf))
            .await
            .unwrap();
        assert!(read.is_err() || buf.is_empty());
    }

    #[tokio::test]
    async fn test_requests_after_shutdown_get_503() {
        let builder = Server::builder(local_config(Duration::from_millis(100), Duration::from_millis(100)))
            .router(slow_router(Duration::ZERO));
        let (server, _addr) = start(builder).await;
        server.shutdown().await;

        let req = http::Request::get("/slow").body(Body::empty()).unwrap();
        let res = server.dispatcher().handle(req, None).await;
        assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(res.headers()[http::header::CONNECTION], "close");
    }

    #[tokio::test]
    async fn test_second_start_is_rejected() {
        let builder = Server::builder(local_config(Duration::from_millis(100), Duration::from_millis(100)));
        let (server, _addr) = start(builder).await;
        assert!(server.start().await.is_err());
        assert_eq!(server.state(), ServerState::Listening);
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_trigger_shutdown_ends_run_until_signal() {
        let builder = Server::builder(local_config(Duration::from_millis(100), Duration::from_millis(100)));
        let server = Arc::new(builder.build().unwrap());

        let runner = {
            let server = server.clone();
            tokio::spawn(async move { server.run_until_signal().await })
        };
        for _ in 0..200 {
            if server.state() == ServerState::Listening {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        server.trigger_shutdown();

        let report = runner.await.unwrap().unwrap();
        assert!(report.drained);
        assert_eq!(server.state(), ServerState::Stopped);
    }
}
