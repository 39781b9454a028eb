mod common;

use std::time::{Duration, Instant};

use futures::FutureExt;
use futures::future;
use http::StatusCode;
use onion_web::{HttpHandler, ServerState, handler_fn};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use common::{is_closed, read_response, start_server, test_config};

fn slow(delay: Duration) -> impl HttpHandler {
    handler_fn(move |ctx, _next| {
        async move {
            if ctx.path() == "/slow" {
                tokio::time::sleep(delay).await;
            }
            let path = ctx.path().to_string();
            ctx.set_status(StatusCode::OK);
            ctx.set_body(path);
            Ok(())
        }
        .boxed()
    })
}

#[tokio::test]
async fn idle_connections_close_and_busy_ones_finish() {
    let config = test_config().with_shutdown_delay(Duration::from_millis(200));
    let (server, addr) = start_server(config, slow(Duration::from_millis(400))).await;

    let mut idle = TcpStream::connect(addr).await.unwrap();
    let mut busy = TcpStream::connect(addr).await.unwrap();
    busy.write_all(b"GET /slow HTTP/1.1\r\nHost: localhost\r\n\r\n").await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(server.open_connections(), 2);
    assert_eq!(server.in_flight_requests(), 1);

    let started = Instant::now();
    let clients = async {
        // still served while the shutdown delay runs, then closed
        let mut late = TcpStream::connect(addr).await.unwrap();
        late.write_all(b"GET /late HTTP/1.1\r\nHost: localhost\r\n\r\n").await.unwrap();
        let late_response = read_response(&mut late).await.unwrap();
        assert_eq!(late_response.text(), "/late");
        assert!(is_closed(&mut late).await);

        assert!(is_closed(&mut idle).await);
        let idle_closed_after = started.elapsed();

        let response = read_response(&mut busy).await.unwrap();
        assert!(is_closed(&mut busy).await);
        (idle_closed_after, response)
    };

    let ((), (idle_closed_after, response)) = tokio::join!(server.stop(), clients);

    assert!(idle_closed_after >= Duration::from_millis(150), "idle socket closed after {idle_closed_after:?}");
    assert_eq!(response.status, 200);
    assert_eq!(response.text(), "/slow");

    assert_eq!(server.state(), ServerState::Stopped);
    assert_eq!(server.open_connections(), 0);
    assert!(TcpStream::connect(addr).await.is_err());
}

#[tokio::test]
async fn stuck_connections_are_destroyed() {
    let stuck = handler_fn(|_ctx, _next| future::pending().boxed());
    let config = test_config().with_shutdown_delay(Duration::ZERO).with_socket_timeout(Duration::from_millis(200));
    let (server, addr) = start_server(config, stuck).await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(b"GET /forever HTTP/1.1\r\nHost: localhost\r\n\r\n").await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(server.in_flight_requests(), 1);

    tokio::time::timeout(Duration::from_secs(2), server.stop()).await.expect("stop gives up on stuck connections");

    assert!(is_closed(&mut client).await);
    assert_eq!(server.open_connections(), 0);
    assert_eq!(server.state(), ServerState::Stopped);
}

#[tokio::test]
async fn zero_socket_timeout_never_times_out_idle_connections() {
    let config = test_config().with_socket_timeout(Duration::ZERO);
    let (server, addr) = start_server(config, slow(Duration::ZERO)).await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    client.write_all(b"GET /patient HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n").await.unwrap();
    assert_eq!(read_response(&mut client).await.unwrap().text(), "/patient");

    server.stop().await;
    assert_eq!(server.open_connections(), 0);
}

#[tokio::test]
async fn server_can_restart_after_stop() {
    let (server, first_addr) = start_server(test_config(), slow(Duration::ZERO)).await;
    server.start().await.unwrap();
    assert_eq!(server.local_addr(), Some(first_addr));

    server.stop().await;
    assert_eq!(server.local_addr(), None);

    server.start().await.unwrap();
    assert_eq!(server.state(), ServerState::Running);
    let addr = server.local_addr().unwrap();

    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(b"GET /again HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n").await.unwrap();
    assert_eq!(read_response(&mut client).await.unwrap().text(), "/again");

    server.stop().await;
}
