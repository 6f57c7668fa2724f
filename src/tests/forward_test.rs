use std::time::Duration;

use test_env_log::test;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout};

use crate::everlink::forward::PortForwardHandler;
use crate::everlink::proto::{
    PortForwardData, PortForwardDestinationRequest, PortForwardSourceRequest, SocketEndpoint,
};
use crate::tests::common;
use crate::tests::common::WATCHDOG;

/// One polling tick on `from`, with every produced frame delivered to `to`.
/// Returns how many frames moved.
async fn pump(from: &mut PortForwardHandler, to: &mut PortForwardHandler) -> usize {
    let mut frames = Vec::new();
    let requests = from.update(&mut frames);
    assert!(
        requests.is_empty(),
        "no new tunnels expected during steady-state pumping"
    );
    let moved = frames.len();
    for frame in frames {
        to.handle_data(&frame).await;
    }
    moved
}

/// Ticks the source side until its listener's accept shows up as a
/// destination request.
async fn next_destination_request(handler: &mut PortForwardHandler) -> PortForwardDestinationRequest {
    loop {
        let mut frames = Vec::new();
        let mut requests = handler.update(&mut frames);
        assert!(frames.is_empty());
        if let Some(request) = requests.pop() {
            return request;
        }
        sleep(Duration::from_millis(2)).await;
    }
}

async fn read_across_ticks(
    sock: &mut TcpStream,
    want: usize,
    from: &mut PortForwardHandler,
    to: &mut PortForwardHandler,
) -> Vec<u8> {
    let mut got = Vec::new();
    while got.len() < want {
        pump(from, to).await;
        let mut buf = [0u8; 64];
        if let Ok(Ok(n)) = timeout(Duration::from_millis(10), sock.read(&mut buf)).await {
            assert_ne!(n, 0, "socket closed before the expected payload arrived");
            got.extend_from_slice(&buf[..n]);
        }
    }
    got
}

#[test(tokio::test)]
async fn test_tunnel_happy_path() {
    // A local client dials the source listener; the peer dials the real
    // destination; "hello" goes one way and "world" comes back.
    timeout(WATCHDOG, async {
        let destination_service = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let destination_port = destination_service.local_addr().unwrap().port();

        let mut source_side = PortForwardHandler::new(common::test_settings());
        let mut destination_side = PortForwardHandler::new(common::test_settings());

        let response = source_side
            .create_source(&PortForwardSourceRequest {
                source: Some(SocketEndpoint::tcp("localhost", 0)),
                destination: Some(SocketEndpoint::tcp("localhost", destination_port)),
                environment_variable: None,
            })
            .await;
        assert!(response.error.is_none(), "{:?}", response.error);
        let local_port = source_side.sources()[0].source().port.unwrap() as u16;

        let mut local = TcpStream::connect(("127.0.0.1", local_port)).await.unwrap();
        let request = next_destination_request(&mut source_side).await;
        assert_eq!(
            request.destination.as_ref().unwrap().port,
            Some(destination_port as u32)
        );

        let response = destination_side.handle_destination_request(&request).await;
        assert!(response.error.is_none(), "{:?}", response.error);
        assert_eq!(response.client_fd, request.fd);
        let socket_id = response.socket_id.unwrap();
        let (mut destination_sock, _) = destination_service.accept().await.unwrap();

        source_side.handle_destination_response(&response);
        assert!(source_side.sources()[0].contains_socket(socket_id));
        assert!(!source_side.sources()[0].has_unassigned_fd(request.fd));

        local.write_all(b"hello").await.unwrap();
        let got = read_across_ticks(
            &mut destination_sock,
            5,
            &mut source_side,
            &mut destination_side,
        )
        .await;
        assert_eq!(got, b"hello");

        destination_sock.write_all(b"world").await.unwrap();
        let got =
            read_across_ticks(&mut local, 5, &mut destination_side, &mut source_side).await;
        assert_eq!(got, b"world");

        // The local client hangs up; within a tick the destination side hears
        // about it and drops the tunnel.
        drop(local);
        loop {
            pump(&mut source_side, &mut destination_side).await;
            if destination_side.destination_count() == 0 {
                break;
            }
            sleep(Duration::from_millis(2)).await;
        }
        assert!(!source_side.sources()[0].contains_socket(socket_id));
        let n = destination_sock.read(&mut [0u8; 8]).await.unwrap();
        assert_eq!(n, 0, "destination socket should see EOF");
    })
    .await
    .unwrap();
}

#[test(tokio::test)]
async fn test_tunnel_destination_refused() {
    // The destination dial fails; the source side must close the pending
    // local connection and emit nothing for it.
    timeout(WATCHDOG, async {
        let refused_port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            let port = listener.local_addr().unwrap().port();
            drop(listener);
            port
        };

        let mut source_side = PortForwardHandler::new(common::test_settings());
        let mut destination_side = PortForwardHandler::new(common::test_settings());

        let response = source_side
            .create_source(&PortForwardSourceRequest {
                source: Some(SocketEndpoint::tcp("localhost", 0)),
                destination: Some(SocketEndpoint::tcp("localhost", refused_port)),
                environment_variable: None,
            })
            .await;
        assert!(response.error.is_none());
        let local_port = source_side.sources()[0].source().port.unwrap() as u16;

        let mut local = TcpStream::connect(("127.0.0.1", local_port)).await.unwrap();
        let request = next_destination_request(&mut source_side).await;

        let response = destination_side.handle_destination_request(&request).await;
        assert!(response.error.is_some());
        assert!(response.socket_id.is_none());
        assert_eq!(destination_side.destination_count(), 0);

        source_side.handle_destination_response(&response);
        assert!(!source_side.sources()[0].has_unassigned_fd(request.fd));

        // the local client observes the closed socket
        let n = local.read(&mut [0u8; 8]).await.unwrap();
        assert_eq!(n, 0);

        // and no frames ever flow for that connection
        let mut frames = Vec::new();
        let requests = source_side.update(&mut frames);
        assert!(requests.is_empty());
        assert!(frames.is_empty());
    })
    .await
    .unwrap();
}

#[cfg(unix)]
#[test(tokio::test)]
async fn test_source_request_without_destination_allocates_a_pipe() {
    // With no destination in the request, the handler listens on a fresh
    // pipe path, publishes it through the environment variable, and dials
    // the request's source endpoint for each tunnel.
    timeout(WATCHDOG, async {
        let service_path = std::env::temp_dir()
            .join(format!("everlink_test_{:08x}", rand::random::<u32>()))
            .to_string_lossy()
            .into_owned();
        let service = tokio::net::UnixListener::bind(&service_path).unwrap();

        let mut source_side = PortForwardHandler::new(common::test_settings());
        let mut destination_side = PortForwardHandler::new(common::test_settings());

        let variable = "EVERLINK_TEST_PIPE";
        let response = source_side
            .create_source(&PortForwardSourceRequest {
                source: Some(SocketEndpoint::unix(&service_path)),
                destination: None,
                environment_variable: Some(variable.to_string()),
            })
            .await;
        assert!(response.error.is_none(), "{:?}", response.error);

        let published = std::env::var(variable).unwrap();
        assert_eq!(source_side.sources()[0].source().name.as_deref(), Some(published.as_str()));

        let mut local = tokio::net::UnixStream::connect(&published).await.unwrap();
        let request = next_destination_request(&mut source_side).await;
        assert_eq!(
            request.destination.as_ref().unwrap().name.as_deref(),
            Some(service_path.as_str())
        );

        let response = destination_side.handle_destination_request(&request).await;
        assert!(response.error.is_none(), "{:?}", response.error);
        let (mut service_sock, _) = service.accept().await.unwrap();
        source_side.handle_destination_response(&response);

        local.write_all(b"via pipe").await.unwrap();
        let mut got = Vec::new();
        while got.len() < 8 {
            pump(&mut source_side, &mut destination_side).await;
            let mut buf = [0u8; 16];
            if let Ok(Ok(n)) = timeout(Duration::from_millis(10), service_sock.read(&mut buf)).await
            {
                got.extend_from_slice(&buf[..n]);
            }
        }
        assert_eq!(got, b"via pipe");

        let _ = std::fs::remove_file(&service_path);
        let _ = std::fs::remove_file(&published);
    })
    .await
    .unwrap();
}

#[test(tokio::test)]
async fn test_frames_for_unknown_socket_ids_are_discarded() {
    timeout(WATCHDOG, async {
        let mut handler = PortForwardHandler::new(common::test_settings());
        // Neither of these may panic or create state; a close can race data
        // still in flight.
        handler
            .handle_data(&PortForwardData::buffer(99999, true, b"late"))
            .await;
        handler.handle_data(&PortForwardData::closed(88888, false)).await;
        assert_eq!(handler.destination_count(), 0);
    })
    .await
    .unwrap();
}
