use std::net::TcpListener;

use crate::net::is_port_free;
use crate::net::is_server_ready;

#[test]
fn test_is_port_free_detects_listener() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    assert!(!is_port_free("127.0.0.1", port));

    drop(listener);
    assert!(is_port_free("127.0.0.1", port));
}

#[tokio::test]
async fn test_is_server_ready() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    assert!(is_server_ready("127.0.0.1", port).await);

    drop(listener);
    assert!(!is_server_ready("127.0.0.1", port).await);
}
