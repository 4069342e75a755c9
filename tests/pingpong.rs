use std::{error::Error, time::Duration};

use duorpc::{
    Client, ClientConfig, Params, RpcError, ServerConfig, ServerConnection, ServiceError, Value,
    WireFormat,
};
use tempfile::tempdir;
use tokio::{net::UnixListener, sync::mpsc, time::timeout};
use tracing_test::traced_test;

const PONGS: usize = 5;

fn ping(method: &str, _params: Params) -> Result<Value, ServiceError> {
    match method {
        "ping" => Ok(Value::from("pong")),
        _ => Err(ServiceError::new("not found")),
    }
}

/// The client pings once so the server learns its format, then the server
/// pushes a stream of notifications back over the same connection.
async fn pingpong(format: WireFormat) -> Result<(), Box<dyn Error>> {
    let temp_dir = tempdir()?;
    let socket_path = temp_dir.path().join("pingpong.sock");
    let listener = UnixListener::bind(&socket_path)?;

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await?;
        Ok::<_, std::io::Error>(ServerConnection::new(
            stream,
            ping,
            ServerConfig::default(),
        ))
    });

    let client = Client::unix(&socket_path, ClientConfig::default().with_format(format));
    let (pongs, mut received) = mpsc::unbounded_channel();
    client.on_notification(move |method, params| {
        drop(pongs.send((method, params)));
    });

    assert_eq!(
        client.call("ping", Params::none()).await?,
        Value::from("pong")
    );
    let connection = server.await??;
    assert_eq!(connection.format(), Some(format));

    for i in 0..PONGS {
        connection
            .send_notification("pong", [Value::from(i as u64)])
            .await?;
    }
    // Callbacks run concurrently, so arrival order is not guaranteed.
    let mut seen = Vec::new();
    for _ in 0..PONGS {
        let (method, params) = timeout(Duration::from_secs(5), received.recv())
            .await?
            .ok_or("notification channel closed")?;
        assert_eq!(method, "pong");
        seen.push(params.first().and_then(|v| v.as_u64()).ok_or("missing arg")?);
    }
    seen.sort_unstable();
    assert_eq!(seen, (0..PONGS as u64).collect::<Vec<_>>());

    // Closing the client is seen by the server as an orderly disconnect.
    client.close().await;
    timeout(Duration::from_secs(5), connection.wait_closed()).await??;
    assert!(connection.is_closed());
    assert!(matches!(
        connection.send_notification("pong", Params::none()).await,
        Err(RpcError::Disconnect { .. })
    ));
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn test_pingpong_json() -> Result<(), Box<dyn Error>> {
    pingpong(WireFormat::Json).await
}

#[tokio::test]
#[traced_test]
async fn test_pingpong_msgpack() -> Result<(), Box<dyn Error>> {
    pingpong(WireFormat::MsgPack).await
}

#[tokio::test]
#[traced_test]
async fn test_push_before_first_message() -> Result<(), Box<dyn Error>> {
    let (local, _remote) = tokio::io::duplex(1024);
    let connection = ServerConnection::new(local, ping, ServerConfig::default());
    assert!(matches!(
        connection
            .send_notification("pong", [Value::from("early")])
            .await,
        Err(RpcError::FormatUnknown)
    ));
    connection.close().await;
    assert!(connection.is_closed());
    Ok(())
}
