// mock_soop: A mock SOOP chat server for testing collector sessions.
//
// Protocol behavior:
// - Waits for the client CONNECT packet (code 0001) and echoes it.
// - Waits for the client JOIN packet (code 0002) and echoes it, then
//   replays the scripted frames in order as binary messages.
// - Any PING packet (code 0000) from the client is echoed back.
// - The connection then stays open until the client closes it.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use soop_chat::{Action, parse_frame};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::protocol::Message;

/// A scripted mock SOOP chat server.
pub struct MockSoopServer {
    addr: SocketAddr,
    /// Every binary frame received from clients, in arrival order.
    received: Arc<Mutex<Vec<Vec<u8>>>>,
    _task: tokio::task::JoinHandle<()>,
}

impl MockSoopServer {
    /// Start the mock on a random port; `script` is replayed to each client
    /// after its JOIN packet.
    pub async fn start(script: Vec<Vec<u8>>) -> Result<Self, Box<dyn std::error::Error>> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let received: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));

        let script = Arc::new(script);
        let received_for_task = received.clone();
        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _peer)) => {
                        let script = script.clone();
                        let received = received_for_task.clone();
                        tokio::spawn(async move {
                            let _ = Self::handle_connection(stream, &script, received).await;
                        });
                    }
                    Err(_) => break,
                }
            }
        });

        Ok(Self {
            addr,
            received,
            _task: task,
        })
    }

    /// The `ws://` URL a session should connect to.
    pub fn url(&self) -> String {
        format!("ws://{}/Websocket/mock", self.addr)
    }

    /// Snapshot of every binary frame received so far.
    pub async fn received_frames(&self) -> Vec<Vec<u8>> {
        self.received.lock().await.clone()
    }

    async fn handle_connection(
        stream: tokio::net::TcpStream,
        script: &[Vec<u8>],
        received: Arc<Mutex<Vec<Vec<u8>>>>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
        // Echo the requested subprotocol (clients ask for `chat`); without
        // the echo the client side rejects the upgrade.
        let ws_stream = tokio_tungstenite::accept_hdr_async(
            stream,
            |request: &Request, mut response: Response| {
                if let Some(protocol) = request.headers().get("Sec-WebSocket-Protocol") {
                    response
                        .headers_mut()
                        .insert("Sec-WebSocket-Protocol", protocol.clone());
                }
                Ok(response)
            },
        )
        .await?;
        let (mut write, mut read) = ws_stream.split();
        let mut script_sent = false;

        while let Some(msg) = read.next().await {
            let data = match msg? {
                Message::Binary(data) => data.to_vec(),
                Message::Close(_) => break,
                Message::Ping(data) => {
                    write.send(Message::Pong(data)).await?;
                    continue;
                }
                _ => continue,
            };
            received.lock().await.push(data.clone());

            let Ok(frame) = parse_frame(&data) else {
                continue;
            };
            match frame.action {
                // Echo the handshake packets back, like the live server.
                Action::Connect => {
                    write.send(Message::Binary(data.into())).await?;
                }
                Action::Join => {
                    write.send(Message::Binary(data.into())).await?;
                    if !script_sent {
                        script_sent = true;
                        for scripted in script {
                            write.send(Message::Binary(scripted.clone().into())).await?;
                        }
                    }
                }
                Action::Ping => {
                    write.send(Message::Binary(data.into())).await?;
                }
                _ => {}
            }
        }
        Ok(())
    }
}
