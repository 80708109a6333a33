//! Shared end-to-end test harness: spin up a real broker over a Unix socket
//! in a tempdir and drive it with a small framed client, mirroring the
//! teacher's `MockWsClient`-over-a-bound-listener integration test shape.

use agent_relay::config::RelayConfig;
use futures_util::{SinkExt, StreamExt};
use relay_protocol::{Capabilities, Envelope, FrameType, HelloPayload, WelcomePayload};
use tokio::net::UnixStream;
use tokio_util::codec::Framed;

pub struct TestBroker {
    pub socket_path: std::path::PathBuf,
    pub config: RelayConfig,
    _dir: tempfile::TempDir,
    handle: tokio::task::JoinHandle<()>,
}

impl TestBroker {
    pub async fn start() -> Self {
        Self::start_with(5_000).await
    }

    pub async fn start_with(heartbeat_ms: u64) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let config = RelayConfig::from_start_args(
            dir.path().join("relay.sock"),
            None,
            Some(dir.path().to_path_buf()),
            heartbeat_ms,
            1024 * 1024,
        );
        Self::start_with_config(dir, config).await
    }

    pub async fn start_with_config(dir: tempfile::TempDir, config: RelayConfig) -> Self {
        let socket_path = config.socket_path.clone();
        let run_config = config.clone();
        let handle = tokio::spawn(async move {
            let _ = agent_relay::server::run(run_config).await;
        });

        for _ in 0..100 {
            if UnixStream::connect(&socket_path).await.is_ok() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        TestBroker {
            socket_path,
            config,
            _dir: dir,
            handle,
        }
    }

    pub async fn connect(&self) -> TestClient {
        let stream = UnixStream::connect(&self.socket_path).await.unwrap();
        TestClient {
            framed: Framed::new(stream, agent_relay::codec::FrameCodec::new(self.config.max_frame_bytes)),
        }
    }
}

impl Drop for TestBroker {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

pub struct TestClient {
    framed: Framed<UnixStream, agent_relay::codec::FrameCodec>,
}

impl TestClient {
    pub async fn send(&mut self, env: Envelope) {
        self.framed.send(env).await.unwrap();
    }

    pub async fn recv(&mut self) -> Envelope {
        self.framed
            .next()
            .await
            .expect("connection closed before a frame arrived")
            .expect("codec error")
    }

    pub async fn try_recv_within(&mut self, timeout: std::time::Duration) -> Option<Envelope> {
        tokio::time::timeout(timeout, self.framed.next())
            .await
            .ok()
            .flatten()
            .map(Result::unwrap)
    }

    /// Send HELLO and wait for WELCOME, returning its payload.
    pub async fn hello(&mut self, agent: &str) -> WelcomePayload {
        self.hello_with_session(agent, None).await
    }

    pub async fn hello_with_session(
        &mut self,
        agent: &str,
        session: Option<relay_protocol::SessionResumeRequest>,
    ) -> WelcomePayload {
        let hello = Envelope::new(
            FrameType::Hello,
            serde_json::to_value(HelloPayload {
                agent: agent.to_owned(),
                cli: None,
                program: None,
                model: None,
                task: None,
                working_directory: None,
                capabilities: Capabilities::default(),
                session,
            })
            .unwrap(),
        );
        self.send(hello).await;
        let welcome = self.recv().await;
        assert_eq!(welcome.kind, FrameType::Welcome);
        welcome.payload_as::<WelcomePayload>().unwrap()
    }
}
