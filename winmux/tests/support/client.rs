use libwinmux::consts;
use libwinmux::framing::{read_frame, write_frame};
use tokio::net::windows::named_pipe::{ClientOptions, NamedPipeClient};
use winmux_protocol::{Event, Request};

/// A minimal protocol-level client for scenario tests that need to inspect
/// individual events (attach streams, dual-listener fan-out) rather than
/// just a subcommand's exit code and stdout.
pub struct TestClient {
    pipe: NamedPipeClient,
}

impl TestClient {
    pub async fn connect() -> anyhow::Result<TestClient> {
        let pipe = ClientOptions::new().open(consts::PIPE_NAME)?;
        Ok(TestClient { pipe })
    }

    pub async fn send(&mut self, request: &Request) -> anyhow::Result<()> {
        write_frame(&mut self.pipe, request).await?;
        Ok(())
    }

    pub async fn recv(&mut self) -> anyhow::Result<Option<Event>> {
        Ok(read_frame::<_, Event>(&mut self.pipe).await?)
    }

    pub async fn roundtrip(&mut self, request: Request) -> anyhow::Result<Event> {
        self.send(&request).await?;
        match self.recv().await? {
            Some(event) => Ok(event),
            None => anyhow::bail!("daemon closed the connection without replying"),
        }
    }
}
