//! Connections to buildkitd.
//!
//! - `BuildService`: the two control RPCs the reproducer needs.
//! - `Connector`: opens a `BuildService` for an address.
//! - `GrpcConnector`: the real thing, over unix sockets, named pipes, TCP
//!   or `docker exec ... buildctl dial-stdio`.

use std::io;
use std::pin::Pin;
use std::process::Stdio;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use kitrace_core::address::BuildkitAddress;
use kitrace_core::error::{ReproError, Result};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tonic::transport::{Channel, Endpoint, Uri};
use tower::service_fn;

use crate::proto::{ControlClient, SolveRequest, SolveResponse, StatusRequest, StatusResponse};

/// Stream of progress updates for one build.
pub type StatusStream = Pin<Box<dyn Stream<Item = Result<StatusResponse>> + Send>>;

/// The subset of the BuildKit control API used by the reproducer.
#[async_trait]
pub trait BuildService: Send + Sync {
    /// Submit a build and wait for it to finish.
    async fn solve(&self, request: SolveRequest) -> Result<SolveResponse>;

    /// Follow progress of the build identified by `build_ref`.
    async fn status(&self, build_ref: &str) -> Result<StatusStream>;
}

/// Opens a [`BuildService`] for an endpoint.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, address: &BuildkitAddress) -> Result<Box<dyn BuildService>>;
}

/// Connects to buildkitd over gRPC.
///
/// Connections are established eagerly, so an unreachable endpoint
/// fails here instead of on the first RPC.
#[derive(Debug, Clone, Default)]
pub struct GrpcConnector;

#[async_trait]
impl Connector for GrpcConnector {
    async fn connect(&self, address: &BuildkitAddress) -> Result<Box<dyn BuildService>> {
        let channel = connect_channel(address).await?;
        tracing::debug!(address = %address, "Connected to buildkitd");
        Ok(Box::new(GrpcBuildService {
            client: ControlClient::new(channel),
        }))
    }
}

/// Open a gRPC channel to buildkitd.
pub async fn connect_channel(address: &BuildkitAddress) -> Result<Channel> {
    let addr = address.to_string();
    match address {
        BuildkitAddress::Tcp { host, port } => {
            let endpoint = Endpoint::from_shared(format!("http://{}:{}", host, port))
                .map_err(|e| ReproError::connection(&addr, e))?;
            endpoint
                .connect()
                .await
                .map_err(|e| ReproError::connection(&addr, transport_message(&e)))
        }
        #[cfg(unix)]
        BuildkitAddress::Unix(path) => {
            let path = path.clone();
            Endpoint::from_static("http://buildkitd")
                .connect_with_connector(service_fn(move |_: Uri| {
                    let path = path.clone();
                    async move { tokio::net::UnixStream::connect(path).await }
                }))
                .await
                .map_err(|e| ReproError::connection(&addr, transport_message(&e)))
        }
        #[cfg(not(unix))]
        BuildkitAddress::Unix(_) => Err(ReproError::connection(
            &addr,
            "unix sockets are not supported on this platform",
        )),
        #[cfg(windows)]
        BuildkitAddress::Npipe(name) => {
            let name = name.clone();
            Endpoint::from_static("http://buildkitd")
                .connect_with_connector(service_fn(move |_: Uri| {
                    let name = name.clone();
                    async move {
                        tokio::net::windows::named_pipe::ClientOptions::new().open(&name)
                    }
                }))
                .await
                .map_err(|e| ReproError::connection(&addr, transport_message(&e)))
        }
        #[cfg(not(windows))]
        BuildkitAddress::Npipe(_) => Err(ReproError::connection(
            &addr,
            "named pipes are only supported on Windows",
        )),
        BuildkitAddress::DockerContainer { container, context } => {
            let container = container.clone();
            let context = context.clone();
            Endpoint::from_static("http://buildkitd")
                .connect_with_connector(service_fn(move |_: Uri| {
                    let container = container.clone();
                    let context = context.clone();
                    async move {
                        StdioStream::spawn(dial_stdio_command(&container, context.as_deref()))
                    }
                }))
                .await
                .map_err(|e| ReproError::connection(&addr, transport_message(&e)))
        }
    }
}

/// Include the source chain; tonic's top-level message is just
/// "transport error".
fn transport_message(err: &tonic::transport::Error) -> String {
    use std::error::Error;

    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(inner) = source {
        message.push_str(": ");
        message.push_str(&inner.to_string());
        source = inner.source();
    }
    message
}

/// `docker [--context C] exec -i <container> buildctl dial-stdio`
pub fn dial_stdio_command(container: &str, context: Option<&str>) -> Command {
    let mut cmd = Command::new("docker");
    if let Some(ctx) = context {
        cmd.arg("--context").arg(ctx);
    }
    cmd.args(["exec", "-i", container, "buildctl", "dial-stdio"]);
    cmd
}

/// gRPC-backed [`BuildService`].
struct GrpcBuildService {
    client: ControlClient<Channel>,
}

#[async_trait]
impl BuildService for GrpcBuildService {
    async fn solve(&self, request: SolveRequest) -> Result<SolveResponse> {
        let mut client = self.client.clone();
        let response = client
            .solve(request)
            .await
            .map_err(|status| ReproError::Solve(status.message().to_string()))?;
        Ok(response.into_inner())
    }

    async fn status(&self, build_ref: &str) -> Result<StatusStream> {
        let mut client = self.client.clone();
        let response = client
            .status(StatusRequest {
                r#ref: build_ref.to_string(),
            })
            .await
            .map_err(|status| ReproError::ProgressStream(status.message().to_string()))?;
        let stream = response.into_inner().map(|item| {
            item.map_err(|status| ReproError::ProgressStream(status.message().to_string()))
        });
        Ok(Box::pin(stream))
    }
}

/// A child process's stdin/stdout pair used as a bidirectional byte stream.
pub struct StdioStream {
    // Held so the helper is killed when the connection is dropped.
    _child: Child,
    stdin: ChildStdin,
    stdout: ChildStdout,
}

impl StdioStream {
    pub fn spawn(mut cmd: Command) -> io::Result<Self> {
        let mut child = cmd
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "helper stdin unavailable"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "helper stdout unavailable"))?;
        Ok(Self {
            _child: child,
            stdin,
            stdout,
        })
    }
}

impl AsyncRead for StdioStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stdout).poll_read(cx, buf)
    }
}

impl AsyncWrite for StdioStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stdin).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stdin).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stdin).poll_shutdown(cx)
    }
}
