use super::channel::RpcChannel;
use super::TransportError;
use serde_json::Value;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader, BufWriter};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, warn};

/// Spawns a tool server as a child process and speaks the protocol over its
/// standard streams. The launch command is derived from the server
/// program's file suffix; the path is always the final argument.
pub struct StdioTransport {
    program: String,
    args: Vec<String>,
    state: AsyncMutex<StdioState>,
}

#[derive(Default)]
struct StdioState {
    child: Option<Child>,
    channel: Option<Arc<RpcChannel>>,
}

impl StdioTransport {
    pub fn new(path: impl AsRef<Path>) -> Self {
        let (program, args) = launch_command(path.as_ref());
        Self {
            program,
            args,
            state: AsyncMutex::new(StdioState::default()),
        }
    }

    /// The full launch command, program first.
    pub fn command(&self) -> Vec<String> {
        let mut command = Vec::with_capacity(self.args.len() + 1);
        command.push(self.program.clone());
        command.extend(self.args.iter().cloned());
        command
    }

    pub async fn acquire(&self) -> Result<Arc<RpcChannel>, TransportError> {
        let mut state = self.state.lock().await;
        if let Some(channel) = &state.channel {
            return Ok(channel.clone());
        }
        self.open(&mut state)
    }

    pub async fn initialize(&self) -> Result<Arc<RpcChannel>, TransportError> {
        let mut state = self.state.lock().await;
        if state.channel.is_some() {
            return Err(TransportError::AlreadyInitialized);
        }
        self.open(&mut state)
    }

    fn open(&self, state: &mut StdioState) -> Result<Arc<RpcChannel>, TransportError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|source| TransportError::Spawn {
                command: self.command().join(" "),
                source,
            })?;

        let stdin = child.stdin.take().ok_or_else(|| TransportError::Channel {
            message: "failed to capture server stdin".to_string(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| TransportError::Channel {
            message: "failed to capture server stdout".to_string(),
        })?;

        let channel = Arc::new(RpcChannel::over_pipe(BufWriter::new(stdin)));
        let reader = channel.clone();
        tokio::spawn(async move {
            read_pipe(reader, stdout).await;
        });

        state.child = Some(child);
        state.channel = Some(channel.clone());
        Ok(channel)
    }

    /// Terminates the child (best effort, no wait) and closes the channel.
    /// The kill happens first so a wedged channel cannot leak the process.
    pub async fn close(&self) -> Result<(), TransportError> {
        let mut state = self.state.lock().await;
        if let Some(mut child) = state.child.take() {
            if let Err(err) = child.start_kill() {
                debug!(%err, "tool server process already exited");
            }
        }
        if let Some(channel) = state.channel.take() {
            channel.shutdown().await;
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) async fn install_channel(&self, channel: Arc<RpcChannel>) {
        let mut state = self.state.lock().await;
        state.channel = Some(channel);
    }
}

async fn read_pipe(channel: Arc<RpcChannel>, stdout: ChildStdout) {
    let mut lines = BufReader::new(stdout).lines();
    while let Ok(Some(raw)) = lines.next_line().await {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            continue;
        }
        if trimmed.starts_with('\u{1b}') {
            debug!(line = trimmed, "skipping ANSI log line from tool server");
            continue;
        }
        match serde_json::from_str::<Value>(trimmed) {
            Ok(value) => channel.dispatch(value).await,
            Err(source) => {
                warn!(line = trimmed, %source, "received invalid JSON from tool server");
            }
        }
    }
    channel.shutdown().await;
}

/// Launch command table by file suffix: script runtimes for interpretable
/// scripts, a JVM launcher for archives, a containerized fallback for
/// anything else.
fn launch_command(path: &Path) -> (String, Vec<String>) {
    let suffix = path
        .extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or_default();
    let (program, mut args): (&str, Vec<String>) = match suffix {
        "js" => ("node", Vec::new()),
        "py" => {
            if cfg!(windows) {
                ("python", Vec::new())
            } else {
                ("python3", Vec::new())
            }
        }
        "jar" => ("java", vec!["-jar".to_string()]),
        _ => (
            "docker",
            vec!["run".to_string(), "-i".to_string(), "--rm".to_string()],
        ),
    };
    args.push(path.to_string_lossy().into_owned());
    (program.to_string(), args)
}
