//! Subprocess-backed provisioner
//!
//! stdout and stderr are read in fixed-size chunks as they arrive, merged
//! into one log stream and forwarded line-by-line through tracing. The tail
//! of the output is kept so a failing run can explain itself in the
//! condition message.

use std::collections::VecDeque;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{Provisioner, Verb};
use crate::Error;

/// Replaced by the config file path in tool arguments
pub const CONFIG_PLACEHOLDER: &str = "{config}";

/// Bytes read from a tool pipe per chunk
const CHUNK_SIZE: usize = 512;

/// Output lines kept for error messages
const TAIL_LINES: usize = 20;

/// How to invoke the provisioning tool
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ToolConfig {
    /// Executable name or path
    pub binary: String,
    /// Arguments for [`Verb::Apply`]
    pub apply_args: Vec<String>,
    /// Arguments for [`Verb::Deprovision`]
    pub deprovision_args: Vec<String>,
    /// Kill the tool if it runs longer than this; `None` waits indefinitely
    pub timeout: Option<Duration>,
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            binary: "rke".to_string(),
            apply_args: split_args("up --config {config}"),
            deprovision_args: split_args("remove --force --config {config}"),
            timeout: None,
        }
    }
}

impl ToolConfig {
    /// Arguments for `verb` with the config placeholder substituted
    pub fn args_for(&self, verb: Verb, config_path: &Path) -> Vec<String> {
        let template = match verb {
            Verb::Apply => &self.apply_args,
            Verb::Deprovision => &self.deprovision_args,
        };
        let path = config_path.to_string_lossy();
        template
            .iter()
            .map(|arg| arg.replace(CONFIG_PLACEHOLDER, &path))
            .collect()
    }
}

/// Split a whitespace-separated argument template
pub fn split_args(template: &str) -> Vec<String> {
    template.split_whitespace().map(str::to_string).collect()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum OutputStream {
    Stdout,
    Stderr,
}

impl OutputStream {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

/// Reassembles lines from arbitrarily split chunks
#[derive(Debug, Default)]
struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    /// Append a chunk and return every line it completed
    fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(end) = self.pending.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=end).collect();
            lines.push(decode_line(&raw));
        }
        lines
    }

    /// The unterminated remainder, if any
    fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let raw = std::mem::take(&mut self.pending);
        Some(decode_line(&raw))
    }
}

fn decode_line(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw)
        .trim_end_matches(['\n', '\r'])
        .to_string()
}

/// Forwards tool output to the log and remembers the last lines
struct OutputForwarder<'a> {
    cluster: &'a str,
    verb: Verb,
    stdout: LineBuffer,
    stderr: LineBuffer,
    tail: VecDeque<String>,
}

impl<'a> OutputForwarder<'a> {
    fn new(cluster: &'a str, verb: Verb) -> Self {
        Self {
            cluster,
            verb,
            stdout: LineBuffer::default(),
            stderr: LineBuffer::default(),
            tail: VecDeque::with_capacity(TAIL_LINES),
        }
    }

    fn chunk(&mut self, stream: OutputStream, chunk: &[u8]) {
        let lines = match stream {
            OutputStream::Stdout => self.stdout.push(chunk),
            OutputStream::Stderr => self.stderr.push(chunk),
        };
        for line in lines {
            self.line(stream, line);
        }
    }

    fn finish(&mut self) {
        if let Some(line) = self.stdout.finish() {
            self.line(OutputStream::Stdout, line);
        }
        if let Some(line) = self.stderr.finish() {
            self.line(OutputStream::Stderr, line);
        }
    }

    fn line(&mut self, stream: OutputStream, line: String) {
        if line.trim().is_empty() {
            return;
        }
        info!(
            cluster = %self.cluster,
            verb = %self.verb,
            stream = stream.as_str(),
            "{}",
            line
        );
        if self.tail.len() == TAIL_LINES {
            self.tail.pop_front();
        }
        self.tail.push_back(line);
    }

    fn tail(&self) -> String {
        self.tail.iter().cloned().collect::<Vec<_>>().join("\n")
    }
}

/// Read `source` in fixed-size chunks until it closes
async fn pump<R>(mut source: R, stream: OutputStream, tx: mpsc::Sender<(OutputStream, Vec<u8>)>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; CHUNK_SIZE];
    loop {
        match source.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if tx.send((stream, buf[..n].to_vec())).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                warn!(stream = stream.as_str(), error = %e, "Failed to read tool output");
                break;
            }
        }
    }
}

/// Provisioner running the tool as a child process
#[derive(Clone, Debug, Default)]
pub struct CommandProvisioner {
    tool: ToolConfig,
}

impl CommandProvisioner {
    /// Create a provisioner invoking the given tool
    pub fn new(tool: ToolConfig) -> Self {
        Self { tool }
    }

    async fn wait_with_logs(
        child: &mut Child,
        forwarder: &mut OutputForwarder<'_>,
    ) -> std::io::Result<ExitStatus> {
        let (tx, mut rx) = mpsc::channel(64);
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pump(stdout, OutputStream::Stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pump(stderr, OutputStream::Stderr, tx.clone()));
        }
        drop(tx);

        while let Some((stream, chunk)) = rx.recv().await {
            forwarder.chunk(stream, &chunk);
        }
        forwarder.finish();
        child.wait().await
    }
}

#[async_trait]
impl Provisioner for CommandProvisioner {
    async fn run(&self, cluster: &str, verb: Verb, config_path: &Path) -> Result<(), Error> {
        let args = self.tool.args_for(verb, config_path);
        info!(
            cluster = %cluster,
            verb = %verb,
            tool = %self.tool.binary,
            config = %config_path.display(),
            "Running provisioning tool"
        );

        let mut command = Command::new(&self.tool.binary);
        command
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        debug!(command = ?command, "Spawning provisioning tool");

        let mut child = command.spawn().map_err(|e| {
            Error::provisioning(
                cluster,
                verb.as_str(),
                format!("failed to start {}: {}", self.tool.binary, e),
            )
        })?;

        let mut forwarder = OutputForwarder::new(cluster, verb);
        let waited = match self.tool.timeout {
            Some(limit) => {
                match tokio::time::timeout(limit, Self::wait_with_logs(&mut child, &mut forwarder))
                    .await
                {
                    Ok(waited) => waited,
                    Err(_) => {
                        if let Err(e) = child.start_kill() {
                            warn!(cluster = %cluster, error = %e, "Failed to kill provisioning tool");
                        }
                        return Err(Error::provisioning(
                            cluster,
                            verb.as_str(),
                            format!("timed out after {}s", limit.as_secs()),
                        ));
                    }
                }
            }
            None => Self::wait_with_logs(&mut child, &mut forwarder).await,
        };

        let status = waited.map_err(|e| {
            Error::provisioning(cluster, verb.as_str(), format!("failed to wait for tool: {}", e))
        })?;

        if status.success() {
            info!(cluster = %cluster, verb = %verb, "Provisioning tool finished");
            return Ok(());
        }

        let tail = forwarder.tail();
        let message = if tail.is_empty() {
            status.to_string()
        } else {
            format!("{}; last output:\n{}", status, tail)
        };
        Err(Error::provisioning(cluster, verb.as_str(), message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    // ==========================================================================
    // Argument templating
    // ==========================================================================

    #[test]
    fn test_default_tool_matches_rke_syntax() {
        let tool = ToolConfig::default();
        let path = PathBuf::from("/var/lib/cp/c1/cluster.yml");
        assert_eq!(
            tool.args_for(Verb::Apply, &path),
            vec!["up", "--config", "/var/lib/cp/c1/cluster.yml"]
        );
        assert_eq!(
            tool.args_for(Verb::Deprovision, &path),
            vec!["remove", "--force", "--config", "/var/lib/cp/c1/cluster.yml"]
        );
    }

    #[test]
    fn test_placeholder_inside_argument() {
        let tool = ToolConfig {
            apply_args: split_args("apply --file={config}"),
            ..Default::default()
        };
        assert_eq!(
            tool.args_for(Verb::Apply, Path::new("/tmp/c.yml")),
            vec!["apply", "--file=/tmp/c.yml"]
        );
    }

    // ==========================================================================
    // Line reassembly
    // ==========================================================================

    #[test]
    fn test_line_buffer_joins_split_chunks() {
        let mut buf = LineBuffer::default();
        assert!(buf.push(b"INFO[0000] Bui").is_empty());
        assert_eq!(buf.push(b"lding cluster\r\nINFO[0001] "), vec!["INFO[0000] Building cluster"]);
        assert_eq!(buf.push(b"Done\n"), vec!["INFO[0001] Done"]);
        assert_eq!(buf.finish(), None);
    }

    #[test]
    fn test_line_buffer_flushes_unterminated_tail() {
        let mut buf = LineBuffer::default();
        assert!(buf.push(b"no newline").is_empty());
        assert_eq!(buf.finish().as_deref(), Some("no newline"));
    }

    #[test]
    fn test_forwarder_keeps_bounded_tail() {
        let mut forwarder = OutputForwarder::new("c1", Verb::Apply);
        for i in 0..(TAIL_LINES + 5) {
            forwarder.chunk(OutputStream::Stderr, format!("line {}\n", i).as_bytes());
        }
        let tail = forwarder.tail();
        assert!(!tail.contains("line 4\n"));
        assert!(tail.starts_with("line 5"));
        assert!(tail.ends_with(&format!("line {}", TAIL_LINES + 4)));
    }

    // ==========================================================================
    // Process execution
    // ==========================================================================

    fn shell(script: &str) -> CommandProvisioner {
        CommandProvisioner::new(ToolConfig {
            binary: "sh".to_string(),
            apply_args: vec!["-c".to_string(), script.to_string()],
            deprovision_args: vec!["-c".to_string(), script.to_string()],
            timeout: None,
        })
    }

    #[tokio::test]
    async fn test_successful_run() {
        let provisioner = shell("echo provisioning; echo warming up >&2");
        provisioner
            .run("c1", Verb::Apply, Path::new("/tmp/unused.yml"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_config_path_reaches_the_tool() {
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("cluster.yml");
        std::fs::write(&config, "nodes: []").unwrap();
        let marker = dir.path().join("applied");

        let script = format!("cp {} {}", CONFIG_PLACEHOLDER, marker.display());
        let provisioner = shell(&script);
        provisioner.run("c1", Verb::Apply, &config).await.unwrap();

        assert_eq!(std::fs::read_to_string(&marker).unwrap(), "nodes: []");
    }

    #[tokio::test]
    async fn test_non_zero_exit_reports_status_and_output() {
        let provisioner = shell("echo 'FATA[0003] node unreachable' >&2; exit 3");
        let err = provisioner
            .run("c1", Verb::Deprovision, Path::new("/tmp/unused.yml"))
            .await
            .unwrap_err();

        let msg = err.to_string();
        assert!(matches!(err, Error::Provisioning { .. }));
        assert!(msg.contains("deprovision"));
        assert!(msg.contains('3'));
        assert!(msg.contains("node unreachable"));
    }

    #[tokio::test]
    async fn test_missing_binary_is_a_provisioning_error() {
        let provisioner = CommandProvisioner::new(ToolConfig {
            binary: "/nonexistent/provisioning-tool".to_string(),
            ..Default::default()
        });
        let err = provisioner
            .run("c1", Verb::Apply, Path::new("/tmp/unused.yml"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("failed to start"));
    }

    #[tokio::test]
    async fn test_timeout_kills_the_tool() {
        let mut provisioner = shell("sleep 30");
        provisioner.tool.timeout = Some(Duration::from_millis(200));

        let started = std::time::Instant::now();
        let err = provisioner
            .run("c1", Verb::Apply, Path::new("/tmp/unused.yml"))
            .await
            .unwrap_err();

        assert!(err.to_string().contains("timed out"));
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
