use std::io::{ErrorKind, Read, Write};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Output, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use wmis_core::{parse_candidates, ExtractionError, RawMessage, StructuredExtractor, TradeCandidate};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Extractor backed by an external program, typically a wrapper around a
/// language-model API. The batch goes to stdin as one `[time] sender:
/// content` line per message; stdout must carry the candidates as JSON.
/// Without a timeout the call waits for the program indefinitely.
#[derive(Debug, Clone)]
pub struct CommandExtractor {
    program: String,
    args: Vec<String>,
    working_dir: Option<PathBuf>,
    timeout: Option<Duration>,
}

impl CommandExtractor {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            working_dir: None,
            timeout: None,
        }
    }

    /// First element is the program, the rest its arguments.
    pub fn from_argv(argv: &[String]) -> Option<Self> {
        let (program, args) = argv.split_first()?;
        Some(Self::new(program.clone(), args.to_vec()))
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    fn wait_with_deadline(&self, child: &mut Child) -> Result<ExitStatus, ExtractionError> {
        let Some(timeout) = self.timeout else {
            return Ok(child.wait()?);
        };
        let started = Instant::now();
        loop {
            if let Some(status) = child.try_wait()? {
                return Ok(status);
            }
            if started.elapsed() >= timeout {
                let _ = child.kill();
                let _ = child.wait();
                warn!(
                    event = "command_extractor_timeout",
                    program = %self.program,
                    timeout_ms = timeout.as_millis() as u64
                );
                return Err(ExtractionError::Provider(format!(
                    "{} timed out after {}s",
                    self.program,
                    timeout.as_secs_f64()
                )));
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    fn render_input(batch: &[RawMessage]) -> String {
        let mut input = batch
            .iter()
            .map(RawMessage::extractor_line)
            .collect::<Vec<_>>()
            .join("\n");
        input.push('\n');
        input
    }
}

impl StructuredExtractor for CommandExtractor {
    fn extract(&self, batch: &[RawMessage]) -> Result<Vec<TradeCandidate>, ExtractionError> {
        if batch.is_empty() {
            return Ok(Vec::new());
        }

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|err| {
            ExtractionError::Provider(format!("failed to start {}: {err}", self.program))
        })?;

        let payload = Self::render_input(batch);
        let writer = child.stdin.take().map(|mut stdin| {
            thread::spawn(move || match stdin.write_all(payload.as_bytes()) {
                Err(err) if err.kind() == ErrorKind::BrokenPipe => Ok(()),
                other => other,
            })
        });
        // Drained concurrently so a chatty extractor cannot fill the pipe
        // while the deadline is polled.
        let stdout_reader = child.stdout.take().map(spawn_reader);
        let stderr_reader = child.stderr.take().map(spawn_reader);

        let status = self.wait_with_deadline(&mut child)?;
        if let Some(writer) = writer {
            writer
                .join()
                .map_err(|_| ExtractionError::Provider("stdin writer panicked".to_string()))??;
        }
        let output = Output {
            status,
            stdout: join_reader(stdout_reader)?,
            stderr: join_reader(stderr_reader)?,
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ExtractionError::Provider(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                stderr.trim()
            )));
        }

        let stdout_bytes = output.stdout.len();
        let stdout = String::from_utf8(output.stdout).map_err(|err| {
            ExtractionError::InvalidOutput(format!("{} wrote non-UTF-8 output: {err}", self.program))
        })?;
        let candidates = parse_candidates(&stdout);
        debug!(
            event = "command_extractor_output",
            program = %self.program,
            messages = batch.len(),
            candidates = candidates.len(),
            stdout_bytes = stdout_bytes
        );
        Ok(candidates)
    }
}

fn spawn_reader<R: Read + Send + 'static>(mut pipe: R) -> JoinHandle<std::io::Result<Vec<u8>>> {
    thread::spawn(move || {
        let mut buffer = Vec::new();
        pipe.read_to_end(&mut buffer)?;
        Ok(buffer)
    })
}

fn join_reader(
    reader: Option<JoinHandle<std::io::Result<Vec<u8>>>>,
) -> Result<Vec<u8>, ExtractionError> {
    match reader {
        Some(handle) => Ok(handle
            .join()
            .map_err(|_| ExtractionError::Provider("output reader panicked".to_string()))??),
        None => Ok(Vec::new()),
    }
}
