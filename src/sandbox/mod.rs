// src/sandbox/mod.rs

//! Long-lived simulator sessions used to run compiled student programs.
//!
//! Starting the simulator takes seconds, so each worker slot keeps one
//! process alive and feeds it a new program per run. A slot whose process
//! died is respawned on its next use.

pub mod protocol;

use std::{
    io,
    path::{Path, PathBuf},
    process::Stdio,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use tokio::{
    fs::{self, File, OpenOptions},
    io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, Lines},
    process::{Child, ChildStdin, ChildStdout, Command},
    sync::{Mutex, Semaphore},
    time::{Instant, sleep, timeout, timeout_at},
};
use uuid::Uuid;

use crate::config::SandboxConfig;
use protocol::{FINISHED_MARKER, run_commands, setup_commands};

const QUIT_GRACE: Duration = Duration::from_secs(5);
const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("simulator unavailable: {0}")]
    Unavailable(String),
    #[error("simulator I/O failed: {0}")]
    Io(#[from] io::Error),
}

/// A running simulator that accepts command scripts on stdin.
#[async_trait]
pub trait SimProcess: Send {
    fn has_exited(&mut self) -> bool;

    async fn send(&mut self, commands: &str) -> io::Result<()>;

    /// Next stdout line without its terminator. `None` when nothing is
    /// available right now.
    async fn next_line(&mut self) -> io::Result<Option<String>>;

    /// Whatever the process printed before exiting.
    async fn remaining_output(&mut self) -> io::Result<String>;

    /// Asks the process to quit, killing it if it does not within `grace`.
    async fn quit(&mut self, grace: Duration);
}

#[async_trait]
pub trait SimLauncher: Send + Sync {
    async fn launch(&self) -> io::Result<Box<dyn SimProcess>>;
}

/// Launches Microchip's MDB command-line simulator.
pub struct MdbLauncher {
    command: String,
}

impl MdbLauncher {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

#[async_trait]
impl SimLauncher for MdbLauncher {
    async fn launch(&self) -> io::Result<Box<dyn SimProcess>> {
        let mut parts = self.command.split_whitespace();
        let program = parts
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty simulator command"))?;

        let mut child = Command::new(program)
            .args(parts)
            // MDB is a JVM program and grabs far too much heap by default.
            .env("JAVA_TOOL_OPTIONS", "-Xms750M -Xmx750M")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| io::Error::other("simulator stdin not captured"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("simulator stdout not captured"))?;

        Ok(Box::new(MdbProcess {
            child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
        }))
    }
}

struct MdbProcess {
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
}

#[async_trait]
impl SimProcess for MdbProcess {
    fn has_exited(&mut self) -> bool {
        !matches!(self.child.try_wait(), Ok(None))
    }

    async fn send(&mut self, commands: &str) -> io::Result<()> {
        self.stdin.write_all(commands.as_bytes()).await?;
        self.stdin.flush().await
    }

    async fn next_line(&mut self) -> io::Result<Option<String>> {
        self.stdout.next_line().await
    }

    async fn remaining_output(&mut self) -> io::Result<String> {
        let mut rest = String::new();
        while let Some(line) = self.stdout.next_line().await? {
            rest.push_str(&line);
            rest.push('\n');
        }
        Ok(rest)
    }

    async fn quit(&mut self, grace: Duration) {
        if let Err(e) = self.send("quit\n").await {
            tracing::debug!("Simulator did not accept quit: {}", e);
        }
        if timeout(grace, self.child.wait()).await.is_err() {
            tracing::warn!("Simulator ignored quit, killing it");
            if let Err(e) = self.child.kill().await {
                tracing::error!("Failed to kill simulator: {}", e);
            }
        }
    }
}

/// One simulator process plus the scratch file its UART output goes to.
struct SandboxSession {
    process: Box<dyn SimProcess>,
    temp_dir: PathBuf,
    output_path: PathBuf,
    output: File,
    mcu: String,
}

impl SandboxSession {
    async fn start(launcher: &dyn SimLauncher, mcu: &str) -> Result<Self, SandboxError> {
        let mut process = launcher
            .launch()
            .await
            .map_err(|e| SandboxError::Unavailable(e.to_string()))?;

        let temp_dir = std::env::temp_dir().join(format!("bookserver-sim-{}", Uuid::new_v4()));
        fs::create_dir_all(&temp_dir).await?;
        let output_path = temp_dir.join("mdb_simout.txt");
        let output = OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(&output_path)
            .await?;

        process.send(&setup_commands(mcu)).await?;
        tracing::info!(mcu, "Simulator session started");

        Ok(Self {
            process,
            temp_dir,
            output_path,
            output,
            mcu: mcu.to_string(),
        })
    }

    async fn run(&mut self, binary: &Path, wait: Duration) -> Result<String, SandboxError> {
        self.output.set_len(0).await?;
        self.process
            .send(&run_commands(binary, &self.output_path))
            .await?;

        let deadline = Instant::now() + wait;
        let mut collected = String::new();
        loop {
            if self.process.has_exited() {
                collected.push_str(&self.process.remaining_output().await?);
                break;
            }

            match timeout_at(deadline, self.process.next_line()).await {
                Err(_) => {
                    tracing::warn!(binary = %binary.display(), "Simulation did not finish in time");
                    break;
                }
                Ok(Ok(Some(line))) => {
                    if line.trim_end_matches('\r') == FINISHED_MARKER {
                        // The simulator's own chatter is not part of the result.
                        collected.clear();
                        break;
                    }
                    collected.push_str(&line);
                    collected.push('\n');
                }
                Ok(Ok(None)) => {
                    if Instant::now() + POLL_INTERVAL >= deadline {
                        break;
                    }
                    sleep(POLL_INTERVAL).await;
                }
                Ok(Err(e)) => return Err(e.into()),
            }
        }

        let mut uart = Vec::new();
        let mut reader = File::open(&self.output_path).await?;
        reader.read_to_end(&mut uart).await?;
        collected.push_str(&String::from_utf8_lossy(&uart));
        Ok(collected)
    }

    async fn shutdown(mut self) {
        self.process.quit(QUIT_GRACE).await;
        drop(self.output);
        if let Err(e) = fs::remove_dir_all(&self.temp_dir).await {
            tracing::warn!("Failed to remove {}: {}", self.temp_dir.display(), e);
        }
    }
}

/// A fixed number of simulator slots. At most one run per slot at a time.
pub struct SandboxPool {
    launcher: Arc<dyn SimLauncher>,
    slots: Vec<Arc<Mutex<Option<SandboxSession>>>>,
    permits: Semaphore,
    wait: Duration,
}

impl SandboxPool {
    pub fn new(launcher: Arc<dyn SimLauncher>, workers: usize, wait: Duration) -> Self {
        let workers = workers.max(1);
        Self {
            launcher,
            slots: (0..workers).map(|_| Arc::new(Mutex::new(None))).collect(),
            permits: Semaphore::new(workers),
            wait,
        }
    }

    pub fn from_config(config: &SandboxConfig) -> Self {
        Self::new(
            Arc::new(MdbLauncher::new(config.sim_command.clone())),
            config.workers,
            config.wait,
        )
    }

    /// Runs `binary` on a simulated `mcu` and returns stdout followed by the
    /// program's UART output.
    ///
    /// Returns whatever was captured once the wait expires; a run that never
    /// signals completion is not an error.
    pub async fn run(&self, mcu: &str, binary: &Path) -> Result<String, SandboxError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| SandboxError::Unavailable("sandbox pool is closed".into()))?;

        let mut slot = self
            .slots
            .iter()
            .find_map(|slot| slot.clone().try_lock_owned().ok())
            .ok_or_else(|| SandboxError::Unavailable("no free simulator slot".into()))?;

        let alive = match slot.as_mut() {
            Some(session) => !session.process.has_exited(),
            None => false,
        };
        if !alive {
            if let Some(dead) = slot.take() {
                tracing::warn!(mcu = %dead.mcu, "Simulator exited, respawning");
                dead.shutdown().await;
            }
            *slot = Some(SandboxSession::start(self.launcher.as_ref(), mcu).await?);
        }

        let Some(session) = slot.as_mut() else {
            return Err(SandboxError::Unavailable("simulator session missing".into()));
        };

        if session.mcu != mcu {
            session.process.send(&setup_commands(mcu)).await?;
            session.mcu = mcu.to_string();
        }

        let result = session.run(binary, self.wait).await;
        if let Err(e) = &result {
            tracing::error!(mcu, "Simulator run failed: {}", e);
            if let Some(broken) = slot.take() {
                broken.shutdown().await;
            }
        }
        result
    }

    /// Stops every simulator process. Failures are logged, not returned.
    pub async fn shutdown(&self) {
        self.permits.close();
        for slot in &self.slots {
            if let Some(session) = slot.lock().await.take() {
                session.shutdown().await;
            }
        }
    }
}
