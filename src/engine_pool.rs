//! Engine Pool (§4.3): a bounded pool of ready native engine handles.
//! Grounded on `engine::process::EngineProcess` for the spawn/UCI-
//! handshake shape, reduced to the single `go movetime` / `bestmove`
//! exchange this service needs — no `info` stream parsing, that's
//! Pawn-Appetit's own concern.
//!
//! Platform binary selection (AVX2 / POPCNT / Apple Silicon) uses
//! `is_x86_feature_detected!`, the same runtime-feature-detection
//! idiom as `lib.rs::is_bmi2_compatible`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tokio::time::timeout;

use crate::config::ENGINE_POOL_CAPACITY;
use crate::error::{EngineError, EngineResult};
use crate::rules::BoardPosition;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Picks the engine binary best suited to the host CPU, preferring
/// AVX2, falling back to POPCNT on x86-64 Linux, or the Apple Silicon
/// build on macOS. `engine_dir` holds one binary per variant, named
/// after it (e.g. `stockfish-avx2`, `stockfish-popcnt`,
/// `stockfish-apple-silicon`, `stockfish`).
pub fn select_engine_binary(engine_dir: &Path) -> PathBuf {
    #[cfg(target_arch = "x86_64")]
    {
        if is_x86_feature_detected!("avx2") {
            return engine_dir.join("stockfish-avx2");
        }
        if is_x86_feature_detected!("popcnt") {
            return engine_dir.join("stockfish-popcnt");
        }
    }
    #[cfg(target_os = "macos")]
    {
        return engine_dir.join("stockfish-apple-silicon");
    }
    #[allow(unreachable_code)]
    engine_dir.join("stockfish")
}

/// A live UCI engine subprocess, configured for one skill level.
pub struct EngineHandle {
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
    skill: i32,
}

impl EngineHandle {
    pub async fn spawn(binary: &Path, skill: i32) -> EngineResult<Self> {
        info!("spawning engine process: {:?}", binary);
        let mut child = Command::new(binary)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .env("TERM", "dumb")
            .spawn()?;

        let stdin = child.stdin.take().ok_or(EngineError::ProcessExited)?;
        let stdout = child.stdout.take().ok_or(EngineError::ProcessExited)?;
        let stdout = BufReader::new(stdout).lines();

        let mut handle = Self {
            child,
            stdin,
            stdout,
            skill: skill.clamp(1, 20),
        };

        match timeout(HANDSHAKE_TIMEOUT, handle.handshake()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = handle.child.kill().await;
                return Err(e);
            }
            Err(_) => {
                let _ = handle.child.kill().await;
                return Err(EngineError::InitTimeout);
            }
        }

        handle.configure(handle.skill).await?;
        Ok(handle)
    }

    async fn handshake(&mut self) -> EngineResult<()> {
        self.send("uci").await?;
        while let Some(line) = self.stdout.next_line().await? {
            if line == "uciok" {
                self.send("isready").await?;
                while let Some(line) = self.stdout.next_line().await? {
                    if line == "readyok" {
                        return Ok(());
                    }
                }
                break;
            }
        }
        Err(EngineError::InitTimeout)
    }

    pub async fn configure(&mut self, skill: i32) -> EngineResult<()> {
        let skill = skill.clamp(1, 20);
        self.send(&format!("setoption name Skill Level value {skill}"))
            .await?;
        self.skill = skill;
        Ok(())
    }

    /// Request a move for `position`, waiting up to `time_limit`.
    pub async fn play(&mut self, position: &BoardPosition, time_limit: Duration) -> EngineResult<String> {
        let moves = position.uci_moves().join(" ");
        let command = if moves.is_empty() {
            "position startpos".to_string()
        } else {
            format!("position startpos moves {moves}")
        };
        self.send(&command).await?;
        self.send(&format!("go movetime {}", time_limit.as_millis()))
            .await?;

        let deadline = time_limit + Duration::from_secs(2);
        let bestmove = timeout(deadline, async {
            while let Some(line) = self.stdout.next_line().await? {
                if let Some(rest) = line.strip_prefix("bestmove ") {
                    let mv = rest.split_whitespace().next().unwrap_or_default();
                    return Ok(mv.to_string());
                }
            }
            Err(EngineError::ProcessExited)
        })
        .await
        .map_err(|_| EngineError::ProcessExited)??;

        if !position.is_legal(&bestmove) {
            return Err(EngineError::IllegalUciFromEngine(bestmove));
        }
        Ok(bestmove)
    }

    async fn send(&mut self, command: &str) -> EngineResult<()> {
        self.stdin.write_all(command.as_bytes()).await?;
        self.stdin.write_all(b"\n").await?;
        self.stdin.flush().await?;
        Ok(())
    }

    async fn shutdown(mut self) {
        let _ = self.send("quit").await;
        let _ = self.child.kill().await;
    }
}

/// Bounded pool of ready engine handles. `acquire`/`release` are
/// serialised by a single lock, as specified in §4.3 and §5.
pub struct EnginePool {
    binary: PathBuf,
    capacity: usize,
    idle: Mutex<Vec<EngineHandle>>,
}

impl EnginePool {
    pub fn new(binary: PathBuf) -> Self {
        Self::with_capacity(binary, ENGINE_POOL_CAPACITY)
    }

    pub fn with_capacity(binary: PathBuf, capacity: usize) -> Self {
        Self {
            binary,
            capacity,
            idle: Mutex::new(Vec::new()),
        }
    }

    /// Pop a ready handle configured for `skill`, or spawn a new one.
    /// A spawn failure is retried once before giving up with
    /// [`EngineError::NoReplacement`] (§7's "infra-failure" path).
    pub async fn acquire(&self, skill: i32) -> EngineResult<EngineHandle> {
        let popped = {
            let mut idle = self.idle.lock().await;
            idle.pop()
        };

        if let Some(mut handle) = popped {
            handle.configure(skill).await?;
            return Ok(handle);
        }

        match EngineHandle::spawn(&self.binary, skill).await {
            Ok(handle) => Ok(handle),
            Err(e) => {
                warn!("first engine spawn attempt failed ({e}), retrying once");
                EngineHandle::spawn(&self.binary, skill)
                    .await
                    .map_err(|_| EngineError::NoReplacement)
            }
        }
    }

    /// Return a handle. Disposed (process killed) if the pool is at
    /// capacity.
    pub async fn release(&self, handle: EngineHandle) {
        let mut idle = self.idle.lock().await;
        if idle.len() < self.capacity {
            idle.push(handle);
        } else {
            drop(idle);
            debug!("engine pool at capacity, disposing handle");
            handle.shutdown().await;
        }
    }

    /// Drain and kill every idle handle. Called on server shutdown so
    /// background loops never leave orphaned engine processes behind.
    pub async fn shutdown(&self) {
        let handles: Vec<_> = std::mem::take(&mut *self.idle.lock().await);
        for handle in handles {
            handle.shutdown().await;
        }
        warn!("engine pool shut down");
    }
}
