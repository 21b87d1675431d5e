//! PTY-backed child process management for agent CLIs.
//!
//! Agents are spawned under a pseudo-terminal rather than a plain pipe so
//! that CLIs which detect an interactive terminal (colored output, spinners,
//! a handful of TUIs) behave the same way under supervision as they would
//! in a developer's own shell.

use std::io::{Read, Write};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use tokio::sync::{broadcast, Mutex as AsyncMutex};

/// A running agent process bridged through a PTY.
///
/// Output is copied onto a broadcast channel from a dedicated blocking
/// thread (portable-pty's reader is synchronous); input is written through
/// an async mutex so RPC calls and the loop runner's own prompt injection
/// never interleave writes.
pub struct PtySession {
    master: Box<dyn MasterPty + Send>,
    writer: AsyncMutex<Box<dyn Write + Send>>,
    child: Mutex<Box<dyn Child + Send + Sync>>,
    output_tx: broadcast::Sender<Vec<u8>>,
}

impl PtySession {
    /// Spawn `command` under a new PTY of the given size in `cwd`.
    pub fn spawn(
        command: &str,
        args: &[String],
        cwd: &std::path::Path,
        envs: &[(String, String)],
        cols: u16,
        rows: u16,
    ) -> Result<Arc<Self>> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .context("failed to open pty")?;

        let mut cmd = CommandBuilder::new(command);
        cmd.args(args);
        cmd.cwd(cwd);
        for (key, value) in envs {
            cmd.env(key, value);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .with_context(|| format!("failed to spawn {command}"))?;
        drop(pair.slave);

        let mut reader = pair
            .master
            .try_clone_reader()
            .context("failed to clone pty reader")?;
        let writer = pair
            .master
            .take_writer()
            .context("failed to take pty writer")?;

        let (output_tx, _) = broadcast::channel(4096);
        let tx_for_thread = output_tx.clone();

        std::thread::spawn(move || {
            let mut buf = [0u8; 4096];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        let _ = tx_for_thread.send(buf[..n].to_vec());
                    }
                    Err(_) => break,
                }
            }
        });

        Ok(Arc::new(Self {
            master: pair.master,
            writer: AsyncMutex::new(writer),
            child: Mutex::new(child),
            output_tx,
        }))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Vec<u8>> {
        self.output_tx.subscribe()
    }

    /// Write bytes into the PTY's input side. Used both for prompt injection
    /// between iterations and for interactive passthrough.
    pub async fn write(&self, data: &[u8]) -> Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(data).context("failed to write to pty")?;
        writer.flush().context("failed to flush pty writer")?;
        Ok(())
    }

    pub fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        self.master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .context("failed to resize pty")
    }

    /// Non-blocking check of whether the child has exited, returning its
    /// exit code if so.
    pub fn try_wait(&self) -> Result<Option<i32>> {
        let mut child = self.child.lock().map_err(|_| anyhow!("pty child lock poisoned"))?;
        match child.try_wait()? {
            Some(status) => Ok(Some(status.exit_code() as i32)),
            None => Ok(None),
        }
    }

    pub fn kill(&self) -> Result<()> {
        let mut child = self.child.lock().map_err(|_| anyhow!("pty child lock poisoned"))?;
        child.kill().context("failed to kill pty child")
    }

    pub fn process_id(&self) -> Option<u32> {
        let child = self.child.lock().ok()?;
        child.process_id()
    }
}
