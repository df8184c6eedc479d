use crate::lifecycle::Lifecycle;
use crossbeam_channel::Sender;
use serde::{Deserialize, Serialize};
use std::io::{self, BufRead, Write};
use std::net::Shutdown;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::thread::JoinHandle;
use std::time::Duration;
use std::{env, fs};
use tracing::{debug, error, info, trace, warn};

const ACCEPT_POLL: Duration = Duration::from_millis(50);

/// User commands for the summary view.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControlMessage {
    Reset,
    Quit,
}

impl ControlMessage {
    /// Maps a console line (`r`, `reset`, `q`, `quit`) to a command.
    pub fn from_key(line: &str) -> Option<Self> {
        match line.trim().to_ascii_lowercase().as_str() {
            "r" | "reset" => Some(Self::Reset),
            "q" | "quit" => Some(Self::Quit),
            _ => None,
        }
    }
}

pub fn socket_path() -> PathBuf {
    if let Some(path) = env::var_os("MULTICAM_SOCKET") {
        return PathBuf::from(path);
    }
    env::var_os("XDG_RUNTIME_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(env::temp_dir)
        .join("multicam-tally.sock")
}

/// Sends `msg` to the running pipeline.
pub fn send_command(msg: ControlMessage) -> io::Result<()> {
    let mut stream = UnixStream::connect(socket_path())?;
    serde_json::to_writer(&mut stream, &msg)?;
    stream.flush()?;
    let _ = stream.shutdown(Shutdown::Write);
    Ok(())
}

/// Accepts control messages on the pipeline socket.
pub struct ControlListener {
    listener: UnixListener,
    path: PathBuf,
}

impl ControlListener {
    /// Binds the control socket. A socket file left behind by a dead
    /// process is replaced; one that still accepts connections is not.
    pub fn bind(path: &Path) -> io::Result<Self> {
        if path.exists() {
            if UnixStream::connect(path).is_ok() {
                return Err(io::Error::new(
                    io::ErrorKind::AddrInUse,
                    format!("{} is in use by a running pipeline", path.display()),
                ));
            }
            fs::remove_file(path)?;
            trace!(path = %path.display(), "removed stale socket");
        }
        let listener = UnixListener::bind(path)?;
        listener.set_nonblocking(true)?;
        debug!(path = %path.display(), "control socket bound");
        Ok(Self {
            listener,
            path: path.to_path_buf(),
        })
    }

    /// Forwards every decoded message to `commands` until the lifecycle
    /// stops, then removes the socket file.
    pub fn spawn(
        self,
        commands: Sender<ControlMessage>,
        lifecycle: Lifecycle,
    ) -> io::Result<JoinHandle<()>> {
        std::thread::Builder::new()
            .name("control".to_string())
            .spawn(move || {
                while lifecycle.is_running() {
                    match self.listener.accept() {
                        Ok((stream, _)) => {
                            if let Some(msg) = read_message(stream) {
                                debug!(?msg, "control message received");
                                if commands.send(msg).is_err() {
                                    break;
                                }
                            }
                        }
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                            lifecycle.sleep(ACCEPT_POLL);
                        }
                        Err(e) => {
                            error!("failed to accept connection: {e}");
                            lifecycle.sleep(ACCEPT_POLL);
                        }
                    }
                }
                let _ = fs::remove_file(&self.path);
                debug!("control socket closed");
            })
    }
}

fn read_message(stream: UnixStream) -> Option<ControlMessage> {
    // accepted sockets inherit non-blocking mode from the listener
    if let Err(e) = stream.set_nonblocking(false) {
        warn!("failed to configure control connection: {e}");
        return None;
    }
    let _ = stream.set_read_timeout(Some(Duration::from_secs(1)));
    match serde_json::from_reader(stream) {
        Ok(msg) => Some(msg),
        Err(e) if e.is_eof() => {
            trace!("control connection closed without a message");
            None
        }
        Err(e) => {
            warn!("invalid control message: {e}");
            None
        }
    }
}

/// Reads commands from stdin. The thread is detached: a blocking stdin read
/// cannot be interrupted, and it ends with the process.
pub fn spawn_console_reader(commands: Sender<ControlMessage>) -> io::Result<()> {
    std::thread::Builder::new()
        .name("console".to_string())
        .spawn(move || {
            info!("console commands: r = reset counts, q = quit");
            for line in io::stdin().lock().lines() {
                let Ok(line) = line else {
                    break;
                };
                match ControlMessage::from_key(&line) {
                    Some(msg) => {
                        if commands.send(msg).is_err() {
                            break;
                        }
                    }
                    None if line.trim().is_empty() => {}
                    None => warn!(input = %line.trim(), "unknown command"),
                }
            }
        })
        .map(|_| ())
}
