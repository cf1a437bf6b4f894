//! Attach listener
//!
//! A Unix socket at `<dir>/.hotswap_pid<pid>` accepting one request per
//! connection. Connections are served one at a time on a background thread,
//! so concurrent loads into the same runtime are serialized.

use crate::loader::AgentLoader;
use crate::protocol::{self, RejectCode, Request, Response, PROTOCOL_VERSION};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// How long a connected controller may take to send its request
pub const REQUEST_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Running attach listener; the socket is removed on drop
#[derive(Debug)]
pub struct AttachListener {
    path: PathBuf,
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl AttachListener {
    /// Bind the socket for this process inside `dir` and start serving
    ///
    /// A leftover socket file from an earlier process with the same pid is
    /// replaced.
    ///
    /// # Errors
    /// Returns error if the directory or socket cannot be created, or
    /// [`io::ErrorKind::Unsupported`] on platforms without Unix sockets
    #[cfg(unix)]
    pub fn bind(dir: &Path, loader: AgentLoader) -> io::Result<Self> {
        use std::os::unix::fs::PermissionsExt;
        use std::os::unix::net::UnixListener;

        std::fs::create_dir_all(dir)?;
        let path = protocol::socket_path(dir, std::process::id());
        match std::fs::remove_file(&path) {
            Ok(()) => tracing::debug!(path = %path.display(), "removed stale attach socket"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }

        let listener = UnixListener::bind(&path)?;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let stop = Arc::clone(&shutdown);
        let handle = std::thread::Builder::new()
            .name("hotswap-attach-listener".to_string())
            .spawn(move || serve(&listener, &loader, &stop))?;

        tracing::info!(path = %path.display(), "attach listener started");
        Ok(Self {
            path,
            shutdown,
            handle: Some(handle),
        })
    }

    /// Unix sockets are unavailable on this platform
    ///
    /// # Errors
    /// Always returns [`io::ErrorKind::Unsupported`]
    #[cfg(not(unix))]
    pub fn bind(_dir: &Path, _loader: AgentLoader) -> io::Result<Self> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "attach listener requires Unix domain sockets",
        ))
    }

    /// Socket path controllers connect to
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for AttachListener {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        // Wake the accept loop so it observes the flag.
        #[cfg(unix)]
        let _ = std::os::unix::net::UnixStream::connect(&self.path);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        let _ = std::fs::remove_file(&self.path);
        tracing::debug!(path = %self.path.display(), "attach listener stopped");
    }
}

#[cfg(unix)]
fn serve(listener: &std::os::unix::net::UnixListener, loader: &AgentLoader, stop: &AtomicBool) {
    for stream in listener.incoming() {
        if stop.load(Ordering::SeqCst) {
            break;
        }
        match stream {
            Ok(stream) => {
                if let Err(e) = handle_connection(&stream, loader) {
                    tracing::warn!(error = %e, "attach connection failed");
                }
            }
            Err(e) => tracing::warn!(error = %e, "attach accept failed"),
        }
    }
}

#[cfg(unix)]
fn handle_connection(
    stream: &std::os::unix::net::UnixStream,
    loader: &AgentLoader,
) -> Result<(), protocol::ProtocolError> {
    stream.set_read_timeout(Some(REQUEST_READ_TIMEOUT))?;
    let mut reader = io::BufReader::new(stream);
    let response = match protocol::read_message::<_, Request>(&mut reader) {
        Ok(request) => respond(request, loader),
        Err(protocol::ProtocolError::Closed) => return Ok(()),
        Err(e) => Response::Rejected {
            code: RejectCode::Protocol,
            message: e.to_string(),
        },
    };
    let mut writer = stream;
    protocol::write_message(&mut writer, &response)
}

fn respond(request: Request, loader: &AgentLoader) -> Response {
    match request {
        Request::LoadAgent { protocol, .. } if protocol != PROTOCOL_VERSION => Response::Rejected {
            code: RejectCode::Protocol,
            message: format!(
                "unsupported protocol version {protocol}, expected {PROTOCOL_VERSION}"
            ),
        },
        Request::LoadAgent { artifact, .. } => {
            tracing::debug!(artifact = %artifact.display(), "load request");
            match loader.load_from_path(&artifact) {
                Ok(loaded) => Response::Loaded {
                    agent_id: loaded.agent_id,
                    entry_point: loaded.entry_point,
                    capability_id: loaded.capability_id,
                    digest: loaded.digest,
                },
                Err(rejection) => {
                    tracing::warn!(
                        artifact = %artifact.display(),
                        code = ?rejection.code,
                        "load rejected: {}",
                        rejection.message
                    );
                    Response::Rejected {
                        code: rejection.code,
                        message: rejection.message,
                    }
                }
            }
        }
    }
}
