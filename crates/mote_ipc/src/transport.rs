//! Platform seam for the local transport: a Unix-domain socket on POSIX,
//! a named pipe on Windows.

/// Default bind point on POSIX systems.
#[cfg(unix)]
pub const DEFAULT_ENDPOINT: &str = "/tmp/mote.sock";

/// Default bind point on Windows.
#[cfg(windows)]
pub const DEFAULT_ENDPOINT: &str = r"\\.\pipe\mote-ipc";

/// Environment variable naming the broker's bind point for child processes.
pub const ENDPOINT_ENV: &str = "MOTE_SOCKET_PATH";

/// Environment variable naming the role a child should register as.
pub const ROLE_ENV: &str = "MOTE_ROLE";

#[cfg(unix)]
pub use unix::{bind, connect, ClientStream, IpcListener, ServerStream};

#[cfg(windows)]
pub use windows::{bind, connect, ClientStream, IpcListener, ServerStream};

#[cfg(unix)]
mod unix {
    use std::{
        fs,
        os::unix::fs::PermissionsExt,
        path::{Path, PathBuf},
    };

    use tokio::net::{UnixListener, UnixStream};
    use tracing::debug;

    use crate::IpcError;

    pub type ServerStream = UnixStream;
    pub type ClientStream = UnixStream;

    /// Listening end of the local transport.
    pub struct IpcListener {
        inner: UnixListener,
        path: PathBuf,
    }

    /// Binds the socket, replacing any stale file, owner-only permissions.
    pub fn bind(endpoint: &str) -> Result<IpcListener, IpcError> {
        let path = Path::new(endpoint);
        if path.exists() {
            debug!(path = %path.display(), "removing stale socket file");
            fs::remove_file(path).map_err(|source| IpcError::Bind {
                path: path.to_path_buf(),
                source,
            })?;
        }
        let inner = UnixListener::bind(path).map_err(|source| IpcError::Bind {
            path: path.to_path_buf(),
            source,
        })?;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(|source| {
            IpcError::Bind {
                path: path.to_path_buf(),
                source,
            }
        })?;
        Ok(IpcListener {
            inner,
            path: path.to_path_buf(),
        })
    }

    /// Connects to a listening broker.
    pub async fn connect(endpoint: &str) -> Result<ClientStream, IpcError> {
        UnixStream::connect(endpoint)
            .await
            .map_err(|source| IpcError::Connect {
                path: PathBuf::from(endpoint),
                source,
            })
    }

    impl IpcListener {
        pub async fn accept(&mut self) -> std::io::Result<ServerStream> {
            let (stream, _addr) = self.inner.accept().await?;
            Ok(stream)
        }

        /// Removes the socket file; called on broker shutdown.
        pub fn cleanup(&self) {
            let _ = fs::remove_file(&self.path);
        }
    }

    impl Drop for IpcListener {
        fn drop(&mut self) {
            self.cleanup();
        }
    }
}

#[cfg(windows)]
mod windows {
    use std::path::PathBuf;

    use tokio::net::windows::named_pipe::{ClientOptions, NamedPipeClient, NamedPipeServer, ServerOptions};

    use crate::IpcError;

    pub type ServerStream = NamedPipeServer;
    pub type ClientStream = NamedPipeClient;

    /// Listening end of the local transport.
    pub struct IpcListener {
        name: String,
        next: Option<NamedPipeServer>,
    }

    /// Creates the first pipe instance with default security.
    pub fn bind(endpoint: &str) -> Result<IpcListener, IpcError> {
        let first = ServerOptions::new()
            .first_pipe_instance(true)
            .create(endpoint)
            .map_err(|source| IpcError::Bind {
                path: PathBuf::from(endpoint),
                source,
            })?;
        Ok(IpcListener {
            name: endpoint.to_string(),
            next: Some(first),
        })
    }

    /// Connects to a listening broker.
    pub async fn connect(endpoint: &str) -> Result<ClientStream, IpcError> {
        ClientOptions::new()
            .open(endpoint)
            .map_err(|source| IpcError::Connect {
                path: PathBuf::from(endpoint),
                source,
            })
    }

    impl IpcListener {
        pub async fn accept(&mut self) -> std::io::Result<ServerStream> {
            let server = match self.next.take() {
                Some(server) => server,
                None => ServerOptions::new().create(&self.name)?,
            };
            server.connect().await?;
            self.next = Some(ServerOptions::new().create(&self.name)?);
            Ok(server)
        }

        /// Pipes vanish with their last handle; nothing to unlink.
        pub fn cleanup(&self) {}
    }
}

/// Resolves the endpoint a child process should connect to, falling back to
/// the platform default when the environment variable is absent.
pub fn endpoint_from_env() -> String {
    std::env::var(ENDPOINT_ENV).unwrap_or_else(|_| DEFAULT_ENDPOINT.to_string())
}

/// Resolves the role a child process should register as, if the spawning
/// supervisor provided one.
pub fn role_from_env() -> Option<crate::Role> {
    let name = std::env::var(ROLE_ENV).ok()?;
    crate::Role::from_name(&name)
}
