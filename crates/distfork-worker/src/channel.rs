//! Node channel abstraction
//!
//! A `Channel` is the orchestrator's handle on one side of the node pair:
//! files on that node, its clock, and TCP endpoints bound or dialled from it.
//! The orchestrator holds one for the controller and one for the worker.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Operations the orchestrator needs from a node.
pub trait Channel: Send + Sync {
    /// Node name used in the execution log.
    fn node_name(&self) -> &str;

    /// Designated temp root for workspaces on this node.
    fn root_path(&self) -> &Path;

    /// Read this node's clock.
    fn system_time(&self) -> io::Result<SystemTime>;

    /// Open a file on this node for reading.
    fn open_read(&self, path: &Path) -> io::Result<Box<dyn Read + Send>>;

    /// Create (or truncate) a file on this node, creating parent directories.
    fn open_write(&self, path: &Path) -> io::Result<Box<dyn Write + Send>>;

    /// Unix permission bits of a file on this node.
    fn permissions(&self, path: &Path) -> io::Result<u32>;

    /// Set unix permission bits of a file on this node.
    fn set_permissions(&self, path: &Path, mode: u32) -> io::Result<()>;

    fn exists(&self, path: &Path) -> io::Result<bool>;

    fn remove_file(&self, path: &Path) -> io::Result<()>;

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;

    /// Bind a listener on this node.
    fn bind(&self, port: u16) -> io::Result<TcpListener>;

    /// Open a connection to `host:port` as reached from this node.
    fn connect(&self, host: &str, port: u16) -> io::Result<TcpStream>;
}

/// Channel backed by the local filesystem and network stack.
#[derive(Debug, Clone)]
pub struct LocalChannel {
    name: String,
    root: PathBuf,
    bind_host: String,
}

impl LocalChannel {
    /// Create a local channel. An empty name is reported as `master`.
    pub fn new(name: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        let name = name.into();
        Self {
            name: if name.is_empty() { "master".to_string() } else { name },
            root: root.into(),
            bind_host: "127.0.0.1".to_string(),
        }
    }

    /// Bind tunnel listeners on a different local address (default 127.0.0.1).
    pub fn with_bind_host(mut self, host: impl Into<String>) -> Self {
        self.bind_host = host.into();
        self
    }
}

impl Channel for LocalChannel {
    fn node_name(&self) -> &str {
        &self.name
    }

    fn root_path(&self) -> &Path {
        &self.root
    }

    fn system_time(&self) -> io::Result<SystemTime> {
        Ok(SystemTime::now())
    }

    fn open_read(&self, path: &Path) -> io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(File::open(path)?))
    }

    fn open_write(&self, path: &Path) -> io::Result<Box<dyn Write + Send>> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        Ok(Box::new(File::create(path)?))
    }

    #[cfg(unix)]
    fn permissions(&self, path: &Path) -> io::Result<u32> {
        use std::os::unix::fs::PermissionsExt;
        Ok(fs::metadata(path)?.permissions().mode() & 0o7777)
    }

    #[cfg(not(unix))]
    fn permissions(&self, path: &Path) -> io::Result<u32> {
        let readonly = fs::metadata(path)?.permissions().readonly();
        Ok(if readonly { 0o444 } else { 0o644 })
    }

    #[cfg(unix)]
    fn set_permissions(&self, path: &Path, mode: u32) -> io::Result<()> {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(mode))
    }

    #[cfg(not(unix))]
    fn set_permissions(&self, path: &Path, mode: u32) -> io::Result<()> {
        let mut perms = fs::metadata(path)?.permissions();
        perms.set_readonly(mode & 0o222 == 0);
        fs::set_permissions(path, perms)
    }

    fn exists(&self, path: &Path) -> io::Result<bool> {
        path.try_exists()
    }

    fn remove_file(&self, path: &Path) -> io::Result<()> {
        fs::remove_file(path)
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        fs::rename(from, to)
    }

    fn bind(&self, port: u16) -> io::Result<TcpListener> {
        TcpListener::bind((self.bind_host.as_str(), port))
    }

    fn connect(&self, host: &str, port: u16) -> io::Result<TcpStream> {
        TcpStream::connect((host, port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_name_is_master() {
        let channel = LocalChannel::new("", "/tmp");
        assert_eq!(channel.node_name(), "master");
    }

    #[test]
    fn test_open_write_creates_parents() {
        let dir = tempfile::tempdir().unwrap();
        let channel = LocalChannel::new("local", dir.path());
        let target = dir.path().join("a/b/c.txt");

        let mut w = channel.open_write(&target).unwrap();
        w.write_all(b"hello").unwrap();
        drop(w);

        let mut content = String::new();
        channel.open_read(&target).unwrap().read_to_string(&mut content).unwrap();
        assert_eq!(content, "hello");
        assert!(channel.exists(&target).unwrap());
    }

    #[cfg(unix)]
    #[test]
    fn test_permission_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let channel = LocalChannel::new("local", dir.path());
        let target = dir.path().join("script.sh");
        fs::write(&target, "#!/bin/sh\n").unwrap();

        channel.set_permissions(&target, 0o750).unwrap();
        assert_eq!(channel.permissions(&target).unwrap(), 0o750);
    }

    #[test]
    fn test_bind_ephemeral_port() {
        let channel = LocalChannel::new("local", "/tmp");
        let listener = channel.bind(0).unwrap();
        let port = listener.local_addr().unwrap().port();
        assert_ne!(port, 0);
        let _client = channel.connect("127.0.0.1", port).unwrap();
    }
}
