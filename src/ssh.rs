use anyhow::{anyhow, bail, Context, Result};
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use base64::Engine;
use sha2::{Digest, Sha256};
use ssh2::{CheckResult, HostKeyType, KnownHostFileKind, KnownHostKeyFormat, Session};
use std::fs;
use std::io::Read;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::path::PathBuf;
use std::time::Duration;

use crate::constants::DEFAULT_SSH_PORT;
use crate::exec::{CommandExecutor, CommandOutput};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Clone)]
pub struct SshTarget {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub private_key_path: Option<PathBuf>,
    pub private_key_passphrase: Option<String>,
    pub password: Option<String>,
    pub known_hosts_path: PathBuf,
    pub host_key_fingerprint: Option<String>,
    pub command_timeout: Duration,
}

impl std::fmt::Debug for SshTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshTarget")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("private_key_path", &self.private_key_path)
            .field(
                "private_key_passphrase",
                &self.private_key_passphrase.as_ref().map(|_| "<redacted>"),
            )
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("known_hosts_path", &self.known_hosts_path)
            .field("host_key_fingerprint", &self.host_key_fingerprint)
            .field("command_timeout", &self.command_timeout)
            .finish()
    }
}

/// TCP connect plus SSH handshake, trying each resolved address in turn.
fn open_session(host: &str, port: u16, io_timeout: Duration) -> Result<Session> {
    let addrs: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .with_context(|| format!("Failed to resolve {host}"))?
        .collect();
    let mut last_err = None;
    let tcp = addrs
        .iter()
        .find_map(|addr| match TcpStream::connect_timeout(addr, CONNECT_TIMEOUT) {
            Ok(tcp) => Some(tcp),
            Err(err) => {
                last_err = Some(err);
                None
            }
        })
        .ok_or_else(|| match last_err {
            Some(err) => anyhow!("Failed to connect to {host}:{port}: {err}"),
            None => anyhow!("{host} resolved to no addresses"),
        })?;
    tcp.set_read_timeout(Some(io_timeout)).ok();
    tcp.set_write_timeout(Some(io_timeout)).ok();

    let mut session = Session::new().context("Failed to create SSH session")?;
    session.set_tcp_stream(tcp);
    session
        .handshake()
        .with_context(|| format!("SSH handshake with {host}:{port} failed"))?;
    Ok(session)
}

pub fn fingerprint_sha256(key: &[u8]) -> String {
    let digest = Sha256::digest(key);
    format!("SHA256:{}", STANDARD_NO_PAD.encode(digest))
}

fn key_algorithm(key_type: HostKeyType) -> &'static str {
    match key_type {
        HostKeyType::Rsa => "ssh-rsa",
        HostKeyType::Dss => "ssh-dss",
        HostKeyType::Ecdsa256 => "ecdsa-sha2-nistp256",
        HostKeyType::Ecdsa384 => "ecdsa-sha2-nistp384",
        HostKeyType::Ecdsa521 => "ecdsa-sha2-nistp521",
        HostKeyType::Ed25519 => "ssh-ed25519",
        HostKeyType::Unknown => "unknown",
    }
}

fn known_hosts_name(host: &str, port: u16) -> String {
    if port == DEFAULT_SSH_PORT {
        host.to_string()
    } else {
        format!("[{host}]:{port}")
    }
}

/// One `known_hosts` line for the given key.
pub fn known_hosts_entry(host: &str, port: u16, key_type: HostKeyType, key: &[u8]) -> String {
    format!(
        "{} {} {}",
        known_hosts_name(host, port),
        key_algorithm(key_type),
        STANDARD.encode(key)
    )
}

impl SshTarget {
    fn label(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Accepts the session's host key if known_hosts has it, or pins it when it
    /// matches the approved fingerprint. Anything else refuses the connection.
    fn trust_host_key(&self, session: &Session) -> Result<()> {
        let (key, key_type) = session
            .host_key()
            .ok_or_else(|| anyhow!("{} offered no SSH host key", self.label()))?;
        let fingerprint = fingerprint_sha256(key);

        let path = &self.known_hosts_path;
        let mut known_hosts = session.known_hosts()?;
        if path.exists() {
            known_hosts
                .read_file(path, KnownHostFileKind::OpenSSH)
                .with_context(|| format!("Failed to read {}", path.display()))?;
        }
        match known_hosts.check_port(&self.host, self.port, key) {
            CheckResult::Match => return Ok(()),
            CheckResult::NotFound => {}
            CheckResult::Mismatch => bail!(
                "SSH host key for {} changed; refusing to connect. Remove the stale entry from {} if the host was rebuilt.",
                self.label(),
                path.display()
            ),
            CheckResult::Failure => bail!(
                "Unable to check the SSH host key for {} against {}",
                self.label(),
                path.display()
            ),
        }

        let approved = match self.host_key_fingerprint.as_deref().map(str::trim) {
            Some(approved) if approved == fingerprint => approved,
            Some(approved) => bail!(
                "SSH host key fingerprint for {} is {fingerprint}, expected {approved}",
                self.label()
            ),
            None => bail!(
                "SSH host key for {} is not trusted yet ({fingerprint}); run `deployctl hostkey` and set host_key_fingerprint",
                self.label()
            ),
        };
        known_hosts.add(
            &known_hosts_name(&self.host, self.port),
            key,
            "deployctl",
            KnownHostKeyFormat::from(key_type),
        )?;
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }
        known_hosts
            .write_file(path, KnownHostFileKind::OpenSSH)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        tracing::info!(host = %self.host, fingerprint = approved, "pinned SSH host key");
        Ok(())
    }
}

fn authenticate(session: &Session, target: &SshTarget) -> Result<()> {
    if let Some(key_path) = &target.private_key_path {
        session
            .userauth_pubkey_file(
                &target.username,
                None,
                key_path,
                target.private_key_passphrase.as_deref(),
            )
            .with_context(|| format!("SSH key authentication failed ({})", key_path.display()))?;
    } else if let Some(password) = target.password.as_deref().filter(|p| !p.trim().is_empty()) {
        session
            .userauth_password(&target.username, password)
            .context("SSH password authentication failed")?;
    } else {
        session
            .userauth_agent(&target.username)
            .context("SSH agent authentication failed")?;
    }
    if !session.authenticated() {
        bail!("SSH authentication failed for {}", target.username);
    }
    Ok(())
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct HostKeyScan {
    pub host: String,
    pub port: u16,
    pub key_type: String,
    pub fingerprint_sha256: String,
    pub known_hosts_entry: String,
}

/// Handshake only; reports the host key so an operator can approve it.
pub fn scan_host_key(host: &str, port: u16) -> Result<HostKeyScan> {
    let session = open_session(host, port, CONNECT_TIMEOUT)?;
    let (host_key, host_key_type) = session
        .host_key()
        .ok_or_else(|| anyhow!("{host}:{port} offered no SSH host key"))?;
    Ok(HostKeyScan {
        host: host.to_string(),
        port,
        key_type: key_algorithm(host_key_type).to_string(),
        fingerprint_sha256: fingerprint_sha256(host_key),
        known_hosts_entry: known_hosts_entry(host, port, host_key_type, host_key),
    })
}

pub struct SshExecutor {
    session: Session,
    target: SshTarget,
}

impl SshExecutor {
    pub fn connect(target: SshTarget) -> Result<Self> {
        let session = open_session(&target.host, target.port, target.command_timeout)?;
        target.trust_host_key(&session)?;
        authenticate(&session, &target)?;
        let millis = target.command_timeout.as_millis().min(u128::from(u32::MAX)) as u32;
        session.set_timeout(millis);
        tracing::info!(host = %target.host, port = target.port, user = %target.username, "SSH session established");
        Ok(Self { session, target })
    }
}

impl CommandExecutor for SshExecutor {
    fn run(&mut self, command: &str) -> Result<CommandOutput> {
        let mut channel = self
            .session
            .channel_session()
            .context("Failed to open SSH channel")?;
        channel
            .exec(command)
            .with_context(|| format!("Failed to exec {command}"))?;
        let mut stdout = String::new();
        channel
            .read_to_string(&mut stdout)
            .context("Failed to read remote stdout")?;
        let mut stderr = String::new();
        channel.stderr().read_to_string(&mut stderr).ok();
        channel.wait_close().ok();
        let returncode = channel.exit_status().unwrap_or(-1);
        Ok(CommandOutput {
            command: command.to_string(),
            ok: returncode == 0,
            stdout: stdout.trim().to_string(),
            stderr: stderr.trim().to_string(),
            returncode,
        })
    }

    fn host_ref(&self) -> String {
        format!(
            "{}@{}:{}",
            self.target.username, self.target.host, self.target.port
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_hosts_entry_brackets_non_default_ports() {
        let key = b"not-a-real-key";
        let entry = known_hosts_entry("10.0.0.5", 2222, HostKeyType::Ed25519, key);
        assert!(entry.starts_with("[10.0.0.5]:2222 ssh-ed25519 "), "{entry}");
        let entry = known_hosts_entry("deploy.example.com", 22, HostKeyType::Rsa, key);
        assert!(entry.starts_with("deploy.example.com ssh-rsa "), "{entry}");
    }

    #[test]
    fn fingerprint_matches_openssh_format() {
        let fp = fingerprint_sha256(b"abc");
        assert!(fp.starts_with("SHA256:"));
        assert!(!fp.ends_with('='));
    }

    #[test]
    fn refused_connection_names_the_target() {
        let err = open_session("127.0.0.1", 1, Duration::from_secs(1)).err().expect("connection to port 1 should fail");
        assert!(err.to_string().contains("127.0.0.1:1"), "{err:#}");
    }

    #[test]
    fn debug_output_redacts_secrets() {
        let target = SshTarget {
            host: "h".to_string(),
            port: 22,
            username: "deploy".to_string(),
            private_key_path: None,
            private_key_passphrase: Some("hunter2".to_string()),
            password: Some("swordfish".to_string()),
            known_hosts_path: PathBuf::from("/tmp/known_hosts"),
            host_key_fingerprint: None,
            command_timeout: Duration::from_secs(1),
        };
        let rendered = format!("{target:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(!rendered.contains("swordfish"));
    }
}
