//! Peer authorization by code signing identity.
//!
//! A connecting process is trusted only when its executable carries exactly
//! the same signing-certificate chain as the helper itself, i.e. it ships in
//! the same signed distribution. The check runs once per connection, at accept
//! time, and every failure along the way counts as a rejection.
//!
//! The identity is derived from the connecting pid (`SO_PEERCRED` or
//! `LOCAL_PEERPID`) and then that pid's executable path, both read after the
//! connection exists. This is racy: a process can connect, pass the fd to
//! another process and exec a signed binary, or exit and have its pid reused,
//! before the check resolves the path. Closing that gap needs an audit-token
//! based check on the connecting process, which this module does not do.
//!
//! CHANGELOG:
//! - 10/17/2026 - Initial implementation

use std::ffi::OsStr;
use std::fs;
use std::io;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::process::Command;

use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::error::{HelperError, Result};

/// Ordered signing-certificate fingerprints (leaf first, as the signature
/// stores them). Only ever compared for equality.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateChain(Vec<String>);

impl CertificateChain {
    pub fn new(fingerprints: Vec<String>) -> Self {
        Self(fingerprints)
    }

    /// Fingerprint DER certificates in the given order.
    pub fn from_der<I, B>(certs: I) -> Self
    where
        I: IntoIterator<Item = B>,
        B: AsRef<[u8]>,
    {
        Self(
            certs
                .into_iter()
                .map(|der| hex::encode(Sha256::digest(der.as_ref())))
                .collect(),
        )
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

/// Source of code identities. Implementations resolve, validate and extract;
/// comparison stays in the authorizer.
pub trait SignatureInspector: Send + Sync {
    /// Chain of the running helper.
    fn chain_for_self(&self) -> Result<CertificateChain>;

    /// Chain of the executable behind a live process.
    fn chain_for_pid(&self, pid: i32) -> Result<CertificateChain>;
}

/// Decides whether a peer process may talk to the helper.
pub trait Authorize: Send + Sync {
    fn validate(&self, pid: i32) -> bool;
}

/// Accepts peers whose signing chain equals the helper's own.
pub struct CodeSignatureAuthorizer<I> {
    inspector: I,
}

impl<I: SignatureInspector> CodeSignatureAuthorizer<I> {
    pub fn new(inspector: I) -> Self {
        Self { inspector }
    }

    fn matches(&self, pid: i32) -> Result<bool> {
        let own = self.inspector.chain_for_self()?;
        if own.is_empty() {
            return Err(HelperError::Signature("helper is not signed".to_string()));
        }
        let peer = self.inspector.chain_for_pid(pid)?;
        if peer.is_empty() {
            return Err(HelperError::Signature(format!("pid {} is not signed", pid)));
        }
        Ok(own == peer)
    }
}

impl<I: SignatureInspector> Authorize for CodeSignatureAuthorizer<I> {
    fn validate(&self, pid: i32) -> bool {
        match self.matches(pid) {
            Ok(true) => true,
            Ok(false) => {
                warn!(pid, "signing certificates differ from the helper's");
                false
            }
            Err(e) => {
                warn!(pid, "error checking code signing: {}", e);
                false
            }
        }
    }
}

/// Authorized peer connection. Only `admit` can construct one, so holding a
/// `PeerConnection` is proof that the peer passed validation.
#[derive(Debug)]
pub struct PeerConnection {
    stream: UnixStream,
    pid: i32,
}

impl PeerConnection {
    pub fn pid(&self) -> i32 {
        self.pid
    }

    pub fn into_stream(self) -> UnixStream {
        self.stream
    }
}

/// Gate an inbound stream through the authorizer. Fails closed: a peer whose
/// pid cannot be resolved is rejected like an unsigned one.
pub fn admit(stream: UnixStream, authorizer: &dyn Authorize) -> Result<PeerConnection> {
    let pid = peer_pid(&stream)
        .map_err(|e| HelperError::Authorization(format!("unresolved peer: {}", e)))?;

    if !authorizer.validate(pid) {
        return Err(HelperError::Authorization(format!("pid {}", pid)));
    }
    debug!(pid, "peer authorized");
    Ok(PeerConnection { stream, pid })
}

// ============================================================================
// Peer process resolution
// ============================================================================

/// Process id of the other end of a Unix socket, from kernel credentials.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub fn peer_pid(stream: &UnixStream) -> io::Result<i32> {
    use nix::sys::socket::{getsockopt, sockopt::PeerCredentials};

    let cred = getsockopt(stream, PeerCredentials).map_err(io::Error::from)?;
    Ok(cred.pid())
}

#[cfg(target_os = "macos")]
pub fn peer_pid(stream: &UnixStream) -> io::Result<i32> {
    use std::os::unix::io::AsRawFd;

    let mut pid: libc::pid_t = 0;
    let mut len = std::mem::size_of::<libc::pid_t>() as libc::socklen_t;
    // SAFETY: pid and len point to valid, correctly sized storage for LOCAL_PEERPID.
    let rc = unsafe {
        libc::getsockopt(
            stream.as_raw_fd(),
            libc::SOL_LOCAL,
            libc::LOCAL_PEERPID,
            &mut pid as *mut libc::pid_t as *mut libc::c_void,
            &mut len,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(pid)
}

#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "macos")))]
pub fn peer_pid(_stream: &UnixStream) -> io::Result<i32> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "peer credentials not available on this platform",
    ))
}

/// Executable image of a running process.
#[cfg(target_os = "macos")]
pub fn executable_for_pid(pid: i32) -> io::Result<PathBuf> {
    let mut buf = vec![0u8; libc::PROC_PIDPATHINFO_MAXSIZE as usize];
    // SAFETY: buf is writable for the length passed.
    let len = unsafe {
        libc::proc_pidpath(pid, buf.as_mut_ptr() as *mut libc::c_void, buf.len() as u32)
    };
    if len <= 0 {
        return Err(io::Error::last_os_error());
    }
    buf.truncate(len as usize);
    Ok(PathBuf::from(String::from_utf8_lossy(&buf).into_owned()))
}

#[cfg(not(target_os = "macos"))]
pub fn executable_for_pid(pid: i32) -> io::Result<PathBuf> {
    fs::read_link(format!("/proc/{}/exe", pid))
}

// ============================================================================
// codesign backend
// ============================================================================

const CODESIGN: &str = "/usr/bin/codesign";

/// Inspector backed by the platform `codesign` tool. Validity comes from
/// `codesign --verify`, the chain from `--extract-certificates`.
#[derive(Debug, Clone)]
pub struct CodesignInspector {
    tool: PathBuf,
}

impl Default for CodesignInspector {
    fn default() -> Self {
        Self {
            tool: PathBuf::from(CODESIGN),
        }
    }
}

impl CodesignInspector {
    pub fn with_tool(tool: impl Into<PathBuf>) -> Self {
        Self { tool: tool.into() }
    }

    fn codesign(&self, args: &[&OsStr]) -> Result<()> {
        let output = Command::new(&self.tool)
            .args(args)
            .output()
            .map_err(|source| HelperError::Spawn {
                command: self.tool.display().to_string(),
                source,
            })?;
        if output.status.success() {
            Ok(())
        } else {
            Err(HelperError::Signature(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ))
        }
    }

    fn check_validity(&self, path: &Path) -> Result<()> {
        self.codesign(&[OsStr::new("--verify"), path.as_os_str()])
    }

    fn chain_for_path(&self, path: &Path) -> Result<CertificateChain> {
        self.check_validity(path)?;

        let dir = tempfile::tempdir()?;
        let prefix = dir.path().join("cert");
        let flag = format!("--extract-certificates={}", prefix.display());
        self.codesign(&[OsStr::new("-d"), OsStr::new(&flag), path.as_os_str()])?;
        read_extracted_chain(&prefix)
    }
}

impl SignatureInspector for CodesignInspector {
    fn chain_for_self(&self) -> Result<CertificateChain> {
        let exe = std::env::current_exe()?;
        self.chain_for_path(&exe)
    }

    fn chain_for_pid(&self, pid: i32) -> Result<CertificateChain> {
        let exe = executable_for_pid(pid)?;
        debug!(pid, exe = %exe.display(), "resolved peer executable");
        self.chain_for_path(&exe)
    }
}

/// Read `<prefix>0`, `<prefix>1`, ... until the first missing index.
fn read_extracted_chain(prefix: &Path) -> Result<CertificateChain> {
    let mut certs = Vec::new();
    for index in 0.. {
        let path = PathBuf::from(format!("{}{}", prefix.display(), index));
        match fs::read(&path) {
            Ok(der) => certs.push(der),
            Err(e) if e.kind() == io::ErrorKind::NotFound => break,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(CertificateChain::from_der(certs))
}
