//! UNIX socket listener for the helper.
//!
//! Binds the well-known socket, gates every inbound connection through the
//! authorizer and serves each admitted peer on its own thread. A connection
//! stays registered until the peer closes it; the registration guard is the
//! invalidation hook.
//!
//! CHANGELOG:
//! - 10/17/2026 - Initial implementation

use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use tracing::{debug, error, info, warn};

use crate::error::{HelperError, Result};
use crate::helper::auth::{self, Authorize, PeerConnection};
use crate::helper::protocol::{self, codes};
use crate::helper::service::HelperService;
use crate::helper::state::{Registration, ServiceState};

/// Listener bound to the helper socket.
pub struct HelperServer {
    listener: UnixListener,
    socket_path: PathBuf,
    state: Arc<ServiceState>,
    service: Arc<HelperService>,
    authorizer: Arc<dyn Authorize>,
}

impl HelperServer {
    /// Bind the socket. This is the one failure that stops the service.
    pub fn bind(
        socket_path: impl AsRef<Path>,
        state: Arc<ServiceState>,
        service: Arc<HelperService>,
        authorizer: Arc<dyn Authorize>,
    ) -> Result<Self> {
        let socket_path = socket_path.as_ref().to_path_buf();
        let bind_err = |source: std::io::Error| HelperError::Bind {
            path: socket_path.clone(),
            source,
        };

        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent).map_err(bind_err)?;
        }
        // Clean up stale socket
        let _ = std::fs::remove_file(&socket_path);

        let listener = UnixListener::bind(&socket_path).map_err(bind_err)?;

        // Unprivileged clients must be able to connect; access control is the
        // per-connection code signing check.
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&socket_path, std::fs::Permissions::from_mode(0o666))
                .map_err(bind_err)?;
        }

        info!("listening on {}", socket_path.display());
        Ok(Self {
            listener,
            socket_path,
            state,
            service,
            authorizer,
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Run the accept loop on a background thread.
    pub fn spawn(self) -> std::io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("helper-accept".to_string())
            .spawn(move || self.serve())
    }

    /// Accept connections forever (blocking).
    pub fn serve(&self) {
        for stream in self.listener.incoming() {
            match stream {
                Ok(stream) => self.accept(stream),
                Err(e) => error!("accept error: {}", e),
            }
        }
    }

    /// Authorize synchronously, then register and hand the peer to a worker.
    fn accept(&self, stream: UnixStream) {
        let peer = match auth::admit(stream, self.authorizer.as_ref()) {
            Ok(peer) => peer,
            Err(e) => {
                // Dropping the stream is the whole answer the peer gets.
                warn!("invalid connection, dropping: {}", e);
                return;
            }
        };

        let registration = Registration::new(Arc::clone(&self.state));
        let pid = peer.pid();
        let id = registration.id();
        info!(connection = %id, pid, "connection accepted");

        let service = Arc::clone(&self.service);
        let spawned = thread::Builder::new()
            .name(format!("helper-{}", id))
            .spawn(move || {
                if let Err(e) = handle_connection(peer, &service) {
                    debug!(connection = %id, "connection error: {}", e);
                }
                drop(registration);
                info!(connection = %id, "connection invalidated");
            });
        if let Err(e) = spawned {
            // The closure (and with it the registration) is dropped here.
            error!(pid, "failed to start connection worker: {}", e);
        }
    }
}

/// Serve NDJSON requests until the peer closes its end.
fn handle_connection(peer: PeerConnection, service: &HelperService) -> Result<()> {
    let stream = peer.into_stream();
    let mut writer = stream.try_clone()?;
    let reader = BufReader::new(stream);

    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let response = handle_request(service, &line);
        writer.write_all(response.to_ndjson_line()?.as_bytes())?;
        writer.flush()?;
    }
    Ok(())
}

/// Turn one request line into its response.
pub fn handle_request(service: &HelperService, line: &str) -> protocol::Response {
    let start = Instant::now();
    let elapsed_ms = |start: Instant| start.elapsed().as_secs_f64() * 1000.0;

    let request = match protocol::Request::from_ndjson_line(line) {
        Ok(request) => request,
        Err(e) => {
            return protocol::Response::error(
                String::new(),
                codes::INVALID_JSON,
                e.to_string(),
                elapsed_ms(start),
            );
        }
    };

    debug!(method = %request.method, id = %request.id, "request");
    match service.dispatch(&request.method, &request.params) {
        Ok(result) => protocol::Response::success(request.id, result, elapsed_ms(start)),
        Err(e) => protocol::Response::error(request.id, e.code(), e.to_string(), elapsed_ms(start)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HelperConfig;
    use crate::helper::service::UninstallHandoff;

    struct NoHandoff;

    impl UninstallHandoff for NoHandoff {
        fn hand_off(&self, _pid: u32) -> Result<()> {
            Ok(())
        }
    }

    fn service() -> HelperService {
        HelperService::new(ServiceState::new(), &HelperConfig::default(), Box::new(NoHandoff))
    }

    #[test]
    fn test_handle_request_version() {
        let resp = handle_request(&service(), r#"{"id":"1","v":1,"method":"version"}"#);
        assert!(resp.ok);
        assert_eq!(resp.id, "1");
        assert_eq!(
            resp.result,
            Some(serde_json::json!(env!("CARGO_PKG_VERSION")))
        );
    }

    #[test]
    fn test_handle_request_bad_json() {
        let resp = handle_request(&service(), "{oops");
        assert!(!resp.ok);
        assert_eq!(resp.error.unwrap().code, codes::INVALID_JSON);
    }

    #[test]
    fn test_handle_request_missing_tool_is_ok_response() {
        let resp = handle_request(
            &service(),
            r#"{"id":"2","v":1,"method":"setFanMode","params":{"id":1,"mode":2}}"#,
        );
        assert!(resp.ok);
        assert_eq!(resp.result, Some(serde_json::json!("missing smc tool")));
    }
}
