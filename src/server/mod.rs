//! Unix socket server for Library Vault
//!
//! Handles client connections, request parsing, and response sending.
//! Uses SO_PEERCRED to record the calling process in the audit log on Linux.

use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use secrecy::ExposeSecret;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::audit::{AuditEntry, AuditLog};
use crate::checkout::OverdueWatcher;
use crate::config::{self, Config};
use crate::library::{Borrower, CheckOutResult, Library};
use crate::protocol::{CredsResult, ErrorCode, LeaseResult, Method, Request, Response, ResponseResult};
use crate::roles::{RoleCredentials, RoleManager};
use crate::rotation::RootRotator;
use crate::{LibraryError, Result};

/// Library server state
pub struct LibraryServer {
    config: Config,
    library: Arc<Library>,
    roles: Arc<RoleManager>,
    /// Present on leaders
    watcher: Option<Arc<OverdueWatcher>>,
    /// Present on leaders
    root: Option<Arc<RootRotator>>,
    audit: Option<Arc<AuditLog>>,
    start_time: Instant,
    connection_semaphore: Arc<Semaphore>,
    shutdown: CancellationToken,
}

impl LibraryServer {
    pub fn new(
        config: Config,
        library: Arc<Library>,
        roles: Arc<RoleManager>,
        watcher: Option<Arc<OverdueWatcher>>,
        root: Option<Arc<RootRotator>>,
        audit: Option<Arc<AuditLog>>,
    ) -> Self {
        let max_connections = config.server.max_connections;
        Self {
            config,
            library,
            roles,
            watcher,
            root,
            audit,
            start_time: Instant::now(),
            connection_semaphore: Arc::new(Semaphore::new(max_connections)),
            shutdown: CancellationToken::new(),
        }
    }

    /// Cancelling this stops the accept loop and aborts root rollbacks
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run the server until the shutdown token is cancelled
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let socket_path = &self.config.server.socket_path;

        if socket_path.exists() {
            std::fs::remove_file(socket_path)?;
        }
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let listener = UnixListener::bind(socket_path)?;

        let mode = self.config.server.socket_mode;
        std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(mode))?;

        tracing::info!(
            socket = %socket_path.display(),
            mode = format!("{:o}", mode),
            role = ?self.config.server.role,
            "library server listening"
        );

        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, _addr)) => {
                    let server = Arc::clone(&self);
                    let permit = match self.connection_semaphore.clone().try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => {
                            tracing::warn!("connection limit reached, rejecting");
                            continue;
                        }
                    };

                    tokio::spawn(async move {
                        let peer_info = get_peer_info(&stream);
                        tracing::debug!(peer = ?peer_info, "new connection");

                        if let Err(e) = server.handle_connection(stream, peer_info).await {
                            tracing::debug!(error = %e, "connection error");
                        }

                        drop(permit);
                    });
                }
                Err(e) => {
                    tracing::error!(error = %e, "failed to accept connection");
                }
            }
        }

        let _ = std::fs::remove_file(socket_path);
        tracing::info!("library server stopped");
        Ok(())
    }

    async fn handle_connection(&self, stream: UnixStream, peer_info: Option<PeerInfo>) -> Result<()> {
        let timeout = Duration::from_secs(self.config.server.request_timeout_secs);

        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);
        let mut line = String::new();

        loop {
            line.clear();

            match tokio::time::timeout(timeout, reader.read_line(&mut line)).await {
                Ok(Ok(0)) => break,
                Ok(Ok(_)) => {
                    let response = self.handle_request(&line, &peer_info).await;
                    let response_json = serde_json::to_string(&response)? + "\n";
                    writer.write_all(response_json.as_bytes()).await?;
                }
                Ok(Err(e)) => {
                    tracing::debug!(error = %e, "read error");
                    break;
                }
                Err(_) => {
                    tracing::debug!("connection timeout");
                    break;
                }
            }
        }

        Ok(())
    }

    /// Parse, dispatch and audit one request line
    pub async fn handle_request(&self, line: &str, peer_info: &Option<PeerInfo>) -> Response {
        let request: Request = match serde_json::from_str(line.trim()) {
            Ok(req) => req,
            Err(e) => {
                return Response::error("unknown", ErrorCode::InvalidRequest, format!("invalid JSON: {e}"));
            }
        };

        let response = if !self.config.is_leader() && !request.method.is_read_only() {
            Response::error(
                &request.id,
                ErrorCode::Forbidden,
                format!("{} is not served by a follower", request.method.as_str()),
            )
        } else {
            match self.dispatch(&request).await {
                Ok(resp) => resp,
                Err(e) => Response::error(&request.id, ErrorCode::from(&e), e.to_string()),
            }
        };

        self.log_access(&request, &response, peer_info).await;
        response
    }

    async fn dispatch(&self, request: &Request) -> Result<Response> {
        let id = request.id.as_str();
        let params = &request.params;
        let borrower = Borrower::new(request.entity_id.clone().unwrap_or_default(), request.auth.clone());

        match request.method {
            Method::CheckOut => {
                let set = require(&params.set, "set")?;
                match self.library.check_out(set, params.ttl, &borrower).await? {
                    CheckOutResult::Lent(lease) => Ok(Response::lease(
                        id,
                        LeaseResult {
                            service_account_name: lease.service_account_name,
                            password: lease.password.expose_secret().to_string(),
                            ttl: lease.ttl,
                            max_ttl: lease.max_ttl,
                            renewable: lease.renewable,
                            due: lease.due,
                        },
                    )),
                    CheckOutResult::Unavailable => Ok(Response::error(
                        id,
                        ErrorCode::Unavailable,
                        "no service accounts available for check-out, retry later",
                    )),
                }
            }
            Method::CheckIn | Method::ManageCheckIn => {
                let set = require(&params.set, "set")?;
                let accounts = params.service_account_names.clone().unwrap_or_default();
                let force = request.method == Method::ManageCheckIn;
                let outcome = self.library.check_in(set, &accounts, &borrower, force).await?;

                if outcome.denied.is_empty() {
                    Ok(Response::check_ins(id, outcome.checked_in))
                } else {
                    // part of the work may be done, so don't report plain success
                    let denied: Vec<String> = outcome
                        .denied
                        .iter()
                        .map(|a| format!("{a:?} can't be checked in because it wasn't checked out by the caller"))
                        .collect();
                    Ok(Response::error(id, ErrorCode::Forbidden, denied.join("; ")))
                }
            }
            Method::Status => {
                let set = require(&params.set, "set")?;
                Ok(Response::status(id, self.library.set_status(set).await?))
            }
            Method::Renew => {
                let set = require(&params.set, "set")?;
                let account = require(&params.account, "account")?;
                let due = self.library.renew(set, account, params.increment, &borrower).await?;
                Ok(Response::renewed(id, due))
            }
            Method::Return => {
                let set = require(&params.set, "set")?;
                let account = require(&params.account, "account")?;
                self.library.return_account(set, account, &borrower).await?;
                Ok(Response::ok(id))
            }
            Method::WriteSet => {
                let set = require(&params.set, "set")?;
                if self.library.set_exists(set).await? {
                    self.library.update_set(set, params.set_params()).await?;
                } else {
                    self.library.create_set(set, params.set_params()).await?;
                }
                Ok(Response::ok(id))
            }
            Method::ReadSet => {
                let set = require(&params.set, "set")?;
                Ok(Response::set(id, self.library.read_set(set).await?))
            }
            Method::DeleteSet => {
                let set = require(&params.set, "set")?;
                self.library.delete_set(set).await?;
                Ok(Response::ok(id))
            }
            Method::ListSets => Ok(Response::list(id, self.library.list_sets().await?)),
            Method::RotateRoot => {
                let root = self
                    .root
                    .as_ref()
                    .ok_or_else(|| LibraryError::Internal("root rotation is not configured".to_string()))?;
                root.rotate(self.library.storage(), &self.shutdown.child_token()).await?;
                Ok(Response::ok(id))
            }
            Method::ReadConfig => {
                let engine = config::read_engine_config(self.library.storage().as_ref())
                    .await?
                    .ok_or(LibraryError::ConfigUnset)?;
                Ok(Response::config(id, engine.redacted()))
            }
            Method::WriteConfig => {
                let engine = params
                    .config
                    .as_ref()
                    .ok_or_else(|| LibraryError::Validation("missing config parameter".to_string()))?;
                engine.validate()?;
                config::write_engine_config(self.library.storage().as_ref(), engine).await?;
                tracing::info!(url = %engine.directory.url, "engine config updated");
                Ok(Response::ok(id))
            }
            Method::WriteRole => {
                let name = require(&params.role, "role")?;
                let role = self.roles.write_role(name, params.role_params()).await?;
                Ok(Response::role(id, name, role))
            }
            Method::ReadRole => {
                let name = require(&params.role, "role")?;
                Ok(Response::role(id, name, self.roles.read_role(name).await?))
            }
            Method::DeleteRole => {
                let name = require(&params.role, "role")?;
                self.roles.delete_role(name).await?;
                Ok(Response::ok(id))
            }
            Method::ListRoles => Ok(Response::roles(id, self.roles.list_roles().await?)),
            Method::ReadCreds => {
                let name = require(&params.role, "role")?;
                Ok(Response::creds(id, creds_result(self.roles.read_creds(name).await?)))
            }
            Method::RotateRole => {
                let name = require(&params.role, "role")?;
                Ok(Response::creds(id, creds_result(self.roles.rotate_role(name).await?)))
            }
            Method::Health => {
                let role = if self.config.is_leader() { "leader" } else { "follower" };
                let watched = self.watcher.as_ref().map_or(0, |w| w.watched_accounts().len());
                Ok(Response::health(id, role, self.start_time.elapsed().as_secs(), watched))
            }
        }
    }

    async fn log_access(&self, request: &Request, response: &Response, peer_info: &Option<PeerInfo>) {
        let Some(audit) = &self.audit else {
            return;
        };

        let account = match &response.result {
            Some(ResponseResult::Lease(lease)) => Some(lease.service_account_name.clone()),
            Some(ResponseResult::CheckIn(result)) if !result.check_ins.is_empty() => Some(result.check_ins.join(",")),
            _ => request.params.account.clone(),
        };

        let entry = AuditEntry {
            timestamp: chrono::Utc::now(),
            entity_id: request.entity_id.clone(),
            peer_pid: peer_info.as_ref().map(|p| p.pid),
            peer_uid: peer_info.as_ref().map(|p| p.uid),
            method: request.method.as_str().to_string(),
            set_name: request.params.set.clone(),
            account,
            success: response.error.is_none(),
            error: response.error.as_ref().map(|e| e.message.clone()),
        };

        if let Err(e) = audit.log(entry).await {
            tracing::error!(error = %e, "failed to write audit log");
        }
    }
}

fn creds_result(creds: RoleCredentials) -> CredsResult {
    CredsResult {
        username: creds.username,
        current_password: creds.current_password.expose_secret().to_string(),
        last_password: creds.last_password.map(|p| p.expose_secret().to_string()),
    }
}

fn require<'a>(value: &'a Option<String>, name: &str) -> Result<&'a str> {
    value
        .as_deref()
        .ok_or_else(|| LibraryError::Validation(format!("missing {name} parameter")))
}

/// Information about the connecting peer
#[derive(Debug)]
pub struct PeerInfo {
    pub pid: i32,
    pub uid: u32,
}

/// Get peer credentials from a Unix stream (Linux only)
#[cfg(target_os = "linux")]
fn get_peer_info(stream: &UnixStream) -> Option<PeerInfo> {
    use std::os::unix::io::AsRawFd;

    let fd = stream.as_raw_fd();

    let mut cred: libc::ucred = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::ucred>() as libc::socklen_t;

    let result = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_PEERCRED,
            &mut cred as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };

    if result == 0 {
        Some(PeerInfo {
            pid: cred.pid,
            uid: cred.uid,
        })
    } else {
        None
    }
}

#[cfg(not(target_os = "linux"))]
fn get_peer_info(_stream: &UnixStream) -> Option<PeerInfo> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerting::NoopAlerter;
    use crate::checkout::{HandlerSettings, HandlerStack};
    use crate::config::Role;
    use crate::directory::mock::FakeDirectoryClient;
    use crate::test_support::seeded_storage;
    use tempfile::TempDir;

    struct Fixture {
        server: Arc<LibraryServer>,
        stack: HandlerStack,
        client: Arc<FakeDirectoryClient>,
        audit: Arc<AuditLog>,
        _dir: TempDir,
    }

    async fn fixture(role: Role) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let storage = seeded_storage().await;
        let client = Arc::new(FakeDirectoryClient::new());
        let stack = HandlerStack::build(
            Role::Leader,
            storage.clone(),
            client.clone(),
            Arc::new(NoopAlerter),
            HandlerSettings::default(),
        )
        .await
        .unwrap();
        let roles = Arc::new(RoleManager::new(storage.clone(), client.clone()));
        let library = Arc::new(Library::new(storage, stack.handler.clone()));
        let audit = Arc::new(AuditLog::new(&dir.path().join("audit.db"), 30).unwrap());
        let root = Arc::new(RootRotator::new(
            client.clone(),
            Arc::new(NoopAlerter),
            2,
            Duration::from_millis(1),
        ));

        let mut config = Config::default();
        config.server.role = role;
        config.server.socket_path = dir.path().join("library.sock");

        let server = Arc::new(LibraryServer::new(
            config,
            library,
            roles,
            stack.watcher.clone(),
            Some(root),
            Some(audit.clone()),
        ));
        Fixture {
            server,
            stack,
            client,
            audit,
            _dir: dir,
        }
    }

    async fn call(server: &LibraryServer, request: &Request) -> Response {
        server
            .handle_request(&serde_json::to_string(request).unwrap(), &None)
            .await
    }

    fn write_set(accounts: &[&str]) -> Request {
        Request::write_set(
            "w",
            "admin-token",
            "dba",
            crate::library::SetParams {
                service_account_names: Some(accounts.iter().map(|a| a.to_string()).collect()),
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_peer_info_struct() {
        let info = PeerInfo { pid: 1234, uid: 1000 };
        assert_eq!(info.pid, 1234);
        assert_eq!(info.uid, 1000);
    }

    #[tokio::test]
    async fn test_lending_round_trip() {
        let f = fixture(Role::Leader).await;
        assert!(call(&f.server, &write_set(&["svc1"])).await.error.is_none());

        let borrow = Request::check_out("1", "alice-token", "dba", Some(60)).with_entity(Some("alice".to_string()));
        let resp = call(&f.server, &borrow).await;
        let Some(ResponseResult::Lease(lease)) = resp.result else {
            panic!("expected a lease, got {resp:?}");
        };
        assert_eq!(lease.service_account_name, "svc1");
        assert_eq!(lease.ttl, 60);
        assert_eq!(f.client.password("svc1"), Some(lease.password));

        let resp = call(&f.server, &borrow).await;
        assert_eq!(resp.error.unwrap().code, ErrorCode::Unavailable);

        // someone else can't hand it back
        let resp = call(&f.server, &Request::check_in("2", "bob-token", "dba", vec!["svc1".to_string()], false)).await;
        assert_eq!(resp.error.unwrap().code, ErrorCode::Forbidden);

        let resp = call(&f.server, &Request::check_in("3", "alice-token", "dba", vec![], false)).await;
        let Some(ResponseResult::CheckIn(result)) = resp.result else {
            panic!("expected check-ins, got {resp:?}");
        };
        assert_eq!(result.check_ins, vec!["svc1".to_string()]);

        let recent = f.audit.query_recent(10).unwrap();
        assert_eq!(recent.len(), 5);
        assert_eq!(recent[3].account.as_deref(), Some("svc1"));
        assert_eq!(recent[3].entity_id.as_deref(), Some("alice"));
        assert!(!recent[2].success);
        f.stack.shutdown();
    }

    #[tokio::test]
    async fn test_follower_serves_reads_only() {
        let f = fixture(Role::Follower).await;

        let resp = call(&f.server, &write_set(&["svc1"])).await;
        assert_eq!(resp.error.unwrap().code, ErrorCode::Forbidden);

        let resp = call(&f.server, &Request::simple("h", "", Method::Health)).await;
        let Some(ResponseResult::Health(health)) = resp.result else {
            panic!("expected health, got {resp:?}");
        };
        assert_eq!(health.role, "follower");

        let resp = call(&f.server, &Request::simple("l", "", Method::ListSets)).await;
        assert!(resp.error.is_none());
        f.stack.shutdown();
    }

    #[tokio::test]
    async fn test_config_is_redacted_and_root_rotates() {
        let f = fixture(Role::Leader).await;

        let resp = call(&f.server, &Request::simple("c", "", Method::ReadConfig)).await;
        let Some(ResponseResult::Config(engine)) = resp.result else {
            panic!("expected config, got {resp:?}");
        };
        assert!(engine.directory.bind_password.is_empty());

        let resp = call(&f.server, &Request::simple("r", "", Method::RotateRoot)).await;
        assert!(resp.error.is_none(), "{resp:?}");
        assert_eq!(f.client.root_passwords().len(), 1);

        let mut bad = crate::test_support::engine_config();
        bad.password.length = 4;
        let resp = call(&f.server, &Request::write_config("w", "", bad)).await;
        assert_eq!(resp.error.unwrap().code, ErrorCode::InvalidRequest);
        f.stack.shutdown();
    }

    #[tokio::test]
    async fn test_missing_parameters_and_bad_json() {
        let f = fixture(Role::Leader).await;

        let resp = call(&f.server, &Request::simple("s", "", Method::Status)).await;
        assert_eq!(resp.error.unwrap().code, ErrorCode::InvalidRequest);

        let resp = f.server.handle_request("{not json", &None).await;
        assert_eq!(resp.id, "unknown");
        assert_eq!(resp.error.unwrap().code, ErrorCode::InvalidRequest);

        let resp = call(&f.server, &Request::for_set("s", "", Method::ReadSet, "nope")).await;
        assert_eq!(resp.error.unwrap().code, ErrorCode::NotFound);
        f.stack.shutdown();
    }

    #[tokio::test]
    async fn test_socket_round_trip() {
        let f = fixture(Role::Leader).await;
        let socket = f.server.config.server.socket_path.clone();
        let shutdown = f.server.shutdown_token();
        let handle = tokio::spawn(Arc::clone(&f.server).run());

        let mut stream = None;
        for _ in 0..50 {
            if let Ok(s) = UnixStream::connect(&socket).await {
                stream = Some(s);
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let stream = stream.expect("server never started listening");

        let (reader, mut writer) = stream.into_split();
        let line = serde_json::to_string(&Request::simple("h", "", Method::Health)).unwrap() + "\n";
        writer.write_all(line.as_bytes()).await.unwrap();

        let mut reader = BufReader::new(reader);
        let mut reply = String::new();
        reader.read_line(&mut reply).await.unwrap();
        let resp: Response = serde_json::from_str(&reply).unwrap();
        assert_eq!(resp.id, "h");
        assert!(matches!(resp.result, Some(ResponseResult::Health(_))));

        shutdown.cancel();
        handle.await.unwrap().unwrap();
        assert!(!socket.exists());
        f.stack.shutdown();
    }

    #[tokio::test]
    async fn test_static_role_round_trip() {
        let f = fixture(Role::Leader).await;
        let account = crate::test_support::ACCOUNT;
        // known to the directory
        assert!(call(&f.server, &write_set(&[account])).await.error.is_none());

        let fields = crate::roles::RoleParams {
            service_account_name: Some(account.to_string()),
            ttl: Some(60),
        };
        let resp = call(&f.server, &Request::write_role("w", "", "app", fields)).await;
        let Some(ResponseResult::Role(role)) = resp.result else {
            panic!("expected a role, got {resp:?}");
        };
        assert_eq!(role.role.ttl, 60);

        let resp = call(&f.server, &Request::for_role("c", "", Method::ReadCreds, "app")).await;
        let Some(ResponseResult::Creds(first)) = resp.result else {
            panic!("expected creds, got {resp:?}");
        };
        assert_eq!(first.username, "becca");
        assert_eq!(f.client.password(account), Some(first.current_password.clone()));

        let resp = call(&f.server, &Request::for_role("r", "", Method::RotateRole, "app")).await;
        let Some(ResponseResult::Creds(second)) = resp.result else {
            panic!("expected creds, got {resp:?}");
        };
        assert_eq!(second.last_password, Some(first.current_password));

        let resp = call(&f.server, &Request::simple("l", "", Method::ListRoles)).await;
        let Some(ResponseResult::RoleList(list)) = resp.result else {
            panic!("expected roles, got {resp:?}");
        };
        assert_eq!(list.roles, vec!["app".to_string()]);

        assert!(call(&f.server, &Request::for_role("d", "", Method::DeleteRole, "app")).await.error.is_none());
        let resp = call(&f.server, &Request::for_role("g", "", Method::ReadRole, "app")).await;
        assert_eq!(resp.error.unwrap().code, ErrorCode::NotFound);
        f.stack.shutdown();
    }

    #[tokio::test]
    async fn test_follower_does_not_hand_out_role_creds() {
        let f = fixture(Role::Follower).await;
        let resp = call(&f.server, &Request::for_role("c", "", Method::ReadCreds, "app")).await;
        assert_eq!(resp.error.unwrap().code, ErrorCode::Forbidden);

        let resp = call(&f.server, &Request::simple("l", "", Method::ListRoles)).await;
        assert!(resp.error.is_none());
        f.stack.shutdown();
    }
}
