// ABOUTME: In-process SSH server for integration tests.
// ABOUTME: Runs a tiny fake shell and can use the client's forwarded agent.

use super::fixture;
use russh::keys::agent::client::AgentClient;
use russh::client;
use russh::keys::{PrivateKey, decode_secret_key, ssh_key};
use russh::server::{self, Auth, Handle, Msg, Session};
use russh::{Channel, ChannelId, ChannelMsg, Disconnect};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

pub const TEST_USER: &str = "tester";

/// Running SSH server bound to an ephemeral loopback port.
pub struct TestServer {
    addr: SocketAddr,
    host_public_key: String,
    task: JoinHandle<()>,
}

impl TestServer {
    /// Start a server using the fixture host key, authorizing `test_key.pub`.
    pub async fn start() -> Self {
        Self::launch(true).await
    }

    /// Same as [`start`](Self::start), but every agent forwarding request is refused.
    pub async fn start_refusing_agent() -> Self {
        Self::launch(false).await
    }

    async fn launch(allow_agent_forwarding: bool) -> Self {
        let host_key = load_key("host_key");
        let authorized = ssh_key::PublicKey::from_openssh(fixture("test_key.pub").trim())
            .expect("authorized key fixture should parse");

        let config = Arc::new(server::Config {
            keys: vec![host_key],
            auth_rejection_time: Duration::from_millis(10),
            auth_rejection_time_initial: Some(Duration::ZERO),
            inactivity_timeout: Some(Duration::from_secs(30)),
            ..Default::default()
        });

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind test server");
        let addr = listener.local_addr().expect("test server address");

        let task = tokio::spawn(accept_loop(
            listener,
            config,
            authorized,
            allow_agent_forwarding,
        ));

        Self {
            addr,
            host_public_key: fixture("host_key.pub").trim().to_string(),
            task,
        }
    }

    /// `host:port` to dial.
    pub fn target(&self) -> String {
        self.addr.to_string()
    }

    /// known_hosts line matching this server's host key.
    pub fn known_hosts_line(&self) -> String {
        format!(
            "[{}]:{} {}",
            self.addr.ip(),
            self.addr.port(),
            self.host_public_key
        )
    }

    /// known_hosts line for this address with a different key.
    pub fn mismatched_known_hosts_line(&self) -> String {
        format!(
            "[{}]:{} {}",
            self.addr.ip(),
            self.addr.port(),
            fixture("other_host_key.pub").trim()
        )
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Load a private key from tests/fixtures.
pub fn load_key(name: &str) -> PrivateKey {
    decode_secret_key(&fixture(name), None).expect("fixture key should decode")
}

async fn accept_loop(
    listener: TcpListener,
    config: Arc<server::Config>,
    authorized: ssh_key::PublicKey,
    allow_agent_forwarding: bool,
) {
    loop {
        let (socket, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::warn!("test server accept failed: {}", e);
                return;
            }
        };

        let config = Arc::clone(&config);
        let handler = TestHandler {
            authorized: authorized.clone(),
            channels: HashMap::new(),
            allow_agent_forwarding,
            agent_forwarding: false,
        };

        tokio::spawn(async move {
            match server::run_stream(config, socket, handler).await {
                Ok(session) => {
                    if let Err(e) = session.await {
                        tracing::debug!("test session from {} ended: {:?}", peer, e);
                    }
                }
                Err(e) => tracing::debug!("test handshake from {} failed: {:?}", peer, e),
            }
        });
    }
}

struct TestHandler {
    authorized: ssh_key::PublicKey,
    channels: HashMap<ChannelId, Channel<Msg>>,
    allow_agent_forwarding: bool,
    agent_forwarding: bool,
}

impl server::Handler for TestHandler {
    type Error = russh::Error;

    async fn auth_publickey(
        &mut self,
        _user: &str,
        public_key: &ssh_key::PublicKey,
    ) -> Result<Auth, Self::Error> {
        if public_key.key_data() == self.authorized.key_data() {
            Ok(Auth::Accept)
        } else {
            Ok(Auth::Reject {
                proceed_with_methods: None,
                partial_success: false,
            })
        }
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        self.channels.insert(channel.id(), channel);
        Ok(true)
    }

    async fn agent_request(
        &mut self,
        _channel: ChannelId,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        self.agent_forwarding = self.allow_agent_forwarding;
        Ok(self.allow_agent_forwarding)
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let command = String::from_utf8_lossy(data).trim().to_string();
        if let Some(channel) = self.channels.remove(&channel) {
            tokio::spawn(run_command(
                channel,
                command,
                session.handle(),
                self.agent_forwarding,
            ));
        }
        Ok(())
    }
}

/// What a fake command produced.
struct Outcome {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    code: u32,
}

impl Outcome {
    fn success(stdout: impl Into<Vec<u8>>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: Vec::new(),
            code: 0,
        }
    }

    fn failure(code: u32, stderr: impl Into<Vec<u8>>) -> Self {
        Self {
            stdout: Vec::new(),
            stderr: stderr.into(),
            code,
        }
    }
}

/// Interpret a handful of shell commands and report the result on `channel`.
async fn run_command(
    mut channel: Channel<Msg>,
    command: String,
    handle: Handle,
    agent_forwarding: bool,
) {
    let outcome = if command == "cat" {
        Outcome::success(read_stdin(&mut channel).await)
    } else if let Some(code) = command.strip_prefix("exit ") {
        Outcome::failure(code.trim().parse().unwrap_or(255), Vec::<u8>::new())
    } else if let Some(text) = command.strip_prefix("echo ") {
        match text.strip_suffix(" >&2") {
            Some(text) => Outcome::failure(0, format!("{text}\n")),
            None => Outcome::success(format!("{text}\n")),
        }
    } else if command == "ssh-add -L" {
        list_forwarded_identities(&handle, agent_forwarding).await
    } else if let Some(rest) = command.strip_prefix("ssh ") {
        match rest.split_once(' ') {
            Some((target, remote)) => {
                nested_ssh(&handle, agent_forwarding, target, remote).await
            }
            None => Outcome::failure(255, "usage: ssh TARGET COMMAND\n"),
        }
    } else {
        Outcome::failure(127, format!("sh: {command}: not found\n"))
    };

    if !outcome.stdout.is_empty() {
        let _ = channel.data(&outcome.stdout[..]).await;
    }
    if !outcome.stderr.is_empty() {
        let _ = channel.extended_data(1, &outcome.stderr[..]).await;
    }
    let _ = channel.exit_status(outcome.code).await;
    let _ = channel.eof().await;
    let _ = channel.close().await;
}

async fn read_stdin(channel: &mut Channel<Msg>) -> Vec<u8> {
    let mut input = Vec::new();
    loop {
        match channel.wait().await {
            Some(ChannelMsg::Data { ref data }) => input.extend_from_slice(data),
            Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => return input,
            Some(_) => {}
        }
    }
}

/// Behaves like `ssh-add -L` on the remote host: asks the forwarded agent for its keys.
async fn list_forwarded_identities(handle: &Handle, agent_forwarding: bool) -> Outcome {
    if !agent_forwarding {
        return Outcome::failure(
            2,
            "Could not open a connection to your authentication agent.\n",
        );
    }

    let channel = match handle.channel_open_agent().await {
        Ok(channel) => channel,
        Err(e) => return Outcome::failure(2, format!("agent channel refused: {e:?}\n")),
    };

    let mut agent = AgentClient::connect(channel.into_stream());
    match agent.request_identities().await {
        Ok(keys) if keys.is_empty() => Outcome::failure(1, "The agent has no identities.\n"),
        Ok(keys) => {
            let mut listing = String::new();
            for key in keys {
                listing.push_str(&key.to_openssh().unwrap_or_default());
                listing.push('\n');
            }
            Outcome::success(listing)
        }
        Err(e) => Outcome::failure(2, format!("error fetching identities: {e}\n")),
    }
}

/// Client side of the hop from the remote host to the next one.
struct NestedClient;

impl client::Handler for NestedClient {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &ssh_key::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

/// Behaves like `ssh TARGET COMMAND` on the remote host: logs in to `target`
/// with a signature from the forwarded agent and relays the command's output.
async fn nested_ssh(
    handle: &Handle,
    agent_forwarding: bool,
    target: &str,
    command: &str,
) -> Outcome {
    if !agent_forwarding {
        return Outcome::failure(
            255,
            format!("{TEST_USER}@{target}: Permission denied (publickey).\n"),
        );
    }

    let channel = match handle.channel_open_agent().await {
        Ok(channel) => channel,
        Err(e) => return Outcome::failure(255, format!("agent channel refused: {e:?}\n")),
    };
    let mut agent = AgentClient::connect(channel.into_stream());

    let key = match agent.request_identities().await {
        Ok(keys) => match keys.into_iter().next() {
            Some(key) => key,
            None => return Outcome::failure(255, "the agent has no identities\n"),
        },
        Err(e) => return Outcome::failure(255, format!("error fetching identities: {e}\n")),
    };

    let mut session = match client::connect(
        Arc::new(client::Config::default()),
        target,
        NestedClient,
    )
    .await
    {
        Ok(session) => session,
        Err(e) => return Outcome::failure(255, format!("ssh: connect to {target}: {e}\n")),
    };

    let authenticated = match session
        .authenticate_publickey_with(TEST_USER, key, None, &mut agent)
        .await
    {
        Ok(result) => result.success(),
        Err(e) => return Outcome::failure(255, format!("agent signing failed: {e:?}\n")),
    };
    if !authenticated {
        return Outcome::failure(
            255,
            format!("{TEST_USER}@{target}: Permission denied (publickey).\n"),
        );
    }

    let outcome = run_nested(&session, command).await;
    let _ = session
        .disconnect(Disconnect::ByApplication, "", "en")
        .await;
    outcome
}

async fn run_nested(session: &client::Handle<NestedClient>, command: &str) -> Outcome {
    let mut channel = match session.channel_open_session().await {
        Ok(channel) => channel,
        Err(e) => return Outcome::failure(255, format!("nested session refused: {e}\n")),
    };
    if let Err(e) = channel.exec(true, command).await {
        return Outcome::failure(255, format!("nested exec failed: {e}\n"));
    }
    let _ = channel.eof().await;

    let mut outcome = Outcome::success(Vec::<u8>::new());
    let mut exit_code = None;
    loop {
        match channel.wait().await {
            Some(ChannelMsg::Data { ref data }) => outcome.stdout.extend_from_slice(data),
            Some(ChannelMsg::ExtendedData { ref data, .. }) => {
                outcome.stderr.extend_from_slice(data)
            }
            Some(ChannelMsg::ExitStatus { exit_status }) => exit_code = Some(exit_status),
            Some(ChannelMsg::Close) | None => break,
            Some(_) => {}
        }
    }
    outcome.code = exit_code.unwrap_or(255);
    outcome
}
