// ABOUTME: SSH connection manager with in-memory agent forwarding using russh.
// ABOUTME: Handles connect, command execution with streamed output, and best-effort close.

use super::agent::{AgentSlot, ForwardingAgent};
use super::config::{ForwarderConfig, Target};
use super::error::{Error, Result};
use super::host_key::HostKeyPolicy;
use crate::diagnostics::{Diagnostics, Warning};
use russh::client::{self, Config, Handle, Msg};
use russh::keys::{PrivateKey, PrivateKeyWithHashAlg, decode_secret_key, ssh_key};
use russh::{Channel, ChannelMsg, Disconnect};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Output from a remote command execution.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// Exit code of the command.
    pub exit_code: u32,
    /// Standard output.
    pub stdout: String,
    /// Standard error.
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// SSH client handler for russh.
pub(crate) struct ForwarderHandler {
    target: Target,
    policy: HostKeyPolicy,
    agent: AgentSlot,
}

impl client::Handler for ForwarderHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &ssh_key::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        Ok(self.policy.accepts(&self.target, server_public_key))
    }

    async fn server_channel_open_agent_forward(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut client::Session,
    ) -> std::result::Result<(), Self::Error> {
        tracing::debug!("server opened agent channel {:?}", channel.id());
        self.agent.accept(channel);
        Ok(())
    }
}

/// Live connection state. Both handles exist together or not at all.
struct Connection {
    target: Target,
    handle: Handle<ForwarderHandler>,
    forwarding: Channel<Msg>,
    agent: ForwardingAgent,
    agent_slot: AgentSlot,
}

impl Connection {
    /// Release everything, recording failures instead of returning them.
    async fn shutdown(self, diag: &mut Diagnostics) {
        self.agent_slot.clear();

        if let Err(e) = self.forwarding.close().await {
            diag.warn(Warning::forwarding_close(format!(
                "closing forwarding session to {} failed: {}",
                self.target, e
            )));
        }

        if let Err(e) = self
            .handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await
        {
            diag.warn(Warning::disconnect(format!(
                "disconnect from {} failed: {}",
                self.target, e
            )));
        }

        self.agent.stop();
    }
}

enum State {
    Unconnected,
    Connected(Connection),
}

/// Connects with a private key, forwards an in-memory agent holding that key,
/// and runs commands on the remote host.
pub struct KeyForwarder {
    config: ForwarderConfig,
    state: State,
    diagnostics: Diagnostics,
}

impl std::fmt::Debug for KeyForwarder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let target = match &self.state {
            State::Unconnected => None,
            State::Connected(conn) => Some(conn.target.to_string()),
        };
        f.debug_struct("KeyForwarder")
            .field("config", &self.config)
            .field("connected_to", &target)
            .finish()
    }
}

impl KeyForwarder {
    pub fn new(config: ForwarderConfig) -> Self {
        Self {
            config,
            state: State::Unconnected,
            diagnostics: Diagnostics::default(),
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.state, State::Connected(_))
    }

    /// Warnings recorded by [`close`](Self::close) since the last connect.
    pub fn teardown_warnings(&self) -> &[Warning] {
        self.diagnostics.warnings()
    }

    /// Connect to `target` (`host:port`) as `user` and enable agent forwarding.
    ///
    /// On error nothing stays open and the forwarder can be connected again.
    pub async fn connect(&mut self, target: &str, user: &str) -> Result<()> {
        if self.is_connected() {
            return Err(Error::AlreadyConnected);
        }
        self.diagnostics.clear();

        // A broken host key store is reported ahead of a malformed target
        let store = HostKeyPolicy::open_store(
            self.config.insecure,
            self.config.known_hosts_path.as_deref(),
        )?;

        let parsed = Target::parse(target).map_err(|e| Error::dial(target, e))?;
        let policy = HostKeyPolicy::resolve(store, &parsed)?;

        // One parse serves both the signing credential and the agent keyring
        let key = Arc::new(parse_private_key(&self.config.private_key)?);

        let agent_slot = AgentSlot::default();
        let handler = ForwarderHandler {
            target: parsed.clone(),
            policy,
            agent: agent_slot.clone(),
        };

        let russh_config = Config {
            inactivity_timeout: self.config.inactivity_timeout,
            ..Default::default()
        };

        tracing::debug!("dialing {} as {}", parsed, user);
        let mut handle = client::connect(
            Arc::new(russh_config),
            (parsed.host.as_str(), parsed.port),
            handler,
        )
        .await
        .map_err(|e| Error::dial(target, e.to_string()))?;

        if let Err(e) = authenticate(&mut handle, user, Arc::clone(&key)).await {
            abandon(&handle).await;
            return Err(Error::dial(target, e));
        }

        let (forwarding, agent) =
            match enable_forwarding(&handle, &key, &agent_slot, &self.config).await {
                Ok(parts) => parts,
                Err(e) => {
                    agent_slot.clear();
                    abandon(&handle).await;
                    return Err(e);
                }
            };

        tracing::debug!("connected to {} with agent forwarding", parsed);
        self.state = State::Connected(Connection {
            target: parsed,
            handle,
            forwarding,
            agent,
            agent_slot,
        });
        Ok(())
    }

    /// Run `command` on a fresh session, streaming its output into the sinks.
    ///
    /// `stdin` of `None` gives the remote process an immediately closed input.
    /// A non-zero exit is reported as [`Error::ExitStatus`].
    pub async fn run<W, E, R>(
        &self,
        command: &str,
        stdout: W,
        stderr: E,
        stdin: Option<R>,
    ) -> Result<()>
    where
        W: AsyncWrite + Unpin,
        E: AsyncWrite + Unpin,
        R: AsyncRead + Unpin,
    {
        match self.exec(command, stdout, stderr, stdin).await? {
            0 => Ok(()),
            code => Err(Error::ExitStatus(code)),
        }
    }

    /// Run `command` without input and collect its output in memory.
    pub async fn run_captured(&self, command: &str) -> Result<CommandOutput> {
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let exit_code = self
            .exec(command, &mut stdout, &mut stderr, None::<&[u8]>)
            .await?;

        Ok(CommandOutput {
            exit_code,
            stdout: String::from_utf8_lossy(&stdout).to_string(),
            stderr: String::from_utf8_lossy(&stderr).to_string(),
        })
    }

    async fn exec<W, E, R>(
        &self,
        command: &str,
        stdout: W,
        stderr: E,
        stdin: Option<R>,
    ) -> Result<u32>
    where
        W: AsyncWrite + Unpin,
        E: AsyncWrite + Unpin,
        R: AsyncRead + Unpin,
    {
        let State::Connected(conn) = &self.state else {
            return Err(Error::NotConnected);
        };

        let mut channel = conn
            .handle
            .channel_open_session()
            .await
            .map_err(|e| Error::Session(format!("failed to create ssh session: {}", e)))?;

        let result = drive_command(&mut channel, command, stdout, stderr, stdin).await;

        // The session belongs to this call only
        if let Err(e) = channel.close().await {
            tracing::debug!("closing command session failed: {}", e);
        }

        result
    }

    /// Close the forwarding session and the connection.
    ///
    /// Never fails: teardown errors are recorded in
    /// [`teardown_warnings`](Self::teardown_warnings). Calling it again is a no-op.
    pub async fn close(&mut self) {
        let State::Connected(conn) = std::mem::replace(&mut self.state, State::Unconnected) else {
            return;
        };
        tracing::debug!("closing connection to {}", conn.target);
        conn.shutdown(&mut self.diagnostics).await;
    }
}

/// Decode the raw key bytes into a private key.
fn parse_private_key(bytes: &[u8]) -> Result<PrivateKey> {
    let text = std::str::from_utf8(bytes)
        .map_err(|_| Error::KeyParse("key material is not valid UTF-8".to_string()))?;
    if text.trim().is_empty() {
        return Err(Error::KeyParse("no private key supplied".to_string()));
    }
    decode_secret_key(text, None).map_err(|e| Error::KeyParse(e.to_string()))
}

/// Public key authentication, returning a reason on failure.
async fn authenticate(
    handle: &mut Handle<ForwarderHandler>,
    user: &str,
    key: Arc<PrivateKey>,
) -> std::result::Result<(), String> {
    let hash_alg = handle
        .best_supported_rsa_hash()
        .await
        .map_err(|e| e.to_string())?
        .flatten();

    let result = handle
        .authenticate_publickey(user, PrivateKeyWithHashAlg::new(key, hash_alg))
        .await
        .map_err(|e| e.to_string())?;

    if result.success() {
        Ok(())
    } else {
        Err(format!("public key authentication rejected for user {}", user))
    }
}

/// Open the auxiliary session, start the agent and request forwarding.
async fn enable_forwarding(
    handle: &Handle<ForwarderHandler>,
    key: &PrivateKey,
    slot: &AgentSlot,
    config: &ForwarderConfig,
) -> Result<(Channel<Msg>, ForwardingAgent)> {
    let mut forwarding = handle
        .channel_open_session()
        .await
        .map_err(|e| Error::Session(format!("failed to open forwarding session: {}", e)))?;

    let agent = match ForwardingAgent::start(key, config.agent_key_lifetime).await {
        Ok(agent) => agent,
        Err(e) => {
            let _ = forwarding.close().await;
            return Err(e);
        }
    };

    slot.register(agent.sink());

    if let Err(e) = request_agent_forwarding(&mut forwarding).await {
        let _ = forwarding.close().await;
        agent.stop();
        return Err(e);
    }

    Ok((forwarding, agent))
}

/// Ask the server to forward agent connections back to us and wait for its answer.
async fn request_agent_forwarding(channel: &mut Channel<Msg>) -> Result<()> {
    channel
        .agent_forward(true)
        .await
        .map_err(|e| Error::Agent(format!("failed to request agent forwarding: {}", e)))?;

    loop {
        match channel.wait().await {
            Some(ChannelMsg::Success) => return Ok(()),
            Some(ChannelMsg::Failure) => {
                return Err(Error::Agent("forwarding request denied".to_string()));
            }
            Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => {
                return Err(Error::Agent(
                    "forwarding session closed before the server answered".to_string(),
                ));
            }
            Some(_) => {}
        }
    }
}

/// Disconnect a half-established connection, ignoring errors.
async fn abandon(handle: &Handle<ForwarderHandler>) {
    if let Err(e) = handle
        .disconnect(Disconnect::ByApplication, "", "en")
        .await
    {
        tracing::debug!("disconnect after failed connect: {}", e);
    }
}

async fn read_input<R: AsyncRead + Unpin>(
    input: &mut Option<R>,
    buf: &mut [u8],
) -> std::io::Result<usize> {
    match input {
        Some(reader) => reader.read(buf).await,
        None => std::future::pending().await,
    }
}

/// Execute `command` on `channel` and pump streams until it finishes.
async fn drive_command<W, E, R>(
    channel: &mut Channel<Msg>,
    command: &str,
    mut stdout: W,
    mut stderr: E,
    mut stdin: Option<R>,
) -> Result<u32>
where
    W: AsyncWrite + Unpin,
    E: AsyncWrite + Unpin,
    R: AsyncRead + Unpin,
{
    channel
        .exec(true, command)
        .await
        .map_err(|e| Error::CommandFailed(format!("failed to exec command: {}", e)))?;

    if stdin.is_none() {
        channel
            .eof()
            .await
            .map_err(|e| Error::CommandFailed(format!("failed to close stdin: {}", e)))?;
    }

    let mut buf = vec![0u8; 32 * 1024];
    let mut exit_code = None;
    let mut signal = None;
    let mut got_eof = false;

    loop {
        tokio::select! {
            r = read_input(&mut stdin, &mut buf), if stdin.is_some() => {
                match r? {
                    0 => {
                        stdin = None;
                        channel.eof().await.map_err(|e| {
                            Error::CommandFailed(format!("failed to close stdin: {}", e))
                        })?;
                    }
                    n => {
                        channel.data(&buf[..n]).await.map_err(|e| {
                            Error::CommandFailed(format!("failed to send stdin: {}", e))
                        })?;
                    }
                }
            }

            msg = channel.wait() => {
                match msg {
                    Some(ChannelMsg::Data { ref data }) => {
                        stdout.write_all(data).await?;
                    }
                    Some(ChannelMsg::ExtendedData { ref data, ext }) => {
                        if ext == 1 {
                            stderr.write_all(data).await?;
                        }
                    }
                    Some(ChannelMsg::ExitStatus { exit_status }) => {
                        exit_code = Some(exit_status);
                        if got_eof {
                            break;
                        }
                    }
                    Some(ChannelMsg::ExitSignal { signal_name, .. }) => {
                        signal = Some(format!("{:?}", signal_name));
                    }
                    Some(ChannelMsg::Eof) => {
                        got_eof = true;
                        if exit_code.is_some() {
                            break;
                        }
                    }
                    Some(ChannelMsg::Close) => break,
                    Some(ChannelMsg::Failure) => {
                        return Err(Error::CommandFailed(
                            "server refused to execute command".to_string(),
                        ));
                    }
                    Some(_) => {}
                    None => break,
                }
            }
        }
    }

    stdout.flush().await?;
    stderr.flush().await?;

    if let Some(signal) = signal {
        return Err(Error::Signal(signal));
    }
    exit_code.ok_or(Error::ChannelClosed)
}
