// ABOUTME: In-memory SSH agent serving the forwarder's key over forwarded channels.
// ABOUTME: Bridges russh agent-forward channels to a local agent keyring task.

use super::config::AGENT_CONFIRM_BEFORE_USE;
use super::error::{Error, Result};
use futures::channel::mpsc::{UnboundedSender, unbounded};
use parking_lot::Mutex;
use russh::client::Msg;
use russh::keys::PrivateKey;
use russh::keys::agent::Constraint;
use russh::keys::agent::client::AgentClient;
use russh::keys::agent::server::{Agent, serve};
use russh::{Channel, ChannelMsg};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, duplex};
use tokio::task::JoinHandle;

const PIPE_CAPACITY: usize = 64 * 1024;

type Incoming = UnboundedSender<std::io::Result<DuplexStream>>;

/// Keyring policy: every signing request is answered without prompting.
#[derive(Clone)]
struct Keyring;

impl Agent for Keyring {}

/// A running in-memory agent holding a single key.
pub struct ForwardingAgent {
    incoming: Incoming,
    task: JoinHandle<()>,
}

impl ForwardingAgent {
    /// Start the agent and load `key` with the given lifetime.
    pub async fn start(key: &PrivateKey, lifetime: Duration) -> Result<Self> {
        let (incoming, listener) = unbounded();

        let task = tokio::spawn(async move {
            if let Err(e) = serve(listener, Keyring).await {
                tracing::debug!("in-memory agent stopped: {}", e);
            }
        });

        let agent = Self { incoming, task };
        agent.add_key(key, lifetime).await?;
        Ok(agent)
    }

    async fn add_key(&self, key: &PrivateKey, lifetime: Duration) -> Result<()> {
        let seconds = u32::try_from(lifetime.as_secs())
            .map_err(|_| Error::Agent(format!("key lifetime {:?} is too long", lifetime)))?;

        let mut constraints = vec![Constraint::KeyLifetime { seconds }];
        if AGENT_CONFIRM_BEFORE_USE {
            constraints.push(Constraint::Confirm);
        }

        let stream = self.connect_local()?;
        let mut client = AgentClient::connect(stream);
        client
            .add_identity(key, &constraints)
            .await
            .map_err(|e| Error::Agent(format!("failed to add key to agent: {}", e)))?;

        tracing::debug!("added key to in-memory agent with lifetime {}s", seconds);
        Ok(())
    }

    /// Open a new in-process connection to the agent.
    fn connect_local(&self) -> Result<DuplexStream> {
        let (ours, theirs) = duplex(PIPE_CAPACITY);
        self.incoming
            .unbounded_send(Ok(theirs))
            .map_err(|_| Error::Agent("agent is not running".to_string()))?;
        Ok(ours)
    }

    /// Handle through which forwarded channels reach this agent.
    pub fn sink(&self) -> AgentSink {
        AgentSink(self.incoming.clone())
    }

    /// Stop serving. Connections already in flight are dropped.
    pub fn stop(self) {
        self.incoming.close_channel();
        self.task.abort();
    }
}

impl Drop for ForwardingAgent {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Cloneable sender feeding connections into a [`ForwardingAgent`].
#[derive(Clone)]
pub struct AgentSink(Incoming);

/// Slot on the connection handler where the agent gets registered once ready.
///
/// Forward channels opened by the server before registration are refused.
#[derive(Clone, Default)]
pub(crate) struct AgentSlot(Arc<Mutex<Option<AgentSink>>>);

impl AgentSlot {
    pub(crate) fn register(&self, sink: AgentSink) {
        *self.0.lock() = Some(sink);
    }

    pub(crate) fn clear(&self) {
        self.0.lock().take();
    }

    /// Serve an agent channel opened by the server, if an agent is registered.
    pub(crate) fn accept(&self, channel: Channel<Msg>) {
        let Some(AgentSink(incoming)) = self.0.lock().clone() else {
            tracing::warn!("server opened an agent channel but no agent is registered");
            tokio::spawn(async move {
                let _ = channel.close().await;
            });
            return;
        };

        let (local, theirs) = duplex(PIPE_CAPACITY);
        if incoming.unbounded_send(Ok(theirs)).is_err() {
            tracing::debug!("agent stopped before forwarded channel could be served");
            return;
        }

        tokio::spawn(pump_channel(local, channel));
    }
}

/// Copy bytes between a forwarded channel and the local agent connection.
async fn pump_channel(mut local: DuplexStream, mut channel: Channel<Msg>) {
    let mut local_closed = false;
    let mut channel_closed = false;
    let mut buf = vec![0u8; PIPE_CAPACITY];

    loop {
        tokio::select! {
            // Agent replies
            r = local.read(&mut buf), if !local_closed => {
                match r {
                    Ok(0) => {
                        local_closed = true;
                        let _ = channel.eof().await;
                        if channel_closed {
                            break;
                        }
                    }
                    Ok(n) => {
                        if let Err(e) = channel.data(&buf[..n]).await {
                            tracing::debug!("agent channel data error: {}", e);
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::debug!("agent read error: {}", e);
                        break;
                    }
                }
            }

            // Requests from the remote side
            msg = channel.wait(), if !channel_closed => {
                match msg {
                    Some(ChannelMsg::Data { ref data }) => {
                        if let Err(e) = local.write_all(data).await {
                            tracing::debug!("agent write error: {}", e);
                            break;
                        }
                    }
                    Some(ChannelMsg::Eof) => {
                        channel_closed = true;
                        let _ = local.shutdown().await;
                        if local_closed {
                            break;
                        }
                    }
                    Some(ChannelMsg::Close) => break,
                    Some(_) => {}
                    None => break,
                }
            }

            else => break,
        }
    }

    let _ = channel.close().await;
}
