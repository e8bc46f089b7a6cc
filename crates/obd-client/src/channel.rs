//! Command channel seam
//!
//! The client needs two things from a link: exclusive use of the channel
//! for a sequence of commands, and a way to send one command and get its
//! reply. [`ble_link::AdapterEngine`] provides both; tests substitute an
//! emulator.

use std::sync::Arc;

use async_trait::async_trait;
use ble_link::AdapterEngine;
use obd_protocol::ObdError;

/// Exclusive use of a command channel
#[async_trait]
pub trait ChannelSession: Send {
    /// Send one command and return its reply without the prompt
    async fn send(&mut self, command: &str) -> Result<String, ObdError>;
}

/// Source of command sessions
#[async_trait]
pub trait CommandChannel: Send + Sync {
    /// Wait for the channel and hold it until the session is dropped
    async fn session(&self) -> Box<dyn ChannelSession + '_>;

    /// Send a single command in its own session
    async fn send(&self, command: &str) -> Result<String, ObdError> {
        self.session().await.send(command).await
    }
}

#[async_trait]
impl<'a> ChannelSession for ble_link::CommandSession<'a> {
    async fn send(&mut self, command: &str) -> Result<String, ObdError> {
        ble_link::CommandSession::send(self, command).await
    }
}

#[async_trait]
impl CommandChannel for AdapterEngine {
    async fn session(&self) -> Box<dyn ChannelSession + '_> {
        Box::new(AdapterEngine::session(self).await)
    }
}

#[async_trait]
impl<T: CommandChannel + ?Sized> CommandChannel for Arc<T> {
    async fn session(&self) -> Box<dyn ChannelSession + '_> {
        (**self).session().await
    }
}
