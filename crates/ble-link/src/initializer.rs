//! Adapter startup sequence
//!
//! Reset, echo off, protocol selection and identification, sent over one
//! command session so nothing interleaves with the sequence.

use obd_protocol::{command, ObdError};
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::engine::CommandSession;

/// Run the sequence; returns the adapter identification when it answered
pub(crate) async fn run(
    session: &mut CommandSession<'_>,
    config: &EngineConfig,
) -> Result<Option<String>, ObdError> {
    session.send(command::RESET).await?;
    debug!(settle_ms = config.reset_settle_ms, "Adapter reset");
    tokio::time::sleep(config.reset_settle()).await;

    expect_ok(session, command::ECHO_OFF).await?;
    expect_ok(session, &config.protocol.to_elm_command()).await?;

    match session.send(command::IDENTIFY).await {
        Ok(reply) => {
            let identity = identity_line(&reply);
            info!(adapter = identity.as_deref().unwrap_or("unknown"), "Adapter identified");
            Ok(identity)
        }
        Err(e) if e.is_disconnect() => Err(e),
        Err(e) => {
            warn!(error = %e, "Adapter did not identify itself");
            Ok(None)
        }
    }
}

async fn expect_ok(session: &mut CommandSession<'_>, cmd: &str) -> Result<(), ObdError> {
    let reply = session.send(cmd).await?;
    if command::is_ok(&reply) {
        Ok(())
    } else if reply.contains('?') {
        Err(ObdError::InvalidCommand(cmd.to_string()))
    } else {
        Err(ObdError::InvalidResponse(format!("{}: {}", cmd, reply)))
    }
}

/// Last non-empty line that is not the echoed command
fn identity_line(reply: &str) -> Option<String> {
    reply
        .split(['\r', '\n'])
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.eq_ignore_ascii_case(command::IDENTIFY))
        .last()
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_line() {
        assert_eq!(identity_line("ELM327 v1.5").as_deref(), Some("ELM327 v1.5"));
        assert_eq!(identity_line("ATI\r\rELM327 v2.1").as_deref(), Some("ELM327 v2.1"));
        assert_eq!(identity_line("\r\r"), None);
    }
}
