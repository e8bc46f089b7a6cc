//! Extended diagnostics probe
//!
//! UDS ReadDataByIdentifier requests addressed to specific controllers.
//! Every read selects a header first and puts the broadcast header back
//! afterwards so plain OBD requests keep reaching every ECU.

use obd_protocol::command;
use obd_protocol::did;
use obd_protocol::{ElmResponse, ObdError, SunroofState, WindowState, WindowsStatus};
use tracing::{debug, info, warn};

use crate::channel::ChannelSession;
use crate::profile::{StatusBit, VehicleProfile};

/// Select `header` and read `did` from it
pub(crate) async fn read_identifier<S>(
    session: &mut S,
    header: &str,
    did: u16,
) -> Result<ElmResponse, ObdError>
where
    S: ChannelSession + ?Sized,
{
    session.send(&command::set_header(header)).await?;
    let reply = session.send(&command::read_data_by_identifier(did)).await?;
    let response = ElmResponse::classify(&reply);
    debug!(header, did = format_args!("{:04X}", did), response = ?response, "Identifier read");
    Ok(response)
}

async fn restore_broadcast<S>(session: &mut S, profile: &VehicleProfile) -> Result<(), ObdError>
where
    S: ChannelSession + ?Sized,
{
    session
        .send(&command::set_header(&profile.broadcast_header))
        .await
        .map(|_| ())
}

/// Read an ASCII identifier (VIN, serial number) from one controller
pub(crate) async fn read_ascii<S>(
    session: &mut S,
    profile: &VehicleProfile,
    header: &str,
    did: u16,
) -> Result<Option<String>, ObdError>
where
    S: ChannelSession + ?Sized,
{
    let response = read_identifier(session, header, did).await;
    let restored = restore_broadcast(session, profile).await;
    let text = did::read_ascii(&response?, did);
    restored?;
    Ok(text)
}

/// Try each candidate address until one returns a positive reply
///
/// Returns the answering address and the bit value, or `None` when no
/// candidate answered. Only a lost link aborts the search early.
pub(crate) async fn probe_status_bit<S>(
    session: &mut S,
    profile: &VehicleProfile,
    candidates: &[String],
    target: StatusBit,
) -> Result<Option<(String, bool)>, ObdError>
where
    S: ChannelSession + ?Sized,
{
    if let Err(e) = session.send(&command::set_timeout(profile.probe_timeout)).await {
        if e.is_disconnect() {
            return Err(e);
        }
        warn!(error = %e, "Could not shorten response timeout");
    }

    let mut found = None;
    for candidate in candidates {
        metrics::counter!("obd_probe_candidates_total").increment(1);
        match read_identifier(session, candidate, target.did).await {
            Ok(response) => match did::read_bit(&response, target.did, target.byte, target.bit) {
                Some(value) => {
                    found = Some((candidate.clone(), value));
                    break;
                }
                None => debug!(candidate = %candidate, response = ?response, "No usable reply"),
            },
            Err(e) if e.is_disconnect() => return Err(e),
            Err(e) => debug!(candidate = %candidate, error = %e, "Candidate failed"),
        }
    }

    let restored_timeout = session
        .send(&command::set_timeout(profile.default_timeout))
        .await;
    let restored_header = restore_broadcast(session, profile).await;
    for result in [restored_timeout.map(|_| ()), restored_header] {
        match result {
            Err(e) if e.is_disconnect() => return Err(e),
            Err(e) => warn!(error = %e, "Could not restore interpreter defaults"),
            Ok(()) => {}
        }
    }

    match &found {
        Some((address, value)) => info!(address = %address, did = format_args!("{:04X}", target.did), value, "Status bit found"),
        None => info!(did = format_args!("{:04X}", target.did), "No controller answered"),
    }
    Ok(found)
}

/// Read one raw position byte per identifier from the body controller
///
/// Failed identifiers yield `None`; a lost link aborts.
async fn read_positions<S>(
    session: &mut S,
    profile: &VehicleProfile,
    dids: &[u16],
) -> Result<Vec<Option<u8>>, ObdError>
where
    S: ChannelSession + ?Sized,
{
    let mut positions = Vec::with_capacity(dids.len());
    for &did in dids {
        let position = match read_identifier(session, &profile.body_header, did).await {
            Ok(response) => did::read_byte(&response, did, 0),
            Err(e) if e.is_disconnect() => return Err(e),
            Err(e) => {
                debug!(did = format_args!("{:04X}", did), error = %e, "Position read failed");
                None
            }
        };
        positions.push(position);
    }
    if let Err(e) = restore_broadcast(session, profile).await {
        if e.is_disconnect() {
            return Err(e);
        }
        warn!(error = %e, "Could not restore broadcast header");
    }
    Ok(positions)
}

pub(crate) async fn read_windows<S>(
    session: &mut S,
    profile: &VehicleProfile,
) -> Result<WindowsStatus, ObdError>
where
    S: ChannelSession + ?Sized,
{
    let ids = profile.windows;
    let dids = [ids.front_left, ids.front_right, ids.rear_left, ids.rear_right];
    let states: Vec<WindowState> = read_positions(session, profile, &dids)
        .await?
        .into_iter()
        .map(|raw| raw.map(WindowState::from_position).unwrap_or_default())
        .collect();
    Ok(WindowsStatus {
        front_left: states[0],
        front_right: states[1],
        rear_left: states[2],
        rear_right: states[3],
    })
}

pub(crate) async fn read_sunroof<S>(
    session: &mut S,
    profile: &VehicleProfile,
) -> Result<SunroofState, ObdError>
where
    S: ChannelSession + ?Sized,
{
    let positions = read_positions(session, profile, &[profile.sunroof_did]).await?;
    Ok(positions
        .first()
        .copied()
        .flatten()
        .map(SunroofState::from_position)
        .unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::testing::ElmChannel;
    use crate::channel::CommandChannel;
    use ble_link::transport::scripted::ScriptedElm;

    fn candidates(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    const REMOTE_START: StatusBit = StatusBit {
        did: 0x4047,
        byte: 0,
        bit: 0,
    };

    #[tokio::test]
    async fn test_probe_stops_at_first_positive_reply() {
        let channel = ElmChannel::new(
            ScriptedElm::new()
                .with_header_reply("AAA", "224047", "NO DATA")
                .with_header_reply("BBB", "224047", "NO DATA")
                .with_header_reply("CCC", "224047", "62 40 47 01")
                .with_header_reply("DDD", "224047", "62 40 47 00"),
        );
        let profile = VehicleProfile::default();
        let mut session = channel.session().await;

        let found = probe_status_bit(
            &mut *session,
            &profile,
            &candidates(&["AAA", "BBB", "CCC", "DDD"]),
            REMOTE_START,
        )
        .await
        .unwrap();
        drop(session);

        assert_eq!(found, Some(("CCC".to_string(), true)));
        let commands = channel.commands();
        assert!(!commands.contains(&"ATSHDDD".to_string()));
        assert_eq!(
            commands,
            vec![
                "ATST19", "ATSHAAA", "224047", "ATSHBBB", "224047", "ATSHCCC", "224047",
                "ATST32", "ATSH7DF",
            ]
        );
        assert_eq!(channel.elm.header(), "7DF");
    }

    #[tokio::test]
    async fn test_probe_skips_errors_and_negative_replies() {
        let channel = ElmChannel::new(
            ScriptedElm::new()
                .with_header_reply("726", "224047", "CAN ERROR")
                .with_header_reply("740", "224047", "7F 22 31")
                .with_header_reply("7A0", "224047", "STOPPED")
                .with_header_reply("765", "224047", "62 40 47 FE"),
        );
        let profile = VehicleProfile::default();
        let mut session = channel.session().await;

        let found = probe_status_bit(
            &mut *session,
            &profile,
            &profile.remote_start_candidates,
            REMOTE_START,
        )
        .await
        .unwrap();

        assert_eq!(found, Some(("765".to_string(), false)));
    }

    #[tokio::test]
    async fn test_probe_timeouts_advance() {
        let channel = ElmChannel::new(ScriptedElm::new().with_silence("224047"));
        let profile = VehicleProfile::default();
        let mut session = channel.session().await;

        let found = probe_status_bit(&mut *session, &profile, &candidates(&["726"]), REMOTE_START)
            .await
            .unwrap();
        assert_eq!(found, None);
        assert_eq!(channel.elm.header(), "7DF");
    }

    #[tokio::test]
    async fn test_probe_aborts_when_link_lost() {
        let channel = ElmChannel::new(ScriptedElm::new());
        channel.disconnect();
        let profile = VehicleProfile::default();
        let mut session = channel.session().await;

        let result = probe_status_bit(
            &mut *session,
            &profile,
            &profile.remote_start_candidates,
            REMOTE_START,
        )
        .await;
        assert_eq!(result, Err(ObdError::NotConnected));
    }

    #[tokio::test]
    async fn test_ascii_read_restores_header() {
        let channel = ElmChannel::new(ScriptedElm::new().with_header_reply(
            "7E0",
            "22F190",
            "014\r0: 62 F1 90 31 46 54\r1: 46 57 31 45 47 33 4A\r2: 46 41 31 32 33 34 35",
        ));
        let profile = VehicleProfile::default();
        let mut session = channel.session().await;

        let vin = read_ascii(&mut *session, &profile, "7E0", 0xF190).await.unwrap();
        assert_eq!(vin.as_deref(), Some("1FTFW1EG3JFA12345"));
        assert_eq!(channel.elm.header(), "7DF");
    }

    #[tokio::test]
    async fn test_positional_reads() {
        let channel = ElmChannel::new(
            ScriptedElm::new()
                .with_header_reply("726", "224101", "62 41 01 00")
                .with_header_reply("726", "224102", "62 41 02 FF")
                .with_header_reply("726", "224103", "62 41 03 40")
                .with_header_reply("726", "224110", "62 41 10 90"),
        );
        let profile = VehicleProfile::default();
        let mut session = channel.session().await;

        let windows = read_windows(&mut *session, &profile).await.unwrap();
        assert_eq!(windows.front_left, WindowState::Closed);
        assert_eq!(windows.front_right, WindowState::Open);
        assert_eq!(windows.rear_left, WindowState::Partial);
        assert_eq!(windows.rear_right, WindowState::Unknown);

        let sunroof = read_sunroof(&mut *session, &profile).await.unwrap();
        assert_eq!(sunroof, SunroofState::Tilted);
        assert_eq!(channel.elm.header(), "7DF");
    }
}
