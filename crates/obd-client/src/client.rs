//! OBD-II Client for ELM327 Adapters
//!
//! Diagnostic operations on top of a [`CommandChannel`]: trouble codes,
//! identifier reads and body status.

use chrono::Utc;
use obd_protocol::command::{self, mode};
use obd_protocol::dtc::decode_dtc_response;
use obd_protocol::{
    Dtc, ElmResponse, ObdError, ObdProtocol, SunroofState, VehicleStatus, WindowsStatus,
};
use tracing::{debug, info, warn};

use crate::channel::{ChannelSession, CommandChannel};
use crate::probe;
use crate::profile::VehicleProfile;

/// OBD-II client for an initialized ELM327 channel
pub struct ObdClient<C> {
    /// Command channel to the adapter
    channel: C,
    /// Addresses and identifiers for extended reads
    profile: VehicleProfile,
    /// Last protocol selected through this client
    protocol: ObdProtocol,
}

/// Log a best-effort read failure and fall back to `default`
fn best_effort<T>(operation: &str, result: Result<T, ObdError>, default: T) -> T {
    result.unwrap_or_else(|e| {
        warn!(operation, error = %e, "Read failed, using default");
        default
    })
}

impl<C: CommandChannel> ObdClient<C> {
    /// Create a new OBD client
    ///
    /// # Arguments
    /// * `channel` - Initialized command channel, usually an [`ble_link::AdapterEngine`]
    /// * `profile` - Vehicle addresses and identifiers
    pub fn new(channel: C, profile: VehicleProfile) -> Self {
        Self {
            channel,
            profile,
            protocol: ObdProtocol::Auto,
        }
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }

    pub fn profile(&self) -> &VehicleProfile {
        &self.profile
    }

    /// Get current protocol
    pub fn protocol(&self) -> ObdProtocol {
        self.protocol
    }

    /// Send a raw command and return the reply text
    pub async fn send_raw(&self, text: &str) -> Result<String, ObdError> {
        self.channel.send(text).await
    }

    async fn read_codes(&self, request: &str, service: u8) -> Result<Vec<Dtc>, ObdError> {
        let reply = self.channel.send(request).await?;
        let codes = decode_dtc_response(&ElmResponse::classify(&reply), service)?;
        info!(service = format_args!("{:02X}", service), count = codes.len(), "Trouble codes read");
        Ok(codes)
    }

    /// Read stored trouble codes (mode 03)
    pub async fn read_dtcs(&self) -> Result<Vec<Dtc>, ObdError> {
        self.read_codes(command::READ_STORED_DTCS, mode::READ_DTC).await
    }

    /// Read pending trouble codes (mode 07)
    pub async fn read_pending_dtcs(&self) -> Result<Vec<Dtc>, ObdError> {
        self.read_codes(command::READ_PENDING_DTCS, mode::PENDING_DTC).await
    }

    /// Clear trouble codes (mode 04)
    ///
    /// Any reply counts as success; only a missing reply or link fails.
    pub async fn clear_dtcs(&self) -> Result<(), ObdError> {
        let reply = self.channel.send(command::CLEAR_DTCS).await?;
        info!(reply = %reply, "Trouble codes cleared");
        Ok(())
    }

    async fn read_ascii(&self, operation: &str, header: &str, did: u16) -> Option<String> {
        let mut session = self.channel.session().await;
        let result = probe::read_ascii(&mut *session, &self.profile, header, did).await;
        best_effort(operation, result, None)
    }

    /// Vehicle identification number, if the engine controller reports one
    pub async fn read_vin(&self) -> Option<String> {
        self.read_ascii("vin", &self.profile.engine_header, self.profile.vin_did)
            .await
    }

    /// Engine controller serial number
    pub async fn read_ecu_serial_number(&self) -> Option<String> {
        self.read_ascii(
            "ecu_serial_number",
            &self.profile.engine_header,
            self.profile.serial_number_did,
        )
        .await
    }

    /// Transmission controller serial number
    pub async fn read_tcu_serial_number(&self) -> Option<String> {
        self.read_ascii(
            "tcu_serial_number",
            &self.profile.transmission_header,
            self.profile.serial_number_did,
        )
        .await
    }

    /// Remote start enable flag; `false` when no controller answers
    pub async fn read_remote_start_status(&self) -> bool {
        let mut session = self.channel.session().await;
        self.remote_start(&mut *session).await
    }

    async fn remote_start(&self, session: &mut (dyn ChannelSession + '_)) -> bool {
        let result = probe::probe_status_bit(
            session,
            &self.profile,
            &self.profile.remote_start_candidates,
            self.profile.remote_start,
        )
        .await
        .map(|found| found.map(|(_, value)| value).unwrap_or(false));
        best_effort("remote_start", result, false)
    }

    /// Positions of all four windows
    pub async fn read_windows_status(&self) -> WindowsStatus {
        let mut session = self.channel.session().await;
        let result = probe::read_windows(&mut *session, &self.profile).await;
        best_effort("windows", result, WindowsStatus::default())
    }

    /// Sunroof position
    pub async fn read_sunroof_status(&self) -> SunroofState {
        let mut session = self.channel.session().await;
        let result = probe::read_sunroof(&mut *session, &self.profile).await;
        best_effort("sunroof", result, SunroofState::Unknown)
    }

    /// Fresh snapshot of every body reading
    ///
    /// Sub-reads run back to back in one session; each failure leaves its
    /// field at the default.
    pub async fn read_vehicle_status(&self) -> VehicleStatus {
        let mut session = self.channel.session().await;
        let remote_start_enabled = self.remote_start(&mut *session).await;
        let windows = best_effort(
            "windows",
            probe::read_windows(&mut *session, &self.profile).await,
            WindowsStatus::default(),
        );
        let sunroof = best_effort(
            "sunroof",
            probe::read_sunroof(&mut *session, &self.profile).await,
            SunroofState::Unknown,
        );
        VehicleStatus {
            remote_start_enabled,
            windows,
            sunroof,
            captured_at: Utc::now(),
        }
    }

    /// Battery voltage at the diagnostic port
    pub async fn read_battery_voltage(&self) -> Option<f32> {
        let result = self.channel.send(command::READ_VOLTAGE).await;
        best_effort("battery_voltage", result.map(|r| command::parse_voltage(&r)), None)
    }

    /// Protocol the interpreter settled on
    pub async fn read_active_protocol(&self) -> Option<ObdProtocol> {
        let result = self.channel.send(command::DESCRIBE_PROTOCOL_NUMBER).await;
        best_effort(
            "active_protocol",
            result.map(|r| ObdProtocol::from_dpn_reply(&r)),
            None,
        )
    }

    /// Set the OBD protocol
    pub async fn set_protocol(&mut self, protocol: ObdProtocol) -> Result<(), ObdError> {
        info!("Setting OBD protocol to {:?}", protocol);
        let cmd = protocol.to_elm_command();
        let reply = self.channel.send(&cmd).await?;
        if !command::is_ok(&reply) {
            debug!(reply = %reply, "Protocol selection rejected");
            return Err(ObdError::InvalidCommand(cmd));
        }
        self.protocol = protocol;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::testing::ElmChannel;
    use ble_link::transport::scripted::ScriptedElm;
    use obd_protocol::WindowState;
    use std::sync::Arc;

    fn elm_client(elm: ScriptedElm) -> ObdClient<Arc<ElmChannel>> {
        ObdClient::new(ElmChannel::new(elm), VehicleProfile::default())
    }

    #[tokio::test]
    async fn test_read_dtcs() {
        let client = elm_client(ScriptedElm::new().with_reply("03", "43 01 33 00 00 00 00"));
        let codes = client.read_dtcs().await.unwrap();
        assert_eq!(codes, vec!["P0133".parse::<Dtc>().unwrap()]);
    }

    #[tokio::test]
    async fn test_read_dtcs_no_data() {
        let client = elm_client(ScriptedElm::new());
        assert!(client.read_dtcs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_read_dtcs_error_token() {
        let client = elm_client(ScriptedElm::new().with_reply("03", "CAN ERROR"));
        assert!(matches!(
            client.read_dtcs().await,
            Err(ObdError::InvalidCommand(_))
        ));
    }

    #[tokio::test]
    async fn test_read_dtcs_bus_init_error() {
        let client = elm_client(ScriptedElm::new().with_reply("03", "BUS INIT: ...ERROR"));
        assert!(matches!(
            client.read_dtcs().await,
            Err(ObdError::InvalidCommand(_))
        ));
    }

    #[tokio::test]
    async fn test_read_pending_dtcs() {
        let client = elm_client(ScriptedElm::new().with_reply("07", "47 01 01 71"));
        let codes = client.read_pending_dtcs().await.unwrap();
        assert_eq!(codes.len(), 1);
        assert_eq!(codes[0].to_string(), "P0171");
    }

    #[tokio::test]
    async fn test_clear_accepts_any_reply() {
        let client = elm_client(ScriptedElm::new().with_reply("04", "44"));
        assert!(client.clear_dtcs().await.is_ok());

        let client = elm_client(ScriptedElm::new().with_silence("04"));
        assert_eq!(client.clear_dtcs().await, Err(ObdError::Timeout(5_000)));
    }

    #[tokio::test]
    async fn test_serial_numbers_use_their_controllers() {
        let client = elm_client(
            ScriptedElm::new()
                .with_header_reply("7E0", "22F18C", "62 F1 8C 45 43 55 31 32 33")
                .with_header_reply("7E1", "22F18C", "62 F1 8C 54 43 55 39 38 37"),
        );
        assert_eq!(client.read_ecu_serial_number().await.as_deref(), Some("ECU123"));
        assert_eq!(client.read_tcu_serial_number().await.as_deref(), Some("TCU987"));
        assert_eq!(client.read_vin().await, None);
    }

    #[tokio::test]
    async fn test_best_effort_reads_when_disconnected() {
        let channel = ElmChannel::new(ScriptedElm::new());
        channel.disconnect();
        let client = ObdClient::new(channel, VehicleProfile::default());

        assert_eq!(client.read_vin().await, None);
        assert!(!client.read_remote_start_status().await);
        assert!(client.read_windows_status().await.is_unknown());
        assert_eq!(client.read_battery_voltage().await, None);
        assert_eq!(client.read_dtcs().await, Err(ObdError::NotConnected));
    }

    #[tokio::test]
    async fn test_vehicle_status_tolerates_partial_failures() {
        let client = elm_client(
            ScriptedElm::new()
                .with_header_reply("740", "224047", "62 40 47 01")
                .with_header_reply("726", "224101", "62 41 01 FF")
                .with_silence("224102")
                .with_header_reply("726", "224110", "62 41 10 02"),
        );
        let before = Utc::now();
        let status = client.read_vehicle_status().await;

        assert!(status.remote_start_enabled);
        assert_eq!(status.windows.front_left, WindowState::Open);
        assert_eq!(status.windows.front_right, WindowState::Unknown);
        assert_eq!(status.windows.rear_right, WindowState::Unknown);
        assert_eq!(status.sunroof, SunroofState::Closed);
        assert!(status.captured_at >= before);
        assert_eq!(client.channel().elm.header(), "7DF");
    }

    #[tokio::test]
    async fn test_voltage_and_protocol() {
        let mut client = elm_client(ScriptedElm::new().with_voltage("13.8V"));
        assert_eq!(client.read_battery_voltage().await, Some(13.8));
        assert_eq!(client.read_active_protocol().await, Some(ObdProtocol::Iso15765_4Can11bit500));

        client.set_protocol(ObdProtocol::Iso15765_4Can11bit500).await.unwrap();
        assert_eq!(client.protocol(), ObdProtocol::Iso15765_4Can11bit500);
        assert_eq!(client.read_active_protocol().await, Some(ObdProtocol::Iso15765_4Can11bit500));
    }
}
