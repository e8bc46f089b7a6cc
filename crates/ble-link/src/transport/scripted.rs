//! ELM327 interpreter emulator
//!
//! Answers AT commands the way a v1.5 clone does and looks data requests
//! up in reply tables keyed by command and, optionally, by the header
//! selected with `ATSH`. Pair with [`super::mock::MockTransport`] via
//! [`ScriptedElm::responder`].

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;

use super::mock::Responder;

const DEFAULT_HEADER: &str = "7DF";
const DEFAULT_IDENTITY: &str = "ELM327 v1.5";
const DEFAULT_TIMEOUT: u8 = 0x32;

#[derive(Debug)]
struct ElmState {
    header: String,
    echo: bool,
    timeout: u8,
    protocol: char,
    voltage: String,
    identity: String,
    replies: HashMap<String, String>,
    header_replies: HashMap<(String, String), String>,
    silent: HashSet<String>,
    received: Vec<(String, String)>,
}

/// Stateful ELM327 emulator
#[derive(Debug)]
pub struct ScriptedElm {
    state: Mutex<ElmState>,
}

impl Default for ScriptedElm {
    fn default() -> Self {
        Self::new()
    }
}

fn normalize(command: &str) -> String {
    command
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_ascii_uppercase()
}

impl ScriptedElm {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ElmState {
                header: DEFAULT_HEADER.to_string(),
                echo: true,
                timeout: DEFAULT_TIMEOUT,
                protocol: '0',
                voltage: "12.6V".to_string(),
                identity: DEFAULT_IDENTITY.to_string(),
                replies: HashMap::new(),
                header_replies: HashMap::new(),
                silent: HashSet::new(),
                received: Vec::new(),
            }),
        }
    }

    /// Reply for `command` regardless of header
    pub fn with_reply(self, command: &str, reply: &str) -> Self {
        self.state
            .lock()
            .replies
            .insert(normalize(command), reply.to_string());
        self
    }

    /// Reply for `command` only while `header` is selected
    pub fn with_header_reply(self, header: &str, command: &str, reply: &str) -> Self {
        self.state
            .lock()
            .header_replies
            .insert((normalize(header), normalize(command)), reply.to_string());
        self
    }

    /// Never answer `command`
    pub fn with_silence(self, command: &str) -> Self {
        self.state.lock().silent.insert(normalize(command));
        self
    }

    pub fn with_voltage(self, voltage: &str) -> Self {
        self.state.lock().voltage = voltage.to_string();
        self
    }

    pub fn with_identity(self, identity: &str) -> Self {
        self.state.lock().identity = identity.to_string();
        self
    }

    /// Replace or add a reply while running
    pub fn set_reply(&self, command: &str, reply: &str) {
        self.state
            .lock()
            .replies
            .insert(normalize(command), reply.to_string());
    }

    /// Currently selected header
    pub fn header(&self) -> String {
        self.state.lock().header.clone()
    }

    pub fn echo_enabled(&self) -> bool {
        self.state.lock().echo
    }

    /// Response timeout set with `ATST`, in 4 ms units
    pub fn response_timeout(&self) -> u8 {
        self.state.lock().timeout
    }

    /// Every command received, paired with the header active at the time
    pub fn received(&self) -> Vec<(String, String)> {
        self.state.lock().received.clone()
    }

    /// Full reply text including the prompt, or `None` when silent
    pub fn respond(&self, command: &str) -> Option<String> {
        let command = normalize(command);
        let mut state = self.state.lock();
        let header = state.header.clone();
        state.received.push((header.clone(), command.clone()));
        if state.silent.contains(&command) {
            return None;
        }

        let echo = if state.echo {
            format!("{}\r", command)
        } else {
            String::new()
        };
        let body = match command.strip_prefix("AT") {
            Some(at) => answer_at(&mut state, at),
            None => state
                .header_replies
                .get(&(header, command.clone()))
                .or_else(|| state.replies.get(&command))
                .cloned()
                .unwrap_or_else(|| "NO DATA".to_string()),
        };
        Some(format!("{}{}\r\r>", echo, body))
    }

    /// Responder closure for [`super::mock::MockTransport`]
    pub fn responder(self: &Arc<Self>) -> Responder {
        let elm = Arc::clone(self);
        Arc::new(move |command: &str| elm.respond(command).map(|reply| vec![reply]))
    }
}

fn answer_at(state: &mut ElmState, at: &str) -> String {
    if at == "Z" {
        state.header = DEFAULT_HEADER.to_string();
        state.echo = true;
        state.timeout = DEFAULT_TIMEOUT;
        state.protocol = '0';
        return format!("\r{}", state.identity);
    }
    if at == "I" {
        return state.identity.clone();
    }
    if at == "RV" {
        return state.voltage.clone();
    }
    if at == "DPN" {
        return match state.protocol {
            '0' => "A6".to_string(),
            code => code.to_string(),
        };
    }
    if let Some(flag) = at.strip_prefix('E') {
        match flag {
            "0" => state.echo = false,
            "1" => state.echo = true,
            _ => return "?".to_string(),
        }
        return "OK".to_string();
    }
    if let Some(header) = at.strip_prefix("SH") {
        if header.is_empty() || !header.chars().all(|c| c.is_ascii_hexdigit()) {
            return "?".to_string();
        }
        state.header = header.to_string();
        return "OK".to_string();
    }
    if let Some(units) = at.strip_prefix("ST") {
        return match u8::from_str_radix(units, 16) {
            Ok(units) => {
                state.timeout = units;
                "OK".to_string()
            }
            Err(_) => "?".to_string(),
        };
    }
    if let Some(code) = at.strip_prefix("SP") {
        let code = code.strip_prefix('A').unwrap_or(code);
        let mut chars = code.chars();
        return match (chars.next(), chars.next()) {
            (Some(c), None) if c.is_ascii_hexdigit() => {
                state.protocol = c.to_ascii_uppercase();
                "OK".to_string()
            }
            _ => "?".to_string(),
        };
    }
    "OK".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_echo_until_disabled() {
        let elm = ScriptedElm::new();
        assert_eq!(elm.respond("ATZ").unwrap(), "ATZ\r\rELM327 v1.5\r\r>");
        assert_eq!(elm.respond("ATE0").unwrap(), "ATE0\rOK\r\r>");
        assert_eq!(elm.respond("ATSP0").unwrap(), "OK\r\r>");
        assert!(!elm.echo_enabled());
    }

    #[test]
    fn test_header_scoped_replies() {
        let elm = ScriptedElm::new().with_header_reply("726", "224047", "62 40 47 01");
        elm.respond("ATE0");

        assert_eq!(elm.respond("224047").unwrap(), "NO DATA\r\r>");
        elm.respond("ATSH726");
        assert_eq!(elm.header(), "726");
        assert_eq!(elm.respond("22 40 47").unwrap(), "62 40 47 01\r\r>");
    }

    #[test]
    fn test_reset_restores_defaults() {
        let elm = ScriptedElm::new();
        elm.respond("ATE0");
        elm.respond("ATSH7E0");
        elm.respond("ATST19");
        assert_eq!(elm.response_timeout(), 0x19);

        elm.respond("ATZ");
        assert_eq!(elm.header(), "7DF");
        assert_eq!(elm.response_timeout(), 0x32);
        assert!(elm.echo_enabled());
    }

    #[test]
    fn test_silence_and_bad_commands() {
        let elm = ScriptedElm::new().with_silence("0100");
        elm.respond("ATE0");
        assert_eq!(elm.respond("0100"), None);
        assert_eq!(elm.respond("ATSHXYZ").unwrap(), "?\r\r>");
        assert_eq!(elm.respond("ATDPN").unwrap(), "A6\r\r>");
    }
}
